//! HTTP control surface
//!
//! [`ControlApi`] holds the handler logic as plain async methods over the broker
//! registry and the pool. [`ControlApi::routes`] wraps them in a warp filter
//! tree that maps [`PoolError::NotFound`] to 404 and every other failure to 500.

use crate::api_span;
use crate::broker::{Broker, BrokerId, BrokerRegistry, BrokerUpdate, Credentials};
use crate::error::{PoolError, PoolResult};
use crate::pool::{ConnectResult, ConnectionPool, ConnectionState};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const DEFAULT_BROKER_HOST: &str = "localhost";
const DEFAULT_BROKER_PORT: u16 = 1884;

/// Body of `POST /brokers`
#[derive(Debug, Clone, Deserialize)]
pub struct AddBrokerRequest {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub login: String,
    pub password: String,
}

/// Body of the topic endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct TopicRequest {
    pub topic: String,
}

/// Reply to broker creation and update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerReply {
    pub id: BrokerId,
    /// `None` when the broker already had a pooled connection
    pub connect_result: Option<ConnectResult>,
}

/// Reply to `GET /brokers/{id}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStatus {
    pub id: BrokerId,
    pub address: String,
    /// Whether the pool holds a connection for this broker
    pub pooled: bool,
    pub started: bool,
    pub connected: bool,
    pub state: Option<&'static str>,
    pub attempt: Option<u32>,
    pub reason: Option<String>,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub brokers: usize,
    pub connections: usize,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub timestamp: i64,
}

/// Control operations over the broker registry and connection pool
pub struct ControlApi {
    registry: Arc<BrokerRegistry>,
    pool: Arc<ConnectionPool>,
}

impl ControlApi {
    pub fn new(registry: Arc<BrokerRegistry>, pool: Arc<ConnectionPool>) -> Self {
        Self { registry, pool }
    }

    /// Register a broker under a fresh id and connect it
    pub async fn add_broker(&self, request: AddBrokerRequest) -> PoolResult<BrokerReply> {
        let broker = Broker::new(
            request.host.unwrap_or_else(|| DEFAULT_BROKER_HOST.to_string()),
            request.port.unwrap_or(DEFAULT_BROKER_PORT),
            Credentials::new(request.login, request.password),
        );
        let id = broker.id;

        self.registry.add(broker.clone()).await;
        info!(broker_id = %id, address = %broker.address(), "Broker registered");

        let connect_result = self.pool.connect(&broker).await?;
        Ok(BrokerReply { id, connect_result })
    }

    /// Update a broker record, then reconnect it so the change takes effect
    ///
    /// The reconnect builds a fresh connection; earlier subscriptions are dropped.
    pub async fn update_broker(
        &self,
        id: BrokerId,
        update: BrokerUpdate,
    ) -> PoolResult<BrokerReply> {
        let broker = self
            .registry
            .update(&id, &update)
            .await
            .ok_or(PoolError::NotFound(id))?;
        info!(broker_id = %id, address = %broker.address(), "Broker updated");

        self.pool.disconnect(&id).await?;
        let connect_result = self.pool.connect(&broker).await?;
        Ok(BrokerReply { id, connect_result })
    }

    /// Subscribe a registered broker to `topic`
    ///
    /// A broker evicted after its last unsubscribe is pooled and connected
    /// again first; `connect` leaves an already pooled connection alone.
    pub async fn subscribe_topic(&self, id: BrokerId, topic: String) -> PoolResult<()> {
        let broker = self.require_broker(&id).await?;
        if let Some(result) = self.pool.connect(&broker).await? {
            debug!(broker_id = %id, ?result, "Evicted broker reconnected for subscribe");
        }
        self.pool.add_listeners(&id, &[topic]).await
    }

    pub async fn unsubscribe_topic(&self, id: BrokerId, topic: String) -> PoolResult<()> {
        self.require_broker(&id).await?;
        self.pool.remove_listeners(&id, &[topic]).await
    }

    pub async fn broker_status(&self, id: BrokerId) -> PoolResult<BrokerStatus> {
        let broker = self.require_broker(&id).await?;
        let snapshot = self.pool.status(&id).await;

        let mut status = BrokerStatus {
            id,
            address: broker.address(),
            pooled: snapshot.is_some(),
            started: false,
            connected: false,
            state: None,
            attempt: None,
            reason: None,
            topics: Vec::new(),
        };

        if let Some(snapshot) = snapshot {
            status.started = snapshot.connection_requested;
            status.connected = snapshot.transport_connected;
            status.state = Some(snapshot.state.label());
            match snapshot.state {
                ConnectionState::AwaitingRetry { attempt, .. } => status.attempt = Some(attempt),
                ConnectionState::GivenUp { reason } => status.reason = Some(reason),
                _ => {}
            }
            status.topics = snapshot.subscribed_topics.into_iter().collect();
        }

        Ok(status)
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok",
            brokers: self.registry.len().await,
            connections: self.pool.len().await,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    async fn require_broker(&self, id: &BrokerId) -> PoolResult<Broker> {
        self.registry
            .get(id)
            .await
            .ok_or(PoolError::NotFound(*id))
    }

    /// warp filter tree for every control endpoint
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone {
        // POST /brokers
        let add_broker = warp::path!("brokers")
            .and(warp::post())
            .and(with_api(self.clone()))
            .and(warp::body::json())
            .and_then(|api: Arc<ControlApi>, request: AddBrokerRequest| async move {
                let result = api
                    .add_broker(request)
                    .instrument(api_span!(operation = "add_broker"))
                    .await;
                Ok::<_, Infallible>(into_reply(result, StatusCode::CREATED))
            });

        // PUT /brokers/{id}
        let update_broker = warp::path!("brokers" / BrokerId)
            .and(warp::put())
            .and(with_api(self.clone()))
            .and(warp::body::json())
            .and_then(
                |id: BrokerId, api: Arc<ControlApi>, update: BrokerUpdate| async move {
                    let result = api
                        .update_broker(id, update)
                        .instrument(api_span!(operation = "update_broker", broker_id = %id))
                        .await;
                    Ok::<_, Infallible>(into_reply(result, StatusCode::OK))
                },
            );

        // GET /brokers/{id}
        let broker_status = warp::path!("brokers" / BrokerId)
            .and(warp::get())
            .and(with_api(self.clone()))
            .and_then(|id: BrokerId, api: Arc<ControlApi>| async move {
                let result = api.broker_status(id).await;
                Ok::<_, Infallible>(into_reply(result, StatusCode::OK))
            });

        // POST /brokers/{id}/topics
        let subscribe = warp::path!("brokers" / BrokerId / "topics")
            .and(warp::post())
            .and(with_api(self.clone()))
            .and(warp::body::json())
            .and_then(
                |id: BrokerId, api: Arc<ControlApi>, request: TopicRequest| async move {
                    let result = api
                        .subscribe_topic(id, request.topic)
                        .instrument(api_span!(operation = "subscribe_topic", broker_id = %id))
                        .await;
                    Ok::<_, Infallible>(into_empty_reply(result))
                },
            );

        // DELETE /brokers/{id}/topics
        let unsubscribe = warp::path!("brokers" / BrokerId / "topics")
            .and(warp::delete())
            .and(with_api(self.clone()))
            .and(warp::body::json())
            .and_then(
                |id: BrokerId, api: Arc<ControlApi>, request: TopicRequest| async move {
                    let result = api
                        .unsubscribe_topic(id, request.topic)
                        .instrument(api_span!(operation = "unsubscribe_topic", broker_id = %id))
                        .await;
                    Ok::<_, Infallible>(into_empty_reply(result))
                },
            );

        // GET /health
        let health = warp::path!("health")
            .and(warp::get())
            .and(with_api(self))
            .and_then(|api: Arc<ControlApi>| async move {
                let response = api.health().await;
                Ok::<_, Infallible>(warp::reply::json(&response).into_response())
            });

        add_broker
            .or(update_broker)
            .unify()
            .or(broker_status)
            .unify()
            .or(subscribe)
            .unify()
            .or(unsubscribe)
            .unify()
            .or(health)
            .unify()
    }

    /// Serve the control API until `shutdown` resolves
    pub async fn serve<F>(self: Arc<Self>, addr: SocketAddr, shutdown: F) -> Result<(), warp::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (bound, server) =
            warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, shutdown)?;
        info!(address = %bound, "Control API listening");
        server.await;
        info!("Control API stopped");
        Ok(())
    }
}

fn with_api(
    api: Arc<ControlApi>,
) -> impl Filter<Extract = (Arc<ControlApi>,), Error = Infallible> + Clone {
    warp::any().map(move || api.clone())
}

fn error_status(error: &PoolError) -> StatusCode {
    if error.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_reply(error: PoolError) -> warp::reply::Response {
    let status = error_status(&error);
    if status == StatusCode::NOT_FOUND {
        warn!("{}", error);
    } else {
        tracing::error!("{}", error);
    }

    let body = ErrorResponse {
        error: error.to_string(),
        timestamp: chrono::Utc::now().timestamp(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn into_reply<T: Serialize>(result: PoolResult<T>, success: StatusCode) -> warp::reply::Response {
    match result {
        Ok(body) => warp::reply::with_status(warp::reply::json(&body), success).into_response(),
        Err(e) => error_reply(e),
    }
}

fn into_empty_reply(result: PoolResult<()>) -> warp::reply::Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_reply(e),
    }
}
