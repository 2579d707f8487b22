//! Per-broker connection lifecycle
//!
//! A [`Connection`] is a cheap handle onto a spawned actor task that exclusively
//! owns one transport. Every request (connect, disconnect, subscription changes)
//! and every transport event is funnelled into that task, so operations on one
//! connection are applied strictly in order while connections for different
//! brokers run independently.
//!
//! The actor also owns the reconnection timer. An unsolicited disconnect arms
//! it according to the [`BackoffPolicy`]; an explicit disconnect disarms it in
//! the same step that records the request, so no retry can slip past a
//! disconnect.
//!
//! After any successful connect the actor re-subscribes every topic it still
//! tracks, since the transport opens a clean session on each attempt.

use super::backoff::{BackoffPolicy, ReconnectionDecision};
use super::state::{ConnectResult, ConnectionSnapshot, ConnectionState};
use crate::broker::BrokerId;
use crate::connection_span;
use crate::dispatcher::MessageDispatcher;
use crate::transport::mqtt::MessageHandler;
use crate::transport::{
    ConnectFailure, ConnectOptions, FailureKind, Transport, TransportError, TransportEvent,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

const COMMAND_CAPACITY: usize = 32;

/// Connection handle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection task for broker {0} is no longer running")]
    Closed(BrokerId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum Command {
    Connect {
        reply: oneshot::Sender<ConnectResult>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    AddSubscriptions {
        topics: Vec<String>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    RemoveSubscriptions {
        topics: Vec<String>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Handle onto one broker's connection actor
#[derive(Debug, Clone)]
pub struct Connection {
    broker_id: BrokerId,
    address: String,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
}

impl Connection {
    /// Spawn the actor owning `transport` and return a handle to it
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        options: ConnectOptions,
        mut transport: Box<dyn Transport>,
        dispatcher: Arc<dyn MessageDispatcher>,
        policy: BackoffPolicy,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());

        transport.attach(event_tx);

        let broker_id = options.broker_id;
        let address = options.address();
        let span = connection_span!(broker_id = %broker_id, address = %address);

        let actor = ConnectionActor {
            options,
            transport,
            dispatcher,
            policy,
            connection_requested: false,
            disconnection_requested: false,
            subscribed_topics: BTreeSet::new(),
            state: ConnectionState::Idle,
            reconnect: ReconnectState::default(),
            snapshot_tx,
        };
        tokio::spawn(actor.run(command_rx, event_rx).instrument(span));

        Self {
            broker_id,
            address,
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }

    pub fn broker_id(&self) -> BrokerId {
        self.broker_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect unless already connected; see [`ConnectResult`] for outcomes
    pub async fn connect(&self) -> Result<ConnectResult, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Connect { reply }, rx).await
    }

    /// Disconnect and disarm any pending retry; no-op unless started
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Disconnect { reply }, rx).await
    }

    /// Subscribe to every topic not already tracked
    pub async fn add_subscriptions(&self, topics: &[String]) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::AddSubscriptions {
            topics: topics.to_vec(),
            reply,
        };
        Ok(self.request(command, rx).await??)
    }

    /// Unsubscribe from every tracked topic in `topics`
    pub async fn remove_subscriptions(&self, topics: &[String]) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::RemoveSubscriptions {
            topics: topics.to_vec(),
            reply,
        };
        Ok(self.request(command, rx).await??)
    }

    pub fn has_subscriber(&self, topic: &str) -> bool {
        self.snapshot.borrow().subscribed_topics.contains(topic)
    }

    pub fn has_subscriptions(&self) -> bool {
        !self.snapshot.borrow().subscribed_topics.is_empty()
    }

    /// True once a connect was requested and not yet matched by a disconnect
    pub fn is_started(&self) -> bool {
        self.snapshot.borrow().connection_requested
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state.clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Whether both handles drive the same actor
    pub fn same_connection(&self, other: &Connection) -> bool {
        self.commands.same_channel(&other.commands)
    }

    /// Subscribe to snapshot updates
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ConnectionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::Closed(self.broker_id))?;
        rx.await.map_err(|_| ConnectionError::Closed(self.broker_id))
    }
}

/// Retry bookkeeping since the last successful connect
#[derive(Debug, Default)]
struct ReconnectState {
    attempt: u32,
    first_failure_at: Option<Instant>,
}

struct ConnectionActor {
    options: ConnectOptions,
    transport: Box<dyn Transport>,
    dispatcher: Arc<dyn MessageDispatcher>,
    policy: BackoffPolicy,
    connection_requested: bool,
    disconnection_requested: bool,
    subscribed_topics: BTreeSet<String>,
    state: ConnectionState,
    reconnect: ReconnectState,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut events_open = true;

        loop {
            let retry_at = self.retry_deadline();

            // Commands first: a queued disconnect beats an expiring timer
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => events_open = false,
                },

                _ = sleep_until_deadline(retry_at) => self.fire_retry().await,
            }

            self.publish();
        }

        if self.transport.is_connected() {
            if let Err(e) = self.transport.disconnect().await {
                warn!("Disconnect on shutdown failed: {}", e);
            }
        }
        debug!("Connection task stopped");
    }

    fn retry_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::AwaitingRetry {
                next_attempt_at, ..
            } => Some(next_attempt_at),
            _ => None,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(ConnectionSnapshot {
            connection_requested: self.connection_requested,
            disconnection_requested: self.disconnection_requested,
            transport_connected: self.transport.is_connected(),
            state: self.state.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
        });
    }

    /// Replies go out after the snapshot is published so callers read their own writes
    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = self.connect().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                self.publish();
                let _ = reply.send(());
            }
            Command::AddSubscriptions { topics, reply } => {
                let result = self.add_subscriptions(topics).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::RemoveSubscriptions { topics, reply } => {
                let result = self.remove_subscriptions(topics).await;
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    async fn connect(&mut self) -> ConnectResult {
        self.connection_requested = true;

        if self.transport.is_connected() {
            debug!("Already connected");
            return ConnectResult::Connected;
        }

        self.disconnection_requested = false;
        // An explicit request starts a fresh recovery sequence
        self.reconnect = ReconnectState::default();
        self.state = ConnectionState::Connecting;
        self.publish();

        match self.transport.connect(&self.options).await {
            Ok(()) => {
                info!("Connected to MQTT broker");
                self.on_connected().await;
                ConnectResult::Connected
            }
            Err(failure) => {
                let result = ConnectResult::from(&failure);
                self.on_connect_failed(failure);
                result
            }
        }
    }

    async fn disconnect(&mut self) {
        if !self.connection_requested || self.disconnection_requested {
            debug!("Disconnect ignored, connection not started");
            return;
        }

        self.disconnection_requested = true;
        self.connection_requested = false;
        // Disarms the retry timer
        self.state = ConnectionState::Idle;
        self.reconnect = ReconnectState::default();

        match self.transport.disconnect().await {
            Ok(()) => info!("Disconnected from MQTT broker"),
            Err(e) => error!("Disconnect from MQTT broker failed: {}", e),
        }
    }

    async fn add_subscriptions(&mut self, topics: Vec<String>) -> Result<(), TransportError> {
        for topic in topics {
            if self.subscribed_topics.contains(&topic) {
                continue;
            }

            if let Err(e) = self.transport.subscribe(&topic).await {
                error!(topic = %topic, "Subscribe failed: {}", e);
                return Err(e);
            }
            info!(topic = %topic, "Subscribed");
            self.subscribed_topics.insert(topic);
        }
        Ok(())
    }

    async fn remove_subscriptions(&mut self, topics: Vec<String>) -> Result<(), TransportError> {
        for topic in topics {
            if !self.subscribed_topics.contains(&topic) {
                continue;
            }

            if let Err(e) = self.transport.unsubscribe(&topic).await {
                error!(topic = %topic, "Unsubscribe failed: {}", e);
                return Err(e);
            }
            info!(topic = %topic, "Unsubscribed");
            self.subscribed_topics.remove(&topic);
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.connection_requested
                    && !self.disconnection_requested
                    && self.transport.is_connected()
                {
                    self.reconnect = ReconnectState::default();
                    self.state = ConnectionState::Stable;
                }
            }
            TransportEvent::Disconnected { requested, reason } => {
                self.on_disconnected(requested, reason);
            }
            TransportEvent::ConnectingFailed(failure) => {
                if failure.kind == FailureKind::InvalidCredentials {
                    if self.connection_requested
                        && !self.disconnection_requested
                        && !self.transport.is_connected()
                    {
                        self.give_up(format!("Invalid credentials: {}", failure.message));
                    }
                } else {
                    self.on_disconnected(false, failure.message);
                }
            }
            TransportEvent::MessageReceived { topic, payload } => {
                let text = MessageHandler::decode_payload(&payload);
                debug!(topic = %topic, bytes = payload.len(), "Message received");
                if let Err(e) = self.dispatcher.dispatch(&topic, &text).await {
                    warn!("{}", e);
                }
            }
        }
    }

    fn on_disconnected(&mut self, requested: bool, reason: String) {
        if requested || self.disconnection_requested || !self.connection_requested {
            debug!(reason = %reason, "Disconnected on request");
            return;
        }

        // Queued before a connect that has since succeeded
        if self.transport.is_connected() {
            debug!(reason = %reason, "Stale disconnect event ignored");
            return;
        }

        match self.state {
            // Already recovering or waiting for an explicit connect
            ConnectionState::AwaitingRetry { .. }
            | ConnectionState::GivenUp { .. }
            | ConnectionState::Connecting => {
                debug!(reason = %reason, "Disconnect event ignored while {}", self.state.label());
            }
            ConnectionState::Stable | ConnectionState::Idle => {
                error!(reason = %reason, "Disconnected from MQTT broker");
                self.schedule_retry();
            }
        }
    }

    async fn fire_retry(&mut self) {
        if !self.state.is_awaiting_retry() {
            return;
        }

        self.reconnect.attempt += 1;
        let attempt = self.reconnect.attempt;
        info!(attempt, "Attempting reconnection");

        self.state = ConnectionState::Connecting;
        self.publish();

        match self.transport.connect(&self.options).await {
            Ok(()) => {
                info!(attempt, "Reconnection successful");
                self.on_connected().await;
            }
            Err(failure) => {
                warn!(attempt, "Reconnection no. {} failed", attempt);
                self.on_connect_failed(failure);
            }
        }
    }

    async fn on_connected(&mut self) {
        self.reconnect = ReconnectState::default();
        self.state = ConnectionState::Stable;
        self.resubscribe().await;
    }

    fn on_connect_failed(&mut self, failure: ConnectFailure) {
        error!(
            kind = ?failure.kind,
            "Connection to MQTT broker failed. Reason {}",
            failure.message
        );

        match ConnectResult::from(&failure) {
            ConnectResult::InvalidCredentials => {
                self.give_up(format!("Invalid credentials: {}", failure.message));
            }
            _ => self.schedule_retry(),
        }
    }

    /// Arm the retry timer, or give up once the recovery window is spent
    fn schedule_retry(&mut self) {
        let now = Instant::now();
        let first_failure_at = *self.reconnect.first_failure_at.get_or_insert(now);

        match self
            .policy
            .decide(self.reconnect.attempt, now.duration_since(first_failure_at))
        {
            ReconnectionDecision::Proceed { attempt, delay } => {
                warn!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Scheduling reconnection"
                );
                self.state = ConnectionState::AwaitingRetry {
                    attempt,
                    first_failure_at,
                    next_attempt_at: now + delay,
                };
            }
            ReconnectionDecision::GiveUp { elapsed } => {
                self.give_up(format!(
                    "No successful reconnect within {}s",
                    elapsed.as_secs()
                ));
            }
        }
    }

    fn give_up(&mut self, reason: String) {
        error!(reason = %reason, "Giving up on reconnection");
        self.state = ConnectionState::GivenUp { reason };
    }

    async fn resubscribe(&mut self) {
        for topic in &self.subscribed_topics {
            match self.transport.subscribe(topic).await {
                Ok(()) => debug!(topic = %topic, "Re-subscribed"),
                Err(e) => error!(topic = %topic, "Failed to re-subscribe: {}", e),
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
