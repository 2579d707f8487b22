//! Impure I/O for the rumqttc-backed transport
//!
//! Each connect attempt builds a fresh `AsyncClient`/`EventLoop` pair and spawns
//! a task that polls the event loop. The task stops on the first error or
//! broker disconnect; it never reconnects on its own, recovery belongs to the
//! connection that owns this transport.
//!
//! Subscribe and unsubscribe wait for the broker's SubAck/UnsubAck. The owning
//! connection issues one operation at a time, so a single pending slot is
//! enough; it is bound to the packet id rumqttc assigns when the packet leaves.

use super::message_handler::{EventRoute, MessageHandler};
use super::options::configure_mqtt_options;
use crate::broker::Broker;
use crate::transport::{
    ConnectFailure, ConnectOptions, Transport, TransportError, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Request channel capacity handed to rumqttc
const REQUEST_CAPACITY: usize = 10;

/// How long `disconnect` waits for the event loop to drain
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Ack wait used before the first connect supplies its timeout
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

/// Operation waiting for its SubAck or UnsubAck
#[derive(Debug)]
struct PendingAck {
    kind: AckKind,
    packet_id: Option<u16>,
    reply: oneshot::Sender<Result<(), String>>,
}

#[derive(Debug, Clone, Default)]
struct AckSlot(Arc<Mutex<Option<PendingAck>>>);

impl AckSlot {
    fn lock(&self) -> MutexGuard<'_, Option<PendingAck>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the next operation; a leftover pending ack is dropped
    fn expect(&self, kind: AckKind) -> oneshot::Receiver<Result<(), String>> {
        let (reply, rx) = oneshot::channel();
        *self.lock() = Some(PendingAck {
            kind,
            packet_id: None,
            reply,
        });
        rx
    }

    /// Tie the pending operation to the packet id rumqttc sent it with
    fn bind(&self, kind: AckKind, packet_id: u16) {
        if let Some(pending) = self.lock().as_mut() {
            if pending.kind == kind && pending.packet_id.is_none() {
                pending.packet_id = Some(packet_id);
            }
        }
    }

    /// Deliver an ack outcome; returns false when nothing was waiting for it
    fn resolve(&self, kind: AckKind, packet_id: u16, outcome: Result<(), String>) -> bool {
        let mut slot = self.lock();
        let waiting = slot
            .as_ref()
            .is_some_and(|pending| pending.kind == kind && pending.packet_id == Some(packet_id));
        if !waiting {
            return false;
        }
        if let Some(pending) = slot.take() {
            let _ = pending.reply.send(outcome);
        }
        true
    }

    /// Drop the pending operation; its waiter sees the link as lost
    fn clear(&self) {
        self.lock().take();
    }
}

/// MQTT v5 transport for a single broker
pub struct MqttTransport {
    client: Option<AsyncClient>,
    event_loop_handle: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    disconnect_requested: Arc<AtomicBool>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    acks: AckSlot,
    ack_timeout: Duration,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self {
            client: None,
            event_loop_handle: None,
            connected: Arc::new(AtomicBool::new(false)),
            disconnect_requested: Arc::new(AtomicBool::new(false)),
            events: None,
            acks: AckSlot::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Drop the previous client and stop its event loop task
    fn teardown(&mut self) {
        self.client = None;
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
        self.acks.clear();
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Client for an operation that needs a live link
    fn live_client(&self) -> Result<&AsyncClient, TransportError> {
        match &self.client {
            Some(client) if self.connected.load(Ordering::SeqCst) => Ok(client),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Wait for the broker to acknowledge the pending operation
    async fn wait_for_ack(
        acks: &AckSlot,
        ack_rx: oneshot::Receiver<Result<(), String>>,
        timeout: Duration,
    ) -> Result<(), String> {
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err("Connection lost before acknowledgement".to_string()),
            Err(_) => {
                acks.clear();
                Err(format!("No acknowledgement within {}s", timeout.as_secs()))
            }
        }
    }

    /// Wait for the event loop task to confirm or reject the connection
    async fn wait_for_connection_confirmation(
        ready_rx: oneshot::Receiver<Result<(), ConnectFailure>>,
        timeout: Duration,
    ) -> Result<(), ConnectFailure> {
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectFailure::other(
                "Event loop stopped before ConnAck",
            )),
            Err(_) => Err(ConnectFailure::socket(
                "ConnAck timeout - no connection confirmation received",
            )),
        }
    }

    /// Poll the event loop until it fails or the broker disconnects
    async fn run_event_loop(
        mut event_loop: EventLoop,
        ready_tx: oneshot::Sender<Result<(), ConnectFailure>>,
        events: Option<mpsc::UnboundedSender<TransportEvent>>,
        connected: Arc<AtomicBool>,
        disconnect_requested: Arc<AtomicBool>,
        acks: AckSlot,
        address: String,
    ) {
        let emit = |event: TransportEvent| {
            if let Some(events) = &events {
                // Receiver gone means the owning connection is shutting down
                let _ = events.send(event);
            }
        };
        let mut ready_tx = Some(ready_tx);

        loop {
            let failure = match event_loop.poll().await {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        connected.store(true, Ordering::SeqCst);
                        if let Some(ready_tx) = ready_tx.take() {
                            let _ = ready_tx.send(Ok(()));
                        }
                        emit(TransportEvent::Connected);
                        continue;
                    }
                    EventRoute::MessageReceived { topic, payload } => {
                        trace!(target: "mqtt_transport", %address, %topic, "Publish received");
                        emit(TransportEvent::MessageReceived { topic, payload });
                        continue;
                    }
                    EventRoute::Disconnected { failure } => failure,
                    EventRoute::SubscribeSent { packet_id } => {
                        acks.bind(AckKind::Subscribe, packet_id);
                        continue;
                    }
                    EventRoute::UnsubscribeSent { packet_id } => {
                        acks.bind(AckKind::Unsubscribe, packet_id);
                        continue;
                    }
                    EventRoute::SubscribeAcknowledged { packet_id, outcome } => {
                        if !acks.resolve(AckKind::Subscribe, packet_id, outcome) {
                            debug!(target: "mqtt_transport", %address, packet_id, "Unmatched SubAck");
                        }
                        continue;
                    }
                    EventRoute::UnsubscribeAcknowledged { packet_id, outcome } => {
                        if !acks.resolve(AckKind::Unsubscribe, packet_id, outcome) {
                            debug!(target: "mqtt_transport", %address, packet_id, "Unmatched UnsubAck");
                        }
                        continue;
                    }
                    EventRoute::InfrastructureEvent(event) => {
                        trace!(target: "mqtt_transport", %address, "MQTT event: {}", event);
                        continue;
                    }
                    EventRoute::OutgoingEvent => continue,
                },
                Err(error) => MessageHandler::classify_connection_error(&error),
            };

            connected.store(false, Ordering::SeqCst);
            acks.clear();
            match ready_tx.take() {
                Some(ready_tx) => {
                    let _ = ready_tx.send(Err(failure));
                }
                None => emit(MessageHandler::link_lost_event(
                    failure,
                    disconnect_requested.load(Ordering::SeqCst),
                )),
            }
            break;
        }

        debug!(target: "mqtt_transport", %address, "MQTT event loop stopped");
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), ConnectFailure> {
        self.teardown();
        self.disconnect_requested.store(false, Ordering::SeqCst);

        self.ack_timeout = options.connect_timeout;
        let mqtt_options = configure_mqtt_options(options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            ready_tx,
            self.events.clone(),
            self.connected.clone(),
            self.disconnect_requested.clone(),
            self.acks.clone(),
            options.address(),
        ));
        self.event_loop_handle = Some(handle);

        match Self::wait_for_connection_confirmation(ready_rx, options.connect_timeout).await {
            Ok(()) => {
                self.client = Some(client);
                Ok(())
            }
            Err(failure) => {
                self.teardown();
                Err(failure)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.disconnect_requested.store(true, Ordering::SeqCst);

        let Some(client) = self.client.take() else {
            self.teardown();
            return Ok(());
        };

        let result = client
            .disconnect()
            .await
            .map_err(|e| TransportError::DisconnectFailed(e.to_string()));

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(DISCONNECT_GRACE, handle).await {
                Ok(Ok(())) => info!(target: "mqtt_transport", "Event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(target: "mqtt_transport", "Event loop task ended with error: {}", e);
                }
                Err(_) => {
                    warn!(target: "mqtt_transport", "Event loop didn't shut down gracefully, aborting");
                }
                _ => {}
            }
        }

        self.teardown();
        result
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self.live_client()?;
        let failed = |message: String| TransportError::SubscribeFailed {
            topic: topic.to_string(),
            message,
        };

        let ack_rx = self.acks.expect(AckKind::Subscribe);
        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
            self.acks.clear();
            return Err(failed(e.to_string()));
        }
        Self::wait_for_ack(&self.acks, ack_rx, self.ack_timeout)
            .await
            .map_err(failed)
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self.live_client()?;
        let failed = |message: String| TransportError::UnsubscribeFailed {
            topic: topic.to_string(),
            message,
        };

        let ack_rx = self.acks.expect(AckKind::Unsubscribe);
        if let Err(e) = client.unsubscribe(topic).await {
            self.acks.clear();
            return Err(failed(e.to_string()));
        }
        Self::wait_for_ack(&self.acks, ack_rx, self.ack_timeout)
            .await
            .map_err(failed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn attach(&mut self, events: mpsc::UnboundedSender<TransportEvent>) {
        self.events = Some(events);
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // No async in Drop; callers disconnect explicitly for a clean close
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

/// Factory handing every connection its own [`MqttTransport`]
#[derive(Debug, Default, Clone)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    fn create(&self, _broker: &Broker) -> Box<dyn Transport> {
        Box::new(MqttTransport::new())
    }
}
