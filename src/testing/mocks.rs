//! Mock implementations for testing
//!
//! Provides a scriptable Transport, a matching TransportFactory and a recording
//! MessageDispatcher so connection and pool behaviour can be tested without a
//! broker.

use crate::broker::{Broker, BrokerId};
use crate::dispatcher::{DispatchError, MessageDispatcher};
use crate::transport::{
    ConnectFailure, ConnectOptions, Transport, TransportError, TransportEvent, TransportFactory,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ScriptState {
    connected: bool,
    queued_failures: VecDeque<ConnectFailure>,
    permanent_failure: Option<ConnectFailure>,
    subscribe_failure: Option<TransportError>,
    connect_times: Vec<Instant>,
    disconnect_calls: usize,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// Shared control and recording surface for a [`MockTransport`]
///
/// Clones observe and drive the same transport, so a test keeps one while the
/// connection under test owns the transport itself.
#[derive(Debug, Clone, Default)]
pub struct TransportScript {
    state: Arc<Mutex<ScriptState>>,
}

impl TransportScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next connect attempt with `failure`; queued failures are used in order
    pub fn push_connect_failure(&self, failure: ConnectFailure) {
        lock(&self.state).queued_failures.push_back(failure);
    }

    /// Fail every connect attempt once the queue is drained
    pub fn fail_all_connects(&self, failure: ConnectFailure) {
        lock(&self.state).permanent_failure = Some(failure);
    }

    /// Let connect attempts succeed again
    pub fn heal(&self) {
        let mut state = lock(&self.state);
        state.queued_failures.clear();
        state.permanent_failure = None;
    }

    pub fn fail_subscribes(&self, error: TransportError) {
        lock(&self.state).subscribe_failure = Some(error);
    }

    pub fn connect_calls(&self) -> usize {
        lock(&self.state).connect_times.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        lock(&self.state).connect_times.clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        lock(&self.state).disconnect_calls
    }

    pub fn subscribed(&self) -> Vec<String> {
        lock(&self.state).subscribed.clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        lock(&self.state).unsubscribed.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Simulate the broker dropping the link
    pub fn drop_connection(&self, reason: &str) {
        let mut state = lock(&self.state);
        state.connected = false;
        send(
            &state,
            TransportEvent::Disconnected {
                requested: false,
                reason: reason.to_string(),
            },
        );
    }

    /// Simulate the broker dropping the link with a classified failure
    pub fn fail_link(&self, failure: ConnectFailure) {
        let mut state = lock(&self.state);
        state.connected = false;
        send(&state, TransportEvent::ConnectingFailed(failure));
    }

    /// Simulate an inbound publish
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let state = lock(&self.state);
        send(
            &state,
            TransportEvent::MessageReceived {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
            },
        );
    }

    /// Push an arbitrary event to the owning connection
    pub fn emit(&self, event: TransportEvent) {
        send(&lock(&self.state), event);
    }
}

fn send(state: &ScriptState, event: TransportEvent) {
    if let Some(events) = &state.events {
        let _ = events.send(event);
    }
}

/// Mock transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    script: TransportScript,
}

impl MockTransport {
    pub fn new(script: TransportScript) -> Self {
        Self { script }
    }

    pub fn script(&self) -> TransportScript {
        self.script.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, _options: &ConnectOptions) -> Result<(), ConnectFailure> {
        let mut state = lock(&self.script.state);
        state.connect_times.push(Instant::now());

        let failure = state
            .queued_failures
            .pop_front()
            .or_else(|| state.permanent_failure.clone());
        if let Some(failure) = failure {
            state.connected = false;
            return Err(failure);
        }

        state.connected = true;
        send(&state, TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.script.state);
        state.disconnect_calls += 1;

        if state.connected {
            state.connected = false;
            send(
                &state,
                TransportEvent::Disconnected {
                    requested: true,
                    reason: "client disconnect".to_string(),
                },
            );
        }
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.script.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = state.subscribe_failure.clone() {
            return Err(error);
        }

        state.subscribed.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.script.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }

        state.unsubscribed.push(topic.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.script.is_connected()
    }

    fn attach(&mut self, events: mpsc::UnboundedSender<TransportEvent>) {
        lock(&self.script.state).events = Some(events);
    }
}

/// Factory handing out [`MockTransport`]s and remembering their scripts
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    prepared: Arc<Mutex<HashMap<BrokerId, TransportScript>>>,
    created: Arc<Mutex<HashMap<BrokerId, TransportScript>>>,
    created_count: Arc<Mutex<usize>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `script` for the next transport created for `broker_id`
    pub fn prepare(&self, broker_id: BrokerId, script: TransportScript) {
        lock(&self.prepared).insert(broker_id, script);
    }

    /// Script of the latest transport created for `broker_id`
    pub fn script_for(&self, broker_id: &BrokerId) -> Option<TransportScript> {
        lock(&self.created).get(broker_id).cloned()
    }

    pub fn created(&self) -> usize {
        *lock(&self.created_count)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, broker: &Broker) -> Box<dyn Transport> {
        let script = lock(&self.prepared)
            .remove(&broker.id)
            .unwrap_or_default();
        lock(&self.created).insert(broker.id, script.clone());
        *lock(&self.created_count) += 1;
        Box::new(MockTransport::new(script))
    }
}

/// Dispatcher that records every message it receives
#[derive(Debug, Clone)]
pub struct RecordingDispatcher {
    messages: Arc<Mutex<Vec<(String, String)>>>,
    failure: Arc<Mutex<Option<String>>>,
    count: Arc<watch::Sender<usize>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
            count: Arc::new(count),
        }
    }

    /// Record messages but report every dispatch as failed
    pub fn fail_with(&self, message: impl Into<String>) {
        *lock(&self.failure) = Some(message.into());
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        lock(&self.messages).clone()
    }

    /// Resolve once at least `n` messages were recorded
    pub async fn wait_for(&self, n: usize) {
        let mut rx = self.count.subscribe();
        while *rx.borrow_and_update() < n {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn dispatch(&self, topic: &str, payload: &str) -> Result<(), DispatchError> {
        let total = {
            let mut messages = lock(&self.messages);
            messages.push((topic.to_string(), payload.to_string()));
            messages.len()
        };
        self.count.send_replace(total);

        match lock(&self.failure).clone() {
            Some(message) => Err(DispatchError::new(topic, message)),
            None => Ok(()),
        }
    }
}
