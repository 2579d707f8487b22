//! Reconnection timing tests
//!
//! Runs with a paused tokio clock so the full ten minute recovery window
//! elapses instantly. Retry offsets are measured from the moment the broker
//! dropped the link.

use mqtt_pool::pool::{BackoffPolicy, ConnectionPool, ConnectionSnapshot, ConnectionState};
use mqtt_pool::testing::{MockTransportFactory, RecordingDispatcher, TransportScript};
use mqtt_pool::transport::{ConnectFailure, TransportSettings};
use mqtt_pool::{Broker, Credentials};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn pooled(
    script: TransportScript,
    policy: BackoffPolicy,
) -> (ConnectionPool, Broker, TransportScript) {
    let factory = MockTransportFactory::new();
    let broker = Broker::new("localhost", 1883, Credentials::new("user", "pass"));
    factory.prepare(broker.id, script.clone());

    let pool = ConnectionPool::new(
        Arc::new(factory),
        Arc::new(RecordingDispatcher::new()),
        policy,
        TransportSettings::default(),
    );
    pool.connect(&broker).await.unwrap();
    (pool, broker, script)
}

async fn wait_for<F>(pool: &ConnectionPool, broker: &Broker, predicate: F)
where
    F: Fn(&ConnectionSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(3600);
    loop {
        if let Some(snapshot) = pool.status(&broker.id).await {
            if predicate(&snapshot) {
                return;
            }
        }
        assert!(Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn offsets(script: &TransportScript, since: Instant) -> Vec<u64> {
    script
        .connect_times()
        .iter()
        .skip(1)
        .map(|t| t.duration_since(since).as_secs())
        .collect()
}

#[tokio::test]
async fn test_backoff_doubles_then_caps() {
    tokio::time::pause();
    let (pool, broker, script) = pooled(TransportScript::new(), BackoffPolicy::default()).await;

    for _ in 0..9 {
        script.push_connect_failure(ConnectFailure::socket("connection refused"));
    }
    let dropped_at = Instant::now();
    script.drop_connection("keep alive timeout");

    wait_for(&pool, &broker, |s| s.state == ConnectionState::Stable && s.transport_connected)
        .await;

    let times = offsets(&script, dropped_at);
    let gaps: Vec<u64> = std::iter::once(times[0])
        .chain(times.windows(2).map(|w| w[1] - w[0]))
        .collect();
    // Nine failed retries, the tenth at 767s lands after the cap and succeeds
    assert_eq!(gaps, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 256]);
}

#[tokio::test]
async fn test_gives_up_after_recovery_window() {
    tokio::time::pause();
    let (pool, broker, script) = pooled(TransportScript::new(), BackoffPolicy::default()).await;

    script.fail_all_connects(ConnectFailure::socket("host unreachable"));
    let dropped_at = Instant::now();
    script.drop_connection("network down");

    wait_for(&pool, &broker, |s| s.state.is_given_up()).await;

    assert_eq!(
        offsets(&script, dropped_at),
        vec![1, 3, 7, 15, 31, 63, 127, 255, 511, 767]
    );

    // Still requested, not live
    let snapshot = pool.status(&broker.id).await.unwrap();
    assert!(snapshot.connection_requested);
    assert!(!snapshot.transport_connected);

    let calls = script.connect_calls();
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(script.connect_calls(), calls);
}

#[tokio::test]
async fn test_shorter_window_from_policy() {
    tokio::time::pause();
    let policy = BackoffPolicy {
        max_recovery_window: Duration::from_secs(5),
        ..BackoffPolicy::default()
    };
    let (pool, broker, script) = pooled(TransportScript::new(), policy).await;

    script.fail_all_connects(ConnectFailure::other("server unavailable"));
    let dropped_at = Instant::now();
    script.drop_connection("broker restart");

    wait_for(&pool, &broker, |s| s.state.is_given_up()).await;
    // Retry at 3s still within the window, the one at 7s is past it
    assert_eq!(offsets(&script, dropped_at), vec![1, 3, 7]);
}

#[tokio::test]
async fn test_invalid_credentials_stop_retries() {
    tokio::time::pause();
    let (pool, broker, script) = pooled(TransportScript::new(), BackoffPolicy::default()).await;

    script.push_connect_failure(ConnectFailure::socket("refused"));
    script.push_connect_failure(ConnectFailure::socket("refused"));
    script.push_connect_failure(ConnectFailure::invalid_credentials("BadUserNamePassword"));
    script.drop_connection("broker restart");

    wait_for(&pool, &broker, |s| s.state.is_given_up()).await;
    let calls = script.connect_calls();
    assert_eq!(calls, 4);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(script.connect_calls(), calls);
}

#[tokio::test]
async fn test_disconnect_wins_over_scheduled_retry() {
    tokio::time::pause();
    let (pool, broker, script) = pooled(TransportScript::new(), BackoffPolicy::default()).await;

    script.push_connect_failure(ConnectFailure::socket("refused"));
    script.drop_connection("network down");
    wait_for(&pool, &broker, |s| {
        matches!(s.state, ConnectionState::AwaitingRetry { attempt: 1, .. })
    })
    .await;

    pool.disconnect(&broker.id).await.unwrap();
    let calls = script.connect_calls();

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(script.connect_calls(), calls);
    assert!(!pool.connection_exists(&broker.id).await);
}

#[tokio::test]
async fn test_recovery_resubscribes_topics() {
    tokio::time::pause();
    let (pool, broker, script) = pooled(TransportScript::new(), BackoffPolicy::default()).await;
    let topics = vec!["sensors/#".to_string(), "alerts".to_string()];
    pool.add_listeners(&broker.id, &topics).await.unwrap();

    script.push_connect_failure(ConnectFailure::socket("refused"));
    script.drop_connection("keep alive timeout");
    wait_for(&pool, &broker, |s| s.state.is_awaiting_retry()).await;
    wait_for(&pool, &broker, |s| s.state == ConnectionState::Stable).await;

    let subscribed = script.subscribed();
    assert_eq!(subscribed.len(), 4);
    assert!(pool.listener_exists(&broker.id, "alerts").await);
    assert!(pool.listener_exists(&broker.id, "sensors/#").await);
}

#[tokio::test]
async fn test_backoff_resets_after_successful_reconnect() {
    tokio::time::pause();
    let (pool, broker, script) = pooled(TransportScript::new(), BackoffPolicy::default()).await;

    script.push_connect_failure(ConnectFailure::socket("refused"));
    script.drop_connection("first outage");
    wait_for(&pool, &broker, |s| s.state.is_awaiting_retry()).await;
    wait_for(&pool, &broker, |s| s.state == ConnectionState::Stable).await;

    let second_drop = Instant::now();
    script.drop_connection("second outage");
    wait_for(&pool, &broker, |s| s.state.is_awaiting_retry()).await;
    wait_for(&pool, &broker, |s| s.state == ConnectionState::Stable).await;

    // First retry after the second outage waits the base delay again
    let last = *script.connect_times().last().unwrap();
    assert_eq!(last.duration_since(second_drop).as_secs(), 1);
}
