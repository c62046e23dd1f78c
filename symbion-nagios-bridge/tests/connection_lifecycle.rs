use std::time::Duration;
use symbion_devkit::mqtt_stub::MockConnector;
use symbion_devkit::test_utils::test_session;
use symbion_devkit::MockBroker;
use symbion_nagios_bridge::connection::{ConnectionManager, ConnectionState, Delivery};
use symbion_nagios_bridge::transport::TransportError;
use tokio::time::Instant;

const LIVENESS: &str = "nagios/hosts/nagios01";
const CHECK: &str = "nagios/checks/db1";
const DELAY: Duration = Duration::from_secs(20);

fn manager(broker: &MockBroker) -> ConnectionManager<MockConnector> {
    ConnectionManager::new(broker.connector(), test_session("nagios", "nagios01"), DELAY)
}

async fn connected(broker: &MockBroker) -> ConnectionManager<MockConnector> {
    let mut manager = manager(broker);
    manager.connect();
    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    manager
}

fn liveness_states(broker: &MockBroker) -> Vec<String> {
    broker
        .find_messages_by_topic(LIVENESS)
        .iter()
        .map(|m| {
            assert!(m.retain, "liveness must be retained");
            let value: serde_json::Value = serde_json::from_slice(&m.payload).unwrap();
            value["state"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_connect_announces_alive_with_dead_testament() {
    let broker = MockBroker::new();
    let mut manager = manager(&broker);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    manager.connect();
    assert_eq!(manager.state(), ConnectionState::Connecting);

    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(liveness_states(&broker), ["alive"]);

    let sessions = broker.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].testament.topic, LIVENESS);
    assert_eq!(sessions[0].testament.payload, br#"{"state":"dead"}"#.to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_reconnects_after_fixed_delay() {
    let broker = MockBroker::new();
    let mut manager = connected(&broker).await;

    broker.drop_connection("connection reset by peer");
    let dropped_at = Instant::now();
    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::ReconnectPending);
    assert!(manager.reconnect_pending());

    // a second fatal error while pending arms nothing new
    manager.on_transport_error(TransportError::Fatal("late error".into()));
    assert_eq!(manager.state(), ConnectionState::ReconnectPending);
    assert_eq!(broker.opened(), 1);

    let early = tokio::time::timeout(DELAY - Duration::from_secs(1), manager.drive()).await;
    assert!(early.is_err(), "reconnected before the delay");
    assert_eq!(broker.opened(), 1);

    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::Connecting);
    assert!(!manager.reconnect_pending());
    assert_eq!(broker.opened(), 2);
    let waited = dropped_at.elapsed();
    assert!(waited >= DELAY && waited < DELAY + Duration::from_secs(1), "{waited:?}");

    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(liveness_states(&broker), ["alive", "alive"]);
    assert_eq!(broker.sessions()[0], broker.sessions()[1]);
}

#[tokio::test(start_paused = true)]
async fn test_publish_outside_connected_is_a_silent_no_op() {
    let broker = MockBroker::manual();
    let mut manager = manager(&broker);

    assert_eq!(manager.publish(CHECK, b"{}".to_vec()).await, Delivery::Dropped);

    manager.connect();
    assert_eq!(manager.publish(CHECK, b"{}".to_vec()).await, Delivery::Dropped);

    broker.accept();
    manager.drive().await;
    broker.drop_connection("network unreachable");
    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::ReconnectPending);
    assert_eq!(manager.publish(CHECK, b"{}".to_vec()).await, Delivery::Dropped);

    assert!(broker.find_messages_by_topic(CHECK).is_empty());
    assert_eq!(manager.state(), ConnectionState::ReconnectPending);
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_publish_error_keeps_the_session() {
    let broker = MockBroker::new();
    let mut manager = connected(&broker).await;

    broker.fail_publishes(Some(TransportError::Recoverable("request queue full".into())));
    assert_eq!(manager.publish(CHECK, b"{}".to_vec()).await, Delivery::Failed);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(!manager.reconnect_pending());

    broker.fail_publishes(None);
    assert_eq!(manager.publish(CHECK, b"{\"a\":1}".to_vec()).await, Delivery::Queued);
    let messages = broker.find_messages_by_topic(CHECK);
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].retain);
    assert_eq!(broker.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_publish_error_schedules_reconnect() {
    let broker = MockBroker::new();
    let mut manager = connected(&broker).await;

    broker.fail_publishes(Some(TransportError::Fatal("broken pipe".into())));
    assert_eq!(manager.publish(CHECK, b"{}".to_vec()).await, Delivery::Failed);
    assert_eq!(manager.state(), ConnectionState::ReconnectPending);
    assert!(manager.reconnect_pending());
}

#[tokio::test(start_paused = true)]
async fn test_initial_connection_failure_is_retried() {
    let broker = MockBroker::manual();
    let mut manager = manager(&broker);

    manager.connect();
    broker.drop_connection("connection refused");
    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::ReconnectPending);
    assert!(liveness_states(&broker).is_empty());

    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    broker.accept();
    manager.drive().await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(liveness_states(&broker), ["alive"]);
}

#[tokio::test(start_paused = true)]
async fn test_clean_shutdown_publishes_dead_and_disconnects() {
    let broker = MockBroker::new();
    let mut manager = connected(&broker).await;

    manager.shutdown().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(liveness_states(&broker), ["alive", "dead"]);
    assert_eq!(broker.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_reconnect_pending_leaves_it_to_the_testament() {
    let broker = MockBroker::new();
    let mut manager = connected(&broker).await;
    broker.drop_connection("timeout");
    manager.drive().await;

    manager.shutdown().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.reconnect_pending());
    assert_eq!(liveness_states(&broker), ["alive"]);
    assert_eq!(broker.closed(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_burst_beyond_queue_capacity_waits_instead_of_failing() {
    let broker = MockBroker::new();
    let mut manager = connected(&broker).await;

    // the session's request queue holds 10
    for n in 0..40 {
        let payload = serde_json::json!({ "n": n }).to_string().into_bytes();
        assert_eq!(manager.publish(CHECK, payload).await, Delivery::Queued);
    }
    assert_eq!(broker.find_messages_by_topic(CHECK).len(), 40);

    broker.stall(true);
    let mut waited = false;
    for _ in 0..20 {
        let attempt = tokio::time::timeout(
            Duration::from_secs(1),
            manager.publish(CHECK, b"{}".to_vec()),
        );
        match attempt.await {
            Ok(delivery) => assert_eq!(delivery, Delivery::Queued),
            Err(_) => {
                waited = true;
                break;
            }
        }
    }
    assert!(waited, "publish on a full queue should wait for the broker");
    assert_eq!(manager.state(), ConnectionState::Connected);

    broker.stall(false);
    assert_eq!(manager.publish(CHECK, b"{}".to_vec()).await, Delivery::Queued);
    assert_eq!(manager.state(), ConnectionState::Connected);
}
