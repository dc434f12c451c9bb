//! Integration tests for link supervision: debounce, health checks and
//! backoff reconnection, driven on a paused tokio clock.

use ridelink::clock::MonotonicClock;
use ridelink::events::{EventBus, Subscription};
use ridelink::sensors::link::LinkSupervisor;
use ridelink::sensors::mock::MockConnector;
use ridelink::sensors::types::{ConnectionState, DeviceRecord, SensorConfig, SensorEvent};
use ridelink::storage::known_devices::{InMemoryKnownDevices, KnownDevice, KnownDeviceStore};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    link: LinkSupervisor,
    connector: Arc<MockConnector>,
    known: Arc<InMemoryKnownDevices>,
    events: Subscription<SensorEvent>,
}

fn harness(config: SensorConfig, connector: MockConnector) -> Harness {
    let connector = Arc::new(connector);
    let known = Arc::new(InMemoryKnownDevices::new());
    let link = LinkSupervisor::new(
        config,
        connector.clone(),
        known.clone(),
        MonotonicClock::new(),
        Arc::new(EventBus::new()),
    );
    let events = link.subscribe();
    Harness {
        link,
        connector,
        known,
        events,
    }
}

fn reconnect_delays(events: &Subscription<SensorEvent>) -> Vec<Duration> {
    events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            SensorEvent::ReconnectScheduled { delay, .. } => Some(delay),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_until_failed() {
    let config = SensorConfig {
        max_reconnect_attempts: 4,
        ..Default::default()
    };
    let h = harness(config, MockConnector::succeeding());
    h.link.connect("hr", "HRM").await.unwrap();
    h.connector.set_default(false);
    h.events.drain();

    h.link.transition_now("hr", ConnectionState::Disconnected).unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(
        reconnect_delays(&h.events),
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(4000),
            Duration::from_millis(8000),
        ]
    );
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Failed));
    // Initial connect plus four reconnection attempts
    assert_eq!(h.connector.connect_attempts().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_succeeds_on_second_attempt() {
    let h = harness(SensorConfig::default(), MockConnector::succeeding());
    h.link.connect("pm", "Assioma").await.unwrap();
    h.connector.push_outcome(false);

    h.link.transition_now("pm", ConnectionState::Disconnected).unwrap();
    // 1s + 2s backoff
    tokio::time::sleep(Duration::from_millis(3500)).await;

    assert_eq!(h.link.state("pm"), Some(ConnectionState::Connected));
    assert_eq!(h.connector.connect_attempts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_disconnects_silent_device() {
    let config = SensorConfig {
        auto_reconnect: false,
        ..Default::default()
    };
    let h = harness(config, MockConnector::succeeding());
    h.link.connect("hr", "HRM").await.unwrap();
    h.link.record_data("hr");
    h.link.start_health_monitor();

    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connected));

    // Timeout is 60s, checks run every 15s
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Disconnected));

    h.link.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_steady_data_keeps_device_connected() {
    let h = harness(SensorConfig::default(), MockConnector::succeeding());
    h.link.connect("hr", "HRM").await.unwrap();
    h.link.start_health_monitor();

    for _ in 0..12 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        h.link.record_data("hr");
    }

    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connected));
    h.link.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_queued_transition_applied_when_fresh() {
    let h = harness(SensorConfig::default(), MockConnector::succeeding());
    h.link.add_device(DeviceRecord::new("hr", "HRM"));

    h.link.request_transition("hr", ConnectionState::Connecting);
    h.link.request_transition("hr", ConnectionState::Connected);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Disconnected));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_stale_queued_transition_is_dropped() {
    let config = SensorConfig {
        debounce: Duration::from_secs(3),
        freshness: Duration::from_secs(2),
        ..Default::default()
    };
    let h = harness(config, MockConnector::succeeding());
    h.link.add_device(DeviceRecord::new("hr", "HRM"));

    h.link.request_transition("hr", ConnectionState::Connecting);
    h.link.request_transition("hr", ConnectionState::Connected);

    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connecting));
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_is_debounced() {
    let config = SensorConfig {
        auto_reconnect: false,
        ..Default::default()
    };
    let h = harness(config, MockConnector::succeeding());
    h.link.connect("trainer", "KICKR").await.unwrap();

    h.link.report_link_loss("trainer");
    assert_eq!(h.link.state("trainer"), Some(ConnectionState::Connected));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.link.state("trainer"), Some(ConnectionState::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn test_immediate_transition_cancels_pending_debounce() {
    let h = harness(SensorConfig::default(), MockConnector::succeeding());
    h.link.add_device(DeviceRecord::new("hr", "HRM"));

    h.link.request_transition("hr", ConnectionState::Connecting);
    h.link.transition_now("hr", ConnectionState::Failed).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_data_cancels_inflight_reconnect() {
    let h = harness(SensorConfig::default(), MockConnector::succeeding());
    h.link.connect("hr", "HRM").await.unwrap();
    h.connector.set_default(false);

    h.link.transition_now("hr", ConnectionState::Disconnected).unwrap();
    // First attempt fails at 1s, second is waiting on its 2s backoff
    tokio::time::sleep(Duration::from_millis(1500)).await;
    h.link.record_data("hr");

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connected));
    // Initial connect plus the one failed reconnection attempt
    assert_eq!(h.connector.connect_attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_data_does_not_revive_failed_device() {
    let h = harness(SensorConfig::default(), MockConnector::failing());
    assert!(h.link.connect("pm", "Assioma").await.is_err());

    h.link.record_data("pm");

    assert_eq!(h.link.state("pm"), Some(ConnectionState::Failed));
    assert!(h.link.record("pm").unwrap().last_data_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_recovers_failed_device() {
    let h = harness(SensorConfig::default(), MockConnector::failing());
    assert!(h.link.connect("pm", "Assioma").await.is_err());

    h.connector.set_default(true);
    h.link.connect("pm", "Assioma").await.unwrap();

    assert_eq!(h.link.state("pm"), Some(ConnectionState::Connected));
    assert_eq!(h.known.list().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restore_known_reconnects_each_device() {
    let h = harness(SensorConfig::default(), MockConnector::succeeding());
    h.known.remember(&KnownDevice::new("hr", "HRM", None)).unwrap();
    h.known.remember(&KnownDevice::new("pm", "Assioma", None)).unwrap();

    assert_eq!(h.link.restore_known().unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connected));
    assert_eq!(h.link.state("pm"), Some(ConnectionState::Connected));
    assert_eq!(h.link.records().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manual_connect_takes_over_inflight_reconnect() {
    let h = harness(SensorConfig::default(), MockConnector::succeeding());
    h.connector.set_delay(Duration::from_secs(5));
    h.known.remember(&KnownDevice::new("hr", "HRM", None)).unwrap();
    h.link.restore_known().unwrap();

    // First attempt starts after 1s and is still connecting
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connecting));

    h.link.connect("hr", "HRM").await.unwrap();
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connected));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.link.state("hr"), Some(ConnectionState::Connected));
    assert_eq!(h.connector.connect_attempts().len(), 2);
}
