//! Integration tests for the SQLite known-device store.

use ridelink::clock::MonotonicClock;
use ridelink::events::EventBus;
use ridelink::sensors::link::LinkSupervisor;
use ridelink::sensors::mock::MockConnector;
use ridelink::sensors::types::{SensorConfig, SensorType};
use ridelink::storage::known_devices::{KnownDevice, KnownDeviceStore, SqliteKnownDevices};
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn test_devices_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data").join("known_devices.db");

    {
        let store = SqliteKnownDevices::open(&path).unwrap();
        store
            .remember(&KnownDevice::new("AA:BB:CC", "KICKR", Some(SensorType::Trainer)))
            .unwrap();
        store
            .remember(&KnownDevice::new("DD:EE:FF", "HRM-Pro", Some(SensorType::HeartRate)))
            .unwrap();
    }

    let store = SqliteKnownDevices::open(&path).unwrap();
    let devices = store.list().unwrap();
    assert_eq!(devices.len(), 2);

    let kickr = devices.iter().find(|d| d.device_id == "AA:BB:CC").unwrap();
    assert_eq!(kickr.name, "KICKR");
    assert_eq!(kickr.sensor_type, Some(SensorType::Trainer));
}

#[test]
fn test_forget_removes_only_that_device() {
    let store = SqliteKnownDevices::open_in_memory().unwrap();
    store.remember(&KnownDevice::new("a", "A", None)).unwrap();
    store.remember(&KnownDevice::new("b", "B", None)).unwrap();

    store.forget("a").unwrap();

    let ids: Vec<String> = store.list().unwrap().into_iter().map(|d| d.device_id).collect();
    assert_eq!(ids, vec!["b"]);
}

#[tokio::test(start_paused = true)]
async fn test_link_lifecycle_updates_store() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SqliteKnownDevices::open(&dir.path().join("known.db")).unwrap());
    let link = LinkSupervisor::new(
        SensorConfig::default(),
        Arc::new(MockConnector::succeeding()),
        store.clone(),
        MonotonicClock::new(),
        Arc::new(EventBus::new()),
    );

    link.connect("AA:BB:CC", "KICKR").await.unwrap();
    assert_eq!(store.list().unwrap()[0].device_id, "AA:BB:CC");

    link.disconnect("AA:BB:CC").await.unwrap();
    assert!(store.list().unwrap().is_empty());
}
