//! Integration tests for the FTMS control engine against a scripted transport.

use ridelink::sensors::control::FtmsController;
use ridelink::sensors::ftms::{
    ControlMode, SimulationParams, SUPPORTED_POWER_RANGE_UUID, SUPPORTED_RESISTANCE_RANGE_UUID,
};
use ridelink::sensors::mock::{AckBehavior, MockTransport};
use ridelink::sensors::types::{ControlConfig, ControlError, ControlKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const POWER: u32 = 1 << 3;
const RESISTANCE: u32 = 1 << 2;
const SIMULATION: u32 = 1 << 13;

async fn discovered(transport: &Arc<MockTransport>) -> FtmsController {
    let ctrl = FtmsController::new("kickr", transport.clone(), ControlConfig::default());
    ctrl.discover_features().await.unwrap();
    ctrl
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_acks_exhaust_retries() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    transport.set_behavior(AckBehavior::WrongOpcode);
    let ctrl = discovered(&transport).await;

    let started = Instant::now();
    let result = ctrl.set_target_power(200.0).await;

    assert!(matches!(result, Err(ControlError::RetriesExhausted)));
    // One attempt plus three retries
    assert_eq!(transport.control_writes().len(), 4);
    // 4 x 2s ack timeout + 0.5s + 1s + 2s backoff
    assert!(started.elapsed() >= Duration::from_millis(11_500));
    assert_eq!(ctrl.current_mode(), None);

    let log = ctrl.control_log();
    assert_eq!(log.len(), 1);
    assert!(!log[0].success);
    assert_eq!(log[0].reason.as_deref(), Some("all retries failed"));
}

#[tokio::test(start_paused = true)]
async fn test_guard_rejects_until_settled() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    let ctrl = discovered(&transport).await;

    ctrl.set_target_power(150.0).await.unwrap();
    assert!(ctrl.is_busy());
    assert!(matches!(
        ctrl.set_target_power(160.0).await,
        Err(ControlError::Busy)
    ));

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert!(!ctrl.is_busy());
    ctrl.set_target_power(160.0).await.unwrap();

    assert_eq!(
        transport.control_writes(),
        vec![vec![0x05, 0x96, 0x00], vec![0x05, 0xA0, 0x00]]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_mode_never_touches_the_wire() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    let ctrl = discovered(&transport).await;

    let result = ctrl.set_resistance_target(30.0).await;

    assert!(matches!(
        result,
        Err(ControlError::Unsupported(ControlMode::Resistance))
    ));
    assert!(transport.control_writes().is_empty());
    assert!(ctrl.control_log().is_empty());
    assert!(!ctrl.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_mode_switch_resets_first() {
    let transport = Arc::new(MockTransport::with_features(0, POWER | RESISTANCE));
    let ctrl = discovered(&transport).await;

    ctrl.set_target_power(200.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    ctrl.set_resistance_target(20.0).await.unwrap();

    assert_eq!(
        transport.control_writes(),
        vec![vec![0x05, 0xC8, 0x00], vec![0x01], vec![0x04, 0xC8]]
    );
    assert_eq!(ctrl.current_mode(), Some(ControlMode::Resistance));

    let kinds: Vec<ControlKind> = ctrl.control_log().into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ControlKind::Target(ControlMode::Power),
            ControlKind::Reset,
            ControlKind::Target(ControlMode::Resistance),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_same_mode_update_skips_reset() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    let ctrl = discovered(&transport).await;

    ctrl.set_target_power(200.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    ctrl.set_target_power(220.0).await.unwrap();

    assert!(transport.control_writes().iter().all(|w| w[0] == 0x05));
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_is_retried() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    let ctrl = discovered(&transport).await;
    transport.fail_next_writes(1);

    ctrl.set_target_power(180.0).await.unwrap();

    assert_eq!(transport.control_writes().len(), 2);
    assert_eq!(ctrl.current_mode(), Some(ControlMode::Power));
}

#[tokio::test(start_paused = true)]
async fn test_silent_then_ack_succeeds_on_retry() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    let ctrl = discovered(&transport).await;
    transport.push_behavior(AckBehavior::Silent);

    ctrl.set_target_power(180.0).await.unwrap();
    assert_eq!(transport.control_writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_target_is_clamped_to_advertised_range() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    // min 0, max 1000, increment 1
    transport.set_value(SUPPORTED_POWER_RANGE_UUID, vec![0x00, 0x00, 0xE8, 0x03, 0x01, 0x00]);
    let ctrl = discovered(&transport).await;

    ctrl.set_target_power(1500.0).await.unwrap();

    assert_eq!(transport.control_writes(), vec![vec![0x05, 0xE8, 0x03]]);
    assert_eq!(ctrl.control_log()[0].requested_value, Some(1000.0));
}

#[tokio::test(start_paused = true)]
async fn test_default_range_applies_without_advertised_one() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    let ctrl = discovered(&transport).await;
    assert!(ctrl.range(ControlMode::Power).is_none());

    ctrl.set_target_power(2500.0).await.unwrap();

    assert_eq!(transport.control_writes(), vec![vec![0x05, 0xD0, 0x07]]);
}

#[tokio::test(start_paused = true)]
async fn test_simulation_command_bytes() {
    let transport = Arc::new(MockTransport::with_features(0, SIMULATION));
    let ctrl = discovered(&transport).await;

    ctrl.set_simulation(SimulationParams {
        grade_percent: 5.0,
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(
        transport.control_writes(),
        vec![vec![0x11, 0x00, 0x00, 0xF4, 0x01, 0x28, 0x33]]
    );
    assert_eq!(ctrl.current_mode(), Some(ControlMode::Simulation));
}

#[tokio::test(start_paused = true)]
async fn test_reset_clears_mode() {
    let transport = Arc::new(MockTransport::with_features(0, POWER));
    let ctrl = discovered(&transport).await;

    ctrl.set_target_power(200.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    ctrl.reset().await.unwrap();

    assert_eq!(ctrl.current_mode(), None);
    assert_eq!(transport.control_writes().last(), Some(&vec![0x01]));
}

#[tokio::test(start_paused = true)]
async fn test_guard_outlasts_slow_mode_switch() {
    let transport = Arc::new(MockTransport::with_features(0, POWER | SIMULATION));
    let ctrl = Arc::new(discovered(&transport).await);
    ctrl.set_target_power(200.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Reset acked on its last retry, simulation target never acked
    for _ in 0..3 {
        transport.push_behavior(AckBehavior::Silent);
    }
    transport.push_behavior(AckBehavior::Success);
    transport.set_behavior(AckBehavior::Silent);

    let switching = {
        let ctrl = ctrl.clone();
        tokio::spawn(async move { ctrl.set_simulation(SimulationParams::default()).await })
    };

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(ctrl.is_busy());
    assert!(matches!(
        ctrl.set_target_power(180.0).await,
        Err(ControlError::Busy)
    ));

    let result = switching.await.unwrap();
    assert!(matches!(result, Err(ControlError::RetriesExhausted)));

    let writes = transport.control_writes();
    assert_eq!(writes.len(), 9);
    assert_eq!(writes[0], vec![0x05, 0xC8, 0x00]);
    assert!(writes[1..5].iter().all(|w| w == &vec![0x01]));
    assert!(writes[5..].iter().all(|w| w[0] == 0x11));
}

#[tokio::test(start_paused = true)]
async fn test_resistance_capped_to_one_byte() {
    let transport = Arc::new(MockTransport::with_features(0, RESISTANCE));
    // Advertised min 0.0, max 100.0, increment 1.0
    transport.set_value(
        SUPPORTED_RESISTANCE_RANGE_UUID,
        vec![0x00, 0x00, 0xE8, 0x03, 0x0A, 0x00],
    );
    let ctrl = discovered(&transport).await;

    ctrl.set_resistance_target(40.0).await.unwrap();

    assert_eq!(transport.control_writes(), vec![vec![0x04, 0xFF]]);
    assert_eq!(ctrl.control_log()[0].requested_value, Some(25.5));
}
