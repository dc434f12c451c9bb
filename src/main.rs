//! RideLink - headless ride recorder
//!
//! Connects to the remembered sensors and any device ids given on the command
//! line, records a session and logs its statistics until Ctrl-C.

use anyhow::Context;
use ridelink::clock::MonotonicClock;
use ridelink::recording::{MemorySink, RecorderConfig, SessionEvent, SessionRecorder};
use ridelink::sensors::types::{ControlConfig, SensorConfig, SensorEvent};
use ridelink::sensors::SensorManager;
use ridelink::storage::config::load_config;
use ridelink::storage::known_devices::SqliteKnownDevices;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RideLink v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config().context("loading configuration")?;
    let known = Arc::new(
        SqliteKnownDevices::open(&config.known_devices_path())
            .context("opening known-device store")?,
    );
    let clock = MonotonicClock::new();

    let mut sensors = SensorManager::new(
        SensorConfig::from(&config.sensors),
        ControlConfig::from(&config.control),
        known,
        clock,
    );
    let sensor_events = sensors.subscribe();
    sensors
        .initialize()
        .await
        .context("initializing Bluetooth")?;

    sensors.restore_known_devices().await?;

    for device_id in std::env::args().skip(1) {
        if let Err(e) = sensors.connect(&device_id).await {
            tracing::warn!("Could not connect to {}: {}", device_id, e);
        }
    }

    let recorder = SessionRecorder::new(
        RecorderConfig::from(&config.recording),
        Arc::new(config.profile.clone()),
        Arc::new(MemorySink::new()),
        clock,
    );
    let session_events = recorder.subscribe();
    recorder.start()?;

    let mut drain = tokio::time::interval(DRAIN_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = drain.tick() => {
                for event in sensor_events.drain() {
                    match event {
                        SensorEvent::Reading { sample, .. } => recorder.ingest(sample),
                        SensorEvent::ConnectionChanged { device_id, state } => {
                            tracing::info!("{}: {}", device_id, state);
                        }
                        _ => {}
                    }
                }
                for event in session_events.drain() {
                    match event {
                        SessionEvent::Stats(stats) => tracing::info!(
                            "{}s moving, {:.0} m, {:?} W, {:?} bpm, {:.0} kcal",
                            stats.moving_ms / 1000,
                            stats.distance_m,
                            stats.avg_power,
                            stats.avg_hr,
                            stats.calories
                        ),
                        SessionEvent::PersistenceError(e) => tracing::warn!("Persistence: {}", e),
                        _ => {}
                    }
                }
            }
        }
    }

    let stats = recorder.finish().await?;
    sensors.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
