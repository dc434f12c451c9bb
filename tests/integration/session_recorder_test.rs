//! Integration tests for the session recorder timers on a paused clock.

use ridelink::clock::MonotonicClock;
use ridelink::recording::{
    Environment, MemorySink, MetricKind, RecorderConfig, RecordingStatus, Sample, SessionEvent,
    SessionRecorder, UserProfile,
};
use std::sync::Arc;
use std::time::Duration;

struct Session {
    recorder: SessionRecorder,
    sink: Arc<MemorySink>,
    clock: MonotonicClock,
}

fn session(config: RecorderConfig, profile: UserProfile) -> Session {
    let clock = MonotonicClock::new();
    let sink = Arc::new(MemorySink::new());
    let recorder = SessionRecorder::new(config, Arc::new(profile), sink.clone(), clock);
    Session {
        recorder,
        sink,
        clock,
    }
}

fn power(s: &Session, watts: f64) -> Sample {
    Sample::scalar(MetricKind::Power, watts, s.clock.now_ms())
}

#[tokio::test(start_paused = true)]
async fn test_stats_emitted_every_fast_tick() {
    let s = session(RecorderConfig::default(), UserProfile::default());
    let events = s.recorder.subscribe();
    s.recorder.start().unwrap();
    s.recorder.ingest(power(&s, 200.0));

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let stats: Vec<_> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Stats(stats) => Some(stats),
            _ => None,
        })
        .collect();
    assert_eq!(stats.len(), 3);
    assert_eq!(stats[0].elapsed_ms, 1000);
    assert_eq!(stats[2].elapsed_ms, 3000);
    assert_eq!(stats[2].avg_power, Some(200.0));
}

#[tokio::test(start_paused = true)]
async fn test_pause_excludes_time_from_moving() {
    let s = session(RecorderConfig::default(), UserProfile::default());
    s.recorder.start().unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    s.recorder.pause().unwrap();
    assert_eq!(s.recorder.status(), RecordingStatus::Paused);

    tokio::time::sleep(Duration::from_secs(10)).await;
    s.recorder.resume().unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let stats = s.recorder.stats();
    assert_eq!(stats.elapsed_ms, 13_500);
    assert_eq!(stats.paused_ms, 10_000);
    assert_eq!(stats.moving_ms, 3500);
}

#[tokio::test(start_paused = true)]
async fn test_no_stats_while_paused() {
    let s = session(RecorderConfig::default(), UserProfile::default());
    let events = s.recorder.subscribe();
    s.recorder.start().unwrap();
    s.recorder.pause().unwrap();
    events.drain();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(events
        .drain()
        .iter()
        .all(|e| !matches!(e, SessionEvent::Stats(_))));
}

#[tokio::test(start_paused = true)]
async fn test_finish_without_data_skips_flush() {
    let s = session(RecorderConfig::default(), UserProfile::default());
    s.recorder.start().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let stats = s.recorder.finish().await.unwrap();

    assert_eq!(stats.status, RecordingStatus::Finished);
    assert_eq!(s.sink.flush_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_finish_flushes_pending_and_clears_buffer() {
    let s = session(RecorderConfig::default(), UserProfile::default());
    s.recorder.start().unwrap();
    s.recorder.ingest(power(&s, 180.0));
    tokio::time::sleep(Duration::from_millis(500)).await;
    s.recorder.ingest(power(&s, 220.0));

    s.recorder.finish().await.unwrap();

    assert_eq!(s.sink.flush_count(), 1);
    assert_eq!(s.sink.flushed().len(), 2);
    assert!(s.recorder.buffer().is_empty());
    assert!(s.recorder.finish().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_keeps_recording() {
    let config = RecorderConfig {
        persistence_interval: Duration::from_secs(5),
        ..Default::default()
    };
    let s = session(config, UserProfile::default());
    let events = s.recorder.subscribe();
    s.sink.set_fail_flushes(true);
    s.recorder.start().unwrap();
    s.recorder.ingest(power(&s, 200.0));

    tokio::time::sleep(Duration::from_millis(5500)).await;

    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, SessionEvent::PersistenceError(_))));
    assert_eq!(s.recorder.status(), RecordingStatus::Recording);
    assert_eq!(s.sink.pending_len(), 1);

    s.sink.set_fail_flushes(false);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(s.sink.pending_len(), 0);
    assert_eq!(s.sink.flushed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistence_pass_prunes_buffer() {
    let s = session(RecorderConfig::default(), UserProfile::default());
    s.recorder.start().unwrap();
    s.recorder.ingest(power(&s, 200.0));
    assert_eq!(s.recorder.buffer().len(MetricKind::Power), 1);

    tokio::time::sleep(Duration::from_secs(121)).await;

    assert_eq!(s.recorder.buffer().len(MetricKind::Power), 0);
}

#[tokio::test(start_paused = true)]
async fn test_power_zone_time_accumulates() {
    let profile = UserProfile {
        ftp_watts: Some(200),
        ..Default::default()
    };
    let s = session(RecorderConfig::default(), profile);
    s.recorder.start().unwrap();

    // 130W is zone index 1 (110..150W) at FTP 200
    for _ in 0..10 {
        s.recorder.ingest(power(&s, 130.0));
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = s.recorder.stats();
    assert_eq!(stats.power_zone, Some(1));
    // The first tick only establishes the zone
    assert_eq!(stats.power_zone_ms[1], 4000);
    assert_eq!(stats.power_zone_ms.iter().sum::<u64>(), 4000);
}

#[tokio::test(start_paused = true)]
async fn test_indoor_speed_comes_from_power_model() {
    let profile = UserProfile {
        environment: Environment::Indoor,
        ..Default::default()
    };
    let s = session(RecorderConfig::default(), profile);
    s.recorder.start().unwrap();
    s.recorder.ingest(power(&s, 200.0));

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let stats = s.recorder.stats();
    assert!(stats.speed_kmh.is_some_and(|kmh| kmh > 25.0));
    assert_eq!(
        stats.speed_source,
        Some(ridelink::recording::SpeedSource::Virtual)
    );
}
