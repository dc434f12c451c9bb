//! Unit tests for zone lookup, zone timing and the calorie waterfall.

use ridelink::metrics::calories::{estimate, ActivityCategory, CalorieInputs, CalorieMethod};
use ridelink::metrics::zones::{
    HRZones, PowerZones, ZoneTimer, HR_ZONE_NAMES, MAX_ZONE_DELTA_MS, POWER_ZONE_NAMES,
};

#[test]
fn test_power_zone_boundaries_at_ftp_250() {
    let zones = PowerZones::from_ftp(250);

    // Upper bounds: 137.5, 187.5, 225, 262.5, 300, 375
    assert_eq!(zones.get_zone(0.0), 0);
    assert_eq!(zones.get_zone(137.0), 0);
    assert_eq!(zones.get_zone(137.5), 1);
    assert_eq!(zones.get_zone(225.0), 3);
    assert_eq!(zones.get_zone(250.0), 3);
    assert_eq!(zones.get_zone(374.9), 5);
    assert_eq!(zones.get_zone(375.0), 6);
    assert_eq!(zones.get_zone(1500.0), 6);
}

#[test]
fn test_hr_zone_boundaries() {
    let zones = HRZones::from_threshold(170);

    assert_eq!(zones.get_zone(100.0), 0);
    assert_eq!(zones.get_zone(120.0), 1);
    assert_eq!(zones.get_zone(150.0), 2);
    assert_eq!(zones.get_zone(165.0), 3);
    assert_eq!(zones.get_zone(190.0), 4);
}

#[test]
fn test_zone_counts_match_names() {
    assert_eq!(PowerZones::from_ftp(200).bounds.zone_count(), POWER_ZONE_NAMES.len());
    assert_eq!(HRZones::from_threshold(160).bounds.zone_count(), HR_ZONE_NAMES.len());
}

#[test]
fn test_zone_timer_credits_previous_zone() {
    let mut timer = ZoneTimer::new(5);

    timer.advance(1000, Some(2));
    assert_eq!(timer.buckets(), &[0, 0, 0, 0, 0]);

    timer.advance(1000, Some(3));
    timer.advance(1000, Some(3));
    assert_eq!(timer.buckets(), &[0, 0, 1000, 1000, 0]);
}

#[test]
fn test_zone_timer_discards_long_gaps_and_interruptions() {
    let mut timer = ZoneTimer::new(5);
    timer.advance(1000, Some(1));
    timer.advance(MAX_ZONE_DELTA_MS + 1, Some(1));
    assert_eq!(timer.buckets()[1], 0);

    timer.interrupt();
    timer.advance(1000, Some(1));
    assert_eq!(timer.buckets()[1], 0);

    timer.advance(1000, None);
    assert_eq!(timer.buckets()[1], 1000);
}

#[test]
fn test_calorie_tier_order() {
    let base = CalorieInputs {
        moving_secs: 1800.0,
        distance_m: 15_000.0,
        category: Some(ActivityCategory::Road),
        ..Default::default()
    };

    assert_eq!(estimate(&base).method, CalorieMethod::DistanceAndCategory);

    let with_hr = CalorieInputs {
        avg_hr: Some(140.0),
        ..base.clone()
    };
    assert_eq!(estimate(&with_hr).method, CalorieMethod::HeartRateAndCategory);

    let with_power = CalorieInputs {
        avg_power: Some(180.0),
        ..base.clone()
    };
    assert_eq!(estimate(&with_power).method, CalorieMethod::Power);

    let with_both = CalorieInputs {
        avg_power: Some(180.0),
        avg_hr: Some(140.0),
        ..base
    };
    assert_eq!(estimate(&with_both).method, CalorieMethod::PowerAndHeartRate);
}

#[test]
fn test_calories_grow_with_time() {
    let short = CalorieInputs {
        avg_power: Some(200.0),
        moving_secs: 600.0,
        ..Default::default()
    };
    let long = CalorieInputs {
        moving_secs: 1200.0,
        ..short.clone()
    };

    let a = estimate(&short).kcal;
    let b = estimate(&long).kcal;
    assert!((b - 2.0 * a).abs() < 1e-9);
}
