//! Schedule engine tests: activity queries, manual override, and
//! copy-on-write set replacement.

use chrono::{DateTime, TimeZone, Utc};

use kubefreezer::config::FreezeConfig;
use kubefreezer::freeze::engine::{ScheduleEngine, MANUAL_SCHEDULE_NAME};
use kubefreezer::freeze::schedule::{Schedule, ScheduleSpec};

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

fn absolute(name: &str, start: &str, end: &str) -> Schedule {
    Schedule::from_spec(ScheduleSpec {
        name: name.to_owned(),
        message: None,
        namespaces: None,
        start: Some(start.to_owned()),
        end: Some(end.to_owned()),
        cron: None,
        timezone: None,
    })
    .expect("valid schedule")
}

#[test]
fn inactive_with_no_schedules_and_no_override() {
    let engine = ScheduleEngine::new();
    let status = engine.is_active(&FreezeConfig::default(), utc(2025, 6, 1, 12, 0), None);
    assert!(!status.active());
}

#[test]
fn absolute_schedule_activates_within_window() {
    let engine = ScheduleEngine::new();
    engine.upsert(absolute(
        "holiday",
        "2025-12-24T00:00:00Z",
        "2025-12-26T00:00:00Z",
    ));

    let config = FreezeConfig::default();
    let status = engine.is_active(&config, utc(2025, 12, 25, 10, 0), Some("prod"));
    assert!(status.active());
    assert_eq!(status.matches[0].name, "holiday");

    let status = engine.is_active(&config, utc(2025, 12, 27, 0, 0), Some("prod"));
    assert!(!status.active());
}

#[test]
fn manual_override_reports_synthetic_match() {
    let engine = ScheduleEngine::new();
    let config = FreezeConfig {
        freeze_enabled: true,
        freeze_message: "All change is frozen".to_owned(),
        ..FreezeConfig::default()
    };

    let status = engine.is_active(&config, utc(2025, 6, 1, 12, 0), None);
    assert!(status.active());
    assert_eq!(status.matches[0].name, MANUAL_SCHEDULE_NAME);
    assert_eq!(
        status.matches[0].message.as_deref(),
        Some("All change is frozen")
    );
}

#[test]
fn manual_override_self_clears_after_freeze_until() {
    let engine = ScheduleEngine::new();
    let config = FreezeConfig {
        freeze_enabled: true,
        freeze_until: Some(utc(2025, 6, 1, 12, 0)),
        ..FreezeConfig::default()
    };

    assert!(engine
        .is_active(&config, utc(2025, 6, 1, 11, 59), None)
        .active());
    assert!(!engine
        .is_active(&config, utc(2025, 6, 1, 12, 0), None)
        .active());
}

#[test]
fn matches_come_back_sorted_by_name() {
    let engine = ScheduleEngine::new();
    engine.upsert(absolute(
        "zeta",
        "2025-06-01T00:00:00Z",
        "2025-07-01T00:00:00Z",
    ));
    engine.upsert(absolute(
        "alpha",
        "2025-06-01T00:00:00Z",
        "2025-07-01T00:00:00Z",
    ));
    let config = FreezeConfig {
        freeze_enabled: true,
        ..FreezeConfig::default()
    };

    let status = engine.is_active(&config, utc(2025, 6, 15, 0, 0), None);
    let names: Vec<&str> = status.matches.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "manual", "zeta"]);
}

#[test]
fn namespace_scoped_schedule_skips_other_namespaces() {
    let engine = ScheduleEngine::new();
    let scoped = Schedule::from_spec(ScheduleSpec {
        name: "prod-only".to_owned(),
        message: None,
        namespaces: Some(vec!["prod".to_owned()]),
        start: Some("2025-06-01T00:00:00Z".to_owned()),
        end: Some("2025-07-01T00:00:00Z".to_owned()),
        cron: None,
        timezone: None,
    })
    .expect("valid");
    engine.upsert(scoped);

    let config = FreezeConfig::default();
    assert!(engine
        .is_active(&config, utc(2025, 6, 15, 0, 0), Some("prod"))
        .active());
    assert!(!engine
        .is_active(&config, utc(2025, 6, 15, 0, 0), Some("dev"))
        .active());
}

#[test]
fn replace_all_reports_created_and_deleted() {
    let engine = ScheduleEngine::new();
    engine.upsert(absolute(
        "old",
        "2025-06-01T00:00:00Z",
        "2025-07-01T00:00:00Z",
    ));

    let (created, deleted) = engine.replace_all(vec![
        absolute("old", "2025-06-01T00:00:00Z", "2025-07-01T00:00:00Z"),
        absolute("new", "2025-08-01T00:00:00Z", "2025-09-01T00:00:00Z"),
    ]);
    assert_eq!(created, vec!["new".to_owned()]);
    assert!(deleted.is_empty());

    let (created, deleted) = engine.replace_all(Vec::new());
    assert!(created.is_empty());
    assert_eq!(deleted.len(), 2);
}

#[test]
fn readers_keep_their_snapshot_during_replace() {
    let engine = ScheduleEngine::new();
    engine.upsert(absolute(
        "only",
        "2025-06-01T00:00:00Z",
        "2025-07-01T00:00:00Z",
    ));

    let before = engine.snapshot();
    engine.replace_all(Vec::new());

    assert_eq!(before.len(), 1);
    assert!(engine.snapshot().is_empty());
}

#[test]
fn remove_returns_whether_present() {
    let engine = ScheduleEngine::new();
    engine.upsert(absolute(
        "gone",
        "2025-06-01T00:00:00Z",
        "2025-07-01T00:00:00Z",
    ));
    assert!(engine.remove("gone"));
    assert!(!engine.remove("gone"));
}
