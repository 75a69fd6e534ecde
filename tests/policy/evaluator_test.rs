//! Evaluator ordering, bypass precedence, and failure-policy tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use kubefreezer::clock::{Clock, FixedClock};
use kubefreezer::config::{ConfigCache, FreezeConfig};
use kubefreezer::exemptions::{
    Exemption, ExemptionError, ExemptionSource, ExemptionStore, NewExemption,
};
use kubefreezer::freeze::engine::ScheduleEngine;
use kubefreezer::freeze::schedule::{Schedule, ScheduleSpec};
use kubefreezer::history::{EventFilter, EventType, HistoryRecorder};
use kubefreezer::policy::{AdmissionRequest, Category, Operation, PolicyEvaluator};

fn far_deadline() -> Instant {
    Instant::now() + StdDuration::from_secs(5)
}

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn absolute_schedule(name: &str, start: &str, end: &str) -> Schedule {
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

fn request(namespace: &str, name: &str, user: &str) -> AdmissionRequest {
    AdmissionRequest {
        kind: "Deployment".to_owned(),
        namespace: namespace.to_owned(),
        resource_name: Some(name.to_owned()),
        user: user.to_owned(),
        groups: vec!["system:authenticated".to_owned()],
        annotations: BTreeMap::new(),
        operation: Operation::Update,
    }
}

/// Everything an evaluator test needs, wired over a fixed clock.
struct Fixture {
    evaluator: PolicyEvaluator,
    history: Arc<HistoryRecorder>,
    exemptions: Arc<ExemptionStore>,
    clock: Arc<FixedClock>,
}

fn fixture(config: FreezeConfig, schedules: Vec<Schedule>, now: DateTime<Utc>) -> Fixture {
    let history = Arc::new(HistoryRecorder::default());
    let exemptions = Arc::new(ExemptionStore::new(Arc::clone(&history)));
    let clock = Arc::new(FixedClock::new(now));
    let engine = Arc::new(ScheduleEngine::new());
    for schedule in schedules {
        engine.upsert(schedule);
    }
    let evaluator = PolicyEvaluator::new(
        Arc::new(ConfigCache::new(config)),
        engine,
        Arc::clone(&exemptions) as Arc<dyn ExemptionSource>,
        Arc::clone(&history),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    Fixture {
        evaluator,
        history,
        exemptions,
        clock,
    }
}

/// Store stand-in that always fails.
struct FailingStore;

impl ExemptionSource for FailingStore {
    fn matches(
        &self,
        _namespace: &str,
        _resource_name: Option<&str>,
        _now: DateTime<Utc>,
    ) -> Result<Option<Exemption>, ExemptionError> {
        Err(ExemptionError::StoreUnavailable(
            "backing store offline".to_owned(),
        ))
    }
}

fn fixture_with_failing_store(
    config: FreezeConfig,
    now: DateTime<Utc>,
) -> (PolicyEvaluator, Arc<HistoryRecorder>) {
    let history = Arc::new(HistoryRecorder::default());
    let evaluator = PolicyEvaluator::new(
        Arc::new(ConfigCache::new(config)),
        Arc::new(ScheduleEngine::new()),
        Arc::new(FailingStore),
        Arc::clone(&history),
        Arc::new(FixedClock::new(now)),
    );
    (evaluator, history)
}

fn frozen_holiday_config() -> FreezeConfig {
    FreezeConfig::default()
}

fn holiday_schedules() -> Vec<Schedule> {
    vec![absolute_schedule(
        "holiday",
        "2025-12-24T00:00:00Z",
        "2025-12-26T00:00:00Z",
    )]
}

// ---------- check ordering ----------

#[test]
fn unmonitored_kind_allows_and_stays_out_of_history() {
    let fx = fixture(
        frozen_holiday_config(),
        holiday_schedules(),
        utc(2025, 12, 25, 10, 0, 0),
    );
    let mut req = request("prod", "web", "alice");
    req.kind = "ConfigMap".to_owned();

    let decision = fx.evaluator.evaluate(&req, far_deadline());
    assert!(decision.allow);
    assert_eq!(decision.category, Category::NotMonitored);
    assert!(fx.history.list(None, None).is_empty());
}

#[test]
fn delete_and_connect_pass_even_under_freeze() {
    let fx = fixture(
        frozen_holiday_config(),
        holiday_schedules(),
        utc(2025, 12, 25, 10, 0, 0),
    );
    for operation in [Operation::Delete, Operation::Connect] {
        let mut req = request("prod", "web", "alice");
        req.operation = operation;
        let decision = fx.evaluator.evaluate(&req, far_deadline());
        assert!(decision.allow, "{operation:?}");
        assert_eq!(decision.category, Category::NotMonitored);
    }
}

#[test]
fn annotation_bypass_beats_every_other_state() {
    // Freeze active, user not allowlisted, namespace not exempt; the
    // annotation alone must decide.
    let fx = fixture(
        frozen_holiday_config(),
        holiday_schedules(),
        utc(2025, 12, 25, 10, 0, 0),
    );
    let mut req = request("prod", "web", "alice");
    req.annotations.insert(
        "admission-controller.io/emergency-bypass".to_owned(),
        "TRUE".to_owned(),
    );
    req.annotations.insert(
        "admission-controller.io/emergency-reason".to_owned(),
        "sev1 incident".to_owned(),
    );

    let decision = fx.evaluator.evaluate(&req, far_deadline());
    assert!(decision.allow);
    assert_eq!(decision.category, Category::BypassAnnotation);
    assert!(decision.reason.contains("sev1 incident"));

    let events = fx.history.list(None, None);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].event_type,
        EventType::RequestBypassedAnnotation
    );
}

#[test]
fn non_true_annotation_value_does_not_bypass() {
    let fx = fixture(
        frozen_holiday_config(),
        holiday_schedules(),
        utc(2025, 12, 25, 10, 0, 0),
    );
    let mut req = request("prod", "web", "alice");
    req.annotations.insert(
        "admission-controller.io/emergency-bypass".to_owned(),
        "yes".to_owned(),
    );

    let decision = fx.evaluator.evaluate(&req, far_deadline());
    assert!(!decision.allow);
    assert_eq!(decision.category, Category::Frozen);
}

#[test]
fn group_membership_counts_for_the_allowlist() {
    let config = FreezeConfig {
        bypass_allowed_users: ["release-managers".to_owned()].into(),
        ..FreezeConfig::default()
    };
    let fx = fixture(config, holiday_schedules(), utc(2025, 12, 25, 10, 0, 0));
    let mut req = request("prod", "web", "bob");
    req.groups.push("release-managers".to_owned());

    let decision = fx.evaluator.evaluate(&req, far_deadline());
    assert!(decision.allow);
    assert_eq!(decision.category, Category::BypassUser);
    assert!(decision.reason.contains("release-managers"));
}

#[test]
fn exempt_namespace_passes_before_exemptions_are_consulted() {
    let now = utc(2025, 12, 25, 10, 0, 0);
    let config = FreezeConfig {
        bypass_exempt_namespaces: ["kube-system".to_owned()].into(),
        ..FreezeConfig::default()
    };
    let fx = fixture(config, holiday_schedules(), now);
    // A live exemption also covers the namespace; the namespace step must
    // win, leaving the exemption unconsumed.
    fx.exemptions
        .create(
            NewExemption {
                namespace: "kube-system".to_owned(),
                resource_name: Some("coredns".to_owned()),
                duration_minutes: 60,
                reason: "unused".to_owned(),
                approved_by: "oncall".to_owned(),
            },
            now,
        )
        .expect("valid exemption");

    let decision = fx
        .evaluator
        .evaluate(&request("kube-system", "coredns", "alice"), far_deadline());
    assert!(decision.allow);
    assert_eq!(decision.category, Category::BypassNamespace);

    let kept = fx.exemptions.list(true, now);
    assert_eq!(kept.len(), 1);
    assert!(!kept[0].used);
}

#[test]
fn no_freeze_allows_with_no_history_event() {
    let fx = fixture(frozen_holiday_config(), holiday_schedules(), utc(2025, 11, 1, 0, 0, 0));
    let decision = fx
        .evaluator
        .evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(decision.allow);
    assert_eq!(decision.category, Category::NoFreeze);
    assert!(fx.history.list(None, None).is_empty());
}

// ---------- frozen denials ----------

#[test]
fn denial_records_request_denied_with_scope() {
    let fx = fixture(
        frozen_holiday_config(),
        holiday_schedules(),
        utc(2025, 12, 25, 10, 0, 0),
    );
    let decision = fx
        .evaluator
        .evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(!decision.allow);

    let denied = fx.history.list(
        None,
        Some(&EventFilter {
            event_type: Some(EventType::RequestDenied),
            namespace: None,
        }),
    );
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].namespace.as_deref(), Some("prod"));
    assert_eq!(denied[0].resource_name.as_deref(), Some("web"));
    assert_eq!(denied[0].triggered_by, "alice");
}

#[test]
fn multiple_matching_freezes_compose_in_name_order() {
    let mut schedules = holiday_schedules();
    schedules.push(
        Schedule::from_spec(ScheduleSpec {
            name: "audit".to_owned(),
            message: Some("annual audit window".to_owned()),
            namespaces: None,
            start: Some("2025-12-20T00:00:00Z".to_owned()),
            end: Some("2025-12-31T00:00:00Z".to_owned()),
            cron: None,
            timezone: None,
        })
        .expect("valid schedule"),
    );
    let fx = fixture(frozen_holiday_config(), schedules, utc(2025, 12, 25, 10, 0, 0));

    let decision = fx
        .evaluator
        .evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(!decision.allow);
    let audit_pos = decision.reason.find("audit").expect("audit in reason");
    let holiday_pos = decision.reason.find("holiday").expect("holiday in reason");
    assert!(audit_pos < holiday_pos, "reason: {}", decision.reason);
    assert!(decision.reason.contains("annual audit window"));
}

// ---------- exemptions through the evaluator ----------

#[test]
fn specific_exemption_is_consumed_by_one_admission() {
    let t0 = utc(2025, 12, 25, 9, 0, 0);
    let fx = fixture(frozen_holiday_config(), holiday_schedules(), t0);
    fx.exemptions
        .create(
            NewExemption {
                namespace: "prod".to_owned(),
                resource_name: Some("web".to_owned()),
                duration_minutes: 60,
                reason: "hotfix".to_owned(),
                approved_by: "oncall".to_owned(),
            },
            t0,
        )
        .expect("valid exemption");

    fx.clock.set(t0 + chrono::Duration::minutes(10));
    let first = fx
        .evaluator
        .evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(first.allow);
    assert_eq!(first.category, Category::BypassExemption);

    fx.clock.set(t0 + chrono::Duration::minutes(11));
    let second = fx
        .evaluator
        .evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(!second.allow);
    assert_eq!(second.category, Category::Frozen);
}

#[test]
fn namespace_wide_exemption_keeps_matching() {
    let t0 = utc(2025, 12, 25, 9, 0, 0);
    let fx = fixture(frozen_holiday_config(), holiday_schedules(), t0);
    fx.exemptions
        .create(
            NewExemption {
                namespace: "prod".to_owned(),
                resource_name: None,
                duration_minutes: 60,
                reason: "migration".to_owned(),
                approved_by: "oncall".to_owned(),
            },
            t0,
        )
        .expect("valid exemption");

    for minute in [10, 20, 30] {
        fx.clock.set(t0 + chrono::Duration::minutes(minute));
        let decision = fx
            .evaluator
            .evaluate(&request("prod", "web", "alice"), far_deadline());
        assert!(decision.allow, "minute {minute}");
        assert_eq!(decision.category, Category::BypassExemption);
    }
}

// ---------- determinism ----------

#[test]
fn decision_is_a_pure_function_of_fixed_inputs() {
    let fx = fixture(
        frozen_holiday_config(),
        holiday_schedules(),
        utc(2025, 12, 25, 10, 0, 0),
    );
    let req = request("prod", "web", "alice");

    let first = fx.evaluator.evaluate(&req, far_deadline());
    let second = fx.evaluator.evaluate(&req, far_deadline());
    assert_eq!(first.allow, second.allow);
    assert_eq!(first.category, second.category);
    assert_eq!(first.reason, second.reason);
}

// ---------- internal errors ----------

#[test]
fn failing_store_with_fail_closed_denies() {
    let (evaluator, history) =
        fixture_with_failing_store(FreezeConfig::default(), utc(2025, 12, 25, 10, 0, 0));
    let decision = evaluator.evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(!decision.allow);
    assert_eq!(decision.category, Category::InternalError);

    let errors = history.list(
        None,
        Some(&EventFilter {
            event_type: Some(EventType::EvaluatorError),
            namespace: None,
        }),
    );
    assert_eq!(errors.len(), 1);
}

#[test]
fn failing_store_with_fail_open_admits() {
    let config = FreezeConfig {
        fail_closed: false,
        ..FreezeConfig::default()
    };
    let (evaluator, history) = fixture_with_failing_store(config, utc(2025, 12, 25, 10, 0, 0));
    let decision = evaluator.evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(decision.allow);
    assert_eq!(decision.category, Category::InternalError);
    assert_eq!(history.list(None, None).len(), 1);
}

#[test]
fn blown_deadline_applies_the_fail_policy() {
    let fx = fixture(
        frozen_holiday_config(),
        holiday_schedules(),
        utc(2025, 12, 25, 10, 0, 0),
    );
    let expired = Instant::now() - StdDuration::from_millis(1);
    let decision = fx
        .evaluator
        .evaluate(&request("prod", "web", "alice"), expired);
    assert!(!decision.allow);
    assert_eq!(decision.category, Category::InternalError);

    let errors = fx.history.list(
        None,
        Some(&EventFilter {
            event_type: Some(EventType::EvaluatorError),
            namespace: None,
        }),
    );
    assert_eq!(errors.len(), 1);
}

// ---------- config snapshots ----------

#[test]
fn evaluations_see_one_coherent_snapshot() {
    let history = Arc::new(HistoryRecorder::default());
    let exemptions = Arc::new(ExemptionStore::new(Arc::clone(&history)));
    let clock = Arc::new(FixedClock::new(utc(2025, 12, 25, 10, 0, 0)));
    let cache = Arc::new(ConfigCache::new(FreezeConfig::default()));
    let engine = Arc::new(ScheduleEngine::new());
    for schedule in holiday_schedules() {
        engine.upsert(schedule);
    }
    let evaluator = PolicyEvaluator::new(
        Arc::clone(&cache),
        Arc::clone(&engine),
        exemptions as Arc<dyn ExemptionSource>,
        history,
        clock,
    );

    // Denied under the initial snapshot.
    let before = evaluator.evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(!before.allow);

    // Install a snapshot that exempts the namespace; the next evaluation
    // sees all of it.
    cache.install(FreezeConfig {
        bypass_exempt_namespaces: ["prod".to_owned()].into(),
        ..FreezeConfig::default()
    });
    let after = evaluator.evaluate(&request("prod", "web", "alice"), far_deadline());
    assert!(after.allow);
    assert_eq!(after.category, Category::BypassNamespace);
}
