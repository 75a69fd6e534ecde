//! The admission decision engine.
//!
//! Maps one admission request plus the current policy state to an
//! allow/deny decision. The check order is the contract: kind filter,
//! operation filter, annotation bypass, user allowlist, namespace
//! exemption, temporary exemption, active freeze, default allow. The first
//! check that fires is final. All shared state is captured as snapshots at
//! entry, so a decision is a pure function of (state, clock, request).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{ConfigCache, FreezeConfig};
use crate::exemptions::{Exemption, ExemptionError, ExemptionSource};
use crate::freeze::engine::{FreezeStatus, ScheduleEngine};
use crate::history::{EventType, HistoryRecorder, NewEvent};

/// Workload operation carried by an admission request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Operation {
    /// Object creation.
    #[default]
    Create,
    /// Object update.
    Update,
    /// Object deletion; passes the gate uninspected.
    Delete,
    /// Subresource connect; passes the gate uninspected.
    Connect,
    /// Anything else the platform may send; passes uninspected.
    Other,
}

impl Operation {
    /// Parse the platform's operation string, case-insensitively.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "CREATE" => Self::Create,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CONNECT" => Self::Connect,
            _ => Self::Other,
        }
    }

    /// Only mutations that land new object state are inspected.
    fn inspected(self) -> bool {
        matches!(self, Self::Create | Self::Update)
    }
}

/// The evaluator's abstract view of an admission request.
#[derive(Debug, Clone, Default)]
pub struct AdmissionRequest {
    /// Resource kind, as the platform spells it.
    pub kind: String,
    /// Target namespace.
    pub namespace: String,
    /// Target resource name, when known.
    pub resource_name: Option<String>,
    /// Requesting identity.
    pub user: String,
    /// Groups of the requesting identity.
    pub groups: Vec<String>,
    /// Annotations on the submitted object.
    pub annotations: BTreeMap<String, String>,
    /// Requested operation.
    pub operation: Operation,
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// The kind or operation is outside the gate's scope.
    NotMonitored,
    /// Allowed by the emergency bypass annotation.
    BypassAnnotation,
    /// Allowed by the user/group allowlist.
    BypassUser,
    /// Allowed because the namespace is exempt.
    BypassNamespace,
    /// Allowed by a temporary exemption.
    BypassExemption,
    /// Denied by an active freeze.
    Frozen,
    /// Allowed; nothing is frozen.
    NoFreeze,
    /// An internal error occurred; the fail policy decided.
    InternalError,
}

/// Outcome of an evaluation.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Admit the request?
    pub allow: bool,
    /// User-visible explanation.
    pub reason: String,
    /// Which check decided.
    pub category: Category,
}

impl Decision {
    fn allow(category: Category, reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
            category,
        }
    }

    fn deny(category: Category, reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
            category,
        }
    }
}

/// Internal evaluation failures; never shown to the requester directly.
#[derive(Debug, Error)]
pub enum EvalError {
    /// A backing store could not serve the evaluation.
    #[error(transparent)]
    Store(#[from] ExemptionError),
    /// The caller's hard deadline passed mid-evaluation.
    #[error("evaluation deadline exceeded")]
    DeadlineExceeded,
}

/// The policy evaluator.
///
/// Cheap to share: everything inside is an `Arc`. One instance serves all
/// concurrent webhook workers.
pub struct PolicyEvaluator {
    cache: Arc<ConfigCache>,
    engine: Arc<ScheduleEngine>,
    exemptions: Arc<dyn ExemptionSource>,
    history: Arc<HistoryRecorder>,
    clock: Arc<dyn Clock>,
}

impl PolicyEvaluator {
    /// Wire an evaluator over the shared policy state.
    pub fn new(
        cache: Arc<ConfigCache>,
        engine: Arc<ScheduleEngine>,
        exemptions: Arc<dyn ExemptionSource>,
        history: Arc<HistoryRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            engine,
            exemptions,
            history,
            clock,
        }
    }

    /// Decide one admission request.
    ///
    /// `deadline` is the caller's hard limit (the platform's admission
    /// timeout). Runs to completion synchronously; on an internal error or
    /// a blown deadline the config's fail policy picks the outcome and an
    /// `EVALUATOR_ERROR` event is recorded.
    pub fn evaluate(&self, request: &AdmissionRequest, deadline: Instant) -> Decision {
        let config = self.cache.snapshot();
        let now = self.clock.now();

        match self.evaluate_inner(request, &config, now, deadline) {
            Ok(decision) => {
                self.record_decision(request, &decision, now);
                decision
            }
            Err(e) => {
                warn!(
                    error = %e,
                    kind = %request.kind,
                    namespace = %request.namespace,
                    fail_closed = config.fail_closed,
                    "evaluator internal error"
                );
                self.history.append(NewEvent {
                    timestamp: now,
                    event_type: EventType::EvaluatorError,
                    reason: e.to_string(),
                    triggered_by: request.user.clone(),
                    namespace: Some(request.namespace.clone()),
                    resource_name: request.resource_name.clone(),
                });
                if config.fail_closed {
                    Decision::deny(
                        Category::InternalError,
                        "freeze gate internal error; denying (fail-closed)",
                    )
                } else {
                    Decision::allow(
                        Category::InternalError,
                        "freeze gate internal error; admitting (fail-open)",
                    )
                }
            }
        }
    }

    fn evaluate_inner(
        &self,
        request: &AdmissionRequest,
        config: &FreezeConfig,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<Decision, EvalError> {
        check_deadline(deadline)?;

        // 1. Kind filter.
        if !config.monitors_kind(&request.kind) {
            return Ok(Decision::allow(
                Category::NotMonitored,
                format!("kind {} is not monitored", request.kind),
            ));
        }

        // 2. Operation filter.
        if !request.operation.inspected() {
            return Ok(Decision::allow(
                Category::NotMonitored,
                format!("operation {:?} is not inspected", request.operation),
            ));
        }

        // 3. Annotation bypass.
        check_deadline(deadline)?;
        if let Some(value) = request.annotations.get(&config.bypass_annotation_key) {
            if value.eq_ignore_ascii_case("true") {
                let reason = request
                    .annotations
                    .get(&config.bypass_reason_key())
                    .cloned()
                    .unwrap_or_else(|| "emergency bypass annotation present".to_owned());
                return Ok(Decision::allow(
                    Category::BypassAnnotation,
                    format!("annotation bypass: {reason}"),
                ));
            }
        }

        // 4. User allowlist; groups count as identities too.
        if config.bypass_allowed_users.contains(&request.user) {
            return Ok(Decision::allow(
                Category::BypassUser,
                format!("user {} is in the bypass allowlist", request.user),
            ));
        }
        for group in &request.groups {
            if config.bypass_allowed_users.contains(group) {
                return Ok(Decision::allow(
                    Category::BypassUser,
                    format!("group {group} is in the bypass allowlist"),
                ));
            }
        }

        // 5. Namespace exemption.
        if config.bypass_exempt_namespaces.contains(&request.namespace) {
            return Ok(Decision::allow(
                Category::BypassNamespace,
                format!("namespace {} is exempt from freezes", request.namespace),
            ));
        }

        // 6. Temporary exemption; a resource-specific match is consumed here.
        check_deadline(deadline)?;
        if let Some(exemption) =
            self.exemptions
                .matches(&request.namespace, request.resource_name.as_deref(), now)?
        {
            return Ok(Decision::allow(
                Category::BypassExemption,
                exemption_reason(&exemption),
            ));
        }

        // 7. Active freeze check.
        check_deadline(deadline)?;
        let status = self
            .engine
            .is_active(config, now, Some(request.namespace.as_str()));
        if status.active() {
            return Ok(Decision::deny(
                Category::Frozen,
                frozen_reason(config, &status),
            ));
        }

        // 8. Default.
        Ok(Decision::allow(Category::NoFreeze, "no freeze active"))
    }

    fn record_decision(&self, request: &AdmissionRequest, decision: &Decision, now: DateTime<Utc>) {
        let event_type = match decision.category {
            Category::Frozen => EventType::RequestDenied,
            Category::BypassAnnotation => EventType::RequestBypassedAnnotation,
            Category::BypassUser => EventType::RequestBypassedUser,
            Category::BypassNamespace => EventType::RequestBypassedNamespace,
            Category::BypassExemption => EventType::RequestBypassedExemption,
            // Routine allows stay out of the bounded ring; the error path
            // records its own event.
            Category::NotMonitored | Category::NoFreeze | Category::InternalError => {
                debug!(
                    category = ?decision.category,
                    kind = %request.kind,
                    namespace = %request.namespace,
                    "request admitted"
                );
                return;
            }
        };
        self.history.append(NewEvent {
            timestamp: now,
            event_type,
            reason: decision.reason.clone(),
            triggered_by: request.user.clone(),
            namespace: Some(request.namespace.clone()),
            resource_name: request.resource_name.clone(),
        });
    }
}

fn check_deadline(deadline: Instant) -> Result<(), EvalError> {
    if Instant::now() >= deadline {
        return Err(EvalError::DeadlineExceeded);
    }
    Ok(())
}

fn exemption_reason(exemption: &Exemption) -> String {
    format!(
        "temporary exemption: {} (approved by {}, expires {})",
        exemption.reason,
        exemption.approved_by,
        exemption.expires_at.to_rfc3339(),
    )
}

/// Compose the denial message from every matching freeze, in name order.
fn frozen_reason(config: &FreezeConfig, status: &FreezeStatus) -> String {
    let parts: Vec<String> = status
        .matches
        .iter()
        .map(|m| {
            let message = m.message.as_deref().unwrap_or(&config.freeze_message);
            format!("{}: {}", m.name, message)
        })
        .collect();
    parts.join("; ")
}
