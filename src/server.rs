//! Webhook HTTP surface.
//!
//! Three routes: `POST /validate` runs the policy evaluator over an
//! admission review, `GET /healthz` is liveness, and `GET /readyz` reports
//! 503 until the watcher's initial config load has been applied. TLS
//! termination and caller authentication live in front of this process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::debug;

use crate::admission::{self, AdmissionResponseEnvelope, AdmissionReview};
use crate::policy::PolicyEvaluator;

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    /// The decision engine.
    pub evaluator: Arc<PolicyEvaluator>,
    /// Flips once the initial config load has been applied.
    pub ready: Arc<AtomicBool>,
    /// Hard per-request evaluation deadline.
    pub eval_timeout: Duration,
}

/// Build the webhook router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/validate", post(validate))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn validate(
    State(state): State<AppState>,
    Json(review): Json<AdmissionReview>,
) -> Result<Json<AdmissionResponseEnvelope>, (StatusCode, String)> {
    if !state.ready.load(Ordering::Acquire) {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "configuration not loaded yet".to_owned(),
        ));
    }
    let Some(wire_request) = review.request else {
        return Err((
            StatusCode::BAD_REQUEST,
            "admission review has no request".to_owned(),
        ));
    };

    let request = admission::to_admission_request(&wire_request);
    let deadline = Instant::now() + state.eval_timeout;
    let decision = state.evaluator.evaluate(&request, deadline);
    debug!(
        uid = %wire_request.uid,
        kind = %request.kind,
        namespace = %request.namespace,
        allow = decision.allow,
        category = ?decision.category,
        "admission review evaluated"
    );

    let dry_run = admission::is_dry_run(&wire_request);
    Ok(Json(admission::render_response(
        &wire_request.uid,
        &decision,
        dry_run,
    )))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
