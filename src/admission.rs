//! Platform admission envelope: wire types and translation.
//!
//! Stateless adapter between the platform's `AdmissionReview` JSON and the
//! evaluator's abstract request/decision types. Denials render as a 403
//! status message; dry-run requests always render allowed, carrying any
//! would-be denial as a warning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::{AdmissionRequest, Decision, Operation};

/// Envelope version rendered on responses.
const API_VERSION: &str = "admission.k8s.io/v1";

/// HTTP status carried on denial messages.
const DENY_CODE: u16 = 403;

// ---------------------------------------------------------------------------
// Inbound wire types
// ---------------------------------------------------------------------------

/// The inbound review envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionReview {
    /// The request body; absent on malformed submissions.
    #[serde(default)]
    pub request: Option<ReviewRequest>,
}

/// The `request` object of an admission review.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReviewRequest {
    /// Platform-assigned request id, echoed on the response.
    pub uid: String,
    /// Kind of the object under review.
    pub kind: GroupKind,
    /// Target namespace.
    pub namespace: String,
    /// Target name; may be empty on generate-name creates.
    pub name: String,
    /// CREATE, UPDATE, DELETE, or CONNECT.
    pub operation: String,
    /// Requesting identity.
    #[serde(rename = "userInfo")]
    pub user_info: UserInfo,
    /// The submitted object; only metadata is inspected.
    pub object: Option<RawObject>,
    /// Dry-run marker; the platform sends a bool, older proxies a list.
    #[serde(rename = "dryRun")]
    pub dry_run: Option<serde_json::Value>,
}

/// Group/version/kind of the object under review.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GroupKind {
    /// API group.
    pub group: String,
    /// API version.
    pub version: String,
    /// Object kind, e.g. `Deployment`.
    pub kind: String,
}

/// Identity attached to the request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    /// Authenticated username.
    pub username: String,
    /// Group memberships.
    pub groups: Vec<String>,
}

/// The submitted object, reduced to what the gate reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawObject {
    /// Object metadata.
    pub metadata: ObjectMeta,
}

/// Metadata of the submitted object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectMeta {
    /// Object name.
    pub name: Option<String>,
    /// Object annotations.
    pub annotations: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Outbound wire types
// ---------------------------------------------------------------------------

/// The outbound review envelope.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionResponseEnvelope {
    /// Envelope API version.
    #[serde(rename = "apiVersion")]
    pub api_version: &'static str,
    /// Always `AdmissionReview`.
    pub kind: &'static str,
    /// The decision.
    pub response: AdmissionResponse,
}

/// The `response` object rendered back to the platform.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionResponse {
    /// Echo of the request uid.
    pub uid: String,
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Denial status; absent on allows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    /// Advisory warnings (dry-run denials).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Status block on denials.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseStatus {
    /// HTTP-style status code.
    pub code: u16,
    /// User-visible denial message.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Extract the evaluator's abstract request from the wire request.
///
/// The resource name prefers `request.name`, falling back to the submitted
/// object's metadata (creates with `generateName` arrive without a
/// top-level name).
pub fn to_admission_request(review: &ReviewRequest) -> AdmissionRequest {
    let metadata = review.object.as_ref().map(|object| &object.metadata);
    let resource_name = if review.name.is_empty() {
        metadata.and_then(|m| m.name.clone()).filter(|n| !n.is_empty())
    } else {
        Some(review.name.clone())
    };

    AdmissionRequest {
        kind: review.kind.kind.clone(),
        namespace: review.namespace.clone(),
        resource_name,
        user: review.user_info.username.clone(),
        groups: review.user_info.groups.clone(),
        annotations: metadata.map(|m| m.annotations.clone()).unwrap_or_default(),
        operation: Operation::parse(&review.operation),
    }
}

/// Whether the request is a dry run.
///
/// The platform sends a bool; tolerate the list and string spellings some
/// proxies produce.
pub fn is_dry_run(review: &ReviewRequest) -> bool {
    match &review.dry_run {
        None => false,
        Some(serde_json::Value::Bool(flag)) => *flag,
        Some(serde_json::Value::Array(items)) => !items.is_empty(),
        Some(serde_json::Value::String(text)) => !text.is_empty(),
        Some(_) => false,
    }
}

/// Render a decision into the response envelope.
///
/// Dry-run requests are always admitted; a decision that would have denied
/// comes back as a warning instead.
pub fn render_response(
    uid: &str,
    decision: &Decision,
    dry_run: bool,
) -> AdmissionResponseEnvelope {
    let response = if decision.allow {
        AdmissionResponse {
            uid: uid.to_owned(),
            allowed: true,
            status: None,
            warnings: Vec::new(),
        }
    } else if dry_run {
        AdmissionResponse {
            uid: uid.to_owned(),
            allowed: true,
            status: None,
            warnings: vec![format!("Would be blocked: {}", decision.reason)],
        }
    } else {
        AdmissionResponse {
            uid: uid.to_owned(),
            allowed: false,
            status: Some(ResponseStatus {
                code: DENY_CODE,
                message: decision.reason.clone(),
            }),
            warnings: Vec::new(),
        }
    };

    AdmissionResponseEnvelope {
        api_version: API_VERSION,
        kind: "AdmissionReview",
        response,
    }
}
