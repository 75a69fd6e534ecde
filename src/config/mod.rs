//! Freeze policy configuration: immutable snapshot, key-value parsing, and
//! the atomically-swapped cache.
//!
//! Configuration arrives as the string map of a watched cluster config
//! object. Parsing builds a fully-validated [`FreezeConfig`]; a parse
//! failure leaves the previous snapshot in place (the watcher records the
//! failure). Readers clone one `Arc` per evaluation and never observe a
//! half-applied change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

/// Annotation consulted for the per-resource emergency bypass.
pub const DEFAULT_BYPASS_ANNOTATION_KEY: &str = "admission-controller.io/emergency-bypass";

/// Denial message used when neither the config nor a schedule provides one.
pub const DEFAULT_FREEZE_MESSAGE: &str =
    "Deployment freeze is active. Use bypass annotation or contact oncall.";

/// Kinds monitored when the config object does not list any.
pub const DEFAULT_MONITORED_KIND: &str = "deployments";

/// Configuration parse failures. The running snapshot is never replaced by
/// a payload that produced one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A key's value does not parse as its expected type.
    #[error("invalid value for `{key}`: {detail}")]
    InvalidValue {
        /// Offending config key.
        key: String,
        /// What went wrong.
        detail: String,
    },
    /// The schedule list payload is not a JSON array of schedules.
    #[error("malformed schedule list: {0}")]
    MalformedScheduleList(String),
    /// A schedule entry is invalid.
    #[error("invalid schedule `{name}`: {detail}")]
    InvalidSchedule {
        /// Schedule name, or `<unnamed>`.
        name: String,
        /// What went wrong.
        detail: String,
    },
}

/// One immutable view of the freeze policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeConfig {
    /// Manual override: freeze everything while set.
    pub freeze_enabled: bool,
    /// Optional end of the manual freeze; in the past it self-clears.
    pub freeze_until: Option<DateTime<Utc>>,
    /// Default user-visible denial message.
    pub freeze_message: String,
    /// Annotation whose truthy value bypasses per-resource.
    pub bypass_annotation_key: String,
    /// Identities (users or groups) whose requests always pass.
    pub bypass_allowed_users: BTreeSet<String>,
    /// Namespaces never frozen.
    pub bypass_exempt_namespaces: BTreeSet<String>,
    /// Lowercased resource kinds the gate inspects.
    pub monitored_kinds: BTreeSet<String>,
    /// On evaluator internal error: deny (true) or admit (false).
    pub fail_closed: bool,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            freeze_enabled: false,
            freeze_until: None,
            freeze_message: DEFAULT_FREEZE_MESSAGE.to_owned(),
            bypass_annotation_key: DEFAULT_BYPASS_ANNOTATION_KEY.to_owned(),
            bypass_allowed_users: BTreeSet::new(),
            bypass_exempt_namespaces: BTreeSet::new(),
            monitored_kinds: BTreeSet::from([DEFAULT_MONITORED_KIND.to_owned()]),
            fail_closed: true,
        }
    }
}

impl FreezeConfig {
    /// Build a snapshot from the watched config object's string map.
    ///
    /// Missing keys take their defaults; unknown keys are ignored. Any value
    /// that fails to parse rejects the whole payload.
    pub fn from_object(data: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let freeze_enabled = parse_bool(data, "freeze_enabled", false)?;
        let freeze_until = match data.get("freeze_until").map(String::as_str) {
            None | Some("") => None,
            Some(raw) => Some(parse_instant(raw).map_err(|detail| ConfigError::InvalidValue {
                key: "freeze_until".to_owned(),
                detail,
            })?),
        };

        let freeze_message = data
            .get("freeze_message")
            .filter(|m| !m.trim().is_empty())
            .cloned()
            .unwrap_or(defaults.freeze_message);
        let bypass_annotation_key = data
            .get("bypass_annotation_key")
            .filter(|k| !k.trim().is_empty())
            .cloned()
            .unwrap_or(defaults.bypass_annotation_key);

        let bypass_allowed_users = parse_lines(data.get("bypass_allowed_users"));
        let bypass_exempt_namespaces = parse_lines(data.get("bypass_exempt_namespaces"));

        let mut monitored_kinds: BTreeSet<String> = parse_lines(data.get("monitored_resources"))
            .into_iter()
            .map(|kind| kind.to_ascii_lowercase())
            .collect();
        if monitored_kinds.is_empty() {
            monitored_kinds = defaults.monitored_kinds;
        }

        let fail_closed = parse_bool(data, "fail_closed", true)?;

        Ok(Self {
            freeze_enabled,
            freeze_until,
            freeze_message,
            bypass_annotation_key,
            bypass_allowed_users,
            bypass_exempt_namespaces,
            monitored_kinds,
            fail_closed,
        })
    }

    /// Whether the gate inspects this resource kind.
    ///
    /// Comparison is case-insensitive and accepts both the platform's
    /// singular kind spelling and the plural form operators tend to write in
    /// config (`Deployment` matches `deployments`).
    pub fn monitors_kind(&self, kind: &str) -> bool {
        let kind = kind.to_ascii_lowercase();
        if self.monitored_kinds.contains(&kind) {
            return true;
        }
        self.monitored_kinds.contains(&pluralize(&kind))
    }

    /// Companion annotation carrying the operator-supplied bypass reason.
    ///
    /// Derived from the bypass key by swapping its final path segment for
    /// `emergency-reason`; a key with no path prefix is used whole as the
    /// prefix.
    pub fn bypass_reason_key(&self) -> String {
        match self.bypass_annotation_key.rsplit_once('/') {
            Some((prefix, _)) => format!("{prefix}/emergency-reason"),
            None => format!("{}/emergency-reason", self.bypass_annotation_key),
        }
    }
}

fn pluralize(kind: &str) -> String {
    if let Some(stem) = kind.strip_suffix('y') {
        format!("{stem}ies")
    } else if kind.ends_with('s') {
        kind.to_owned()
    } else {
        format!("{kind}s")
    }
}

fn parse_bool(
    data: &BTreeMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match data.get(key).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(raw) if raw.eq_ignore_ascii_case("true") => Ok(true),
        Some(raw) if raw.eq_ignore_ascii_case("false") => Ok(false),
        Some(raw) => Err(ConfigError::InvalidValue {
            key: key.to_owned(),
            detail: format!("expected true/false, got `{raw}`"),
        }),
    }
}

/// Split a newline-delimited list value into a set.
///
/// Blank lines and `#` comments are skipped; a leading `- ` is tolerated so
/// YAML-style lists pasted into the config object still parse.
fn parse_lines(value: Option<&String>) -> BTreeSet<String> {
    value
        .map(|raw| {
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(|line| line.strip_prefix("- ").unwrap_or(line).trim().to_owned())
                .filter(|line| !line.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse an instant: RFC 3339, or a bare datetime assumed UTC.
pub(crate) fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("`{raw}` is not an RFC 3339 timestamp"))
}

/// Holder of the current [`FreezeConfig`] snapshot.
///
/// Single writer (the config watcher), many readers. A reader's `Arc` stays
/// valid across any number of installs; there is no in-place mutation.
pub struct ConfigCache {
    current: RwLock<Arc<FreezeConfig>>,
}

impl ConfigCache {
    /// Create a cache holding `initial`.
    pub fn new(initial: FreezeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<FreezeConfig> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|_| Arc::new(FreezeConfig::default()))
    }

    /// Atomically install a new snapshot, returning the one it replaced.
    pub fn install(&self, config: FreezeConfig) -> Arc<FreezeConfig> {
        match self.current.write() {
            Ok(mut guard) => std::mem::replace(&mut guard, Arc::new(config)),
            Err(_) => Arc::new(FreezeConfig::default()),
        }
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new(FreezeConfig::default())
    }
}
