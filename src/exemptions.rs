//! Time-bounded admission exemptions.
//!
//! An exemption authorizes requests in a namespace (optionally a single
//! resource) to pass an active freeze until it expires. Resource-specific
//! exemptions are single-use: the matcher marks them used in the same
//! critical section that returns them, so two concurrent requests can never
//! both consume one. Namespace-wide exemptions stay reusable until expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::history::{EventType, HistoryRecorder, NewEvent};

/// A stored exemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exemption {
    /// Opaque id.
    pub id: String,
    /// Namespace the exemption applies to.
    pub namespace: String,
    /// Specific resource, or `None` for the whole namespace.
    pub resource_name: Option<String>,
    /// Requested lifetime in minutes.
    pub duration_minutes: i64,
    /// Why the exemption was granted.
    pub reason: String,
    /// Who approved it.
    pub approved_by: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Expiry instant; always after `created_at`.
    pub expires_at: DateTime<Utc>,
    /// Whether a resource-specific exemption has authorized an admission.
    pub used: bool,
}

impl Exemption {
    /// True once the exemption's lifetime has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fields supplied when creating an exemption.
#[derive(Debug, Clone, Deserialize)]
pub struct NewExemption {
    /// Namespace the exemption applies to.
    pub namespace: String,
    /// Specific resource, or `None` for the whole namespace.
    #[serde(default)]
    pub resource_name: Option<String>,
    /// Lifetime in minutes; must be positive.
    pub duration_minutes: i64,
    /// Why the exemption is granted.
    pub reason: String,
    /// Who approved it.
    pub approved_by: String,
}

/// Exemption store failures.
#[derive(Debug, Error)]
pub enum ExemptionError {
    /// Rejected at creation; running state is unchanged.
    #[error("invalid exemption: {0}")]
    InvalidInput(String),
    /// The store cannot currently serve queries.
    #[error("exemption store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Read seam used by the policy evaluator.
///
/// The evaluator talks to a trait object so tests can inject a store that
/// fails with [`ExemptionError::StoreUnavailable`].
pub trait ExemptionSource: Send + Sync {
    /// First valid exemption covering `(namespace, resource_name)` at `now`,
    /// consuming resource-specific matches.
    fn matches(
        &self,
        namespace: &str,
        resource_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Exemption>, ExemptionError>;
}

struct Inner {
    by_id: HashMap<String, Exemption>,
    /// Ids per namespace in creation order; drives first-match semantics.
    by_namespace: HashMap<String, Vec<String>>,
}

/// In-memory exemption store with a namespace index.
pub struct ExemptionStore {
    inner: Mutex<Inner>,
    history: Arc<HistoryRecorder>,
}

impl ExemptionStore {
    /// Create an empty store; lifecycle events go to `history`.
    pub fn new(history: Arc<HistoryRecorder>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                by_namespace: HashMap::new(),
            }),
            history,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ExemptionError> {
        self.inner
            .lock()
            .map_err(|e| ExemptionError::StoreUnavailable(format!("lock poisoned: {e}")))
    }

    /// Validate and store a new exemption.
    pub fn create(
        &self,
        new: NewExemption,
        now: DateTime<Utc>,
    ) -> Result<Exemption, ExemptionError> {
        if new.namespace.trim().is_empty() {
            return Err(ExemptionError::InvalidInput(
                "namespace must not be empty".to_owned(),
            ));
        }
        if new.duration_minutes <= 0 {
            return Err(ExemptionError::InvalidInput(format!(
                "duration_minutes must be positive, got {}",
                new.duration_minutes
            )));
        }
        let expires_at = now
            .checked_add_signed(Duration::minutes(new.duration_minutes))
            .filter(|at| *at > now)
            .ok_or_else(|| {
                ExemptionError::InvalidInput("expiry must land in the future".to_owned())
            })?;

        let exemption = Exemption {
            id: Uuid::new_v4().to_string(),
            namespace: new.namespace,
            resource_name: new.resource_name,
            duration_minutes: new.duration_minutes,
            reason: new.reason,
            approved_by: new.approved_by,
            created_at: now,
            expires_at,
            used: false,
        };

        let mut inner = self.lock()?;
        inner
            .by_namespace
            .entry(exemption.namespace.clone())
            .or_default()
            .push(exemption.id.clone());
        inner.by_id.insert(exemption.id.clone(), exemption.clone());
        drop(inner);

        info!(
            id = %exemption.id,
            namespace = %exemption.namespace,
            expires_at = %exemption.expires_at,
            "exemption created"
        );
        self.history.append(NewEvent {
            timestamp: now,
            event_type: EventType::ExemptionCreated,
            reason: exemption.reason.clone(),
            triggered_by: exemption.approved_by.clone(),
            namespace: Some(exemption.namespace.clone()),
            resource_name: exemption.resource_name.clone(),
        });

        Ok(exemption)
    }

    /// Look up an exemption by id, evicting it if already expired.
    pub fn get(&self, id: &str, now: DateTime<Utc>) -> Option<Exemption> {
        let mut inner = self.inner.lock().ok()?;
        if inner.by_id.get(id).is_some_and(|e| e.is_expired(now)) {
            remove_entry(&mut inner, id);
            return None;
        }
        inner.by_id.get(id).cloned()
    }

    /// All exemptions sorted by soonest expiry, optionally live ones only.
    pub fn list(&self, active_only: bool, now: DateTime<Utc>) -> Vec<Exemption> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut out: Vec<Exemption> = inner
            .by_id
            .values()
            .filter(|e| !active_only || !e.is_expired(now))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.expires_at);
        out
    }

    /// Delete an exemption; true when it existed.
    pub fn delete(&self, id: &str, deleted_by: &str, now: DateTime<Utc>) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let Some(removed) = remove_entry(&mut inner, id) else {
            return false;
        };
        drop(inner);

        info!(id = %removed.id, namespace = %removed.namespace, "exemption deleted");
        self.history.append(NewEvent {
            timestamp: now,
            event_type: EventType::ExemptionDeleted,
            reason: removed.reason,
            triggered_by: deleted_by.to_owned(),
            namespace: Some(removed.namespace),
            resource_name: removed.resource_name,
        });
        true
    }

    /// Drop every expired exemption; returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let expired: Vec<String> = inner
            .by_id
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.id.clone())
            .collect();
        for id in &expired {
            remove_entry(&mut inner, id);
        }
        expired.len()
    }
}

impl ExemptionSource for ExemptionStore {
    fn matches(
        &self,
        namespace: &str,
        resource_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Exemption>, ExemptionError> {
        let mut inner = self.lock()?;

        // Lazy eviction: clear out expired entries for this namespace before
        // matching, so an expired record can never win.
        let expired: Vec<String> = inner
            .by_namespace
            .get(namespace)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        inner
                            .by_id
                            .get(id.as_str())
                            .is_some_and(|e| e.is_expired(now))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for id in &expired {
            remove_entry(&mut inner, id);
        }

        let candidate = inner
            .by_namespace
            .get(namespace)
            .and_then(|ids| {
                ids.iter().find(|id| {
                    inner.by_id.get(id.as_str()).is_some_and(|e| {
                        match (&e.resource_name, resource_name) {
                            (None, _) => true,
                            (Some(stored), Some(requested)) => stored == requested && !e.used,
                            (Some(_), None) => false,
                        }
                    })
                })
            })
            .cloned();

        let Some(id) = candidate else {
            return Ok(None);
        };

        // Consume resource-specific matches inside the same critical section.
        let entry = inner
            .by_id
            .get_mut(&id)
            .ok_or_else(|| ExemptionError::StoreUnavailable("index out of sync".to_owned()))?;
        if entry.resource_name.is_some() {
            entry.used = true;
        }
        Ok(Some(entry.clone()))
    }
}

fn remove_entry(inner: &mut Inner, id: &str) -> Option<Exemption> {
    let removed = inner.by_id.remove(id)?;
    if let Some(ids) = inner.by_namespace.get_mut(&removed.namespace) {
        ids.retain(|stored| stored != id);
        if ids.is_empty() {
            inner.by_namespace.remove(&removed.namespace);
        }
    }
    Some(removed)
}
