//! Bounded freeze-event history.
//!
//! A fixed-capacity ring of decision and lifecycle events, guarded by one
//! mutex. Appends evict the oldest entry on overflow; listing returns
//! most-recent-first. The ring can be rehydrated from the watched history
//! object at startup and serialised back for an external flusher.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default event-ring capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Kind of recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Manual freeze switched on.
    FreezeEnabled,
    /// Manual freeze switched off.
    FreezeDisabled,
    /// An admission request was denied by an active freeze.
    RequestDenied,
    /// A request passed via the bypass annotation.
    RequestBypassedAnnotation,
    /// A request passed via the user/group allowlist.
    RequestBypassedUser,
    /// A request passed because its namespace is exempt.
    RequestBypassedNamespace,
    /// A request passed via a temporary exemption.
    RequestBypassedExemption,
    /// A temporary exemption was created.
    ExemptionCreated,
    /// A temporary exemption was deleted.
    ExemptionDeleted,
    /// A freeze schedule appeared in the watched set.
    ScheduleCreated,
    /// A freeze schedule disappeared from the watched set.
    ScheduleDeleted,
    /// A watched config payload failed to parse; previous state retained.
    ConfigInvalid,
    /// The evaluator hit an internal error and applied the fail policy.
    EvaluatorError,
}

/// A recorded event.
///
/// `seq` is assigned under the recorder lock and strictly increases, breaking
/// ties between events stamped within the same instant. It is not part of
/// the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Opaque event id.
    pub id: String,
    /// Event kind.
    pub event_type: EventType,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Human-readable cause.
    pub reason: String,
    /// Identity that triggered the event.
    pub triggered_by: String,
    /// Affected namespace, when scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Affected resource, when scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    /// Monotonic append counter; internal ordering tiebreaker.
    #[serde(skip)]
    pub seq: u64,
}

/// Event fields supplied by callers; id and sequence come from the recorder.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// When the event happened (caller's clock).
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    pub event_type: EventType,
    /// Human-readable cause.
    pub reason: String,
    /// Identity that triggered the event.
    pub triggered_by: String,
    /// Affected namespace, when scoped.
    pub namespace: Option<String>,
    /// Affected resource, when scoped.
    pub resource_name: Option<String>,
}

/// Filter for [`HistoryRecorder::list`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Keep only this event kind.
    pub event_type: Option<EventType>,
    /// Keep only events scoped to this namespace (unscoped events pass).
    pub namespace: Option<String>,
}

struct Ring {
    events: VecDeque<HistoryEvent>,
    next_seq: u64,
}

/// Concurrency-safe bounded event log.
pub struct HistoryRecorder {
    inner: Mutex<Ring>,
    capacity: usize,
}

impl HistoryRecorder {
    /// Create an empty recorder bounded at `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append an event, evicting the oldest entry when full.
    pub fn append(&self, event: NewEvent) {
        let Ok(mut ring) = self.inner.lock() else {
            return;
        };
        let seq = ring.next_seq;
        ring.next_seq += 1;
        if ring.events.len() == self.capacity {
            ring.events.pop_front();
        }
        ring.events.push_back(HistoryEvent {
            id: Uuid::new_v4().to_string(),
            event_type: event.event_type,
            timestamp: event.timestamp,
            reason: event.reason,
            triggered_by: event.triggered_by,
            namespace: event.namespace,
            resource_name: event.resource_name,
            seq,
        });
    }

    /// Events most-recent-first, optionally filtered and limited.
    pub fn list(&self, limit: Option<usize>, filter: Option<&EventFilter>) -> Vec<HistoryEvent> {
        let Ok(ring) = self.inner.lock() else {
            return Vec::new();
        };
        let mut out: Vec<HistoryEvent> = ring
            .events
            .iter()
            .rev()
            .filter(|e| match filter {
                Some(f) => {
                    f.event_type.map_or(true, |t| e.event_type == t)
                        && f.namespace.as_ref().map_or(true, |ns| {
                            e.namespace.as_deref().map_or(true, |ens| ens == ns)
                        })
                }
                None => true,
            })
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|ring| ring.events.len()).unwrap_or(0)
    }

    /// True when no events are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the ring with persisted events, keeping the newest `capacity`.
    ///
    /// Events are ordered by timestamp before sequence numbers are
    /// reassigned, so ties keep their input order. Returns how many events
    /// were retained.
    pub fn hydrate(&self, mut events: Vec<HistoryEvent>) -> usize {
        events.sort_by_key(|e| e.timestamp);
        if events.len() > self.capacity {
            events.drain(..events.len() - self.capacity);
        }
        let Ok(mut ring) = self.inner.lock() else {
            return 0;
        };
        ring.events.clear();
        ring.next_seq = 0;
        for mut event in events {
            event.seq = ring.next_seq;
            ring.next_seq += 1;
            ring.events.push_back(event);
        }
        ring.events.len()
    }

    /// Parse the watched history payload (a JSON array) and hydrate from it.
    pub fn hydrate_json(&self, raw: &str) -> Result<usize, serde_json::Error> {
        let events: Vec<HistoryEvent> = serde_json::from_str(raw)?;
        Ok(self.hydrate(events))
    }

    /// Serialise the ring oldest-first for an external flusher.
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        let events: Vec<HistoryEvent> = self
            .inner
            .lock()
            .map(|ring| ring.events.iter().cloned().collect())
            .unwrap_or_default();
        serde_json::to_string(&events)
    }
}

impl Default for HistoryRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
