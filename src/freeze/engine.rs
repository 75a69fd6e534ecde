//! Schedule engine: resolves whether any freeze is active at an instant.
//!
//! The engine owns the schedule set as a copy-on-write map. Writers build a
//! new map and swap it in; an evaluation reads one snapshot and never sees a
//! partially-applied update. The manual override from the config snapshot is
//! folded in here so callers get a single answer.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::FreezeConfig;
use crate::freeze::schedule::Schedule;

/// Name reported for the manual-override pseudo schedule.
pub const MANUAL_SCHEDULE_NAME: &str = "manual";

/// One schedule (or the manual override) found active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeMatch {
    /// Schedule name, or `manual`.
    pub name: String,
    /// Schedule message override, when present.
    pub message: Option<String>,
    /// When this freeze ends, for shapes that know.
    pub end: Option<DateTime<Utc>>,
}

/// Answer to an activity query.
#[derive(Debug, Clone, Default)]
pub struct FreezeStatus {
    /// Matches sorted by name; empty when no freeze is active.
    pub matches: Vec<FreezeMatch>,
}

impl FreezeStatus {
    /// True when at least one freeze matched.
    pub fn active(&self) -> bool {
        !self.matches.is_empty()
    }
}

type ScheduleMap = BTreeMap<String, Arc<Schedule>>;

/// Owner of the freeze schedule set.
pub struct ScheduleEngine {
    schedules: RwLock<Arc<ScheduleMap>>,
}

impl ScheduleEngine {
    /// Create an engine with no schedules.
    pub fn new() -> Self {
        Self {
            schedules: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    /// The current schedule set.
    pub fn snapshot(&self) -> Arc<ScheduleMap> {
        self.schedules
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    /// Insert or replace a schedule by name.
    pub fn upsert(&self, schedule: Schedule) {
        let Ok(mut guard) = self.schedules.write() else {
            return;
        };
        let mut next = (**guard).clone();
        next.insert(schedule.name.clone(), Arc::new(schedule));
        *guard = Arc::new(next);
    }

    /// Remove a schedule; true when it existed.
    pub fn remove(&self, name: &str) -> bool {
        let Ok(mut guard) = self.schedules.write() else {
            return false;
        };
        let mut next = (**guard).clone();
        let removed = next.remove(name).is_some();
        if removed {
            *guard = Arc::new(next);
        }
        removed
    }

    /// Swap in a whole new schedule set.
    ///
    /// Returns the names that appeared and the names that disappeared, so
    /// the watcher can record lifecycle events.
    pub fn replace_all(&self, schedules: Vec<Schedule>) -> (Vec<String>, Vec<String>) {
        let next: ScheduleMap = schedules
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect();

        let Ok(mut guard) = self.schedules.write() else {
            return (Vec::new(), Vec::new());
        };
        let previous = Arc::clone(&guard);
        *guard = Arc::new(next);
        let current = Arc::clone(&guard);
        drop(guard);

        let created = current
            .keys()
            .filter(|name| !previous.contains_key(*name))
            .cloned()
            .collect();
        let deleted = previous
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        (created, deleted)
    }

    /// All schedules (or the manual override) freezing `instant` for the
    /// given namespace. Matches come back sorted by name.
    pub fn is_active(
        &self,
        config: &FreezeConfig,
        instant: DateTime<Utc>,
        namespace: Option<&str>,
    ) -> FreezeStatus {
        let snapshot = self.snapshot();
        let mut matches: Vec<FreezeMatch> = snapshot
            .values()
            .filter(|schedule| schedule.applies_to(namespace) && schedule.is_active_at(instant))
            .map(|schedule| FreezeMatch {
                name: schedule.name.clone(),
                message: schedule.message.clone(),
                end: schedule.window_end(),
            })
            .collect();

        // Manual override: active until freeze_until, or indefinitely when
        // no end is set. A past freeze_until self-clears.
        if config.freeze_enabled {
            let still_on = config.freeze_until.map_or(true, |until| instant < until);
            if still_on {
                matches.push(FreezeMatch {
                    name: MANUAL_SCHEDULE_NAME.to_owned(),
                    message: Some(config.freeze_message.clone()),
                    end: config.freeze_until,
                });
            } else {
                debug!(
                    until = %config.freeze_until.unwrap_or(instant),
                    "manual freeze past its end, reporting inactive"
                );
            }
        }

        matches.sort_by(|a, b| a.name.cmp(&b.name));
        FreezeStatus { matches }
    }
}

impl Default for ScheduleEngine {
    fn default() -> Self {
        Self::new()
    }
}
