//! Watches cluster config objects and applies them to the running state.
//!
//! The watcher consumes a [`ConfigStream`] of change notifications, parses
//! each payload, and atomically installs the result into the config cache
//! and schedule engine. A payload that fails to parse leaves the previous
//! state untouched and records a `CONFIG_INVALID` event. Identical repeated
//! payloads are applied at most once. Stream disconnects retry with capped
//! exponential backoff.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ConfigCache, FreezeConfig};
use crate::freeze::engine::ScheduleEngine;
use crate::freeze::schedule::parse_schedule_list;
use crate::history::{EventType, HistoryRecorder, NewEvent};

/// First retry delay after a stream disconnect.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Retry delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Identity recorded on watcher-originated history events.
const WATCHER_IDENTITY: &str = "config-watcher";

/// Stream failures.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Transient; the watcher backs off and resubscribes.
    #[error("config stream disconnected: {0}")]
    Disconnected(String),
    /// The stream will not deliver again; the watcher stops.
    #[error("config stream closed")]
    Closed,
}

/// One change notification from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigUpdate {
    /// The policy config object: a string key-value map.
    Policy(BTreeMap<String, String>),
    /// The schedule list object: raw JSON array payload.
    Schedules(String),
    /// The history object: raw JSON array payload, used for startup
    /// hydration.
    History(String),
}

/// Source of config change notifications.
#[async_trait]
pub trait ConfigStream: Send {
    /// Wait for the next update.
    async fn next_update(&mut self) -> Result<ConfigUpdate, StreamError>;
}

/// Applies config updates to the cache, engine, and history recorder.
pub struct ConfigWatcher {
    cache: Arc<ConfigCache>,
    engine: Arc<ScheduleEngine>,
    history: Arc<HistoryRecorder>,
    clock: Arc<dyn Clock>,
    ready: Arc<AtomicBool>,
    last_policy: Option<BTreeMap<String, String>>,
    last_schedules: Option<String>,
    last_history: Option<String>,
    hydrated: bool,
}

impl ConfigWatcher {
    /// Create a watcher that installs into the given components.
    pub fn new(
        cache: Arc<ConfigCache>,
        engine: Arc<ScheduleEngine>,
        history: Arc<HistoryRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            engine,
            history,
            clock,
            ready: Arc::new(AtomicBool::new(false)),
            last_policy: None,
            last_schedules: None,
            last_history: None,
            hydrated: false,
        }
    }

    /// Flag that flips once the initial policy load has been applied.
    ///
    /// The admission surface must not accept traffic before this is set.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Consume the stream until it closes.
    pub async fn run(mut self, mut stream: impl ConfigStream) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match stream.next_update().await {
                Ok(update) => {
                    backoff = INITIAL_BACKOFF;
                    self.apply(update);
                }
                Err(StreamError::Closed) => {
                    info!("config stream closed, watcher stopping");
                    return;
                }
                Err(StreamError::Disconnected(reason)) => {
                    warn!(%reason, retry_in = ?backoff, "config stream disconnected");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Apply one update. Separated from [`run`](Self::run) so reload
    /// semantics are testable without a live stream.
    pub fn apply(&mut self, update: ConfigUpdate) {
        match update {
            ConfigUpdate::Policy(data) => self.apply_policy(data),
            ConfigUpdate::Schedules(raw) => self.apply_schedules(raw),
            ConfigUpdate::History(raw) => self.apply_history(raw),
        }
    }

    fn apply_policy(&mut self, data: BTreeMap<String, String>) {
        if self.last_policy.as_ref() == Some(&data) {
            debug!("policy payload unchanged, skipping");
            return;
        }

        match FreezeConfig::from_object(&data) {
            Ok(config) => {
                self.last_policy = Some(data);
                let previous = self.cache.install(config.clone());
                self.record_freeze_transition(&previous, &config);
                info!(
                    freeze_enabled = config.freeze_enabled,
                    fail_closed = config.fail_closed,
                    monitored = config.monitored_kinds.len(),
                    "policy config installed"
                );
                self.ready.store(true, Ordering::Release);
            }
            Err(e) => {
                // Remember the bad payload so redeliveries stay silent.
                self.last_policy = Some(data);
                warn!(error = %e, "invalid policy config, retaining previous snapshot");
                self.history.append(NewEvent {
                    timestamp: self.clock.now(),
                    event_type: EventType::ConfigInvalid,
                    reason: e.to_string(),
                    triggered_by: WATCHER_IDENTITY.to_owned(),
                    namespace: None,
                    resource_name: None,
                });
            }
        }
    }

    fn record_freeze_transition(&self, previous: &FreezeConfig, current: &FreezeConfig) {
        if previous.freeze_enabled == current.freeze_enabled {
            return;
        }
        let (event_type, reason) = if current.freeze_enabled {
            let until = current
                .freeze_until
                .map(|at| format!(" until {}", at.to_rfc3339()))
                .unwrap_or_default();
            (
                EventType::FreezeEnabled,
                format!("manual freeze enabled{until}"),
            )
        } else {
            (
                EventType::FreezeDisabled,
                "manual freeze disabled".to_owned(),
            )
        };
        self.history.append(NewEvent {
            timestamp: self.clock.now(),
            event_type,
            reason,
            triggered_by: WATCHER_IDENTITY.to_owned(),
            namespace: None,
            resource_name: None,
        });
    }

    fn apply_schedules(&mut self, raw: String) {
        if self.last_schedules.as_deref() == Some(raw.as_str()) {
            debug!("schedule payload unchanged, skipping");
            return;
        }

        match parse_schedule_list(&raw) {
            Ok(schedules) => {
                self.last_schedules = Some(raw);
                let count = schedules.len();
                let (created, deleted) = self.engine.replace_all(schedules);
                info!(count, created = created.len(), deleted = deleted.len(), "schedules installed");
                let now = self.clock.now();
                for name in created {
                    self.history.append(NewEvent {
                        timestamp: now,
                        event_type: EventType::ScheduleCreated,
                        reason: format!("schedule `{name}` added"),
                        triggered_by: WATCHER_IDENTITY.to_owned(),
                        namespace: None,
                        resource_name: None,
                    });
                }
                for name in deleted {
                    self.history.append(NewEvent {
                        timestamp: now,
                        event_type: EventType::ScheduleDeleted,
                        reason: format!("schedule `{name}` removed"),
                        triggered_by: WATCHER_IDENTITY.to_owned(),
                        namespace: None,
                        resource_name: None,
                    });
                }
            }
            Err(e) => {
                self.last_schedules = Some(raw);
                warn!(error = %e, "invalid schedule list, retaining previous set");
                self.history.append(NewEvent {
                    timestamp: self.clock.now(),
                    event_type: EventType::ConfigInvalid,
                    reason: e.to_string(),
                    triggered_by: WATCHER_IDENTITY.to_owned(),
                    namespace: None,
                    resource_name: None,
                });
            }
        }
    }

    fn apply_history(&mut self, raw: String) {
        if self.last_history.as_deref() == Some(raw.as_str()) {
            return;
        }
        self.last_history = Some(raw.clone());

        // Hydration is a startup-only concern; the in-memory ring is the
        // source of truth once events start flowing.
        if self.hydrated || !self.history.is_empty() {
            debug!("history already live, ignoring update");
            return;
        }
        if raw.trim().is_empty() {
            self.hydrated = true;
            return;
        }
        match self.history.hydrate_json(&raw) {
            Ok(count) => {
                info!(count, "history hydrated from watched object");
                self.hydrated = true;
            }
            Err(e) => {
                warn!(error = %e, "invalid history payload, starting with empty ring");
                self.history.append(NewEvent {
                    timestamp: self.clock.now(),
                    event_type: EventType::ConfigInvalid,
                    reason: format!("history payload: {e}"),
                    triggered_by: WATCHER_IDENTITY.to_owned(),
                    namespace: None,
                    resource_name: None,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stream implementations
// ---------------------------------------------------------------------------

/// Test- and embedder-facing stream fed through a channel.
pub struct ChannelStream {
    rx: mpsc::Receiver<Result<ConfigUpdate, StreamError>>,
}

impl ChannelStream {
    /// Create a stream and its sending half.
    pub fn new(buffer: usize) -> (mpsc::Sender<Result<ConfigUpdate, StreamError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl ConfigStream for ChannelStream {
    async fn next_update(&mut self) -> Result<ConfigUpdate, StreamError> {
        self.rx.recv().await.unwrap_or(Err(StreamError::Closed))
    }
}

/// Stream over config objects projected as volume mounts.
///
/// The platform materialises each config object as a directory with one
/// file per key and rewrites the files when the object changes. This stream
/// re-reads the directories on a fixed poll interval and emits the payloads;
/// the watcher's fingerprinting turns the steady state into no-ops.
pub struct MountedDirStream {
    config_dir: PathBuf,
    schedules_dir: PathBuf,
    history_dir: PathBuf,
    poll_interval: Duration,
    pending: Vec<ConfigUpdate>,
    primed: bool,
}

/// File key carrying the schedule list inside its config object.
const SCHEDULES_KEY: &str = "schedules";

/// File key carrying history events inside its config object.
const HISTORY_KEY: &str = "events";

impl MountedDirStream {
    /// Create a stream over the three mounted object directories.
    pub fn new(
        config_dir: impl Into<PathBuf>,
        schedules_dir: impl Into<PathBuf>,
        history_dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            schedules_dir: schedules_dir.into(),
            history_dir: history_dir.into(),
            poll_interval,
            pending: Vec::new(),
            primed: false,
        }
    }

    fn read_all(&mut self) -> Result<(), StreamError> {
        // History first so hydration precedes any transition events from the
        // initial policy apply.
        let history = read_key(&self.history_dir, HISTORY_KEY)?;
        self.pending.push(ConfigUpdate::History(history));

        let schedules = read_key(&self.schedules_dir, SCHEDULES_KEY)?;
        self.pending.push(ConfigUpdate::Schedules(schedules));

        let policy = read_dir_map(&self.config_dir)?;
        self.pending.push(ConfigUpdate::Policy(policy));

        // Emit in read order.
        self.pending.reverse();
        Ok(())
    }
}

#[async_trait]
impl ConfigStream for MountedDirStream {
    async fn next_update(&mut self) -> Result<ConfigUpdate, StreamError> {
        loop {
            if let Some(update) = self.pending.pop() {
                return Ok(update);
            }
            // The very first read happens immediately so startup is not
            // delayed by a poll tick; after that, one tick per batch.
            if self.primed {
                tokio::time::sleep(self.poll_interval).await;
            }
            self.primed = true;
            self.read_all()?;
        }
    }
}

/// Read a whole object directory into a key → value map.
///
/// A missing directory reads as an absent object (empty map, defaults);
/// any other I/O failure is a disconnect. The platform's hidden bookkeeping
/// entries (`..data` and friends) are skipped.
fn read_dir_map(dir: &Path) -> Result<BTreeMap<String, String>, StreamError> {
    let mut out = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(StreamError::Disconnected(format!("{}: {e}", dir.display()))),
    };
    for entry in entries {
        let entry =
            entry.map_err(|e| StreamError::Disconnected(format!("{}: {e}", dir.display())))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_file() {
            continue;
        }
        let value = std::fs::read_to_string(entry.path())
            .map_err(|e| StreamError::Disconnected(format!("{name}: {e}")))?;
        out.insert(name, value);
    }
    Ok(out)
}

/// Read one key's file from an object directory; absent reads as empty.
fn read_key(dir: &Path, key: &str) -> Result<String, StreamError> {
    match std::fs::read_to_string(dir.join(key)) {
        Ok(value) => Ok(value),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(StreamError::Disconnected(format!("{key}: {e}"))),
    }
}
