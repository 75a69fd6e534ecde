//! Freeze schedule model and parsing.
//!
//! A schedule produces freeze-active intervals in one of three shapes:
//! an absolute `[start, end)` window, a recurring cron pattern, or a cron
//! gated by an absolute window. The shape is a tagged variant, so a
//! half-specified schedule (say, a `start` with no `end` and no `cron`)
//! fails at parse instead of silently never matching.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::config::{parse_instant, ConfigError};
use crate::cron::CronExpr;

/// Wire form of one schedule entry in the watched schedule list.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSpec {
    /// Unique schedule name.
    pub name: String,
    /// Optional denial message override.
    #[serde(default)]
    pub message: Option<String>,
    /// Namespaces the freeze applies to; empty or absent means all.
    #[serde(default)]
    pub namespaces: Option<Vec<String>>,
    /// Window start, RFC 3339.
    #[serde(default)]
    pub start: Option<String>,
    /// Window end, RFC 3339.
    #[serde(default)]
    pub end: Option<String>,
    /// 5-field cron expression.
    #[serde(default)]
    pub cron: Option<String>,
    /// IANA zone the cron is interpreted in; defaults to UTC.
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Which intervals a schedule freezes.
#[derive(Debug, Clone)]
pub enum ScheduleKind {
    /// Active throughout `[start, end)`.
    Absolute {
        /// Window start.
        start: DateTime<Utc>,
        /// Window end; always after `start`.
        end: DateTime<Utc>,
    },
    /// Active for each minute the cron matches.
    Recurring {
        /// The cron pattern.
        cron: CronExpr,
    },
    /// Active for each matching cron minute inside `[start, end)`.
    Windowed {
        /// Window start.
        start: DateTime<Utc>,
        /// Window end; always after `start`.
        end: DateTime<Utc>,
        /// The cron pattern.
        cron: CronExpr,
    },
}

/// A validated freeze schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Unique name; the ordering key for composed denial messages.
    pub name: String,
    /// Optional denial message override.
    pub message: Option<String>,
    /// Namespaces the freeze applies to; empty means all.
    pub namespaces: Vec<String>,
    /// Zone the cron fields are interpreted in.
    pub timezone: Tz,
    /// Activation shape.
    pub kind: ScheduleKind,
}

impl Schedule {
    /// Validate a wire spec into a schedule.
    pub fn from_spec(spec: ScheduleSpec) -> Result<Self, ConfigError> {
        let name = spec.name.trim().to_owned();
        if name.is_empty() {
            return Err(ConfigError::InvalidSchedule {
                name: "<unnamed>".to_owned(),
                detail: "name must not be empty".to_owned(),
            });
        }
        let invalid = |detail: String| ConfigError::InvalidSchedule {
            name: name.clone(),
            detail,
        };

        let timezone: Tz = match spec.timezone.as_deref() {
            None | Some("") => chrono_tz::UTC,
            Some(raw) => raw
                .parse()
                .map_err(|_| invalid(format!("unknown timezone `{raw}`")))?,
        };

        let start = spec
            .start
            .as_deref()
            .map(parse_instant)
            .transpose()
            .map_err(|detail| invalid(format!("bad start: {detail}")))?;
        let end = spec
            .end
            .as_deref()
            .map(parse_instant)
            .transpose()
            .map_err(|detail| invalid(format!("bad end: {detail}")))?;
        let cron = spec
            .cron
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(CronExpr::parse)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;

        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                return Err(invalid("end must be after start".to_owned()));
            }
        }

        let kind = match (start, end, cron) {
            (Some(start), Some(end), None) => ScheduleKind::Absolute { start, end },
            (None, None, Some(cron)) => ScheduleKind::Recurring { cron },
            (Some(start), Some(end), Some(cron)) => ScheduleKind::Windowed { start, end, cron },
            (None, None, None) => {
                return Err(invalid(
                    "needs an absolute window, a cron, or both".to_owned(),
                ));
            }
            _ => {
                return Err(invalid(
                    "start and end must be given together".to_owned(),
                ));
            }
        };

        Ok(Self {
            name,
            message: spec.message.filter(|m| !m.trim().is_empty()),
            namespaces: spec
                .namespaces
                .unwrap_or_default()
                .into_iter()
                .map(|ns| ns.trim().to_owned())
                .filter(|ns| !ns.is_empty())
                .collect(),
            timezone,
            kind,
        })
    }

    /// True when the schedule freezes the given instant.
    pub fn is_active_at(&self, instant: DateTime<Utc>) -> bool {
        match &self.kind {
            ScheduleKind::Absolute { start, end } => *start <= instant && instant < *end,
            ScheduleKind::Recurring { cron } => cron.matches(instant, self.timezone),
            ScheduleKind::Windowed { start, end, cron } => {
                *start <= instant && instant < *end && cron.matches(instant, self.timezone)
            }
        }
    }

    /// True when the schedule covers the namespace (or no namespace is
    /// supplied, or the schedule is cluster-wide).
    pub fn applies_to(&self, namespace: Option<&str>) -> bool {
        if self.namespaces.is_empty() {
            return true;
        }
        match namespace {
            Some(ns) => self.namespaces.iter().any(|stored| stored == ns),
            None => true,
        }
    }

    /// The absolute end of the schedule's window, when it has one.
    pub fn window_end(&self) -> Option<DateTime<Utc>> {
        match &self.kind {
            ScheduleKind::Absolute { end, .. } | ScheduleKind::Windowed { end, .. } => Some(*end),
            ScheduleKind::Recurring { .. } => None,
        }
    }
}

/// Parse the watched schedule list payload: a JSON array of specs.
///
/// Names must be unique; a duplicate rejects the whole payload so a partial
/// set is never installed.
pub fn parse_schedule_list(raw: &str) -> Result<Vec<Schedule>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let specs: Vec<ScheduleSpec> = serde_json::from_str(raw)
        .map_err(|e| ConfigError::MalformedScheduleList(e.to_string()))?;

    let mut schedules = Vec::with_capacity(specs.len());
    for spec in specs {
        let schedule = Schedule::from_spec(spec)?;
        if schedules
            .iter()
            .any(|existing: &Schedule| existing.name == schedule.name)
        {
            return Err(ConfigError::InvalidSchedule {
                name: schedule.name,
                detail: "duplicate schedule name".to_owned(),
            });
        }
        schedules.push(schedule);
    }
    Ok(schedules)
}
