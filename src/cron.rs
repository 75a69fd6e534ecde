//! Classic 5-field cron parsing and minute-granularity evaluation.
//!
//! Accepts minute, hour, day-of-month, month, and day-of-week fields with
//! `*`, single values, `A-B` ranges, `*/N` and `A-B/N` steps, and comma
//! lists. Anything outside that grammar (`@`-macros, `?`, name aliases,
//! seconds or year fields) is rejected. Evaluation projects a UTC instant
//! into the schedule's timezone; the window granularity is one minute.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// How far ahead `next_activation` searches before giving up. Four years
/// covers the rarest satisfiable expression (Feb 29).
const SCAN_HORIZON_DAYS: i64 = 4 * 366;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Position of a field within a 5-field cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    /// Minute field (0-59).
    Minute,
    /// Hour field (0-23).
    Hour,
    /// Day-of-month field (1-31).
    DayOfMonth,
    /// Month field (1-12).
    Month,
    /// Day-of-week field (0-7, both 0 and 7 meaning Sunday).
    DayOfWeek,
}

impl CronField {
    /// Zero-based index of the field in the expression.
    pub fn index(self) -> usize {
        match self {
            Self::Minute => 0,
            Self::Hour => 1,
            Self::DayOfMonth => 2,
            Self::Month => 3,
            Self::DayOfWeek => 4,
        }
    }

    /// Inclusive value bounds for the field.
    fn bounds(self) -> (u8, u8) {
        match self {
            Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 7),
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day-of-month",
            Self::Month => "month",
            Self::DayOfWeek => "day-of-week",
        };
        f.write_str(name)
    }
}

/// Cron parse failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CronError {
    /// The expression does not have exactly five whitespace-separated fields.
    #[error("expected 5 cron fields, found {found}")]
    FieldCount {
        /// Number of fields actually present.
        found: usize,
    },
    /// A field contains a token outside the supported grammar.
    #[error("invalid {field} field (index {index}): `{token}`", index = .field.index())]
    InvalidField {
        /// Which field failed.
        field: CronField,
        /// The offending token.
        token: String,
    },
}

// ---------------------------------------------------------------------------
// Field sets
// ---------------------------------------------------------------------------

/// Set of admissible values for one field, as a bitmask.
///
/// `restricted` records whether the field spelled out values rather than
/// starting with `*`; it drives the traditional day-of-month/day-of-week
/// OR combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(self, value: u8) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }
}

fn parse_value(field: CronField, token: &str, text: &str) -> Result<u8, CronError> {
    let (lo, hi) = field.bounds();
    let value: u8 = text.parse().map_err(|_| CronError::InvalidField {
        field,
        token: token.to_owned(),
    })?;
    if value < lo || value > hi {
        return Err(CronError::InvalidField {
            field,
            token: token.to_owned(),
        });
    }
    Ok(value)
}

fn parse_field(field: CronField, text: &str) -> Result<FieldSet, CronError> {
    let mut bits: u64 = 0;
    if text.is_empty() {
        return Err(CronError::InvalidField {
            field,
            token: text.to_owned(),
        });
    }

    for token in text.split(',') {
        let (base, step) = match token.split_once('/') {
            Some((base, step_text)) => {
                let step: u8 = step_text.parse().map_err(|_| CronError::InvalidField {
                    field,
                    token: token.to_owned(),
                })?;
                if step == 0 {
                    return Err(CronError::InvalidField {
                        field,
                        token: token.to_owned(),
                    });
                }
                (base, step)
            }
            None => (token, 1),
        };

        let (lo, hi) = field.bounds();
        let (start, end) = if base == "*" {
            (lo, hi)
        } else if let Some((a, b)) = base.split_once('-') {
            let start = parse_value(field, token, a)?;
            let end = parse_value(field, token, b)?;
            if start > end {
                return Err(CronError::InvalidField {
                    field,
                    token: token.to_owned(),
                });
            }
            (start, end)
        } else {
            // A step on a bare value (`5/2`) is not part of the grammar.
            if step != 1 || token.contains('/') {
                return Err(CronError::InvalidField {
                    field,
                    token: token.to_owned(),
                });
            }
            let value = parse_value(field, token, base)?;
            (value, value)
        };

        let mut v = u16::from(start);
        while v <= u16::from(end) {
            bits |= 1 << v;
            v += u16::from(step);
        }
    }

    // Both 0 and 7 are Sunday; fold bit 7 down so ranges like `5-7` work.
    if field == CronField::DayOfWeek && bits & (1 << 7) != 0 {
        bits |= 1;
        bits &= !(1 << 7);
    }

    Ok(FieldSet {
        bits,
        restricted: !text.starts_with('*'),
    })
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronExpr {
    /// Parse a classic 5-field expression.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount {
                found: fields.len(),
            });
        }
        Ok(Self {
            minute: parse_field(CronField::Minute, fields[0])?,
            hour: parse_field(CronField::Hour, fields[1])?,
            day_of_month: parse_field(CronField::DayOfMonth, fields[2])?,
            month: parse_field(CronField::Month, fields[3])?,
            day_of_week: parse_field(CronField::DayOfWeek, fields[4])?,
        })
    }

    /// True if the instant, projected into `tz`, matches every field.
    ///
    /// Seconds are ignored. When both day fields are restricted they combine
    /// with OR, the traditional cron rule; otherwise the unrestricted one is
    /// always satisfied and the combination degenerates to AND.
    pub fn matches(&self, instant: DateTime<Utc>, tz: Tz) -> bool {
        let local = instant.with_timezone(&tz);
        self.minute.contains(local.minute() as u8)
            && self.hour.contains(local.hour() as u8)
            && self.month.contains(local.month() as u8)
            && self.day_matches(local.day() as u8, weekday_number(&local))
    }

    /// The minute-aligned window `[start, start + 1min)` containing `instant`
    /// when it matches, else `None`.
    pub fn active_window(
        &self,
        instant: DateTime<Utc>,
        tz: Tz,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.matches(instant, tz) {
            return None;
        }
        let start = instant.duration_trunc(Duration::minutes(1)).ok()?;
        Some((start, start + Duration::minutes(1)))
    }

    /// First matching minute strictly after `after`, within the scan horizon.
    ///
    /// Returns `None` for expressions that never fire in the next four years
    /// (e.g. a Feb 30 day-of-month).
    pub fn next_activation(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let mut t = after.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
        let horizon = after + Duration::days(SCAN_HORIZON_DAYS);

        while t <= horizon {
            let local = t.with_timezone(&tz);
            let day_ok = self.month.contains(local.month() as u8)
                && self.day_matches(local.day() as u8, weekday_number(&local))
                && self.hour.contains(local.hour() as u8);
            if day_ok {
                if self.minute.contains(local.minute() as u8) {
                    return Some(t);
                }
                t += Duration::minutes(1);
            } else {
                // Jump to the top of the next local hour; re-checking each
                // iteration keeps this correct across DST transitions.
                t += Duration::minutes(i64::from(60 - local.minute() as u8).max(1));
            }
        }
        None
    }

    fn day_matches(&self, day_of_month: u8, day_of_week: u8) -> bool {
        let dom = self.day_of_month.contains(day_of_month);
        let dow = self.day_of_week.contains(day_of_week);
        if self.day_of_month.restricted && self.day_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

/// Day-of-week as cron counts it: 0 = Sunday.
fn weekday_number(local: &DateTime<Tz>) -> u8 {
    local.weekday().num_days_from_sunday() as u8
}
