//! Freeze schedules and the engine that answers "is a freeze active?".

pub mod engine;
pub mod schedule;

pub use engine::{FreezeMatch, FreezeStatus, ScheduleEngine};
pub use schedule::{parse_schedule_list, Schedule, ScheduleKind, ScheduleSpec};
