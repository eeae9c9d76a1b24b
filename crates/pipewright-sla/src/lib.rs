//! SLA and calendar arithmetic.
//!
//! Deadlines are measured in working hours under a named [`WorkType`]
//! (`8/5`, `12/5`, `24/7`) and a production [`Calendar`] of holidays and
//! shortened days.

pub mod calendar;
pub mod deadline;
pub mod error;
pub mod service;
pub mod work_type;

pub use calendar::{Calendar, CalendarSource, DayKind, HttpCalendarSource, StaticCalendarSource};
pub use deadline::{
    business_duration, check_breach, compute_max_date, half_sla_date, mean_completion_hours,
    parse_duration, skip_non_working_days, work_hours_between, work_time_between, SlaInfo,
};
pub use error::{Result, SlaError};
pub use service::SlaService;
pub use work_type::WorkType;
