//! Calendar-aware SLA service with a cached production calendar.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;

use crate::calendar::{Calendar, CalendarSource};
use crate::deadline::{self, SlaInfo};
use crate::error::Result;
use crate::work_type::WorkType;

/// How far past today a refresh fetches.
const REFRESH_HORIZON_DAYS: i64 = 366;

/// Hands out [`SlaInfo`] for a work type, backed by a calendar that is
/// refreshed from an optional remote source.
pub struct SlaService {
    source: Option<Arc<dyn CalendarSource>>,
    calendar: RwLock<Arc<Calendar>>,
}

impl SlaService {
    pub fn new(source: Option<Arc<dyn CalendarSource>>) -> Self {
        Self {
            source,
            calendar: RwLock::new(Arc::new(Calendar::new())),
        }
    }

    /// A service with a fixed calendar and no remote source.
    pub fn with_calendar(calendar: Calendar) -> Self {
        Self {
            source: None,
            calendar: RwLock::new(Arc::new(calendar)),
        }
    }

    /// Re-fetch the calendar around `today`. Keeps the old one on failure.
    pub async fn refresh(&self, today: NaiveDate) -> Result<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        let from = today - Duration::days(31);
        let to = today + Duration::days(REFRESH_HORIZON_DAYS);
        match source.fetch(from, to).await {
            Ok(fetched) => {
                tracing::debug!(days = fetched.len(), "calendar refreshed");
                *self.calendar.write() = Arc::new(fetched);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "calendar refresh failed, keeping cached calendar");
                Err(e)
            }
        }
    }

    pub fn calendar(&self) -> Arc<Calendar> {
        self.calendar.read().clone()
    }

    pub fn info(&self, work_type: WorkType) -> SlaInfo {
        SlaInfo::new(work_type, self.calendar())
    }

    pub fn compute_max_date(
        &self,
        start: DateTime<Utc>,
        sla_hours: f32,
        work_type: WorkType,
    ) -> DateTime<Utc> {
        deadline::compute_max_date(start, sla_hours, &self.info(work_type))
    }

    pub fn half_sla_date(
        &self,
        start: DateTime<Utc>,
        sla_hours: f32,
        work_type: WorkType,
    ) -> DateTime<Utc> {
        deadline::half_sla_date(start, sla_hours, &self.info(work_type))
    }

    pub fn check_breach(
        &self,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
        sla_hours: f32,
        work_type: WorkType,
    ) -> bool {
        deadline::check_breach(start, now, sla_hours, &self.info(work_type))
    }

    pub fn work_hours_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        work_type: WorkType,
    ) -> u32 {
        deadline::work_hours_between(from, to, &self.info(work_type))
    }

    pub fn work_time_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        work_type: WorkType,
    ) -> Duration {
        deadline::work_time_between(from, to, &self.info(work_type))
    }

    pub fn mean_completion_hours(
        &self,
        intervals: &[(DateTime<Utc>, DateTime<Utc>)],
        work_type: WorkType,
    ) -> f64 {
        deadline::mean_completion_hours(intervals, &self.info(work_type))
    }
}

impl Default for SlaService {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SlaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaService")
            .field("remote", &self.source.is_some())
            .field("calendar_days", &self.calendar.read().len())
            .finish()
    }
}
