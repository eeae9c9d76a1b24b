//! Deadline arithmetic over business hours.
//!
//! All computations run in UTC. A moment is working time when its day is
//! not a weekend or a holiday and its hour lies in `[start, end)`; a
//! pre-holiday ends one hour earlier.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};

use crate::calendar::{Calendar, DayKind};
use crate::error::{Result, SlaError};
use crate::work_type::WorkType;

/// Upper bound on non-working days skipped while computing one deadline.
const MAX_SKIPPED_DAYS: u32 = 3660;

/// Everything deadline arithmetic needs: the regime and the calendar.
#[derive(Debug, Clone)]
pub struct SlaInfo {
    pub work_type: WorkType,
    pub calendar: Arc<Calendar>,
}

impl SlaInfo {
    pub fn new(work_type: WorkType, calendar: Arc<Calendar>) -> Self {
        let calendar = if work_type.uses_calendar() {
            calendar
        } else {
            Arc::new(Calendar::new())
        };
        Self {
            work_type,
            calendar,
        }
    }

    /// Regime without any calendar overrides.
    pub fn plain(work_type: WorkType) -> Self {
        Self::new(work_type, Arc::new(Calendar::new()))
    }

    fn start_hour(&self) -> i64 {
        self.work_type.working_hours().0
    }

    fn end_hour(&self, day: NaiveDate) -> i64 {
        let end = self.work_type.working_hours().1;
        match self.calendar.day_kind(day) {
            Some(DayKind::PreHoliday) => end - 1,
            _ => end,
        }
    }

    pub fn is_working_time(&self, t: DateTime<Utc>) -> bool {
        let day = t.date_naive();
        if self.work_type.weekends().contains(&t.weekday()) {
            return false;
        }
        if self.calendar.day_kind(day) == Some(DayKind::Holiday) {
            return false;
        }
        let hour = i64::from(t.hour());
        hour >= self.start_hour() && hour < self.end_hour(day)
    }
}

fn at_hour(day: NaiveDate, hour: i64) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN)) + Duration::hours(hour)
}

/// The instant `sla_hours` working hours after `start`.
pub fn compute_max_date(start: DateTime<Utc>, sla_hours: f32, info: &SlaInfo) -> DateTime<Utc> {
    let mut deadline = start;
    let mut left = Duration::minutes((f64::from(sla_hours) * 60.0) as i64);
    let mut skipped = 0u32;

    while left > Duration::zero() {
        let day = deadline.date_naive();
        if !info.is_working_time(deadline) {
            skipped += 1;
            if skipped > MAX_SKIPPED_DAYS {
                tracing::warn!(%start, sla_hours, "no working time found, giving up");
                break;
            }
            let next = if i64::from(deadline.hour()) < info.start_hour() {
                day
            } else {
                day.succ_opt().unwrap_or(day)
            };
            deadline = at_hour(next, info.start_hour());
            continue;
        }

        let max_possible = at_hour(day, info.end_hour(day));
        let diff = max_possible - deadline;
        if diff < left {
            deadline += diff;
            left -= diff;
        } else {
            deadline += left;
            left = Duration::zero();
        }
    }

    deadline
}

/// Whether `now` is past the deadline.
pub fn check_breach(
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    sla_hours: f32,
    info: &SlaInfo,
) -> bool {
    now > compute_max_date(start, sla_hours, info)
}

/// Instant half of the SLA elapses.
pub fn half_sla_date(start: DateTime<Utc>, sla_hours: f32, info: &SlaInfo) -> DateTime<Utc> {
    compute_max_date(start, sla_hours / 2.0, info)
}

/// Working hours in `[from, to)`, sampled hourly. Ranges under an hour
/// count as zero.
pub fn work_hours_between(from: DateTime<Utc>, to: DateTime<Utc>, info: &SlaInfo) -> u32 {
    if to <= from || to - from < Duration::hours(1) {
        return 0;
    }
    let mut hours = 0;
    let mut cursor = from;
    while cursor < to {
        if info.is_working_time(cursor) {
            hours += 1;
        }
        cursor += Duration::hours(1);
    }
    hours
}

/// Exact working time in `[from, to)`.
pub fn work_time_between(from: DateTime<Utc>, to: DateTime<Utc>, info: &SlaInfo) -> Duration {
    let mut total = Duration::zero();
    if to <= from {
        return total;
    }
    let mut day = from.date_naive();
    for _ in 0..MAX_SKIPPED_DAYS {
        if day > to.date_naive() {
            break;
        }
        let open = at_hour(day, info.start_hour());
        if info.is_working_time(open) {
            let begin = open.max(from);
            let end = at_hour(day, info.end_hour(day)).min(to);
            if end > begin {
                total += end - begin;
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    total
}

/// Mean working hours per interval, rounded up.
pub fn mean_completion_hours(intervals: &[(DateTime<Utc>, DateTime<Utc>)], info: &SlaInfo) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }
    let total: u32 = intervals
        .iter()
        .map(|(from, to)| work_hours_between(*from, *to, info))
        .sum();
    (f64::from(total) / intervals.len() as f64).ceil()
}

/// Wall-clock instant after `duration` of business time from `start`.
pub fn business_duration(start: DateTime<Utc>, duration: Duration, info: &SlaInfo) -> DateTime<Utc> {
    compute_max_date(start, duration.num_minutes() as f32 / 60.0, info)
}

/// Advance `date` by `step` days until it lands on a working day.
///
/// An explicit calendar workday overrides a weekend.
pub fn skip_non_working_days(
    mut date: DateTime<Utc>,
    calendar: &Calendar,
    weekends: &[Weekday],
    step: i64,
) -> DateTime<Utc> {
    let step = if step == 0 { 1 } else { step };
    for _ in 0..MAX_SKIPPED_DAYS {
        let kind = calendar.day_kind(date.date_naive());
        let off = match kind {
            Some(DayKind::Holiday) => true,
            Some(DayKind::Workday) | Some(DayKind::PreHoliday) => false,
            None => weekends.contains(&date.weekday()),
        };
        if !off {
            break;
        }
        date += Duration::days(step);
    }
    date
}

/// Parse a timer duration such as `"1d2h30m"`, `"2h"` or `"45s"`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SlaError::InvalidDuration(raw.to_string()));
    }
    let mut total = Duration::zero();
    let mut digits = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let n: i64 = digits
            .parse()
            .map_err(|_| SlaError::InvalidDuration(raw.to_string()))?;
        digits.clear();
        total += match ch {
            'd' => Duration::days(n),
            'h' => Duration::hours(n),
            'm' => Duration::minutes(n),
            's' => Duration::seconds(n),
            _ => return Err(SlaError::InvalidDuration(raw.to_string())),
        };
    }
    if !digits.is_empty() {
        return Err(SlaError::InvalidDuration(raw.to_string()));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_friday_evening_rolls_to_monday() {
        // Friday 2024-03-15 17:00 MSK is 14:00 UTC, the end of the 8/5 day.
        let info = SlaInfo::plain(WorkType::EightFive);
        let start = utc(2024, 3, 15, 14, 0);
        assert_eq!(compute_max_date(start, 4.0, &info), utc(2024, 3, 18, 10, 0));
        assert_eq!(half_sla_date(start, 4.0, &info), utc(2024, 3, 18, 8, 0));
    }

    #[test]
    fn test_spans_days() {
        let info = SlaInfo::plain(WorkType::EightFive);
        // Tuesday 12:00 UTC, 2h left today, 8h Wednesday, 2h Thursday.
        let start = utc(2024, 3, 12, 12, 0);
        assert_eq!(compute_max_date(start, 12.0, &info), utc(2024, 3, 14, 8, 0));
    }

    #[test]
    fn test_early_morning_starts_same_day() {
        let info = SlaInfo::plain(WorkType::TwelveFive);
        let start = utc(2024, 3, 12, 3, 0);
        assert_eq!(compute_max_date(start, 1.5, &info), utc(2024, 3, 12, 7, 30));
    }

    #[test]
    fn test_holiday_and_pre_holiday() {
        let cal = Calendar::new()
            .with_day(NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(), DayKind::PreHoliday)
            .with_day(NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(), DayKind::Holiday);
        let info = SlaInfo::new(WorkType::EightFive, Arc::new(cal));
        // Thursday pre-holiday ends 13:00, Friday is off, resumes Monday.
        let start = utc(2024, 3, 7, 12, 0);
        assert_eq!(compute_max_date(start, 2.0, &info), utc(2024, 3, 11, 7, 0));
    }

    #[test]
    fn test_twenty_four_seven_ignores_calendar() {
        let cal = Calendar::new().with_day(NaiveDate::from_ymd_opt(2024, 3, 16).unwrap(), DayKind::Holiday);
        let info = SlaInfo::new(WorkType::TwentyFourSeven, Arc::new(cal));
        let start = utc(2024, 3, 15, 22, 0);
        assert_eq!(compute_max_date(start, 30.0, &info), utc(2024, 3, 17, 4, 0));
    }

    #[test]
    fn test_breach() {
        let info = SlaInfo::plain(WorkType::EightFive);
        let start = utc(2024, 3, 15, 14, 0);
        assert!(!check_breach(start, utc(2024, 3, 18, 10, 0), 4.0, &info));
        assert!(check_breach(start, utc(2024, 3, 18, 10, 1), 4.0, &info));
    }

    #[test]
    fn test_work_hours_between() {
        let info = SlaInfo::plain(WorkType::EightFive);
        assert_eq!(work_hours_between(utc(2024, 3, 12, 6, 0), utc(2024, 3, 12, 6, 30), &info), 0);
        assert_eq!(work_hours_between(utc(2024, 3, 12, 0, 0), utc(2024, 3, 13, 0, 0), &info), 8);
        // Friday noon to Monday noon: 2 + 6.
        assert_eq!(work_hours_between(utc(2024, 3, 15, 12, 0), utc(2024, 3, 18, 12, 0), &info), 8);
    }

    #[test]
    fn test_work_time_between_is_exact() {
        let info = SlaInfo::plain(WorkType::EightFive);
        assert_eq!(
            work_time_between(utc(2024, 3, 12, 6, 15), utc(2024, 3, 12, 6, 45), &info),
            Duration::minutes(30)
        );
        // Friday 13:30 to Monday 07:00: 30 minutes plus one hour.
        assert_eq!(
            work_time_between(utc(2024, 3, 15, 13, 30), utc(2024, 3, 18, 7, 0), &info),
            Duration::minutes(90)
        );
        assert_eq!(
            work_time_between(utc(2024, 3, 16, 6, 0), utc(2024, 3, 17, 14, 0), &info),
            Duration::zero()
        );
    }

    #[test]
    fn test_mean_completion_rounds_up() {
        let info = SlaInfo::plain(WorkType::EightFive);
        let intervals = [
            (utc(2024, 3, 12, 6, 0), utc(2024, 3, 12, 8, 0)),
            (utc(2024, 3, 12, 6, 0), utc(2024, 3, 12, 9, 0)),
        ];
        assert_eq!(mean_completion_hours(&intervals, &info), 3.0);
        assert_eq!(mean_completion_hours(&[], &info), 0.0);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1d2h").unwrap(), Duration::hours(26));
        assert_eq!(parse_duration("30m").unwrap(), Duration::minutes(30));
        assert_eq!(parse_duration("0d1h15m").unwrap(), Duration::minutes(75));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("2w").is_err());
    }

    #[test]
    fn test_skip_non_working_days() {
        let cal = Calendar::new().with_day(NaiveDate::from_ymd_opt(2024, 3, 16).unwrap(), DayKind::Workday);
        let weekends = [Weekday::Sat, Weekday::Sun];
        // Saturday made a workday stays put.
        let sat = utc(2024, 3, 16, 5, 0);
        assert_eq!(skip_non_working_days(sat, &cal, &weekends, 1), sat);
        // Sunday rolls to Monday.
        let sun = utc(2024, 3, 17, 5, 0);
        assert_eq!(skip_non_working_days(sun, &cal, &weekends, 1), utc(2024, 3, 18, 5, 0));
    }
}
