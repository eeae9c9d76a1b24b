//! Production calendars: which dates are holidays or shortened days.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlaError};

/// Classification of a calendar date. Dates absent from a calendar are
/// ordinary days governed by the work type's weekends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayKind {
    Workday,
    Holiday,
    /// Ends one hour early.
    PreHoliday,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    days: BTreeMap<NaiveDate, DayKind>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_day(mut self, date: NaiveDate, kind: DayKind) -> Self {
        self.days.insert(date, kind);
        self
    }

    pub fn insert(&mut self, date: NaiveDate, kind: DayKind) {
        self.days.insert(date, kind);
    }

    pub fn day_kind(&self, date: NaiveDate) -> Option<DayKind> {
        self.days.get(&date).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    /// Overlay another calendar's entries onto this one.
    pub fn merge(&mut self, other: Calendar) {
        self.days.extend(other.days);
    }
}

/// Remote calendar service.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Calendar entries for the inclusive date range.
    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Calendar>;
}

/// A fixed calendar, for configuration and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCalendarSource {
    calendar: Calendar,
}

impl StaticCalendarSource {
    pub fn new(calendar: Calendar) -> Self {
        Self { calendar }
    }
}

#[async_trait]
impl CalendarSource for StaticCalendarSource {
    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Calendar> {
        let mut out = Calendar::new();
        for (date, kind) in self.calendar.days.range(from..=to) {
            out.insert(*date, *kind);
        }
        Ok(out)
    }
}

/// One entry of the calendar service's answer.
#[derive(Debug, Clone, Deserialize)]
struct CalendarDay {
    date: NaiveDate,
    kind: DayKind,
}

/// JSON-over-HTTP client for the calendar service.
///
/// `GET {base_url}/calendar?from=<date>&to=<date>` returning
/// `[{"date": "2024-05-09", "kind": "holiday"}]`.
#[derive(Debug, Clone)]
pub struct HttpCalendarSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCalendarSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CalendarSource for HttpCalendarSource {
    async fn fetch(&self, from: NaiveDate, to: NaiveDate) -> Result<Calendar> {
        let response = self
            .client
            .get(format!("{}/calendar", self.base_url))
            .query(&[("from", from.to_string()), ("to", to.to_string())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SlaError::Calendar(format!(
                "calendar service returned {}",
                response.status()
            )));
        }
        let days: Vec<CalendarDay> = response.json().await?;
        let mut calendar = Calendar::new();
        for day in days {
            calendar.insert(day.date, day.kind);
        }
        Ok(calendar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test]
    async fn test_static_source_filters_range() {
        let cal = Calendar::new()
            .with_day(d(2024, 1, 1), DayKind::Holiday)
            .with_day(d(2024, 2, 22), DayKind::PreHoliday)
            .with_day(d(2024, 5, 9), DayKind::Holiday);
        let source = StaticCalendarSource::new(cal);
        let got = source.fetch(d(2024, 2, 1), d(2024, 5, 9)).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got.day_kind(d(2024, 2, 22)), Some(DayKind::PreHoliday));
        assert_eq!(got.day_kind(d(2024, 1, 1)), None);
    }
}
