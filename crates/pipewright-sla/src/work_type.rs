//! Named working-hour regimes.

use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::error::SlaError;

/// How many hours a day, and which days, count towards an SLA.
///
/// Hours are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WorkType {
    /// 06:00-14:00, Monday to Friday.
    EightFive,
    /// 06:00-18:00, Monday to Friday.
    TwelveFive,
    /// Around the clock, calendar ignored.
    TwentyFourSeven,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::EightFive => "8/5",
            WorkType::TwelveFive => "12/5",
            WorkType::TwentyFourSeven => "24/7",
        }
    }

    /// `(start, end)` hour bounds. 24/7 uses bounds no hour can cross.
    pub fn working_hours(&self) -> (i64, i64) {
        match self {
            WorkType::EightFive => (6, 14),
            WorkType::TwelveFive => (6, 18),
            WorkType::TwentyFourSeven => (-1, 25),
        }
    }

    pub fn weekends(&self) -> &'static [Weekday] {
        match self {
            WorkType::EightFive | WorkType::TwelveFive => &[Weekday::Sat, Weekday::Sun],
            WorkType::TwentyFourSeven => &[],
        }
    }

    pub fn uses_calendar(&self) -> bool {
        !matches!(self, WorkType::TwentyFourSeven)
    }

    pub fn hours_per_day(&self) -> u32 {
        match self {
            WorkType::EightFive => 8,
            WorkType::TwelveFive => 12,
            WorkType::TwentyFourSeven => 24,
        }
    }
}

impl Default for WorkType {
    fn default() -> Self {
        WorkType::EightFive
    }
}

impl FromStr for WorkType {
    type Err = SlaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "8/5" | "5/8" => Ok(WorkType::EightFive),
            "12/5" | "5/12" => Ok(WorkType::TwelveFive),
            "24/7" => Ok(WorkType::TwentyFourSeven),
            other => Err(SlaError::UnknownWorkType(other.to_string())),
        }
    }
}

impl TryFrom<String> for WorkType {
    type Error = SlaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkType> for String {
    fn from(value: WorkType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for WorkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases() {
        assert_eq!("5/8".parse::<WorkType>().unwrap(), WorkType::EightFive);
        assert_eq!("5/12".parse::<WorkType>().unwrap(), WorkType::TwelveFive);
        assert_eq!("24/7".parse::<WorkType>().unwrap(), WorkType::TwentyFourSeven);
        assert!("7/7".parse::<WorkType>().is_err());
    }

    #[test]
    fn test_hours() {
        assert_eq!(WorkType::TwelveFive.working_hours(), (6, 18));
        assert!(WorkType::TwentyFourSeven.weekends().is_empty());
        assert!(!WorkType::TwentyFourSeven.uses_calendar());
        assert_eq!(String::from(WorkType::TwelveFive), "12/5");
    }
}
