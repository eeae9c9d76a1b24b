//! Delegation records: who may act on behalf of whom.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

wire_enum! {
    /// The kinds of work a delegation covers.
    pub enum DelegationType {
        Approvement => "approvement",
        Execution => "execution",
    }
}

/// `to_login` may act as `from_login` between the two dates, inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub from_login: String,
    pub to_login: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    #[serde(default)]
    pub types: Vec<DelegationType>,
}

impl Delegation {
    pub fn is_active_on(&self, day: NaiveDate) -> bool {
        self.from_date <= day && day <= self.to_date
    }

    pub fn covers(&self, kind: DelegationType) -> bool {
        self.types.contains(&kind)
    }
}
