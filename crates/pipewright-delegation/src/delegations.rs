//! A set of delegations and the queries the engine asks of it.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use pipewright_types::{Delegation, DelegationType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delegations(pub Vec<Delegation>);

impl Delegations {
    pub fn new(items: Vec<Delegation>) -> Self {
        Self(items)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Delegation> {
        self.0.iter()
    }

    /// Delegations whose window contains `day`.
    pub fn active_on(&self, day: NaiveDate) -> Delegations {
        Delegations(self.0.iter().filter(|d| d.is_active_on(day)).cloned().collect())
    }

    /// Delegations that cover `kind`.
    pub fn filter_by_type(&self, kind: DelegationType) -> Delegations {
        Delegations(self.0.iter().filter(|d| d.covers(kind)).cloned().collect())
    }

    /// Logins `login` may act for.
    pub fn delegators_of(&self, login: &str) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .0
            .iter()
            .filter(|d| d.to_login == login)
            .map(|d| d.from_login.as_str())
            .collect();
        set.into_iter().map(String::from).collect()
    }

    /// Logins that may act for `login`.
    pub fn delegates_of(&self, login: &str) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .0
            .iter()
            .filter(|d| d.from_login == login)
            .map(|d| d.to_login.as_str())
            .collect();
        set.into_iter().map(String::from).collect()
    }

    /// Whether `current` is an active delegate of `member`.
    pub fn is_delegate(&self, current: &str, member: &str) -> bool {
        self.0
            .iter()
            .any(|d| d.to_login == current && d.from_login == member)
    }

    /// The first of `members` that `current` acts for, if any.
    pub fn find_delegator_for<'a, I>(&self, current: &str, members: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        members
            .into_iter()
            .find(|m| self.is_delegate(current, m))
            .cloned()
    }

    /// `logins` together with everyone they act for.
    pub fn with_delegators(&self, logins: &[String]) -> Vec<String> {
        let mut out: BTreeSet<String> = logins.iter().cloned().collect();
        for login in logins {
            out.extend(self.delegators_of(login));
        }
        out.into_iter().collect()
    }
}

impl FromIterator<Delegation> for Delegations {
    fn from_iter<T: IntoIterator<Item = Delegation>>(iter: T) -> Self {
        Delegations(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn sample() -> Delegations {
        Delegations::new(vec![
            Delegation {
                from_login: "boss".into(),
                to_login: "deputy".into(),
                from_date: day(1),
                to_date: day(10),
                types: vec![DelegationType::Approvement],
            },
            Delegation {
                from_login: "lead".into(),
                to_login: "deputy".into(),
                from_date: day(5),
                to_date: day(20),
                types: vec![DelegationType::Execution],
            },
        ])
    }

    #[test]
    fn test_filters() {
        let d = sample();
        assert_eq!(d.active_on(day(12)).len(), 1);
        assert_eq!(d.filter_by_type(DelegationType::Approvement).len(), 1);
        assert_eq!(d.delegators_of("deputy"), vec!["boss", "lead"]);
        assert_eq!(d.delegates_of("boss"), vec!["deputy"]);
    }

    #[test]
    fn test_is_delegate_and_find() {
        let d = sample().filter_by_type(DelegationType::Approvement);
        assert!(d.is_delegate("deputy", "boss"));
        assert!(!d.is_delegate("deputy", "lead"));
        let members = vec!["someone".to_string(), "boss".to_string()];
        assert_eq!(d.find_delegator_for("deputy", &members), Some("boss".into()));
        assert_eq!(d.find_delegator_for("boss", &members), None);
    }

    #[test]
    fn test_with_delegators() {
        let d = sample();
        assert_eq!(
            d.with_delegators(&["deputy".into()]),
            vec!["boss".to_string(), "deputy".into(), "lead".into()]
        );
    }
}
