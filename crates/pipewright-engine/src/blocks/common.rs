//! Pieces shared by the human blocks.

use chrono::{DateTime, Duration, Utc};
use pipewright_sla::{SlaService, WorkType};
use pipewright_types::{ErrorKind, UpdateAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::BlockCtx;
use crate::services::Mail;
use crate::variables::VariableStore;
use crate::{EngineError, Result};

pub const MAX_COMMENT_LEN: usize = 500;
pub const MAX_ATTACHMENTS: usize = 10;

/// Access a block grants to another form node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessType {
    None,
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormAccess {
    pub node_id: String,
    pub access_type: AccessType,
}

/// Grants `forms_accessibility` gives over `form`.
pub fn grants(table: &[FormAccess], form: &str) -> bool {
    table
        .iter()
        .any(|a| a.node_id == form && a.access_type != AccessType::None)
}

/// SLA settings of a human block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaParams {
    /// Budget in working hours; zero disables SLA tracking.
    pub sla: f32,
    pub check_sla: bool,
    pub work_type: String,
    /// Rework budget in working hours after a sent-to-edit.
    pub rework_sla: f32,
    pub check_rework_sla: bool,
}

impl Default for SlaParams {
    fn default() -> Self {
        Self {
            sla: 0.0,
            check_sla: false,
            work_type: "8/5".to_string(),
            rework_sla: 0.0,
            check_rework_sla: false,
        }
    }
}

impl SlaParams {
    pub fn work_type(&self) -> WorkType {
        self.work_type.parse().unwrap_or(WorkType::EightFive)
    }
}

/// SLA progress kept in a human block's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaTrack {
    /// Moment the budget counts from; moved forward by info requests.
    pub started_at: Option<DateTime<Utc>>,
    pub half_sla_checked: bool,
    pub sla_checked: bool,
    pub rework_started_at: Option<DateTime<Utc>>,
    pub rework_sla_checked: bool,
    /// When an info request paused the clock.
    pub paused_at: Option<DateTime<Utc>>,
}

impl SlaTrack {
    pub fn start(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn pause(&mut self, at: DateTime<Utc>) {
        if self.paused_at.is_none() {
            self.paused_at = Some(at);
        }
    }

    /// Resume after a reply, moving the budget forward by the working
    /// time that passed during the pause.
    pub fn resume(&mut self, at: DateTime<Utc>, params: &SlaParams, sla: &SlaService) {
        if let (Some(paused), Some(started)) = (self.paused_at.take(), self.started_at) {
            let work_type = params.work_type();
            let lost = sla.work_time_between(paused, at, work_type);
            if lost > Duration::zero() {
                let hours = lost.num_minutes() as f32 / 60.0;
                self.started_at = Some(sla.compute_max_date(started, hours, work_type));
            }
        }
    }

    pub fn deadlines(
        &self,
        params: &SlaParams,
        ctx: &BlockCtx<'_>,
    ) -> Vec<(UpdateAction, DateTime<Utc>)> {
        let mut out = Vec::new();
        let sla = &ctx.services.sla;
        let work_type = params.work_type();
        if let Some(started) = self.rework_started_at {
            if params.check_rework_sla && params.rework_sla > 0.0 && !self.rework_sla_checked {
                out.push((
                    UpdateAction::ReworkSlaBreach,
                    sla.compute_max_date(started, params.rework_sla, work_type),
                ));
            }
        }
        // The main budget stands still while the clock is paused.
        if self.paused_at.is_some() {
            return out;
        }
        if let Some(started) = self.started_at {
            if params.check_sla && params.sla > 0.0 {
                if !self.half_sla_checked {
                    out.push((
                        UpdateAction::HalfSlaBreach,
                        sla.half_sla_date(started, params.sla, work_type),
                    ));
                }
                if !self.sla_checked {
                    out.push((
                        UpdateAction::SlaBreach,
                        sla.compute_max_date(started, params.sla, work_type),
                    ));
                }
            }
        }
        out
    }
}

/// A question/answer exchange with the initiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoEntry {
    pub login: String,
    pub comment: String,
    pub kind: InfoKind,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoKind {
    Question,
    Reply,
}

/// Whether the last entry is a question still waiting for a reply.
pub fn has_open_question(log: &[InfoEntry]) -> bool {
    log.last().is_some_and(|e| e.kind == InfoKind::Question)
}

/// Parameters of `request_*_info` and `reply_*_info`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InfoParams {
    pub comment: String,
    pub attachments: Vec<String>,
}

/// A sent-to-edit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditAppEntry {
    pub login: String,
    pub comment: String,
    #[serde(default)]
    pub delegate_for: String,
    pub created_at: DateTime<Utc>,
}

/// Queue a mail about the current task.
pub fn mail(ctx: &mut BlockCtx<'_>, to: Vec<String>, subject: String) {
    if to.is_empty() {
        return;
    }
    let body = format!("Work #{} \"{}\"", ctx.frame.work_number, ctx.frame.work_title);
    ctx.effects.mails.push(Mail { to, subject, body });
}

pub fn check_comment(comment: &str, attachments: &[String]) -> Result<()> {
    if comment.chars().count() > MAX_COMMENT_LEN {
        return Err(EngineError::rejected(
            ErrorKind::Validation,
            format!("comment longer than {MAX_COMMENT_LEN} characters"),
        ));
    }
    if attachments.len() > MAX_ATTACHMENTS {
        return Err(EngineError::rejected(
            ErrorKind::Validation,
            format!("more than {MAX_ATTACHMENTS} attachments"),
        ));
    }
    Ok(())
}

/// Logins named by a variable: a string, a list of strings, or objects
/// carrying `username`/`login`.
pub fn logins_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(logins_from_value).collect(),
        Value::Object(map) => ["username", "login"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Resolve semicolon-separated variable paths into logins.
pub fn logins_from_paths(vars: &VariableStore, paths: &str) -> Vec<String> {
    paths
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| vars.get(p))
        .flat_map(logins_from_value)
        .collect()
}

/// Append logins keeping first-seen order and dropping repeats.
pub fn push_unique(into: &mut Vec<String>, logins: impl IntoIterator<Item = String>) {
    for login in logins {
        if !into.contains(&login) {
            into.push(login);
        }
    }
}

pub fn not_member(login: &str) -> EngineError {
    EngineError::rejected(
        ErrorKind::UserNotPartOfProcess,
        format!("{login} is not part of the process"),
    )
}

pub fn unexpected_action(action: Option<UpdateAction>, kind: &str) -> EngineError {
    match action {
        Some(a) => EngineError::rejected(ErrorKind::UnknownAction, format!("{a} is not valid for {kind}")),
        None => EngineError::rejected(ErrorKind::UnknownAction, format!("missing action for {kind}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_logins_from_value_shapes() {
        assert_eq!(logins_from_value(&json!("u1")), vec!["u1"]);
        assert_eq!(
            logins_from_value(&json!(["u1", {"username": "u2"}, {"login": "u3"}, 5])),
            vec!["u1", "u2", "u3"]
        );
        assert!(logins_from_value(&json!("")).is_empty());
    }

    #[test]
    fn test_logins_from_paths() {
        let mut vars = VariableStore::new();
        vars.set_value("form_0.boss", json!({"username": "b"}));
        vars.set_value("pipe.team", json!(["x", "y"]));
        assert_eq!(
            logins_from_paths(&vars, "form_0.boss; pipe.team;missing.path"),
            vec!["b", "x", "y"]
        );
    }

    #[test]
    fn test_comment_limits() {
        assert!(check_comment("ok", &[]).is_ok());
        let long = "x".repeat(MAX_COMMENT_LEN + 1);
        assert!(check_comment(&long, &[]).is_err());
        let many = vec!["f".to_string(); MAX_ATTACHMENTS + 1];
        assert!(check_comment("", &many).is_err());
    }

    #[test]
    fn test_resume_skips_weekend_pause() {
        let sla = SlaService::default();
        let params = SlaParams::default();
        // Friday 12:00 UTC, paused 13:00 Friday, reply Monday 08:00.
        let start = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let mut track = SlaTrack::start(start);
        track.pause(Utc.with_ymd_and_hms(2024, 3, 15, 13, 0, 0).unwrap());
        track.resume(Utc.with_ymd_and_hms(2024, 3, 18, 8, 0, 0).unwrap(), &params, &sla);
        // One hour lost on Friday and two on Monday morning.
        assert_eq!(
            track.started_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 18, 7, 0, 0).unwrap())
        );
        assert!(track.paused_at.is_none());
    }

    #[test]
    fn test_resume_after_night_pause_keeps_start() {
        let sla = SlaService::default();
        let params = SlaParams::default();
        let start = Utc.with_ymd_and_hms(2024, 3, 12, 10, 0, 0).unwrap();
        let mut track = SlaTrack::start(start);
        track.pause(Utc.with_ymd_and_hms(2024, 3, 12, 20, 0, 0).unwrap());
        track.resume(Utc.with_ymd_and_hms(2024, 3, 13, 5, 0, 0).unwrap(), &params, &sla);
        assert_eq!(track.started_at, Some(start));
    }
}
