//! Approver: a group of people deciding approve / reject / send-to-edit.

use chrono::{DateTime, Utc};
use pipewright_types::{
    BlockKind, DelegationType, ErrorKind, HumanStatus, Member, StepStatus, TaskStatus, UpdateAction,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::common::{
    EditAppEntry, FormAccess, InfoEntry, InfoKind, InfoParams, SlaParams, SlaTrack, check_comment,
    has_open_question, logins_from_paths, mail, not_member, push_unique, unexpected_action,
};
use super::{Block, Progress};
use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::{EngineError, Result};

/// Login recorded for decisions the engine takes on an SLA breach.
pub const AUTO_APPROVER: &str = "auto_approve";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovementRule {
    #[default]
    AnyOf,
    AllOf,
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    SendEdit,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::SendEdit => "send_edit",
        }
    }

    fn socket(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::SendEdit => "edit_app",
        }
    }

    fn human_status(&self) -> HumanStatus {
        match self {
            Decision::Approve => HumanStatus::Approved,
            Decision::Reject => HumanStatus::Rejected,
            Decision::SendEdit => HumanStatus::Wait,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApproverParams {
    pub approvers: Vec<String>,
    /// Semicolon-separated variable paths naming more approvers.
    pub approvers_from_schema: String,
    pub approvers_group_id: String,
    pub approvement_rule: ApprovementRule,
    pub wait_all_decisions: bool,
    #[serde(flatten)]
    pub sla: SlaParams,
    pub auto_action: Option<Decision>,
    pub is_editable: bool,
    pub forms_accessibility: Vec<FormAccess>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Decision,
    AdditionalDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproverLogEntry {
    pub login: String,
    pub decision: Decision,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// The approver `login` acted for, when acting as a delegate.
    #[serde(default)]
    pub delegate_for: String,
    pub kind: LogKind,
    pub created_at: DateTime<Utc>,
}

impl ApproverLogEntry {
    /// The approver this entry counts for.
    fn counts_for(&self) -> &str {
        if self.delegate_for.is_empty() {
            &self.login
        } else {
            &self.delegate_for
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalApprover {
    pub login: String,
    pub base_approver: String,
    #[serde(default)]
    pub question: String,
    pub decision: Option<Decision>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproverState {
    pub approvers: Vec<String>,
    pub approvement_rule: ApprovementRule,
    pub wait_all_decisions: bool,
    pub decision: Option<Decision>,
    pub comment: Option<String>,
    pub decision_by: Option<String>,
    pub log: Vec<ApproverLogEntry>,
    pub additional_approvers: Vec<AdditionalApprover>,
    pub edit_app_log: Vec<EditAppEntry>,
    pub request_info_log: Vec<InfoEntry>,
    pub forms_accessibility: Vec<FormAccess>,
    pub is_editable: bool,
    pub auto_action: Option<Decision>,
    /// Sent back to the initiator for rework inside this block.
    pub waiting_rework: bool,
    pub sla: SlaTrack,
}

impl ApproverState {
    fn decided(&self, approver: &str) -> bool {
        self.log
            .iter()
            .any(|e| e.kind == LogKind::Decision && e.counts_for() == approver)
    }

    fn tally(&self) -> (usize, usize, usize) {
        let mut approve = 0;
        let mut reject = 0;
        let mut edit = 0;
        for e in self.log.iter().filter(|e| e.kind == LogKind::Decision) {
            match e.decision {
                Decision::Approve => approve += 1,
                Decision::Reject => reject += 1,
                Decision::SendEdit => edit += 1,
            }
        }
        (approve, reject, edit)
    }

    /// The group's decision once it is settled.
    fn group_decision(&self, last: Decision) -> Option<Decision> {
        let n = self.approvers.len();
        let (approve, reject, edit) = self.tally();
        match self.approvement_rule {
            ApprovementRule::AnyOf if !self.wait_all_decisions => Some(last),
            ApprovementRule::Majority => {
                if last == Decision::SendEdit {
                    Some(Decision::SendEdit)
                } else if approve * 2 > n {
                    Some(Decision::Approve)
                } else if reject * 2 >= n {
                    Some(Decision::Reject)
                } else {
                    None
                }
            }
            _ => {
                if last == Decision::Reject && !self.wait_all_decisions {
                    return Some(Decision::Reject);
                }
                if approve + reject + edit < n {
                    return None;
                }
                if reject > 0 {
                    Some(Decision::Reject)
                } else if edit > 0 {
                    Some(Decision::SendEdit)
                } else {
                    Some(Decision::Approve)
                }
            }
        }
    }

    fn finish(&mut self, decision: Decision, by: &str, comment: String) -> Progress {
        self.decision = Some(decision);
        self.decision_by = Some(by.to_string());
        self.comment = Some(comment);
        Progress::finished(decision.socket()).human(decision.human_status())
    }
}

#[derive(Debug, Deserialize)]
struct DecisionParams {
    decision: Decision,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    attachments: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddApproversParams {
    additional_approvers: Vec<String>,
    question: String,
    attachments: Vec<String>,
}

pub struct Approver;

impl Approver {
    fn decide(
        state: &mut ApproverState,
        ctx: &mut BlockCtx<'_>,
        login: &str,
        p: DecisionParams,
    ) -> Result<Progress> {
        if state.decision.is_some() {
            return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "decision already set"));
        }
        if state.waiting_rework || has_open_question(&state.request_info_log) {
            return Err(EngineError::rejected(
                ErrorKind::Validation,
                "waiting for the initiator's reply",
            ));
        }
        if p.decision == Decision::SendEdit && !state.is_editable {
            return Err(EngineError::rejected(ErrorKind::Validation, "block is not editable"));
        }
        check_comment(&p.comment, &p.attachments)?;

        let is_approver = state.approvers.iter().any(|a| a == login);
        let delegates = ctx.delegations.filter_by_type(DelegationType::Approvement);
        let covered: Vec<String> = if login == AUTO_APPROVER {
            vec![login.to_string()]
        } else {
            let mut covered = Vec::new();
            if is_approver {
                covered.push(login.to_string());
            }
            for approver in &state.approvers {
                if approver != login && delegates.is_delegate(login, approver) {
                    covered.push(approver.clone());
                }
            }
            covered
        };
        if covered.is_empty() {
            return Err(not_member(login));
        }

        let group = state.approvement_rule != ApprovementRule::AnyOf || state.wait_all_decisions;
        let open: Vec<String> = if group && login != AUTO_APPROVER {
            covered.into_iter().filter(|a| !state.decided(a)).collect()
        } else {
            covered.into_iter().take(1).collect()
        };
        if open.is_empty() {
            return Err(EngineError::rejected(
                ErrorKind::DecisionAlreadySet,
                format!("decision of user {login} is already set"),
            ));
        }
        for approver in &open {
            state.log.push(ApproverLogEntry {
                login: login.to_string(),
                decision: p.decision,
                comment: p.comment.clone(),
                attachments: p.attachments.clone(),
                delegate_for: if approver == login { String::new() } else { approver.clone() },
                kind: LogKind::Decision,
                created_at: ctx.now,
            });
        }

        let settled = if login == AUTO_APPROVER {
            Some(p.decision)
        } else {
            state.group_decision(p.decision)
        };
        let Some(decision) = settled else {
            return Ok(Progress::running().human(HumanStatus::Approvement));
        };
        ctx.event("approver_decision", json!({"decision": decision.as_str(), "login": login}));
        if decision == Decision::SendEdit {
            state.edit_app_log.push(EditAppEntry {
                login: login.to_string(),
                comment: p.comment.clone(),
                delegate_for: String::new(),
                created_at: ctx.now,
            });
        }
        Ok(state.finish(decision, login, p.comment))
    }

    fn additional_decision(
        state: &mut ApproverState,
        ctx: &mut BlockCtx<'_>,
        login: &str,
        p: DecisionParams,
    ) -> Result<Progress> {
        let logins: Vec<String> = state.additional_approvers.iter().map(|a| a.login.clone()).collect();
        let delegates = ctx.delegations.filter_by_type(DelegationType::Approvement);
        let delegate_for = delegates.find_delegator_for(login, logins.iter());
        if !logins.iter().any(|l| l == login) && delegate_for.is_none() {
            return Err(not_member(login));
        }
        if state.decision.is_some() {
            return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "decision already set"));
        }
        if p.decision == Decision::SendEdit {
            return Err(EngineError::rejected(
                ErrorKind::Validation,
                "additional approvers approve or reject",
            ));
        }
        check_comment(&p.comment, &p.attachments)?;

        let mut notify = Vec::new();
        let mut updated = false;
        for extra in state.additional_approvers.iter_mut() {
            let acts = extra.login == login || delegates.is_delegate(login, &extra.login);
            if !acts || extra.decision.is_some() {
                continue;
            }
            extra.decision = Some(p.decision);
            extra.comment = p.comment.clone();
            extra.attachments = p.attachments.clone();
            extra.decided_at = Some(ctx.now);
            notify.push(extra.base_approver.clone());
            let delegate_for = if extra.login == login { String::new() } else { extra.login.clone() };
            state.log.push(ApproverLogEntry {
                login: login.to_string(),
                decision: p.decision,
                comment: p.comment.clone(),
                attachments: p.attachments.clone(),
                delegate_for,
                kind: LogKind::AdditionalDecision,
                created_at: ctx.now,
            });
            updated = true;
        }
        if !updated {
            return Err(EngineError::rejected(
                ErrorKind::DecisionAlreadySet,
                "can't approve any request",
            ));
        }
        mail(ctx, notify, "Additional approver decided".into());
        Ok(Progress::running().human(HumanStatus::Approvement))
    }

    fn add_approvers(
        state: &mut ApproverState,
        ctx: &mut BlockCtx<'_>,
        login: &str,
        p: AddApproversParams,
    ) -> Result<Progress> {
        if state.decision.is_some() {
            return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "decision already set"));
        }
        let delegates = ctx.delegations.filter_by_type(DelegationType::Approvement);
        let is_approver = state.approvers.iter().any(|a| a == login);
        let base = if is_approver {
            login.to_string()
        } else {
            delegates
                .find_delegator_for(login, state.approvers.iter())
                .ok_or_else(|| not_member(login))?
        };
        check_comment(&p.question, &p.attachments)?;
        if p.additional_approvers.is_empty() {
            return Err(EngineError::rejected(ErrorKind::Validation, "no approvers to add"));
        }
        let mut added = Vec::new();
        for extra in p.additional_approvers {
            let exists = state
                .additional_approvers
                .iter()
                .any(|a| a.login == extra && a.decision.is_none());
            if exists || extra == base {
                continue;
            }
            state.additional_approvers.push(AdditionalApprover {
                login: extra.clone(),
                base_approver: base.clone(),
                question: p.question.clone(),
                decision: None,
                comment: String::new(),
                attachments: p.attachments.clone(),
                decided_at: None,
            });
            added.push(extra);
        }
        mail(ctx, added, "Additional approval requested".into());
        Ok(Progress::running().human(HumanStatus::Approvement))
    }
}

impl Block for Approver {
    const KIND: BlockKind = BlockKind::Approver;

    type Params = ApproverParams;
    type State = ApproverState;

    fn validate(params: &ApproverParams) -> std::result::Result<(), String> {
        if params.approvers.is_empty()
            && params.approvers_from_schema.trim().is_empty()
            && params.approvers_group_id.is_empty()
        {
            return Err("approver block needs approvers".into());
        }
        if params.sla.check_sla && params.sla.sla <= 0.0 {
            return Err("sla must be positive when check_sla is set".into());
        }
        Ok(())
    }

    fn create_state(params: &ApproverParams, ctx: &mut BlockCtx<'_>) -> Result<ApproverState> {
        let mut approvers = Vec::new();
        push_unique(&mut approvers, params.approvers.iter().cloned());
        push_unique(&mut approvers, logins_from_paths(ctx.vars, &params.approvers_from_schema));
        if !params.approvers_group_id.is_empty() {
            push_unique(&mut approvers, ctx.services.groups.members(&params.approvers_group_id));
        }
        if approvers.is_empty() {
            return Err(EngineError::block("no approvers resolved"));
        }
        Ok(ApproverState {
            approvers,
            approvement_rule: params.approvement_rule,
            wait_all_decisions: params.wait_all_decisions,
            forms_accessibility: params.forms_accessibility.clone(),
            is_editable: params.is_editable,
            auto_action: params.auto_action,
            sla: SlaTrack::start(ctx.step_time),
            ..ApproverState::default()
        })
    }

    fn update(
        params: &ApproverParams,
        state: &mut ApproverState,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress> {
        let Some(action) = ctx.action() else {
            let to = state.approvers.clone();
            mail(ctx, to, "Approval required".into());
            ctx.event("approver_started", json!({"approvers": state.approvers}));
            return Ok(Progress::running().human(HumanStatus::Approvement));
        };
        let login = ctx.by_login().to_string();
        match action {
            UpdateAction::Approvement => {
                let p: DecisionParams = ctx.params()?;
                Self::decide(state, ctx, &login, p)
            }
            UpdateAction::AdditionalApprovement => {
                let p: DecisionParams = ctx.params()?;
                Self::additional_decision(state, ctx, &login, p)
            }
            UpdateAction::AddApprovers => {
                let p: AddApproversParams = ctx.params()?;
                Self::add_approvers(state, ctx, &login, p)
            }
            UpdateAction::ApproverSendEditApp => {
                if state.decision.is_some() {
                    return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "decision already set"));
                }
                if !state.is_editable {
                    return Err(EngineError::rejected(ErrorKind::Validation, "block is not editable"));
                }
                let delegates = ctx.delegations.filter_by_type(DelegationType::Approvement);
                let delegate_for = if state.approvers.contains(&login) {
                    String::new()
                } else {
                    delegates
                        .find_delegator_for(&login, state.approvers.iter())
                        .ok_or_else(|| not_member(&login))?
                };
                let p: InfoParams = ctx.params()?;
                check_comment(&p.comment, &p.attachments)?;
                state.edit_app_log.push(EditAppEntry {
                    login,
                    comment: p.comment,
                    delegate_for,
                    created_at: ctx.now,
                });
                state.waiting_rework = true;
                state.sla.pause(ctx.now);
                state.sla.rework_started_at = Some(ctx.now);
                state.sla.rework_sla_checked = false;
                let initiator = ctx.frame.initiator.clone();
                mail(ctx, vec![initiator], "Application sent back for rework".into());
                Ok(Progress::idle().human(HumanStatus::Wait))
            }
            UpdateAction::RequestApproveInfo => {
                let delegates = ctx.delegations.filter_by_type(DelegationType::Approvement);
                if !state.approvers.contains(&login)
                    && delegates.find_delegator_for(&login, state.approvers.iter()).is_none()
                {
                    return Err(not_member(&login));
                }
                if state.decision.is_some() {
                    return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "decision already set"));
                }
                let p: InfoParams = ctx.params()?;
                check_comment(&p.comment, &p.attachments)?;
                state.request_info_log.push(InfoEntry {
                    login,
                    comment: p.comment,
                    kind: InfoKind::Question,
                    attachments: p.attachments,
                    created_at: ctx.now,
                });
                state.sla.pause(ctx.now);
                let initiator = ctx.frame.initiator.clone();
                mail(ctx, vec![initiator], "Additional information requested".into());
                Ok(Progress::idle().human(HumanStatus::Wait))
            }
            UpdateAction::ReplyApproverInfo => {
                if login != ctx.frame.initiator {
                    return Err(not_member(&login));
                }
                if !has_open_question(&state.request_info_log) && !state.waiting_rework {
                    return Err(EngineError::rejected(ErrorKind::Validation, "no pending question"));
                }
                let p: InfoParams = ctx.params()?;
                check_comment(&p.comment, &p.attachments)?;
                state.request_info_log.push(InfoEntry {
                    login,
                    comment: p.comment,
                    kind: InfoKind::Reply,
                    attachments: p.attachments,
                    created_at: ctx.now,
                });
                state.waiting_rework = false;
                state.sla.rework_started_at = None;
                state.sla.resume(ctx.now, &params.sla, &ctx.services.sla);
                let to = state.approvers.clone();
                mail(ctx, to, "Initiator replied".into());
                Ok(Progress::running().human(HumanStatus::Approvement))
            }
            UpdateAction::HalfSlaBreach => {
                state.sla.half_sla_checked = true;
                let to = state.approvers.clone();
                mail(ctx, to, "Half of the approval SLA has passed".into());
                Ok(Progress::running())
            }
            UpdateAction::SlaBreach => {
                state.sla.sla_checked = true;
                ctx.event("sla_breached", Value::Null);
                match state.auto_action {
                    Some(decision) if state.decision.is_none() => Self::decide(
                        state,
                        ctx,
                        AUTO_APPROVER,
                        DecisionParams {
                            decision,
                            comment: "decided automatically after SLA breach".into(),
                            attachments: Vec::new(),
                        },
                    ),
                    _ => {
                        let to = state.approvers.clone();
                        mail(ctx, to, "Approval SLA breached".into());
                        Ok(Progress::running())
                    }
                }
            }
            UpdateAction::ReworkSlaBreach => {
                state.sla.rework_sla_checked = true;
                state.waiting_rework = false;
                state.decision = Some(Decision::Reject);
                state.decision_by = Some(AUTO_APPROVER.to_string());
                state.comment = Some("rework time is over".into());
                Ok(Progress::with_status(StepStatus::Canceled)
                    .human(HumanStatus::Rejected)
                    .task(TaskStatus::Canceled))
            }
            UpdateAction::CancelApp => {
                if login != ctx.frame.initiator {
                    return Err(not_member(&login));
                }
                Ok(Progress::with_status(StepStatus::Canceled)
                    .human(HumanStatus::Revoke)
                    .task(TaskStatus::Canceled))
            }
            UpdateAction::Reload => {
                if state.decision.is_some() {
                    state.decision = None;
                    state.decision_by = None;
                    state.comment = None;
                    state.log.clear();
                }
                state.waiting_rework = false;
                state.sla = SlaTrack::start(ctx.now);
                Ok(Progress::running().human(HumanStatus::Approvement))
            }
            other => Err(unexpected_action(Some(other), "approver")),
        }
    }

    fn outputs(state: &ApproverState) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert(
            "decision".into(),
            state.decision.map_or(Value::Null, |d| Value::String(d.as_str().into())),
        );
        out.insert("comment".into(), state.comment.clone().map_or(Value::Null, Value::String));
        out.insert(
            "approver".into(),
            state.decision_by.clone().map_or(Value::Null, Value::String),
        );
        out
    }

    fn apply_outputs(state: &mut ApproverState, outputs: &Map<String, Value>) -> Result<()> {
        if let Some(raw) = outputs.get("decision") {
            state.decision = serde_json::from_value(raw.clone()).map_err(|e| {
                EngineError::rejected(ErrorKind::MonitoringEditBlockParse, e.to_string())
            })?;
        }
        if let Some(raw) = outputs.get("comment") {
            state.comment = raw.as_str().map(String::from);
        }
        if let Some(raw) = outputs.get("approver") {
            state.decision_by = raw.as_str().map(String::from);
        }
        Ok(())
    }

    fn members(state: &ApproverState) -> Vec<Member> {
        let mut members: Vec<Member> = state
            .approvers
            .iter()
            .map(|a| Member {
                login: a.clone(),
                is_acted: state.decided(a) || state.decision_by.as_deref() == Some(a),
            })
            .collect();
        for extra in &state.additional_approvers {
            if members.iter().any(|m| m.login == extra.login) {
                continue;
            }
            members.push(Member {
                login: extra.login.clone(),
                is_acted: extra.decision.is_some(),
            });
        }
        members
    }

    fn deadlines(
        params: &ApproverParams,
        state: &ApproverState,
        ctx: &BlockCtx<'_>,
    ) -> Vec<(UpdateAction, DateTime<Utc>)> {
        if state.decision.is_some() {
            return Vec::new();
        }
        let mut out = state.sla.deadlines(&params.sla, ctx);
        if state.waiting_rework {
            out.retain(|(a, _)| *a == UpdateAction::ReworkSlaBreach);
        }
        out
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::Approver, "Approval")
            .params(json!({"approvers": [], "approvement_rule": "any_of", "sla": 8, "check_sla": false, "work_type": "8/5"}))
            .output("decision", "string", "approve, reject or send_edit")
            .output("comment", "string", "comment of the deciding approver")
            .output("approver", "string", "login that made the decision")
            .sockets(&["approve", "reject", "edit_app"])
    }
}
