//! Sign: one or more signers put a signature on the application.

use chrono::{DateTime, Utc};
use pipewright_types::{
    BlockKind, DelegationType, ErrorKind, HumanStatus, Member, StepStatus, TaskStatus, UpdateAction,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::approver::{AdditionalApprover, Decision};
use super::common::{
    SlaParams, SlaTrack, check_comment, logins_from_paths, mail, not_member, push_unique,
    unexpected_action,
};
use super::{Block, Progress};
use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignersType {
    #[default]
    User,
    Initiator,
    Group,
    FromSchema,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningRule {
    #[default]
    AnyOf,
    AllOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignDecision {
    Signed,
    Rejected,
    Error,
}

impl SignDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignDecision::Signed => "signed",
            SignDecision::Rejected => "rejected",
            SignDecision::Error => "error",
        }
    }

    fn human_status(&self) -> HumanStatus {
        match self {
            SignDecision::Signed => HumanStatus::Signed,
            SignDecision::Rejected => HumanStatus::Rejected,
            SignDecision::Error => HumanStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignParams {
    pub signers_type: SignersType,
    pub signers: Vec<String>,
    pub signers_from_schema: String,
    pub signers_group_id: String,
    pub signing_rule: SigningRule,
    /// Signature flavour the client produces (`simple`, `qualified`...).
    pub sign_type: String,
    /// Variable holding the signer's personal insurance number.
    pub snils_path: String,
    /// Variable holding the signer's taxpayer number.
    pub inn_path: String,
    /// Variables holding the files to sign.
    pub files_paths: Vec<String>,
    #[serde(flatten)]
    pub sla: SlaParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub login: String,
    pub decision: SignDecision,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub signatures: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignState {
    pub signers: Vec<String>,
    pub rule: SigningRule,
    pub sign_type: String,
    pub snils: Option<String>,
    pub inn: Option<String>,
    pub files: Vec<Value>,
    pub decision: Option<SignDecision>,
    pub comment: Option<String>,
    pub actual_signer: Option<String>,
    pub log: Vec<SignatureEntry>,
    pub additional_approvers: Vec<AdditionalApprover>,
    pub sla: SlaTrack,
}

impl SignState {
    fn signed_by(&self, login: &str) -> bool {
        self.log
            .iter()
            .any(|e| e.login == login && e.decision == SignDecision::Signed)
    }

    fn pending_additional(&self) -> bool {
        self.additional_approvers.iter().any(|a| a.decision.is_none())
    }

    fn finish(&mut self, decision: SignDecision, login: &str, comment: String) -> Progress {
        self.decision = Some(decision);
        self.comment = Some(comment);
        self.actual_signer = Some(login.to_string());
        Progress::finished(decision.as_str()).human(decision.human_status())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.decision.is_some() {
            return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "decision already set"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SignActionParams {
    decision: SignDecision,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    attachments: Vec<String>,
    #[serde(default)]
    signatures: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddApproversParams {
    additional_approvers: Vec<String>,
    question: String,
    attachments: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AdditionalDecisionParams {
    decision: Decision,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    attachments: Vec<String>,
}

pub struct Sign;

impl Sign {
    fn sign(state: &mut SignState, ctx: &mut BlockCtx<'_>, login: &str) -> Result<Progress> {
        state.ensure_open()?;
        if !state.signers.iter().any(|s| s == login) {
            return Err(not_member(login));
        }
        if state.pending_additional() {
            return Err(EngineError::rejected(
                ErrorKind::Validation,
                "additional approvers have not decided yet",
            ));
        }
        if state.signed_by(login) {
            return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "already signed"));
        }
        let p: SignActionParams = ctx.params()?;
        check_comment(&p.comment, &p.attachments)?;
        state.log.push(SignatureEntry {
            login: login.to_string(),
            decision: p.decision,
            comment: p.comment.clone(),
            signatures: p.signatures,
            created_at: ctx.now,
        });
        ctx.event(
            "sign_decision",
            json!({"login": login, "decision": p.decision.as_str()}),
        );
        let complete = match (p.decision, state.rule) {
            (SignDecision::Signed, SigningRule::AllOf) => {
                state.signers.iter().all(|s| state.signed_by(s))
            }
            _ => true,
        };
        if !complete {
            return Ok(Progress::running().human(HumanStatus::Signing));
        }
        let initiator = ctx.frame.initiator.clone();
        mail(ctx, vec![initiator], format!("Application {}", p.decision.as_str()));
        Ok(state.finish(p.decision, login, p.comment))
    }

    fn add_approvers(state: &mut SignState, ctx: &mut BlockCtx<'_>, login: &str) -> Result<Progress> {
        state.ensure_open()?;
        if !state.signers.iter().any(|s| s == login) {
            return Err(not_member(login));
        }
        let p: AddApproversParams = ctx.params()?;
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
            if exists || extra == login {
                continue;
            }
            state.additional_approvers.push(AdditionalApprover {
                login: extra.clone(),
                base_approver: login.to_string(),
                question: p.question.clone(),
                decision: None,
                comment: String::new(),
                attachments: p.attachments.clone(),
                decided_at: None,
            });
            added.push(extra);
        }
        mail(ctx, added, "Approval before signing requested".into());
        Ok(Progress::running().human(HumanStatus::Signing))
    }

    fn additional_decision(
        state: &mut SignState,
        ctx: &mut BlockCtx<'_>,
        login: &str,
    ) -> Result<Progress> {
        state.ensure_open()?;
        let delegates = ctx.delegations.filter_by_type(DelegationType::Approvement);
        let p: AdditionalDecisionParams = ctx.params()?;
        if p.decision == Decision::SendEdit {
            return Err(EngineError::rejected(
                ErrorKind::Validation,
                "additional approvers approve or reject",
            ));
        }
        check_comment(&p.comment, &p.attachments)?;
        let mut notify = Vec::new();
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
        }
        if notify.is_empty() {
            let known = state.additional_approvers.iter().any(|a| a.login == login);
            return Err(if known {
                EngineError::rejected(ErrorKind::DecisionAlreadySet, "decision already set")
            } else {
                not_member(login)
            });
        }
        mail(ctx, notify, "Additional approver decided".into());
        if p.decision == Decision::Reject {
            return Ok(state.finish(SignDecision::Rejected, login, p.comment));
        }
        Ok(Progress::running().human(HumanStatus::Signing))
    }
}

impl Block for Sign {
    const KIND: BlockKind = BlockKind::Sign;

    type Params = SignParams;
    type State = SignState;

    fn validate(params: &SignParams) -> std::result::Result<(), String> {
        let ok = match params.signers_type {
            SignersType::User => !params.signers.is_empty(),
            SignersType::Initiator => true,
            SignersType::Group => !params.signers_group_id.is_empty(),
            SignersType::FromSchema => !params.signers_from_schema.trim().is_empty(),
        };
        if !ok {
            return Err("sign block needs signers".into());
        }
        Ok(())
    }

    fn create_state(params: &SignParams, ctx: &mut BlockCtx<'_>) -> Result<SignState> {
        let mut signers = Vec::new();
        match params.signers_type {
            SignersType::User => push_unique(&mut signers, params.signers.iter().cloned()),
            SignersType::Initiator => signers.push(ctx.frame.initiator.clone()),
            SignersType::Group => push_unique(
                &mut signers,
                ctx.services.groups.members(&params.signers_group_id),
            ),
            SignersType::FromSchema => push_unique(
                &mut signers,
                logins_from_paths(ctx.vars, &params.signers_from_schema),
            ),
        }
        if signers.is_empty() {
            return Err(EngineError::block("no signers resolved"));
        }
        let text_at = |path: &str| -> Option<String> {
            if path.is_empty() {
                return None;
            }
            ctx.vars.get(path).and_then(Value::as_str).map(String::from)
        };
        let snils = text_at(&params.snils_path);
        let inn = text_at(&params.inn_path);
        let files = params
            .files_paths
            .iter()
            .filter_map(|p| ctx.vars.get(p))
            .flat_map(|v| match v {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            })
            .collect();
        Ok(SignState {
            signers,
            rule: params.signing_rule,
            sign_type: params.sign_type.clone(),
            snils,
            inn,
            files,
            sla: SlaTrack::start(ctx.step_time),
            ..SignState::default()
        })
    }

    fn update(_params: &SignParams, state: &mut SignState, ctx: &mut BlockCtx<'_>) -> Result<Progress> {
        let Some(action) = ctx.action() else {
            let to = state.signers.clone();
            mail(ctx, to, "Application to sign".into());
            return Ok(Progress::running().human(HumanStatus::Signing));
        };
        let login = ctx.by_login().to_string();
        match action {
            UpdateAction::Sign => Self::sign(state, ctx, &login),
            UpdateAction::AddApprovers => Self::add_approvers(state, ctx, &login),
            UpdateAction::AdditionalApprovement => Self::additional_decision(state, ctx, &login),
            UpdateAction::HalfSlaBreach => {
                state.sla.half_sla_checked = true;
                let to = state.signers.clone();
                mail(ctx, to, "Half of the signing SLA has passed".into());
                Ok(Progress::running())
            }
            UpdateAction::SlaBreach => {
                state.sla.sla_checked = true;
                let to = state.signers.clone();
                mail(ctx, to, "Signing SLA breached".into());
                Ok(Progress::running())
            }
            UpdateAction::ReworkSlaBreach => {
                state.sla.rework_sla_checked = true;
                Ok(Progress::running())
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
                state.decision = None;
                state.comment = None;
                state.actual_signer = None;
                state.log.clear();
                state.additional_approvers.clear();
                state.sla = SlaTrack::start(ctx.now);
                Ok(Progress::running().human(HumanStatus::Signing))
            }
            other => Err(unexpected_action(Some(other), "sign")),
        }
    }

    fn outputs(state: &SignState) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert(
            "decision".into(),
            state.decision.map_or(Value::Null, |d| Value::String(d.as_str().into())),
        );
        out.insert("comment".into(), state.comment.clone().map_or(Value::Null, Value::String));
        out.insert(
            "signer".into(),
            state.actual_signer.clone().map_or(Value::Null, Value::String),
        );
        let signatures: Vec<Value> = state
            .log
            .iter()
            .filter(|e| e.decision == SignDecision::Signed)
            .flat_map(|e| e.signatures.iter().cloned())
            .collect();
        if !signatures.is_empty() {
            out.insert("signatures".into(), Value::Array(signatures));
        }
        out
    }

    fn apply_outputs(state: &mut SignState, outputs: &Map<String, Value>) -> Result<()> {
        if let Some(raw) = outputs.get("decision") {
            state.decision = serde_json::from_value(raw.clone()).map_err(|e| {
                EngineError::rejected(ErrorKind::MonitoringEditBlockParse, e.to_string())
            })?;
        }
        if let Some(raw) = outputs.get("comment") {
            state.comment = raw.as_str().map(String::from);
        }
        if let Some(raw) = outputs.get("signer") {
            state.actual_signer = raw.as_str().map(String::from);
        }
        Ok(())
    }

    fn members(state: &SignState) -> Vec<Member> {
        state
            .signers
            .iter()
            .map(|s| Member {
                login: s.clone(),
                is_acted: state.log.iter().any(|e| &e.login == s),
            })
            .chain(state.additional_approvers.iter().map(|a| Member {
                login: a.login.clone(),
                is_acted: a.decision.is_some(),
            }))
            .collect()
    }

    fn deadlines(
        params: &SignParams,
        state: &SignState,
        ctx: &BlockCtx<'_>,
    ) -> Vec<(UpdateAction, DateTime<Utc>)> {
        if state.decision.is_some() {
            return Vec::new();
        }
        state.sla.deadlines(&params.sla, ctx)
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::Sign, "Sign")
            .params(json!({"signers_type": "user", "signers": [], "signing_rule": "any_of", "sign_type": "simple"}))
            .output("decision", "string", "signed, rejected or error")
            .output("comment", "string", "comment of the signer")
            .output("signer", "string", "login of the last signer")
            .output("signatures", "array", "collected signatures")
            .sockets(&["signed", "rejected", "error"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing::Harness;
    use pipewright_types::{BlockDefinition, UpdateDescriptor};

    fn harness(params: Value) -> Harness {
        Harness::new("sign_0", BlockDefinition::new(BlockKind::Sign).with_params(params))
    }

    fn sign(login: &str, decision: &str) -> UpdateDescriptor {
        UpdateDescriptor::new(
            UpdateAction::Sign,
            login,
            json!({"decision": decision, "signatures": [{"file": "f1", "sig": login}]}),
        )
    }

    #[test]
    fn test_all_of_waits_for_every_signer() {
        let mut h = harness(json!({"signers": ["s1", "s2"], "signing_rule": "all_of"}));
        h.enter::<Sign>().unwrap();
        let out = h.act::<Sign>(sign("s1", "signed")).unwrap();
        assert_eq!(out.progress.status, StepStatus::Running);
        assert_eq!(
            h.act::<Sign>(sign("s1", "signed")).unwrap_err().kind(),
            ErrorKind::DecisionAlreadySet
        );
        let out = h.act::<Sign>(sign("s2", "signed")).unwrap();
        assert_eq!(out.progress.sockets, vec!["signed"]);
        assert_eq!(h.vars.get("sign_0.signatures").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_pending_additional_approver_blocks_signing() {
        let mut h = harness(json!({"signers": ["s1"]}));
        h.enter::<Sign>().unwrap();
        h.act::<Sign>(UpdateDescriptor::new(
            UpdateAction::AddApprovers,
            "s1",
            json!({"additional_approvers": ["lawyer"], "question": "ok?"}),
        ))
        .unwrap();
        assert_eq!(
            h.act::<Sign>(sign("s1", "signed")).unwrap_err().kind(),
            ErrorKind::Validation
        );
        h.act::<Sign>(UpdateDescriptor::new(
            UpdateAction::AdditionalApprovement,
            "lawyer",
            json!({"decision": "approve"}),
        ))
        .unwrap();
        let out = h.act::<Sign>(sign("s1", "signed")).unwrap();
        assert_eq!(out.progress.human_status, Some(HumanStatus::Signed));
    }

    #[test]
    fn test_additional_reject_rejects_block() {
        let mut h = harness(json!({"signers": ["s1"]}));
        h.enter::<Sign>().unwrap();
        h.act::<Sign>(UpdateDescriptor::new(
            UpdateAction::AddApprovers,
            "s1",
            json!({"additional_approvers": ["lawyer"]}),
        ))
        .unwrap();
        let out = h
            .act::<Sign>(UpdateDescriptor::new(
                UpdateAction::AdditionalApprovement,
                "lawyer",
                json!({"decision": "reject", "comment": "no"}),
            ))
            .unwrap();
        assert_eq!(out.progress.sockets, vec!["rejected"]);
        assert_eq!(h.vars.get("sign_0.decision"), Some(&json!("rejected")));
    }

    #[test]
    fn test_files_resolved_from_paths() {
        let mut h = harness(json!({
            "signers": ["s1"],
            "files_paths": ["form_0.contract", "form_0.annexes"],
            "inn_path": "form_0.inn"
        }));
        h.vars.set_value("form_0.contract", json!({"file_id": "c"}));
        h.vars.set_value("form_0.annexes", json!([{"file_id": "a1"}, {"file_id": "a2"}]));
        h.vars.set_value("form_0.inn", json!("7700000000"));
        h.enter::<Sign>().unwrap();
        let state = h.state::<Sign>();
        assert_eq!(state.files.len(), 3);
        assert_eq!(state.inn.as_deref(), Some("7700000000"));
        assert!(state.snils.is_none());
    }

    #[test]
    fn test_outsider_cannot_sign() {
        let mut h = harness(json!({"signers": ["s1"]}));
        h.enter::<Sign>().unwrap();
        assert_eq!(
            h.act::<Sign>(sign("x", "signed")).unwrap_err().kind(),
            ErrorKind::UserNotPartOfProcess
        );
    }
}
