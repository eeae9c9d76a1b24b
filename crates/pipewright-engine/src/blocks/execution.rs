//! Execution: a person (or a queue of them) carrying out the work.

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

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorsType {
    #[default]
    User,
    Group,
    FromSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionDecision {
    Executed,
    Rejected,
    SentEdit,
}

impl ExecutionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionDecision::Executed => "executed",
            ExecutionDecision::Rejected => "rejected",
            ExecutionDecision::SentEdit => "sent_edit",
        }
    }

    fn socket(&self) -> &'static str {
        match self {
            ExecutionDecision::Executed => "executed",
            ExecutionDecision::Rejected => "rejected",
            ExecutionDecision::SentEdit => "edit_app",
        }
    }

    fn human_status(&self) -> HumanStatus {
        match self {
            ExecutionDecision::Executed => HumanStatus::Executed,
            ExecutionDecision::Rejected => HumanStatus::Rejected,
            ExecutionDecision::SentEdit => HumanStatus::Wait,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutionParams {
    pub executors_type: ExecutorsType,
    pub executors: Vec<String>,
    /// Semicolon-separated variable paths, for `from_schema`.
    pub executors_from_schema: String,
    pub executors_group_id: String,
    /// Explicit group membership; overrides the group directory.
    pub executors_from_group: Vec<String>,
    pub hide_executor: bool,
    pub is_editable: bool,
    #[serde(flatten)]
    pub sla: SlaParams,
    pub forms_accessibility: Vec<FormAccess>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakenInWorkEntry {
    pub login: String,
    #[serde(default)]
    pub delegate_for: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeExecutorEntry {
    pub old_login: String,
    pub new_login: String,
    pub comment: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionState {
    pub executors_type: ExecutorsType,
    pub executors: Vec<String>,
    pub initial_executors: Vec<String>,
    pub group_id: String,
    pub is_taken_in_work: bool,
    pub taken_in_work_log: Vec<TakenInWorkEntry>,
    pub changed_executors_logs: Vec<ChangeExecutorEntry>,
    pub request_info_log: Vec<InfoEntry>,
    pub edit_app_log: Vec<EditAppEntry>,
    pub decision: Option<ExecutionDecision>,
    pub comment: Option<String>,
    pub actual_executor: Option<String>,
    pub hide_executor: bool,
    pub is_editable: bool,
    pub forms_accessibility: Vec<FormAccess>,
    pub waiting_rework: bool,
    pub sla: SlaTrack,
}

impl ExecutionState {
    /// The executor `login` acts as: itself, or the executor it is a
    /// delegate of.
    fn acting_for(&self, login: &str, ctx: &BlockCtx<'_>) -> Result<String> {
        if self.executors.iter().any(|e| e == login) {
            return Ok(login.to_string());
        }
        ctx.delegations
            .filter_by_type(DelegationType::Execution)
            .find_delegator_for(login, self.executors.iter())
            .ok_or_else(|| not_member(login))
    }

    fn reset_executors(&mut self) {
        self.executors = self.initial_executors.clone();
        self.is_taken_in_work = false;
        self.actual_executor = None;
        self.auto_take();
    }

    /// A sole executor is in work from the start.
    fn auto_take(&mut self) {
        if self.executors.len() == 1 {
            self.is_taken_in_work = true;
            self.actual_executor = self.executors.first().cloned();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.decision.is_some() {
            return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "decision already set"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DecisionParams {
    decision: ExecutionDecision,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    attachments: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeExecutorParams {
    #[serde(alias = "login")]
    new_executor_login: String,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    attachments: Vec<String>,
}

pub struct Execution;

impl Block for Execution {
    const KIND: BlockKind = BlockKind::Execution;

    type Params = ExecutionParams;
    type State = ExecutionState;

    fn validate(params: &ExecutionParams) -> std::result::Result<(), String> {
        let ok = match params.executors_type {
            ExecutorsType::User => !params.executors.is_empty(),
            ExecutorsType::Group => {
                !params.executors_group_id.is_empty() || !params.executors_from_group.is_empty()
            }
            ExecutorsType::FromSchema => !params.executors_from_schema.trim().is_empty(),
        };
        if !ok {
            return Err("execution block needs executors".into());
        }
        Ok(())
    }

    fn create_state(params: &ExecutionParams, ctx: &mut BlockCtx<'_>) -> Result<ExecutionState> {
        let mut executors = Vec::new();
        match params.executors_type {
            ExecutorsType::User => push_unique(&mut executors, params.executors.iter().cloned()),
            ExecutorsType::Group if !params.executors_from_group.is_empty() => {
                push_unique(&mut executors, params.executors_from_group.iter().cloned())
            }
            ExecutorsType::Group => push_unique(
                &mut executors,
                ctx.services.groups.members(&params.executors_group_id),
            ),
            ExecutorsType::FromSchema => push_unique(
                &mut executors,
                logins_from_paths(ctx.vars, &params.executors_from_schema),
            ),
        }
        if executors.is_empty() {
            return Err(EngineError::block("no executors resolved"));
        }
        let mut state = ExecutionState {
            executors_type: params.executors_type,
            initial_executors: executors.clone(),
            executors,
            group_id: params.executors_group_id.clone(),
            hide_executor: params.hide_executor,
            is_editable: params.is_editable,
            forms_accessibility: params.forms_accessibility.clone(),
            sla: SlaTrack::start(ctx.step_time),
            ..ExecutionState::default()
        };
        state.auto_take();
        Ok(state)
    }

    fn update(
        params: &ExecutionParams,
        state: &mut ExecutionState,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress> {
        let Some(action) = ctx.action() else {
            let to = state.executors.clone();
            mail(ctx, to, "Work assigned".into());
            ctx.event("execution_started", json!({"executors": state.executors}));
            return Ok(Progress::running().human(HumanStatus::Execution));
        };
        let login = ctx.by_login().to_string();
        match action {
            UpdateAction::ExecutorStartWork => {
                state.ensure_open()?;
                let acting = state.acting_for(&login, ctx)?;
                if state.is_taken_in_work && state.executors.len() == 1 && state.executors[0] != acting {
                    return Err(EngineError::rejected(ErrorKind::Validation, "already taken in work"));
                }
                state.taken_in_work_log.push(TakenInWorkEntry {
                    login: login.clone(),
                    delegate_for: if acting == login { String::new() } else { acting.clone() },
                    created_at: ctx.now,
                });
                state.executors = vec![login.clone()];
                state.actual_executor = Some(login);
                state.is_taken_in_work = true;
                Ok(Progress::running().human(HumanStatus::Execution))
            }
            UpdateAction::Execution => {
                state.ensure_open()?;
                state.acting_for(&login, ctx)?;
                if !state.is_taken_in_work {
                    return Err(EngineError::rejected(ErrorKind::NotTakenInWork, "take the work first"));
                }
                if state.waiting_rework || has_open_question(&state.request_info_log) {
                    return Err(EngineError::rejected(
                        ErrorKind::Validation,
                        "waiting for the initiator's reply",
                    ));
                }
                let p: DecisionParams = ctx.params()?;
                check_comment(&p.comment, &p.attachments)?;
                if p.decision == ExecutionDecision::SentEdit {
                    if !state.is_editable {
                        return Err(EngineError::rejected(ErrorKind::Validation, "block is not editable"));
                    }
                    state.edit_app_log.push(EditAppEntry {
                        login: login.clone(),
                        comment: p.comment.clone(),
                        delegate_for: String::new(),
                        created_at: ctx.now,
                    });
                }
                state.decision = Some(p.decision);
                state.comment = Some(p.comment);
                state.actual_executor = Some(login.clone());
                ctx.event(
                    "execution_decision",
                    json!({"decision": p.decision.as_str(), "login": login}),
                );
                Ok(Progress::finished(p.decision.socket()).human(p.decision.human_status()))
            }
            UpdateAction::ChangeExecutor => {
                state.ensure_open()?;
                if !state.is_taken_in_work {
                    return Err(EngineError::rejected(ErrorKind::NotTakenInWork, "take the work first"));
                }
                let old = state.acting_for(&login, ctx)?;
                let p: ChangeExecutorParams = ctx.params()?;
                check_comment(&p.comment, &p.attachments)?;
                if p.new_executor_login.is_empty() {
                    return Err(EngineError::rejected(ErrorKind::Validation, "new executor is empty"));
                }
                state.changed_executors_logs.push(ChangeExecutorEntry {
                    old_login: old,
                    new_login: p.new_executor_login.clone(),
                    comment: p.comment,
                    attachments: p.attachments,
                    created_at: ctx.now,
                });
                state.executors = vec![p.new_executor_login.clone()];
                state.actual_executor = Some(p.new_executor_login.clone());
                state.is_taken_in_work = false;
                mail(ctx, vec![p.new_executor_login], "Work reassigned to you".into());
                Ok(Progress::running().human(HumanStatus::Execution))
            }
            UpdateAction::RequestExecutionInfo => {
                state.ensure_open()?;
                state.acting_for(&login, ctx)?;
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
            UpdateAction::ReplyExecutionInfo => {
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
                let to = state.executors.clone();
                mail(ctx, to, "Initiator replied".into());
                Ok(Progress::running().human(HumanStatus::Execution))
            }
            UpdateAction::ExecutorSendEditApp => {
                state.ensure_open()?;
                if !state.is_editable {
                    return Err(EngineError::rejected(ErrorKind::Validation, "block is not editable"));
                }
                let acting = state.acting_for(&login, ctx)?;
                let p: InfoParams = ctx.params()?;
                check_comment(&p.comment, &p.attachments)?;
                state.edit_app_log.push(EditAppEntry {
                    delegate_for: if acting == login { String::new() } else { acting },
                    login,
                    comment: p.comment,
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
            UpdateAction::HalfSlaBreach => {
                state.sla.half_sla_checked = true;
                let to = state.executors.clone();
                mail(ctx, to, "Half of the execution SLA has passed".into());
                Ok(Progress::running())
            }
            UpdateAction::SlaBreach => {
                state.sla.sla_checked = true;
                ctx.event("sla_breached", Value::Null);
                let to = state.executors.clone();
                mail(ctx, to, "Execution SLA breached".into());
                Ok(Progress::running())
            }
            UpdateAction::ReworkSlaBreach => {
                state.sla.rework_sla_checked = true;
                state.waiting_rework = false;
                state.decision = Some(ExecutionDecision::Rejected);
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
                state.decision = None;
                state.comment = None;
                state.waiting_rework = false;
                state.reset_executors();
                state.sla = SlaTrack::start(ctx.now);
                Ok(Progress::running().human(HumanStatus::Execution))
            }
            other => Err(unexpected_action(Some(other), "execution")),
        }
    }

    fn outputs(state: &ExecutionState) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert(
            "decision".into(),
            state.decision.map_or(Value::Null, |d| Value::String(d.as_str().into())),
        );
        out.insert("comment".into(), state.comment.clone().map_or(Value::Null, Value::String));
        out.insert(
            "executor".into(),
            state.actual_executor.clone().map_or(Value::Null, Value::String),
        );
        out
    }

    fn apply_outputs(state: &mut ExecutionState, outputs: &Map<String, Value>) -> Result<()> {
        if let Some(raw) = outputs.get("decision") {
            state.decision = serde_json::from_value(raw.clone()).map_err(|e| {
                EngineError::rejected(ErrorKind::MonitoringEditBlockParse, e.to_string())
            })?;
        }
        if let Some(raw) = outputs.get("comment") {
            state.comment = raw.as_str().map(String::from);
        }
        if let Some(raw) = outputs.get("executor") {
            state.actual_executor = raw.as_str().map(String::from);
        }
        Ok(())
    }

    fn members(state: &ExecutionState) -> Vec<Member> {
        state
            .executors
            .iter()
            .map(|e| Member {
                login: e.clone(),
                is_acted: state.decision.is_some() && state.actual_executor.as_deref() == Some(e),
            })
            .collect()
    }

    fn deadlines(
        params: &ExecutionParams,
        state: &ExecutionState,
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
        BlockModel::new(BlockKind::Execution, "Execution")
            .params(json!({"executors_type": "user", "executors": [], "sla": 8, "check_sla": false, "work_type": "8/5"}))
            .output("decision", "string", "executed, rejected or sent_edit")
            .output("comment", "string", "comment of the executor")
            .output("executor", "string", "login of the actual executor")
            .sockets(&["executed", "rejected", "edit_app"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing::Harness;
    use pipewright_types::{BlockDefinition, UpdateDescriptor};

    fn group_harness() -> Harness {
        let def = BlockDefinition::new(BlockKind::Execution).with_params(json!({
            "executors_type": "group",
            "executors_group_id": "G",
            "executors_from_group": ["u3", "u4"]
        }));
        Harness::new("execution_0", def)
    }

    #[test]
    fn test_take_in_work_then_change_executor() {
        let mut h = group_harness();
        h.enter::<Execution>().unwrap();
        assert!(!h.state::<Execution>().is_taken_in_work);

        h.act::<Execution>(UpdateDescriptor::new(UpdateAction::ExecutorStartWork, "u3", Value::Null))
            .unwrap();
        let state = h.state::<Execution>();
        assert_eq!(state.executors, vec!["u3"]);
        assert!(state.is_taken_in_work);

        let out = h
            .act::<Execution>(UpdateDescriptor::new(
                UpdateAction::ChangeExecutor,
                "u3",
                json!({"new_executor_login": "u4", "comment": "hand-off"}),
            ))
            .unwrap();
        assert_eq!(out.progress.status, StepStatus::Running);
        let state = h.state::<Execution>();
        assert_eq!(
            state.changed_executors_logs[0],
            ChangeExecutorEntry {
                old_login: "u3".into(),
                new_login: "u4".into(),
                comment: "hand-off".into(),
                attachments: vec![],
                created_at: h.now,
            }
        );
        assert_eq!(state.actual_executor.as_deref(), Some("u4"));
        assert_eq!(state.executors, vec!["u4"]);
        assert!(!state.is_taken_in_work);
    }

    #[test]
    fn test_decision_requires_taken_in_work() {
        let mut h = group_harness();
        h.enter::<Execution>().unwrap();
        let err = h
            .act::<Execution>(UpdateDescriptor::new(
                UpdateAction::Execution,
                "u3",
                json!({"decision": "executed"}),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotTakenInWork);
        let err = h
            .act::<Execution>(UpdateDescriptor::new(
                UpdateAction::ChangeExecutor,
                "u3",
                json!({"new_executor_login": "u4"}),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotTakenInWork);
    }

    #[test]
    fn test_sole_executor_is_taken_in_work() {
        let def = BlockDefinition::new(BlockKind::Execution)
            .with_params(json!({"executors": ["solo"]}));
        let mut h = Harness::new("execution_0", def);
        h.enter::<Execution>().unwrap();
        let out = h
            .act::<Execution>(UpdateDescriptor::new(
                UpdateAction::Execution,
                "solo",
                json!({"decision": "executed", "comment": "done"}),
            ))
            .unwrap();
        assert_eq!(out.progress.sockets, vec!["executed"]);
        assert_eq!(out.progress.human_status, Some(HumanStatus::Executed));
        assert_eq!(h.vars.get("execution_0.executor"), Some(&json!("solo")));
    }

    #[test]
    fn test_send_edit_schedules_rework_deadline() {
        let def = BlockDefinition::new(BlockKind::Execution).with_params(json!({
            "executors": ["solo"], "is_editable": true,
            "sla": 8, "check_sla": true,
            "rework_sla": 4, "check_rework_sla": true
        }));
        let mut h = Harness::new("execution_0", def);
        let entry = h.enter::<Execution>().unwrap();
        assert_eq!(entry.deadlines.len(), 2);

        let out = h
            .act::<Execution>(UpdateDescriptor::new(
                UpdateAction::ExecutorSendEditApp,
                "solo",
                json!({"comment": "attach the invoice"}),
            ))
            .unwrap();
        assert_eq!(
            out.deadlines,
            vec![(UpdateAction::ReworkSlaBreach, h.now + chrono::Duration::hours(4))]
        );

        // The reply stops the rework clock and restores the main budget.
        let out = h
            .act::<Execution>(UpdateDescriptor::new(
                UpdateAction::ReplyExecutionInfo,
                "init",
                json!({"comment": "attached"}),
            ))
            .unwrap();
        assert_eq!(out.progress.status, StepStatus::Running);
        assert!(out.deadlines.iter().all(|(a, _)| *a != UpdateAction::ReworkSlaBreach));
        assert_eq!(out.deadlines.len(), 2);
    }

    #[test]
    fn test_stranger_cannot_take_work() {
        let mut h = group_harness();
        h.enter::<Execution>().unwrap();
        let err = h
            .act::<Execution>(UpdateDescriptor::new(UpdateAction::ExecutorStartWork, "x", Value::Null))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserNotPartOfProcess);
    }

    #[test]
    fn test_output_state_round_trip() {
        let mut h = group_harness();
        h.enter::<Execution>().unwrap();
        let state = h.state::<Execution>();
        let mut copy = state.clone();
        Execution::apply_outputs(&mut copy, &Execution::outputs(&state)).unwrap();
        assert_eq!(copy, state);
    }
}
