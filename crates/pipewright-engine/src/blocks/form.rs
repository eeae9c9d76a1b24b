//! Form: someone fills in a structured application body.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pipewright_types::{
    BlockKind, DEFAULT_SOCKET, DelegationType, ErrorKind, HumanStatus, Member, StepStatus,
    TaskStatus, UpdateAction,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::common::{
    FormAccess, SlaParams, SlaTrack, logins_from_paths, mail, not_member, push_unique,
    unexpected_action,
};
use super::{Block, Progress};
use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormExecutorType {
    #[default]
    User,
    Initiator,
    Group,
    FromSchema,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FormParams {
    pub schema_id: String,
    pub schema_name: String,
    pub executors_type: FormExecutorType,
    pub executors: Vec<String>,
    pub executors_from_schema: String,
    pub executors_group_id: String,
    /// Fields that must be present and non-empty in a filled body.
    pub required_fields: Vec<String>,
    /// Form field to variable path, prefilled on entry.
    pub mapping: BTreeMap<String, String>,
    #[serde(alias = "hide_executor")]
    pub hide_executor_from_initiator: bool,
    /// Leave the form out of the initiator's view unless they fill it.
    pub hide_form_from_initiator: bool,
    #[serde(flatten)]
    pub sla: SlaParams,
    pub forms_accessibility: Vec<FormAccess>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormChange {
    pub login: String,
    #[serde(default)]
    pub delegate_for: String,
    pub application_body: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormState {
    pub schema_id: String,
    pub schema_name: String,
    pub executors: Vec<String>,
    pub initial_executors: Vec<String>,
    pub is_taken_in_work: bool,
    pub actual_executor: Option<String>,
    pub application_body: Map<String, Value>,
    pub is_filled: bool,
    pub changes_log: Vec<FormChange>,
    #[serde(alias = "hide_executor")]
    pub hide_executor_from_initiator: bool,
    pub hide_form_from_initiator: bool,
    pub forms_accessibility: Vec<FormAccess>,
    pub sla: SlaTrack,
}

impl FormState {
    fn acting_for(&self, login: &str, ctx: &BlockCtx<'_>) -> Result<String> {
        if self.executors.iter().any(|e| e == login) {
            return Ok(login.to_string());
        }
        ctx.delegations
            .filter_by_type(DelegationType::Execution)
            .find_delegator_for(login, self.executors.iter())
            .ok_or_else(|| not_member(login))
    }

    fn auto_take(&mut self) {
        self.is_taken_in_work = self.executors.len() == 1;
        self.actual_executor = if self.is_taken_in_work {
            self.executors.first().cloned()
        } else {
            None
        };
    }
}

#[derive(Debug, Deserialize)]
struct FillParams {
    application_body: Map<String, Value>,
}

pub struct Form;

impl Block for Form {
    const KIND: BlockKind = BlockKind::Form;

    type Params = FormParams;
    type State = FormState;

    fn validate(params: &FormParams) -> std::result::Result<(), String> {
        let ok = match params.executors_type {
            FormExecutorType::User => !params.executors.is_empty(),
            FormExecutorType::Initiator => true,
            FormExecutorType::Group => !params.executors_group_id.is_empty(),
            FormExecutorType::FromSchema => !params.executors_from_schema.trim().is_empty(),
        };
        if !ok {
            return Err("form block needs executors".into());
        }
        Ok(())
    }

    fn create_state(params: &FormParams, ctx: &mut BlockCtx<'_>) -> Result<FormState> {
        let mut executors = Vec::new();
        match params.executors_type {
            FormExecutorType::User => push_unique(&mut executors, params.executors.iter().cloned()),
            FormExecutorType::Initiator => executors.push(ctx.frame.initiator.clone()),
            FormExecutorType::Group => push_unique(
                &mut executors,
                ctx.services.groups.members(&params.executors_group_id),
            ),
            FormExecutorType::FromSchema => push_unique(
                &mut executors,
                logins_from_paths(ctx.vars, &params.executors_from_schema),
            ),
        }
        if executors.is_empty() {
            return Err(EngineError::block("no form executors resolved"));
        }
        let application_body = params
            .mapping
            .iter()
            .filter_map(|(field, path)| ctx.vars.get(path).map(|v| (field.clone(), v.clone())))
            .collect();
        let mut state = FormState {
            schema_id: params.schema_id.clone(),
            schema_name: params.schema_name.clone(),
            initial_executors: executors.clone(),
            executors,
            application_body,
            hide_executor_from_initiator: params.hide_executor_from_initiator,
            hide_form_from_initiator: params.hide_form_from_initiator,
            forms_accessibility: params.forms_accessibility.clone(),
            sla: SlaTrack::start(ctx.step_time),
            ..FormState::default()
        };
        state.auto_take();
        Ok(state)
    }

    fn update(params: &FormParams, state: &mut FormState, ctx: &mut BlockCtx<'_>) -> Result<Progress> {
        let Some(action) = ctx.action() else {
            let to = state.executors.clone();
            mail(ctx, to, "Form to fill".into());
            return Ok(Progress::running().human(HumanStatus::Processing));
        };
        let login = ctx.by_login().to_string();
        match action {
            UpdateAction::FormExecutorStartWork => {
                if state.is_filled {
                    return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "form already filled"));
                }
                state.acting_for(&login, ctx)?;
                state.executors = vec![login.clone()];
                state.actual_executor = Some(login);
                state.is_taken_in_work = true;
                Ok(Progress::running().human(HumanStatus::Processing))
            }
            UpdateAction::FillForm => {
                if state.is_filled {
                    return Err(EngineError::rejected(ErrorKind::DecisionAlreadySet, "form already filled"));
                }
                let acting = state.acting_for(&login, ctx)?;
                if !state.is_taken_in_work {
                    return Err(EngineError::rejected(ErrorKind::NotTakenInWork, "take the form first"));
                }
                let p: FillParams = ctx.params()?;
                let missing: Vec<&str> = params
                    .required_fields
                    .iter()
                    .filter(|f| p.application_body.get(*f).is_none_or(is_blank))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    return Err(EngineError::rejected(
                        ErrorKind::Validation,
                        format!("required fields missing: {}", missing.join(", ")),
                    ));
                }
                for (k, v) in &p.application_body {
                    state.application_body.insert(k.clone(), v.clone());
                }
                state.changes_log.push(FormChange {
                    delegate_for: if acting == login { String::new() } else { acting },
                    login: login.clone(),
                    application_body: p.application_body,
                    created_at: ctx.now,
                });
                state.is_filled = true;
                state.actual_executor = Some(login.clone());
                ctx.event("form_filled", json!({"login": login, "schema_id": state.schema_id}));
                Ok(Progress::finished(DEFAULT_SOCKET).human(HumanStatus::Done))
            }
            UpdateAction::HalfSlaBreach => {
                state.sla.half_sla_checked = true;
                let to = state.executors.clone();
                mail(ctx, to, "Half of the form SLA has passed".into());
                Ok(Progress::running())
            }
            UpdateAction::SlaBreach => {
                state.sla.sla_checked = true;
                let to = state.executors.clone();
                mail(ctx, to, "Form SLA breached".into());
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
                state.is_filled = false;
                state.executors = state.initial_executors.clone();
                state.auto_take();
                state.sla = SlaTrack::start(ctx.now);
                Ok(Progress::running().human(HumanStatus::Processing))
            }
            other => Err(unexpected_action(Some(other), "form")),
        }
    }

    fn outputs(state: &FormState) -> Map<String, Value> {
        let mut out = Map::new();
        if state.is_filled || !state.application_body.is_empty() {
            out.insert(
                "application_body".into(),
                Value::Object(state.application_body.clone()),
            );
        }
        out.insert(
            "executor".into(),
            state.actual_executor.clone().map_or(Value::Null, Value::String),
        );
        out
    }

    fn apply_outputs(state: &mut FormState, outputs: &Map<String, Value>) -> Result<()> {
        if let Some(raw) = outputs.get("application_body") {
            let Value::Object(body) = raw else {
                return Err(EngineError::rejected(
                    ErrorKind::MonitoringEditBlockParse,
                    "application_body must be an object",
                ));
            };
            state.application_body = body.clone();
        }
        if let Some(raw) = outputs.get("executor") {
            state.actual_executor = raw.as_str().map(String::from);
        }
        Ok(())
    }

    fn members(state: &FormState) -> Vec<Member> {
        state
            .executors
            .iter()
            .map(|e| Member {
                login: e.clone(),
                is_acted: state.is_filled && state.actual_executor.as_deref() == Some(e),
            })
            .collect()
    }

    fn deadlines(
        params: &FormParams,
        state: &FormState,
        ctx: &BlockCtx<'_>,
    ) -> Vec<(UpdateAction, DateTime<Utc>)> {
        if state.is_filled {
            return Vec::new();
        }
        state.sla.deadlines(&params.sla, ctx)
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::Form, "Form")
            .params(json!({"schema_id": "", "executors_type": "initiator", "required_fields": []}))
            .output("application_body", "object", "the filled form")
            .output("executor", "string", "login of whoever filled the form")
            .sockets(&[DEFAULT_SOCKET])
    }
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing::Harness;
    use pipewright_types::{BlockDefinition, UpdateDescriptor};

    fn harness(params: Value) -> Harness {
        Harness::new("form_0", BlockDefinition::new(BlockKind::Form).with_params(params))
    }

    #[test]
    fn test_initiator_fills_form() {
        let mut h = harness(json!({"executors_type": "initiator", "required_fields": ["amount"]}));
        h.enter::<Form>().unwrap();
        assert!(h.state::<Form>().is_taken_in_work);

        let err = h
            .act::<Form>(UpdateDescriptor::new(
                UpdateAction::FillForm,
                "init",
                json!({"application_body": {"amount": ""}}),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let out = h
            .act::<Form>(UpdateDescriptor::new(
                UpdateAction::FillForm,
                "init",
                json!({"application_body": {"amount": 40}}),
            ))
            .unwrap();
        assert_eq!(out.progress.sockets, vec![DEFAULT_SOCKET]);
        assert_eq!(h.vars.get("form_0.application_body.amount"), Some(&json!(40)));
        assert_eq!(h.vars.get("form_0.executor"), Some(&json!("init")));
        assert_eq!(h.state::<Form>().changes_log.len(), 1);
    }

    #[test]
    fn test_hide_flags_reach_state() {
        let mut h = harness(json!({
            "executors": ["a"],
            "hide_executor_from_initiator": true,
            "hide_form_from_initiator": true,
        }));
        h.enter::<Form>().unwrap();
        assert!(h.state::<Form>().hide_executor_from_initiator);
        assert!(h.state::<Form>().hide_form_from_initiator);

        // Older definitions spell the executor flag `hide_executor`.
        let mut h = harness(json!({"executors": ["a"], "hide_executor": true}));
        h.enter::<Form>().unwrap();
        assert!(h.state::<Form>().hide_executor_from_initiator);
        assert!(!h.state::<Form>().hide_form_from_initiator);
    }

    #[test]
    fn test_group_form_needs_start_work() {
        let mut h = harness(json!({"executors_type": "user", "executors": ["a", "b"]}));
        h.enter::<Form>().unwrap();
        let fill = UpdateDescriptor::new(
            UpdateAction::FillForm,
            "a",
            json!({"application_body": {"x": 1}}),
        );
        assert_eq!(
            h.act::<Form>(fill.clone()).unwrap_err().kind(),
            ErrorKind::NotTakenInWork
        );
        h.act::<Form>(UpdateDescriptor::new(UpdateAction::FormExecutorStartWork, "a", Value::Null))
            .unwrap();
        assert_eq!(h.state::<Form>().executors, vec!["a"]);
        h.act::<Form>(fill).unwrap();
        let again = UpdateDescriptor::new(
            UpdateAction::FillForm,
            "a",
            json!({"application_body": {"x": 2}}),
        );
        assert_eq!(
            h.act::<Form>(again).unwrap_err().kind(),
            ErrorKind::DecisionAlreadySet
        );
    }

    #[test]
    fn test_mapping_prefills_body() {
        let mut h = harness(json!({"executors": ["a"], "mapping": {"city": "pipe.city"}}));
        h.vars.set_value("pipe.city", json!("Oslo"));
        h.enter::<Form>().unwrap();
        assert_eq!(h.state::<Form>().application_body.get("city"), Some(&json!("Oslo")));
    }
}
