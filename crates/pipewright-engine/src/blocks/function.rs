//! Function: a call to the external function runner over the bus.
//!
//! Entering the block queues a [`FunctionRequest`] tagged with the step id
//! and an attempt counter, then suspends. Replies carry the attempt back;
//! a reply for an older attempt, or one arriving after the block already
//! took an answer, changes nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use pipewright_bus::{FunctionReply, FunctionRequest};
use pipewright_types::{BlockKind, DEFAULT_SOCKET, ErrorKind, StepStatus, UpdateAction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::common::unexpected_action;
use super::{Block, Progress};
use crate::context::{BlockCtx, PendingRequest};
use crate::registry::BlockModel;
use crate::typecheck::is_type_correct;
use crate::{EngineError, Result};

pub const ERROR_SOCKET: &str = "error";

const MAX_RETRY_DELAY_SECS: i64 = 365 * 24 * 3600;

/// One input of the call, read from the variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputMapping {
    /// Variable path the value is read from.
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FunctionParams {
    pub function_id: String,
    pub version: String,
    pub name: String,
    pub mapping: BTreeMap<String, InputMapping>,
    /// Expected output field types, checked on reply.
    pub outputs: BTreeMap<String, String>,
    /// Delays in seconds before each re-publish the runner asks for.
    pub retry_timeouts: Vec<u64>,
    pub retry_policy: String,
    /// Wall-clock hours to wait for a reply.
    pub sla: i64,
    pub check_sla: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionState {
    pub function_id: String,
    pub version: String,
    pub attempt: u32,
    pub retries_done: u32,
    pub inputs: Map<String, Value>,
    pub requested_at: Option<DateTime<Utc>>,
    pub has_response: bool,
    pub result: Map<String, Value>,
    pub error: Option<String>,
}

pub struct Function;

impl Function {
    fn publish(
        params: &FunctionParams,
        state: &mut FunctionState,
        ctx: &mut BlockCtx<'_>,
        delay: Duration,
    ) {
        state.attempt += 1;
        state.requested_at = Some(ctx.now);
        let not_before = ctx.now + delay;
        ctx.effects.requests.push(PendingRequest {
            request: FunctionRequest {
                step_id: ctx.step_id,
                attempt: state.attempt,
                task_id: ctx.frame.task_id,
                work_number: ctx.frame.work_number,
                function_id: params.function_id.clone(),
                version: params.version.clone(),
                function_name: params.name.clone(),
                function_mapping: state.inputs.clone(),
                retry_policy: params.retry_policy.clone(),
                system_stand: String::new(),
            },
            not_before,
        });
        tracing::debug!(
            block = ctx.name,
            attempt = state.attempt,
            function = %params.function_id,
            "function request queued"
        );
    }

    fn fail(state: &mut FunctionState, reason: String) -> Progress {
        state.has_response = true;
        state.error = Some(reason);
        Progress {
            sockets: vec![ERROR_SOCKET.to_string()],
            ..Progress::with_status(StepStatus::Error)
        }
    }

    fn absorb(
        params: &FunctionParams,
        state: &mut FunctionState,
        ctx: &mut BlockCtx<'_>,
        reply: FunctionReply,
    ) -> Result<Progress> {
        if reply.attempt != state.attempt || state.has_response {
            tracing::debug!(
                block = ctx.name,
                got = reply.attempt,
                current = state.attempt,
                "stale function reply ignored"
            );
            return Ok(Progress::running());
        }
        if reply.do_retry {
            if let Some(secs) = params.retry_timeouts.get(state.retries_done as usize) {
                state.retries_done += 1;
                let secs = i64::try_from(*secs).unwrap_or(0).min(MAX_RETRY_DELAY_SECS);
                Self::publish(params, state, ctx, Duration::seconds(secs));
                return Ok(Progress::running());
            }
        }
        if let Some(err) = reply.err {
            return Ok(Self::fail(state, err));
        }
        let mismatched: Vec<&str> = params
            .outputs
            .iter()
            .filter(|(key, ty)| {
                reply
                    .function_mapping
                    .get(key.as_str())
                    .is_some_and(|v| !is_type_correct(ty, v))
            })
            .map(|(key, _)| key.as_str())
            .collect();
        if !mismatched.is_empty() {
            return Ok(Self::fail(
                state,
                format!("output type mismatch: {}", mismatched.join(", ")),
            ));
        }
        state.has_response = true;
        state.error = None;
        state.result = reply.function_mapping;
        Ok(Progress::finished(DEFAULT_SOCKET))
    }
}

impl Block for Function {
    const KIND: BlockKind = BlockKind::Function;

    type Params = FunctionParams;
    type State = FunctionState;

    fn validate(params: &FunctionParams) -> std::result::Result<(), String> {
        if params.function_id.is_empty() {
            return Err("function_id is required".into());
        }
        Ok(())
    }

    fn create_state(params: &FunctionParams, ctx: &mut BlockCtx<'_>) -> Result<FunctionState> {
        let mut inputs = Map::new();
        for (name, m) in &params.mapping {
            match ctx.vars.get(&m.value) {
                Some(v) if !m.value_type.is_empty() && !is_type_correct(&m.value_type, v) => {
                    return Err(EngineError::block(format!(
                        "input {name} is not of type {}",
                        m.value_type
                    )));
                }
                Some(v) => {
                    inputs.insert(name.clone(), v.clone());
                }
                None if m.required => {
                    return Err(EngineError::block(format!("required input {name} is missing")));
                }
                None => {}
            }
        }
        Ok(FunctionState {
            function_id: params.function_id.clone(),
            version: params.version.clone(),
            inputs,
            ..FunctionState::default()
        })
    }

    fn update(
        params: &FunctionParams,
        state: &mut FunctionState,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress> {
        match ctx.action() {
            None => {
                Self::publish(params, state, ctx, Duration::zero());
                Ok(Progress::running())
            }
            Some(UpdateAction::FunctionResult) => {
                let reply: FunctionReply = ctx.params()?;
                Self::absorb(params, state, ctx, reply)
            }
            Some(UpdateAction::Retry) => {
                if state.has_response {
                    return Err(EngineError::rejected(
                        ErrorKind::DecisionAlreadySet,
                        "function already answered",
                    ));
                }
                Self::publish(params, state, ctx, Duration::zero());
                Ok(Progress::running())
            }
            Some(UpdateAction::FuncSlaExpired) => {
                if state.has_response {
                    return Ok(Progress::finished(DEFAULT_SOCKET));
                }
                Ok(Self::fail(state, "function SLA expired".into()))
            }
            Some(UpdateAction::Reload) => {
                state.has_response = false;
                state.error = None;
                state.retries_done = 0;
                Self::publish(params, state, ctx, Duration::zero());
                Ok(Progress::running())
            }
            other => Err(unexpected_action(other, "function")),
        }
    }

    fn outputs(state: &FunctionState) -> Map<String, Value> {
        let mut out = state.result.clone();
        if let Some(err) = &state.error {
            out.insert("error".into(), Value::String(err.clone()));
        }
        out
    }

    fn apply_outputs(state: &mut FunctionState, outputs: &Map<String, Value>) -> Result<()> {
        for (k, v) in outputs {
            if k == "error" {
                state.error = v.as_str().map(String::from);
                continue;
            }
            state.result.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn deadlines(
        params: &FunctionParams,
        state: &FunctionState,
        _ctx: &BlockCtx<'_>,
    ) -> Vec<(UpdateAction, DateTime<Utc>)> {
        match state.requested_at {
            Some(at) if params.check_sla && params.sla > 0 && !state.has_response => {
                vec![(UpdateAction::FuncSlaExpired, at + Duration::hours(params.sla))]
            }
            _ => Vec::new(),
        }
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::Function, "Function")
            .params(json!({"function_id": "", "version": "", "name": "", "mapping": {}, "retry_timeouts": [], "sla": 0, "check_sla": false}))
            .sockets(&[DEFAULT_SOCKET, ERROR_SOCKET])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing::Harness;
    use pipewright_types::{BlockDefinition, UpdateDescriptor};

    fn harness(params: Value) -> Harness {
        Harness::new("function_0", BlockDefinition::new(BlockKind::Function).with_params(params))
    }

    fn reply(attempt: u32, do_retry: bool, mapping: Value) -> UpdateDescriptor {
        UpdateDescriptor::new(
            UpdateAction::FunctionResult,
            "",
            json!({"step_id": uuid::Uuid::nil(), "attempt": attempt, "do_retry": do_retry, "function_mapping": mapping}),
        )
    }

    #[test]
    fn test_entry_publishes_mapped_inputs() {
        let mut h = harness(json!({
            "function_id": "f1",
            "mapping": {"amount": {"value": "form_0.amount", "type": "integer", "required": true}}
        }));
        h.vars.set_value("form_0.amount", json!(5));
        let out = h.enter::<Function>().unwrap();
        assert_eq!(out.progress.status, StepStatus::Running);
        let req = &h.effects.requests[0];
        assert_eq!(req.request.attempt, 1);
        assert_eq!(req.request.function_mapping.get("amount"), Some(&json!(5)));
        assert_eq!(req.not_before, h.now);
    }

    #[test]
    fn test_missing_required_input_fails_block() {
        let mut h = harness(json!({
            "function_id": "f1",
            "mapping": {"amount": {"value": "form_0.amount", "required": true}}
        }));
        assert!(matches!(h.enter::<Function>().unwrap_err(), EngineError::BlockFailed(_)));
    }

    #[test]
    fn test_retry_schedule_then_result() {
        let mut h = harness(json!({"function_id": "f1", "retry_timeouts": [1, 2]}));
        h.enter::<Function>().unwrap();
        h.act::<Function>(reply(1, true, json!({}))).unwrap();
        h.act::<Function>(reply(2, true, json!({}))).unwrap();
        let delays: Vec<i64> = h
            .effects
            .requests
            .iter()
            .map(|r| (r.not_before - h.now).num_seconds())
            .collect();
        assert_eq!(delays, vec![0, 1, 2]);

        let out = h.act::<Function>(reply(3, false, json!({"score": 7}))).unwrap();
        assert_eq!(out.progress.sockets, vec![DEFAULT_SOCKET]);
        assert_eq!(h.vars.get("function_0.score"), Some(&json!(7)));
    }

    #[test]
    fn test_stale_and_duplicate_replies_are_ignored() {
        let mut h = harness(json!({"function_id": "f1", "retry_timeouts": [1]}));
        h.enter::<Function>().unwrap();
        h.act::<Function>(reply(1, true, json!({}))).unwrap();
        let out = h.act::<Function>(reply(1, false, json!({"x": 1}))).unwrap();
        assert_eq!(out.progress.status, StepStatus::Running);
        assert!(h.vars.get("function_0.x").is_none());

        h.act::<Function>(reply(2, false, json!({"x": 2}))).unwrap();
        h.act::<Function>(reply(2, false, json!({"x": 3}))).unwrap();
        assert_eq!(h.vars.get("function_0.x"), Some(&json!(2)));
    }

    #[test]
    fn test_sla_expiry_routes_to_error() {
        let mut h = harness(json!({"function_id": "f1", "sla": 2, "check_sla": true}));
        let out = h.enter::<Function>().unwrap();
        assert_eq!(
            out.deadlines,
            vec![(UpdateAction::FuncSlaExpired, h.now + Duration::hours(2))]
        );
        let out = h
            .act::<Function>(UpdateDescriptor::system(UpdateAction::FuncSlaExpired))
            .unwrap();
        assert_eq!(out.progress.status, StepStatus::Error);
        assert_eq!(out.progress.sockets, vec![ERROR_SOCKET]);
        assert_eq!(h.vars.get("function_0.error"), Some(&json!("function SLA expired")));
    }

    #[test]
    fn test_output_type_mismatch_is_an_error() {
        let mut h = harness(json!({"function_id": "f1", "outputs": {"score": "integer"}}));
        h.enter::<Function>().unwrap();
        let out = h.act::<Function>(reply(1, false, json!({"score": "high"}))).unwrap();
        assert_eq!(out.progress.sockets, vec![ERROR_SOCKET]);
    }
}
