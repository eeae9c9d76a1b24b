//! Start, end and placeholder: blocks that pass straight through.

use chrono::{DateTime, Utc};
use pipewright_types::{BlockKind, DEFAULT_SOCKET, HumanStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{Block, Progress};
use crate::Result;
use crate::context::BlockCtx;
use crate::registry::BlockModel;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoParams {}

/// Start publishes the task's launch parameters as its outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartState {
    pub parameters: Map<String, Value>,
}

pub struct Start;

impl Block for Start {
    const KIND: BlockKind = BlockKind::Start;

    type Params = NoParams;
    type State = StartState;

    fn create_state(_params: &NoParams, ctx: &mut BlockCtx<'_>) -> Result<StartState> {
        let parameters = match &ctx.frame.parameters {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Ok(StartState { parameters })
    }

    fn update(_params: &NoParams, _state: &mut StartState, ctx: &mut BlockCtx<'_>) -> Result<Progress> {
        ctx.event("task_started", json!({"initiator": ctx.frame.initiator}));
        Ok(Progress::finished(DEFAULT_SOCKET).human(HumanStatus::New))
    }

    fn outputs(state: &StartState) -> Map<String, Value> {
        state.parameters.clone()
    }

    fn apply_outputs(state: &mut StartState, outputs: &Map<String, Value>) -> Result<()> {
        for (k, v) in outputs {
            state.parameters.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::Start, "Start").sockets(&[DEFAULT_SOCKET])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndState {
    pub finished_at: Option<DateTime<Utc>>,
}

/// Reaching an end block finishes the task.
pub struct End;

impl Block for End {
    const KIND: BlockKind = BlockKind::End;

    type Params = NoParams;
    type State = EndState;

    fn create_state(_params: &NoParams, _ctx: &mut BlockCtx<'_>) -> Result<EndState> {
        Ok(EndState::default())
    }

    fn update(_params: &NoParams, state: &mut EndState, ctx: &mut BlockCtx<'_>) -> Result<Progress> {
        state.finished_at = Some(ctx.now);
        ctx.event("task_finished", Value::Null);
        Ok(Progress::finished_on(Vec::new())
            .human(HumanStatus::Done)
            .task(TaskStatus::Finished))
    }

    fn outputs(_state: &EndState) -> Map<String, Value> {
        Map::new()
    }

    fn apply_outputs(_state: &mut EndState, _outputs: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::End, "End")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlaceholderParams {
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderState {}

pub struct Placeholder;

impl Block for Placeholder {
    const KIND: BlockKind = BlockKind::Placeholder;

    type Params = PlaceholderParams;
    type State = PlaceholderState;

    fn create_state(_params: &PlaceholderParams, _ctx: &mut BlockCtx<'_>) -> Result<PlaceholderState> {
        Ok(PlaceholderState {})
    }

    fn update(
        _params: &PlaceholderParams,
        _state: &mut PlaceholderState,
        _ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress> {
        Ok(Progress::finished(DEFAULT_SOCKET))
    }

    fn outputs(_state: &PlaceholderState) -> Map<String, Value> {
        Map::new()
    }

    fn apply_outputs(_state: &mut PlaceholderState, _outputs: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::Placeholder, "Placeholder")
            .params(json!({"description": ""}))
            .sockets(&[DEFAULT_SOCKET])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing::Harness;
    use pipewright_types::{BlockDefinition, StepStatus};

    #[test]
    fn test_start_publishes_parameters() {
        let mut h = Harness::new("start_0", BlockDefinition::new(BlockKind::Start));
        h.frame.parameters = json!({"amount": 12, "reason": "travel"});
        let out = h.enter::<Start>().unwrap();
        assert_eq!(out.progress.sockets, vec![DEFAULT_SOCKET]);
        assert_eq!(h.vars.get("start_0.amount"), Some(&json!(12)));
        assert_eq!(h.effects.events[0].event, "task_started");
    }

    #[test]
    fn test_end_finishes_task() {
        let mut h = Harness::new("end_0", BlockDefinition::new(BlockKind::End));
        let out = h.enter::<End>().unwrap();
        assert_eq!(out.progress.status, StepStatus::Finished);
        assert!(out.progress.sockets.is_empty());
        assert_eq!(out.progress.task_status, Some(TaskStatus::Finished));
        assert_eq!(h.state::<End>().finished_at, Some(h.now));
    }

    #[test]
    fn test_placeholder_passes_through() {
        let mut h = Harness::new("placeholder_0", BlockDefinition::new(BlockKind::Placeholder));
        let out = h.enter::<Placeholder>().unwrap();
        assert_eq!(out.progress.sockets, vec![DEFAULT_SOCKET]);
        assert!(out.members.is_empty());
    }
}
