//! Parallel gateways.
//!
//! The start fans out over every socket it declares. The end is a barrier:
//! it stays running until every graph predecessor has fired into it. The
//! orchestrator works out which predecessors have arrived since the
//! matching start and hands them over in [`BlockCtx::arrivals`].

use pipewright_types::{BlockKind, DEFAULT_SOCKET, HumanStatus, StepStatus, TaskStatus, UpdateAction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::common::{not_member, unexpected_action};
use super::simple::NoParams;
use super::{Block, Progress};
use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelStartState {
    pub fired: Vec<String>,
}

pub struct ParallelStart;

impl Block for ParallelStart {
    const KIND: BlockKind = BlockKind::ParallelStart;

    type Params = NoParams;
    type State = ParallelStartState;

    fn create_state(_params: &NoParams, _ctx: &mut BlockCtx<'_>) -> Result<ParallelStartState> {
        Ok(ParallelStartState::default())
    }

    fn update(
        _params: &NoParams,
        state: &mut ParallelStartState,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress> {
        state.fired = ctx.def.sockets.iter().map(|s| s.id.clone()).collect();
        Ok(Progress::finished_on(state.fired.clone()))
    }

    fn outputs(_state: &ParallelStartState) -> Map<String, Value> {
        Map::new()
    }

    fn apply_outputs(_state: &mut ParallelStartState, _outputs: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::ParallelStart, "Parallel start").sockets(&["branch_1", "branch_2"])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelEndState {
    pub expected: Vec<String>,
    pub arrived: Vec<String>,
    pub canceled: bool,
}

impl ParallelEndState {
    pub fn is_complete(&self) -> bool {
        self.expected.iter().all(|p| self.arrived.contains(p))
    }
}

pub struct ParallelEnd;

impl Block for ParallelEnd {
    const KIND: BlockKind = BlockKind::ParallelEnd;

    type Params = NoParams;
    type State = ParallelEndState;

    fn create_state(_params: &NoParams, ctx: &mut BlockCtx<'_>) -> Result<ParallelEndState> {
        Ok(ParallelEndState {
            expected: ctx.graph.predecessors(ctx.name),
            ..ParallelEndState::default()
        })
    }

    fn update(
        _params: &NoParams,
        state: &mut ParallelEndState,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress> {
        match ctx.action() {
            None | Some(UpdateAction::Reload) => {}
            Some(UpdateAction::CancelApp) => {
                let login = ctx.by_login();
                if login != ctx.frame.initiator {
                    return Err(not_member(login));
                }
                state.canceled = true;
                ctx.event("parallel_canceled", Value::Null);
                return Ok(Progress::with_status(StepStatus::Canceled)
                    .human(HumanStatus::Revoke)
                    .task(TaskStatus::Canceled));
            }
            other => return Err(unexpected_action(other, "parallel_end")),
        }
        for name in ctx.arrivals {
            if state.expected.contains(name) && !state.arrived.contains(name) {
                state.arrived.push(name.clone());
            }
        }
        if !state.is_complete() {
            tracing::debug!(
                block = ctx.name,
                arrived = state.arrived.len(),
                expected = state.expected.len(),
                "parallel barrier waiting"
            );
            return Ok(Progress::running());
        }
        Ok(Progress::finished(DEFAULT_SOCKET))
    }

    fn outputs(_state: &ParallelEndState) -> Map<String, Value> {
        Map::new()
    }

    fn apply_outputs(_state: &mut ParallelEndState, _outputs: &Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn model() -> BlockModel {
        BlockModel::new(BlockKind::ParallelEnd, "Parallel end")
            .params(json!({}))
            .sockets(&[DEFAULT_SOCKET])
    }
}
