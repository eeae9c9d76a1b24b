//! Block state machines.
//!
//! Every kind implements [`Block`] with its own typed parameters and
//! state. State crosses the persistence edge as JSON in the step's
//! `state` map; [`dispatch!`] picks the implementation from a
//! [`BlockKind`] at the call site, so the set of kinds is closed at
//! compile time.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use pipewright_types::{
    BlockDefinition, BlockKind, ErrorKind, HumanStatus, Member, StepStatus, TaskStatus,
    UpdateAction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::context::BlockCtx;
use crate::registry::BlockModel;
use crate::{EngineError, Result};

pub mod approver;
pub mod common;
pub mod condition;
pub mod execution;
pub mod form;
pub mod function;
pub mod notification;
pub mod parallel;
pub mod sd_app;
pub mod sign;
pub mod simple;
pub mod timer;

/// What a block decided after one `update`.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub status: StepStatus,
    /// Sockets to traverse, in declaration order. Only read when the status
    /// is traversable.
    pub sockets: Vec<String>,
    pub human_status: Option<HumanStatus>,
    pub human_comment: String,
    /// Overrides the task's run status (end, cancel, rework breach).
    pub task_status: Option<TaskStatus>,
}

impl Progress {
    pub fn running() -> Self {
        Self::with_status(StepStatus::Running)
    }

    pub fn idle() -> Self {
        Self::with_status(StepStatus::Idle)
    }

    pub fn finished(socket: &str) -> Self {
        Self {
            sockets: vec![socket.to_string()],
            ..Self::with_status(StepStatus::Finished)
        }
    }

    pub fn finished_on(sockets: Vec<String>) -> Self {
        Self {
            sockets,
            ..Self::with_status(StepStatus::Finished)
        }
    }

    pub fn with_status(status: StepStatus) -> Self {
        Self {
            status,
            sockets: Vec::new(),
            human_status: None,
            human_comment: String::new(),
            task_status: None,
        }
    }

    pub fn human(mut self, status: HumanStatus) -> Self {
        self.human_status = Some(status);
        self
    }

    pub fn human_comment(mut self, comment: impl Into<String>) -> Self {
        self.human_comment = comment.into();
        self
    }

    pub fn task(mut self, status: TaskStatus) -> Self {
        self.task_status = Some(status);
        self
    }
}

/// The uniform contract of a block kind.
pub trait Block {
    const KIND: BlockKind;

    type Params: DeserializeOwned + Default;
    type State: Serialize + DeserializeOwned + Default + Clone + Debug;

    /// Version-time checks beyond what deserialization catches.
    fn validate(_params: &Self::Params) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Seed state when the block is entered with a fresh step.
    fn create_state(params: &Self::Params, ctx: &mut BlockCtx<'_>) -> Result<Self::State>;

    /// Consume `ctx.update` (or the entry, when it is `None`) and advance.
    fn update(
        params: &Self::Params,
        state: &mut Self::State,
        ctx: &mut BlockCtx<'_>,
    ) -> Result<Progress>;

    /// Output values derived from state, keyed without the block prefix.
    fn outputs(state: &Self::State) -> Map<String, Value>;

    /// Fold edited outputs back into state.
    fn apply_outputs(state: &mut Self::State, outputs: &Map<String, Value>) -> Result<()>;

    fn members(_state: &Self::State) -> Vec<Member> {
        Vec::new()
    }

    /// Pending SLA/timer deadlines while the step is open.
    fn deadlines(
        _params: &Self::Params,
        _state: &Self::State,
        _ctx: &BlockCtx<'_>,
    ) -> Vec<(UpdateAction, DateTime<Utc>)> {
        Vec::new()
    }

    fn model() -> BlockModel;
}

/// Result of running a block once.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub progress: Progress,
    pub members: Vec<Member>,
    pub deadlines: Vec<(UpdateAction, DateTime<Utc>)>,
}

pub(crate) fn parse_params<B: Block>(def: &BlockDefinition) -> Result<B::Params> {
    match &def.params {
        Value::Null => Ok(B::Params::default()),
        raw => serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::block(format!("invalid {} params: {e}", B::KIND))),
    }
}

/// Parse and validate params for graph validation.
pub(crate) fn check_params<B: Block>(def: &BlockDefinition) -> std::result::Result<(), String> {
    let params = match &def.params {
        Value::Null => B::Params::default(),
        raw => serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?,
    };
    B::validate(&params)
}

pub(crate) fn parse_state<B: Block>(raw: Option<&Value>) -> Result<B::State> {
    match raw {
        None | Some(Value::Null) => Ok(B::State::default()),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::block(format!("invalid {} state: {e}", B::KIND))),
    }
}

fn write_outputs<B: Block>(ctx: &mut BlockCtx<'_>, state: &B::State) {
    for (key, value) in B::outputs(state) {
        if value.is_null() {
            continue;
        }
        let path = ctx.def.output_path(ctx.name, &key);
        ctx.vars.set_value(&path, value);
    }
}

/// Run one `update` of block `B`. `fresh` seeds state via `create_state`.
pub(crate) fn run<B: Block>(ctx: &mut BlockCtx<'_>, fresh: bool) -> Result<Outcome> {
    let params = parse_params::<B>(ctx.def)?;
    let mut state = if fresh {
        B::create_state(&params, ctx)?
    } else {
        parse_state::<B>(ctx.vars.state(ctx.name))?
    };
    let progress = B::update(&params, &mut state, ctx)?;
    ctx.vars.set_state(ctx.name, serde_json::to_value(&state)?);
    write_outputs::<B>(ctx, &state);
    let deadlines = if progress.status.is_open() {
        B::deadlines(&params, &state, ctx)
    } else {
        Vec::new()
    };
    Ok(Outcome {
        members: B::members(&state),
        deadlines,
        progress,
    })
}

/// Replace a block's state wholesale and return the outputs it implies.
pub(crate) fn edit_state<B: Block>(raw: &Value) -> Result<(Value, Map<String, Value>)> {
    let state: B::State = serde_json::from_value(raw.clone()).map_err(|e| {
        EngineError::rejected(ErrorKind::MonitoringEditBlockParse, e.to_string())
    })?;
    Ok((serde_json::to_value(&state)?, B::outputs(&state)))
}

/// Apply edited outputs to a block's state and return the new state.
pub(crate) fn edit_outputs<B: Block>(
    current: Option<&Value>,
    outputs: &Map<String, Value>,
) -> Result<(Value, Map<String, Value>)> {
    let mut state = parse_state::<B>(current)?;
    B::apply_outputs(&mut state, outputs)?;
    Ok((serde_json::to_value(&state)?, B::outputs(&state)))
}

pub(crate) fn members_of<B: Block>(raw: Option<&Value>) -> Vec<Member> {
    parse_state::<B>(raw).map(|s| B::members(&s)).unwrap_or_default()
}

/// Bind the block type for `$kind` to `$B` and evaluate `$body`.
macro_rules! dispatch {
    ($kind:expr, $B:ident => $body:expr) => {{
        use pipewright_types::BlockKind as K;
        #[allow(unused_imports)]
        use $crate::blocks::Block as _;
        match $kind {
            K::Start => {
                type $B = $crate::blocks::simple::Start;
                $body
            }
            K::End => {
                type $B = $crate::blocks::simple::End;
                $body
            }
            K::Placeholder => {
                type $B = $crate::blocks::simple::Placeholder;
                $body
            }
            K::Approver => {
                type $B = $crate::blocks::approver::Approver;
                $body
            }
            K::Execution => {
                type $B = $crate::blocks::execution::Execution;
                $body
            }
            K::Form => {
                type $B = $crate::blocks::form::Form;
                $body
            }
            K::Sign => {
                type $B = $crate::blocks::sign::Sign;
                $body
            }
            K::If => {
                type $B = $crate::blocks::condition::Condition;
                $body
            }
            K::ParallelStart => {
                type $B = $crate::blocks::parallel::ParallelStart;
                $body
            }
            K::ParallelEnd => {
                type $B = $crate::blocks::parallel::ParallelEnd;
                $body
            }
            K::Timer => {
                type $B = $crate::blocks::timer::Timer;
                $body
            }
            K::Function => {
                type $B = $crate::blocks::function::Function;
                $body
            }
            K::Notification => {
                type $B = $crate::blocks::notification::Notification;
                $body
            }
            K::SdApp => {
                type $B = $crate::blocks::sd_app::SdApp;
                $body
            }
        }
    }};
}

pub(crate) use dispatch;
