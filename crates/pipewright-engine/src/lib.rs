//! Block runtime for pipewright.
//!
//! A task walks a pipeline graph one block at a time. Each advancement
//! runs inside a single store transaction: the [`Engine`] loads the task,
//! rebuilds the [`VariableStore`] from the latest step, runs the block's
//! state machine and follows whatever sockets it fires.
//!
//! # Architecture
//!
//! ```text
//!   HTTP / bus / SLA sweep
//!            │
//!            ▼
//!   ┌──────────────────┐      ┌──────────────┐
//!   │ Engine           │─────▶│ Store (tx)   │
//!   │ - run / update   │      └──────────────┘
//!   │ - replies, sweep │      ┌──────────────┐
//!   │ - monitoring     │─────▶│ outbox/relay │
//!   └──────────────────┘      └──────────────┘
//!            │
//!            ▼
//!   dispatch!(kind) ──▶ Block::{create_state, update, outputs}
//! ```

pub mod blocks;
pub mod context;
pub mod error;
pub mod handlers;
pub mod monitoring;
pub mod orchestrator;
pub mod pipelines;
pub mod registry;
pub mod services;
pub mod typecheck;
pub mod variables;
pub mod visibility;

pub use error::{EngineError, Result};

pub use blocks::{Block, Outcome, Progress};
pub use context::{BlockCtx, Effects, PendingRequest, RunContext, TaskFrame};
pub use handlers::{FunctionReplyHandler, RunTaskHandler};
pub use monitoring::{BlockData, DeadlineView, EventView, StepView, TaskAction, TaskView};
pub use orchestrator::{Engine, EngineOptions, RunRequest};
pub use registry::{BlockModel, FieldSchema, catalog, model_of, parse_graph, validate_graph};
pub use services::{
    Clock, GroupDirectory, LogMailer, Mail, Mailer, ManualClock, RecordingMailer, Services,
    StaticGroupDirectory, SystemClock,
};
pub use typecheck::is_type_correct;
pub use variables::VariableStore;
