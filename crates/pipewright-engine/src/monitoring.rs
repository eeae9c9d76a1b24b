//! Monitoring: inspecting tasks and intervening in them.
//!
//! Interventions need a paused task. Every write leaves an audit trail:
//! a task event, and for edits a snapshot of the step as it was plus the
//! edit itself.

use chrono::{DateTime, Utc};
use pipewright_delegation::Delegations;
use pipewright_store::Tx;
use pipewright_types::{
    BlockDefinition, EditChangeType, EditRecord, ErrorKind, EventType, Member, PipelineGraph,
    PreviousContent, Step, StepStatus, Task, TaskEvent, TaskStatus, UpdateAction, UpdateDescriptor,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;
use uuid::Uuid;

use crate::blocks::{dispatch, edit_outputs, edit_state};
use crate::context::Effects;
use crate::orchestrator::{Advance, Engine};
use crate::registry::model_of;
use crate::typecheck::is_type_correct;
use crate::variables::VariableStore;
use crate::{EngineError, Result, visibility};

#[derive(Debug, Clone, Serialize)]
pub struct DeadlineView {
    pub action: UpdateAction,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    #[serde(flatten)]
    pub step: Step,
    pub members: Vec<Member>,
    pub deadlines: Vec<DeadlineView>,
    /// Blocks this one may lead to.
    pub next: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub steps: Vec<StepView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: TaskEvent,
    /// How many times the task had been started when this was recorded.
    pub run_index: u32,
}

/// A value as the block produced it and, if edited since, as edited.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockData {
    pub running: Value,
    pub edited: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Pause,
    Start,
    StartByOne,
}

fn visible_block<'g>(graph: &'g PipelineGraph, name: &str) -> Result<&'g BlockDefinition> {
    let def = graph.block(name).ok_or_else(|| {
        EngineError::rejected(ErrorKind::BlockNotFound, format!("no block {name} in pipeline"))
    })?;
    if def.hidden {
        return Err(EngineError::rejected(
            ErrorKind::HiddenBlock,
            format!("block {name} is hidden"),
        ));
    }
    Ok(def)
}

fn latest_named(tx: &Tx<'_>, task: &Task, name: &str) -> Result<Step> {
    tx.latest_step_by_name(task.id, name)?.ok_or_else(|| {
        EngineError::rejected(
            ErrorKind::StepNotFound,
            format!("work {} has no step {name}", task.work_number),
        )
    })
}

fn last_edit(tx: &Tx<'_>, task: &Task, name: &str, change: EditChangeType) -> Result<Option<Value>> {
    Ok(tx
        .list_edits(task.id, name)?
        .into_iter()
        .rev()
        .find(|e| e.change_type == change)
        .map(|e| e.content))
}

fn build_view(tx: &Tx<'_>, task: Task, graph: &PipelineGraph, skip_hidden: bool) -> Result<TaskView> {
    let mut steps = Vec::new();
    for step in tx.list_steps(task.id)? {
        let def = graph.block(&step.name);
        if skip_hidden && def.is_some_and(|d| d.hidden) {
            continue;
        }
        let members = tx.step_members(step.id)?;
        let deadlines = tx
            .pending_deadlines(step.id)?
            .into_iter()
            .map(|(action, at)| DeadlineView { action, at })
            .collect();
        let next = def
            .map(|d| d.all_next().into_iter().map(String::from).collect())
            .unwrap_or_default();
        steps.push(StepView {
            step,
            members,
            deadlines,
            next,
        });
    }
    Ok(TaskView { task, steps })
}

/// Write a block's state and the outputs it implies onto `step`.
fn write_block(step: &mut Step, def: &BlockDefinition, state: Value, outputs: Map<String, Value>) {
    step.state.insert(step.name.clone(), state);
    for (key, value) in outputs {
        if value.is_null() {
            continue;
        }
        step.storage.insert(def.output_path(&step.name, &key), value);
    }
}

impl Engine {
    fn graph_of(tx: &Tx<'_>, task: &Task) -> Result<PipelineGraph> {
        Ok(tx.get_version(task.version_id)?.graph)
    }

    /// Suspend a running task, optionally only some of its steps.
    pub fn pause(&self, work_number: i64, author: &str, steps: Option<&[String]>) -> Result<()> {
        let now = self.now();
        self.store().transaction(|tx| -> Result<()> {
            let task = tx.get_task_by_work_number(work_number)?;
            if task.is_paused || !matches!(task.status, TaskStatus::Created | TaskStatus::Running) {
                return Err(EngineError::rejected(
                    ErrorKind::PauseTask,
                    format!("work {work_number} is {}", task.status),
                ));
            }
            tx.set_task_paused(task.id, true)?;
            tx.update_task_status(task.id, TaskStatus::Stopped)?;
            tx.set_steps_paused(task.id, steps, true)?;
            tx.insert_event(&TaskEvent {
                id: Uuid::new_v4(),
                task_id: task.id,
                author: author.to_string(),
                event_type: EventType::Pause,
                params: json!({"steps": steps.unwrap_or_default()}),
                created_at: now,
            })?;
            Ok(())
        })?;
        info!(work_number, author, "task paused");
        Ok(())
    }

    /// Resume a paused task, restarting each listed block from a copy of
    /// its latest step. `once` advances a single block and halts.
    pub async fn start(&self, work_number: i64, author: &str, steps: &[String], once: bool) -> Result<()> {
        let now = self.now();
        let effects = self.store().transaction(|tx| -> Result<Effects> {
            let task = tx.get_task_by_work_number(work_number)?;
            if !task.is_paused {
                return Err(EngineError::rejected(
                    ErrorKind::UnpauseTask,
                    format!("work {work_number} is not paused"),
                ));
            }
            tx.insert_event(&TaskEvent {
                id: Uuid::new_v4(),
                task_id: task.id,
                author: author.to_string(),
                event_type: EventType::Start,
                params: json!({"steps": steps, "once": once}),
                created_at: now,
            })?;

            let mut adv = Advance::open(self, tx, &task, Delegations::default(), None)?;
            adv.run.once_productive = once;
            let mut copies = Vec::new();
            for name in steps {
                if adv.run.graph.block(name).is_none() {
                    return Err(EngineError::rejected(
                        ErrorKind::BlockNotFound,
                        format!("no block {name} in pipeline"),
                    ));
                }
                let old = latest_named(tx, &task, name)?;
                let cone = adv.run.graph.downstream(name);
                for later in tx.steps_after(task.id, old.time)? {
                    if later.id != old.id && cone.contains(&later.name) {
                        tx.set_step_status(later.id, StepStatus::Skipped)?;
                        tx.clear_deadlines(later.id)?;
                    }
                }
                tx.clear_deadlines(old.id)?;
                let time = adv.tick();
                let copy = Step {
                    id: Uuid::new_v4(),
                    time,
                    updated_at: time,
                    status: StepStatus::Idle,
                    is_paused: false,
                    has_error: false,
                    ..old
                };
                tx.insert_step(&copy)?;
                copies.push(copy);
            }

            tx.set_task_paused(task.id, false)?;
            tx.set_steps_paused(task.id, None, false)?;
            adv.set_task_status(TaskStatus::Running)?;
            let reload = UpdateDescriptor::system(UpdateAction::Reload);
            for copy in copies {
                if adv.is_stopped() {
                    break;
                }
                adv.resume_stored(copy, Some(&reload))?;
            }
            adv.flush()
        })?;
        info!(work_number, author, steps = ?steps, once, "task started");
        self.finish(effects).await;
        self.wake_inbox();
        Ok(())
    }

    /// Task events in order, each with the run it belongs to.
    pub fn task_events(&self, work_number: i64) -> Result<Vec<EventView>> {
        let events = self.store().read(|tx| -> Result<Vec<TaskEvent>> {
            let task = tx.get_task_by_work_number(work_number)?;
            Ok(tx.list_events(task.id)?)
        })?;
        let mut run_index = 1;
        Ok(events
            .into_iter()
            .map(|event| {
                if event.event_type == EventType::Start {
                    run_index += 1;
                }
                EventView { event, run_index }
            })
            .collect())
    }

    /// Rewrite a block of a paused task.
    pub fn edit_block(
        &self,
        work_number: i64,
        author: &str,
        step_name: &str,
        change_type: EditChangeType,
        content: Value,
    ) -> Result<()> {
        let now = self.now();
        self.store().transaction(|tx| -> Result<()> {
            let task = tx.get_task_by_work_number(work_number)?;
            if !task.is_paused {
                return Err(EngineError::rejected(
                    ErrorKind::Validation,
                    format!("pause work {work_number} before editing it"),
                ));
            }
            let graph = Self::graph_of(tx, &task)?;
            let def = visible_block(&graph, step_name)?.clone();
            let mut step = latest_named(tx, &task, step_name)?;

            let event_id = Uuid::new_v4();
            tx.insert_event(&TaskEvent {
                id: event_id,
                task_id: task.id,
                author: author.to_string(),
                event_type: EventType::Edit,
                params: json!({"step": step_name, "change_type": change_type}),
                created_at: now,
            })?;
            tx.insert_previous_content(&PreviousContent {
                id: Uuid::new_v4(),
                step_id: step.id,
                event_id,
                state: step.state.clone(),
                storage: step.storage.clone(),
                created_at: now,
            })?;

            match change_type {
                EditChangeType::State => {
                    let (state, outputs) = dispatch!(def.kind, B => edit_state::<B>(&content))?;
                    write_block(&mut step, &def, state, outputs);
                }
                EditChangeType::Output => {
                    let Value::Object(outputs) = &content else {
                        return Err(EngineError::rejected(
                            ErrorKind::MonitoringEditBlockParse,
                            "outputs must be an object",
                        ));
                    };
                    let model = model_of(def.kind);
                    for (key, value) in outputs {
                        if let Some(expected) = model.output_type(key) {
                            if !is_type_correct(expected, value) {
                                return Err(EngineError::rejected(
                                    ErrorKind::TypeMismatch,
                                    format!("{step_name}.{key} must be {expected}"),
                                ));
                            }
                        }
                    }
                    let current = step.state.get(step_name).cloned();
                    let (state, outputs) =
                        dispatch!(def.kind, B => edit_outputs::<B>(current.as_ref(), outputs))?;
                    write_block(&mut step, &def, state, outputs);
                }
                EditChangeType::Context => {
                    Self::edit_context(tx, &task, &graph, &mut step, &content)?;
                }
            }
            step.updated_at = now;
            tx.update_step(&step)?;
            tx.insert_edit(
                task.id,
                &EditRecord {
                    id: Uuid::new_v4(),
                    event_id,
                    step_id: step.id,
                    step_name: step_name.to_string(),
                    author: author.to_string(),
                    change_type,
                    content,
                    created_at: now,
                },
            )?;
            Ok(())
        })?;
        info!(work_number, author, step = step_name, change = %change_type, "block edited");
        Ok(())
    }

    /// Rewrite `block.key` values the edited step read, both in its own
    /// storage and in the nearest earlier step of that block.
    fn edit_context(
        tx: &Tx<'_>,
        task: &Task,
        graph: &PipelineGraph,
        step: &mut Step,
        content: &Value,
    ) -> Result<()> {
        let Value::Object(entries) = content else {
            return Err(EngineError::rejected(
                ErrorKind::MonitoringEditBlockParse,
                "context must be an object",
            ));
        };
        let mut sources: Vec<Step> = Vec::new();
        for (key, value) in entries {
            let Some((block, _)) = key.split_once('.') else {
                return Err(EngineError::rejected(
                    ErrorKind::Validation,
                    format!("{key} does not name a block output"),
                ));
            };
            if graph.block(block).is_none() {
                return Err(EngineError::rejected(
                    ErrorKind::GetBlockContext,
                    format!("no block {block} in pipeline"),
                ));
            }
            step.storage.insert(key.clone(), value.clone());

            if let Some(source) = sources.iter_mut().find(|s| s.name == block) {
                source.storage.insert(key.clone(), value.clone());
                continue;
            }
            if let Some(mut source) = tx.step_by_name_as_of(task.id, block, step.time)? {
                if source.id != step.id {
                    source.storage.insert(key.clone(), value.clone());
                    sources.push(source);
                }
            }
        }
        for source in &sources {
            tx.update_step(source)?;
        }
        Ok(())
    }

    /// Full task view for monitoring; hidden blocks are left out.
    pub fn monitoring_task(&self, work_number: i64) -> Result<TaskView> {
        self.store().read(|tx| -> Result<TaskView> {
            let task = tx.get_task_by_work_number(work_number)?;
            let graph = Self::graph_of(tx, &task)?;
            build_view(tx, task, &graph, true)
        })
    }

    /// Task view for a participant, filtered by what `login` may see.
    pub async fn task_for(&self, work_number: i64, login: &str) -> Result<TaskView> {
        let delegations = self.delegations_for(login).await?;
        let acting = delegations.with_delegators(&[login.to_string()]);
        let mut view = self.store().read(|tx| -> Result<TaskView> {
            let task = tx.get_task_by_work_number(work_number)?;
            if !tx.task_visible_to(task.id, &acting)? {
                return Err(EngineError::rejected(
                    ErrorKind::Forbidden,
                    format!("{login} takes no part in work {work_number}"),
                ));
            }
            let graph = Self::graph_of(tx, &task)?;
            build_view(tx, task, &graph, false)
        })?;
        visibility::apply(&mut view, login, &delegations);
        Ok(view)
    }

    /// Values the block read: everything in its step except its own outputs.
    pub fn block_inputs(&self, work_number: i64, step_name: &str) -> Result<BlockData> {
        self.store().read(|tx| -> Result<BlockData> {
            let task = tx.get_task_by_work_number(work_number)?;
            visible_block(&Self::graph_of(tx, &task)?, step_name)?;
            let step = latest_named(tx, &task, step_name)?;
            let prefix = format!("{step_name}.");
            let running: Map<String, Value> = step
                .storage
                .into_iter()
                .filter(|(k, _)| !k.starts_with(&prefix))
                .collect();
            Ok(BlockData {
                running: Value::Object(running),
                edited: last_edit(tx, &task, step_name, EditChangeType::Context)?,
            })
        })
    }

    pub fn block_outputs(&self, work_number: i64, step_name: &str) -> Result<BlockData> {
        self.store().read(|tx| -> Result<BlockData> {
            let task = tx.get_task_by_work_number(work_number)?;
            visible_block(&Self::graph_of(tx, &task)?, step_name)?;
            let step = latest_named(tx, &task, step_name)?;
            let running = VariableStore::from_step(&step).block_values(step_name);
            Ok(BlockData {
                running: Value::Object(running),
                edited: last_edit(tx, &task, step_name, EditChangeType::Output)?,
            })
        })
    }

    pub fn block_state(&self, work_number: i64, step_name: &str) -> Result<BlockData> {
        self.store().read(|tx| -> Result<BlockData> {
            let task = tx.get_task_by_work_number(work_number)?;
            visible_block(&Self::graph_of(tx, &task)?, step_name)?;
            let step = latest_named(tx, &task, step_name)?;
            Ok(BlockData {
                running: step.block_state().cloned().unwrap_or(Value::Null),
                edited: last_edit(tx, &task, step_name, EditChangeType::State)?,
            })
        })
    }

    /// Outputs of every visible block that ran before `step_name`.
    pub fn block_context(&self, work_number: i64, step_name: &str) -> Result<Map<String, Value>> {
        self.store().read(|tx| -> Result<Map<String, Value>> {
            let task = tx.get_task_by_work_number(work_number)?;
            let graph = Self::graph_of(tx, &task)?;
            visible_block(&graph, step_name)?;
            let step = latest_named(tx, &task, step_name)?;
            let earlier: Vec<String> = tx
                .list_steps(task.id)?
                .into_iter()
                .filter(|s| s.time < step.time && s.name != step_name)
                .filter(|s| graph.block(&s.name).is_some_and(|d| !d.hidden))
                .map(|s| s.name)
                .collect();
            Ok(step
                .storage
                .into_iter()
                .filter(|(key, _)| {
                    key.split_once('.')
                        .is_some_and(|(block, _)| earlier.iter().any(|e| e == block))
                })
                .collect())
        })
    }

    pub fn block_errors(&self, work_number: i64, step_name: &str) -> Result<Vec<String>> {
        self.store().read(|tx| -> Result<Vec<String>> {
            let task = tx.get_task_by_work_number(work_number)?;
            visible_block(&Self::graph_of(tx, &task)?, step_name)?;
            let step = latest_named(tx, &task, step_name)?;
            let prefix = format!("{step_name}: ");
            Ok(step
                .errors
                .into_iter()
                .filter(|e| e.starts_with(&prefix))
                .collect())
        })
    }

    /// Inputs a block would read if it were entered now.
    pub fn not_created_block_inputs(&self, work_number: i64, block: &str) -> Result<Map<String, Value>> {
        self.store().read(|tx| -> Result<Map<String, Value>> {
            let task = tx.get_task_by_work_number(work_number)?;
            let graph = Self::graph_of(tx, &task)?;
            let def = visible_block(&graph, block)?;
            let vars = match tx.latest_step(task.id)? {
                Some(latest) => VariableStore::from_step(&latest),
                None => VariableStore::from_parameters(
                    &tx.get_version(task.version_id)?.pipeline_name,
                    &task.parameters,
                ),
            };
            Ok(def
                .input
                .iter()
                .map(|m| (m.name.clone(), vars.get(&m.global).cloned().unwrap_or(Value::Null)))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};
    use pipewright_store::Store;
    use pipewright_types::{BlockKind, DEFAULT_SOCKET, VersionStatus};

    use crate::orchestrator::RunRequest;
    use crate::services::{ManualClock, Services};

    fn setup(hidden: bool) -> (Engine, Arc<ManualClock>, i64) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = Engine::new(store, Services::basic().with_clock(clock.clone()));
        let mut approver = BlockDefinition::new(BlockKind::Approver)
            .with_params(json!({"approvers": ["u1"]}))
            .with_socket("approve", &["end_0"]);
        approver.hidden = hidden;
        let graph = PipelineGraph {
            entrypoint: "start_0".into(),
            blocks: BTreeMap::from([
                (
                    "start_0".to_string(),
                    BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["approver_0"]),
                ),
                ("approver_0".to_string(), approver),
                ("end_0".to_string(), BlockDefinition::new(BlockKind::End)),
            ]),
            inputs: vec![],
            outputs: vec![],
        };
        let version_id = engine
            .store()
            .transaction(|tx| -> pipewright_store::Result<Uuid> {
                let p = tx.create_pipeline("monitored", "author")?;
                let v = tx.create_version(p.id, "author", &graph, "")?;
                tx.set_version_status(v.id, VersionStatus::Approved)?;
                Ok(v.id)
            })
            .unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let task = rt
            .block_on(engine.run_task(RunRequest {
                version_id,
                author: "init".into(),
                parameters: json!({"amount": 3}),
                ..RunRequest::default()
            }))
            .unwrap();
        (engine, clock, task.work_number)
    }

    #[test]
    fn test_pause_requires_running_task() {
        let (engine, _, wn) = setup(false);
        engine.pause(wn, "admin", None).unwrap();
        assert_eq!(
            engine.pause(wn, "admin", None).unwrap_err().kind(),
            ErrorKind::PauseTask
        );
    }

    #[test]
    fn test_edit_requires_pause_and_checks_types() {
        let (engine, _, wn) = setup(false);
        let edit = |content: Value| {
            engine.edit_block(wn, "admin", "approver_0", EditChangeType::Output, content)
        };
        assert_eq!(edit(json!({"decision": "approve"})).unwrap_err().kind(), ErrorKind::Validation);
        engine.pause(wn, "admin", None).unwrap();
        assert_eq!(edit(json!({"decision": 5})).unwrap_err().kind(), ErrorKind::TypeMismatch);
        edit(json!({"decision": "approve"})).unwrap();

        let outputs = engine.block_outputs(wn, "approver_0").unwrap();
        assert_eq!(outputs.running["decision"], json!("approve"));
        assert_eq!(outputs.edited, Some(json!({"decision": "approve"})));
    }

    #[test]
    fn test_context_edit_rewrites_earlier_step() {
        let (engine, _, wn) = setup(false);
        engine.pause(wn, "admin", None).unwrap();
        engine
            .edit_block(
                wn,
                "admin",
                "approver_0",
                EditChangeType::Context,
                json!({"start_0.amount": 7}),
            )
            .unwrap();
        let ctx = engine.block_context(wn, "approver_0").unwrap();
        assert_eq!(ctx["start_0.amount"], json!(7));
        let err = engine
            .edit_block(wn, "admin", "approver_0", EditChangeType::Context, json!({"ghost.x": 1}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GetBlockContext);
    }

    #[test]
    fn test_hidden_block_reads_forbidden() {
        let (engine, _, wn) = setup(true);
        assert_eq!(
            engine.block_state(wn, "approver_0").unwrap_err().kind(),
            ErrorKind::HiddenBlock
        );
        let view = engine.monitoring_task(wn).unwrap();
        assert!(view.steps.iter().all(|s| s.step.name != "approver_0"));
    }

    #[test]
    fn test_run_index_counts_starts() {
        let (engine, clock, wn) = setup(false);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        engine.pause(wn, "admin", None).unwrap();
        clock.advance(Duration::minutes(1));
        rt.block_on(engine.start(wn, "admin", &[], false)).unwrap();
        clock.advance(Duration::minutes(1));
        engine.pause(wn, "admin", None).unwrap();

        let events = engine.task_events(wn).unwrap();
        let kinds: Vec<(EventType, u32)> = events.iter().map(|e| (e.event.event_type, e.run_index)).collect();
        assert_eq!(
            kinds,
            vec![(EventType::Pause, 1), (EventType::Start, 2), (EventType::Pause, 2)]
        );
    }
}
