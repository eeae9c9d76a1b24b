//! The control loop that advances tasks.
//!
//! Every entry point opens one store transaction, loads the task frame,
//! runs the targeted block and follows the sockets it fires, recursively,
//! inside that same transaction. Function requests and service-desk events
//! go to the outbox before commit; mails are sent after it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pipewright_bus::{FunctionReply, SdEvent, Topics};
use pipewright_delegation::{DelegationResolver, Delegations};
use pipewright_store::{DueDeadline, NewTask, Store, StoreError, Tx};
use pipewright_types::{
    BlockDefinition, BlockKind, DEFAULT_SOCKET, ErrorKind, HumanStatus, Step, StepStatus, Task,
    TaskStatus, UpdateAction, UpdateDescriptor, VersionStatus,
};
use serde_json::{Map, Value, json};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blocks::{Outcome, Progress, dispatch, run};
use crate::context::{BlockCtx, Effects, RunContext, TaskFrame};
use crate::registry::parallel_cluster;
use crate::services::Services;
use crate::variables::VariableStore;
use crate::{EngineError, Result};

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Blocks advanced in one chain before the chain counts as runaway.
    pub max_recursion_depth: u32,
    /// Offer the placeholder block in the catalog.
    pub expose_placeholder: bool,
    pub topics: Topics,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_recursion_depth: 10,
            expose_placeholder: false,
            topics: Topics::default(),
        }
    }
}

/// A request to start a task.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub version_id: Uuid,
    pub author: String,
    /// Login the task runs on behalf of; defaults to the author.
    pub initiator: Option<String>,
    pub work_title: Option<String>,
    pub parameters: Value,
    pub is_test: bool,
    pub parent_work_number: Option<i64>,
    pub request_id: Option<String>,
}

/// The workflow engine.
pub struct Engine {
    store: Arc<Store>,
    services: Services,
    delegations: Option<Arc<DelegationResolver>>,
    options: EngineOptions,
    relay: Option<Arc<Notify>>,
    inbox: Option<Arc<Notify>>,
}

impl Engine {
    pub fn new(store: Arc<Store>, services: Services) -> Self {
        Self {
            store,
            services,
            delegations: None,
            options: EngineOptions::default(),
            relay: None,
            inbox: None,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_delegations(mut self, resolver: Arc<DelegationResolver>) -> Self {
        self.delegations = Some(resolver);
        self
    }

    /// Wake the outbox relay after every commit that queued messages.
    pub fn with_relay_waker(mut self, waker: Arc<Notify>) -> Self {
        self.relay = Some(waker);
        self
    }

    /// Wake the inbox consumers when a paused task runs again, so replies
    /// deferred while it was paused are delivered.
    pub fn with_inbox_waker(mut self, waker: Arc<Notify>) -> Self {
        self.inbox = Some(waker);
        self
    }

    pub(crate) fn wake_inbox(&self) {
        if let Some(waker) = &self.inbox {
            waker.notify_one();
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    /// Delegations in which `login` acts for somebody else.
    pub async fn delegations_for(&self, login: &str) -> Result<Delegations> {
        let Some(resolver) = &self.delegations else {
            return Ok(Delegations::default());
        };
        if login.is_empty() {
            return Ok(Delegations::default());
        }
        Ok(resolver.to_login(login, self.now().date_naive()).await?)
    }

    /// Create a task and advance it from the entry point.
    pub async fn run_task(&self, req: RunRequest) -> Result<Task> {
        let (task, effects) = self.store.transaction(|tx| -> Result<(Task, Effects)> {
            let version = tx.get_version(req.version_id)?;
            if version.status != VersionStatus::Approved && !req.is_test {
                return Err(EngineError::rejected(
                    ErrorKind::VersionNotApproved,
                    format!("version {} is {}", version.id, version.status),
                ));
            }
            let task = tx.create_task(NewTask {
                version_id: version.id,
                work_title: req
                    .work_title
                    .clone()
                    .unwrap_or_else(|| version.pipeline_name.clone()),
                author: req.author.clone(),
                initiator: req.initiator.clone().unwrap_or_else(|| req.author.clone()),
                parameters: req.parameters.clone(),
                is_test: req.is_test,
                parent_work_number: req.parent_work_number,
            })?;
            if let Some(parent) = req.parent_work_number {
                tx.link_parent_child(parent, task.work_number)?;
            }

            let mut adv = Advance::open(self, tx, &task, Delegations::default(), req.request_id.clone())?;
            adv.set_task_status(TaskStatus::Running)?;
            let entry = adv.run.graph.entrypoint.clone();
            adv.enter(&entry, 0)?;
            let effects = adv.flush()?;
            Ok((tx.get_task(task.id)?, effects))
        })?;
        info!(work_number = task.work_number, status = %task.status, "task started");
        self.finish(effects).await;
        Ok(task)
    }

    /// Start a task on the newest approved version of a pipeline.
    pub async fn run_by_pipeline(&self, pipeline_id: Uuid, mut req: RunRequest) -> Result<Task> {
        let version = self
            .store
            .read(|tx| tx.latest_version(pipeline_id, Some(VersionStatus::Approved)))?;
        let Some(version) = version else {
            return Err(EngineError::rejected(
                ErrorKind::VersionNotApproved,
                format!("pipeline {pipeline_id} has no approved version"),
            ));
        };
        req.version_id = version.id;
        self.run_task(req).await
    }

    /// Re-run a settled task with its original parameters.
    pub async fn run_new_by_prev(&self, work_number: i64, author: &str) -> Result<Task> {
        let (prev, version_id) = self.store.read(|tx| -> Result<(Task, Uuid)> {
            let prev = tx.get_task_by_work_number(work_number)?;
            let version = tx.get_version(prev.version_id)?;
            let latest = tx.latest_version(version.pipeline_id, Some(VersionStatus::Approved))?;
            Ok((prev, latest.map(|v| v.id).unwrap_or(version.id)))
        })?;
        if !prev.status.is_terminal() {
            return Err(EngineError::rejected(
                ErrorKind::Validation,
                format!("work {work_number} is still {}", prev.status),
            ));
        }
        self.run_task(RunRequest {
            version_id,
            author: author.to_string(),
            initiator: Some(prev.initiator.clone()),
            work_title: Some(prev.work_title.clone()),
            parameters: prev.parameters.clone(),
            is_test: prev.is_test,
            parent_work_number: Some(prev.work_number),
            request_id: None,
        })
        .await
    }

    /// Apply a user action to the task's unfinished steps of the action's
    /// kinds. The first step that accepts it advances; `step_name` narrows
    /// the candidates.
    pub async fn update_task(
        &self,
        work_number: i64,
        step_name: Option<&str>,
        update: UpdateDescriptor,
        request_id: Option<String>,
    ) -> Result<()> {
        if update.action.is_internal() {
            return Err(EngineError::rejected(
                ErrorKind::UnknownAction,
                format!("{} is not a user action", update.action),
            ));
        }
        let delegations = self.delegations_for(&update.by_login).await?;
        let effects = self.store.transaction(|tx| -> Result<Effects> {
            let task = tx.get_task_by_work_number(work_number)?;
            if task.is_paused {
                return Err(EngineError::rejected(
                    ErrorKind::TaskIsPaused,
                    format!("work {work_number} is paused"),
                ));
            }
            if !task.is_runnable() {
                return Err(EngineError::rejected(
                    ErrorKind::UpdateNotRunningTask,
                    format!("work {work_number} is {}", task.status),
                ));
            }
            let candidates = open_steps(tx, &task, update.action.target_kinds(), step_name)?;
            if candidates.is_empty() {
                return Err(EngineError::rejected(
                    ErrorKind::NoUnfinishedSteps,
                    format!("no unfinished step takes {}", update.action),
                ));
            }

            let mut adv = Advance::open(self, tx, &task, delegations.clone(), request_id.clone())?;
            let mut refusal = None;
            for step in candidates {
                let name = step.name.clone();
                match adv.resume(step, &update, 0) {
                    Ok(()) => {
                        refusal = None;
                        break;
                    }
                    Err(e) if e.is_rejection() && !adv.persisted => {
                        debug!(step = %name, action = %update.action, error = %e, "step refused update");
                        refusal.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            if let Some(e) = refusal {
                return Err(e);
            }
            adv.flush()
        })?;
        info!(work_number, action = %update.action, by = %update.by_login, "task updated");
        self.finish(effects).await;
        Ok(())
    }

    /// Deliver a function runner reply to the step that waits for it.
    pub async fn handle_function_reply(&self, reply: FunctionReply) -> Result<()> {
        let effects = self.store.transaction(|tx| -> Result<Effects> {
            let step = match tx.get_step(reply.step_id) {
                Ok(step) => step,
                Err(StoreError::NotFound { .. }) => {
                    warn!(step_id = %reply.step_id, "reply for unknown step dropped");
                    return Ok(Effects::default());
                }
                Err(e) => return Err(e.into()),
            };
            if step.kind != BlockKind::Function || !step.status.is_open() {
                debug!(step_id = %step.id, status = %step.status, "reply for settled step ignored");
                return Ok(Effects::default());
            }
            let task = tx.get_task(step.task_id)?;
            if task.is_paused {
                return Err(EngineError::rejected(
                    ErrorKind::TaskIsPaused,
                    format!("work {} is paused", task.work_number),
                ));
            }
            if !task.is_runnable() {
                return Ok(Effects::default());
            }
            let update = UpdateDescriptor::new(
                UpdateAction::FunctionResult,
                "",
                serde_json::to_value(&reply)?,
            );
            let mut adv = Advance::open(self, tx, &task, Delegations::default(), None)?;
            adv.resume(step, &update, 0)?;
            adv.flush()
        })?;
        self.finish(effects).await;
        Ok(())
    }

    /// Fire every deadline that is due. Returns how many were delivered.
    pub async fn sla_sweep(&self, limit: u32) -> Result<usize> {
        let now = self.now();
        let due = self.store.read(|tx| tx.due_deadlines(now, limit))?;
        let mut fired = 0;
        for deadline in due {
            match self.fire_deadline(&deadline).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    step_id = %deadline.step_id,
                    action = %deadline.action,
                    error = %e,
                    "deadline delivery failed"
                ),
            }
        }
        if fired > 0 {
            debug!(fired, "sla sweep");
        }
        Ok(fired)
    }

    /// Start tasks left in `created` without any step, once they are older
    /// than `min_lifetime` and younger than `max_lifetime`. Returns how many
    /// were started.
    pub async fn retry_stalled_tasks(
        &self,
        min_lifetime: Duration,
        max_lifetime: Duration,
        limit: usize,
    ) -> Result<usize> {
        let now = self.now();
        let oldest = now - max_lifetime;
        let candidates: Vec<Task> = self
            .store
            .read(|tx| tx.tasks_changed_before(now - min_lifetime, &[TaskStatus::Created]))?
            .into_iter()
            .filter(|t| !t.is_paused && t.last_changed_at > oldest)
            .take(limit)
            .collect();

        let mut started = 0;
        for task in candidates {
            let work_number = task.work_number;
            let outcome = self.store.transaction(|tx| -> Result<Option<Effects>> {
                let task = tx.get_task(task.id)?;
                if task.status != TaskStatus::Created || tx.latest_step(task.id)?.is_some() {
                    return Ok(None);
                }
                let mut adv = Advance::open(self, tx, &task, Delegations::default(), None)?;
                adv.set_task_status(TaskStatus::Running)?;
                let entry = adv.run.graph.entrypoint.clone();
                adv.enter(&entry, 0)?;
                Ok(Some(adv.flush()?))
            });
            match outcome {
                Ok(Some(effects)) => {
                    info!(work_number, "stalled task started");
                    self.finish(effects).await;
                    started += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(work_number, error = %e, "stalled task retry failed"),
            }
        }
        Ok(started)
    }

    async fn fire_deadline(&self, deadline: &DueDeadline) -> Result<bool> {
        let (fired, effects) = self.store.transaction(|tx| -> Result<(bool, Effects)> {
            let task = tx.get_task(deadline.task_id)?;
            if task.is_paused {
                return Ok((false, Effects::default()));
            }
            tx.mark_deadline_processed(deadline.id)?;
            let step = tx.get_step(deadline.step_id)?;
            if !step.status.is_open() || !task.is_runnable() {
                return Ok((false, Effects::default()));
            }
            let mut adv = Advance::open(self, tx, &task, Delegations::default(), None)?;
            match adv.resume(step, &UpdateDescriptor::system(deadline.action), 0) {
                Ok(()) => Ok((true, adv.flush()?)),
                Err(e) if e.is_rejection() && !adv.persisted => {
                    warn!(work_number = task.work_number, action = %deadline.action, error = %e, "deadline refused");
                    Ok((false, Effects::default()))
                }
                Err(e) => Err(e),
            }
        })?;
        self.finish(effects).await;
        Ok(fired)
    }

    /// Cancel tasks. Settled tasks are left alone. Returns the work
    /// numbers that were stopped.
    pub async fn stop_tasks(&self, work_numbers: &[i64], author: &str) -> Result<Vec<i64>> {
        let now = self.now();
        let (stopped, effects) = self.store.transaction(|tx| -> Result<(Vec<i64>, Effects)> {
            let mut stopped = Vec::new();
            let mut effects = Effects::default();
            for &work_number in work_numbers {
                let task = tx.get_task_by_work_number(work_number)?;
                if task.status.is_terminal() {
                    continue;
                }
                tx.stop_open_steps(task.id)?;
                tx.update_task_status(task.id, TaskStatus::Canceled)?;
                tx.update_task_human_status(task.id, HumanStatus::Canceled, "")?;
                tx.set_task_paused(task.id, false)?;
                effects.events.push(SdEvent {
                    task_id: task.id,
                    work_number,
                    step_name: String::new(),
                    event: "task_canceled".into(),
                    status: TaskStatus::Canceled.to_string(),
                    human_status: HumanStatus::Canceled.to_string(),
                    payload: json!({"author": author}),
                    created_at: now,
                });
                stopped.push(work_number);
            }
            flush_outbox(tx, &self.options.topics, &mut effects)?;
            Ok((stopped, effects))
        })?;
        info!(count = stopped.len(), author, "tasks stopped");
        self.finish(effects).await;
        Ok(stopped)
    }

    /// Record the initiator's rating of a finished task.
    pub fn rate_task(&self, work_number: i64, login: &str, rate: i32, comment: Option<&str>) -> Result<()> {
        if !(1..=5).contains(&rate) {
            return Err(EngineError::rejected(ErrorKind::Validation, "rate must be 1..=5"));
        }
        self.store.transaction(|tx| -> Result<()> {
            let task = tx.get_task_by_work_number(work_number)?;
            if task.initiator != login {
                return Err(EngineError::rejected(
                    ErrorKind::Forbidden,
                    "only the initiator rates a work",
                ));
            }
            if task.status != TaskStatus::Finished {
                return Err(EngineError::rejected(
                    ErrorKind::RateTask,
                    format!("work {work_number} is {}", task.status),
                ));
            }
            tx.update_task_rate(task.id, rate, comment)?;
            Ok(())
        })
    }

    /// Post-commit work: send mail, nudge the relay.
    pub(crate) async fn finish(&self, effects: Effects) {
        for mail in &effects.mails {
            if let Err(e) = self.services.mailer.send(mail).await {
                warn!(to = ?mail.to, error = %e, "mail not sent");
            }
        }
        if let Some(waker) = &self.relay {
            waker.notify_one();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Latest open, unpaused step per name among `kinds`, oldest first.
fn open_steps(
    tx: &Tx<'_>,
    task: &Task,
    kinds: &[BlockKind],
    step_name: Option<&str>,
) -> Result<Vec<Step>> {
    let mut latest: Vec<Step> = Vec::new();
    for step in tx.unfinished_steps(task.id, kinds)? {
        if step.is_paused || step_name.is_some_and(|n| n != step.name) {
            continue;
        }
        latest.retain(|s| s.name != step.name);
        latest.push(step);
    }
    latest.sort_by(|a, b| (a.time, a.id).cmp(&(b.time, b.id)));
    Ok(latest)
}

/// Write queued requests and events to the outbox.
pub(crate) fn flush_outbox(tx: &Tx<'_>, topics: &Topics, effects: &mut Effects) -> Result<()> {
    for pending in effects.requests.drain(..) {
        let payload = serde_json::to_string(&pending.request)?;
        tx.enqueue_outbox(&topics.function_out, &pending.request.key(), &payload, pending.not_before)?;
    }
    for event in effects.events.drain(..) {
        let payload = serde_json::to_string(&event)?;
        tx.enqueue_outbox(&topics.sd_events, &event.key(), &payload, event.created_at)?;
    }
    Ok(())
}

/// One advancement of one task inside an open transaction.
pub(crate) struct Advance<'a, 'c> {
    engine: &'a Engine,
    tx: &'a Tx<'c>,
    pub run: RunContext,
    now: DateTime<Utc>,
    last_time: Option<DateTime<Utc>>,
    /// The task reached a status that ends advancement.
    stopped: bool,
    /// Something was written for this advancement.
    pub persisted: bool,
}

impl<'a, 'c> Advance<'a, 'c> {
    pub fn open(
        engine: &'a Engine,
        tx: &'a Tx<'c>,
        task: &Task,
        delegations: Delegations,
        request_id: Option<String>,
    ) -> Result<Self> {
        let version = tx.get_version(task.version_id)?;
        let settings = tx.get_version_settings(version.id)?;
        let last_time = tx.latest_step(task.id)?.map(|s| s.time);
        Ok(Self {
            engine,
            tx,
            run: RunContext {
                frame: TaskFrame::new(task, &version),
                graph: version.graph,
                settings,
                delegations,
                request_id,
                once_productive: false,
                effects: Effects::default(),
            },
            now: engine.now(),
            last_time,
            stopped: false,
            persisted: false,
        })
    }

    fn task_id(&self) -> Uuid {
        self.run.frame.task_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// A step time strictly after every step this task already has.
    pub fn tick(&mut self) -> DateTime<Utc> {
        let t = match self.last_time {
            Some(last) if last >= self.now => last + Duration::microseconds(1),
            _ => self.now,
        };
        self.last_time = Some(t);
        t
    }

    pub fn new_step(&mut self, name: &str, kind: BlockKind) -> Step {
        let time = self.tick();
        Step {
            id: Uuid::new_v4(),
            task_id: self.task_id(),
            name: name.to_string(),
            kind,
            time,
            updated_at: time,
            status: StepStatus::Idle,
            has_error: false,
            is_paused: false,
            state: Map::new(),
            storage: Map::new(),
            steps: Vec::new(),
            errors: Vec::new(),
            stop_points: Default::default(),
        }
    }

    fn block_def(&self, name: &str) -> Result<BlockDefinition> {
        self.run.graph.block(name).cloned().ok_or_else(|| {
            EngineError::rejected(ErrorKind::BlockNotFound, format!("no block {name} in pipeline"))
        })
    }

    /// Arrive at block `name` from a predecessor or the entry point.
    pub fn enter(&mut self, name: &str, depth: u32) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        let def = self.block_def(name)?;
        if let Some(latest) = self.tx.latest_step_by_name(self.task_id(), name)? {
            if latest.status.is_open() {
                if def.kind == BlockKind::ParallelEnd {
                    return self.execute(latest, false, None, depth);
                }
                debug!(block = name, "block already open, arrival ignored");
                return Ok(());
            }
        }
        let step = self.new_step(name, def.kind);
        self.execute(step, true, None, depth)
    }

    /// Re-enter an existing step with an update.
    pub fn resume(&mut self, step: Step, update: &UpdateDescriptor, depth: u32) -> Result<()> {
        self.execute(step, false, Some(update), depth)
    }

    /// Run a step that is already persisted.
    pub fn resume_stored(&mut self, step: Step, update: Option<&UpdateDescriptor>) -> Result<()> {
        self.execute(step, false, update, 0)
    }

    fn vars_for(&self, step: &Step, fresh: bool) -> Result<VariableStore> {
        let latest = self.tx.latest_step(self.task_id())?;
        let mut vars = match &latest {
            Some(latest) => VariableStore::from_step(latest),
            None => VariableStore::from_parameters(
                &self.run.frame.pipeline_name,
                &self.run.frame.parameters,
            ),
        };
        if fresh {
            vars.clear_values(&step.name);
        } else if latest.as_ref().map(|l| l.id) != Some(step.id) {
            vars.overlay_step(step);
        }
        Ok(vars)
    }

    /// Predecessors of a parallel join that fired since its section opened
    /// and since the join last fired. Join steps skipped by a restart never
    /// fired and do not reset the count.
    fn arrivals(&self, name: &str, current: Uuid) -> Result<Vec<String>> {
        let graph = &self.run.graph;
        let starts: Vec<&String> = graph
            .blocks
            .iter()
            .filter(|(_, d)| d.kind == BlockKind::ParallelStart)
            .filter(|(s, _)| parallel_cluster(graph, s, 0).is_ok_and(|c| c.end == name))
            .map(|(s, _)| s)
            .collect();
        let steps = self.tx.list_steps(self.task_id())?;
        let since = steps
            .iter()
            .filter(|s| s.id != current)
            .filter(|s| starts.contains(&&s.name) || (s.name == name && s.status == StepStatus::Finished))
            .map(|s| s.time)
            .max();
        Ok(graph
            .predecessors(name)
            .into_iter()
            .filter(|p| {
                steps.iter().any(|s| {
                    &s.name == p && s.status.is_traversable() && since.is_none_or(|t| s.time > t)
                })
            })
            .collect())
    }

    fn execute(
        &mut self,
        mut step: Step,
        fresh: bool,
        update: Option<&UpdateDescriptor>,
        depth: u32,
    ) -> Result<()> {
        let def = self.block_def(&step.name)?;
        let mut vars = self.vars_for(&step, fresh)?;
        let arrivals = if def.kind == BlockKind::ParallelEnd {
            self.arrivals(&step.name, step.id)?
        } else {
            Vec::new()
        };
        let excluded = fresh && vars.stop_points().is_excluded(&step.name);

        let mut effects = Effects::default();
        let result = if depth > self.engine.options.max_recursion_depth {
            Err(EngineError::block(format!(
                "took too long: more than {} blocks in one advancement",
                self.engine.options.max_recursion_depth
            )))
        } else if excluded {
            let socket = def
                .sockets
                .iter()
                .find(|s| s.id == DEFAULT_SOCKET)
                .or_else(|| def.sockets.first())
                .map(|s| vec![s.id.clone()])
                .unwrap_or_default();
            debug!(block = %step.name, "excluded block passed through");
            Ok(Outcome {
                progress: Progress::finished_on(socket),
                members: Vec::new(),
                deadlines: Vec::new(),
            })
        } else {
            let mut ctx = BlockCtx {
                name: &step.name,
                def: &def,
                step_id: step.id,
                step_time: step.time,
                frame: &self.run.frame,
                graph: &self.run.graph,
                vars: &mut vars,
                update,
                delegations: &self.run.delegations,
                services: &self.engine.services,
                effects: &mut effects,
                now: self.now,
                arrivals: &arrivals,
            };
            dispatch!(def.kind, B => run::<B>(&mut ctx, fresh))
        };

        match result {
            Ok(outcome) => {
                self.run.effects.requests.append(&mut effects.requests);
                self.run.effects.events.append(&mut effects.events);
                self.run.effects.mails.append(&mut effects.mails);
                self.settle(step, &def, vars, fresh, outcome, depth)
            }
            Err(EngineError::BlockFailed(reason)) => {
                warn!(
                    work_number = self.run.frame.work_number,
                    block = %step.name,
                    error = %reason,
                    "block failed"
                );
                vars.add_step(&step.name);
                vars.add_error(format!("{}: {reason}", step.name));
                vars.write_to(&mut step);
                step.status = StepStatus::Error;
                step.has_error = true;
                step.updated_at = self.now;
                self.save_step(&step, fresh)?;
                self.tx.clear_deadlines(step.id)?;
                self.tx
                    .update_task_human_status(self.task_id(), HumanStatus::Error, &reason)?;
                self.set_task_status(TaskStatus::Error)
            }
            Err(e) => Err(e),
        }
    }

    fn save_step(&mut self, step: &Step, fresh: bool) -> Result<()> {
        if fresh {
            self.tx.insert_step(step)?;
        } else {
            self.tx.update_step(step)?;
        }
        self.persisted = true;
        Ok(())
    }

    fn settle(
        &mut self,
        mut step: Step,
        def: &BlockDefinition,
        mut vars: VariableStore,
        fresh: bool,
        outcome: Outcome,
        depth: u32,
    ) -> Result<()> {
        let Outcome {
            progress,
            members,
            deadlines,
        } = outcome;
        vars.add_step(&step.name);
        vars.write_to(&mut step);
        step.status = progress.status;
        step.has_error = progress.status == StepStatus::Error;
        step.updated_at = self.now;
        self.save_step(&step, fresh)?;
        self.tx.replace_step_members(step.id, &members)?;
        self.tx.replace_deadlines(&step, &deadlines)?;
        debug!(
            work_number = self.run.frame.work_number,
            block = %step.name,
            status = %step.status,
            "block advanced"
        );

        if let Some(human) = progress.human_status {
            self.tx
                .update_task_human_status(self.task_id(), human, &progress.human_comment)?;
        }
        if let Some(status) = progress.task_status {
            if status == TaskStatus::Canceled {
                self.tx.stop_open_steps(self.task_id())?;
            }
            self.set_task_status(status)?;
            if status.is_terminal() {
                return Ok(());
            }
        }
        if !progress.status.is_traversable() {
            return Ok(());
        }
        if self.run.once_productive {
            debug!(block = %step.name, "single-step run halted");
            self.stopped = true;
            return Ok(());
        }

        let targets: Vec<String> = progress
            .sockets
            .iter()
            .filter_map(|socket| def.next(socket))
            .flatten()
            .cloned()
            .collect();
        if targets.is_empty() && def.kind != BlockKind::End {
            let (status, human) = if progress.status == StepStatus::Error {
                (TaskStatus::Error, HumanStatus::Error)
            } else {
                (TaskStatus::NoSuccess, HumanStatus::NoSuccess)
            };
            debug!(block = %step.name, sockets = ?progress.sockets, "no route out of block");
            self.tx.update_task_human_status(self.task_id(), human, "")?;
            return self.set_task_status(status);
        }
        for target in targets {
            self.enter(&target, depth + 1)?;
        }
        Ok(())
    }

    pub fn set_task_status(&mut self, status: TaskStatus) -> Result<()> {
        self.tx.update_task_status(self.task_id(), status)?;
        if status.is_terminal() {
            self.stopped = true;
        }
        self.run.effects.events.push(SdEvent {
            task_id: self.task_id(),
            work_number: self.run.frame.work_number,
            step_name: String::new(),
            event: "task_status_changed".into(),
            status: status.to_string(),
            human_status: String::new(),
            payload: Value::Null,
            created_at: self.now,
        });
        Ok(())
    }

    /// Move queued messages to the outbox and hand back what is left for
    /// after the commit.
    pub fn flush(mut self) -> Result<Effects> {
        flush_outbox(self.tx, &self.engine.options.topics, &mut self.run.effects)?;
        Ok(self.run.effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pipewright_types::PipelineGraph;
    use std::collections::BTreeMap;

    use crate::services::ManualClock;

    fn engine() -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let services = Services::basic().with_clock(clock.clone());
        (Engine::new(store, services), clock)
    }

    fn publish(engine: &Engine, blocks: Vec<(&str, BlockDefinition)>) -> Uuid {
        let graph = PipelineGraph {
            entrypoint: "start_0".into(),
            blocks: blocks
                .into_iter()
                .map(|(n, d)| (n.to_string(), d))
                .collect::<BTreeMap<_, _>>(),
            inputs: vec![],
            outputs: vec![],
        };
        engine
            .store()
            .transaction(|tx| -> pipewright_store::Result<Uuid> {
                let p = tx.create_pipeline(&format!("p-{}", Uuid::new_v4()), "author")?;
                let v = tx.create_version(p.id, "author", &graph, "")?;
                tx.set_version_status(v.id, VersionStatus::Approved)?;
                Ok(v.id)
            })
            .unwrap()
    }

    fn run_req(version_id: Uuid) -> RunRequest {
        RunRequest {
            version_id,
            author: "init".into(),
            ..RunRequest::default()
        }
    }

    #[tokio::test]
    async fn test_start_to_end_finishes() {
        let (engine, _) = engine();
        let v = publish(
            &engine,
            vec![
                ("start_0", BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["end_0"])),
                ("end_0", BlockDefinition::new(BlockKind::End)),
            ],
        );
        let task = engine.run_task(run_req(v)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
        let steps = engine.store().read(|tx| tx.list_steps(task.id)).unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["start_0", "end_0"]);
        assert!(steps[0].time < steps[1].time);
        assert_eq!(steps[1].steps, vec!["start_0", "end_0"]);
    }

    #[tokio::test]
    async fn test_dead_end_is_no_success() {
        let (engine, _) = engine();
        let v = publish(
            &engine,
            vec![
                ("start_0", BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["placeholder_0"])),
                ("placeholder_0", BlockDefinition::new(BlockKind::Placeholder)),
            ],
        );
        let task = engine.run_task(run_req(v)).await.unwrap();
        assert_eq!(task.status, TaskStatus::NoSuccess);
        assert_eq!(task.human_status, HumanStatus::NoSuccess);
    }

    #[tokio::test]
    async fn test_block_failure_is_recorded_and_committed() {
        let (engine, _) = engine();
        let v = publish(
            &engine,
            vec![
                ("start_0", BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["function_0"])),
                (
                    "function_0",
                    BlockDefinition::new(BlockKind::Function).with_params(json!({
                        "function_id": "f1",
                        "mapping": {"x": {"value": "missing.path", "type": "string", "required": true}}
                    })),
                ),
            ],
        );
        let task = engine.run_task(run_req(v)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        let step = engine
            .store()
            .read(|tx| tx.latest_step_by_name(task.id, "function_0"))
            .unwrap()
            .unwrap();
        assert_eq!(step.status, StepStatus::Error);
        assert!(step.has_error);
        assert!(step.errors[0].contains("required input x"));
    }

    #[tokio::test]
    async fn test_unapproved_version_is_refused() {
        let (engine, _) = engine();
        let v = publish(
            &engine,
            vec![("start_0", BlockDefinition::new(BlockKind::Start))],
        );
        engine
            .store()
            .transaction(|tx| tx.set_version_status(v, VersionStatus::Draft))
            .unwrap();
        let err = engine.run_task(run_req(v)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionNotApproved);

        let mut test_run = run_req(v);
        test_run.is_test = true;
        assert!(engine.run_task(test_run).await.is_ok());
    }

    #[tokio::test]
    async fn test_runaway_chain_fails() {
        let (engine, _) = engine();
        let mut blocks = vec![(
            "start_0".to_string(),
            BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["placeholder_0"]),
        )];
        for i in 0..12 {
            let next = format!("placeholder_{}", i + 1);
            blocks.push((
                format!("placeholder_{i}"),
                BlockDefinition::new(BlockKind::Placeholder).with_socket(DEFAULT_SOCKET, &[next.as_str()]),
            ));
        }
        blocks.push(("placeholder_12".into(), BlockDefinition::new(BlockKind::End)));
        let v = publish(
            &engine,
            blocks.iter().map(|(n, d)| (n.as_str(), d.clone())).collect(),
        );
        let task = engine.run_task(run_req(v)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_internal_actions_refused() {
        let (engine, _) = engine();
        let err = engine
            .update_task(1, None, UpdateDescriptor::system(UpdateAction::SlaBreach), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAction);
    }

    #[tokio::test]
    async fn test_stop_cancels_open_steps() {
        let (engine, _) = engine();
        let v = publish(
            &engine,
            vec![
                ("start_0", BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["approver_0"])),
                (
                    "approver_0",
                    BlockDefinition::new(BlockKind::Approver)
                        .with_params(json!({"approvers": ["u1"]}))
                        .with_socket("approve", &["end_0"]),
                ),
                ("end_0", BlockDefinition::new(BlockKind::End)),
            ],
        );
        let task = engine.run_task(run_req(v)).await.unwrap();
        let stopped = engine.stop_tasks(&[task.work_number], "admin").await.unwrap();
        assert_eq!(stopped, vec![task.work_number]);
        let (task, step) = engine
            .store()
            .read(|tx| -> pipewright_store::Result<_> {
                Ok((tx.get_task(task.id)?, tx.latest_step_by_name(task.id, "approver_0")?))
            })
            .unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(step.unwrap().status, StepStatus::Canceled);
        assert!(engine.stop_tasks(&[task.work_number], "admin").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_created_task_is_started() {
        let (engine, clock) = engine();
        let v = publish(
            &engine,
            vec![
                ("start_0", BlockDefinition::new(BlockKind::Start).with_socket(DEFAULT_SOCKET, &["end_0"])),
                ("end_0", BlockDefinition::new(BlockKind::End)),
            ],
        );
        let stalled = engine
            .store()
            .transaction(|tx| {
                tx.create_task(NewTask {
                    version_id: v,
                    work_title: "stalled".into(),
                    author: "init".into(),
                    initiator: "init".into(),
                    parameters: json!({}),
                    is_test: false,
                    parent_work_number: None,
                })
            })
            .unwrap();

        clock.set(stalled.last_changed_at + Duration::seconds(30));
        let started = engine
            .retry_stalled_tasks(Duration::seconds(60), Duration::days(1), 10)
            .await
            .unwrap();
        assert_eq!(started, 0);

        clock.set(stalled.last_changed_at + Duration::minutes(5));
        let started = engine
            .retry_stalled_tasks(Duration::seconds(60), Duration::days(1), 10)
            .await
            .unwrap();
        assert_eq!(started, 1);
        let task = engine.store().read(|tx| tx.get_task(stalled.id)).unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
    }
}
