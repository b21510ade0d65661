//! Operation controller.
//!
//! Accepts operations, runs them one at a time in FIFO order and drives each
//! through the [`TaskState`] machine. Every task gets a supervisor that owns
//! the state channel, holds the per-destination lock and runs post-operation
//! hooks; the operation itself runs in a separate worker task so abort can
//! cancel it at any await point.

pub mod hooks;
pub mod operations;
pub mod options;
pub mod task;
pub mod tracker;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::destination::{Destination, DestinationLocks};
use crate::events::{EventBody, EventBus};
use crate::executor::{
    BackupExecutor, BackupResult, EngineContext, RestoreEngine, RestoreRequest, RestoreResult, RestoreSelection,
    RetentionEngine, RetentionReport,
};
use crate::registry::{ModuleRegistry, HOOK_MODULE};
use crate::report::WarningLog;
use crate::utils::errors::{EngineError, Result};
use hooks::{CommandHook, HookContext, OperationHook};
use operations::{CompactReport, ListReport, RepairReport, RetentionRule, TestReport};
use options::{EngineOptions, OptionValidator, RawOptions};
use task::{OperationKind, TaskControl, TaskState};
use tracker::TaskTracker;

/// Default number of backup points checked by [`Operation::Test`]
pub const DEFAULT_TEST_SAMPLES: usize = 1;

#[derive(Debug, Clone)]
pub enum Operation {
    Backup { sources: Vec<PathBuf> },
    Restore { selection: RestoreSelection, target: PathBuf },
    Delete(RetentionRule),
    List,
    Repair,
    Compact,
    Test { samples: usize },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Backup { .. } => OperationKind::Backup,
            Operation::Restore { .. } => OperationKind::Restore,
            Operation::Delete(_) => OperationKind::Delete,
            Operation::List => OperationKind::List,
            Operation::Repair => OperationKind::Repair,
            Operation::Compact => OperationKind::Compact,
            Operation::Test { .. } => OperationKind::Test,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum OperationOutput {
    Backup(BackupResult),
    Restore(RestoreResult),
    Delete(RetentionReport),
    List(ListReport),
    Repair(RepairReport),
    Compact(CompactReport),
    Test(TestReport),
}

impl OperationOutput {
    pub fn warnings(&self) -> &WarningLog {
        match self {
            OperationOutput::Backup(r) => &r.warnings,
            OperationOutput::Restore(r) => &r.warnings,
            OperationOutput::Delete(r) => &r.warnings,
            OperationOutput::List(r) => &r.warnings,
            OperationOutput::Repair(r) => &r.warnings,
            OperationOutput::Compact(r) => &r.warnings,
            OperationOutput::Test(r) => &r.warnings,
        }
    }

    fn warnings_mut(&mut self) -> &mut WarningLog {
        match self {
            OperationOutput::Backup(r) => &mut r.warnings,
            OperationOutput::Restore(r) => &mut r.warnings,
            OperationOutput::Delete(r) => &mut r.warnings,
            OperationOutput::List(r) => &mut r.warnings,
            OperationOutput::Repair(r) => &mut r.warnings,
            OperationOutput::Compact(r) => &mut r.warnings,
            OperationOutput::Test(r) => &mut r.warnings,
        }
    }

    /// Whether the result covers less than was asked for.
    fn is_partial(&self) -> bool {
        match self {
            OperationOutput::Backup(r) => !r.complete,
            OperationOutput::Restore(r) => !r.complete,
            OperationOutput::Compact(r) => r.backup.as_ref().map_or(true, |b| !b.complete),
            _ => false,
        }
    }
}

/// Handle to a submitted operation.
pub struct TaskTicket {
    pub id: String,
    pub kind: OperationKind,
    state: watch::Receiver<TaskState>,
    outcome: oneshot::Receiver<Result<OperationOutput>>,
}

impl TaskTicket {
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Wait until the task reaches `state` or a terminal state.
    pub async fn wait_for_state(&mut self, state: TaskState) -> TaskState {
        let reached = self
            .state
            .wait_for(|s| *s == state || s.is_terminal())
            .await
            .map(|s| *s);
        reached.unwrap_or(TaskState::Failed)
    }

    /// Wait for the operation to finish and take its result.
    pub async fn wait(self) -> Result<OperationOutput> {
        self.outcome
            .await
            .map_err(|_| EngineError::Task("task supervisor ended without a result".into()))?
    }
}

/// Serializes operations against one destination.
#[derive(Clone)]
pub struct OperationController {
    destination: Arc<dyn Destination>,
    registry: Arc<ModuleRegistry>,
    raw_options: RawOptions,
    hooks: Vec<Arc<dyn OperationHook>>,
    events: EventBus,
    queue: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl OperationController {
    pub fn new(destination: Arc<dyn Destination>, registry: Arc<ModuleRegistry>, raw_options: RawOptions) -> Self {
        Self {
            destination,
            registry,
            raw_options,
            hooks: Vec::new(),
            events: EventBus::new(),
            queue: Arc::new(Semaphore::new(1)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn OperationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// True when no task is running.
    pub fn is_idle(&self) -> bool {
        self.queue.available_permits() == 1
    }

    /// Queue an operation. It starts once every earlier task has finished.
    pub async fn submit(&self, operation: Operation) -> TaskTicket {
        let id = Uuid::new_v4().to_string();
        let kind = operation.kind();
        let control = TaskControl::new();
        let state = self.tracker.register(&id, kind, control.clone()).await;
        let (outcome_tx, outcome) = oneshot::channel();

        let supervisor = Supervisor {
            controller: self.clone(),
            id: id.clone(),
            kind,
            control,
            events: self.events.for_task(&id),
        };
        tokio::spawn(async move {
            let result = supervisor.run(operation).await;
            // The caller may have dropped the ticket
            let _ = outcome_tx.send(result);
        });

        info!("Queued {} task {}", kind, id);
        TaskTicket {
            id,
            kind,
            state,
            outcome,
        }
    }

    /// Submit and wait for the result.
    pub async fn run(&self, operation: Operation) -> Result<OperationOutput> {
        self.submit(operation).await.wait().await
    }

    pub async fn pause(&self, task_id: &str) -> bool {
        self.tracker.pause(task_id).await
    }

    pub async fn resume(&self, task_id: &str) -> bool {
        self.tracker.resume(task_id).await
    }

    pub async fn stop(&self, task_id: &str) -> bool {
        self.tracker.stop(task_id).await
    }

    pub async fn abort(&self, task_id: &str) -> bool {
        self.tracker.abort(task_id).await
    }
}

struct Supervisor {
    controller: OperationController,
    id: String,
    kind: OperationKind,
    control: TaskControl,
    events: EventBus,
}

impl Supervisor {
    async fn set_state(&self, state: TaskState) {
        if self.controller.tracker.transition(&self.id, state).await {
            self.events.emit(EventBody::StateChanged { state });
        }
    }

    async fn run(self, operation: Operation) -> Result<OperationOutput> {
        let token = self.control.cancellation_token();
        let permit = tokio::select! {
            permit = self.controller.queue.clone().acquire_owned() => permit
                .map_err(|e| EngineError::Task(format!("operation queue closed: {e}"))),
            _ = token.cancelled() => Err(EngineError::Aborted),
        };
        let _permit = match permit {
            Ok(p) => p,
            Err(e) => {
                self.set_state(TaskState::Aborted).await;
                self.finish(&Err(EngineError::Aborted)).await;
                return Err(e);
            }
        };

        self.set_state(TaskState::Running).await;
        if self.control.is_paused() {
            self.set_state(TaskState::Paused).await;
        }
        self.events.emit(EventBody::Started { kind: self.kind });

        let (options, option_warnings) =
            OptionValidator::new(&self.controller.registry).validate(&self.controller.raw_options);
        let hooks = self.hooks_for(&options);
        let temp_dir = options.temp_dir.clone();
        let result = self.execute(operation, options, option_warnings).await;

        let final_state = match &result {
            Ok(output) if output.is_partial() || self.control.is_stop_requested() => TaskState::Stopped,
            Ok(_) => TaskState::Completed,
            Err(EngineError::Aborted) => TaskState::Aborted,
            Err(_) => TaskState::Failed,
        };
        match &result {
            Ok(_) => info!("{} task {} finished: {}", self.kind, self.id, final_state),
            Err(e) => error!("{} task {} {}: {}", self.kind, self.id, final_state, e),
        }

        if let Ok(output) = &result {
            for warning in output.warnings().iter() {
                self.events.warning(warning);
            }
        }

        self.run_hooks(&hooks, final_state, &result, temp_dir).await;
        self.set_state(final_state).await;
        self.finish(&result).await;
        result
    }

    async fn finish(&self, result: &Result<OperationOutput>) {
        match result {
            Ok(_) => {
                let state = self.controller.tracker.state(&self.id).await.unwrap_or(TaskState::Completed);
                self.events.emit(EventBody::Completed { kind: self.kind, state });
            }
            Err(e) => self.events.emit(EventBody::Failed {
                kind: self.kind,
                error: e.to_string(),
            }),
        }
        self.controller.tracker.complete(&self.id).await;
    }

    /// Validate options, take the destination lock and run the worker.
    async fn execute(
        &self,
        operation: Operation,
        options: EngineOptions,
        option_warnings: WarningLog,
    ) -> Result<OperationOutput> {
        let controller = &self.controller;
        let ctx = EngineContext::new(controller.destination.clone(), controller.registry.clone(), options)?
            .with_events(self.events.clone())
            .with_control(self.control.clone());

        let _lock = if self.kind.needs_destination_lock() {
            let destination_id = controller.destination.id();
            Some(DestinationLocks::global().acquire(&destination_id).await)
        } else {
            None
        };

        let token = self.control.cancellation_token();
        let mut worker = tokio::spawn(dispatch(ctx, operation));
        controller.tracker.attach_worker(&self.id, worker.abort_handle()).await;

        let joined = tokio::select! {
            joined = &mut worker => joined,
            _ = token.cancelled() => {
                worker.abort();
                worker.await
            }
        };

        let mut output = joined??;
        let mut warnings = option_warnings;
        warnings.extend(std::mem::take(output.warnings_mut()));
        *output.warnings_mut() = warnings;
        Ok(output)
    }

    /// Registered hooks plus the `run-script-after` command, unless its module is disabled.
    fn hooks_for(&self, options: &EngineOptions) -> Vec<Arc<dyn OperationHook>> {
        let mut hooks = self.controller.hooks.clone();
        if !options.disabled_modules.contains(HOOK_MODULE) {
            if let Some(hook) = CommandHook::from_options(options) {
                hooks.push(Arc::new(hook));
            }
        }
        hooks
    }

    async fn run_hooks(
        &self,
        hooks: &[Arc<dyn OperationHook>],
        state: TaskState,
        result: &Result<OperationOutput>,
        temp_dir: Option<PathBuf>,
    ) {
        if hooks.is_empty() {
            return;
        }

        let context = HookContext {
            task_id: self.id.clone(),
            operation: self.kind,
            state,
            destination: self.controller.destination.id(),
            error: result.as_ref().err().map(|e| e.to_string()),
            warnings: result.as_ref().map(|o| o.warnings().len()).unwrap_or(0),
            temp_dir,
        };
        for hook in hooks {
            if let Err(e) = hook.after_operation(&context).await {
                warn!("Hook {} failed: {}", hook.name(), e);
            }
        }
    }
}

/// Run one operation on a prepared context.
async fn dispatch(ctx: EngineContext, operation: Operation) -> Result<OperationOutput> {
    let options = ctx.options.clone();
    match operation {
        Operation::Backup { sources } => Ok(OperationOutput::Backup(
            BackupExecutor::new(ctx).execute(&sources).await?,
        )),
        Operation::Restore { selection, target } => {
            let request = RestoreRequest {
                selection,
                target,
                overwrite: options.overwrite,
                filter: ctx.filter()?,
            };
            Ok(OperationOutput::Restore(RestoreEngine::new(&ctx).run(&request).await?))
        }
        Operation::Delete(rule) => {
            let policy = rule.resolve(chrono::Utc::now())?;
            Ok(OperationOutput::Delete(
                RetentionEngine::new(&ctx).run(policy, options.force).await?,
            ))
        }
        Operation::List => Ok(OperationOutput::List(operations::list(&ctx).await?)),
        Operation::Repair => Ok(OperationOutput::Repair(operations::repair(&ctx, options.force).await?)),
        Operation::Compact => Ok(OperationOutput::Compact(operations::compact(&ctx).await?)),
        Operation::Test { samples } => Ok(OperationOutput::Test(
            operations::verify_samples(&ctx, samples).await?,
        )),
    }
}
