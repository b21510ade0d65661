//! Bookkeeping for queued and running operations.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::AbortHandle;
use tracing::debug;

use super::task::{OperationKind, TaskControl, TaskState};

struct TrackedTask {
    kind: OperationKind,
    control: TaskControl,
    state: watch::Sender<TaskState>,
    worker: Option<AbortHandle>,
}

/// Tracks every task the controller accepted until it finishes.
#[derive(Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<RwLock<HashMap<String, TrackedTask>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queued task and return the receiver for its state.
    pub async fn register(&self, task_id: &str, kind: OperationKind, control: TaskControl) -> watch::Receiver<TaskState> {
        let (state, rx) = watch::channel(TaskState::Idle);
        let mut tasks = self.tasks.write().await;
        tasks.insert(
            task_id.to_string(),
            TrackedTask {
                kind,
                control,
                state,
                worker: None,
            },
        );
        rx
    }

    /// Attach the worker's abort handle once it is spawned.
    pub async fn attach_worker(&self, task_id: &str, handle: AbortHandle) {
        if let Some(task) = self.tasks.write().await.get_mut(task_id) {
            task.worker = Some(handle);
        }
    }

    /// Move a task to `next` if the state machine allows it.
    pub async fn transition(&self, task_id: &str, next: TaskState) -> bool {
        let tasks = self.tasks.read().await;
        let Some(task) = tasks.get(task_id) else {
            return false;
        };
        let current = *task.state.borrow();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            debug!("Ignoring transition {} -> {} for task {}", current, next, task_id);
            return false;
        }
        task.state.send_replace(next);
        true
    }

    pub async fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.read().await.get(task_id).map(|t| *t.state.borrow())
    }

    pub async fn kind(&self, task_id: &str) -> Option<OperationKind> {
        self.tasks.read().await.get(task_id).map(|t| t.kind)
    }

    pub async fn pause(&self, task_id: &str) -> bool {
        let Some(control) = self.control(task_id).await else {
            return false;
        };
        control.pause();
        // A queued task stays Idle and starts paused
        self.transition(task_id, TaskState::Paused).await || self.state(task_id).await == Some(TaskState::Idle)
    }

    pub async fn resume(&self, task_id: &str) -> bool {
        let Some(control) = self.control(task_id).await else {
            return false;
        };
        control.resume();
        self.transition(task_id, TaskState::Running).await || self.state(task_id).await == Some(TaskState::Idle)
    }

    pub async fn stop(&self, task_id: &str) -> bool {
        match self.control(task_id).await {
            Some(control) => {
                control.request_stop();
                true
            }
            None => false,
        }
    }

    /// Trip the cancellation token and hard-cancel the worker task.
    pub async fn abort(&self, task_id: &str) -> bool {
        let tasks = self.tasks.read().await;
        match tasks.get(task_id) {
            Some(task) => {
                task.control.abort();
                if let Some(worker) = &task.worker {
                    worker.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Forget a finished task.
    ///
    /// The terminal -> Idle edge belongs to the controller, which is idle
    /// again once the queue permit is released. A task's own watch keeps
    /// its terminal state so late observers of a ticket still see the outcome.
    pub async fn complete(&self, task_id: &str) {
        let Some(task) = self.tasks.write().await.remove(task_id) else {
            return;
        };
        let last = *task.state.borrow();
        if last.can_transition_to(TaskState::Idle) {
            debug!("Task {} finished as {}", task_id, last);
        } else {
            debug!("Task {} dropped in non-terminal state {}", task_id, last);
        }
    }

    /// Tasks accepted but not yet finished, queued ones included.
    pub async fn active_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    async fn control(&self, task_id: &str) -> Option<TaskControl> {
        self.tasks.read().await.get(task_id).map(|t| t.control.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_follow_state_machine() {
        let tracker = TaskTracker::new();
        let control = TaskControl::new();
        let rx = tracker.register("a", OperationKind::Backup, control.clone()).await;

        assert!(!tracker.transition("a", TaskState::Completed).await);
        assert!(tracker.transition("a", TaskState::Running).await);
        assert!(tracker.pause("a").await);
        assert!(control.is_paused());
        assert_eq!(*rx.borrow(), TaskState::Paused);
        assert!(tracker.resume("a").await);
        assert_eq!(*rx.borrow(), TaskState::Running);
        assert!(tracker.transition("a", TaskState::Completed).await);
        assert!(!tracker.transition("a", TaskState::Running).await);
    }

    #[tokio::test]
    async fn test_complete_keeps_terminal_state_for_observers() {
        let tracker = TaskTracker::new();
        let rx = tracker.register("a", OperationKind::Backup, TaskControl::new()).await;
        assert!(tracker.transition("a", TaskState::Running).await);
        assert!(tracker.transition("a", TaskState::Stopped).await);

        tracker.complete("a").await;
        assert_eq!(*rx.borrow(), TaskState::Stopped);
        assert!(rx.borrow().can_transition_to(TaskState::Idle));
        assert_eq!(tracker.state("a").await, None);
        assert_eq!(tracker.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_abort_cancels_worker() {
        let tracker = TaskTracker::new();
        let control = TaskControl::new();
        tracker.register("a", OperationKind::Restore, control.clone()).await;

        let worker = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        tracker.attach_worker("a", worker.abort_handle()).await;

        assert!(tracker.abort("a").await);
        assert!(control.is_aborted());
        assert!(worker.await.unwrap_err().is_cancelled());

        tracker.complete("a").await;
        assert_eq!(tracker.active_count().await, 0);
        assert!(!tracker.abort("a").await);
    }
}
