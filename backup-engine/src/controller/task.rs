//! Operation kinds, task states and the cooperative control handle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
    Delete,
    Repair,
    List,
    Compact,
    Test,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::Delete => "delete",
            OperationKind::Repair => "repair",
            OperationKind::List => "list",
            OperationKind::Compact => "compact",
            OperationKind::Test => "test",
        }
    }

    /// Operations that mutate or materialize the destination's contents hold
    /// the per-destination lock for their whole run.
    pub fn needs_destination_lock(&self) -> bool {
        !matches!(self, OperationKind::List | OperationKind::Test)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Stopped | TaskState::Failed | TaskState::Aborted
        )
    }

    /// Valid edges of the operation state machine.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Idle, Running) => true,
            (Idle, Aborted) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running | Paused, Completed | Stopped | Failed | Aborted) => true,
            (s, Idle) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Idle => "idle",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Stopped => "stopped",
            TaskState::Failed => "failed",
            TaskState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSignal {
    pub paused: bool,
    pub stop: bool,
}

/// What a worker should do at a volume boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Stop,
}

/// Shared pause/stop/abort signals for one running operation.
///
/// Pause and stop are cooperative and only observed at [`checkpoint`]
/// calls. Abort trips the cancellation token; the supervisor additionally
/// aborts the worker task itself.
///
/// [`checkpoint`]: TaskControl::checkpoint
#[derive(Debug, Clone)]
pub struct TaskControl {
    cancel: CancellationToken,
    signal: Arc<watch::Sender<ControlSignal>>,
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskControl {
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(ControlSignal::default());
        Self {
            cancel: CancellationToken::new(),
            signal: Arc::new(signal),
        }
    }

    pub fn pause(&self) {
        self.signal.send_modify(|s| s.paused = true);
    }

    pub fn resume(&self) {
        self.signal.send_modify(|s| s.paused = false);
    }

    /// Finish the current volume, then end with a partial result.
    pub fn request_stop(&self) {
        self.signal.send_modify(|s| s.stop = true);
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.signal.borrow().paused
    }

    pub fn is_stop_requested(&self) -> bool {
        self.signal.borrow().stop
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fail fast if aborted, without honoring pause or stop.
    pub fn ensure_not_aborted(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Suspension point between volumes.
    ///
    /// Blocks while paused, unless a stop arrives meanwhile.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let mut rx = self.signal.subscribe();
        loop {
            self.ensure_not_aborted()?;
            let signal = *rx.borrow_and_update();
            if signal.stop {
                return Ok(Checkpoint::Stop);
            }
            if !signal.paused {
                return Ok(Checkpoint::Continue);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Aborted),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(Checkpoint::Continue);
                    }
                }
            }
        }
    }
}
