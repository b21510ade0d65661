//! Post-operation hooks.
//!
//! Hooks run after every operation, whatever its outcome. A failing hook is
//! logged and never changes the operation result.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::options::EngineOptions;
use super::task::{OperationKind, TaskState};
use crate::utils::errors::{EngineError, Result};

/// What a hook learns about the finished operation.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub task_id: String,
    pub operation: OperationKind,
    pub state: TaskState,
    pub destination: String,
    pub error: Option<String>,
    pub warnings: usize,
    /// Configured `temp-dir`, exported as `BACKUP_ENGINE_TEMP_DIR`
    pub temp_dir: Option<PathBuf>,
}

#[async_trait]
pub trait OperationHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after_operation(&self, ctx: &HookContext) -> Result<()>;
}

/// Runs a shell command with the outcome in `BACKUP_ENGINE_*` variables.
#[derive(Debug, Clone)]
pub struct CommandHook {
    command: String,
    timeout: Duration,
}

impl CommandHook {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    /// Hook configured by `run-script-after`, if any.
    pub fn from_options(options: &EngineOptions) -> Option<Self> {
        options
            .run_script_after
            .as_ref()
            .filter(|c| !c.trim().is_empty())
            .map(|c| Self::new(c.clone(), options.run_script_timeout))
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl OperationHook for CommandHook {
    fn name(&self) -> &str {
        "command-hook"
    }

    async fn after_operation(&self, ctx: &HookContext) -> Result<()> {
        tracing::info!("Running hook: {}", self.command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .env("BACKUP_ENGINE_TASK_ID", &ctx.task_id)
            .env("BACKUP_ENGINE_OPERATION", ctx.operation.as_str())
            .env("BACKUP_ENGINE_STATE", ctx.state.to_string())
            .env("BACKUP_ENGINE_DESTINATION", &ctx.destination)
            .env("BACKUP_ENGINE_WARNINGS", ctx.warnings.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(error) = &ctx.error {
            cmd.env("BACKUP_ENGINE_ERROR", error);
        }
        if let Some(temp_dir) = &ctx.temp_dir {
            cmd.env("BACKUP_ENGINE_TEMP_DIR", temp_dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| EngineError::Hook(format!("failed to execute '{}': {e}", self.command)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(EngineError::Hook(format!(
                    "hook '{}' timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(EngineError::Hook(format!(
                "hook '{}' exited with {code}: {}",
                self.command,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> HookContext {
        HookContext {
            task_id: "t-1".into(),
            operation: OperationKind::Backup,
            state: TaskState::Failed,
            destination: "memory://x".into(),
            error: Some("boom".into()),
            warnings: 2,
            temp_dir: None,
        }
    }

    #[tokio::test]
    async fn test_hook_sees_outcome_variables() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let hook = CommandHook::new(
            format!(
                "echo \"$BACKUP_ENGINE_OPERATION $BACKUP_ENGINE_STATE $BACKUP_ENGINE_ERROR\" > '{}'",
                out.display()
            ),
            Duration::from_secs(10),
        );
        hook.after_operation(&context()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "backup failed boom");
    }

    #[tokio::test]
    async fn test_hook_sees_temp_dir() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let hook = CommandHook::new(
            format!("echo \"${{BACKUP_ENGINE_TEMP_DIR:-unset}}\" > '{}'", out.display()),
            Duration::from_secs(10),
        );

        hook.after_operation(&context()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "unset");

        let ctx = HookContext {
            temp_dir: Some(dir.path().to_path_buf()),
            ..context()
        };
        hook.after_operation(&ctx).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap().trim(),
            dir.path().display().to_string()
        );
    }

    #[tokio::test]
    async fn test_failing_hook_reports_exit_code() {
        let hook = CommandHook::new("echo nope >&2; exit 3", Duration::from_secs(10));
        let err = hook.after_operation(&context()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited with 3"));
        assert!(message.contains("nope"));
    }

    #[tokio::test]
    async fn test_hook_timeout() {
        let hook = CommandHook::new("sleep 5", Duration::from_millis(100));
        let err = hook.after_operation(&context()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_from_options() {
        let mut options = EngineOptions::default();
        assert!(CommandHook::from_options(&options).is_none());
        options.run_script_after = Some("true".into());
        assert_eq!(CommandHook::from_options(&options).unwrap().command(), "true");
    }
}
