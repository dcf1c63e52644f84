//! The job-execution contract.
//!
//! Executing a job — subprocesses, log shipping, alerting — is external to
//! the runtime protocol. The runtime hands an executor the job context and a
//! cancellation token (pulled on abort signals and lost leases) and records
//! whatever comes back in the job's history.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use pinball_core::JobName;

/// What the runtime knows about the execution it is about to start.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The runnable job token's parsed name.
    pub name: JobName,

    /// The job's command, verbatim from its payload.
    pub command: String,

    /// 1-based attempt number.
    pub attempt: u32,

    /// Names of the event tokens this execution consumes.
    pub events: Vec<String>,
}

/// How an execution ended, from the executor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failure,
}

/// Executor verdict plus free-form detail for the job history.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub info: String,
}

impl ExecutionReport {
    pub fn success(info: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            info: info.into(),
        }
    }

    pub fn failure(info: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            info: info.into(),
        }
    }
}

/// Executes jobs on behalf of the worker loop.
///
/// Implementations must honor `cancel` promptly; the runtime pulls it when
/// the instance is aborted or the worker's lease is lost, and discards the
/// report in the latter case.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, context: &JobContext, cancel: CancellationToken) -> ExecutionReport;
}

/// Default glue: run the job command through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

#[async_trait]
impl JobExecutor for ShellExecutor {
    async fn execute(&self, context: &JobContext, cancel: CancellationToken) -> ExecutionReport {
        debug!(job = %context.name.job, command = %context.command, "executing");

        let mut child = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&context.command)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ExecutionReport::failure(format!("failed to spawn: {e}")),
        };

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => ExecutionReport::success(status.to_string()),
                Ok(status) => ExecutionReport::failure(status.to_string()),
                Err(e) => ExecutionReport::failure(format!("wait failed: {e}")),
            },
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                ExecutionReport::failure("cancelled".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinball_core::JobState;

    fn context(command: &str) -> JobContext {
        JobContext {
            name: JobName::new("w", "i", JobState::Runnable, "j"),
            command: command.to_string(),
            attempt: 1,
            events: vec![],
        }
    }

    #[tokio::test]
    async fn test_shell_executor_reports_exit_status() {
        let executor = ShellExecutor;
        let report = executor
            .execute(&context("true"), CancellationToken::new())
            .await;
        assert_eq!(report.status, ExecutionStatus::Success);

        let report = executor
            .execute(&context("exit 3"), CancellationToken::new())
            .await;
        assert_eq!(report.status, ExecutionStatus::Failure);
    }

    #[tokio::test]
    async fn test_shell_executor_honors_cancellation() {
        let executor = ShellExecutor;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = executor.execute(&context("sleep 30"), cancel).await;
        assert_eq!(report.status, ExecutionStatus::Failure);
        assert_eq!(report.info, "cancelled");
    }
}
