//! Execution driver: locate a workflow, start one execution and poll it to a
//! terminal state.
//!
//! ```text
//! DISCOVER ──► RUNNING ──► SUCCEEDED | FAILED | TIMED_OUT | ABORTED
//! ```
//!
//! The wait blocks the caller for one execution. Cancelling the token, or
//! running out of poll attempts, stops the local wait only: the remote
//! execution keeps running and its id is logged so it can be stopped by hand.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use ledgerflow_shared::{LedgerflowError, PollPolicy, Result};

// ---------------------------------------------------------------------------
// Remote execution protocol
// ---------------------------------------------------------------------------

/// Status reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub name: String,
    pub id: String,
}

/// One page of the workflow registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowPage {
    #[serde(default)]
    pub workflows: Vec<WorkflowHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// A started execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: String,
}

/// Result of `describe_execution`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDescription {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ExecutionDescription {
    pub fn running() -> Self {
        Self {
            status: ExecutionStatus::Running,
            output: None,
            error: None,
            cause: None,
        }
    }
}

/// Remote workflow orchestrator.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// One page of registered workflows. `None` requests the first page.
    async fn list_workflows(&self, next_token: Option<&str>) -> Result<WorkflowPage>;

    async fn start_execution(
        &self,
        workflow: &WorkflowHandle,
        input: &Value,
    ) -> Result<ExecutionHandle>;

    async fn describe_execution(&self, execution: &ExecutionHandle)
    -> Result<ExecutionDescription>;
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// A successful execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub execution: ExecutionHandle,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Number of `describe_execution` calls made.
    pub polls: u32,
    /// Number of poll intervals slept.
    pub intervals_waited: u32,
}

/// Drives one workflow execution at a time to a terminal state.
#[derive(Clone)]
pub struct ExecutionDriver {
    client: Arc<dyn WorkflowClient>,
    policy: PollPolicy,
}

impl ExecutionDriver {
    pub fn new(client: Arc<dyn WorkflowClient>, policy: PollPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Find the workflow registered under `name`, walking every registry page.
    #[instrument(skip(self))]
    pub async fn discover(&self, name: &str) -> Result<WorkflowHandle> {
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.client.list_workflows(token.as_deref()).await?;
            pages += 1;
            if let Some(found) = page.workflows.into_iter().find(|w| w.name == name) {
                info!(id = %found.id, pages, "workflow found");
                return Ok(found);
            }

            match page.next_token {
                Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
                Some(_) => {
                    warn!("registry returned the same page token twice, stopping");
                    break;
                }
                None => break,
            }
        }

        Err(LedgerflowError::not_found(format!(
            "workflow '{name}' ({pages} registry pages searched)"
        )))
    }

    /// Start an execution and wait for it.
    pub async fn run(
        &self,
        workflow: &WorkflowHandle,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let execution = self.client.start_execution(workflow, input).await?;
        info!(execution = %execution.execution_id, workflow = %workflow.name, "execution started");
        self.wait(&execution, cancel).await
    }

    /// Discover `name`, then start and wait for one execution.
    pub async fn run_named(
        &self,
        name: &str,
        input: &Value,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let workflow = self.discover(name).await?;
        self.run(&workflow, input, cancel).await
    }

    /// Poll until the execution is terminal, the budget runs out or `cancel` fires.
    ///
    /// The first poll happens immediately; later polls are spaced by the
    /// policy's delay.
    #[instrument(skip_all, fields(execution = %execution.execution_id))]
    pub async fn wait(
        &self,
        execution: &ExecutionHandle,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut intervals_waited = 0;

        for attempt in 1..=max_attempts {
            let description = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(stopped_waiting(execution, "cancelled")),
                d = self.client.describe_execution(execution) => d?,
            };
            debug!(attempt, status = %description.status, "polled execution");

            match description.status {
                ExecutionStatus::Running => {
                    if attempt == max_attempts {
                        break;
                    }
                    let delay = self.policy.delay_for(attempt);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(stopped_waiting(execution, "cancelled")),
                        _ = tokio::time::sleep(delay) => intervals_waited += 1,
                    }
                }
                ExecutionStatus::Succeeded => {
                    info!(polls = attempt, "execution succeeded");
                    return Ok(ExecutionOutcome {
                        execution: execution.clone(),
                        status: ExecutionStatus::Succeeded,
                        output: description.output,
                        polls: attempt,
                        intervals_waited,
                    });
                }
                status => {
                    warn!(%status, error = ?description.error, "execution did not succeed");
                    return Err(LedgerflowError::ExecutionFailure {
                        execution: execution.execution_id.clone(),
                        status: status.as_str().to_string(),
                        error: description.error.or(description.cause),
                    });
                }
            }
        }

        Err(stopped_waiting(
            execution,
            &format!("still running after {max_attempts} polls"),
        ))
    }
}

fn stopped_waiting(execution: &ExecutionHandle, why: &str) -> LedgerflowError {
    warn!(
        execution = %execution.execution_id,
        "stopped waiting ({why}); the remote execution is left running"
    );
    LedgerflowError::Cancelled(format!(
        "execution {} {why}; remote execution left running",
        execution.execution_id
    ))
}
