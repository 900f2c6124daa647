//! In-process workflow engine.
//!
//! Implements the remote execution protocol by running the stage chain in a
//! background task, so the driver and the feed loop work without an external
//! orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

use ledgerflow_shared::{LedgerflowError, Result, RunId};

use crate::context::PipelineContext;
use crate::driver::{
    ExecutionDescription, ExecutionHandle, ExecutionStatus, WorkflowClient, WorkflowHandle,
    WorkflowPage,
};
use crate::processor::RunOptions;
use crate::progress::SilentProgress;
use crate::stages::run_pipeline;

/// Workflows listed per registry page.
const PAGE_SIZE: usize = 20;

type ExecutionTable = Arc<Mutex<HashMap<String, ExecutionDescription>>>;

/// Local engine running the stage chain for every registered workflow name.
pub struct LocalWorkflowClient {
    ctx: PipelineContext,
    workflows: Vec<WorkflowHandle>,
    executions: ExecutionTable,
}

impl LocalWorkflowClient {
    /// Register `name` as a workflow backed by the local stage chain.
    pub fn new(ctx: PipelineContext, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            ctx,
            workflows: vec![WorkflowHandle {
                id: format!("local:{name}"),
                name,
            }],
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn set(executions: &ExecutionTable, id: &str, description: ExecutionDescription) -> Result<()> {
        executions
            .lock()
            .map_err(|_| LedgerflowError::Storage("execution table lock poisoned".into()))?
            .insert(id.to_string(), description);
        Ok(())
    }
}

#[async_trait]
impl WorkflowClient for LocalWorkflowClient {
    async fn list_workflows(&self, next_token: Option<&str>) -> Result<WorkflowPage> {
        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| LedgerflowError::validation(format!("invalid page token {token}")))?,
            None => 0,
        };
        let end = (start + PAGE_SIZE).min(self.workflows.len());
        Ok(WorkflowPage {
            workflows: self.workflows.get(start..end).unwrap_or_default().to_vec(),
            next_token: (end < self.workflows.len()).then(|| end.to_string()),
        })
    }

    async fn start_execution(
        &self,
        workflow: &WorkflowHandle,
        input: &Value,
    ) -> Result<ExecutionHandle> {
        if !self.workflows.iter().any(|w| w.id == workflow.id) {
            return Err(LedgerflowError::not_found(format!("workflow {}", workflow.id)));
        }

        let mut ctx = self.ctx.clone();
        if let Some(bucket) = input.get("data_bucket_name").and_then(Value::as_str) {
            ctx.bucket = bucket.to_string();
        }

        let id = RunId::new().to_string();
        Self::set(&self.executions, &id, ExecutionDescription::running())?;

        let executions = Arc::clone(&self.executions);
        let exec_id = id.clone();
        tokio::spawn(async move {
            let progress = SilentProgress;
            let description = match run_pipeline(&ctx, RunOptions::default(), &progress).await {
                Ok(report) => {
                    info!(execution = %exec_id, clean = report.is_clean(), "local execution finished");
                    ExecutionDescription {
                        status: ExecutionStatus::Succeeded,
                        output: serde_json::to_value(&report).ok(),
                        error: None,
                        cause: None,
                    }
                }
                Err(e) => {
                    error!(execution = %exec_id, error = %e, "local execution failed");
                    let payload = e.to_payload();
                    ExecutionDescription {
                        status: ExecutionStatus::Failed,
                        output: serde_json::to_value(&payload).ok(),
                        error: serde_json::to_value(payload.kind)
                            .ok()
                            .and_then(|v| v.as_str().map(String::from)),
                        cause: Some(payload.message),
                    }
                }
            };
            if let Err(e) = Self::set(&executions, &exec_id, description) {
                error!(execution = %exec_id, error = %e, "could not record execution result");
            }
        });

        Ok(ExecutionHandle { execution_id: id })
    }

    async fn describe_execution(
        &self,
        execution: &ExecutionHandle,
    ) -> Result<ExecutionDescription> {
        self.executions
            .lock()
            .map_err(|_| LedgerflowError::Storage("execution table lock poisoned".into()))?
            .get(&execution.execution_id)
            .cloned()
            .ok_or_else(|| LedgerflowError::not_found(format!("execution {}", execution.execution_id)))
    }
}
