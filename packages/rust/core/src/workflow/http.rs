//! HTTP client for a remote workflow orchestrator.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET  workflows?next_token=…` → [`WorkflowPage`]
//! - `POST workflows/{id}/executions` with `{"input": …}` → [`ExecutionHandle`]
//! - `GET  executions/{id}` → [`ExecutionDescription`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use ledgerflow_shared::{LedgerflowError, Result};

use crate::driver::{
    ExecutionDescription, ExecutionHandle, WorkflowClient, WorkflowHandle, WorkflowPage,
};

/// Per-request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// User-Agent string for orchestrator requests.
const USER_AGENT: &str = concat!("ledgerflow/", env!("CARGO_PKG_VERSION"));

pub struct HttpWorkflowClient {
    client: Client,
    base: Url,
}

impl HttpWorkflowClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let base = Url::parse(endpoint)
            .map_err(|e| LedgerflowError::config(format!("invalid driver endpoint {endpoint}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(LedgerflowError::config(format!(
                "driver endpoint cannot be a base URL: {endpoint}"
            )));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LedgerflowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base })
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| LedgerflowError::config("driver endpoint cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let status = response.status();
    let url = response.url().clone();

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(LedgerflowError::not_found(format!("{what} ({url})")));
    }
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(LedgerflowError::Network(format!("{url}: HTTP {status}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LedgerflowError::validation(format!(
            "{url}: HTTP {status}: {}",
            body.chars().take(200).collect::<String>()
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| LedgerflowError::Network(format!("{url}: invalid response body: {e}")))
}

#[async_trait]
impl WorkflowClient for HttpWorkflowClient {
    async fn list_workflows(&self, next_token: Option<&str>) -> Result<WorkflowPage> {
        let mut url = self.url(&["workflows"])?;
        if let Some(token) = next_token {
            url.query_pairs_mut().append_pair("next_token", token);
        }
        debug!(%url, "listing workflows");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| LedgerflowError::Network(format!("{url}: {e}")))?;
        decode(response, "workflow registry").await
    }

    async fn start_execution(
        &self,
        workflow: &WorkflowHandle,
        input: &Value,
    ) -> Result<ExecutionHandle> {
        let url = self.url(&["workflows", &workflow.id, "executions"])?;
        let response = self
            .client
            .post(url.clone())
            .json(&json!({ "input": input }))
            .send()
            .await
            .map_err(|e| LedgerflowError::Network(format!("{url}: {e}")))?;
        decode(response, &format!("workflow {}", workflow.id)).await
    }

    async fn describe_execution(
        &self,
        execution: &ExecutionHandle,
    ) -> Result<ExecutionDescription> {
        let url = self.url(&["executions", &execution.execution_id])?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| LedgerflowError::Network(format!("{url}: {e}")))?;
        decode(response, &format!("execution {}", execution.execution_id)).await
    }
}
