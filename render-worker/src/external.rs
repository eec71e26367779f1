//! Client for the external worker service.
//!
//! The GPU pool and its local-CPU twin speak the same protocol: submit a
//! payload and get an id back, poll that id for status, cancel it, check
//! service health. Everything else about the wire format stays behind this
//! module.

use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use render_common::job::{JobOperation, WorkerRoute};

use crate::config::DispatchConfig;

/// Enumeration of errors for calls to the external worker service.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("external job {0} is not known to the worker service")]
    NotFound(String),
    #[error("request to the worker service failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("worker service answered {status}: {body}")]
    BadStatus { status: u16, body: String },
}

impl DispatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatchError::NotFound(_))
    }
}

/// Status of one external sub-job as the worker service reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalStatus {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExternalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExternalStatus::Completed
                | ExternalStatus::Failed
                | ExternalStatus::Cancelled
                | ExternalStatus::TimedOut
        )
    }

    /// Cancelled or timed out on the worker side, without this orchestrator
    /// asking for it.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, ExternalStatus::Cancelled | ExternalStatus::TimedOut)
    }
}

/// One poll result for an external sub-job.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalJobState {
    pub id: String,
    pub status: ExternalStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "delayTime")]
    pub delay_time: Option<u64>,
    #[serde(default, rename = "executionTime")]
    pub execution_time: Option<u64>,
}

/// The four operations the orchestrator consumes from the worker service.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Hand one sub-request off for execution; returns the external id.
    async fn submit(
        &self,
        operation: JobOperation,
        payload: &Value,
    ) -> Result<String, DispatchError>;

    async fn status(&self, external_id: &str) -> Result<ExternalJobState, DispatchError>;

    async fn cancel(&self, external_id: &str) -> Result<(), DispatchError>;

    async fn health(&self) -> Result<(), DispatchError>;
}

/// HTTP adapter for the worker service's queue endpoints.
pub struct HttpWorkerClient {
    client: reqwest::Client,
    base_url: String,
    submit_timeout: time::Duration,
    status_timeout: time::Duration,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

impl HttpWorkerClient {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        submit_timeout: time::Duration,
        status_timeout: time::Duration,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = api_key {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", key))
                .expect("worker api key is not a valid header value");
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("render-orchestrator dispatch")
            .build()
            .expect("failed to construct reqwest client for worker dispatch");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            submit_timeout,
            status_timeout,
        }
    }

    async fn read_failure(response: reqwest::Response) -> DispatchError {
        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(1000);
        DispatchError::BadStatus { status, body }
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn submit(
        &self,
        operation: JobOperation,
        payload: &Value,
    ) -> Result<String, DispatchError> {
        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .timeout(self.submit_timeout)
            .json(&json!({ "operation": operation, "input": payload }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }
        let submitted: SubmitResponse = response.json().await?;
        Ok(submitted.id)
    }

    async fn status(&self, external_id: &str) -> Result<ExternalJobState, DispatchError> {
        let response = self
            .client
            .get(format!("{}/status/{}", self.base_url, external_id))
            .timeout(self.status_timeout)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DispatchError::NotFound(external_id.to_owned()));
        }
        if !response.status().is_success() {
            return Err(Self::read_failure(response).await);
        }
        Ok(response.json().await?)
    }

    async fn cancel(&self, external_id: &str) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(format!("{}/cancel/{}", self.base_url, external_id))
            .timeout(self.status_timeout)
            .send()
            .await?;

        // Cancelling an id the service already forgot is a no-op.
        if response.status() == reqwest::StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(Self::read_failure(response).await)
    }

    async fn health(&self) -> Result<(), DispatchError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.status_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::read_failure(response).await)
    }
}

/// Routes each operation to the GPU pool or the local CPU twin.
pub struct WorkerRouter {
    gpu: Arc<dyn WorkerClient>,
    cpu: Arc<dyn WorkerClient>,
}

impl WorkerRouter {
    pub fn new(gpu: Arc<dyn WorkerClient>, cpu: Arc<dyn WorkerClient>) -> Self {
        Self { gpu, cpu }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        let gpu = HttpWorkerClient::new(
            &config.gpu_url,
            config.api_key.as_deref(),
            config.submit_timeout.0,
            config.status_timeout.0,
        );
        let cpu = HttpWorkerClient::new(
            &config.cpu_url,
            config.api_key.as_deref(),
            config.submit_timeout.0,
            config.status_timeout.0,
        );
        Self::new(Arc::new(gpu), Arc::new(cpu))
    }

    pub fn client_for(&self, operation: JobOperation) -> &dyn WorkerClient {
        match operation.route() {
            WorkerRoute::Gpu => self.gpu.as_ref(),
            WorkerRoute::Cpu => self.cpu.as_ref(),
        }
    }

    pub fn gpu(&self) -> &dyn WorkerClient {
        self.gpu.as_ref()
    }

    pub fn cpu(&self) -> &dyn WorkerClient {
        self.cpu.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use render_common::job::JobOperation;

    fn client(server_url: &str) -> HttpWorkerClient {
        HttpWorkerClient::new(
            server_url,
            Some("test-key"),
            time::Duration::from_secs(5),
            time::Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_submit_returns_external_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/run")
            .match_header("authorization", "Bearer test-key")
            .match_header("content-type", "application/json")
            .with_status(200)
            .with_body(r#"{"id": "run-abc123"}"#)
            .create_async()
            .await;

        let id = client(&server.url())
            .submit(
                JobOperation::AddAudio,
                &serde_json::json!({"video_url": "https://cdn.example/v.mp4"}),
            )
            .await
            .unwrap();

        assert_eq!(id, "run-abc123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_surfaces_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/run")
            .with_status(503)
            .with_body("no capacity")
            .create_async()
            .await;

        let err = client(&server.url())
            .submit(JobOperation::AddAudio, &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::BadStatus { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn test_status_decodes_worker_state() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/status/run-1")
            .with_status(200)
            .with_body(
                r#"{"id": "run-1", "status": "IN_PROGRESS", "delayTime": 120, "executionTime": 900}"#,
            )
            .create_async()
            .await;

        let state = client(&server.url()).status("run-1").await.unwrap();
        assert_eq!(state.status, ExternalStatus::InProgress);
        assert_eq!(state.delay_time, Some(120));
        assert_eq!(state.execution_time, Some(900));
    }

    #[tokio::test]
    async fn test_status_maps_404_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/status/run-gone")
            .with_status(404)
            .create_async()
            .await;

        let err = client(&server.url()).status("run-gone").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cancel_tolerates_unknown_ids() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/cancel/run-gone")
            .with_status(404)
            .create_async()
            .await;

        assert!(client(&server.url()).cancel("run-gone").await.is_ok());
    }

    #[test]
    fn test_external_status_wire_names() {
        let parsed: ExternalStatus = serde_json::from_str(r#""TIMED_OUT""#).unwrap();
        assert_eq!(parsed, ExternalStatus::TimedOut);
        assert!(parsed.is_terminal());
        assert!(parsed.is_abandoned());

        let parsed: ExternalStatus = serde_json::from_str(r#""IN_QUEUE""#).unwrap();
        assert!(!parsed.is_terminal());
    }
}
