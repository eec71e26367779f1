//! # Job Service
//!
//! Facade over the job store and the queue manager wakeup: admission with
//! SSRF validation, status queries with split-job progress, idempotent
//! cancellation, queue statistics and the admin operations.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use render_common::job::{Job, JobError, JobOperation, JobStatus, QueueStats};
use render_common::ssrf::{validate_webhook_url, WebhookUrlError};
use render_common::store::{JobPatch, JobStore, StoreError};
use render_worker::external::WorkerRouter;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: JobStatus },
    #[error("webhook url rejected: {0}")]
    InvalidWebhook(#[from] WebhookUrlError),
    #[error("queue backend unavailable: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

/// The fields every submission body shares. Operation-specific parameters
/// are captured opaquely and forwarded to the worker untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub webhook_url: String,
    /// Opaque client routing string, echoed back as `pathRaiz`.
    pub path: String,
    #[serde(default)]
    pub id_roteiro: Option<i64>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub operation: JobOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_roteiro: Option<i64>,
    pub message: String,
    pub estimated_time: String,
    pub queue_position: u64,
    pub status_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers_reserved: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub completed: u32,
    pub total: u32,
    pub percentage: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub operation: JobOperation,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_roteiro: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_raiz: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Diagnostic snapshot for `GET /admin/workers/status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkersStatus {
    pub max_workers: u32,
    pub queue: QueueStats,
    pub gpu_service: String,
    pub cpu_service: String,
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    workers: Arc<WorkerRouter>,
    wake: Arc<Notify>,
    max_workers: u32,
    started_at: Instant,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        workers: Arc<WorkerRouter>,
        wake: Arc<Notify>,
        max_workers: u32,
    ) -> Self {
        Self {
            store,
            workers,
            wake,
            max_workers,
            started_at: Instant::now(),
        }
    }

    /// Admit a submission: validate the webhook target, persist the job as
    /// `QUEUED` and wake the queue manager.
    pub async fn create_job(
        &self,
        operation: JobOperation,
        request: SubmitRequest,
    ) -> Result<JobSubmitResponse, ServiceError> {
        validate_webhook_url(&request.webhook_url).await?;

        // Workers route their outputs by `path`, so it rides inside the
        // payload as well as being echoed in the webhook.
        let mut payload = request.params;
        payload.insert("path".to_owned(), Value::String(request.path.clone()));

        let job = Job::new(
            operation,
            Value::Object(payload),
            request.webhook_url,
            request.id_roteiro,
            Some(request.path),
        );
        self.store.save_job(&job).await?;
        let stats = self.store.queue_stats().await?;
        self.wake.notify_one();

        let labels = [("operation", operation.to_string())];
        metrics::counter!("render_jobs_admitted_total", &labels).increment(1);
        info!("job {} admitted for {}", job.id, operation);

        Ok(JobSubmitResponse {
            job_id: job.id,
            status: job.status,
            operation,
            id_roteiro: job.id_roteiro,
            message: "job accepted and queued for processing".to_owned(),
            estimated_time: operation.estimated_time().to_owned(),
            queue_position: stats.queued.max(1),
            status_url: format!("/jobs/{}", job.id),
            created_at: job.created_at,
            workers_reserved: None,
        })
    }

    pub async fn job_status(&self, id: Uuid) -> Result<JobStatusResponse, ServiceError> {
        let job = self.store.get_job(id).await?;

        let total = u32::try_from(job.external_ids.len()).unwrap_or(u32::MAX);
        let progress = (job.status == JobStatus::Processing && total > 1).then(|| {
            let completed = job.subjobs_completed.min(total);
            JobProgress {
                completed,
                total,
                percentage: completed * 100 / total,
            }
        });

        Ok(JobStatusResponse {
            job_id: job.id,
            operation: job.operation,
            status: job.status,
            progress,
            result: job.result,
            error: job.error,
            id_roteiro: job.id_roteiro,
            path_raiz: job.path_raiz,
            created_at: job.created_at,
            submitted_at: job.submitted_at,
            completed_at: job.completed_at,
        })
    }

    /// Cancel a non-terminal job. No webhook: the client asked for this and
    /// already knows. The external cancel is best-effort and may lose the
    /// race against completion.
    pub async fn cancel_job(&self, id: Uuid) -> Result<(), ServiceError> {
        let job = self.store.get_job(id).await?;
        if job.is_terminal() {
            return Err(ServiceError::AlreadyTerminal {
                id,
                status: job.status,
            });
        }

        if job.status == JobStatus::Queued {
            self.store.remove_pending(id).await?;
        } else {
            let client = self.workers.client_for(job.operation);
            for external_id in &job.external_ids {
                if let Err(error) = client.cancel(external_id).await {
                    debug!("best-effort cancel of {} failed: {}", external_id, error);
                }
            }
        }

        let patch = JobPatch {
            status: Some(JobStatus::Cancelled),
            workers_reserved: Some(0),
            ..JobPatch::default()
        };
        match self.store.update_job(id, patch).await {
            Ok(cancelled) => {
                let labels = [("operation", cancelled.operation.to_string())];
                metrics::counter!("render_jobs_cancelled_total", &labels).increment(1);
                info!("job {} cancelled by the client", id);
                self.wake.notify_one();
                Ok(())
            }
            Err(StoreError::InvalidTransition { .. }) => {
                // Completion won the race; terminal states are absorbing.
                let job = self.store.get_job(id).await?;
                Err(ServiceError::AlreadyTerminal {
                    id,
                    status: job.status,
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, ServiceError> {
        Ok(self.store.queue_stats().await?)
    }

    pub async fn recover_workers(&self) -> Result<u32, ServiceError> {
        let recovered = self.store.recover_leaked_workers().await?;
        if recovered > 0 {
            self.wake.notify_one();
        }
        Ok(recovered)
    }

    pub async fn workers_status(&self) -> Result<WorkersStatus, ServiceError> {
        let queue = self.store.queue_stats().await?;
        let gpu_service = match self.workers.gpu().health().await {
            Ok(()) => "ok".to_owned(),
            Err(error) => format!("unreachable: {}", error),
        };
        let cpu_service = match self.workers.cpu().health().await {
            Ok(()) => "ok".to_owned(),
            Err(error) => format!("unreachable: {}", error),
        };
        Ok(WorkersStatus {
            max_workers: self.max_workers,
            queue,
            gpu_service,
            cpu_service,
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
