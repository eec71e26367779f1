//! # Queue Manager
//!
//! Drives jobs from `QUEUED` to `SUBMITTED`. Runs on a fixed tick plus an
//! on-demand wakeup (after each submission and each worker release), and
//! admits the head of the pending queue only while the worker budget covers
//! it: a large job waiting at the head blocks smaller jobs behind it rather
//! than being starved by them.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use render_common::health::LivenessHandle;
use render_common::job::{Job, JobError, JobStatus};
use render_common::store::{JobPatch, JobStore, StoreError};

use crate::config::QueueManagerConfig;
use crate::error::WorkerError;
use crate::external::{DispatchError, WorkerRouter};
use crate::split::{plan_dispatch, DispatchPlan};
use crate::webhook::WebhookHandle;

enum Admission {
    /// A job was handed off; keep draining.
    Submitted,
    /// The head needs more workers than are free, or a reservation race was
    /// lost; wait for the next tick or wakeup.
    Blocked,
    /// Nothing pending.
    Idle,
}

pub struct QueueManager {
    store: Arc<dyn JobStore>,
    workers: Arc<WorkerRouter>,
    webhooks: WebhookHandle,
    wake: Arc<Notify>,
    tick: std::time::Duration,
    split_threshold: usize,
    split_max_chunks: u32,
    liveness: LivenessHandle,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        workers: Arc<WorkerRouter>,
        webhooks: WebhookHandle,
        wake: Arc<Notify>,
        config: &QueueManagerConfig,
        max_workers: u32,
        liveness: LivenessHandle,
    ) -> Self {
        Self {
            store,
            workers,
            webhooks,
            wake,
            tick: config.tick.0,
            split_threshold: config.split_threshold,
            split_max_chunks: config.split_max_chunks.unwrap_or(max_workers),
            liveness,
        }
    }

    /// Run until the shutdown signal flips, draining the pending queue on
    /// every tick and on every wakeup.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.liveness.report_healthy();
            if let Err(error) = self.drain_pending().await {
                error!("queue manager pass failed: {}", error);
            }
        }
        info!("queue manager stopped");
    }

    /// Admit pending jobs in FIFO order until the budget blocks the head or
    /// the queue runs dry. Public so tests can drive passes deterministically.
    pub async fn drain_pending(&self) -> Result<(), WorkerError> {
        loop {
            match self.admit_next().await? {
                Admission::Submitted => continue,
                Admission::Blocked | Admission::Idle => return Ok(()),
            }
        }
    }

    async fn admit_next(&self) -> Result<Admission, WorkerError> {
        let stats = self.store.queue_stats().await?;
        if stats.available_workers == 0 {
            return Ok(Admission::Blocked);
        }

        let Some(head) = self.store.peek_pending().await? else {
            return Ok(Admission::Idle);
        };
        let plan = plan_dispatch(&head, self.split_threshold, self.split_max_chunks);
        if plan.workers_needed > stats.available_workers {
            debug!(
                "job {} needs {} workers, {} available, holding the queue",
                head.id, plan.workers_needed, stats.available_workers
            );
            return Ok(Admission::Blocked);
        }

        let Some(job) = self.store.dequeue_pending().await? else {
            return Ok(Admission::Idle);
        };
        // The head can only have changed under us through a cancellation;
        // replan for the job actually dequeued.
        let plan = if job.id == head.id {
            plan
        } else {
            plan_dispatch(&job, self.split_threshold, self.split_max_chunks)
        };

        if !self.store.reserve_workers(plan.workers_needed).await? {
            // Lost the reservation race; restore the head and retry on the
            // next tick.
            self.store.requeue_front(job.id).await?;
            return Ok(Admission::Blocked);
        }

        self.submit(job, plan).await?;
        Ok(Admission::Submitted)
    }

    /// Submit every sub-request in order, then mark the job `SUBMITTED`.
    async fn submit(&self, job: Job, plan: DispatchPlan) -> Result<(), WorkerError> {
        let client = self.workers.client_for(job.operation);
        let mut external_ids = Vec::with_capacity(plan.sub_payloads.len());
        for payload in &plan.sub_payloads {
            match client.submit(job.operation, payload).await {
                Ok(external_id) => external_ids.push(external_id),
                Err(error) => {
                    return self
                        .fail_submission(job, plan.workers_needed, external_ids, error)
                        .await;
                }
            }
        }

        let patch = JobPatch {
            status: Some(JobStatus::Submitted),
            external_ids: Some(external_ids.clone()),
            workers_reserved: Some(plan.workers_needed),
            attempts: Some(job.attempts + 1),
            ..JobPatch::default()
        };
        match self.store.update_job(job.id, patch).await {
            Ok(submitted) => {
                let labels = [("operation", submitted.operation.to_string())];
                metrics::counter!("render_jobs_submitted_total", &labels).increment(1);
                info!(
                    "job {} submitted to {} worker(s) as {:?}",
                    submitted.id, submitted.workers_reserved, submitted.external_ids
                );
                Ok(())
            }
            Err(StoreError::InvalidTransition { from, to }) => {
                // Cancelled while we were submitting. Undo: best-effort
                // cancel of what was handed off, give the workers back.
                warn!(
                    "job {} moved {} -> {} during submission, cancelling externals",
                    job.id, from, to
                );
                for external_id in &external_ids {
                    if let Err(error) = client.cancel(external_id).await {
                        debug!("best-effort cancel of {} failed: {}", external_id, error);
                    }
                }
                self.store.release_workers(plan.workers_needed).await?;
                self.wake.notify_one();
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// The hand-off failed: cancel any sub-request already accepted, release
    /// the reservation and fail the job with a `SUBMISSION_ERROR` webhook.
    async fn fail_submission(
        &self,
        job: Job,
        reserved: u32,
        submitted: Vec<String>,
        error: DispatchError,
    ) -> Result<(), WorkerError> {
        warn!("submission of job {} failed: {}", job.id, error);
        let client = self.workers.client_for(job.operation);
        for external_id in &submitted {
            if let Err(cancel_error) = client.cancel(external_id).await {
                debug!(
                    "best-effort cancel of {} failed: {}",
                    external_id, cancel_error
                );
            }
        }
        // The reservation was never recorded on the job, so it is returned
        // explicitly rather than through the finalizing patch.
        self.store.release_workers(reserved).await?;

        let patch = JobPatch::finalize(
            JobStatus::Failed,
            None,
            Some(JobError::submission(error.to_string())),
        );
        match self.store.update_job(job.id, patch).await {
            Ok(failed) => {
                let labels = [("operation", failed.operation.to_string())];
                metrics::counter!("render_jobs_failed_total", &labels).increment(1);
                self.webhooks.enqueue(failed.id);
                Ok(())
            }
            // Already cancelled by the client; nothing further to record.
            Err(StoreError::InvalidTransition { .. }) => Ok(()),
            Err(store_error) => Err(store_error.into()),
        }
    }
}
