//! # Worker Monitor
//!
//! Reconciles external worker state into the job store: polls every
//! external id of every `SUBMITTED`/`PROCESSING` job, promotes jobs on
//! first progress, aggregates chunk outputs on completion, fails parents on
//! the first failed sub-job, enforces the execution timeout, and runs the
//! periodic recovery pass (leaked worker budget, expired records, webhooks
//! still owed after a restart).
//!
//! A job's status only ever moves forward here: a reconciliation step that
//! would regress it is dropped by the store's transition check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use render_common::health::LivenessHandle;
use render_common::job::{Job, JobError, JobStatus};
use render_common::store::{JobPatch, JobStore, StoreError};

use crate::config::MonitorConfig;
use crate::error::WorkerError;
use crate::external::{ExternalJobState, ExternalStatus, WorkerRouter};
use crate::webhook::WebhookHandle;

pub struct WorkerMonitor {
    store: Arc<dyn JobStore>,
    workers: Arc<WorkerRouter>,
    webhooks: WebhookHandle,
    /// Nudges the queue manager when workers come back to the budget.
    wake: Arc<Notify>,
    poll_interval: std::time::Duration,
    execution_timeout: chrono::Duration,
    recovery_interval: std::time::Duration,
    not_found_grace: u32,
    job_ttl: chrono::Duration,
    webhook_max_attempts: u32,
    /// Consecutive polls an external id has been reported unknown.
    missing: Mutex<HashMap<String, u32>>,
    liveness: LivenessHandle,
}

impl WorkerMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        workers: Arc<WorkerRouter>,
        webhooks: WebhookHandle,
        wake: Arc<Notify>,
        config: &MonitorConfig,
        job_ttl_secs: u64,
        webhook_max_attempts: u32,
        liveness: LivenessHandle,
    ) -> Self {
        Self {
            store,
            workers,
            webhooks,
            wake,
            poll_interval: config.poll_interval.0,
            execution_timeout: chrono::Duration::milliseconds(
                i64::try_from(config.execution_timeout.0.as_millis()).unwrap_or(i64::MAX),
            ),
            recovery_interval: config.recovery_interval.0,
            not_found_grace: config.not_found_grace,
            job_ttl: chrono::Duration::seconds(i64::try_from(job_ttl_secs).unwrap_or(i64::MAX)),
            webhook_max_attempts,
            missing: Mutex::new(HashMap::new()),
            liveness,
        }
    }

    /// Run until the shutdown signal flips. The recovery pass also runs on
    /// the first tick, which is what resumes webhook delivery after a
    /// restart.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        let mut last_recovery: Option<tokio::time::Instant> = None;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.liveness.report_healthy();

            if let Err(err) = self.reconcile_once().await {
                error!("monitor reconciliation pass failed: {}", err);
            }

            let recovery_due = match last_recovery {
                None => true,
                Some(at) => at.elapsed() >= self.recovery_interval,
            };
            if recovery_due {
                if let Err(err) = self.recover_once().await {
                    error!("monitor recovery pass failed: {}", err);
                }
                last_recovery = Some(tokio::time::Instant::now());
            }
        }
        info!("worker monitor stopped");
    }

    /// One reconciliation pass over every active job.
    pub async fn reconcile_once(&self) -> Result<(), WorkerError> {
        let mut ids = self.store.list_by_status(JobStatus::Submitted).await?;
        ids.extend(self.store.list_by_status(JobStatus::Processing).await?);

        for job_id in ids {
            let job = match self.store.get_job(job_id).await {
                Ok(job) => job,
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            if job.is_terminal() {
                continue;
            }
            if let Err(err) = self.reconcile_job(&job).await {
                error!("reconciliation of job {} failed: {}", job.id, err);
            }
        }
        Ok(())
    }

    async fn reconcile_job(&self, job: &Job) -> Result<(), WorkerError> {
        if let Some(submitted_at) = job.submitted_at {
            if Utc::now() - submitted_at > self.execution_timeout {
                return self.finalize_timeout(job).await;
            }
        }

        let client = self.workers.client_for(job.operation);
        let mut states: Vec<Option<ExternalJobState>> = Vec::with_capacity(job.external_ids.len());
        for external_id in &job.external_ids {
            match client.status(external_id).await {
                Ok(state) => {
                    self.missing.lock().expect("poisoned missing map").remove(external_id);
                    states.push(Some(state));
                }
                Err(err) if err.is_not_found() => {
                    let strikes = {
                        let mut missing = self.missing.lock().expect("poisoned missing map");
                        let entry = missing.entry(external_id.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    if strikes > self.not_found_grace {
                        // The service dropped an id it had accepted; the
                        // sub-job is gone for good.
                        states.push(Some(ExternalJobState {
                            id: external_id.clone(),
                            status: ExternalStatus::Failed,
                            output: None,
                            error: Some(format!(
                                "external job {} disappeared from the worker service",
                                external_id
                            )),
                            delay_time: None,
                            execution_time: None,
                        }));
                    } else {
                        debug!(
                            "external job {} unknown for {} poll(s), tolerating",
                            external_id, strikes
                        );
                        states.push(None);
                    }
                }
                Err(err) => {
                    debug!(
                        "status poll for {} failed transiently: {}",
                        external_id, err
                    );
                    states.push(None);
                }
            }
        }

        let completed_subjobs = states
            .iter()
            .flatten()
            .filter(|state| state.status == ExternalStatus::Completed)
            .count();
        let completed_subjobs = u32::try_from(completed_subjobs).unwrap_or(u32::MAX);
        let all_terminal = !states.is_empty()
            && states
                .iter()
                .all(|state| state.as_ref().is_some_and(|s| s.status.is_terminal()));

        if all_terminal {
            let states: Vec<ExternalJobState> = states.into_iter().flatten().collect();
            return self.finalize(job, &states).await;
        }

        let any_progress = completed_subjobs > 0
            || states
                .iter()
                .flatten()
                .any(|state| state.status == ExternalStatus::InProgress);
        if any_progress && job.status == JobStatus::Submitted {
            let patch = JobPatch {
                status: Some(JobStatus::Processing),
                subjobs_completed: Some(completed_subjobs),
                ..JobPatch::default()
            };
            match self.store.update_job(job.id, patch).await {
                Ok(_) => {
                    debug!("job {} is processing", job.id);
                }
                // Cancelled under us; terminal states are absorbing.
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        } else if completed_subjobs != job.subjobs_completed {
            let patch = JobPatch {
                subjobs_completed: Some(completed_subjobs),
                ..JobPatch::default()
            };
            self.store.update_job(job.id, patch).await?;
        }
        Ok(())
    }

    /// All sub-jobs are terminal: settle the parent.
    async fn finalize(&self, job: &Job, states: &[ExternalJobState]) -> Result<(), WorkerError> {
        let failed = states
            .iter()
            .find(|state| state.status == ExternalStatus::Failed);
        let abandoned = states.iter().find(|state| state.status.is_abandoned());

        let (status, result, job_error) = if let Some(state) = failed {
            let message = state
                .error
                .clone()
                .unwrap_or_else(|| "external worker reported failure".to_owned());
            (
                JobStatus::Failed,
                None,
                Some(
                    JobError::processing(message)
                        .with_details(json!({ "externalId": state.id })),
                ),
            )
        } else if let Some(state) = abandoned {
            (
                JobStatus::Failed,
                None,
                Some(JobError::cancelled_by_external(format!(
                    "external job {} ended as {:?} without this service asking",
                    state.id, state.status
                ))),
            )
        } else {
            (JobStatus::Completed, Some(aggregate_outputs(states)), None)
        };

        let completed_subjobs = states
            .iter()
            .filter(|state| state.status == ExternalStatus::Completed)
            .count();
        let mut patch = JobPatch::finalize(status, result, job_error);
        patch.subjobs_completed = Some(u32::try_from(completed_subjobs).unwrap_or(u32::MAX));

        match self.store.update_job(job.id, patch).await {
            Ok(finalized) => {
                let labels = [
                    ("operation", finalized.operation.to_string()),
                    ("status", finalized.status.to_string()),
                ];
                metrics::counter!("render_jobs_finished_total", &labels).increment(1);
                info!(
                    "job {} finalized as {} after {} sub-job(s)",
                    finalized.id,
                    finalized.status,
                    states.len()
                );
                self.forget_externals(job);
                self.webhooks.enqueue(finalized.id);
                self.wake.notify_one();
                Ok(())
            }
            Err(StoreError::InvalidTransition { .. }) => {
                self.forget_externals(job);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The job sat non-terminal past the execution timeout: cancel whatever
    /// is still running out there and fail it.
    async fn finalize_timeout(&self, job: &Job) -> Result<(), WorkerError> {
        warn!(
            "job {} exceeded the execution timeout, cancelling {} external id(s)",
            job.id,
            job.external_ids.len()
        );
        let client = self.workers.client_for(job.operation);
        for external_id in &job.external_ids {
            if let Err(err) = client.cancel(external_id).await {
                debug!("best-effort cancel of {} failed: {}", external_id, err);
            }
        }

        let patch = JobPatch::finalize(
            JobStatus::Failed,
            None,
            Some(JobError::timeout(format!(
                "job did not finish within {} seconds",
                self.execution_timeout.num_seconds()
            ))),
        );
        match self.store.update_job(job.id, patch).await {
            Ok(finalized) => {
                let labels = [("operation", finalized.operation.to_string())];
                metrics::counter!("render_jobs_timed_out_total", &labels).increment(1);
                self.forget_externals(job);
                self.webhooks.enqueue(finalized.id);
                self.wake.notify_one();
                Ok(())
            }
            Err(StoreError::InvalidTransition { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// The recovery pass: return leaked budget, evict expired records, and
    /// re-queue webhooks still owed (crash recovery / restart resume).
    pub async fn recover_once(&self) -> Result<(), WorkerError> {
        let recovered = self.store.recover_leaked_workers().await?;
        if recovered > 0 {
            warn!("recovered {} leaked worker(s)", recovered);
            metrics::counter!("render_workers_recovered_total").increment(u64::from(recovered));
            self.wake.notify_one();
        }

        let evicted = self.store.evict_expired(self.job_ttl).await?;
        if evicted > 0 {
            debug!("evicted {} expired job record(s)", evicted);
        }

        for status in [JobStatus::Completed, JobStatus::Failed] {
            for job_id in self.store.list_by_status(status).await? {
                let job = match self.store.get_job(job_id).await {
                    Ok(job) => job,
                    Err(StoreError::NotFound(_)) => continue,
                    Err(err) => return Err(err.into()),
                };
                if job.webhook_outstanding(self.webhook_max_attempts) {
                    self.webhooks.enqueue(job.id);
                }
            }
        }

        let stats = self.store.queue_stats().await?;
        metrics::gauge!("render_workers_available").set(f64::from(stats.available_workers));
        metrics::gauge!("render_queue_depth").set(stats.queued as f64);
        Ok(())
    }

    fn forget_externals(&self, job: &Job) {
        let mut missing = self.missing.lock().expect("poisoned missing map");
        for external_id in &job.external_ids {
            missing.remove(external_id);
        }
    }
}

/// Concatenate per-chunk outputs in submission order. Split image-to-video
/// chunks each return a `videos` array; anything else passes through
/// unchanged (single chunk) or as a raw list.
fn aggregate_outputs(states: &[ExternalJobState]) -> Value {
    if states.len() == 1 {
        return states[0].output.clone().unwrap_or(Value::Null);
    }

    let mut videos = Vec::new();
    for state in states {
        match state
            .output
            .as_ref()
            .and_then(|output| output.get("videos"))
            .and_then(Value::as_array)
        {
            Some(chunk) => videos.extend(chunk.iter().cloned()),
            None => {
                let outputs: Vec<Value> = states
                    .iter()
                    .map(|state| state.output.clone().unwrap_or(Value::Null))
                    .collect();
                return json!({ "outputs": outputs });
            }
        }
    }
    json!({ "videos": videos })
}
