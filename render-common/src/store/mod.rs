//! # JobStore
//!
//! The single access path to shared queue state. Two backends implement the
//! same contract: an in-memory store for single-process deployments and a
//! Redis-backed store that survives restarts. Callers may assume every
//! operation is linearizable with respect to every other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::job::{Job, JobError, JobStatus, QueueStats};

pub mod memory;
pub mod redis;

pub use memory::MemoryJobStore;
pub use redis::RedisJobStore;

/// Enumeration of errors for operations on a JobStore.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("connection to the store backend failed: {error}")]
    Connection { error: ::redis::RedisError },
    #[error("{command} command failed: {error}")]
    Command {
        command: String,
        error: ::redis::RedisError,
    },
    #[error("job record could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Partial update of a job's mutable fields.
///
/// Status changes are validated against the transition DAG. The store owns
/// the lifecycle timestamps: `submitted_at` is stamped when a patch moves a
/// job to `SUBMITTED` and `completed_at` when it moves to any terminal
/// state. Zeroing `workers_reserved` in the same patch that makes a job
/// terminal returns those workers to the budget atomically, so the budget
/// invariant holds at every observable moment.
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub external_ids: Option<Vec<String>>,
    pub workers_reserved: Option<u32>,
    pub subjobs_completed: Option<u32>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub attempts: Option<u32>,
    pub retry_count: Option<u32>,
    pub webhook_delivered: Option<bool>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch finalizing a job: terminal status, outcome, and the worker
    /// release that must land in the same atomic step.
    pub fn finalize(status: JobStatus, result: Option<Value>, error: Option<JobError>) -> Self {
        Self {
            status: Some(status),
            workers_reserved: Some(0),
            result,
            error,
            ..Self::default()
        }
    }
}

/// A webhook payload that exhausted every delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub payload: Value,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Side effects a backend must apply together with a patched record.
pub(crate) struct PatchOutcome {
    /// `(from, to)` when the patch changed the job's status.
    pub transition: Option<(JobStatus, JobStatus)>,
    /// Workers to return to the budget in the same atomic step.
    pub release: u32,
}

/// Apply a `JobPatch` to a job record, enforcing the transition DAG and
/// stamping lifecycle timestamps. Shared by both backends so their update
/// semantics cannot drift apart.
pub(crate) fn apply_patch(job: &mut Job, patch: JobPatch) -> StoreResult<PatchOutcome> {
    let previous_reserved = job.workers_reserved;
    let mut transition = None;

    if let Some(next) = patch.status {
        let current = job.status;
        if next != current {
            if !current.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: current,
                    to: next,
                });
            }
            job.status = next;
            if next == JobStatus::Submitted {
                job.submitted_at.get_or_insert_with(Utc::now);
            }
            if next.is_terminal() {
                job.completed_at.get_or_insert_with(Utc::now);
            }
            transition = Some((current, next));
        }
    }

    if let Some(external_ids) = patch.external_ids {
        job.external_ids = external_ids;
    }
    if let Some(reserved) = patch.workers_reserved {
        job.workers_reserved = reserved;
    }
    if let Some(done) = patch.subjobs_completed {
        job.subjobs_completed = done;
    }
    if let Some(result) = patch.result {
        job.result = Some(result);
    }
    if let Some(error) = patch.error {
        job.error = Some(error);
    }
    if let Some(attempts) = patch.attempts {
        job.attempts = attempts;
    }
    if let Some(retry_count) = patch.retry_count {
        job.retry_count = retry_count;
    }
    if let Some(delivered) = patch.webhook_delivered {
        job.webhook_delivered = delivered;
    }

    let release = if job.status.is_terminal() && job.workers_reserved == 0 && previous_reserved > 0
    {
        previous_reserved
    } else {
        0
    };

    Ok(PatchOutcome {
        transition,
        release,
    })
}

/// Persistent job and queue state.
///
/// The pending queue is FIFO over `QUEUED` jobs. `workers_available` is the
/// global budget counter; it never goes negative and saturates at the
/// configured maximum on release.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create-or-overwrite a job record. A `QUEUED` job that was not
    /// previously indexed is appended to the pending queue.
    async fn save_job(&self, job: &Job) -> StoreResult<()>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Job>;

    /// Apply a partial update, enforcing the status transition DAG.
    /// Returns the updated record.
    async fn update_job(&self, id: Uuid, patch: JobPatch) -> StoreResult<Job>;

    /// Head of the pending queue without removing it.
    async fn peek_pending(&self) -> StoreResult<Option<Job>>;

    /// Remove and return the head of the pending queue.
    async fn dequeue_pending(&self) -> StoreResult<Option<Job>>;

    /// Put a job back at the head of the pending queue, compensating a
    /// dequeue whose worker reservation lost a race.
    async fn requeue_front(&self, id: Uuid) -> StoreResult<()>;

    /// Remove a job from the pending queue wherever it sits. Returns whether
    /// it was present.
    async fn remove_pending(&self, id: Uuid) -> StoreResult<bool>;

    /// Atomically deduct `n` workers from the budget iff enough are
    /// available.
    async fn reserve_workers(&self, n: u32) -> StoreResult<bool>;

    /// Return `n` workers to the budget, saturating at the configured
    /// maximum.
    async fn release_workers(&self, n: u32) -> StoreResult<()>;

    /// Snapshot of job ids currently in `status`. Ordering is unspecified.
    async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<Uuid>>;

    async fn queue_stats(&self) -> StoreResult<QueueStats>;

    /// Zero `workers_reserved` on terminal jobs that still hold a
    /// reservation and return that many workers to the budget. Recovers
    /// budget lost to crashes between finalization and release. Idempotent.
    async fn recover_leaked_workers(&self) -> StoreResult<u32>;

    /// Drop terminal jobs whose retention TTL expired. Returns how many were
    /// evicted. Backends with native key expiry may report 0.
    async fn evict_expired(&self, ttl: chrono::Duration) -> StoreResult<u32>;

    /// Record a webhook payload that exhausted all delivery attempts.
    async fn push_dead_letter(&self, record: DeadLetter) -> StoreResult<()>;
}
