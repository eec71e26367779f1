//! In-memory `JobStore` for development and single-process deployments.
//!
//! All state lives behind one mutex; no operation holds it across an await
//! point, which is what makes the linearizability contract cheap to honor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::job::{Job, JobStatus, QueueStats};

use super::{DeadLetter, JobPatch, JobStore, StoreError, StoreResult};

struct Inner {
    jobs: HashMap<Uuid, Job>,
    pending: VecDeque<Uuid>,
    in_progress: HashSet<Uuid>,
    workers_available: u32,
    dead_letters: Vec<DeadLetter>,
}

pub struct MemoryJobStore {
    max_workers: u32,
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new(max_workers: u32) -> Self {
        Self {
            max_workers,
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                pending: VecDeque::new(),
                in_progress: HashSet::new(),
                workers_available: max_workers,
                dead_letters: Vec::new(),
            }),
        }
    }

    pub fn max_workers(&self) -> u32 {
        self.max_workers
    }

    /// Snapshot of the dead-letter records, for diagnostics.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("poisoned MemoryJobStore mutex")
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job: &Job) -> StoreResult<()> {
        let mut inner = self.lock();
        let newly_indexed = !inner.jobs.contains_key(&job.id);
        inner.jobs.insert(job.id, job.clone());
        if newly_indexed && job.status == JobStatus::Queued {
            inner.pending.push_back(job.id);
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Job> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_job(&self, id: Uuid, patch: JobPatch) -> StoreResult<Job> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let outcome = super::apply_patch(job, patch)?;
        let updated = job.clone();

        // Keep the pending/in-progress indexes consistent with the status
        // each job is in.
        if let Some((_, next)) = outcome.transition {
            match next {
                JobStatus::Submitted | JobStatus::Processing => {
                    inner.pending.retain(|queued| *queued != id);
                    inner.in_progress.insert(id);
                }
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                    inner.pending.retain(|queued| *queued != id);
                    inner.in_progress.remove(&id);
                }
                JobStatus::Queued => {}
            }
        }

        // Workers zeroed by a terminal patch return to the budget in the
        // same critical section.
        if outcome.release > 0 {
            inner.workers_available =
                std::cmp::min(self.max_workers, inner.workers_available + outcome.release);
        }

        Ok(updated)
    }

    async fn peek_pending(&self) -> StoreResult<Option<Job>> {
        let inner = self.lock();
        Ok(inner
            .pending
            .front()
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn dequeue_pending(&self) -> StoreResult<Option<Job>> {
        let mut inner = self.lock();
        match inner.pending.pop_front() {
            Some(id) => Ok(inner.jobs.get(&id).cloned()),
            None => Ok(None),
        }
    }

    async fn requeue_front(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        inner.pending.push_front(id);
        Ok(())
    }

    async fn remove_pending(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock();
        let before = inner.pending.len();
        inner.pending.retain(|queued| *queued != id);
        Ok(inner.pending.len() != before)
    }

    async fn reserve_workers(&self, n: u32) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.workers_available >= n {
            inner.workers_available -= n;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_workers(&self, n: u32) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.workers_available = std::cmp::min(self.max_workers, inner.workers_available + n);
        Ok(())
    }

    async fn list_by_status(&self, status: JobStatus) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .map(|job| job.id)
            .collect())
    }

    async fn queue_stats(&self) -> StoreResult<QueueStats> {
        let inner = self.lock();
        let mut stats = QueueStats {
            active_workers: self.max_workers - inner.workers_available,
            available_workers: inner.workers_available,
            ..QueueStats::default()
        };
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Submitted => stats.submitted += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn recover_leaked_workers(&self) -> StoreResult<u32> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let mut recovered = 0;
        for job in inner.jobs.values_mut() {
            if job.status.is_terminal() && job.workers_reserved > 0 {
                recovered += job.workers_reserved;
                job.workers_reserved = 0;
            }
        }
        if recovered > 0 {
            inner.workers_available =
                std::cmp::min(self.max_workers, inner.workers_available + recovered);
        }
        Ok(recovered)
    }

    async fn evict_expired(&self, ttl: chrono::Duration) -> StoreResult<u32> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let cutoff = Utc::now() - ttl;
        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                job.status.is_terminal()
                    && job.completed_at.is_some_and(|done| done < cutoff)
            })
            .map(|job| job.id)
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
            inner.in_progress.remove(id);
        }
        let jobs = &inner.jobs;
        inner.pending.retain(|id| jobs.contains_key(id));
        Ok(u32::try_from(expired.len()).unwrap_or(u32::MAX))
    }

    async fn push_dead_letter(&self, record: DeadLetter) -> StoreResult<()> {
        self.lock().dead_letters.push(record);
        Ok(())
    }
}
