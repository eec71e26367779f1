//! # Webhook Dispatcher
//!
//! Delivers the terminal notification for completed and failed jobs: POST
//! JSON to the client's callback URL, retrying on the configured delay
//! schedule until a 2xx lands or attempts run out, at which point the
//! payload goes to the dead-letter queue. Delivery state lives on the job
//! record (`retry_count`, `webhook_delivered`) so a restart resumes instead
//! of repeating past successes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use reqwest::header;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use render_common::store::{DeadLetter, JobPatch, JobStore, StoreError};
use render_common::webhook::{
    sign_payload, DeliverySchedule, WebhookPayload, ATTEMPT_HEADER, SIGNATURE_HEADER,
};

use crate::config::WebhookConfig;
use crate::error::WorkerError;

/// Handle used by the queue manager and the worker monitor to queue a job's
/// terminal webhook for delivery.
#[derive(Clone)]
pub struct WebhookHandle {
    sender: mpsc::UnboundedSender<Uuid>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl WebhookHandle {
    /// Queue a delivery. Duplicate enqueues while one is in flight are
    /// dropped, so the recovery sweep cannot double-send.
    pub fn enqueue(&self, job_id: Uuid) {
        let mut in_flight = self.in_flight.lock().expect("poisoned WebhookHandle lock");
        if in_flight.insert(job_id) && self.sender.send(job_id).is_err() {
            warn!("webhook dispatcher is gone, dropping delivery for job {}", job_id);
            in_flight.remove(&job_id);
        }
    }
}

#[cfg(test)]
impl WebhookHandle {
    /// Handle wired to a bare channel so tests can observe enqueues.
    pub(crate) fn for_tests(sender: mpsc::UnboundedSender<Uuid>) -> Self {
        Self {
            sender,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

pub struct WebhookDispatcher {
    deliverer: Arc<Deliverer>,
    receiver: mpsc::UnboundedReceiver<Uuid>,
    max_concurrent: usize,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn JobStore>, config: &WebhookConfig) -> (Self, WebhookHandle) {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("render-orchestrator webhook dispatcher")
            .timeout(config.request_timeout.0)
            .build()
            .expect("failed to construct reqwest client for webhook dispatch");

        let (sender, receiver) = mpsc::unbounded_channel();
        let in_flight = Arc::new(Mutex::new(HashSet::new()));

        let dispatcher = Self {
            deliverer: Arc::new(Deliverer {
                store,
                client,
                schedule: DeliverySchedule::new(
                    config.max_attempts,
                    config.retry_delays.0.clone(),
                ),
                secret: config.secret.clone(),
                in_flight: Arc::clone(&in_flight),
            }),
            receiver,
            max_concurrent: config.max_concurrent,
        };
        let handle = WebhookHandle { sender, in_flight };
        (dispatcher, handle)
    }

    /// Process deliveries until the shutdown signal flips or every handle
    /// is dropped. Each delivery runs in its own task; concurrency is
    /// bounded by a semaphore so a burst of terminal jobs cannot open
    /// unbounded sockets.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        loop {
            let job_id = tokio::select! {
                received = self.receiver.recv() => match received {
                    Some(job_id) => job_id,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("webhook semaphore closed");
            let deliverer = Arc::clone(&self.deliverer);
            tokio::spawn(async move {
                deliverer.deliver(job_id).await;
                drop(permit);
            });
        }
        // Let in-flight deliveries finish before reporting stopped; any job
        // cut short resumes from its persisted retry_count on restart.
        let all_permits = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        drop(semaphore.acquire_many(all_permits).await);
        info!("webhook dispatcher stopped");
    }
}

struct Deliverer {
    store: Arc<dyn JobStore>,
    client: reqwest::Client,
    schedule: DeliverySchedule,
    secret: Option<String>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Deliverer {
    async fn deliver(&self, job_id: Uuid) {
        if let Err(error) = self.try_deliver(job_id).await {
            error!("webhook delivery for job {} aborted: {}", job_id, error);
        }
        self.in_flight
            .lock()
            .expect("poisoned WebhookHandle lock")
            .remove(&job_id);
    }

    async fn try_deliver(&self, job_id: Uuid) -> Result<(), WorkerError> {
        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        if job.webhook_delivered {
            return Ok(());
        }
        // Cancelled and non-terminal jobs have nothing to deliver.
        let Ok(payload) = WebhookPayload::from_job(&job) else {
            return Ok(());
        };
        let body = serde_json::to_string(&payload)?;
        let labels = [("operation", job.operation.to_string())];

        let mut attempt = job.retry_count;
        while attempt < self.schedule.max_attempts {
            attempt += 1;
            if let Some(delay) = self.schedule.delay_before(attempt) {
                tokio::time::sleep(delay).await;
            }
            // Persist the attempt number before firing so a restart resumes
            // at the right point in the schedule.
            self.store
                .update_job(
                    job.id,
                    JobPatch {
                        retry_count: Some(attempt),
                        ..JobPatch::default()
                    },
                )
                .await?;

            let started = tokio::time::Instant::now();
            match self.post(&job.webhook_url, &body, attempt).await {
                Ok(status) if status.is_success() => {
                    metrics::histogram!("render_webhook_delivery_duration_seconds", &labels)
                        .record(started.elapsed().as_secs_f64());
                    metrics::counter!("render_webhook_deliveries_total", &labels).increment(1);
                    self.store
                        .update_job(
                            job.id,
                            JobPatch {
                                webhook_delivered: Some(true),
                                ..JobPatch::default()
                            },
                        )
                        .await?;
                    info!(
                        "webhook for job {} delivered on attempt {}",
                        job.id, attempt
                    );
                    return Ok(());
                }
                Ok(status) => {
                    warn!(
                        "webhook for job {} answered {} on attempt {}",
                        job.id, status, attempt
                    );
                }
                Err(error) => {
                    warn!(
                        "webhook for job {} failed on attempt {}: {}",
                        job.id, attempt, error
                    );
                }
            }
        }

        metrics::counter!("render_webhook_dead_letters_total", &labels).increment(1);
        error!(
            "webhook for job {} undeliverable after {} attempts, dead-lettering",
            job.id, self.schedule.max_attempts
        );
        self.store
            .push_dead_letter(DeadLetter {
                job_id: job.id,
                payload: serde_json::to_value(&payload)?,
                reason: format!(
                    "no 2xx response from {} within {} attempts",
                    job.webhook_url, self.schedule.max_attempts
                ),
                failed_at: chrono::Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn post(
        &self,
        url: &str,
        body: &str,
        attempt: u32,
    ) -> Result<reqwest::StatusCode, reqwest::Error> {
        let mut request = self
            .client
            .post(url)
            .header(ATTEMPT_HEADER, attempt.to_string())
            .body(body.to_owned());
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, body));
        }
        let response = request.send().await?;
        Ok(response.status())
    }
}
