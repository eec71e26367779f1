//! # Webhook
//!
//! The terminal notification contract: payload shape, the retry schedule,
//! and optional HMAC signing of the request body. Delivery itself lives in
//! the worker crate; the API crate reuses these types to document the
//! callback in its responses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::job::{Job, JobError, JobOperation, JobStatus};

/// Header carrying the HMAC-SHA256 signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the 1-based delivery attempt number.
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

#[derive(Error, Debug)]
pub enum WebhookPayloadError {
    #[error("job {0} in status {1} does not deliver a webhook")]
    NotDeliverable(Uuid, JobStatus),
}

/// Wall-clock accounting of the job's external execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub duration_seconds: f64,
}

/// The JSON body POSTed to the client's webhook URL exactly once per
/// terminal job (at-least-once attempts; receivers deduplicate by `jobId`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_roteiro: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_raiz: Option<String>,
    pub operation: JobOperation,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub execution: ExecutionSummary,
}

impl WebhookPayload {
    /// Build the terminal notification for a completed or failed job.
    /// Cancelled jobs do not notify: the client initiated the cancellation.
    pub fn from_job(job: &Job) -> Result<Self, WebhookPayloadError> {
        if !matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return Err(WebhookPayloadError::NotDeliverable(job.id, job.status));
        }

        let duration_ms = match (job.submitted_at, job.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0),
            _ => 0,
        };

        Ok(Self {
            job_id: job.id,
            id_roteiro: job.id_roteiro,
            path_raiz: job.path_raiz.clone(),
            operation: job.operation,
            status: job.status,
            timestamp: Utc::now(),
            result: job.result.clone(),
            error: job.error.clone(),
            execution: ExecutionSummary {
                start_time: job.submitted_at,
                end_time: job.completed_at,
                duration_ms,
                duration_seconds: duration_ms as f64 / 1000.0,
            },
        })
    }
}

/// The delivery schedule: up to `max_attempts` POSTs, waiting
/// `delays[n - 2]` before the n-th attempt. Attempts past the configured
/// schedule reuse its last delay.
#[derive(Debug, Clone)]
pub struct DeliverySchedule {
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
}

impl DeliverySchedule {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            delays,
        }
    }

    /// How long to wait before the given 1-based attempt. The first attempt
    /// fires immediately.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        if attempt <= 1 {
            return None;
        }
        let index = usize::try_from(attempt - 2).unwrap_or(usize::MAX);
        self.delays.get(index).or(self.delays.last()).copied()
    }
}

impl Default for DeliverySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(15),
            ],
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the exact body bytes, hex-encoded with a `sha256=`
/// prefix. Deterministic: the receiver recomputes it over the body it read.
pub fn sign_payload(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finished_job() -> Job {
        let mut job = Job::new(
            JobOperation::AddAudio,
            json!({"video_url": "https://cdn.example/v.mp4"}),
            "https://client.example/cb",
            Some(7),
            Some("canal/ep02".to_owned()),
        );
        job.status = JobStatus::Completed;
        job.submitted_at = Some(Utc::now() - chrono::Duration::seconds(90));
        job.completed_at = Some(job.submitted_at.unwrap() + chrono::Duration::seconds(85));
        job.result = Some(json!({"video_url": "https://cdn.example/out.mp4"}));
        job
    }

    #[test]
    fn test_payload_echoes_correlation_tokens() {
        let job = finished_job();
        let payload = WebhookPayload::from_job(&job).unwrap();

        assert_eq!(payload.job_id, job.id);
        assert_eq!(payload.id_roteiro, Some(7));
        assert_eq!(payload.path_raiz.as_deref(), Some("canal/ep02"));
        assert_eq!(payload.status, JobStatus::Completed);
        assert_eq!(payload.execution.duration_ms, 85_000);
        assert!((payload.execution.duration_seconds - 85.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_payload_serializes_with_wire_field_names() {
        let payload = WebhookPayload::from_job(&finished_job()).unwrap();
        let value = serde_json::to_value(&payload).unwrap();

        assert!(value.get("jobId").is_some());
        assert!(value.get("idRoteiro").is_some());
        assert!(value.get("pathRaiz").is_some());
        assert_eq!(value["operation"], "addaudio");
        assert_eq!(value["status"], "COMPLETED");
        assert!(value["execution"].get("durationMs").is_some());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_payload_carries_error_for_failed_jobs() {
        let mut job = finished_job();
        job.status = JobStatus::Failed;
        job.result = None;
        job.error = Some(JobError::timeout("execution exceeded 40 minutes"));

        let payload = WebhookPayload::from_job(&job).unwrap();
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["error"]["code"], "TIMEOUT");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_payload_refused_for_non_terminal_and_cancelled_jobs() {
        let mut job = finished_job();
        job.status = JobStatus::Processing;
        assert!(WebhookPayload::from_job(&job).is_err());

        job.status = JobStatus::Cancelled;
        assert!(WebhookPayload::from_job(&job).is_err());
    }

    #[test]
    fn test_schedule_delays_follow_configuration() {
        let schedule = DeliverySchedule::default();
        assert_eq!(schedule.delay_before(1), None);
        assert_eq!(schedule.delay_before(2), Some(Duration::from_secs(1)));
        assert_eq!(schedule.delay_before(3), Some(Duration::from_secs(5)));
        assert_eq!(schedule.delay_before(4), Some(Duration::from_secs(15)));
        // Attempts past the schedule reuse the last delay.
        assert_eq!(schedule.delay_before(9), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_signature_is_deterministic_and_keyed() {
        let body = r#"{"jobId":"0190f9d8-0000-7000-8000-000000000000"}"#;
        let first = sign_payload("topsecret", body);
        let second = sign_payload("topsecret", body);
        let other_key = sign_payload("othersecret", body);

        assert_eq!(first, second);
        assert_ne!(first, other_key);
        assert!(first.starts_with("sha256="));
        assert_eq!(first.len(), "sha256=".len() + 64);
    }
}
