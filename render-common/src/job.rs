//! # Job
//!
//! The job model shared by the API, the queue manager and the worker monitor.
//! A `Job` tracks one client submission from admission until a terminal state,
//! including the external worker ids it fanned out to and the webhook
//! delivery bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::Visitor, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Enumeration of possible statuses for a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting in the pending queue for enough workers to become available.
    Queued,
    /// Handed off to the external worker service; all external ids recorded.
    Submitted,
    /// At least one external worker reported progress.
    Processing,
    /// All external workers finished and their outputs were aggregated.
    Completed,
    /// The job failed, timed out, or could not be handed off.
    Failed,
    /// Cancelled by the client, or evicted while still queued.
    Cancelled,
}

impl JobStatus {
    /// Terminal states are absorbing: no transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a transition from `self` to `next` moves forward in the DAG.
    ///
    /// `QUEUED -> FAILED` is allowed for jobs that could not be handed off to
    /// the external service at all.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(
                next,
                JobStatus::Submitted | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Submitted => matches!(
                next,
                JobStatus::Processing
                    | JobStatus::Completed
                    | JobStatus::Failed
                    | JobStatus::Cancelled
            ),
            JobStatus::Processing => matches!(
                next,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Submitted => write!(f, "SUBMITTED"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Allow casting JobStatus from strings.
impl FromStr for JobStatus {
    type Err = ParseJobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "SUBMITTED" => Ok(JobStatus::Submitted),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            invalid => Err(ParseJobError::InvalidStatus(invalid.to_owned())),
        }
    }
}

/// Errors raised when parsing job enums from their wire form.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseJobError {
    #[error("{0} is not a valid JobStatus")]
    InvalidStatus(String),
    #[error("{0} is not a valid JobOperation")]
    InvalidOperation(String),
}

/// Which worker pool an operation is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRoute {
    /// The external GPU worker service.
    Gpu,
    /// The local CPU worker service, for VPS-routed operations.
    Cpu,
}

/// The closed set of media operations this orchestrator accepts.
///
/// The `_vps` twins are routing discriminators only: they run the same
/// pipeline on the local CPU worker instead of the GPU service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOperation {
    Img2Vid,
    Caption,
    CaptionSegments,
    AddAudio,
    LoopVideo,
    AudioMix,
    Img2VidVps,
    CaptionVps,
    CaptionSegmentsVps,
    AddAudioVps,
    LoopVideoVps,
    AudioMixVps,
}

impl JobOperation {
    pub fn route(&self) -> WorkerRoute {
        match self {
            JobOperation::Img2Vid
            | JobOperation::Caption
            | JobOperation::CaptionSegments
            | JobOperation::AddAudio
            | JobOperation::LoopVideo
            | JobOperation::AudioMix => WorkerRoute::Gpu,
            JobOperation::Img2VidVps
            | JobOperation::CaptionVps
            | JobOperation::CaptionSegmentsVps
            | JobOperation::AddAudioVps
            | JobOperation::LoopVideoVps
            | JobOperation::AudioMixVps => WorkerRoute::Cpu,
        }
    }

    /// Image-to-video is the only operation whose payload may be split
    /// across multiple workers.
    pub fn is_splittable(&self) -> bool {
        matches!(self, JobOperation::Img2Vid | JobOperation::Img2VidVps)
    }

    /// Rough wall-time hint surfaced in the submission response.
    pub fn estimated_time(&self) -> &'static str {
        match self {
            JobOperation::Img2Vid | JobOperation::Img2VidVps => "~5 minutes",
            JobOperation::Caption | JobOperation::CaptionVps => "~3 minutes",
            JobOperation::CaptionSegments | JobOperation::CaptionSegmentsVps => "~3 minutes",
            JobOperation::AddAudio | JobOperation::AddAudioVps => "~2 minutes",
            JobOperation::LoopVideo | JobOperation::LoopVideoVps => "~2 minutes",
            JobOperation::AudioMix | JobOperation::AudioMixVps => "~1 minute",
        }
    }
}

impl fmt::Display for JobOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobOperation::Img2Vid => "img2vid",
            JobOperation::Caption => "caption",
            JobOperation::CaptionSegments => "caption_segments",
            JobOperation::AddAudio => "addaudio",
            JobOperation::LoopVideo => "loopvideo",
            JobOperation::AudioMix => "audiomix",
            JobOperation::Img2VidVps => "img2vid_vps",
            JobOperation::CaptionVps => "caption_vps",
            JobOperation::CaptionSegmentsVps => "caption_segments_vps",
            JobOperation::AddAudioVps => "addaudio_vps",
            JobOperation::LoopVideoVps => "loopvideo_vps",
            JobOperation::AudioMixVps => "audiomix_vps",
        };
        write!(f, "{}", name)
    }
}

/// Allow casting JobOperation from its wire name.
impl FromStr for JobOperation {
    type Err = ParseJobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "img2vid" => Ok(JobOperation::Img2Vid),
            "caption" => Ok(JobOperation::Caption),
            "caption_segments" => Ok(JobOperation::CaptionSegments),
            "addaudio" => Ok(JobOperation::AddAudio),
            "loopvideo" => Ok(JobOperation::LoopVideo),
            "audiomix" => Ok(JobOperation::AudioMix),
            "img2vid_vps" => Ok(JobOperation::Img2VidVps),
            "caption_vps" => Ok(JobOperation::CaptionVps),
            "caption_segments_vps" => Ok(JobOperation::CaptionSegmentsVps),
            "addaudio_vps" => Ok(JobOperation::AddAudioVps),
            "loopvideo_vps" => Ok(JobOperation::LoopVideoVps),
            "audiomix_vps" => Ok(JobOperation::AudioMixVps),
            invalid => Err(ParseJobError::InvalidOperation(invalid.to_owned())),
        }
    }
}

struct JobOperationVisitor;

impl Visitor<'_> for JobOperationVisitor {
    type Value = JobOperation;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "the wire name of a JobOperation")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        JobOperation::from_str(s).map_err(|_| {
            serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self)
        })
    }
}

impl<'de> Deserialize<'de> for JobOperation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(JobOperationVisitor)
    }
}

impl Serialize for JobOperation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Machine-readable failure categories carried in webhook `error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    SsrfRejected,
    SubmissionError,
    ProcessingError,
    CancelledByExternal,
    Timeout,
    WebhookUndeliverable,
}

/// A failure recorded on a job and mirrored into its terminal webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn submission(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SubmissionError, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProcessingError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn cancelled_by_external(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CancelledByExternal, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One client submission, durably tracked from admission to terminal state.
///
/// Serialized as-is into the `jobs:{id}` keyspace of the durable backend, so
/// field names are the wire names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub operation: JobOperation,
    pub status: JobStatus,
    /// Opaque request body, validated upstream and forwarded to workers.
    pub payload: Value,
    pub webhook_url: String,
    /// External worker ids in submission order; 2 or more for split jobs.
    /// Append-only until the job is terminal.
    #[serde(default)]
    pub external_ids: Vec<String>,
    /// Count currently deducted from the global worker budget for this job.
    #[serde(default)]
    pub workers_reserved: u32,
    /// How many external sub-jobs have finished, for progress reporting.
    #[serde(default)]
    pub subjobs_completed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Client correlation token, echoed unchanged into the webhook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_roteiro: Option<i64>,
    /// Client routing string, echoed unchanged into the webhook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_raiz: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Processing attempts. Sub-jobs are not retried individually, so this
    /// is 0 before hand-off and 1 after.
    #[serde(default)]
    pub attempts: u32,
    /// Webhook delivery attempts performed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Set once a webhook POST was answered with a 2xx.
    #[serde(default)]
    pub webhook_delivered: bool,
}

impl Job {
    pub fn new(
        operation: JobOperation,
        payload: Value,
        webhook_url: impl Into<String>,
        id_roteiro: Option<i64>,
        path_raiz: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            operation,
            status: JobStatus::Queued,
            payload,
            webhook_url: webhook_url.into(),
            external_ids: Vec::new(),
            workers_reserved: 0,
            subjobs_completed: 0,
            result: None,
            error: None,
            id_roteiro,
            path_raiz,
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
            attempts: 0,
            retry_count: 0,
            webhook_delivered: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether this job still owes its client a terminal webhook.
    pub fn webhook_outstanding(&self, max_attempts: u32) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
            && !self.webhook_delivered
            && self.retry_count < max_attempts
    }
}

/// Counters returned by `GET /queue/stats` and the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: u64,
    pub submitted: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub active_workers: u32,
    pub available_workers: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_dag_moves_forward_only() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Submitted));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));

        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Submitted));
        assert!(!JobStatus::Submitted.can_transition_to(JobStatus::Queued));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobStatus::Queued));
            assert!(!terminal.can_transition_to(JobStatus::Processing));
            assert!(!terminal.can_transition_to(JobStatus::Completed));
        }
    }

    #[test]
    fn test_status_round_trips_through_wire_name() {
        for status in [
            JobStatus::Queued,
            JobStatus::Submitted,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(&status.to_string()), Ok(status));
        }
        assert!(JobStatus::from_str("RUNNING").is_err());
    }

    #[test]
    fn test_operation_routing_and_split_eligibility() {
        assert_eq!(JobOperation::Img2Vid.route(), WorkerRoute::Gpu);
        assert_eq!(JobOperation::Img2VidVps.route(), WorkerRoute::Cpu);
        assert_eq!(JobOperation::AudioMixVps.route(), WorkerRoute::Cpu);

        assert!(JobOperation::Img2Vid.is_splittable());
        assert!(JobOperation::Img2VidVps.is_splittable());
        assert!(!JobOperation::AddAudio.is_splittable());
        assert!(!JobOperation::Caption.is_splittable());
    }

    #[test]
    fn test_operation_serde_uses_wire_names() {
        let json = serde_json::to_string(&JobOperation::CaptionSegmentsVps).unwrap();
        assert_eq!(json, r#""caption_segments_vps""#);

        let parsed: JobOperation = serde_json::from_str(r#""img2vid""#).unwrap();
        assert_eq!(parsed, JobOperation::Img2Vid);

        assert!(serde_json::from_str::<JobOperation>(r#""transcode""#).is_err());
    }

    #[test]
    fn test_job_record_round_trips_through_json() {
        let mut job = Job::new(
            JobOperation::Img2Vid,
            serde_json::json!({"images": ["a.png", "b.png"]}),
            "https://client.example/hooks/render",
            Some(42),
            Some("canal/ep01".to_owned()),
        );
        job.external_ids = vec!["ext-1".to_owned(), "ext-2".to_owned()];
        job.workers_reserved = 2;

        let serialized = serde_json::to_string(&job).unwrap();
        let restored: Job = serde_json::from_str(&serialized).unwrap();

        assert_eq!(restored.id, job.id);
        assert_eq!(restored.operation, JobOperation::Img2Vid);
        assert_eq!(restored.status, JobStatus::Queued);
        assert_eq!(restored.external_ids, job.external_ids);
        assert_eq!(restored.workers_reserved, 2);
        assert_eq!(restored.id_roteiro, Some(42));
        assert_eq!(restored.path_raiz.as_deref(), Some("canal/ep01"));
    }

    #[test]
    fn test_webhook_outstanding_rules() {
        let mut job = Job::new(
            JobOperation::AddAudio,
            serde_json::json!({}),
            "https://client.example/cb",
            None,
            None,
        );
        assert!(!job.webhook_outstanding(4)); // not terminal yet

        job.status = JobStatus::Completed;
        assert!(job.webhook_outstanding(4));

        job.retry_count = 4;
        assert!(!job.webhook_outstanding(4)); // attempts exhausted

        job.retry_count = 1;
        job.webhook_delivered = true;
        assert!(!job.webhook_outstanding(4));

        job.webhook_delivered = false;
        job.status = JobStatus::Cancelled;
        assert!(!job.webhook_outstanding(4)); // cancellation sends no webhook
    }
}
