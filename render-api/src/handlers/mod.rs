use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{middleware, routing, Json, Router};
use tower_http::limit::RequestBodyLimitLayer;

use render_common::health::LivenessRegistry;
use render_common::job::JobOperation;

use crate::service::JobService;

pub mod admin;
pub mod jobs;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
    pub liveness: LivenessRegistry,
    pub api_key: Option<String>,
}

pub fn add_routes(router: Router, state: AppState, max_body_size: usize) -> Router {
    let open = Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(liveness))
        .route("/health", routing::get(admin::health));

    let protected = Router::new()
        // One submission endpoint per operation; the /vps twins run on the
        // local CPU worker.
        .route("/video/img2vid", jobs::submit_route(JobOperation::Img2Vid))
        .route("/video/caption", jobs::submit_route(JobOperation::Caption))
        .route(
            "/video/caption_segments",
            jobs::submit_route(JobOperation::CaptionSegments),
        )
        .route("/video/addaudio", jobs::submit_route(JobOperation::AddAudio))
        .route("/video/loopvideo", jobs::submit_route(JobOperation::LoopVideo))
        .route("/audio/audiomix", jobs::submit_route(JobOperation::AudioMix))
        .route(
            "/vps/video/img2vid",
            jobs::submit_route(JobOperation::Img2VidVps),
        )
        .route(
            "/vps/video/caption",
            jobs::submit_route(JobOperation::CaptionVps),
        )
        .route(
            "/vps/video/caption_segments",
            jobs::submit_route(JobOperation::CaptionSegmentsVps),
        )
        .route(
            "/vps/video/addaudio",
            jobs::submit_route(JobOperation::AddAudioVps),
        )
        .route(
            "/vps/video/loopvideo",
            jobs::submit_route(JobOperation::LoopVideoVps),
        )
        .route(
            "/vps/audio/audiomix",
            jobs::submit_route(JobOperation::AudioMixVps),
        )
        .route("/jobs/:job_id", routing::get(jobs::job_status))
        .route("/jobs/:job_id/cancel", routing::post(jobs::cancel_job))
        .route("/queue/stats", routing::get(jobs::queue_stats))
        .route(
            "/admin/recover-workers",
            routing::post(admin::recover_workers),
        )
        .route("/admin/workers/status", routing::get(admin::workers_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(RequestBodyLimitLayer::new(max_body_size));

    router
        .merge(open.with_state(state.clone()))
        .merge(protected.with_state(state))
}

pub async fn index() -> &'static str {
    "render orchestrator api"
}

async fn liveness(State(state): State<AppState>) -> Response {
    state.liveness.status().into_response()
}

/// Every endpoint except health and liveness sits behind the api key.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "missing or invalid api key" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{self, Request, StatusCode};
    use http_body_util::BodyExt; // for `collect`
    use serde_json::{json, Value};
    use tokio::sync::Notify;
    use tower::ServiceExt; // for `oneshot`
    use uuid::Uuid;

    use render_common::job::JobStatus;
    use render_common::store::{JobPatch, JobStore, MemoryJobStore};
    use render_worker::external::{
        DispatchError, ExternalJobState, WorkerClient, WorkerRouter,
    };

    struct StubWorkerClient;

    #[async_trait]
    impl WorkerClient for StubWorkerClient {
        async fn submit(
            &self,
            _operation: JobOperation,
            _payload: &Value,
        ) -> Result<String, DispatchError> {
            Ok("stub-1".to_owned())
        }

        async fn status(&self, external_id: &str) -> Result<ExternalJobState, DispatchError> {
            Err(DispatchError::NotFound(external_id.to_owned()))
        }

        async fn cancel(&self, _external_id: &str) -> Result<(), DispatchError> {
            Ok(())
        }

        async fn health(&self) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn test_app(api_key: Option<&str>) -> (Router, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new(3));
        let stub = Arc::new(StubWorkerClient);
        let workers = Arc::new(WorkerRouter::new(stub.clone(), stub));
        let service = Arc::new(JobService::new(
            store.clone(),
            workers,
            Arc::new(Notify::new()),
            3,
        ));
        let state = AppState {
            service,
            liveness: LivenessRegistry::new(),
            api_key: api_key.map(str::to_owned),
        };
        (add_routes(Router::new(), state, 1_000_000), store)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn submission_body() -> Value {
        // A public test-net literal keeps SSRF validation off the resolver.
        json!({
            "webhook_url": "https://203.0.113.10/hooks/render",
            "path": "canal/ep05",
            "id_roteiro": 3,
            "audio_url": "https://cdn.example/audio.mp3",
            "video_url": "https://cdn.example/video.mp4",
        })
    }

    #[tokio::test]
    async fn test_index() {
        let (app, _store) = test_app(None);

        let response = app.oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"render orchestrator api");
    }

    #[tokio::test]
    async fn test_submission_is_accepted_and_queued() {
        let (app, store) = test_app(None);

        let response = app
            .oneshot(post_json("/video/addaudio", submission_body()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "QUEUED");
        assert_eq!(body["operation"], "addaudio");
        assert_eq!(body["queuePosition"], 1);
        assert_eq!(body["idRoteiro"], 3);
        let job_id: Uuid = serde_json::from_value(body["jobId"].clone()).unwrap();
        assert_eq!(body["statusUrl"], format!("/jobs/{}", job_id));

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.path_raiz.as_deref(), Some("canal/ep05"));
        assert_eq!(job.payload["path"], "canal/ep05");
        assert_eq!(job.payload["audio_url"], "https://cdn.example/audio.mp3");
        // The shared envelope fields stay out of the worker payload.
        assert!(job.payload.get("webhook_url").is_none());
    }

    #[tokio::test]
    async fn test_vps_routes_map_to_the_cpu_operations() {
        let (app, _store) = test_app(None);

        let response = app
            .oneshot(post_json("/vps/video/img2vid", submission_body()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["operation"], "img2vid_vps");
    }

    #[tokio::test]
    async fn test_localhost_webhook_is_rejected_synchronously() {
        let (app, store) = test_app(None);
        let mut body = submission_body();
        body["webhook_url"] = json!("http://localhost:9000/x");

        let response = app
            .oneshot(post_json("/video/addaudio", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "SSRF_REJECTED");
        assert_eq!(store.queue_stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_private_ip_webhook_is_rejected() {
        let (app, _store) = test_app(None);
        let mut body = submission_body();
        body["webhook_url"] = json!("http://192.168.1.20/cb");

        let response = app
            .oneshot(post_json("/video/addaudio", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "SSRF_REJECTED");
    }

    #[tokio::test]
    async fn test_submission_missing_required_fields() {
        let (app, _store) = test_app(None);

        let response = app
            .oneshot(post_json("/video/addaudio", json!({"audio_url": "x"})))
            .await
            .unwrap();

        // Incomplete bodies are a validation failure, in the same error
        // envelope as every other rejection.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_submission_body_not_json() {
        let (app, _store) = test_app(None);

        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/video/addaudio")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_job_is_a_404() {
        let (app, _store) = test_app(None);

        let response = app
            .oneshot(get(&format!("/jobs/{}", Uuid::now_v7())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_reports_split_progress() {
        let (app, store) = test_app(None);

        let response = app
            .clone()
            .oneshot(post_json("/video/img2vid", submission_body()))
            .await
            .unwrap();
        let job_id: Uuid =
            serde_json::from_value(body_json(response).await["jobId"].clone()).unwrap();

        store
            .update_job(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Submitted),
                    external_ids: Some(vec![
                        "ext-1".to_owned(),
                        "ext-2".to_owned(),
                        "ext-3".to_owned(),
                    ]),
                    workers_reserved: Some(3),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        store
            .update_job(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Processing),
                    subjobs_completed: Some(1),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let response = app.oneshot(get(&format!("/jobs/{}", job_id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "PROCESSING");
        assert_eq!(
            body["progress"],
            json!({"completed": 1, "total": 3, "percentage": 33})
        );
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_in_effect() {
        let (app, store) = test_app(None);

        let response = app
            .clone()
            .oneshot(post_json("/video/addaudio", submission_body()))
            .await
            .unwrap();
        let job_id: Uuid =
            serde_json::from_value(body_json(response).await["jobId"].clone()).unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/jobs/{}/cancel", job_id),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            store.get_job(job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
        // The queue no longer holds it.
        assert!(store.dequeue_pending().await.unwrap().is_none());

        // Cancelling a terminal job is a 400 no-op.
        let response = app
            .oneshot(post_json(
                &format!("/jobs/{}/cancel", job_id),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            store.get_job(job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancelling_a_submitted_job_releases_its_workers() {
        let (app, store) = test_app(None);

        let response = app
            .clone()
            .oneshot(post_json("/video/addaudio", submission_body()))
            .await
            .unwrap();
        let job_id: Uuid =
            serde_json::from_value(body_json(response).await["jobId"].clone()).unwrap();

        assert!(store.reserve_workers(1).await.unwrap());
        store.remove_pending(job_id).await.unwrap();
        store
            .update_job(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Submitted),
                    external_ids: Some(vec!["ext-1".to_owned()]),
                    workers_reserved: Some(1),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(
                &format!("/jobs/{}/cancel", job_id),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cancelled = store.get_job(job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.workers_reserved, 0);
        assert_eq!(store.queue_stats().await.unwrap().available_workers, 3);
    }

    #[tokio::test]
    async fn test_queue_stats_endpoint() {
        let (app, _store) = test_app(None);

        let response = app.oneshot(get("/queue/stats")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["availableWorkers"], 3);
        assert_eq!(body["activeWorkers"], 0);
        assert_eq!(body["queued"], 0);
    }

    #[tokio::test]
    async fn test_admin_recover_workers_endpoint() {
        let (app, _store) = test_app(None);

        let response = app
            .oneshot(post_json("/admin/recover-workers", json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["recoveredWorkers"], 0);
    }

    #[tokio::test]
    async fn test_admin_workers_status_endpoint() {
        let (app, _store) = test_app(None);

        let response = app.oneshot(get("/admin/workers/status")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["maxWorkers"], 3);
        assert_eq!(body["gpuService"], "ok");
        assert_eq!(body["cpuService"], "ok");
    }

    #[tokio::test]
    async fn test_health_reports_queue_counters() {
        let (app, _store) = test_app(Some("sekret"));

        // Health stays open even when the api key gate is on.
        let response = app.oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"]["availableWorkers"], 3);
    }

    #[tokio::test]
    async fn test_api_key_gate() {
        let (app, _store) = test_app(Some("sekret"));

        let response = app
            .clone()
            .oneshot(get("/queue/stats"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/queue/stats")
                    .header("x-api-key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/queue/stats")
                    .header("x-api-key", "sekret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
