use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{self, MethodRouter};
use axum::Json;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use render_common::job::{ErrorCode, JobOperation};
use render_common::ssrf::WebhookUrlError;

use crate::service::{ServiceError, SubmitRequest};

use super::AppState;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
}

/// `axum::Json` with its rejections folded into the same `{error, code}`
/// envelope every handler produces: a malformed or incomplete submission
/// body is a 400 `VALIDATION_ERROR`, not axum's bare 422.
pub(crate) struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: rejection.body_text(),
                    code: Some(ErrorCode::ValidationError),
                }),
            )
                .into_response()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    message: String,
    job_id: Uuid,
}

/// Build the POST handler for one operation's submission endpoint.
pub(crate) fn submit_route(operation: JobOperation) -> MethodRouter<AppState> {
    routing::post(
        move |State(state): State<AppState>, ApiJson(request): ApiJson<SubmitRequest>| async move {
            match state.service.create_job(operation, request).await {
                Ok(response) => (StatusCode::ACCEPTED, Json(response)).into_response(),
                Err(err) => error_response(err),
            }
        },
    )
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match state.service.job_status(job_id).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match state.service.cancel_job(job_id).await {
        Ok(()) => Json(CancelResponse {
            message: "job cancelled".to_owned(),
            job_id,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn queue_stats(State(state): State<AppState>) -> Response {
    match state.service.queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) fn error_response(err: ServiceError) -> Response {
    let (status, code) = match &err {
        ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, None),
        ServiceError::AlreadyTerminal { .. } => {
            (StatusCode::BAD_REQUEST, Some(ErrorCode::ValidationError))
        }
        ServiceError::InvalidWebhook(reason) => {
            let code = match reason {
                WebhookUrlError::ForbiddenHost(_) | WebhookUrlError::ForbiddenScheme(_) => {
                    ErrorCode::SsrfRejected
                }
                _ => ErrorCode::ValidationError,
            };
            (StatusCode::BAD_REQUEST, Some(code))
        }
        ServiceError::Store(store_error) => {
            error!("queue backend failure: {}", store_error);
            (StatusCode::SERVICE_UNAVAILABLE, None)
        }
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            code,
        }),
    )
        .into_response()
}
