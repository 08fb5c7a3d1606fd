//! Worker HTTP surface: status/health/drain plus the thin ingress routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::runtime::WorkerRuntime;
use crate::ingress::{CreateJobRequest, Ingress, IngressError};
use crate::jobs::InsertOutcome;
use crate::rate_limit::RateLimitHeaders;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<WorkerRuntime>,
    pub ingress: Arc<Ingress>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/worker/status", get(worker_status))
        .route("/worker/health", get(worker_health))
        .route("/worker/drain", post(worker_drain))
        .route("/jobs", post(create_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/resolution", post(submit_resolution))
        .layer(tower::ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn worker_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.status_report())
}

/// 200 only when the worker is idle and accepting work; load balancers
/// route new jobs away from busy or draining workers.
fn health_code(idle: bool, draining: bool) -> StatusCode {
    if idle && !draining {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn worker_health(State(state): State<AppState>) -> impl IntoResponse {
    let idle = state.runtime.is_idle();
    let draining = state.runtime.is_draining();
    let status = if draining {
        "draining"
    } else if idle {
        "idle"
    } else {
        "busy"
    };
    (health_code(idle, draining), Json(json!({ "status": status })))
}

async fn worker_drain(State(state): State<AppState>) -> impl IntoResponse {
    state.runtime.begin_drain().await;
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "draining",
            "active_jobs": state.runtime.active_jobs().count(),
        })),
    )
}

fn rate_header_map(headers: &RateLimitHeaders) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.pairs() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Response {
    match state.ingress.create_job(request).await {
        Ok(response) => {
            let headers = response
                .rate_headers
                .as_ref()
                .map(rate_header_map)
                .unwrap_or_default();
            let (code, job, duplicate) = match &response.outcome {
                InsertOutcome::Created(job) => (StatusCode::CREATED, job, false),
                InsertOutcome::Duplicate(job) => (StatusCode::OK, job, true),
            };
            let body = Json(json!({
                "id": job.id,
                "status": job.status.as_str(),
                "duplicate": duplicate,
            }));
            (code, headers, body).into_response()
        }
        Err(IngressError::Invalid(message)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
        Err(IngressError::RateLimited(denied)) => {
            let headers = rate_header_map(&denied.headers);
            (
                StatusCode::TOO_MANY_REQUESTS,
                headers,
                Json(json!({ "error": denied.to_string() })),
            )
                .into_response()
        }
        Err(IngressError::Internal(e)) => {
            tracing::error!(error = %e, "job creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Response {
    match state.ingress.cancel_job(job_id).await {
        Ok(true) => Json(json!({ "cancelled": true })).into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({ "cancelled": false, "error": "job is terminal or unknown" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "cancel failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResolutionRequest {
    resolution_type: String,
    #[serde(default)]
    resolution_data: Option<serde_json::Value>,
    #[serde(default = "default_resolved_by")]
    resolved_by: String,
}

fn default_resolved_by() -> String {
    "operator".to_string()
}

async fn submit_resolution(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<SubmitResolutionRequest>,
) -> Response {
    match state
        .ingress
        .submit_resolution(
            job_id,
            &request.resolution_type,
            request.resolution_data,
            &request.resolved_by,
        )
        .await
    {
        Ok(true) => Json(json!({ "accepted": true })).into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({ "accepted": false, "error": "job is not paused" })),
        )
            .into_response(),
        Err(IngressError::Invalid(message)) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "resolution submission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_is_200_only_when_idle_and_not_draining() {
        assert_eq!(health_code(true, false), StatusCode::OK);
        assert_eq!(health_code(false, false), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(health_code(true, true), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(health_code(false, true), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn rate_headers_become_http_headers() {
        let headers = RateLimitHeaders {
            limit: 5,
            remaining: 2,
            reset_at: chrono::Utc::now(),
            retry_after: None,
        };
        let map = rate_header_map(&headers);
        assert_eq!(map.get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(map.get("x-ratelimit-remaining").unwrap(), "2");
        assert!(map.get("retry-after").is_none());
    }
}
