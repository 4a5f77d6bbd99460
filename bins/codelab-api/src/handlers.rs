// HTTP route handlers for the Codelab API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use codelab_common::{
    AcceptedResponse, ErrorKind, ErrorResponse, Language, StatusResponse, SubmissionStatus,
    SubmitRequest, VerdictResponse,
};
use codelab_engine::{EngineError, StatusSnapshot, SubmissionState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    #[serde(default)]
    pub mode: SubmitMode,
}

#[derive(Debug, Serialize)]
pub struct LanguageInfo {
    pub name: Language,
    pub version: String,
    pub image: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub isolation: &'static str,
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub uptime_secs: i64,
}

fn error_response(status: StatusCode, body: ErrorResponse) -> Response {
    metrics::record_rejection(body.error_kind);
    (status, Json(body)).into_response()
}

fn engine_error(err: &EngineError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, err.to_response())
}

fn status_body(snapshot: StatusSnapshot) -> StatusResponse {
    StatusResponse {
        status: snapshot.status,
        verdict: snapshot.verdict.map(|v| v.redacted()),
        message: snapshot.failure,
    }
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new(ErrorKind::InvalidSubmission, format!("invalid submission id '{}'", raw)),
        )
    })
}

/// POST /submissions - Submit code for verification
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SubmitParams>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(ErrorKind::InvalidSubmission, rejection.body_text()),
            );
        }
    };

    let handle = match state
        .service
        .submit(&request.challenge_id, &request.language, &request.source_code)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            info!(challenge_id = %request.challenge_id, error = %e, "Submission rejected");
            return engine_error(&e);
        }
    };

    let language = handle.language;
    let mode = match params.mode {
        SubmitMode::Sync => "sync",
        SubmitMode::Async => "async",
    };
    metrics::SUBMISSIONS_TOTAL.with_label_values(&[&language.to_string(), mode]).inc();
    let submission_id = handle.id;

    if params.mode == SubmitMode::Async {
        tokio::spawn(async move {
            if let SubmissionState::Completed(verdict) = handle.wait().await {
                metrics::record_verdict(language, &verdict);
            }
        });

        info!(submission_id = %submission_id, "Submission queued");
        return (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                submission_id,
                status: SubmissionStatus::Queued,
            }),
        )
            .into_response();
    }

    match handle.wait().await {
        SubmissionState::Completed(verdict) => {
            metrics::record_verdict(language, &verdict);
            let status = if verdict.is_unrunnable() {
                warn!(submission_id = %submission_id, "No test case could be run");
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            info!(
                submission_id = %submission_id,
                passed = verdict.overall_passed,
                score = verdict.aggregate_score,
                "Verdict ready"
            );
            (status, Json(VerdictResponse { verdict: verdict.redacted() })).into_response()
        }
        SubmissionState::Cancelled(_) => engine_error(&EngineError::Cancelled(submission_id)),
        SubmissionState::Failed(reason) => {
            error!(submission_id = %submission_id, reason = %reason, "Submission failed");
            engine_error(&EngineError::Infrastructure(reason))
        }
        other => engine_error(&EngineError::Infrastructure(format!(
            "submission {} stopped in state {}",
            submission_id,
            other.status()
        ))),
    }
}

/// GET /submissions/{id} - Poll a submission
pub async fn get_submission(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.service.get_status(id) {
        Ok(snapshot) => (StatusCode::OK, Json(status_body(snapshot))).into_response(),
        Err(e) => engine_error(&e),
    }
}

/// DELETE /submissions/{id} - Cancel a submission
pub async fn cancel_submission(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.service.cancel(id).await {
        Ok(snapshot) => {
            info!(submission_id = %id, status = %snapshot.status, "Cancellation requested");
            (StatusCode::OK, Json(status_body(snapshot))).into_response()
        }
        Err(e) => engine_error(&e),
    }
}

/// GET /languages - Languages this deployment runs
pub async fn list_languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let languages: Vec<LanguageInfo> = state
        .service
        .scheduler()
        .languages()
        .into_iter()
        .filter_map(|language| {
            let config = state.languages.get_config(&language).ok()?;
            Some(LanguageInfo {
                name: language,
                version: config.version.clone(),
                image: config.image.clone(),
            })
        })
        .collect();

    (StatusCode::OK, Json(languages))
}

/// GET /health - Liveness and pool occupancy
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.service.stats();
    let scheduler = state.service.scheduler();

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            isolation: scheduler.isolation_backend(),
            queued: stats.queued,
            running: stats.running,
            max_concurrent: scheduler.max_concurrent(),
            uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        }),
    )
}

/// GET /metrics - Prometheus text exposition
pub async fn export_metrics(State(state): State<Arc<AppState>>) -> Response {
    metrics::observe_scheduler(&state.service.stats());

    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
