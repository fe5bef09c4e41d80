//! HTTP request handlers.

use super::AppState;
use crate::db::StoreError;
use crate::scheduler::SchedulerError;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Samples returned by the data endpoint.
const DATA_POINT_LIMIT: usize = 1000;
/// Window used by a manual cleanup request without `days_to_keep`.
const MANUAL_CLEANUP_DAYS: u32 = 7;

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn scheduler_error_response(e: SchedulerError) -> Response {
    let status = match &e {
        SchedulerError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        SchedulerError::InvalidDuration { .. } | SchedulerError::InvalidTarget => StatusCode::BAD_REQUEST,
        SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::Persistence(StoreError::NotFound) => StatusCode::NOT_FOUND,
        SchedulerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn store_error_response(e: StoreError, what: &str) -> Response {
    match e {
        StoreError::NotFound => error_response(StatusCode::NOT_FOUND, format!("{} not found", what)),
        e => {
            tracing::error!("Store failure while reading {}: {}", what, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ============================================================================
// API: Jobs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub target: String,
    pub duration_hours: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

pub async fn handle_create_job(State(state): State<AppState>, Json(req): Json<CreateJobRequest>) -> Response {
    match state.scheduler.create_job(&req.target, req.duration_hours).await {
        Ok(job_id) => (StatusCode::CREATED, Json(CreateJobResponse { job_id })).into_response(),
        Err(e) => scheduler_error_response(e),
    }
}

pub async fn handle_list_jobs(State(state): State<AppState>) -> Response {
    Json(state.scheduler.list_jobs().await).into_response()
}

pub async fn handle_get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.scheduler.get_status(&id).await {
        Some(job) => Json(job).into_response(),
        None => scheduler_error_response(SchedulerError::NotFound(id)),
    }
}

pub async fn handle_stop_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.scheduler.stop_job(&id).await {
        Json(json!({ "success": true })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "job not found or already finished")
    }
}

// ============================================================================
// API: Series
// ============================================================================

/// Parallel arrays, one entry per sample.
#[derive(Debug, Default, Serialize)]
pub struct SeriesData {
    pub timestamps: Vec<DateTime<Utc>>,
    pub response_times: Vec<Option<f64>>,
    pub statuses: Vec<String>,
}

pub async fn handle_job_data(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let samples = match state.store.load_recent_samples(&id, DATA_POINT_LIMIT) {
        Ok(samples) => samples,
        Err(StoreError::NotFound) => {
            // A job that has not flushed its first batch yet.
            if state.scheduler.get_status(&id).await.is_some() {
                return Json(SeriesData::default()).into_response();
            }
            return store_error_response(StoreError::NotFound, "series");
        }
        Err(e) => return store_error_response(e, "series"),
    };

    let mut data = SeriesData::default();
    for s in samples {
        data.response_times.push(s.response_time());
        data.statuses.push(s.status().to_string());
        data.timestamps.push(s.timestamp);
    }
    Json(data).into_response()
}

pub async fn handle_job_report(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.load_report(&id) {
        Ok(report) => Json(report).into_response(),
        Err(e) => store_error_response(e, "report"),
    }
}

pub async fn handle_export(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let path = match state.store.export_spreadsheet(&id) {
        Ok(p) => p,
        Err(e) => return store_error_response(e, "series"),
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let disposition = format!("attachment; filename=\"ping_data_{}.xlsx\"", id);
            (
                [(header::CONTENT_TYPE, XLSX_MIME.to_string()), (header::CONTENT_DISPOSITION, disposition)],
                bytes,
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Failed to read export {}: {}", path.display(), e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn handle_history(State(state): State<AppState>) -> Response {
    match state.store.list_known_jobs() {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => store_error_response(e, "history"),
    }
}

// ============================================================================
// Maintenance
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub days_to_keep: Option<u32>,
}

pub async fn handle_cleanup(State(state): State<AppState>, req: Option<Json<CleanupRequest>>) -> Response {
    let days = req
        .and_then(|Json(r)| r.days_to_keep)
        .unwrap_or(MANUAL_CLEANUP_DAYS);

    match state.scheduler.cleanup_older_than(days).await {
        Ok(summary) => Json(json!({ "success": true, "days_to_keep": days, "summary": summary })).into_response(),
        Err(e) => scheduler_error_response(e),
    }
}

pub async fn handle_health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "healthy",
        "active_jobs": state.scheduler.active_count().await,
        "timestamp": Utc::now(),
    }))
    .into_response()
}
