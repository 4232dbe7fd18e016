//! Dashboard API route handlers.
//!
//! All endpoints return JSON. The supervisor is shared via `Arc`; every
//! command goes through it, so HTTP requests serialize against ticks the
//! same way operator calls do.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::{JobReport, Supervisor};
use crate::types::{Job, StackerError, Trade};

pub type AppState = Arc<Supervisor>;

const DEFAULT_TRADE_LIMIT: u32 = 50;
const MAX_TRADE_LIMIT: u32 = 1000;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// A job plus its derived average price.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub avg_buy_price: f64,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            avg_buy_price: job.avg_buy_price(),
            job,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<u32>,
}

/// Maps job errors onto HTTP status codes.
pub struct ApiError(StackerError);

impl From<StackerError> for ApiError {
    fn from(e: StackerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StackerError::NotFound(_) => StatusCode::NOT_FOUND,
            StackerError::Conflict(_) | StackerError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            StackerError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            StackerError::Corrupt(_) | StackerError::Storage(_) => {
                warn!(error = %self.0, "Dashboard request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/jobs
pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<Vec<JobView>> {
    let jobs = state.list().await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

/// GET /api/jobs/:id
pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobReport> {
    Ok(Json(state.status(&id).await?))
}

/// GET /api/jobs/:id/trades?limit=N
pub async fn get_trades(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TradesQuery>,
) -> ApiResult<Vec<Trade>> {
    state.store().require_job(&id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRADE_LIMIT)
        .min(MAX_TRADE_LIMIT);
    Ok(Json(state.store().list_trades(&id, limit).await?))
}

/// POST /api/jobs/:id/pause
pub async fn pause_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobView> {
    info!(job_id = %id, "Pause requested");
    Ok(Json(state.pause(&id).await?.into()))
}

/// POST /api/jobs/:id/resume
pub async fn resume_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobView> {
    info!(job_id = %id, "Resume requested");
    Ok(Json(state.resume(&id).await?.into()))
}

/// POST /api/jobs/:id/liquidate
pub async fn liquidate_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<JobView> {
    info!(job_id = %id, "Liquidation requested");
    Ok(Json(state.liquidate(&id).await?.into()))
}

/// POST /api/jobs/:id/reset
pub async fn reset_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobView> {
    info!(job_id = %id, "Reset requested");
    Ok(Json(state.reset(&id).await?.into()))
}

/// DELETE /api/jobs/:id
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!(job_id = %id, "Delete requested");
    state.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
