//! Job API route handlers.
//!
//! Handlers only translate HTTP to `LendingService` calls. Submissions
//! answer `202 Accepted` with the job id; progress is polled via
//! `GET /api/jobs/:job_id`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::LendingService;
use crate::types::{ErrorKind, JobId, JobSnapshot, JobSummary, LendError, LoanPage, LoanStats};

pub type AppState = Arc<LendingService>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct HarvestRequest {
    pub max_pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BidJobRequest {
    pub loan_id: i64,
    pub amount: i64,
    /// `ip` (interest payment) or `dp` (down payment).
    pub payment_option: String,
}

#[derive(Debug, Deserialize)]
pub struct LoansQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_page() -> usize {
    1
}
fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct SubmittedResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: ErrorKind,
}

/// [`LendError`] as an HTTP response.
pub struct ApiError(LendError);

impl From<LendError> for ApiError {
    fn from(err: LendError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

fn accepted(job_id: JobId) -> (StatusCode, Json<SubmittedResponse>) {
    (StatusCode::ACCEPTED, Json(SubmittedResponse { job_id }))
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/jobs/harvest
pub async fn submit_harvest(
    State(service): State<AppState>,
    body: Option<Json<HarvestRequest>>,
) -> Result<(StatusCode, Json<SubmittedResponse>), ApiError> {
    let max_pages = body
        .and_then(|Json(req)| req.max_pages)
        .unwrap_or_else(|| service.default_max_pages());
    Ok(accepted(service.submit_harvest_job(max_pages)?))
}

/// POST /api/jobs/bid
pub async fn submit_bid(
    State(service): State<AppState>,
    Json(req): Json<BidJobRequest>,
) -> Result<(StatusCode, Json<SubmittedResponse>), ApiError> {
    let job_id = service.submit_bid_job(req.loan_id, req.amount, &req.payment_option)?;
    Ok(accepted(job_id))
}

/// POST /api/jobs/analyze/:loan_id
pub async fn submit_analysis(
    State(service): State<AppState>,
    Path(loan_id): Path<i64>,
) -> Result<(StatusCode, Json<SubmittedResponse>), ApiError> {
    Ok(accepted(service.submit_analysis_job(loan_id)?))
}

/// GET /api/jobs
pub async fn list_jobs(State(service): State<AppState>) -> Json<Vec<JobSummary>> {
    Json(service.list_jobs())
}

/// GET /api/jobs/:job_id
pub async fn get_job(
    State(service): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobSnapshot>, ApiError> {
    Ok(Json(service.get_job(job_id)?))
}

/// DELETE /api/jobs/:job_id
pub async fn cancel_job(
    State(service): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<CancelResponse>, ApiError> {
    // Distinguish unknown jobs from jobs that are already terminal.
    service.get_job(job_id)?;
    let cancelled = service.cancel_job(job_id);
    Ok(Json(CancelResponse { job_id, cancelled }))
}

/// GET /api/loans?page=&limit=
pub async fn list_loans(
    State(service): State<AppState>,
    Query(query): Query<LoansQuery>,
) -> Result<Json<LoanPage>, ApiError> {
    Ok(Json(service.stored_loans(query.page, query.limit).await?))
}

/// GET /api/loans/stats
pub async fn loan_stats(State(service): State<AppState>) -> Result<Json<LoanStats>, ApiError> {
    Ok(Json(service.loan_stats().await?))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
