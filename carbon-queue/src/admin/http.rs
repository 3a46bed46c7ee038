use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AdminApi;
use crate::{JobId, JobRecord, JobState, QueueError, QueueStats};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 1000;

/// `QueueError` rendered as a JSON error response
#[derive(Debug)]
pub struct AdminHttpError(pub QueueError);

impl From<QueueError> for AdminHttpError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl AdminHttpError {
    fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            QueueError::UnknownQueue(_) | QueueError::NotFound { .. } => (StatusCode::NOT_FOUND, "NotFound"),
            QueueError::InvalidState { .. } => (StatusCode::CONFLICT, "InvalidState"),
            QueueError::BrokerUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "BrokerUnavailable"),
            QueueError::Config(_) | QueueError::Serialization(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "GeneralError"),
        }
    }
}

impl IntoResponse for AdminHttpError {
    fn into_response(self) -> Response {
        let (status, name) = self.status();
        let body = json!({ "error": name, "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, AdminHttpError>;

#[derive(Debug, Deserialize)]
pub struct Page {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub state: Option<String>,
}

impl Page {
    /// Requested page size, at most `MAX_PAGE`
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE)
    }

    fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub stats: QueueStats,
}

/// Admin routes over `api`; mount under any prefix with `Router::nest`
pub fn router(api: AdminApi) -> Router {
    Router::new()
        .route("/queues", routing::get(list_queues))
        .route("/queues/:name/stats", routing::get(queue_stats))
        .route("/queues/:name/failed", routing::get(failed_jobs))
        .route("/queues/:name/jobs", routing::get(list_jobs))
        .route(
            "/queues/:name/jobs/:id",
            routing::get(get_job).delete(purge_job),
        )
        .route("/queues/:name/jobs/:id/retry", routing::post(retry_job))
        .with_state(api)
}

async fn list_queues(State(api): State<AdminApi>) -> ApiResult<Vec<QueueSummary>> {
    let mut summaries = Vec::new();
    for name in api.list_queues() {
        let stats = api.get_queue_stats(&name).await?;
        summaries.push(QueueSummary { name, stats });
    }
    Ok(Json(summaries))
}

async fn queue_stats(State(api): State<AdminApi>, Path(name): Path<String>) -> ApiResult<QueueStats> {
    Ok(Json(api.get_queue_stats(&name).await?))
}

async fn failed_jobs(
    State(api): State<AdminApi>,
    Path(name): Path<String>,
    Query(page): Query<Page>,
) -> ApiResult<Vec<JobRecord>> {
    let jobs = api
        .list_failed_jobs(&name, page.limit(), page.offset())
        .await?;
    Ok(Json(jobs))
}

async fn list_jobs(
    State(api): State<AdminApi>,
    Path(name): Path<String>,
    Query(page): Query<Page>,
) -> ApiResult<Vec<JobRecord>> {
    let state: JobState = page.state.as_deref().unwrap_or("waiting").parse()?;
    let jobs = api
        .list_jobs(&name, state, page.limit(), page.offset())
        .await?;
    Ok(Json(jobs))
}

async fn get_job(State(api): State<AdminApi>, Path((name, id)): Path<(String, String)>) -> ApiResult<JobRecord> {
    Ok(Json(api.get_job(&name, &JobId::from(id)).await?))
}

async fn retry_job(State(api): State<AdminApi>, Path((name, id)): Path<(String, String)>) -> ApiResult<JobRecord> {
    Ok(Json(api.retry_job(&name, &JobId::from(id)).await?))
}

async fn purge_job(State(api): State<AdminApi>, Path((name, id)): Path<(String, String)>) -> ApiResult<JobRecord> {
    Ok(Json(api.purge_job(&name, &JobId::from(id)).await?))
}
