//! The control-plane HTTP surface. JSON in, JSON out.
//!
//! Thin handlers: validate the wire form, call the dispatcher or a read
//! facade, map errors onto statuses. Admin operations (quarantine, restore,
//! hard delete, cleanup, quarantined-row reads) are gated by the `x-admin`
//! header — a routing discriminator within the single trust zone, not
//! authentication.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::RanklabError;
use crate::evaluator::Evaluator;
use crate::plan::Plan;
use crate::queue::JobQueue;
use crate::store::Store;
use crate::store::cache::{BrowseFilter, CacheIndex, CacheRow};
use crate::store::tasks::TaskRegistry;
use crate::task::{CleanupSpec, Task, TaskResult, TaskStatus};

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub registry: TaskRegistry,
    pub cache: CacheIndex,
    pub store: Arc<Store>,
    pub queue: Arc<dyn JobQueue>,
    pub evaluator: Arc<dyn Evaluator>,
    pub config: Config,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/evaluate", post(submit_evaluation))
        .route("/tasks/{task_id}", get(get_task).patch(patch_task))
        .route("/leaderboard", get(browse_leaderboard))
        .route("/leaderboard/quarantine", post(quarantine_rows))
        .route("/leaderboard/restore", post(restore_rows))
        .route("/leaderboard/{row_id}", delete(delete_row))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/maintenance/cleanup", post(submit_cleanup))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError(RanklabError);

fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "validation_error" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" | "duplicate_fingerprint_in_flight" => StatusCode::CONFLICT,
        "storage_unavailable" | "queue_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for_kind(self.0.kind());
        let body = serde_json::json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.user_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<RanklabError> for ApiError {
    fn from(e: RanklabError) -> Self {
        Self(e)
    }
}

fn forbidden() -> Response {
    let body = serde_json::json!({
        "error": {"kind": "forbidden", "message": "admin scope required"}
    });
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

fn is_admin(headers: &HeaderMap) -> bool {
    headers.contains_key("x-admin")
}

/// Deserialize a JSON body into a typed value, reporting schema and closed-
/// enum violations as `validation_error` (HTTP 400).
fn parse_body<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(body)
        .map_err(|e| ApiError(RanklabError::Validation(e.to_string())))
}

// ---------------------------------------------------------------------------
// Submission and task lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: String,
    status: TaskStatus,
    cached: bool,
    partial: bool,
    coalesced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<TaskResult>,
}

async fn submit_evaluation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let plan: Plan = parse_body(body)?;
    let outcome = state.dispatcher.submit(plan).await?;

    let status = if outcome.cached && !outcome.partial {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    let response = SubmitResponse {
        task_id: outcome.task_id,
        status: outcome.status,
        cached: outcome.cached,
        partial: outcome.partial,
        coalesced: outcome.coalesced,
        result: outcome.result,
    };
    Ok((status, Json(response)).into_response())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .registry
        .get(&task_id)
        .await
        .map_err(|e| ApiError(e.into_ranklab("")))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct PatchTaskBody {
    action: String,
}

async fn patch_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let body: PatchTaskBody = parse_body(body)?;
    if body.action != "cancel" {
        return Err(ApiError(RanklabError::Validation(format!(
            "unknown action {:?}",
            body.action
        ))));
    }

    let outcome = state.dispatcher.cancel(&task_id).await?;
    if outcome.changed {
        Ok((StatusCode::OK, Json(outcome.task)).into_response())
    } else {
        Err(ApiError(RanklabError::Conflict(format!(
            "task {task_id} is already {}",
            outcome.task.status.as_str()
        ))))
    }
}

// ---------------------------------------------------------------------------
// Leaderboard reads and admin mutations
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct BrowseParams {
    language: Option<String>,
    subject_type: Option<String>,
    task_type: Option<String>,
    model_name: Option<String>,
    score_min: Option<f64>,
    score_max: Option<f64>,
    updated_after: Option<i64>,
    limit: Option<u32>,
    offset: Option<u32>,
    include_quarantined: Option<bool>,
}

#[derive(Debug, Serialize)]
struct BrowseResponse {
    rows: Vec<CacheRow>,
    limit: u32,
    offset: u32,
}

async fn browse_leaderboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<BrowseParams>,
) -> Result<Json<BrowseResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(500);
    let offset = params.offset.unwrap_or(0);
    // Quarantined rows are visible only to admin-scoped callers.
    let include_quarantined =
        params.include_quarantined.unwrap_or(false) && is_admin(&headers);

    let filter = BrowseFilter {
        language: params.language,
        subject_type: params.subject_type,
        task_type: params.task_type,
        model_name: params.model_name,
        score_min: params.score_min,
        score_max: params.score_max,
        updated_after: params.updated_after,
        include_quarantined,
        limit,
        offset,
    };
    let rows = state
        .cache
        .browse(filter)
        .await
        .map_err(|e| ApiError(e.into_ranklab("")))?;
    Ok(Json(BrowseResponse { rows, limit, offset }))
}

#[derive(Debug, Deserialize)]
struct QuarantineBody {
    row_ids: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
}

async fn quarantine_rows(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    if !is_admin(&headers) {
        return Ok(forbidden());
    }
    let body: QuarantineBody = parse_body(body)?;
    let outcome = state
        .cache
        .quarantine(body.row_ids, body.reason)
        .await
        .map_err(|e| ApiError(e.into_ranklab("")))?;
    Ok(Json(outcome).into_response())
}

async fn restore_rows(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    if !is_admin(&headers) {
        return Ok(forbidden());
    }
    let body: QuarantineBody = parse_body(body)?;
    let outcome = state
        .cache
        .restore(body.row_ids)
        .await
        .map_err(|e| ApiError(e.into_ranklab("")))?;
    Ok(Json(outcome).into_response())
}

async fn delete_row(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(row_id): Path<String>,
) -> Result<Response, ApiError> {
    if !is_admin(&headers) {
        return Ok(forbidden());
    }
    let outcome = state
        .cache
        .hard_delete(vec![row_id.clone()])
        .await
        .map_err(|e| ApiError(e.into_ranklab("")))?;
    if outcome.affected == 0 {
        return Err(ApiError(RanklabError::NotFound(format!(
            "leaderboard row {row_id}"
        ))));
    }
    Ok(Json(outcome).into_response())
}

// ---------------------------------------------------------------------------
// Health, stats, maintenance
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    cache: &'static str,
    queue: &'static str,
    evaluator: &'static str,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let cache_ok = state.store.ping().await.is_ok();
    let queue_ok = state.queue.depth().await.is_ok();
    let evaluator_ok = state.evaluator.available();

    let status = if cache_ok && queue_ok && evaluator_ok {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        cache: if cache_ok { "ok" } else { "down" },
        queue: if queue_ok { "ok" } else { "down" },
        evaluator: if evaluator_ok { "available" } else { "unavailable" },
    })
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    tasks: std::collections::BTreeMap<String, u64>,
    in_flight: u64,
    cache_rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    median_recent_task_ms: Option<f64>,
    queue_depth: usize,
    workers: usize,
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let store_stats = state
        .store
        .stats()
        .await
        .map_err(|e| ApiError(e.into_ranklab("")))?;
    let queue_depth = state.queue.depth().await.unwrap_or(0);

    let mut tasks = std::collections::BTreeMap::new();
    let mut in_flight = 0u64;
    for (status, count) in &store_stats.status_counts {
        tasks.insert(status.as_str().to_string(), *count);
        if !status.is_terminal() {
            in_flight += count;
        }
    }

    Ok(Json(StatsResponse {
        tasks,
        in_flight,
        cache_rows: store_stats.cache_rows,
        median_recent_task_ms: store_stats.median_recent_task_ms,
        queue_depth,
        workers: state.config.worker_concurrency,
    }))
}

async fn submit_cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    if !is_admin(&headers) {
        return Ok(forbidden());
    }
    let spec: CleanupSpec = parse_body(body)?;
    let outcome = state.dispatcher.submit_cleanup(spec).await?;
    let response = serde_json::json!({
        "task_id": outcome.task_id,
        "status": outcome.status,
    });
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec() {
        assert_eq!(status_for_kind("validation_error"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_kind("conflict"), StatusCode::CONFLICT);
        assert_eq!(status_for_kind("not_found"), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for_kind("storage_unavailable"),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for_kind("queue_unavailable"),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for_kind("evaluator_fatal"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn admin_header_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_admin(&headers));
        headers.insert("x-admin", "1".parse().unwrap());
        assert!(is_admin(&headers));
    }
}
