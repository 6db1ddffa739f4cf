use crate::cache::CacheStats;
use crate::error::{AppError, AppResult, LoggedJson};
use crate::resilience::{BreakerSnapshot, CircuitState};
use crate::service::{BrandService, Plan, QueueOverview, Submission};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const PLAN_HEADER: &str = "x-plan";

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub briefing: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub queue_length: usize,
    pub open_breakers: usize,
}

/// Routes served under the shared `BrandService`.
pub fn router(service: Arc<BrandService>) -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/queue", get(queue_status))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache", delete(clear_cache))
        .route("/api/breakers", get(breakers))
        .route("/api/breakers/{id}", delete(reset_breaker))
        .route("/health", get(health))
        .with_state(service)
}

fn identity(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation(format!("missing {USER_ID_HEADER} header")))
}

fn plan(headers: &HeaderMap) -> AppResult<Plan> {
    match headers.get(PLAN_HEADER) {
        None => Ok(Plan::default()),
        Some(value) => value
            .to_str()
            .map_err(|_| AppError::Validation(format!("invalid {PLAN_HEADER} header")))?
            .parse(),
    }
}

/// POST /api/generate - Produce a brand kit for a briefing.
pub async fn generate(
    State(service): State<Arc<BrandService>>,
    headers: HeaderMap,
    LoggedJson(body): LoggedJson<GenerateBody>,
) -> AppResult<Json<Submission>> {
    let identity = identity(&headers)?;
    let plan = plan(&headers)?;
    let submission = service.submit(&identity, plan, &body.briefing).await?;
    Ok(Json(submission))
}

/// GET /api/queue - Queue counters and worker status.
pub async fn queue_status(State(service): State<Arc<BrandService>>) -> Json<QueueOverview> {
    Json(service.queue_overview())
}

/// GET /api/cache/stats
pub async fn cache_stats(State(service): State<Arc<BrandService>>) -> Json<CacheStats> {
    Json(service.cache_stats())
}

/// DELETE /api/cache - Drop the caller's cached results.
pub async fn clear_cache(
    State(service): State<Arc<BrandService>>,
    headers: HeaderMap,
) -> AppResult<StatusCode> {
    let identity = identity(&headers)?;
    service.clear_cache(&identity).await;
    tracing::info!(identity = %identity, "cache cleared");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/breakers
pub async fn breakers(
    State(service): State<Arc<BrandService>>,
) -> Json<HashMap<String, BreakerSnapshot>> {
    Json(service.breaker_stats())
}

/// DELETE /api/breakers/{id}
pub async fn reset_breaker(
    State(service): State<Arc<BrandService>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    if service.reset_breaker(&id) {
        tracing::info!(operation_id = %id, "circuit breaker reset");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("breaker {id}")))
    }
}

/// GET /health - Degraded while any breaker is open.
pub async fn health(State(service): State<Arc<BrandService>>) -> Json<HealthResponse> {
    let open_breakers = service
        .breaker_stats()
        .values()
        .filter(|b| b.state == CircuitState::Open)
        .count();

    Json(HealthResponse {
        status: if open_breakers == 0 {
            "ok".into()
        } else {
            "degraded".into()
        },
        queue_length: service.queue_overview().status.queue_length,
        open_breakers,
    })
}
