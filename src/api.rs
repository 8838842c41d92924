//! C8 — External API Surface.
//!
//! Four Axum routes under `/api/v1/nl`: the streaming query endpoint plus
//! three small JSON endpoints for popularity and health reporting.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::model::NlRequest;
use crate::pipeline;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/nl/query", post(query))
        .route("/api/v1/nl/queries/top", get(queries_top))
        .route("/api/v1/nl/health", get(health))
        .route("/api/v1/nl/cache/stats", get(cache_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn validate(request: &NlRequest) -> Result<(), AppError> {
    if request.query.trim().is_empty() {
        return Err(AppError::BadRequest("query must not be empty".to_string()));
    }
    if request.query.len() > NlRequest::MAX_QUERY_LEN {
        return Err(AppError::BadRequest(format!(
            "query exceeds maximum length of {} characters",
            NlRequest::MAX_QUERY_LEN
        )));
    }
    Ok(())
}

async fn query(State(state): State<AppState>, Json(request): Json<NlRequest>) -> Response {
    if let Err(e) = validate(&request) {
        return e.into_response();
    }

    let events = pipeline::run(request, state);
    let body_stream = futures::StreamExt::map(events, |event| {
        Ok::<_, std::convert::Infallible>(event.to_frame())
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| AppError::Internal("failed to build stream response".to_string()).into_response())
}

#[derive(serde::Deserialize)]
struct TopQueriesParams {
    #[serde(default = "default_top_limit")]
    limit: usize,
}

fn default_top_limit() -> usize {
    5
}

async fn queries_top(State(state): State<AppState>, Query(params): Query<TopQueriesParams>) -> impl IntoResponse {
    let top = state.cache.popular(params.limit);
    let ranked: Vec<_> = top
        .into_iter()
        .enumerate()
        .map(|(idx, q)| {
            serde_json::json!({
                "rank": idx + 1,
                "query": q.original_query,
                "normalized_query": q.normalized_query,
                "frequency": q.count,
            })
        })
        .collect();
    Json(serde_json::json!({ "top_queries": ranked }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let healthy = state.llm.health_check().await;
    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "service": "llm",
        "models": { "llm_model": state.llm.llm_model() },
    }))
}

async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let top = state.cache.popular(10);
    let popular: Vec<_> = top
        .into_iter()
        .map(|q| serde_json::json!({ "query": q.normalized_query, "count": q.count }))
        .collect();
    Json(serde_json::json!({ "popular_queries": popular }))
}
