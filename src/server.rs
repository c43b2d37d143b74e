//! Web server module for CeruleanLog.
//!
//! A thin adapter over the core: `POST /gelf` feeds `add_message`,
//! `GET /query` feeds `query`. Storage calls run on the blocking pool
//! because the synchronous-write mode and the fan-out query both touch
//! disk.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::gelf::parse_gelf;
use crate::instance::CeruleanInstance;
use crate::storage::QueryRow;

/// Default limit for query results.
const DEFAULT_QUERY_LIMIT: u32 = 1_000;

/// Maximum limit for query results.
const MAX_QUERY_LIMIT: u32 = 10_000;

/// Wire format for query time bounds, interpreted as UTC.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub instance: Arc<CeruleanInstance>,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

/// Default JSON envelope for ingest responses and errors.
#[derive(Debug, Serialize)]
struct DefaultResponse {
    ok: bool,
    message: String,
}

/// Query response envelope.
#[derive(Debug, Serialize)]
struct QueryResponse {
    ok: bool,
    result: Vec<QueryRow>,
}

/// Query parameters for the query API.
#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub time_from: Option<String>,
    pub time_to: Option<String>,
    pub query: Option<String>,
    pub limit: Option<u32>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/gelf", post(gelf_handler))
        .route("/query", get(query_handler))
        .route("/api/health", get(health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Health check endpoint.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GELF ingest endpoint.
async fn gelf_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let msg = match parse_gelf(&body) {
        Ok(msg) => msg,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("error parsing GELF message: {e}"),
            );
        }
    };

    let instance = Arc::clone(&state.instance);
    match tokio::task::spawn_blocking(move || instance.add_message(msg)).await {
        Ok(Ok(())) => Json(DefaultResponse {
            ok: true,
            message: "Saved.".to_string(),
        })
        .into_response(),
        Ok(Err(e)) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("error ingesting message: {e}"),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ingest task failed: {e}"),
        ),
    }
}

/// Time-range query endpoint.
async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Response {
    let Some(time_from) = params.time_from.as_deref().and_then(parse_time) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing or invalid time_from".to_string(),
        );
    };
    let Some(time_to) = params.time_to.as_deref().and_then(parse_time) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing or invalid time_to".to_string(),
        );
    };
    let predicate = params.query.unwrap_or_default();
    let limit = params
        .limit
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .min(MAX_QUERY_LIMIT);

    let instance = Arc::clone(&state.instance);
    let result =
        tokio::task::spawn_blocking(move || instance.query(time_from, time_to, limit, &predicate))
            .await;

    match result {
        Ok(Ok(rows)) => Json(QueryResponse {
            ok: true,
            result: rows,
        })
        .into_response(),
        Ok(Err(e)) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("query failed: {e}"),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("query task failed: {e}"),
        ),
    }
}

/// Parse a `YYYY-MM-DDThh:mm` wire timestamp as UTC Unix seconds.
fn parse_time(s: &str) -> Option<u32> {
    let t = NaiveDateTime::parse_from_str(s, TIME_FORMAT).ok()?;
    u32::try_from(t.and_utc().timestamp()).ok()
}

fn error_response(code: StatusCode, message: String) -> Response {
    tracing::warn!(%code, message, "request failed");
    (
        code,
        Json(DefaultResponse {
            ok: false,
            message,
        }),
    )
        .into_response()
}
