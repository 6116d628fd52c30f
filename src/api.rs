//! HTTP query surface
//!
//! Read-only access to the time-series store for downstream tooling:
//!
//! - `GET /health`
//! - `GET /api/samples?tags=a/x,a/y&start=..&end=..`
//! - `GET /api/samples/recent?tags=a/x&limit=100`
//! - `GET /api/export?tags=..&start=..&end=..` (CSV)
//! - `GET /api/stats`
//!
//! [`serve`] runs the router until the collector's [`StopHandle`] fires.
//!
//! Times are RFC 3339 or integer nanoseconds since the epoch.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::normalize::Sample;
use crate::scheduler::StopHandle;
use crate::store::{parse_time, SqliteStore, StoreError, StoreStats};

const DEFAULT_RECENT_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub tags: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub tags: String,
    pub limit: Option<u32>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Store(StoreError),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::EmptyTagSet | StoreError::TimestampOutOfRange(_) => {
                ApiError::BadRequest(e.to_string())
            }
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Store(e) => {
                error!("Query failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Build the API router over a store handle
pub fn router(store: SqliteStore) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/samples", get(range))
        .route("/api/samples/recent", get(recent))
        .route("/api/export", get(export))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(store)
}

/// Serve the router until `stop` fires, then close the store handle
pub async fn serve(
    listener: TcpListener,
    store: SqliteStore,
    stop: StopHandle,
) -> std::io::Result<()> {
    let result = axum::serve(listener, router(store.clone()))
        .with_graceful_shutdown(async move { stop.stopped().await })
        .await;
    store.close().await;
    info!("Query API stopped");
    result
}

fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn parse_window(params: &RangeParams) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let start = parse_time(&params.start).map_err(ApiError::BadRequest)?;
    let end = parse_time(&params.end).map_err(ApiError::BadRequest)?;
    Ok((start, end))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn range(
    State(store): State<SqliteStore>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<Sample>>, ApiError> {
    let (start, end) = parse_window(&params)?;
    let samples = store
        .range_query(&parse_tags(&params.tags), start, end)
        .await?;
    Ok(Json(samples))
}

async fn recent(
    State(store): State<SqliteStore>,
    Query(params): Query<RecentParams>,
) -> Result<Json<Vec<Sample>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    let samples = store.recent(&parse_tags(&params.tags), limit).await?;
    Ok(Json(samples))
}

async fn export(
    State(store): State<SqliteStore>,
    Query(params): Query<RangeParams>,
) -> Result<Response, ApiError> {
    let (start, end) = parse_window(&params)?;
    let matrix = store
        .feature_matrix(&parse_tags(&params.tags), start, end)
        .await?;

    let mut body = Vec::new();
    matrix
        .write_csv(&mut body)
        .map_err(|e| ApiError::Internal(format!("CSV encoding failed: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, "text/csv")], body).into_response())
}

async fn stats(State(store): State<SqliteStore>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(store.stats().await?))
}
