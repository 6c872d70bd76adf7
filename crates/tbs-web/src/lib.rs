//! Axum admin API for hierarchy uploads.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tbs_sync::{SyncFailure, SyncPipeline};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "tbs-web";

const DEFAULT_LOG_LIMIT: i64 = 20;
const MAX_LOG_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncLogsQuery {
    limit: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/admin/hierarchy/upload", post(upload_handler))
        .route("/admin/hierarchy/sync-logs", get(sync_logs_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TBS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let pipeline = tbs_sync::pipeline_from_env().await?;
    let state = AppState::new(Arc::new(pipeline));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let mut workbook: Option<Vec<u8>> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                match field.bytes().await {
                    Ok(bytes) => workbook = Some(bytes.to_vec()),
                    Err(err) => return bad_request(format!("unreadable upload: {err}")),
                }
                break;
            }
            Ok(None) => break,
            Err(err) => return bad_request(format!("malformed multipart body: {err}")),
        }
    }

    let Some(workbook) = workbook else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "missing multipart field 'file'" })),
        )
            .into_response();
    };

    match state.pipeline.run(&workbook).await {
        Ok(summary) => Json(summary).into_response(),
        Err(SyncFailure::Parse(err)) => bad_request(err.to_string()),
        Err(err) => server_error(anyhow::anyhow!(err)),
    }
}

async fn sync_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncLogsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    match state.pipeline.directory().recent_sync_logs(limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err)),
    }
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
