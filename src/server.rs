//! Embedded HTTP API: scan lifecycle control, paginated result reads,
//! wordlist uploads, and the live event stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower_http::trace::TraceLayer;

use crate::{
    events::EventBroker,
    scanner::Engine,
    store::{ScanRepo, WordlistStore},
    types::{is_valid_scan_id, now_rfc3339, HostStatus, ScanStatus, StartRequest},
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub repo: Arc<ScanRepo>,
    pub wordlists: Arc<WordlistStore>,
    pub broker: EventBroker,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scans", post(start_scan).get(list_scans))
        .route("/scans/{id}", get(get_scan))
        .route("/scans/{id}/pause", post(pause_scan))
        .route("/scans/{id}/resume", post(resume_scan))
        .route("/scans/{id}/stop", post(stop_scan))
        .route("/scans/{id}/findings", get(findings_page))
        .route("/scans/{id}/errors", get(errors_page))
        .route("/scans/{id}/log", get(log_page))
        .route("/wordlists", post(upload_wordlist).get(list_wordlists))
        .route("/events", get(events))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn serve(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "serving API");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn api_error(status: StatusCode, code: &str, message: &str) -> axum::response::Response {
    (status, Json(json!({"error": {"code": code, "message": message}}))).into_response()
}

fn check_scan_id(id: &str) -> Option<axum::response::Response> {
    if is_valid_scan_id(id) {
        None
    } else {
        Some(api_error(StatusCode::BAD_REQUEST, "bad_request", "invalid scan id"))
    }
}

async fn start_scan(
    State(app): State<AppState>,
    Json(mut req): Json<StartRequest>,
) -> impl IntoResponse {
    let details = req.normalize_and_validate();
    if !details.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"code": "validation_failed", "details": details}})),
        )
            .into_response();
    }

    let id = app.engine.start(req);
    (StatusCode::ACCEPTED, Json(json!({"scanId": id}))).into_response()
}

async fn pause_scan(State(app): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if let Some(bad) = check_scan_id(&id) {
        return bad;
    }
    if app.engine.pause(&id) {
        app.broker.publish_json("scan_paused", json!({"scanId": id}));
        return (StatusCode::OK, Json(json!({"paused": true}))).into_response();
    }

    match app.repo.read_meta(&id) {
        Ok(Some(_)) => api_error(StatusCode::CONFLICT, "conflict", "scan is not running"),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "not_found", "scan not found"),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to read scan meta",
        ),
    }
}

async fn resume_scan(State(app): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if let Some(bad) = check_scan_id(&id) {
        return bad;
    }
    if app.engine.resume(&id) {
        app.broker.publish_json("scan_resumed", json!({"scanId": id}));
        return (StatusCode::OK, Json(json!({"resumed": true}))).into_response();
    }

    match app.repo.read_meta(&id) {
        Ok(Some(_)) => api_error(StatusCode::CONFLICT, "conflict", "scan is not paused"),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "not_found", "scan not found"),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to read scan meta",
        ),
    }
}

async fn stop_scan(State(app): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if let Some(bad) = check_scan_id(&id) {
        return bad;
    }
    if app.engine.stop(&id) {
        app.broker.publish_json("scan_stopped", json!({"scanId": id}));
        return (StatusCode::OK, Json(json!({"stopped": true}))).into_response();
    }

    // No live runtime: repair persisted state for scans orphaned by a crash
    // or an earlier shutdown.
    let mut meta = match app.repo.read_meta(&id) {
        Ok(Some(meta)) => meta,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "not_found", "scan not found"),
        Err(_) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to read scan meta",
            )
        }
    };

    if meta.id.is_empty() {
        meta.id = id.clone();
    }

    if matches!(meta.status, ScanStatus::Running | ScanStatus::Paused) {
        meta.status = ScanStatus::Stopped;
        let now = now_rfc3339();
        if meta.finished_at.is_empty() {
            meta.finished_at = now.clone();
        }
        for host in meta.hosts.values_mut() {
            if !matches!(host.status, HostStatus::Completed | HostStatus::Error) {
                host.status = HostStatus::Stopped;
                if host.finished_at.is_empty() {
                    host.finished_at = now.clone();
                }
            }
        }
        if app.repo.scans().write_meta(&id, &meta).is_err() {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to persist stopped state",
            );
        }
    }

    app.broker
        .publish_json("scan_stopped", json!({"scanId": id, "orphaned": true}));
    (StatusCode::OK, Json(json!({"stopped": true, "orphaned": true}))).into_response()
}

async fn get_scan(State(app): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match app.repo.read_meta(&id) {
        Ok(Some(meta)) => (StatusCode::OK, Json(meta)).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "not_found", "scan not found"),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to read scan meta",
        ),
    }
}

async fn list_scans(State(app): State<AppState>) -> impl IntoResponse {
    match app.repo.list() {
        Ok(metas) => (StatusCode::OK, Json(metas)).into_response(),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to list scans",
        ),
    }
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default)]
    cursor: i64,
    #[serde(default)]
    limit: usize,
}

async fn findings_page(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> impl IntoResponse {
    match app.repo.findings_page(&id, params.cursor, params.limit) {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to read findings",
        ),
    }
}

async fn errors_page(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> impl IntoResponse {
    match app.repo.errors_page(&id, params.cursor, params.limit) {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to read errors",
        ),
    }
}

async fn log_page(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> impl IntoResponse {
    match app.repo.log_page(&id, params.cursor, params.limit) {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to read probe log",
        ),
    }
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    #[serde(default)]
    name: String,
}

async fn upload_wordlist(
    State(app): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> impl IntoResponse {
    if body.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "bad_request", "empty wordlist body");
    }
    match app.wordlists.put(&params.name, &body) {
        Ok((id, bytes)) => (StatusCode::OK, Json(json!({"id": id, "bytes": bytes}))).into_response(),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to store wordlist",
        ),
    }
}

async fn list_wordlists(State(app): State<AppState>) -> impl IntoResponse {
    match app.wordlists.list() {
        Ok(metas) => (StatusCode::OK, Json(metas)).into_response(),
        Err(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "failed to list wordlists",
        ),
    }
}

async fn events(State(app): State<AppState>) -> impl IntoResponse {
    let rx = app.broker.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(msg) => Some(Ok::<Event, std::convert::Infallible>(
            Event::default().event(msg.event).data(msg.data),
        )),
        // A lagged subscriber drops backlog and keeps listening.
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
