use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::attachments::files::{relative_to_root, resolve_inside_root};
use crate::db::EventLog;
use crate::error::AppError;
use crate::models::BackupResponse;
use crate::monitor::state::SharedState;
use crate::monitor::Overview;

const LOG_PAGE_SIZE: usize = 50;
const ATTACHMENTS_PREFIX: &str = "/attachments";

#[derive(Clone)]
pub struct DashboardState {
    log: Arc<EventLog>,
    bot: SharedState,
    overview: Arc<Overview>,
    attachments_root: PathBuf,
    demo_mode: bool,
}

impl DashboardState {
    pub fn new(
        log: Arc<EventLog>,
        bot: SharedState,
        overview: Overview,
        attachments_root: PathBuf,
        demo_mode: bool,
    ) -> Self {
        Self {
            log,
            bot,
            overview: Arc::new(overview),
            attachments_root,
            demo_mode,
        }
    }
}

pub fn router(state: DashboardState, static_dir: &FsPath) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/overview", get(overview))
        .route("/api/logs", get(logs))
        .route("/api/storage", get(storage))
        .route("/api/storage/export", post(export_storage))
        .route("/attachments/*path", get(attachment))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .allow_origin(Any),
        )
}

pub async fn serve(state: DashboardState, static_dir: PathBuf, port: u16) -> Result<(), AppError> {
    let app = router(state, &static_dir);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("dashboard listening on http://127.0.0.1:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn stats(State(state): State<DashboardState>) -> Response {
    let snapshot = match state.bot.lock() {
        Ok(bot) => bot.snapshot(),
        Err(_) => return internal_error(AppError::LockPoisoned),
    };
    match serde_json::to_value(snapshot) {
        Ok(mut body) => {
            rewrite_local_paths(&mut body, &state.attachments_root);
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn overview(State(state): State<DashboardState>) -> Response {
    let peers = match state.log.list_peers() {
        Ok(peers) => peers,
        Err(err) => return internal_error(err),
    };
    let conversations: Vec<Value> = state
        .overview
        .conversations
        .iter()
        .map(|item| item.get("conversation").cloned().unwrap_or_else(|| item.clone()))
        .collect();

    Json(json!({
        "group": state.overview.group,
        "conversations": conversations,
        "peers": peers,
        "storage": state.log.describe_storage(),
        "demo_mode": state.demo_mode,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    peer_id: Option<String>,
}

async fn logs(State(state): State<DashboardState>, Query(query): Query<LogsQuery>) -> Response {
    let peer_id = match query.peer_id.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_peer_id"})))
                    .into_response()
            }
        },
    };

    let entries = match state.log.fetch_messages(peer_id, LOG_PAGE_SIZE) {
        Ok(entries) => entries,
        Err(err) => return internal_error(err),
    };
    let mut items = match serde_json::to_value(entries) {
        Ok(items) => items,
        Err(err) => return internal_error(err),
    };
    rewrite_local_paths(&mut items, &state.attachments_root);

    Json(json!({"items": items, "peer_id": peer_id})).into_response()
}

async fn storage(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.log.describe_storage())
}

async fn export_storage(State(state): State<DashboardState>) -> Response {
    match state.log.export_backup_zip() {
        Ok(path) => {
            let body = BackupResponse {
                path: path.to_string_lossy().to_string(),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn attachment(State(state): State<DashboardState>, Path(requested): Path<String>) -> Response {
    let Some(path) = resolve_inside_root(&state.attachments_root, &requested) else {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))).into_response();
    };
    if !path.is_file() {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response();
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type_for(&path))],
            bytes,
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

/// Replace every cached `local_path` with its dashboard URL. Paths outside
/// the attachment root become `null`.
pub fn rewrite_local_paths(value: &mut Value, root: &FsPath) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(local)) = map.get("local_path") {
                let rewritten = relative_to_root(root, FsPath::new(local))
                    .map(|rel| Value::String(format!("{ATTACHMENTS_PREFIX}/{rel}")))
                    .unwrap_or(Value::Null);
                map.insert("local_path".to_string(), rewritten);
            }
            for (key, child) in map.iter_mut() {
                if key != "local_path" {
                    rewrite_local_paths(child, root);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_local_paths(item, root);
            }
        }
        _ => {}
    }
}

fn content_type_for(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "pdf" => "application/pdf",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

fn internal_error(err: impl Display) -> Response {
    error!("dashboard request failed: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::new_attachment;
    use crate::models::MessageNode;
    use crate::monitor::state::BotState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::fs;
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        log: Arc<EventLog>,
        app: Router,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("attachments");
        fs::create_dir_all(root.join("5").join("10")).unwrap();
        fs::write(root.join("5").join("10").join("photo.jpg"), b"jpeg-bytes").unwrap();
        fs::write(dir.path().join("secret.txt"), b"secret").unwrap();
        let static_dir = dir.path().join("static");
        fs::create_dir_all(&static_dir).unwrap();
        fs::write(static_dir.join("index.html"), "<h1>dashboard</h1>").unwrap();

        let log = Arc::new(EventLog::open(dir.path().join("logs.db")).unwrap());
        let state = DashboardState::new(
            log.clone(),
            BotState::shared(),
            Overview::default(),
            root.clone(),
            false,
        );
        let app = router(state, &static_dir);
        Fixture {
            _dir: dir,
            root,
            log,
            app,
        }
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let fx = fixture();
        let (status, body) = get(&fx.app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn attachments_are_served_from_root() {
        let fx = fixture();
        let (status, body) = get(&fx.app, "/attachments/5/10/photo.jpg").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"jpeg-bytes");
        let (status, _) = get(&fx.app, "/attachments/5/10/absent.jpg").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn traversal_is_forbidden() {
        let fx = fixture();
        let (status, _) = get(&fx.app, "/attachments/../secret.txt").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = get(&fx.app, "/attachments/5/%2e%2e/%2e%2e/secret.txt").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn logs_expose_dashboard_urls() {
        let fx = fixture();
        let mut attachment = new_attachment(json!({"type": "photo", "photo": {"owner_id": 1, "id": 2}}));
        let local = fx.root.join("5").join("10").join("photo.jpg");
        attachment.mark_ready(local.to_string_lossy().to_string(), Some(10), None);
        let message = MessageNode {
            id: Some(10),
            peer_id: Some(5),
            from_id: Some(3),
            text: Some("hi".to_string()),
            attachments: vec![attachment],
            fwd_messages: Vec::new(),
            copy_history: Vec::new(),
            reply_message: None,
            nesting_truncated: false,
            rest: Default::default(),
        };
        fx.log.log_message(&message, None, None).unwrap();

        let (status, body) = get(&fx.app, "/api/logs?peer_id=5").await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["peer_id"], 5);
        let item = &body["items"][0];
        assert_eq!(item["attachments"][0]["local_path"], "/attachments/5/10/photo.jpg");
        assert_eq!(item["payload"]["attachments"][0]["local_path"], "/attachments/5/10/photo.jpg");

        let (status, _) = get(&fx.app, "/api/logs?peer_id=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn paths_outside_the_root_are_hidden() {
        let fx = fixture();
        let inside = fx.root.join("5").join("10").join("photo.jpg");
        let mut body = json!({"attachments": [
            {"local_path": "/var/secret/elsewhere/x.jpg"},
            {"local_path": inside.to_string_lossy()},
            {"local_path": null}
        ]});
        rewrite_local_paths(&mut body, &fx.root);
        assert_eq!(body["attachments"][0]["local_path"], Value::Null);
        assert_eq!(body["attachments"][1]["local_path"], "/attachments/5/10/photo.jpg");
        assert_eq!(body["attachments"][2]["local_path"], Value::Null);
    }

    #[tokio::test]
    async fn export_returns_archive_path() {
        let fx = fixture();
        let response = fx
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/storage/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        let path = PathBuf::from(body["path"].as_str().unwrap());
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn stats_and_fallback() {
        let fx = fixture();
        let (status, body) = get(&fx.app, "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["events"], 0);
        assert!(body["timeline"].as_array().unwrap().is_empty());

        let (status, body) = get(&fx.app, "/index.html").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("dashboard"));
    }
}
