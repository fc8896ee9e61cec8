// THEORY:
// The transport around a shared `myko_vision::Session`. Control calls
// (`propose`, `select`, `clear`, `segment`) are plain JSON POST routes; the
// live video runs over one WebSocket per client at `/ws`.
//
// A WebSocket connection is split in two. The read half becomes a stream of
// frame payloads that the engine's receive loop pushes into its latest-frame
// slot; the engine's processing loop renders the newest frame and writes it
// back through the write half. A client that disconnects ends the read stream,
// which drains the last frame and stops the processing loop.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt, future};
use myko_vision::{BackendChoice, EngineError, ProposalReport, Session, run_stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_QUERY: &str = "cells";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl ServerConfig {
    /// Reads `MYKO_BIND`, falling back to the default address.
    pub fn from_env() -> Self {
        match std::env::var("MYKO_BIND") {
            Ok(addr) if !addr.trim().is_empty() => Self {
                bind_addr: addr.trim().to_string(),
            },
            _ => Self::default(),
        }
    }
}

/// Pulls the frame payload out of one WebSocket text message. JSON objects
/// carry it in their `frame` field; anything that is not JSON is the frame
/// itself. Empty payloads yield `None`.
pub fn extract_frame(text: &str) -> Option<String> {
    let frame = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map.get("frame").and_then(Value::as_str).map(str::to_owned),
        _ => Some(text.to_owned()),
    };
    frame.filter(|f| !f.trim().is_empty())
}

fn frame_from_message(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => extract_frame(&text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok().and_then(|text| extract_frame(&text)),
        _ => None,
    }
}

#[derive(Clone)]
struct AppState {
    session: Arc<Session>,
}

#[derive(Debug, Deserialize)]
struct ProposeRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    frame: Option<String>,
    #[serde(default)]
    backend: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SelectRequest {
    #[serde(default)]
    indices: Vec<i64>,
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SegmentRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    frame: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ok: bool,
    status: String,
}

impl StatusResponse {
    fn ok(status: impl Into<String>) -> Json<Self> {
        Json(Self {
            ok: true,
            status: status.into(),
        })
    }
}

/// Maps engine failures onto HTTP statuses; the body carries the
/// human-readable status string.
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let code = match &self.0 {
            EngineError::NoImage | EngineError::NoValidIndices { .. } | EngineError::EmptySelection => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::Codec(_) | EngineError::Config(_) => StatusCode::BAD_REQUEST,
            EngineError::Backend(_) => StatusCode::BAD_GATEWAY,
            EngineError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = StatusResponse {
            ok: false,
            status: self.0.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    proposals: usize,
    active_masks: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        proposals: state.session.proposal_count(),
        active_masks: state.session.active_mask_count(),
    })
}

fn query_or_default(query: Option<String>) -> String {
    query
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .unwrap_or_else(|| DEFAULT_QUERY.to_string())
}

async fn propose(State(state): State<AppState>, Json(req): Json<ProposeRequest>) -> Result<Json<ProposalReport>, ApiError> {
    let choice = match req.backend.as_deref() {
        Some(name) => name.parse::<BackendChoice>().map_err(EngineError::from)?,
        None => BackendChoice::Auto,
    };
    let query = query_or_default(req.query);
    let report = state.session.propose(&query, req.frame.as_deref(), choice).await?;
    Ok(Json(report))
}

async fn select(State(state): State<AppState>, Json(req): Json<SelectRequest>) -> Result<Json<StatusResponse>, ApiError> {
    let summary = state.session.select(&req.indices, req.query.as_deref())?;
    Ok(StatusResponse::ok(summary.to_string()))
}

async fn clear(State(state): State<AppState>) -> Json<StatusResponse> {
    StatusResponse::ok(state.session.clear())
}

async fn segment(State(state): State<AppState>, Json(req): Json<SegmentRequest>) -> Result<Json<StatusResponse>, ApiError> {
    let query = query_or_default(req.query);
    let status = state.session.segment(&query, req.frame.as_deref()).await?;
    Ok(StatusResponse::ok(status))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_conn(socket, state.session))
}

async fn ws_conn(socket: WebSocket, session: Arc<Session>) {
    info!("frame stream connected");
    let (ws_tx, ws_rx) = socket.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    let incoming = ws_rx
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| future::ready(msg.ok().and_then(frame_from_message)))
        .boxed();

    let stats = run_stream(session, incoming, |frame| {
        let ws_tx = Arc::clone(&ws_tx);
        async move { ws_tx.lock().await.send(Message::Text(frame)).await }
    })
    .await;

    info!(processed = stats.processed, failed = stats.failed, "frame stream disconnected");
}

pub fn router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/propose", post(propose))
        .route("/select", post(select))
        .route("/clear", post(clear))
        .route("/segment", post(segment))
        .route("/ws", get(ws_handler))
        .with_state(AppState { session })
}

/// Binds the listener and serves the router on a background task.
pub async fn start_server(session: Arc<Session>, cfg: ServerConfig) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    let app = router(session);
    info!(addr = %cfg.bind_addr, "overlay server listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(%err, "server stopped");
        }
    });
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_message_yields_its_frame_field() {
        assert_eq!(extract_frame(r#"{"frame": "abc"}"#).as_deref(), Some("abc"));
    }

    #[test]
    fn json_without_frame_is_skipped() {
        assert_eq!(extract_frame(r#"{"other": 1}"#), None);
        assert_eq!(extract_frame(r#"{"frame": ""}"#), None);
    }

    #[test]
    fn raw_payload_is_the_frame() {
        let raw = "data:image/jpeg;base64,/9j/4AAQ";
        assert_eq!(extract_frame(raw).as_deref(), Some(raw));
        assert_eq!(extract_frame("   "), None);
    }

    #[test]
    fn binary_messages_are_decoded_as_text() {
        let msg = Message::Binary(br#"{"frame":"xyz"}"#.to_vec());
        assert_eq!(frame_from_message(msg).as_deref(), Some("xyz"));
        assert_eq!(frame_from_message(Message::Binary(vec![0xff, 0xfe])), None);
        assert_eq!(frame_from_message(Message::Ping(Vec::new())), None);
    }

    #[tokio::test]
    async fn health_reports_live_counts() {
        let session = Arc::new(Session::new(myko_vision::EngineConfig::default()).unwrap());
        let Json(health) = healthz(State(AppState { session })).await;
        assert!(health.ok);
        assert_eq!((health.proposals, health.active_masks), (0, 0));
    }

    #[test]
    fn blank_queries_fall_back() {
        assert_eq!(query_or_default(Some("  ".into())), "cells");
        assert_eq!(query_or_default(Some(" rbc ".into())), "rbc");
        assert_eq!(query_or_default(None), "cells");
    }
}
