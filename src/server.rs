use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use eyre::{eyre, Result};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::GatewayConfig;
use crate::history::{ChatHistory, InlineData, Part, Role, Turn};
use crate::pool::KeyPool;
use crate::proxy::{self, ProxyEvent};
use crate::upstream::UpstreamClient;

/// Everything a request handler needs, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<KeyPool>,
    pub history: Arc<ChatHistory>,
    pub upstream: UpstreamClient,
    pub config: Arc<GatewayConfig>,
    /// Key that served the most recent completed stream. Process-wide, not
    /// per user; fed back into `acquire` as the preferred key.
    last_successful_key: Arc<Mutex<Option<String>>>,
}

impl AppState {
    pub fn new(
        pool: KeyPool,
        history: ChatHistory,
        upstream: UpstreamClient,
        config: GatewayConfig,
    ) -> Self {
        Self {
            pool: Arc::new(pool),
            history: Arc::new(history),
            upstream,
            config: Arc::new(config),
            last_successful_key: Arc::new(Mutex::new(None)),
        }
    }

    pub fn last_key(&self) -> Option<String> {
        self.last_successful_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_last_key(&self, key: Option<String>) {
        *self
            .last_successful_key
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = key;
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/stream", get(stream_handler))
        .route("/reset", post(reset_handler))
        .route("/history", get(history_handler))
        .route("/status", get(status_handler))
        .route("/status/reset-free-failures", post(reset_free_failures_handler))
        .with_state(state)
}

pub async fn run(state: AppState, port: u16) -> Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| eyre!("failed to bind {addr}: {e}"))?;
    tracing::info!(%addr, "gateway listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| eyre!("server error: {e}"))?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    text: Option<String>,
    /// Base64 PNG payload from the capture utility.
    #[serde(default)]
    image: Option<String>,
}

/// Assemble the parts of a user turn, or `None` when the message is empty.
fn build_user_parts(text: Option<&str>, image: Option<&str>) -> Option<Vec<Part>> {
    let text = text.unwrap_or("").trim();
    let image = image.filter(|data| !data.is_empty());

    if text.is_empty() && image.is_none() {
        return None;
    }

    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(Part::Text(text.to_string()));
    }
    if let Some(data) = image {
        parts.push(Part::InlineData(InlineData {
            mime_type: "image/png".to_string(),
            data: data.to_string(),
        }));
    }
    Some(parts)
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<Value>) {
    match build_user_parts(req.text.as_deref(), req.image.as_deref()) {
        Some(parts) => {
            state.history.append_user(parts);
            (StatusCode::OK, Json(json!({"ok": true})))
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "message text or image required"})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    model: Option<String>,
    enable_search: Option<bool>,
}

async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let model = query
        .model
        .unwrap_or_else(|| state.config.default_model().to_string());
    let enable_search = query.enable_search.unwrap_or(false);

    let (tx, rx) = mpsc::channel::<ProxyEvent>(64);

    if state.history.last_role() != Some(Role::User) {
        // Nothing to answer: /chat has not queued a user turn.
        let _ = tx.try_send(ProxyEvent::Error(
            "chat history is empty or already answered; send a message first".into(),
        ));
        let _ = tx.try_send(ProxyEvent::Done);
    } else {
        tokio::spawn(proxy::run_stream(state, model, enable_search, tx));
    }

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(sse_event(event)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: ProxyEvent) -> Event {
    match event {
        ProxyEvent::Text(text) => Event::default().data(json!({"text": text}).to_string()),
        ProxyEvent::Error(msg) => Event::default()
            .event("error")
            .data(json!({"text": msg}).to_string()),
        ProxyEvent::Done => Event::default().event("end").data("[DONE]"),
    }
}

async fn reset_handler(State(state): State<AppState>) -> Json<Value> {
    state.history.clear();
    state.set_last_key(None);
    tracing::info!("chat history and key hint reset");
    Json(json!({"ok": true}))
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct HistoryEntry {
    who: &'static str,
    md: String,
}

/// Flatten turns into the page-load shape. Inline images become truncated
/// data-URL placeholders; the client never needs the full payload back.
fn render_history(turns: &[Turn]) -> Vec<HistoryEntry> {
    turns
        .iter()
        .map(|turn| match turn.role {
            Role::User => {
                let mut md = String::new();
                for part in &turn.parts {
                    match part {
                        Part::Text(text) => {
                            md.push_str(text);
                            md.push('\n');
                        }
                        Part::InlineData(img) => {
                            let preview: String = img.data.chars().take(30).collect();
                            md.push_str(&format!(
                                "![image](data:{};base64,{}...)\n",
                                img.mime_type, preview
                            ));
                        }
                    }
                }
                HistoryEntry { who: "user", md }
            }
            Role::Model => {
                let md = turn
                    .parts
                    .iter()
                    .find_map(|part| match part {
                        Part::Text(text) => Some(text.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| "[empty reply]".to_string());
                HistoryEntry { who: "bot", md }
            }
        })
        .collect()
}

async fn history_handler(State(state): State<AppState>) -> Json<Vec<HistoryEntry>> {
    Json(render_history(&state.history.snapshot()))
}

async fn status_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let status = state
        .pool
        .status()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let value =
        serde_json::to_value(status).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(value))
}

async fn reset_free_failures_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .pool
        .reset_free_failures()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"ok": true})))
}
