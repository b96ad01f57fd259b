//! HTTP and WebSocket surface
//!
//! - `GET  /v1/ws`            session protocol (see [`crate::websocket`])
//! - `POST /v1/ticks`         raw tick feed, one tick or an array
//! - `GET  /v1/sessions/:id`  subscription snapshot, also a polling fallback
//! - `GET  /v1/metrics`       counters and gauges

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use types::ids::SessionId;

use crate::delivery::ChannelTransport;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::Tick;
use crate::registry::Subscription;
use crate::websocket::{parse_request, ServerMessage};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub transport: Arc<ChannelTransport>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, transport: Arc<ChannelTransport>) -> Self {
        Self { engine, transport }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Engine(err) => {
                let status = match err {
                    EngineError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
                    EngineError::InvalidIndicatorSpec { .. }
                    | EngineError::SubscriptionLimit { .. }
                    | EngineError::InvalidId(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code(), err.to_string())
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/ticks", post(post_ticks))
        .route("/sessions/:id", get(get_session))
        .route("/metrics", get(get_metrics));

    Router::new()
        .nest("/v1", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TickBody {
    One(Tick),
    Many(Vec<Tick>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TicksAccepted {
    pub accepted: usize,
}

async fn post_ticks(
    State(state): State<AppState>,
    Json(body): Json<TickBody>,
) -> Json<TicksAccepted> {
    let ticks = match body {
        TickBody::One(tick) => vec![tick],
        TickBody::Many(ticks) => ticks,
    };
    let accepted = ticks.len();
    for tick in ticks {
        state.engine.on_tick(tick).await;
    }
    Json(TicksAccepted { accepted })
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Subscription>, AppError> {
    let session_id = SessionId::try_new(id).map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(Json(state.engine.snapshot(&session_id)?))
}

async fn get_metrics(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.engine.metrics())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One WebSocket connection. Several sessions may share it; updates arrive
/// through the connection's transport channel, replies through a local one.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let buffer = state.engine.config().delivery.queue_capacity;
    let (transport, mut updates) = state.transport.connect(buffer);
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<String>();
    let (mut sink, mut stream) = socket.split();
    info!(transport = %transport, "WebSocket connected");

    let writer = tokio::spawn(async move {
        loop {
            let payload = tokio::select! {
                Some(reply) = replies.recv() => reply,
                Some(update) = updates.recv() => update,
                else => break,
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let reply = match parse_request(&text) {
                    Ok(request) => state.engine.handle_request(request, transport),
                    Err(e) => ServerMessage::bad_request(e.to_string()),
                };
                match reply.to_json() {
                    Ok(payload) => {
                        if reply_tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(transport = %transport, error = %e, "Failed to encode reply"),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Sessions that resubscribed from another connection are kept
    let released = state.engine.disconnect(transport);
    state.transport.disconnect(transport);
    writer.abort();
    info!(transport = %transport, sessions = released.len(), "WebSocket disconnected");
}
