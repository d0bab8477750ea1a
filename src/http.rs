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
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task,
};
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::{
    election::{BroadcastEventSink, ElectionManager, ElectionView, LeaderChangeEvent},
    error::ElectionError,
};

// Shared state
#[derive(Clone)]
pub struct AppState {
    manager: Arc<ElectionManager>,
    events: Arc<BroadcastEventSink>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse {
    pub status: String,
    pub message: String,
}

impl CommandResponse {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderStatus {
    pub key: String,
    pub is_leader: bool,
}

impl IntoResponse for ElectionError {
    fn into_response(self) -> Response {
        let status = match &self {
            ElectionError::NotFound(_) | ElectionError::NotStarted(_) => StatusCode::NOT_FOUND,
            ElectionError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            ElectionError::Store(_) | ElectionError::LockPoisoned | ElectionError::Blocking(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = CommandResponse {
            status: "error".to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_app(manager: Arc<ElectionManager>, events: Arc<BroadcastEventSink>) -> Router {
    let state = AppState { manager, events };

    Router::new()
        .route("/", get(hello_handler))
        .route("/elections", get(list_handler))
        .route("/elections/:key", get(status_handler).post(start_handler))
        .route("/elections/:key/release", post(release_handler))
        .route("/events", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn hello_handler() -> &'static str {
    "leasehold"
}

async fn list_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ElectionView>>, ElectionError> {
    let manager = state.manager.clone();
    let views = task::spawn_blocking(move || manager.list_leader_elections()).await??;
    Ok(Json(views))
}

async fn start_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<CommandResponse>, ElectionError> {
    let manager = state.manager.clone();
    let started = key.clone();
    task::spawn_blocking(move || manager.start_leader_election(&started)).await??;
    Ok(Json(CommandResponse::success(format!(
        "leader election ({key}) started"
    ))))
}

async fn status_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<LeaderStatus> {
    let is_leader = state.manager.is_leader(&key);
    Json(LeaderStatus { key, is_leader })
}

async fn release_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<CommandResponse>, ElectionError> {
    state.manager.release_leader_election(&key)?;
    Ok(Json(CommandResponse::success(format!(
        "leader election ({key}) release requested"
    ))))
}

// WebSocket handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let events = state.events.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

// Forward leadership changes until either side hangs up
async fn stream_events(socket: WebSocket, mut events: broadcast::Receiver<LeaderChangeEvent>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode leader change event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged behind");
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("event subscriber disconnected");
}
