//! WebSocket server + REST endpoints for the task engine.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::ChatRouter;
use crate::error::{Error, GateError, TaskError};
use crate::tasks::model::{PollFrequency, TaskEvent};
use crate::tasks::service::TaskService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    pub chat: Arc<ChatRouter>,
}

/// Build the Axum router with task WebSocket and REST routes.
pub fn task_routes(service: Arc<TaskService>, chat: Arc<ChatRouter>) -> Router {
    let state = AppState { service, chat };

    Router::new()
        .route("/ws/tasks", get(ws_handler))
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/run", post(run_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/hide", post(hide_task))
        .route("/api/tasks/{id}/auto_send", post(set_auto_send))
        .route("/api/tasks/{id}/poll", post(set_poll_frequency))
        .route(
            "/api/tasks/{id}/messages/{mid}/approve",
            post(approve_message),
        )
        .route(
            "/api/tasks/{id}/messages/{mid}/reject",
            post(reject_message),
        )
        .route("/api/chat", post(chat_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskpilot"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Task WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.service))
}

async fn handle_socket(mut socket: WebSocket, service: Arc<TaskService>) {
    info!("Task WebSocket client connected");

    // Send all visible tasks on connect
    if let Ok(tasks) = service.list_tasks().await {
        let sync = TaskEvent::TasksSync { tasks };
        if let Ok(json) = serde_json::to_string(&sync) {
            if socket.send(Message::Text(json.into())).await.is_err() {
                warn!("Failed to send initial task sync, client disconnected");
                return;
            }
        }
    }

    // Subscribe to broadcast channel for real-time updates
    let mut rx = service.subscribe();

    loop {
        tokio::select! {
            // Forward broadcast events to this client
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        // Re-sync with the full visible task list
                        if let Ok(tasks) = service.list_tasks().await {
                            let sync = TaskEvent::TasksSync { tasks };
                            if let Ok(json) = serde_json::to_string(&sync) {
                                if socket.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Task WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Task WebSocket connection closed");
}

// ── REST helpers ────────────────────────────────────────────────────────

fn error_response(e: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        Error::Task(TaskError::NotFound { .. })
        | Error::Gate(GateError::MessageNotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Task(TaskError::Terminal { .. })
        | Error::Task(TaskError::InvalidPollFrequency(_))
        | Error::Task(TaskError::BadDecomposition(_))
        | Error::Gate(GateError::AlreadyResolved { .. }) => StatusCode::CONFLICT,
        Error::Gate(GateError::SendFailed { .. }) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": e.to_string()})))
}

fn parse_id(raw: &str) -> Result<Uuid, (StatusCode, Json<serde_json::Value>)> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid id"})),
        )
    })
}

// ── REST Endpoints ──────────────────────────────────────────────────────

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.list_tasks().await {
        Ok(mut tasks) => {
            // List payloads carry only a log suffix; the detail endpoint
            // returns the full log.
            let tail = state.service.config().log_tail;
            for task in &mut tasks {
                let suffix = task.log_tail(tail).to_vec();
                task.execution_log = suffix;
            }
            (StatusCode::OK, Json(serde_json::json!(tasks)))
        }
        Err(e) => error_response(e),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let task_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.get_task(task_id).await {
        Ok(task) => (StatusCode::OK, Json(serde_json::json!(task))),
        Err(e) => error_response(e),
    }
}

async fn run_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let task_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.run_now(task_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "scheduled"})),
        ),
        Err(e) => error_response(e),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let task_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.cancel_task(task_id).await {
        Ok(task) => (StatusCode::OK, Json(serde_json::json!(task))),
        Err(e) => error_response(e),
    }
}

async fn hide_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let task_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.hide_task(task_id).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "hidden"})),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct AutoSendRequest {
    enabled: bool,
}

async fn set_auto_send(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AutoSendRequest>,
) -> impl IntoResponse {
    let task_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.service.set_auto_send(task_id, body.enabled).await {
        Ok(task) => (StatusCode::OK, Json(serde_json::json!(task))),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct PollRequest {
    frequency: PollFrequency,
}

async fn set_poll_frequency(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PollRequest>,
) -> impl IntoResponse {
    let task_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state
        .service
        .set_poll_frequency(task_id, body.frequency)
        .await
    {
        Ok(task) => (StatusCode::OK, Json(serde_json::json!(task))),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ApproveRequest {
    /// Optional edited body to send instead of the drafted one.
    #[serde(default)]
    body: Option<String>,
}

async fn approve_message(
    State(state): State<AppState>,
    Path((id, mid)): Path<(String, String)>,
    Json(body): Json<ApproveRequest>,
) -> impl IntoResponse {
    let (task_id, message_id) = match (parse_id(&id), parse_id(&mid)) {
        (Ok(t), Ok(m)) => (t, m),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match state
        .service
        .approve_message(task_id, message_id, body.body)
        .await
    {
        Ok(task) => (StatusCode::OK, Json(serde_json::json!(task))),
        Err(e) => error_response(e),
    }
}

async fn reject_message(
    State(state): State<AppState>,
    Path((id, mid)): Path<(String, String)>,
) -> impl IntoResponse {
    let (task_id, message_id) = match (parse_id(&id), parse_id(&mid)) {
        (Ok(t), Ok(m)) => (t, m),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };
    match state.service.reject_message(task_id, message_id).await {
        Ok(task) => (StatusCode::OK, Json(serde_json::json!(task))),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ChatRequest {
    conversation_id: String,
    message: String,
}

async fn chat_message(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    match state
        .chat
        .handle_utterance(&body.conversation_id, &body.message)
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(serde_json::json!(reply))),
        Err(e) => error_response(e),
    }
}
