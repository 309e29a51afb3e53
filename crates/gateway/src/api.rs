//! Chat and session API.
//!
//! Endpoints:
//!
//! - `POST /chat`                       Run one turn, SSE stream or JSON
//! - `POST /reset?conversation_id=ID`   Discard one conversation, or all
//! - `GET  /sessions`                   List conversations
//! - `GET  /sessions/{conversation_id}` One conversation's summary
//! - `GET  /tools`                      List registered tools

use std::convert::Infallible;

use anjia_agent::{EventSink, SessionSummary, StreamEvent, TurnRequest};
use anjia_config::ITERATION_CEILING;
use anjia_core::error::SessionError;
use axum::{
    Router,
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::SharedState;

/// Routes of the chat and session API.
pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/reset", post(reset_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/{conversation_id}", get(get_session_handler))
        .route("/tools", get(list_tools_handler))
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Signed so that negative values reach validation instead of failing
    /// deserialization.
    #[serde(default)]
    pub max_iterations: Option<i64>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    status: &'static str,
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            status: "error",
            error: error.into(),
        }),
    )
}

fn session_error(e: SessionError) -> ApiError {
    let status = match e {
        SessionError::ConversationBusy(_) => StatusCode::CONFLICT,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
    };
    api_error(status, e.to_string())
}

#[derive(Debug, Deserialize)]
struct ResetParams {
    conversation_id: Option<String>,
}

#[derive(Serialize)]
struct ResetResponse {
    status: &'static str,
    message: String,
}

#[derive(Serialize)]
struct SessionListResponse {
    total: usize,
    sessions: Vec<SessionSummary>,
}

#[derive(Serialize)]
struct ToolDto {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    count: usize,
    tools: Vec<ToolDto>,
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// Resolve the turn's iteration limit from the request and config.
fn iteration_limit(requested: Option<i64>, default: u32, cap: u32) -> Result<u32, ApiError> {
    let cap = cap.min(ITERATION_CEILING);
    match requested {
        None => Ok(default.min(cap)),
        Some(n) if n >= 1 && n <= i64::from(cap) => Ok(n as u32),
        Some(n) => Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("max_iterations must be between 1 and {cap}, got {n}"),
        )),
    }
}

/// `POST /chat`: run one turn. Streams SSE events unless `stream` is false.
async fn chat_handler(
    State(state): State<SharedState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload.map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text()))?;

    if payload.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message must not be empty"));
    }
    let agent_config = &state.config.agent;
    let max_iterations = iteration_limit(
        payload.max_iterations,
        agent_config.default_max_iterations,
        agent_config.max_iterations_cap,
    )?;

    let lease = state
        .sessions
        .get_or_create(payload.conversation_id.as_deref())
        .await
        .map_err(|e| {
            warn!(error = %e, "Chat request rejected");
            session_error(e)
        })?;

    info!(
        conversation_id = %lease.id,
        stream = payload.stream,
        max_iterations,
        message_len = payload.message.len(),
        "Chat request"
    );

    let request = TurnRequest {
        message: payload.message,
        max_iterations,
    };

    if !payload.stream {
        let mut sink = EventSink::detached();
        let outcome = state.agent.run_turn(lease, request, &mut sink).await;
        return Ok(Json(outcome).into_response());
    }

    // Dropping the response stream drops the receiver, which cancels the turn.
    let (rx, _turn) = state.agent.spawn_turn(lease, request);
    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(to_sse(&event)));

    Ok((
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response())
}

/// One SSE frame: the event name and its `data` payload as JSON.
fn to_sse(event: &StreamEvent) -> SseEvent {
    SseEvent::default()
        .event(event.event_type())
        .data(event.data().to_string())
}

/// `POST /reset`: discard one conversation, or every conversation when no
/// id is given.
async fn reset_handler(
    State(state): State<SharedState>,
    Query(params): Query<ResetParams>,
) -> Result<Json<ResetResponse>, ApiError> {
    let id = params.conversation_id.as_deref().filter(|id| !id.is_empty());
    state.sessions.reset(id).await.map_err(session_error)?;

    let message = match id {
        Some(id) => format!("会话 {id} 已重置"),
        None => "所有会话已重置".to_string(),
    };
    Ok(Json(ResetResponse {
        status: "success",
        message,
    }))
}

async fn list_sessions_handler(State(state): State<SharedState>) -> Json<SessionListResponse> {
    let sessions = state.sessions.list().await;
    Json(SessionListResponse {
        total: sessions.len(),
        sessions,
    })
}

async fn get_session_handler(
    State(state): State<SharedState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    state
        .sessions
        .summary(&conversation_id)
        .await
        .map(Json)
        .map_err(session_error)
}

async fn list_tools_handler(State(state): State<SharedState>) -> Json<ToolListResponse> {
    let tools: Vec<ToolDto> = state
        .agent
        .tools()
        .descriptors()
        .into_iter()
        .map(|d| ToolDto {
            parameters: d.json_schema(),
            name: d.name,
            description: d.description,
        })
        .collect();

    Json(ToolListResponse {
        count: tools.len(),
        tools,
    })
}
