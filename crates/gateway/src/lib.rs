//! HTTP gateway for Anjia.
//!
//! Exposes the advisor agent over HTTP: a chat endpoint that streams turn
//! events as SSE (or answers with a single JSON body), session management
//! and introspection endpoints.
//!
//! Built on Axum.

pub mod api;

use std::sync::Arc;

use anjia_agent::{AgentLoop, SessionStore};
use anjia_config::AppConfig;
use anjia_core::model::ModelGateway;
use anjia_core::tool::ToolRegistry;
use anjia_providers::OpenAiCompatGateway;
use axum::extract::DefaultBodyLimit;
use axum::http::{Method, header};
use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub agent: Arc<AgentLoop>,
    pub sessions: Arc<SessionStore>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the agent loop and session store for `config` around the
    /// given model gateway and tools.
    pub fn new(config: AppConfig, gateway: Arc<dyn ModelGateway>, tools: ToolRegistry) -> SharedState {
        let agent = AgentLoop::from_config(gateway, Arc::new(tools), &config.agent);
        let sessions = SessionStore::from_config(&config.sessions);
        Arc::new(Self {
            config,
            agent: Arc::new(agent),
            sessions: Arc::new(sessions),
        })
    }
}

/// Build the router with all routes.
///
/// Layers applied:
/// - permissive CORS (browser front ends are served from elsewhere)
/// - request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .merge(api::api_router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the HTTP server with the OpenAI-compatible gateway and the
/// built-in tools.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !config.has_api_key() {
        return Err("No model API key configured; set ANJIA_API_KEY or [model].api_key".into());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);

    let gateway = OpenAiCompatGateway::from_config(&config.model, config.agent.gateway_timeout());
    info!(model = %gateway.model(), api_url = %config.model.api_url, "Model gateway configured");

    let tools = anjia_tools::default_registry(config.agent.tool_timeout());
    if tools.is_empty() {
        warn!("No tools registered");
    }

    let state = AppState::new(config, Arc::new(gateway), tools);
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct RootResponse {
    name: &'static str,
    version: &'static str,
    health: &'static str,
    endpoints: [&'static str; 6],
}

async fn root_handler() -> Json<RootResponse> {
    Json(RootResponse {
        name: "购房资金方案生成助手 API",
        version: env!("CARGO_PKG_VERSION"),
        health: "/health",
        endpoints: [
            "POST /chat",
            "POST /reset",
            "GET /sessions",
            "GET /sessions/{conversation_id}",
            "GET /tools",
            "GET /health",
        ],
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    agent_initialized: bool,
    tools_count: usize,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        agent_initialized: true,
        tools_count: state.agent.tools().len(),
    })
}
