use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use am_core::config::TerminalConfig;
use am_core::types::{AgentKind, WorkKey};
use am_session::launch::LaunchResolver;
use am_session::registry::SessionSummary;
use am_session::scrollback::{ScrollbackSerializer, Snapshot};

use crate::adapter::{PumpSettings, SharedRegistry, TransportAdapter};
use crate::api_error::ApiError;
use crate::terminal_ws;

/// Shared state for all HTTP/WS handlers.
pub struct ApiState {
    pub registry: SharedRegistry,
    pub adapter: TransportAdapter,
    pub terminal: TerminalConfig,
    /// Default threshold for the orphan query.
    pub orphan_timeout: Duration,
    pub scrollback: Option<Arc<ScrollbackSerializer>>,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(
        registry: SharedRegistry,
        resolver: Arc<dyn LaunchResolver>,
        terminal: TerminalConfig,
        orphan_timeout: Duration,
    ) -> Self {
        let adapter = TransportAdapter::new(
            registry.clone(),
            resolver,
            PumpSettings::from(&terminal),
        );
        Self {
            registry,
            adapter,
            terminal,
            orphan_timeout,
            scrollback: None,
            start_time: std::time::Instant::now(),
        }
    }

    /// Enable `GET /api/snapshots/{id}`.
    pub fn with_scrollback(mut self, serializer: Arc<ScrollbackSerializer>) -> Self {
        self.scrollback = Some(serializer);
        self
    }
}

/// Build the router with every REST and WebSocket route.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route(
            "/api/terminals",
            get(list_terminals).delete(kill_terminal),
        )
        .route("/api/terminals/orphans", get(list_orphans))
        .route("/api/snapshots/{id}", get(get_snapshot))
        .route("/ws/terminal", get(terminal_ws::terminal_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// `work_key` + `agent` query pair naming one session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionKeyQuery {
    pub work_key: String,
    pub agent: String,
}

impl SessionKeyQuery {
    pub fn parse(&self) -> Result<(WorkKey, AgentKind), ApiError> {
        let work_key =
            WorkKey::new(self.work_key.clone()).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let agent_kind = self
            .agent
            .parse::<AgentKind>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        Ok((work_key, agent_kind))
    }
}

#[derive(Debug, Deserialize)]
pub struct OrphanQuery {
    pub older_than_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    session_count: usize,
    connected_count: usize,
}

#[derive(Debug, Serialize)]
struct KillResponse {
    status: &'static str,
    id: Uuid,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let sessions = state.registry.lock().await.list();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        session_count: sessions.len(),
        connected_count: sessions.iter().filter(|s| s.connected).count(),
    })
}

/// GET /api/terminals: every session, oldest first.
async fn list_terminals(State(state): State<Arc<ApiState>>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.lock().await.list())
}

/// DELETE /api/terminals?work_key=..&agent=..: destroy the session and
/// kill its process.
async fn kill_terminal(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionKeyQuery>,
) -> Result<Json<KillResponse>, ApiError> {
    let (work_key, agent_kind) = query.parse()?;
    let mut registry = state.registry.lock().await;
    let id = registry
        .find(&work_key, agent_kind)
        .ok_or_else(|| ApiError::NotFound(format!("no {agent_kind} session for {work_key}")))?;

    // Tell the viewer before the process goes away.
    if let Some(connection) = registry.active_connection(id).cloned() {
        connection.close();
    }
    registry.destroy(id);
    info!(session_id = %id, %work_key, agent = %agent_kind, "terminal killed via API");
    Ok(Json(KillResponse {
        status: "destroyed",
        id,
    }))
}

/// GET /api/terminals/orphans?older_than_secs=..: sessions with no viewer
/// for longer than the threshold. Listing does not destroy.
async fn list_orphans(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<OrphanQuery>,
) -> Json<Vec<SessionSummary>> {
    let older_than = query
        .older_than_secs
        .map(Duration::from_secs)
        .unwrap_or(state.orphan_timeout);
    let registry = state.registry.lock().await;
    let orphans = registry.orphans(older_than);
    Json(
        registry
            .list()
            .into_iter()
            .filter(|s| orphans.contains(&s.id))
            .collect(),
    )
}

/// GET /api/snapshots/{id}: the persisted scrollback for a session id,
/// replayed through a fresh terminal.
async fn get_snapshot(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Snapshot>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::BadRequest("invalid session ID".into()))?;
    let serializer = state
        .scrollback
        .clone()
        .ok_or_else(|| ApiError::NotFound("snapshots are disabled".into()))?;

    let restored = tokio::task::spawn_blocking(move || {
        serializer.restore_terminal(id).map(|r| r.capture())
    })
    .await
    .map_err(|e| ApiError::InternalError(e.to_string()))?;

    restored
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no snapshot for session {id}")))
}
