//! /status and /handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use overmesh_core::config::Role;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub peer: String,
    pub name: String,
    pub group: String,
    pub role: Role,
    pub uptime_secs: u64,
    pub rendezvous_connections: usize,
    pub target_connections: usize,
    pub clients: usize,
    pub query_handlers: usize,
    pub srdi_handlers: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let rdv = &state.rendezvous;
    Json(StatusResponse {
        peer: rdv.local_peer().to_string(),
        name: state.node_name.clone(),
        group: rdv.group().to_string(),
        role: rdv.config().role,
        uptime_secs: state.started_at.elapsed().as_secs(),
        rendezvous_connections: rdv.connection_count(),
        target_connections: rdv.config().target_connections,
        clients: rdv.clients().len(),
        query_handlers: state.resolver.handler_names().len(),
        srdi_handlers: state.resolver.srdi_handler_names().len(),
    })
}

// ── /handlers ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HandlersResponse {
    pub query: Vec<String>,
    pub srdi: Vec<String>,
}

pub async fn handle_handlers(State(state): State<ApiState>) -> Json<HandlersResponse> {
    Json(HandlersResponse {
        query: state.resolver.handler_names(),
        srdi: state.resolver.srdi_handler_names(),
    })
}
