//! /rendezvous handlers: connection listing and control.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use overmesh_core::{PeerDescriptor, RouteDescriptor};
use overmesh_services::ConnectionSnapshot;

use super::{parse_peer, ApiState};

// ── /rendezvous (GET) ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct RendezvousResponse {
    pub is_rendezvous: bool,
    pub connections: Vec<ConnectionSnapshot>,
    pub clients: Vec<PeerDescriptor>,
}

pub async fn handle_rendezvous(State(state): State<ApiState>) -> Json<RendezvousResponse> {
    Json(RendezvousResponse {
        is_rendezvous: state.rendezvous.is_rendezvous(),
        connections: state.rendezvous.connections(),
        clients: state.rendezvous.clients(),
    })
}

// ── /rendezvous/connect ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub address: String,
    /// Canonical peer id expected at `address`, if known.
    pub peer: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectResponse {
    pub address: String,
    pub queued: bool,
}

pub async fn handle_connect(
    State(state): State<ApiState>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, (StatusCode, String)> {
    if req.address.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "address is required".to_string()));
    }
    let hint = match &req.peer {
        Some(peer) => Some(RouteDescriptor {
            peer: parse_peer(&state.ids, peer)?,
            endpoints: vec![req.address.clone()],
        }),
        None => None,
    };

    state.rendezvous.connect_to_rendezvous(req.address.clone(), hint);
    tracing::info!(address = %req.address, "rendezvous candidate added via API");

    Ok(Json(ConnectResponse {
        address: req.address,
        queued: true,
    }))
}

// ── /rendezvous/{peer}/challenge ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ChallengeRequest {
    /// 0 drops the connection immediately.
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Serialize)]
pub struct PeerActionResponse {
    pub peer: String,
    pub found: bool,
}

pub async fn handle_challenge(
    State(state): State<ApiState>,
    Path(peer): Path<String>,
    Json(req): Json<ChallengeRequest>,
) -> Result<Json<PeerActionResponse>, (StatusCode, String)> {
    let id = parse_peer(&state.ids, &peer)?;
    let found = state
        .rendezvous
        .challenge(&id, Duration::from_millis(req.delay_ms));
    Ok(Json(PeerActionResponse { peer, found }))
}

// ── /rendezvous/{peer} (DELETE) ───────────────────────────────────────────────

pub async fn handle_disconnect(
    State(state): State<ApiState>,
    Path(peer): Path<String>,
) -> Result<Json<PeerActionResponse>, (StatusCode, String)> {
    let id = parse_peer(&state.ids, &peer)?;
    let found = state.rendezvous.disconnect(&id);
    if found {
        tracing::info!(peer = %peer, "rendezvous connection closed via API");
    }
    Ok(Json(PeerActionResponse { peer, found }))
}
