//! HTTP API handlers: rendezvous and resolver state as JSON.

pub mod rendezvous;
pub mod status;

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;

use overmesh_core::{IdRegistry, PeerId};
use overmesh_services::{RendezvousManager, ResolverRouter};

#[derive(Clone)]
pub struct ApiState {
    pub rendezvous: RendezvousManager,
    pub resolver: ResolverRouter,
    pub ids: Arc<IdRegistry>,
    /// Node name from the identity config.
    pub node_name: String,
    pub started_at: Instant,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a canonical peer id from a path segment or request field.
fn parse_peer(ids: &IdRegistry, s: &str) -> Result<PeerId, (StatusCode, String)> {
    ids.parse_peer(s)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid peer id: {e}")))
}

pub use rendezvous::{handle_challenge, handle_connect, handle_disconnect, handle_rendezvous};
pub use status::{handle_handlers, handle_status};
