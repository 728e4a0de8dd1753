use serde::Serialize;

use overmesh_core::PeerId;

/// What happened to a rendezvous connection or client lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RendezvousEventKind {
    /// A lease offer was accepted and a new connection created.
    Connected,
    /// An existing connection's lease was renewed.
    Reconnected,
    DisconnectedByTimeout,
    /// The rendezvous sent a disconnect notice or a zero lease.
    DisconnectedByPeer,
    /// Removed by a local `disconnect` or a zero-delay `challenge`.
    DisconnectedLocally,
    ClientConnected,
    ClientDisconnected,
    ClientExpired,
}

impl RendezvousEventKind {
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::DisconnectedByTimeout | Self::DisconnectedByPeer | Self::DisconnectedLocally
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RendezvousEvent {
    pub kind: RendezvousEventKind,
    pub peer: PeerId,
}
