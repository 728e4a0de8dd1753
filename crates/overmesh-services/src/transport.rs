//! Transport contract: what the overlay core needs from whatever moves bytes.
//!
//! Sends never block on the network. Implementations queue the message and
//! return; failures that can only be detected later are reported as
//! [`TransportEvent::SendFailed`] on the transport's own event channel.

use std::sync::Arc;

use overmesh_core::wire::WireError;
use overmesh_core::{PeerId, RouteDescriptor, WireMessage};

/// Receives inbound messages for one service endpoint.
pub trait MessageListener: Send + Sync {
    /// `src` is the peer that handed us the message (not necessarily its originator).
    fn on_message(&self, src: PeerId, message: WireMessage);

    /// For propagated messages: whether the rendezvous mesh keeps flooding
    /// the message after handing it over. Listeners that re-propagate on
    /// their own terms return false.
    fn relay_propagated(&self) -> bool {
        true
    }
}

pub trait Transport: Send + Sync {
    /// This node's identity.
    fn local_peer(&self) -> PeerId;

    /// Best currently-known route to this node, if the transport has one.
    fn local_route(&self) -> Option<RouteDescriptor>;

    /// Queue `message` for `dest`. `hint` may supply endpoints when the
    /// transport has no cached route for `dest`.
    fn unicast(
        &self,
        dest: &PeerId,
        hint: Option<&RouteDescriptor>,
        message: WireMessage,
    ) -> Result<(), TransportError>;

    /// Queue `message` for a raw endpoint address whose peer is not yet known.
    fn send_to_address(&self, address: &str, message: WireMessage) -> Result<(), TransportError>;

    /// Flood `message` to directly reachable local-network neighbors.
    fn propagate_local(&self, message: WireMessage, ttl: u8) -> Result<(), TransportError>;

    /// Prime the route cache.
    fn add_route(&self, route: &RouteDescriptor);

    /// Register the listener for a service endpoint. Returns the one it replaced.
    fn register_listener(
        &self,
        service: &str,
        param: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Option<Arc<dyn MessageListener>>;

    fn unregister_listener(&self, service: &str, param: &str) -> Option<Arc<dyn MessageListener>>;
}

/// Asynchronous transport notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A queued message to `peer` could not be delivered.
    SendFailed { peer: PeerId },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    NoRoute(PeerId),

    #[error("unusable address: {0}")]
    BadAddress(String),

    #[error("local flood unavailable: {0}")]
    NoLocalNetwork(&'static str),

    #[error("transport is shut down")]
    Closed,

    #[error("frame encoding failed: {0}")]
    Wire(#[from] WireError),
}
