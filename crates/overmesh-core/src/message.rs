//! Overlay protocol messages.
//!
//! Resolver messages (query, response, SRDI) travel as JSON documents inside a
//! [`WireMessage`](crate::wire::WireMessage). Rendezvous lease traffic and
//! propagation use [`RendezvousMessage`] on the rendezvous service endpoint.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::id::{GroupId, PeerId};
use crate::wire::{Encoding, WireMessage};

/// Free-form JSON payload carried by resolver messages.
pub type Document = serde_json::Value;

/// Service name of the rendezvous lease/propagation endpoint.
pub const RENDEZVOUS_SERVICE: &str = "overmesh.rendezvous";

/// Service name of the resolver endpoints.
pub const RESOLVER_SERVICE: &str = "overmesh.resolver";

// ── Peers and routes ──────────────────────────────────────────────────────────

/// How to reach a peer: its identity plus transport endpoints,
/// e.g. `udp://[fe80::1%2]:9700`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    pub peer: PeerId,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Snapshot of what a peer says about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer: PeerId,
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl PeerDescriptor {
    pub fn route(&self) -> RouteDescriptor {
        RouteDescriptor {
            peer: self.peer,
            endpoints: self.endpoints.clone(),
        }
    }
}

/// Opaque credential document. Attached to outgoing messages; the router
/// never inspects or verifies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(pub Document);

// ── Resolver messages ─────────────────────────────────────────────────────────

/// The three resolver message classes, one endpoint param each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Query,
    Response,
    Srdi,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [MessageKind::Query, MessageKind::Response, MessageKind::Srdi];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Query => "query",
            MessageKind::Response => "response",
            MessageKind::Srdi => "srdi",
        }
    }

    /// Endpoint param for this kind within a group, e.g. `<group-urn>/query`.
    pub fn param(&self, group: &GroupId) -> String {
        format!("{}/{}", group, self.as_str())
    }
}

/// A resolver request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverQuery {
    /// Selects the registered handler that consumes this query.
    pub handler_name: String,
    /// Correlates responses with this query. Opaque to the router.
    pub query_id: i64,
    /// Number of router re-propagations so far.
    #[serde(default)]
    pub hop_count: u32,
    /// Peer that issued the query. Filled in by the sending router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<PeerId>,
    /// Lets a responder reply without its own route discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_route: Option<RouteDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    pub payload: Document,
}

impl ResolverQuery {
    pub fn new(handler_name: impl Into<String>, query_id: i64, payload: Document) -> Self {
        Self {
            handler_name: handler_name.into(),
            query_id,
            hop_count: 0,
            origin: None,
            source_route: None,
            credential: None,
            payload,
        }
    }

    pub fn with_source_route(mut self, route: RouteDescriptor) -> Self {
        self.source_route = Some(route);
        self
    }

    /// Count one more re-propagation. Returns the new hop count.
    pub fn increment_hop_count(&mut self) -> u32 {
        self.hop_count = self.hop_count.saturating_add(1);
        self.hop_count
    }

    /// Where a response to this query should go.
    pub fn reply_to(&self) -> Option<PeerId> {
        self.origin
            .or_else(|| self.source_route.as_ref().map(|r| r.peer))
    }
}

/// A reply to a [`ResolverQuery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverResponse {
    pub handler_name: String,
    pub query_id: i64,
    #[serde(default)]
    pub hop_count: u32,
    /// Peer that produced the response. Filled in by the sending router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_route: Option<RouteDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    pub payload: Document,
}

impl ResolverResponse {
    pub fn new(handler_name: impl Into<String>, query_id: i64, payload: Document) -> Self {
        Self {
            handler_name: handler_name.into(),
            query_id,
            hop_count: 0,
            origin: None,
            source_route: None,
            credential: None,
            payload,
        }
    }

    /// Response addressed to the same handler and query id as `query`.
    /// Carries the query's source route so the reply can be unicast back.
    pub fn to_query(query: &ResolverQuery, payload: Document) -> Self {
        let mut response = Self::new(query.handler_name.clone(), query.query_id, payload);
        response.source_route = query.source_route.clone();
        response
    }

    pub fn with_source_route(mut self, route: RouteDescriptor) -> Self {
        self.source_route = Some(route);
        self
    }
}

/// Shared-resource index update. Always compressed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SrdiMessage {
    pub handler_name: String,
    #[serde(default)]
    pub query_id: i64,
    #[serde(default)]
    pub hop_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_route: Option<RouteDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    pub payload: Document,
}

impl SrdiMessage {
    pub fn new(handler_name: impl Into<String>, payload: Document) -> Self {
        Self {
            handler_name: handler_name.into(),
            query_id: 0,
            hop_count: 0,
            origin: None,
            source_route: None,
            credential: None,
            payload,
        }
    }
}

// ── Rendezvous protocol ───────────────────────────────────────────────────────

/// Header prepended to every propagated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagateHeader {
    /// Random id, used by rendezvous peers to drop repeats.
    pub msg_id: u64,
    /// Remaining rendezvous hops.
    pub ttl: u8,
    /// Peers that have already forwarded this message, originator first.
    #[serde(default)]
    pub path: Vec<PeerId>,
}

/// Messages on the rendezvous service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RendezvousMessage {
    /// Edge → rendezvous: request or renew a lease.
    LeaseRequest { descriptor: PeerDescriptor },

    /// Rendezvous → edge: lease offer. `lease_ms <= 0` means "disconnected".
    LeaseReply {
        descriptor: PeerDescriptor,
        lease_ms: i64,
    },

    /// Either direction: the sender is tearing the lease down.
    Disconnect { peer: PeerId },

    /// A message being walked through the rendezvous mesh. Only the inner
    /// message's address goes into the JSON envelope; its body follows the
    /// envelope raw (see [`RendezvousMessage::to_wire`]).
    Propagate {
        header: PropagateHeader,
        #[serde(with = "inner_address")]
        message: WireMessage,
    },
}

/// Ends the JSON envelope of a propagate message. JSON text never contains
/// a literal NUL, so the first one marks where the raw body starts.
const BODY_SEPARATOR: u8 = 0x00;

impl RendezvousMessage {
    /// Encode for the rendezvous endpoint `param`.
    pub fn to_wire(&self, param: impl Into<String>) -> Result<WireMessage, CodecError> {
        let body = match self {
            Self::Propagate { message, .. } => {
                let mut out = serde_json::to_vec(self)?;
                out.reserve(1 + message.body.len());
                out.push(BODY_SEPARATOR);
                out.extend_from_slice(&message.body);
                Bytes::from(out)
            }
            _ => codec::encode(self, Encoding::Json)?,
        };
        Ok(WireMessage {
            service: RENDEZVOUS_SERVICE.to_string(),
            param: param.into(),
            encoding: Encoding::Json,
            body,
        })
    }

    /// Decode a rendezvous endpoint message, reattaching a propagated body.
    pub fn from_wire(wire: &WireMessage) -> Result<Self, CodecError> {
        if wire.encoding != Encoding::Json {
            return wire.decode();
        }
        let split = wire.body.iter().position(|b| *b == BODY_SEPARATOR);
        let envelope = match split {
            Some(at) => &wire.body[..at],
            None => &wire.body[..],
        };
        let mut decoded: Self = serde_json::from_slice(envelope)?;
        if let (Self::Propagate { message, .. }, Some(at)) = (&mut decoded, split) {
            message.body = wire.body.slice(at + 1..);
        }
        Ok(decoded)
    }
}

/// Serializes a [`WireMessage`] as its address and encoding only.
mod inner_address {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::wire::{Encoding, WireMessage};

    #[derive(Serialize)]
    struct Borrowed<'a> {
        service: &'a str,
        param: &'a str,
        encoding: Encoding,
    }

    #[derive(Deserialize)]
    struct Owned {
        service: String,
        param: String,
        encoding: Encoding,
    }

    pub fn serialize<S>(message: &WireMessage, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        Borrowed {
            service: &message.service,
            param: &message.param,
            encoding: message.encoding,
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<WireMessage, D::Error>
    where
        D: Deserializer<'de>,
    {
        let owned = Owned::deserialize(deserializer)?;
        Ok(WireMessage {
            service: owned.service,
            param: owned.param,
            encoding: owned.encoding,
            body: Bytes::new(),
        })
    }
}
