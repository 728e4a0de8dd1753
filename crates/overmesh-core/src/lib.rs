//! overmesh-core: identifiers, wire format, message types and configuration.
//! All other Overmesh crates depend on this one.

pub mod codec;
pub mod config;
pub mod id;
pub mod message;
pub mod wire;

pub use id::{AnyId, GroupId, IdError, IdRegistry, PeerId};
pub use message::{
    Credential, Document, MessageKind, PeerDescriptor, PropagateHeader, RendezvousMessage,
    ResolverQuery, ResolverResponse, RouteDescriptor, SrdiMessage,
};
pub use wire::{Encoding, WireMessage};
