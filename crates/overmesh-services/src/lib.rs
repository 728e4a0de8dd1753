//! overmesh-services: rendezvous connection management and resolver routing.
//!
//! One [`RendezvousManager`] and one [`ResolverRouter`] are built per peer
//! group and handed explicitly to whatever needs them.

pub mod memory;
pub mod rendezvous;
pub mod resolver;
pub mod seeding;
pub mod transport;

pub use memory::{Destination, MemoryNetwork, MemoryTransport, WireRecord};
pub use rendezvous::{
    ConnectionSnapshot, ConnectionState, RendezvousEvent, RendezvousEventKind, RendezvousManager,
    RendezvousMonitor, TickReport,
};
pub use resolver::{
    Disposition, DropReason, HandlerError, HandlerRegistry, QueryHandler, QueryOutcome,
    ResolverError, ResolverRouter, SrdiHandler,
};
pub use seeding::{PeerViewSeeder, SeedError, SeedRoute, SeedingSource, UriSeeder};
pub use transport::{MessageListener, Transport, TransportError, TransportEvent};
