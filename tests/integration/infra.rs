use std::sync::{Arc, Mutex};

use anyhow::Result;

use overmesh_core::config::{RendezvousConfig, ResolverConfig, Role};
use overmesh_core::{
    GroupId, PeerDescriptor, PeerId, RendezvousMessage, ResolverQuery, ResolverResponse,
    SrdiMessage, WireMessage,
};
use overmesh_services::{
    HandlerError, MemoryNetwork, MemoryTransport, MessageListener, QueryHandler, QueryOutcome,
    RendezvousManager, ResolverRouter, SeedRoute, SrdiHandler, Transport, UriSeeder,
};

// ── Nodes ─────────────────────────────────────────────────────────────────────

pub const GROUP: &str = "integration";

/// One overlay peer on the in-memory network.
pub struct Node {
    pub peer: PeerId,
    pub transport: MemoryTransport,
    pub rendezvous: RendezvousManager,
    pub resolver: ResolverRouter,
}

pub fn edge_config() -> RendezvousConfig {
    RendezvousConfig::default()
}

pub fn rendezvous_config() -> RendezvousConfig {
    RendezvousConfig {
        role: Role::Rendezvous,
        ..RendezvousConfig::default()
    }
}

/// Attach a node called `name` (address `mem://<name>`) with the given seeds.
pub fn spawn_node(net: &MemoryNetwork, name: &str, config: RendezvousConfig, seeds: &[&str]) -> Node {
    spawn_node_with(net, name, config, ResolverConfig::default(), seeds)
}

pub fn spawn_node_with(
    net: &MemoryNetwork,
    name: &str,
    config: RendezvousConfig,
    resolver_config: ResolverConfig,
    seeds: &[&str],
) -> Node {
    let peer = PeerId::derive(name.as_bytes());
    let transport = net.attach(peer, name);
    let seeds = seeds.iter().map(|s| SeedRoute::address(*s)).collect();
    let only_seeds = config.only_seeds;
    let transport_dyn: Arc<dyn Transport> = Arc::new(transport.clone());
    let rendezvous = RendezvousManager::new(
        GroupId::from_name(GROUP),
        PeerDescriptor {
            peer,
            name: name.to_string(),
            endpoints: Vec::new(),
        },
        config,
        transport_dyn.clone(),
        Arc::new(UriSeeder::new(seeds, only_seeds)),
    );
    let resolver = ResolverRouter::new(resolver_config, transport_dyn, rendezvous.clone());
    Node {
        peer,
        transport,
        rendezvous,
        resolver,
    }
}

/// Lease `edge` to `rdv` and deliver everything.
pub fn lease(net: &MemoryNetwork, edge: &Node, rdv: &Node) {
    edge.rendezvous
        .connect_to_rendezvous(rdv.transport.address(), None);
    edge.rendezvous.tick();
    net.run_until_idle();
    assert!(
        edge.rendezvous.is_connected(&rdv.peer),
        "{} did not lease from {}",
        edge.rendezvous.local_descriptor().name,
        rdv.rendezvous.local_descriptor().name
    );
}

/// Send a raw rendezvous-protocol message from `from` to `to`.
pub fn send_rendezvous(from: &Node, to: &PeerId, message: &RendezvousMessage) -> Result<()> {
    let wire = message.to_wire(from.rendezvous.group().to_string())?;
    from.transport.unicast(to, None, wire)?;
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// Records everything it is handed. With `reply` set it answers each query
/// with the query's own payload.
#[derive(Default)]
pub struct Recorder {
    pub reply: bool,
    pub queries: Mutex<Vec<(PeerId, ResolverQuery)>>,
    pub responses: Mutex<Vec<(PeerId, ResolverResponse)>>,
    pub srdi: Mutex<Vec<(PeerId, SrdiMessage)>>,
}

impl Recorder {
    pub fn replying() -> Self {
        Self {
            reply: true,
            ..Self::default()
        }
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

impl QueryHandler for Recorder {
    fn process_query(
        &self,
        router: &ResolverRouter,
        src: PeerId,
        query: &ResolverQuery,
    ) -> Result<QueryOutcome, HandlerError> {
        self.queries.lock().unwrap().push((src, query.clone()));
        if self.reply {
            let to = query.reply_to().unwrap_or(src);
            router.send_response(
                Some(&to),
                ResolverResponse::to_query(query, query.payload.clone()),
            )?;
        }
        Ok(QueryOutcome::Handled)
    }

    fn process_response(&self, src: PeerId, response: &ResolverResponse) -> Result<(), HandlerError> {
        self.responses.lock().unwrap().push((src, response.clone()));
        Ok(())
    }
}

impl SrdiHandler for Recorder {
    fn process_srdi(&self, src: PeerId, srdi: &SrdiMessage) -> Result<(), HandlerError> {
        self.srdi.lock().unwrap().push((src, srdi.clone()));
        Ok(())
    }
}

/// The rendezvous-protocol message carried by a recorded send, if any.
pub fn rendezvous_message(message: &WireMessage) -> Option<RendezvousMessage> {
    RendezvousMessage::from_wire(message).ok()
}

/// Propagate listener that keeps the origin of every delivery.
#[derive(Default)]
pub struct Collector {
    pub seen: Mutex<Vec<PeerId>>,
}

impl Collector {
    pub fn origins(&self) -> Vec<PeerId> {
        self.seen.lock().unwrap().clone()
    }
}

impl MessageListener for Collector {
    fn on_message(&self, src: PeerId, _message: WireMessage) {
        self.seen.lock().unwrap().push(src);
    }
}
