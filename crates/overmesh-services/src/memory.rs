//! In-memory transport.
//!
//! Every attached node gets a `mem://<name>` address. Sends are queued on the
//! shared [`MemoryNetwork`] and delivered only when the owner calls
//! [`MemoryNetwork::deliver_next`] or [`MemoryNetwork::run_until_idle`], which
//! keeps multi-node scenarios deterministic. Every send is also recorded as a
//! [`WireRecord`] so callers can inspect exactly what went on the wire.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tokio::sync::broadcast;

use overmesh_core::{PeerId, RouteDescriptor, WireMessage};

use crate::transport::{MessageListener, Transport, TransportError, TransportEvent};

/// Upper bound on deliveries in one `run_until_idle` call. Hitting it means
/// two nodes are bouncing messages forever.
const MAX_DELIVERIES: usize = 100_000;

/// Where a recorded message was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Peer(PeerId),
    Address(String),
    Neighbors { ttl: u8 },
}

/// One send, as seen on the wire.
#[derive(Debug, Clone)]
pub struct WireRecord {
    pub from: PeerId,
    pub to: Destination,
    pub message: WireMessage,
}

struct Delivery {
    from: PeerId,
    to: PeerId,
    message: WireMessage,
}

struct NodeState {
    peer: PeerId,
    address: String,
    listeners: DashMap<(String, String), Arc<dyn MessageListener>>,
    routes: DashMap<PeerId, RouteDescriptor>,
    events: broadcast::Sender<TransportEvent>,
}

impl NodeState {
    fn route(&self) -> RouteDescriptor {
        RouteDescriptor {
            peer: self.peer,
            endpoints: vec![self.address.clone()],
        }
    }
}

#[derive(Default)]
struct NetworkInner {
    nodes: DashMap<PeerId, Arc<NodeState>>,
    addresses: DashMap<String, PeerId>,
    links: Mutex<HashSet<(PeerId, PeerId)>>,
    queue: Mutex<VecDeque<Delivery>>,
    records: Mutex<Vec<WireRecord>>,
}

/// A shared in-memory network segment.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Its address is `mem://<name>`.
    pub fn attach(&self, peer: PeerId, name: &str) -> MemoryTransport {
        let (events, _) = broadcast::channel(64);
        let node = Arc::new(NodeState {
            peer,
            address: format!("mem://{name}"),
            listeners: DashMap::new(),
            routes: DashMap::new(),
            events,
        });
        self.inner.addresses.insert(node.address.clone(), peer);
        self.inner.nodes.insert(peer, node.clone());
        MemoryTransport {
            network: self.clone(),
            node,
        }
    }

    /// Remove a node. Messages still queued for it fail on delivery.
    pub fn detach(&self, peer: &PeerId) {
        if let Some((_, node)) = self.inner.nodes.remove(peer) {
            self.inner.addresses.remove(&node.address);
        }
    }

    /// Make two nodes local-network neighbors of each other.
    pub fn link(&self, a: &PeerId, b: &PeerId) {
        let mut links = lock(&self.inner.links);
        links.insert((*a, *b));
        links.insert((*b, *a));
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Deliver one queued message. Returns false if the queue was empty.
    pub fn deliver_next(&self) -> bool {
        let next = lock(&self.inner.queue).pop_front();
        let Some(delivery) = next else {
            return false;
        };

        let target = self.inner.nodes.get(&delivery.to).map(|n| n.value().clone());
        let Some(target) = target else {
            tracing::debug!(to = %delivery.to, "memory delivery to detached node");
            if let Some(sender) = self.inner.nodes.get(&delivery.from) {
                let _ = sender
                    .events
                    .send(TransportEvent::SendFailed { peer: delivery.to });
            }
            return true;
        };

        if let Some(sender) = self.inner.nodes.get(&delivery.from) {
            target.routes.insert(delivery.from, sender.route());
        }

        let key = (delivery.message.service.clone(), delivery.message.param.clone());
        let listener = target.listeners.get(&key).map(|l| l.value().clone());
        match listener {
            Some(listener) => listener.on_message(delivery.from, delivery.message),
            None => tracing::trace!(
                service = %key.0,
                param = %key.1,
                "no listener for memory delivery"
            ),
        }
        true
    }

    /// Deliver until the queue is empty. Returns the number of deliveries.
    pub fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES && self.deliver_next() {
            delivered += 1;
        }
        delivered
    }

    /// Everything sent so far.
    pub fn records(&self) -> Vec<WireRecord> {
        lock(&self.inner.records).clone()
    }

    pub fn clear_records(&self) {
        lock(&self.inner.records).clear();
    }

    /// Drop everything still queued.
    pub fn drop_pending(&self) -> usize {
        let mut queue = lock(&self.inner.queue);
        let n = queue.len();
        queue.clear();
        n
    }

    fn record(&self, from: PeerId, to: Destination, message: &WireMessage) {
        lock(&self.inner.records).push(WireRecord {
            from,
            to,
            message: message.clone(),
        });
    }

    fn enqueue(&self, from: PeerId, to: PeerId, message: WireMessage) {
        lock(&self.inner.queue).push_back(Delivery { from, to, message });
    }

    fn neighbors_of(&self, peer: &PeerId) -> Vec<PeerId> {
        lock(&self.inner.links)
            .iter()
            .filter(|(a, _)| a == peer)
            .map(|(_, b)| *b)
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    node: Arc<NodeState>,
}

impl MemoryTransport {
    pub fn address(&self) -> &str {
        &self.node.address
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.node.events.subscribe()
    }

    pub fn knows_route(&self, peer: &PeerId) -> bool {
        self.node.routes.contains_key(peer)
    }

    fn resolve_hint(&self, dest: &PeerId, hint: Option<&RouteDescriptor>) -> bool {
        let Some(hint) = hint.filter(|h| h.peer == *dest) else {
            return false;
        };
        let reachable = hint.endpoints.iter().any(|ep| {
            self.network
                .inner
                .addresses
                .get(ep)
                .is_some_and(|p| *p.value() == *dest)
        });
        if reachable {
            self.node.routes.insert(*dest, hint.clone());
        }
        reachable
    }
}

impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.node.peer
    }

    fn local_route(&self) -> Option<RouteDescriptor> {
        Some(self.node.route())
    }

    fn unicast(
        &self,
        dest: &PeerId,
        hint: Option<&RouteDescriptor>,
        message: WireMessage,
    ) -> Result<(), TransportError> {
        if !self.node.routes.contains_key(dest) && !self.resolve_hint(dest, hint) {
            return Err(TransportError::NoRoute(*dest));
        }
        self.network
            .record(self.node.peer, Destination::Peer(*dest), &message);
        self.network.enqueue(self.node.peer, *dest, message);
        Ok(())
    }

    fn send_to_address(&self, address: &str, message: WireMessage) -> Result<(), TransportError> {
        if !address.starts_with("mem://") {
            return Err(TransportError::BadAddress(address.to_string()));
        }
        self.network.record(
            self.node.peer,
            Destination::Address(address.to_string()),
            &message,
        );
        let target = self.network.inner.addresses.get(address).map(|p| *p.value());
        match target {
            Some(peer) => self.network.enqueue(self.node.peer, peer, message),
            None => tracing::trace!(address, "memory send to unknown address lost"),
        }
        Ok(())
    }

    fn propagate_local(&self, message: WireMessage, ttl: u8) -> Result<(), TransportError> {
        if ttl == 0 {
            return Ok(());
        }
        let neighbors = self.network.neighbors_of(&self.node.peer);
        if neighbors.is_empty() {
            return Ok(());
        }
        self.network
            .record(self.node.peer, Destination::Neighbors { ttl }, &message);
        for peer in neighbors {
            self.network.enqueue(self.node.peer, peer, message.clone());
        }
        Ok(())
    }

    fn add_route(&self, route: &RouteDescriptor) {
        if route.peer != self.node.peer {
            self.node.routes.insert(route.peer, route.clone());
        }
    }

    fn register_listener(
        &self,
        service: &str,
        param: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Option<Arc<dyn MessageListener>> {
        self.node
            .listeners
            .insert((service.to_string(), param.to_string()), listener)
    }

    fn unregister_listener(&self, service: &str, param: &str) -> Option<Arc<dyn MessageListener>> {
        self.node
            .listeners
            .remove(&(service.to_string(), param.to_string()))
            .map(|(_, l)| l)
    }
}
