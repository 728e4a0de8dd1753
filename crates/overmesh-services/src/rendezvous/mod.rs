//! Rendezvous connection manager.
//!
//! Keeps up to `target_connections` leased connections to rendezvous peers.
//! Leases are requested from seed candidates, renewed by the monitor before
//! they run out and dropped when they expire or the rendezvous says so.
//!
//! A node with `role = "rendezvous"` also grants leases to clients and walks
//! propagated messages through the mesh, dropping message ids it has seen.
//!
//! All bookkeeping sits behind one `std::sync::Mutex`. It is never held across
//! a transport call: every operation collects its outbound messages under the
//! lock and sends them after releasing it.

mod connection;
mod events;
mod monitor;

pub use connection::{ConnectionSnapshot, ConnectionState};
pub use events::{RendezvousEvent, RendezvousEventKind};
pub use monitor::RendezvousMonitor;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use overmesh_core::config::{RendezvousConfig, Role};
use overmesh_core::message::RENDEZVOUS_SERVICE;
use overmesh_core::{
    GroupId, PeerDescriptor, PeerId, PropagateHeader, RendezvousMessage, RouteDescriptor,
    WireMessage,
};

use crate::seeding::{SeedRoute, SeedingSource};
use crate::transport::{MessageListener, Transport};

use connection::{ClientLease, RendezvousConnection, SeenCache};

const EVENT_CAPACITY: usize = 256;

/// What one monitor tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub expired: usize,
    pub renewals: usize,
    pub lease_requests: usize,
    pub clients_expired: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

enum Outbound {
    Peer {
        peer: PeerId,
        hint: Option<RouteDescriptor>,
        message: RendezvousMessage,
    },
    Address {
        address: String,
        route: Option<RouteDescriptor>,
        message: RendezvousMessage,
    },
}

struct ManagerState {
    connections: HashMap<PeerId, RendezvousConnection>,
    candidates: VecDeque<SeedRoute>,
    clients: HashMap<PeerId, ClientLease>,
    seen: SeenCache,
}

struct Inner {
    group: GroupId,
    /// Rendezvous endpoint param: the group's canonical string.
    param: String,
    local: PeerDescriptor,
    config: RendezvousConfig,
    transport: Arc<dyn Transport>,
    seeding: Arc<dyn SeedingSource>,
    state: Mutex<ManagerState>,
    listeners: DashMap<(String, String), Arc<dyn MessageListener>>,
    events: broadcast::Sender<RendezvousEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.transport
            .unregister_listener(RENDEZVOUS_SERVICE, &self.param);
    }
}

/// Routes rendezvous-endpoint traffic from the transport into the manager.
struct Endpoint(Weak<Inner>);

impl MessageListener for Endpoint {
    fn on_message(&self, src: PeerId, message: WireMessage) {
        if let Some(inner) = self.0.upgrade() {
            RendezvousManager { inner }.process_message_at(src, &message, Instant::now());
        }
    }
}

/// Per-group rendezvous connection manager. Cheap to clone.
#[derive(Clone)]
pub struct RendezvousManager {
    inner: Arc<Inner>,
}

impl RendezvousManager {
    pub fn new(
        group: GroupId,
        mut local: PeerDescriptor,
        config: RendezvousConfig,
        transport: Arc<dyn Transport>,
        seeding: Arc<dyn SeedingSource>,
    ) -> Self {
        if local.endpoints.is_empty() {
            if let Some(route) = transport.local_route() {
                local.endpoints = route.endpoints;
            }
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            param: group.to_string(),
            group,
            local,
            state: Mutex::new(ManagerState {
                connections: HashMap::new(),
                candidates: VecDeque::new(),
                clients: HashMap::new(),
                seen: SeenCache::new(config.seen_cache_size),
            }),
            config,
            transport,
            seeding,
            listeners: DashMap::new(),
            events,
        });
        inner.transport.register_listener(
            RENDEZVOUS_SERVICE,
            &inner.param,
            Arc::new(Endpoint(Arc::downgrade(&inner))),
        );
        tracing::info!(
            group = %inner.group,
            role = ?inner.config.role,
            target = inner.config.target_connections,
            "rendezvous manager started"
        );
        Self { inner }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn group(&self) -> &GroupId {
        &self.inner.group
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local.peer
    }

    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.inner.local
    }

    pub fn config(&self) -> &RendezvousConfig {
        &self.inner.config
    }

    pub fn is_rendezvous(&self) -> bool {
        self.inner.config.role == Role::Rendezvous
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RendezvousEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshots of every live connection, ordered by peer id.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .lock()
            .connections
            .values()
            .map(|c| c.snapshot(now))
            .collect();
        out.sort_by_key(|s| s.peer);
        out
    }

    pub fn connection(&self, peer: &PeerId) -> Option<ConnectionSnapshot> {
        self.lock()
            .connections
            .get(peer)
            .map(|c| c.snapshot(Instant::now()))
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.lock().connections.contains_key(peer)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Peers currently holding a lease granted by this node.
    pub fn clients(&self) -> Vec<PeerDescriptor> {
        let mut out: Vec<_> = self
            .lock()
            .clients
            .values()
            .map(|c| c.descriptor.clone())
            .collect();
        out.sort_by_key(|d| d.peer);
        out
    }

    // ── Propagate listeners ───────────────────────────────────────────────────

    /// Receive propagated messages addressed to `service`/`param`. The
    /// listener sees the originating peer as `src`.
    pub fn register_propagate_listener(
        &self,
        service: &str,
        param: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Option<Arc<dyn MessageListener>> {
        self.inner
            .listeners
            .insert((service.to_string(), param.to_string()), listener)
    }

    pub fn unregister_propagate_listener(
        &self,
        service: &str,
        param: &str,
    ) -> Option<Arc<dyn MessageListener>> {
        self.inner
            .listeners
            .remove(&(service.to_string(), param.to_string()))
            .map(|(_, l)| l)
    }

    // ── Control ───────────────────────────────────────────────────────────────

    /// Add a candidate. The lease request goes out on the next tick.
    pub fn connect_to_rendezvous(&self, address: impl Into<String>, hint: Option<RouteDescriptor>) {
        let seed = SeedRoute {
            address: address.into(),
            route: hint,
        };
        tracing::info!(address = %seed.address, "rendezvous candidate added");
        self.inner.seeding.add_seed(seed.clone());
        self.lock().candidates.push_front(seed);
    }

    pub fn challenge(&self, peer: &PeerId, delay: Duration) -> bool {
        self.challenge_at(peer, delay, Instant::now())
    }

    /// Zero `delay` drops the connection now. Otherwise the lease is cut to
    /// end no later than `now + delay`. Returns false for unknown peers.
    pub fn challenge_at(&self, peer: &PeerId, delay: Duration, now: Instant) -> bool {
        if delay.is_zero() {
            let removed = self.remove_connection(peer, RendezvousEventKind::DisconnectedLocally);
            if removed {
                tracing::info!(peer = %peer, "rendezvous connection dropped by challenge");
            }
            return removed;
        }
        match self.lock().connections.get_mut(peer) {
            Some(conn) => {
                conn.clamp(now, delay);
                tracing::debug!(peer = %peer, delay_ms = delay.as_millis() as u64, "rendezvous lease challenged");
                true
            }
            None => false,
        }
    }

    /// Send a disconnect notice, then drop the connection.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let hint = match self.lock().connections.get(peer) {
            Some(conn) => conn.descriptor.route(),
            None => return false,
        };
        self.send_all(vec![Outbound::Peer {
            peer: *peer,
            hint: Some(hint),
            message: self.disconnect_notice(),
        }]);
        let removed = self.remove_connection(peer, RendezvousEventKind::DisconnectedLocally);
        if removed {
            tracing::info!(peer = %peer, "rendezvous connection closed");
        }
        removed
    }

    /// Drop every connection and every client lease, notifying each peer.
    pub fn disconnect_all(&self) {
        let peers: Vec<PeerId> = self.lock().connections.keys().copied().collect();
        for peer in peers {
            self.disconnect(&peer);
        }

        let clients: Vec<ClientLease> = self.lock().clients.drain().map(|(_, c)| c).collect();
        let mut out = Vec::with_capacity(clients.len());
        let mut events = Vec::with_capacity(clients.len());
        for client in clients {
            events.push(RendezvousEvent {
                kind: RendezvousEventKind::ClientDisconnected,
                peer: client.descriptor.peer,
            });
            out.push(Outbound::Peer {
                peer: client.descriptor.peer,
                hint: Some(client.descriptor.route()),
                message: self.disconnect_notice(),
            });
        }
        self.send_all(out);
        self.emit(events);
    }

    /// Walk `message` through the rendezvous mesh as `service`/`param`.
    /// Returns the number of peers it was handed to.
    pub fn propagate(&self, message: WireMessage, service: &str, param: &str, ttl: u8) -> usize {
        let ttl = ttl.min(self.inner.config.max_ttl);
        if ttl == 0 {
            return 0;
        }
        let msg_id: u64 = rand::random();
        let targets = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.seen.insert(msg_id);
            let mut targets: Vec<RouteDescriptor> =
                st.connections.values().map(|c| c.descriptor.route()).collect();
            if self.is_rendezvous() {
                targets.extend(st.clients.values().map(|c| c.descriptor.route()));
            }
            targets
        };
        if targets.is_empty() {
            tracing::trace!(service, param, "no rendezvous peers to propagate to");
            return 0;
        }

        let header = PropagateHeader {
            msg_id,
            ttl,
            path: vec![self.local_peer()],
        };
        let message = message.readdress(service, param);
        let out = targets
            .into_iter()
            .map(|route| Outbound::Peer {
                peer: route.peer,
                hint: Some(route),
                message: RendezvousMessage::Propagate {
                    header: header.clone(),
                    message: message.clone(),
                },
            })
            .collect();
        self.send_all(out)
    }

    // ── Monitor tick ──────────────────────────────────────────────────────────

    pub fn tick(&self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// One monitor pass: expire, renew, expire clients, then top up.
    pub fn tick_at(&self, now: Instant) -> TickReport {
        let refill = if self.wants_candidates() {
            Some(self.inner.seeding.active_seed_routes())
        } else {
            None
        };

        let request = self.lease_request();
        let mut report = TickReport::default();
        let mut out = Vec::new();
        let mut events = Vec::new();
        {
            let mut guard = self.lock();
            let st = &mut *guard;

            let expired: Vec<PeerId> = st
                .connections
                .iter()
                .filter(|(_, c)| c.is_expired(now))
                .map(|(p, _)| *p)
                .collect();
            for peer in expired {
                if let Some(mut conn) = st.connections.remove(&peer) {
                    conn.connected = false;
                    tracing::info!(peer = %peer, "rendezvous lease expired");
                    events.push(RendezvousEvent {
                        kind: RendezvousEventKind::DisconnectedByTimeout,
                        peer,
                    });
                    report.expired += 1;
                }
            }

            for (peer, conn) in st.connections.iter_mut() {
                if conn.renewal_due(now) {
                    conn.state = ConnectionState::RenewalPending;
                    out.push(Outbound::Peer {
                        peer: *peer,
                        hint: Some(conn.descriptor.route()),
                        message: request.clone(),
                    });
                    report.renewals += 1;
                }
            }

            let lapsed: Vec<PeerId> = st
                .clients
                .iter()
                .filter(|(_, c)| now >= c.expires)
                .map(|(p, _)| *p)
                .collect();
            for peer in lapsed {
                st.clients.remove(&peer);
                tracing::debug!(peer = %peer, "client lease expired");
                events.push(RendezvousEvent {
                    kind: RendezvousEventKind::ClientExpired,
                    peer,
                });
                report.clients_expired += 1;
            }

            if st.connections.len() < self.inner.config.target_connections {
                if st.candidates.is_empty() {
                    if let Some(routes) = refill {
                        st.candidates.extend(routes);
                    }
                }
                while report.lease_requests < self.inner.config.max_candidates_per_tick {
                    let Some(seed) = st.candidates.pop_front() else {
                        break;
                    };
                    if let Some(route) = &seed.route {
                        if route.peer == self.inner.local.peer
                            || st.connections.contains_key(&route.peer)
                        {
                            continue;
                        }
                    }
                    out.push(Outbound::Address {
                        address: seed.address,
                        route: seed.route,
                        message: request.clone(),
                    });
                    report.lease_requests += 1;
                }
                if report.lease_requests == 0 {
                    tracing::debug!("below rendezvous target and no candidates left");
                }
            }
        }

        self.emit(events);
        self.send_all(out);
        report
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Handle one message from the rendezvous endpoint, as of `now`.
    pub fn process_message_at(&self, src: PeerId, message: &WireMessage, now: Instant) {
        let msg = match RendezvousMessage::from_wire(message) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(peer = %src, error = %e, "malformed rendezvous message dropped");
                return;
            }
        };
        match msg {
            RendezvousMessage::LeaseRequest { descriptor } => {
                self.on_lease_request(src, descriptor, now)
            }
            RendezvousMessage::LeaseReply {
                descriptor,
                lease_ms,
            } => self.on_lease_reply(src, descriptor, lease_ms, now),
            RendezvousMessage::Disconnect { peer } => self.on_disconnect(src, peer),
            RendezvousMessage::Propagate { header, message } => {
                self.on_propagate(src, header, message)
            }
        }
    }

    fn on_lease_reply(&self, src: PeerId, descriptor: PeerDescriptor, lease_ms: i64, now: Instant) {
        let peer = descriptor.peer;
        if peer != src || peer == self.local_peer() {
            tracing::debug!(peer = %src, claimed = %peer, "lease reply with mismatched descriptor dropped");
            return;
        }

        if lease_ms <= 0 {
            if self.remove_connection(&peer, RendezvousEventKind::DisconnectedByPeer) {
                tracing::info!(peer = %peer, "rendezvous ended lease");
            }
            return;
        }

        let target = self.inner.config.target_connections;
        {
            let st = self.lock();
            if !st.connections.contains_key(&peer) && st.connections.len() >= target {
                tracing::debug!(peer = %peer, "lease offer ignored, connection target reached");
                return;
            }
        }

        if !self.inner.seeding.is_acceptable(&descriptor) {
            tracing::debug!(peer = %peer, "unacceptable lease offer dropped");
            if self.inner.config.refuse_unacceptable {
                self.send_all(vec![Outbound::Peer {
                    peer,
                    hint: Some(descriptor.route()),
                    message: self.disconnect_notice(),
                }]);
            }
            return;
        }

        let lease = Duration::from_millis(lease_ms as u64);
        let margin = self.inner.config.renewal_margin().min(lease / 2);
        let route = descriptor.route();
        let kind = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if let Some(conn) = st.connections.get_mut(&peer) {
                conn.renew(descriptor, now, lease, margin);
                Some(RendezvousEventKind::Reconnected)
            } else if st.connections.len() < target {
                st.connections.insert(
                    peer,
                    RendezvousConnection::new(descriptor, now, lease, margin),
                );
                Some(RendezvousEventKind::Connected)
            } else {
                None
            }
        };
        let Some(kind) = kind else {
            return;
        };

        self.inner.transport.add_route(&route);
        match kind {
            RendezvousEventKind::Connected => {
                tracing::info!(peer = %peer, lease_ms, "rendezvous lease granted")
            }
            _ => tracing::debug!(peer = %peer, lease_ms, "rendezvous lease renewed"),
        }
        self.emit(vec![RendezvousEvent { kind, peer }]);
    }

    fn on_lease_request(&self, src: PeerId, descriptor: PeerDescriptor, now: Instant) {
        if !self.is_rendezvous() {
            tracing::debug!(peer = %src, "lease request ignored, not a rendezvous");
            return;
        }
        if descriptor.peer != src || src == self.local_peer() {
            tracing::debug!(peer = %src, "lease request with mismatched descriptor dropped");
            return;
        }

        let granted = self.inner.config.granted_lease();
        let granted_ms = i64::try_from(self.inner.config.granted_lease_ms).unwrap_or(i64::MAX);
        let route = descriptor.route();
        let (lease_ms, new_client) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if let Some(client) = st.clients.get_mut(&src) {
                client.descriptor = descriptor;
                client.expires = now + granted;
                (granted_ms, false)
            } else if st.clients.len() < self.inner.config.max_clients {
                st.clients.insert(
                    src,
                    ClientLease {
                        descriptor,
                        expires: now + granted,
                    },
                );
                (granted_ms, true)
            } else {
                (0, false)
            }
        };

        self.inner.transport.add_route(&route);
        if new_client {
            tracing::info!(peer = %src, lease_ms, "client lease granted");
            self.emit(vec![RendezvousEvent {
                kind: RendezvousEventKind::ClientConnected,
                peer: src,
            }]);
        } else if lease_ms == 0 {
            tracing::warn!(peer = %src, max = self.inner.config.max_clients, "client table full, lease refused");
        }

        self.send_all(vec![Outbound::Peer {
            peer: src,
            hint: Some(route),
            message: RendezvousMessage::LeaseReply {
                descriptor: self.inner.local.clone(),
                lease_ms,
            },
        }]);
    }

    fn on_disconnect(&self, src: PeerId, peer: PeerId) {
        if peer != src {
            tracing::debug!(peer = %src, claimed = %peer, "disconnect notice for another peer dropped");
            return;
        }
        if self.remove_connection(&src, RendezvousEventKind::DisconnectedByPeer) {
            tracing::info!(peer = %src, "rendezvous sent disconnect");
        }
        let client = self.lock().clients.remove(&src);
        if client.is_some() {
            tracing::debug!(peer = %src, "client released lease");
            self.emit(vec![RendezvousEvent {
                kind: RendezvousEventKind::ClientDisconnected,
                peer: src,
            }]);
        }
    }

    fn on_propagate(&self, src: PeerId, header: PropagateHeader, message: WireMessage) {
        if header.ttl == 0 {
            tracing::debug!(peer = %src, "propagated message with zero ttl dropped");
            return;
        }
        let origin = header.path.first().copied().unwrap_or(src);
        let local = self.local_peer();

        let forward: Vec<RouteDescriptor> = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if !st.seen.insert(header.msg_id) {
                tracing::trace!(peer = %src, msg_id = header.msg_id, "duplicate propagated message dropped");
                return;
            }
            if self.is_rendezvous() && header.ttl > 1 {
                st.connections
                    .values()
                    .map(|c| &c.descriptor)
                    .chain(st.clients.values().map(|c| &c.descriptor))
                    .filter(|d| d.peer != src && d.peer != local && !header.path.contains(&d.peer))
                    .map(|d| d.route())
                    .collect()
            } else {
                Vec::new()
            }
        };

        let key = (message.service.clone(), message.param.clone());
        let listener = self.inner.listeners.get(&key).map(|l| l.value().clone());
        let relay = match listener {
            Some(listener) => {
                listener.on_message(origin, message.clone());
                listener.relay_propagated()
            }
            None => {
                tracing::trace!(service = %key.0, param = %key.1, "no propagate listener");
                true
            }
        };

        if forward.is_empty() || !relay {
            return;
        }
        let mut path = header.path;
        path.push(local);
        let header = PropagateHeader {
            msg_id: header.msg_id,
            ttl: header.ttl - 1,
            path,
        };
        let out = forward
            .into_iter()
            .map(|route| Outbound::Peer {
                peer: route.peer,
                hint: Some(route),
                message: RendezvousMessage::Propagate {
                    header: header.clone(),
                    message: message.clone(),
                },
            })
            .collect();
        self.send_all(out);
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wants_candidates(&self) -> bool {
        let st = self.lock();
        st.connections.len() < self.inner.config.target_connections && st.candidates.is_empty()
    }

    fn lease_request(&self) -> RendezvousMessage {
        RendezvousMessage::LeaseRequest {
            descriptor: self.inner.local.clone(),
        }
    }

    fn disconnect_notice(&self) -> RendezvousMessage {
        RendezvousMessage::Disconnect {
            peer: self.local_peer(),
        }
    }

    /// Remove `peer` and raise `kind`. False if it was not connected.
    fn remove_connection(&self, peer: &PeerId, kind: RendezvousEventKind) -> bool {
        let removed = self.lock().connections.remove(peer).map(|mut conn| {
            conn.connected = false;
        });
        if removed.is_some() {
            self.emit(vec![RendezvousEvent { kind, peer: *peer }]);
        }
        removed.is_some()
    }

    fn emit(&self, events: Vec<RendezvousEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.inner.events.send(event);
        }
    }

    /// Send everything in `out`. Returns how many sends the transport took.
    fn send_all(&self, out: Vec<Outbound>) -> usize {
        let transport = &self.inner.transport;
        let mut sent = 0;
        for item in out {
            let result = match item {
                Outbound::Peer {
                    peer,
                    hint,
                    message,
                } => {
                    let Some(wire) = self.encode(&message) else {
                        continue;
                    };
                    transport
                        .unicast(&peer, hint.as_ref(), wire)
                        .map_err(|e| (peer.to_string(), e))
                }
                Outbound::Address {
                    address,
                    route,
                    message,
                } => {
                    let Some(wire) = self.encode(&message) else {
                        continue;
                    };
                    if let Some(route) = &route {
                        transport.add_route(route);
                    }
                    transport
                        .send_to_address(&address, wire)
                        .map_err(|e| (address, e))
                }
            };
            match result {
                Ok(()) => sent += 1,
                Err((to, e)) => tracing::warn!(to = %to, error = %e, "rendezvous send failed"),
            }
        }
        sent
    }

    fn encode(&self, message: &RendezvousMessage) -> Option<WireMessage> {
        match message.to_wire(self.inner.param.as_str()) {
            Ok(wire) => Some(wire),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode rendezvous message");
                None
            }
        }
    }
}
