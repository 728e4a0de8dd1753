//! Lease bookkeeping for one rendezvous connection and one client.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use overmesh_core::{PeerDescriptor, PeerId};

/// Where a live connection is in its lease cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Leased,
    /// A renewal request went out and no reply has arrived yet.
    RenewalPending,
}

pub(crate) struct RendezvousConnection {
    pub descriptor: PeerDescriptor,
    pub lease_start: Instant,
    pub lease_end: Instant,
    pub renewal_margin: Duration,
    pub state: ConnectionState,
    pub connected: bool,
}

impl RendezvousConnection {
    pub fn new(descriptor: PeerDescriptor, now: Instant, lease: Duration, margin: Duration) -> Self {
        Self {
            descriptor,
            lease_start: now,
            lease_end: now + lease,
            renewal_margin: margin,
            state: ConnectionState::Leased,
            connected: true,
        }
    }

    pub fn renew(&mut self, descriptor: PeerDescriptor, now: Instant, lease: Duration, margin: Duration) {
        self.descriptor = descriptor;
        self.lease_end = now + lease;
        self.renewal_margin = margin;
        self.state = ConnectionState::Leased;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.lease_end
    }

    pub fn renewal_due(&self, now: Instant) -> bool {
        let renew_at = self
            .lease_end
            .checked_sub(self.renewal_margin)
            .unwrap_or(self.lease_start);
        now >= renew_at
    }

    /// Shorten the lease so it ends no later than `now + delay`.
    pub fn clamp(&mut self, now: Instant, delay: Duration) {
        self.lease_end = self.lease_end.min(now + delay);
    }

    pub fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        ConnectionSnapshot {
            peer: self.descriptor.peer,
            name: self.descriptor.name.clone(),
            endpoints: self.descriptor.endpoints.clone(),
            state: self.state,
            connected: self.connected,
            lease_remaining_ms: self.lease_end.saturating_duration_since(now).as_millis() as u64,
            renewal_margin_ms: self.renewal_margin.as_millis() as u64,
            lease_start: self.lease_start,
            lease_end: self.lease_end,
        }
    }
}

/// Read-only view of a rendezvous connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub peer: PeerId,
    pub name: String,
    pub endpoints: Vec<String>,
    pub state: ConnectionState,
    pub connected: bool,
    pub lease_remaining_ms: u64,
    pub renewal_margin_ms: u64,
    #[serde(skip)]
    pub lease_start: Instant,
    #[serde(skip)]
    pub lease_end: Instant,
}

impl ConnectionSnapshot {
    /// First instant at which the monitor sends a renewal.
    pub fn renew_at(&self) -> Instant {
        self.lease_end
            .checked_sub(Duration::from_millis(self.renewal_margin_ms))
            .unwrap_or(self.lease_start)
    }
}

/// A lease this node granted, when acting as a rendezvous.
#[derive(Debug, Clone)]
pub(crate) struct ClientLease {
    pub descriptor: PeerDescriptor,
    pub expires: Instant,
}

/// Message ids already seen, oldest evicted first.
pub(crate) struct SeenCache {
    ids: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if `id` was already present.
    pub fn insert(&mut self, id: u64) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> PeerDescriptor {
        PeerDescriptor {
            peer: PeerId::derive(b"rdv"),
            name: "rdv".into(),
            endpoints: vec!["mem://rdv".into()],
        }
    }

    #[test]
    fn renewal_due_at_lease_end_minus_margin() {
        let t0 = Instant::now();
        let conn = RendezvousConnection::new(
            descriptor(),
            t0,
            Duration::from_millis(300_000),
            Duration::from_millis(60_000),
        );
        assert!(!conn.renewal_due(t0 + Duration::from_millis(239_999)));
        assert!(conn.renewal_due(t0 + Duration::from_millis(240_000)));
        assert!(!conn.is_expired(t0 + Duration::from_millis(299_999)));
        assert!(conn.is_expired(t0 + Duration::from_millis(300_000)));
    }

    #[test]
    fn clamp_never_extends() {
        let t0 = Instant::now();
        let mut conn = RendezvousConnection::new(
            descriptor(),
            t0,
            Duration::from_secs(10),
            Duration::from_secs(2),
        );
        conn.clamp(t0, Duration::from_secs(60));
        assert_eq!(conn.lease_end, t0 + Duration::from_secs(10));
        conn.clamp(t0, Duration::from_secs(1));
        assert_eq!(conn.lease_end, t0 + Duration::from_secs(1));
    }

    #[test]
    fn seen_cache_evicts_oldest() {
        let mut seen = SeenCache::new(2);
        assert!(seen.insert(1));
        assert!(seen.insert(2));
        assert!(!seen.insert(1));
        assert!(seen.insert(3));
        assert_eq!(seen.len(), 2);
        // 1 was evicted, so it counts as new again.
        assert!(seen.insert(1));
        assert!(!seen.insert(3));
    }
}
