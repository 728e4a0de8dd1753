//! Seeding sources: where rendezvous candidates come from.
//!
//! Two policies:
//! - `UriSeeder`:      a fixed seed list from config, plus anything added at runtime
//! - `PeerViewSeeder`: the seed list plus every rendezvous peer observed since startup
//!
//! Seed strings are either a bare endpoint (`udp://[fe80::1%2]:9700`) or an
//! endpoint pinned to a peer (`urn:overmesh:peer:<hex>@udp://...`).

use std::sync::RwLock;
use std::time::Instant;

use dashmap::DashMap;

use overmesh_core::config::RendezvousConfig;
use overmesh_core::{IdError, IdRegistry, PeerDescriptor, PeerId, RouteDescriptor};

/// One bootstrap candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRoute {
    /// Endpoint to send the lease request to.
    pub address: String,
    /// Known route for the peer at `address`, if the seed names one.
    pub route: Option<RouteDescriptor>,
}

impl SeedRoute {
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            route: None,
        }
    }

    pub fn pinned(route: RouteDescriptor, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            route: Some(route),
        }
    }

    /// Parse `addr` or `urn:overmesh:peer:<hex>@addr`.
    pub fn parse(ids: &IdRegistry, seed: &str) -> Result<Self, SeedError> {
        let seed = seed.trim();
        if seed.is_empty() {
            return Err(SeedError::Empty);
        }
        match seed.split_once('@') {
            Some((id, addr)) if id.starts_with("urn:") => {
                let peer = ids.parse_peer(id).map_err(|source| SeedError::BadPeer {
                    seed: seed.to_string(),
                    source,
                })?;
                if addr.is_empty() {
                    return Err(SeedError::Empty);
                }
                let route = RouteDescriptor {
                    peer,
                    endpoints: vec![addr.to_string()],
                };
                Ok(Self::pinned(route, addr))
            }
            _ => Ok(Self::address(seed)),
        }
    }

    fn matches(&self, descriptor: &PeerDescriptor) -> bool {
        match &self.route {
            Some(route) => route.peer == descriptor.peer,
            None => descriptor.endpoints.iter().any(|ep| ep == &self.address),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("empty seed")]
    Empty,
    #[error("bad peer id in seed {seed:?}: {source}")]
    BadPeer { seed: String, source: IdError },
}

/// Bootstrap source for the rendezvous manager.
pub trait SeedingSource: Send + Sync {
    /// Candidates to try, best first.
    fn active_seed_routes(&self) -> Vec<SeedRoute>;

    /// Whether a lease offer from `descriptor` may be accepted.
    fn is_acceptable(&self, descriptor: &PeerDescriptor) -> bool;

    /// Remember an extra candidate.
    fn add_seed(&self, seed: SeedRoute);
}

// ── URI list ──────────────────────────────────────────────────────────────────

pub struct UriSeeder {
    seeds: RwLock<Vec<SeedRoute>>,
    only_seeds: bool,
}

impl UriSeeder {
    pub fn new(seeds: Vec<SeedRoute>, only_seeds: bool) -> Self {
        Self {
            seeds: RwLock::new(seeds),
            only_seeds,
        }
    }

    pub fn from_config(config: &RendezvousConfig, ids: &IdRegistry) -> Result<Self, SeedError> {
        let seeds = config
            .seeds
            .iter()
            .map(|s| SeedRoute::parse(ids, s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(seeds, config.only_seeds))
    }

    pub fn len(&self) -> usize {
        read(&self.seeds).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SeedingSource for UriSeeder {
    fn active_seed_routes(&self) -> Vec<SeedRoute> {
        read(&self.seeds).clone()
    }

    fn is_acceptable(&self, descriptor: &PeerDescriptor) -> bool {
        !self.only_seeds || read(&self.seeds).iter().any(|s| s.matches(descriptor))
    }

    fn add_seed(&self, seed: SeedRoute) {
        let mut seeds = self.seeds.write().unwrap_or_else(|p| p.into_inner());
        if !seeds.iter().any(|s| s.address == seed.address) {
            tracing::debug!(address = %seed.address, "seed added");
            seeds.push(seed);
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

// ── Peer view ─────────────────────────────────────────────────────────────────

/// Largest number of observed rendezvous peers kept in the view.
const MAX_VIEW: usize = 64;

struct ViewEntry {
    descriptor: PeerDescriptor,
    last_seen: Instant,
}

/// Seeds from the config plus rendezvous peers seen on the network.
pub struct PeerViewSeeder {
    bootstrap: UriSeeder,
    view: DashMap<PeerId, ViewEntry>,
    rejected: DashMap<PeerId, ()>,
}

impl PeerViewSeeder {
    pub fn new(bootstrap: UriSeeder) -> Self {
        Self {
            bootstrap,
            view: DashMap::new(),
            rejected: DashMap::new(),
        }
    }

    /// Record a rendezvous peer. Newest observations are tried first.
    pub fn observe(&self, descriptor: PeerDescriptor) {
        if descriptor.endpoints.is_empty() {
            return;
        }
        self.view.insert(
            descriptor.peer,
            ViewEntry {
                descriptor,
                last_seen: Instant::now(),
            },
        );
        if self.view.len() > MAX_VIEW {
            let oldest = self
                .view
                .iter()
                .min_by_key(|e| e.last_seen)
                .map(|e| *e.key());
            if let Some(peer) = oldest {
                self.view.remove(&peer);
            }
        }
    }

    pub fn forget(&self, peer: &PeerId) {
        self.view.remove(peer);
    }

    /// Never accept this peer again.
    pub fn reject(&self, peer: PeerId) {
        self.view.remove(&peer);
        self.rejected.insert(peer, ());
    }

    pub fn view_len(&self) -> usize {
        self.view.len()
    }
}

impl SeedingSource for PeerViewSeeder {
    fn active_seed_routes(&self) -> Vec<SeedRoute> {
        let mut observed: Vec<(Instant, SeedRoute)> = self
            .view
            .iter()
            .filter_map(|e| {
                let address = e.descriptor.endpoints.first()?.clone();
                Some((e.last_seen, SeedRoute::pinned(e.descriptor.route(), address)))
            })
            .collect();
        observed.sort_by(|a, b| b.0.cmp(&a.0));

        let mut routes: Vec<SeedRoute> = observed.into_iter().map(|(_, r)| r).collect();
        for seed in self.bootstrap.active_seed_routes() {
            if !routes.iter().any(|r| r.address == seed.address) {
                routes.push(seed);
            }
        }
        routes
    }

    fn is_acceptable(&self, descriptor: &PeerDescriptor) -> bool {
        !self.rejected.contains_key(&descriptor.peer)
    }

    fn add_seed(&self, seed: SeedRoute) {
        self.bootstrap.add_seed(seed);
    }
}
