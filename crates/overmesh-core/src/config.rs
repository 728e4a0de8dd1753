//! Configuration system for Overmesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $OVERMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/overmesh/config.toml
//!   3. ~/.config/overmesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OvermeshConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub rendezvous: RendezvousConfig,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// File holding this node's peer id (hex). Created on first run.
    pub peer_id_path: PathBuf,
    /// Human-readable node name, sent in lease traffic.
    pub name: String,
    /// Peer group to join. The group id is derived from this name.
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP bind address for overlay traffic.
    pub bind: String,
    /// Interface for the local neighbor flood. Empty = no local flood.
    pub interface: String,
    /// Endpoints to advertise to other peers. Empty = derive from the bind address.
    pub advertise: Vec<String>,
    /// Port for the local HTTP status API. 0 = disabled.
    pub api_port: u16,
}

/// Whether this node only leases rendezvous connections or also grants them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Edge,
    Rendezvous,
}

/// Where rendezvous candidates come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedingPolicy {
    /// The configured seed list only.
    #[default]
    Uri,
    /// Configured seeds plus every rendezvous peer seen since startup.
    PeerView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    pub role: Role,
    pub seeding: SeedingPolicy,
    /// Number of simultaneous rendezvous leases to hold.
    pub target_connections: usize,
    /// Interval between monitor ticks.
    pub monitor_interval_ms: u64,
    /// Renew this long before a lease ends (capped at half the lease).
    pub renewal_margin_ms: u64,
    /// Upper bound for the ttl of propagated messages.
    pub max_ttl: u8,
    /// Lease requests sent per tick while below target.
    pub max_candidates_per_tick: usize,
    /// Seed endpoints, e.g. `udp://[2001:db8::1]:9700`.
    pub seeds: Vec<String>,
    /// Only accept lease offers from peers reached through a seed.
    pub only_seeds: bool,
    /// Send a disconnect notice when refusing an unacceptable lease offer.
    pub refuse_unacceptable: bool,
    /// Lease granted to clients when acting as a rendezvous.
    pub granted_lease_ms: u64,
    /// Maximum clients when acting as a rendezvous.
    pub max_clients: usize,
    /// Propagated message ids remembered for duplicate suppression.
    pub seen_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Ttl for queries/responses/SRDI propagated with no destination.
    pub default_ttl: u8,
    /// Ttl for the local neighbor flood of destination-less queries.
    pub neighbor_ttl: u8,
    /// Queries arriving with more hops than this are dropped.
    pub max_initial_hops: u32,
    /// Re-propagation stops once a query reaches this many hops.
    pub max_repropagate_hops: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id_path: config_dir().join("peer_id"),
            name: "overmesh-node".to_string(),
            group: "default".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: format!("[::]:{}", crate::wire::DEFAULT_PORT),
            interface: String::new(),
            advertise: Vec::new(),
            api_port: 9701,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            role: Role::Edge,
            seeding: SeedingPolicy::Uri,
            target_connections: 1,
            monitor_interval_ms: 15_000,
            renewal_margin_ms: 60_000,
            max_ttl: 10,
            max_candidates_per_tick: 3,
            seeds: Vec::new(),
            only_seeds: false,
            refuse_unacceptable: false,
            granted_lease_ms: 300_000,
            max_clients: 200,
            seen_cache_size: 1024,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_ttl: 7,
            neighbor_ttl: 2,
            max_initial_hops: 2,
            max_repropagate_hops: 3,
        }
    }
}

impl RendezvousConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn renewal_margin(&self) -> Duration {
        Duration::from_millis(self.renewal_margin_ms)
    }

    pub fn granted_lease(&self) -> Duration {
        Duration::from_millis(self.granted_lease_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("overmesh")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl OvermeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a specific file, falling back to defaults if it does not exist.
    /// No env overrides are applied.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(OvermeshConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("OVERMESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&OvermeshConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Reject settings the manager and router cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rdv = &self.rendezvous;
        if rdv.target_connections == 0 {
            return Err(ConfigError::Invalid(
                "rendezvous.target_connections",
                "must be at least 1".into(),
            ));
        }
        if rdv.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "rendezvous.monitor_interval_ms",
                "must be non-zero".into(),
            ));
        }
        if rdv.max_ttl == 0 {
            return Err(ConfigError::Invalid("rendezvous.max_ttl", "must be non-zero".into()));
        }
        if rdv.seen_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "rendezvous.seen_cache_size",
                "must be non-zero".into(),
            ));
        }
        if self.resolver.max_repropagate_hops < self.resolver.max_initial_hops {
            return Err(ConfigError::Invalid(
                "resolver.max_repropagate_hops",
                format!(
                    "must be >= max_initial_hops ({})",
                    self.resolver.max_initial_hops
                ),
            ));
        }
        Ok(())
    }

    /// Apply OVERMESH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OVERMESH_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Ok(v) = std::env::var("OVERMESH_IDENTITY__GROUP") {
            self.identity.group = v;
        }
        if let Ok(v) = std::env::var("OVERMESH_NETWORK__BIND") {
            self.network.bind = v;
        }
        if let Ok(v) = std::env::var("OVERMESH_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Ok(v) = std::env::var("OVERMESH_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("OVERMESH_RENDEZVOUS__ROLE") {
            match v.as_str() {
                "rendezvous" => self.rendezvous.role = Role::Rendezvous,
                "edge" => self.rendezvous.role = Role::Edge,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("OVERMESH_RENDEZVOUS__SEEDING") {
            match v.as_str() {
                "peerview" => self.rendezvous.seeding = SeedingPolicy::PeerView,
                "uri" => self.rendezvous.seeding = SeedingPolicy::Uri,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("OVERMESH_RENDEZVOUS__SEEDS") {
            self.rendezvous.seeds = split_list(&v);
        }
        if let Ok(v) = std::env::var("OVERMESH_RENDEZVOUS__TARGET_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.rendezvous.target_connections = n;
            }
        }
        if let Ok(v) = std::env::var("OVERMESH_RENDEZVOUS__ONLY_SEEDS") {
            self.rendezvous.only_seeds = v == "true" || v == "1";
        }
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
