//! Peer and group identifiers.
//!
//! Identifiers are 32-byte values with structural equality and hashing.
//! Two identifiers built from the same bytes are the same identifier; there
//! is no interning. The canonical text form is `urn:overmesh:<tag>:<hex>`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Prefix shared by every canonical identifier string.
pub const URN_PREFIX: &str = "urn:overmesh:";

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Format tag used in the canonical string form.
            pub const TAG: &'static str = $tag;

            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Fresh random identifier.
            pub fn random() -> Self {
                Self(rand::random())
            }

            /// Deterministic identifier derived from arbitrary key material.
            pub fn derive(material: &[u8]) -> Self {
                Self(*blake3::hash(material).as_bytes())
            }

            /// First 8 bytes as hex, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..8])
            }

            fn parse_body(body: &str) -> Result<Self, IdError> {
                let bytes = hex::decode(body).map_err(|_| IdError::InvalidHex)?;
                if bytes.len() != 32 {
                    return Err(IdError::WrongLength(bytes.len()));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}:{}", URN_PREFIX, $tag, hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let (tag, body) = split_urn(s)?;
                if tag != $tag {
                    return Err(IdError::WrongKind {
                        expected: $tag,
                        found: tag.to_string(),
                    });
                }
                Self::parse_body(body)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(
    /// Identity of a single peer on the overlay.
    PeerId,
    "peer"
);

define_id!(
    /// Identity of a peer group. Each group runs its own rendezvous manager
    /// and resolver router.
    GroupId,
    "group"
);

impl GroupId {
    /// Group identifier for a human-readable group name.
    pub fn from_name(name: &str) -> Self {
        Self::derive(format!("overmesh.group.{name}").as_bytes())
    }
}

/// Split `urn:overmesh:<tag>:<body>` into `(tag, body)`.
fn split_urn(s: &str) -> Result<(&str, &str), IdError> {
    let rest = s.strip_prefix(URN_PREFIX).ok_or(IdError::MissingPrefix)?;
    rest.split_once(':').ok_or(IdError::MissingPrefix)
}

// ── Format registry ───────────────────────────────────────────────────────────

/// Any identifier the registry knows how to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyId {
    Peer(PeerId),
    Group(GroupId),
}

impl AnyId {
    pub fn tag(&self) -> &'static str {
        match self {
            AnyId::Peer(_) => PeerId::TAG,
            AnyId::Group(_) => GroupId::TAG,
        }
    }
}

impl fmt::Display for AnyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyId::Peer(id) => id.fmt(f),
            AnyId::Group(id) => id.fmt(f),
        }
    }
}

/// Parses the body of a canonical identifier for one format tag.
pub type ParseFn = fn(&str) -> Result<AnyId, IdError>;

/// Maps format tags to parse functions.
///
/// Built once at startup and passed to whatever needs to parse identifiers
/// of unknown kind (e.g. the HTTP API).
#[derive(Clone, Default)]
pub struct IdRegistry {
    formats: HashMap<&'static str, ParseFn>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the peer and group formats.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(PeerId::TAG, |body| PeerId::parse_body(body).map(AnyId::Peer));
        registry.register(GroupId::TAG, |body| GroupId::parse_body(body).map(AnyId::Group));
        registry
    }

    /// Register a format. Returns the parser it replaced, if any.
    pub fn register(&mut self, tag: &'static str, parse: ParseFn) -> Option<ParseFn> {
        self.formats.insert(tag, parse)
    }

    pub fn parse(&self, s: &str) -> Result<AnyId, IdError> {
        let (tag, body) = split_urn(s)?;
        let parse = self
            .formats
            .get(tag)
            .ok_or_else(|| IdError::UnknownFormat(tag.to_string()))?;
        parse(body)
    }

    /// Parse and require a peer identifier.
    pub fn parse_peer(&self, s: &str) -> Result<PeerId, IdError> {
        match self.parse(s)? {
            AnyId::Peer(id) => Ok(id),
            other => Err(IdError::WrongKind {
                expected: PeerId::TAG,
                found: other.tag().to_string(),
            }),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier must start with {}<tag>:", URN_PREFIX)]
    MissingPrefix,

    #[error("unknown identifier format: {0}")]
    UnknownFormat(String),

    #[error("identifier body is not valid hex")]
    InvalidHex,

    #[error("identifier must be 32 bytes, got {0}")]
    WrongLength(usize),

    #[error("expected a {expected} identifier, found {found}")]
    WrongKind { expected: &'static str, found: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn canonical_form_parses_back() {
        let id = PeerId::from_bytes([0xab; 32]);
        let text = id.to_string();
        assert!(text.starts_with("urn:overmesh:peer:abab"));
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn equality_is_structural() {
        let a = PeerId::derive(b"node-a");
        let b = PeerId::derive(b"node-a");
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_ne!(a, PeerId::derive(b"node-b"));
    }

    #[test]
    fn peer_parser_rejects_group_urn() {
        let group = GroupId::from_name("chat");
        let err = group.to_string().parse::<PeerId>().unwrap_err();
        assert!(matches!(err, IdError::WrongKind { expected: "peer", .. }));
    }

    #[test]
    fn registry_dispatches_on_tag() {
        let registry = IdRegistry::standard();
        let peer = PeerId::random();
        let group = GroupId::from_name("default");

        assert_eq!(registry.parse(&peer.to_string()).unwrap(), AnyId::Peer(peer));
        assert_eq!(registry.parse(&group.to_string()).unwrap(), AnyId::Group(group));
        assert!(registry.parse_peer(&group.to_string()).is_err());
    }

    #[test]
    fn registry_rejects_unknown_tags_and_bad_bodies() {
        let registry = IdRegistry::standard();
        assert_eq!(
            registry.parse("urn:overmesh:module:00").unwrap_err(),
            IdError::UnknownFormat("module".into())
        );
        assert_eq!(
            registry.parse("urn:overmesh:peer:zz").unwrap_err(),
            IdError::InvalidHex
        );
        assert_eq!(
            registry.parse("urn:overmesh:peer:0011").unwrap_err(),
            IdError::WrongLength(2)
        );
        assert_eq!(registry.parse("peer:0011").unwrap_err(), IdError::MissingPrefix);
    }

    #[test]
    fn serde_uses_canonical_string() {
        let id = PeerId::from_bytes([0x01; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
