//! Peer identity.
//!
//! A [`PeerId`] is 16 random bytes rendered as lowercase hex. It is the only
//! thing that identifies a peer: display names are free-form and may collide.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of a peer id in bytes.
pub const PEER_ID_LEN: usize = 16;

/// Opaque, stable peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

/// Error parsing a [`PeerId`] from its hex form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid peer id: {0}")]
pub struct ParsePeerIdError(Arc<str>);

impl PeerId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PEER_ID_LEN * 2 || !s.is_ascii() {
            return Err(ParsePeerIdError(Arc::from(s)));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParsePeerIdError(Arc::from(s)))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A peer's id plus its human-readable name.
///
/// Equality and hashing consider only the id.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    id: PeerId,
    display_name: Arc<str>,
}

impl PeerIdentity {
    pub fn new(id: PeerId, display_name: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id.short())
    }
}
