//! The Peer: identity, configuration, and the mesh facade.

mod config;
mod core;
mod dispatch;
mod rpc;

pub use self::config::{PeerConfig, PeerRole};
pub use self::core::{Peer, PeerEvent};

use serde::{Deserialize, Serialize};

/// Opaque unique identity of one peer instance.
///
/// Generated once at construction (UUID v4) and immutable for the
/// peer's lifetime; the deduplication key for outgoing connections and
/// the value exchanged during discovery and the discover-handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counters describing one peer's traffic and roster churn.
///
/// Snapshot semantics: [`Peer::stats`] copies the current values.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    /// Frames queued for writing across all connections.
    pub frames_sent: u64,
    /// Frames decoded across all connections.
    pub frames_received: u64,
    /// Incoming connections accepted.
    pub connections_accepted: u64,
    /// Outgoing connections established.
    pub connections_established: u64,
    /// Connections of either direction that closed or errored.
    pub connections_dropped: u64,
    /// Asks issued by this peer.
    pub requests_issued: u64,
    /// Request frames answered by this peer (unknown questions included).
    pub requests_answered: u64,
}
