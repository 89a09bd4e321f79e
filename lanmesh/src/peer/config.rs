//! Peer configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Which sides of the mesh this peer participates in.
///
/// Normalized at construction: a client-only peer never listens, a
/// server-only peer never dials, and there is no representation for a
/// contradictory mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerRole {
    /// Dials discovered peers and accepts connections. The default.
    #[default]
    Both,
    /// Only dials; no listener, no reciprocal handshake sent.
    ClientOnly,
    /// Only accepts; discovery `found` events are ignored.
    ServerOnly,
}

impl PeerRole {
    /// Whether this peer dials outgoing connections.
    pub fn is_client(&self) -> bool {
        matches!(self, PeerRole::Both | PeerRole::ClientOnly)
    }

    /// Whether this peer listens for incoming connections.
    pub fn is_server(&self) -> bool {
        matches!(self, PeerRole::Both | PeerRole::ServerOnly)
    }
}

/// Configuration for one peer instance.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Port the listener binds when the role includes server. 0 lets
    /// the kernel pick; [`Peer::listen_addr`](crate::Peer::listen_addr)
    /// reports the result.
    pub port: u16,

    /// Client/server participation.
    pub role: PeerRole,

    /// Whether [`Peer::launch`](crate::Peer::launch) starts the peer
    /// immediately after construction.
    pub auto_start: bool,

    /// How long an outgoing connect attempt may take before it is
    /// abandoned.
    pub connect_timeout: Duration,

    /// Optional bound on how long an ask waits for its reply.
    ///
    /// `None` keeps an unanswered ask pending indefinitely.
    pub ask_timeout: Option<Duration>,

    /// Addresses carried in this peer's discover-handshake frames so
    /// remote peers can connect back.
    pub advertise_addresses: Vec<IpAddr>,
}

impl PeerConfig {
    /// Configuration for a client+server peer on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            role: PeerRole::Both,
            auto_start: true,
            connect_timeout: Duration::from_secs(3),
            ask_timeout: None,
            advertise_addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }

    /// Configuration for a peer that only dials.
    pub fn client_only(port: u16) -> Self {
        Self {
            role: PeerRole::ClientOnly,
            ..Self::new(port)
        }
    }

    /// Configuration for a peer that only accepts.
    pub fn server_only(port: u16) -> Self {
        Self {
            role: PeerRole::ServerOnly,
            ..Self::new(port)
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound every ask by `timeout`.
    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = Some(timeout);
        self
    }

    /// Replace the advertised address list.
    pub fn with_advertise_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.advertise_addresses = addresses;
        self
    }

    /// Construct without auto-start, for callers driving `start`
    /// themselves.
    pub fn manual_start(mut self) -> Self {
        self.auto_start = false;
        self
    }
}
