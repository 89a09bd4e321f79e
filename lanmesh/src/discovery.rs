//! Discovery interface: how peers learn that other peers exist.
//!
//! The mesh core never speaks a discovery protocol itself. It consumes
//! this capability trait: any backend (mDNS, a registry file, a fixed
//! seed list) that can report peers appearing and disappearing will do.
//! [`StaticDiscovery`] ships as the fixed-seed-list backend used by the
//! tests and by static topologies.

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::peer::PeerId;

/// What a discovery backend reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A candidate peer became reachable. Backends must not report the
    /// local peer itself.
    Found {
        /// Identity the peer advertises.
        id: PeerId,
        /// Addresses the peer can be reached at, preferred first.
        addresses: Vec<IpAddr>,
        /// TCP port the peer listens on.
        port: u16,
    },
    /// A previously found peer disappeared.
    Closed {
        /// Identity that went away.
        id: PeerId,
    },
}

/// What a backend needs to know about the local peer, handed to the
/// discovery factory at peer construction.
#[derive(Debug, Clone)]
pub struct DiscoveryInfo {
    /// Generated identity of the local peer.
    pub id: PeerId,
    /// Service name the mesh runs under.
    pub service: String,
    /// Port the local peer listens on (as configured; 0 means the
    /// kernel picks one at bind time).
    pub port: u16,
}

/// Capability interface for discovery backends.
///
/// Lifecycle calls are expected to be safe to repeat. Events flow
/// through a receiver taken exactly once with
/// [`take_events`](Discovery::take_events).
#[async_trait(?Send)]
pub trait Discovery {
    /// Bring the backend up.
    async fn start(&mut self) -> MeshResult<()>;

    /// Tear the backend down; no events after this.
    async fn stop(&mut self) -> MeshResult<()>;

    /// Begin browsing for other peers of the same service.
    async fn search(&mut self) -> MeshResult<()>;

    /// Advertise the local peer's presence.
    async fn publish(&mut self) -> MeshResult<()>;

    /// Take ownership of the event receiver.
    ///
    /// Returns `None` once taken; the peer takes it during `start`.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>>;
}

/// One entry in a [`StaticDiscovery`] seed list.
#[derive(Debug, Clone)]
pub struct StaticSeed {
    /// Identity of the seeded peer.
    pub id: PeerId,
    /// Addresses the seeded peer listens on.
    pub addresses: Vec<IpAddr>,
    /// Port the seeded peer listens on.
    pub port: u16,
}

/// Discovery backend over a fixed list of known peers.
///
/// `search` reports every seed once. There is nowhere to advertise to,
/// so `publish` is a no-op. The list must not contain the local peer.
pub struct StaticDiscovery {
    seeds: Vec<StaticSeed>,
    tx: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    rx: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
}

impl StaticDiscovery {
    /// Create a backend seeded with the given peers.
    pub fn new(seeds: Vec<StaticSeed>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            seeds,
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

#[async_trait(?Send)]
impl Discovery for StaticDiscovery {
    async fn start(&mut self) -> MeshResult<()> {
        Ok(())
    }

    async fn stop(&mut self) -> MeshResult<()> {
        // Dropping the sender ends the event stream.
        self.tx = None;
        Ok(())
    }

    async fn search(&mut self) -> MeshResult<()> {
        if let Some(tx) = &self.tx {
            for seed in &self.seeds {
                let _ = tx.send(DiscoveryEvent::Found {
                    id: seed.id.clone(),
                    addresses: seed.addresses.clone(),
                    port: seed.port,
                });
            }
        }
        Ok(())
    }

    async fn publish(&mut self) -> MeshResult<()> {
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn seed(name: &str, port: u16) -> StaticSeed {
        StaticSeed {
            id: PeerId::from(name),
            addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            port,
        }
    }

    #[tokio::test]
    async fn test_search_reports_each_seed_once() {
        let mut discovery = StaticDiscovery::new(vec![seed("a", 5001), seed("b", 5002)]);
        let mut events = discovery.take_events().expect("events not yet taken");

        discovery.start().await.expect("start");
        discovery.search().await.expect("search");

        let first = events.recv().await.expect("first event");
        let second = events.recv().await.expect("second event");
        assert!(matches!(first, DiscoveryEvent::Found { ref id, port: 5001, .. } if id.as_str() == "a"));
        assert!(matches!(second, DiscoveryEvent::Found { ref id, port: 5002, .. } if id.as_str() == "b"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let mut discovery = StaticDiscovery::new(Vec::new());
        assert!(discovery.take_events().is_some());
        assert!(discovery.take_events().is_none());
    }

    #[tokio::test]
    async fn test_stop_ends_event_stream() {
        let mut discovery = StaticDiscovery::new(vec![seed("a", 5001)]);
        let mut events = discovery.take_events().expect("events");

        discovery.stop().await.expect("stop");

        assert!(events.recv().await.is_none());
    }
}
