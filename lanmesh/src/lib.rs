//! # lanmesh
//!
//! Serverless peer-to-peer mesh networking over the local network.
//!
//! Peers discover one another through a pluggable [`Discovery`]
//! backend, form bidirectional TCP links, and exchange length-prefixed,
//! channel-tagged frames. On top of the raw channels sits an
//! ask/answer RPC pattern with per-request correlation. There is no
//! broker and no central registry: every peer may dial, listen, or
//! both.
//!
//! This crate provides:
//! - **Peer**: connection lifecycle, rosters, and the messaging facade
//! - **Wire format**: length-prefixed frames over a pluggable codec
//! - **Channel routers**: typed subscriptions per channel name
//! - **Ask/answer**: correlated request/response over reserved channels
//!
//! # Example
//!
//! ```rust,ignore
//! use lanmesh::{JsonCodec, Peer, PeerConfig, StaticDiscovery, TokioNetworkProvider};
//! use serde_json::json;
//!
//! let peer = Peer::launch(
//!     "my-service",
//!     PeerConfig::new(5000),
//!     TokioNetworkProvider::new(),
//!     JsonCodec,
//!     |_info| Box::new(StaticDiscovery::new(seeds)),
//! )
//! .await?;
//!
//! peer.question("square", |v| async move {
//!     json!(v.as_i64().unwrap_or(0).pow(2))
//! });
//! let answer = peer.ask("square", json!(7)).await?;
//! ```
//!
//! Single-core design: a peer and everything it spawns live on one
//! thread inside a `tokio::task::LocalSet` on a current-thread runtime.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Pluggable payload serialization.
pub mod codec;

/// One TCP link and its background task.
pub mod connection;

/// Discovery interface and the static seed-list backend.
pub mod discovery;

/// Error types for mesh operations.
pub mod error;

/// Network provider abstraction.
pub mod net;

/// The peer facade and its parts.
pub mod peer;

/// Channel routers.
pub mod router;

/// Wire format for framed channel messages.
pub mod wire;

pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use connection::{Connection, Direction};
pub use discovery::{Discovery, DiscoveryEvent, DiscoveryInfo, StaticDiscovery, StaticSeed};
pub use error::{MeshError, MeshResult};
pub use net::{Listener, NetworkProvider, TokioNetworkProvider};
pub use peer::{Peer, PeerConfig, PeerEvent, PeerId, PeerRole, PeerStats};
pub use router::{ChannelMessage, ChannelRouter};
pub use wire::{encode_frame, Frame, FrameBuffer, WireError, MAX_FRAME_SIZE};
