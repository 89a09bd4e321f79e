//! Error types for mesh operations.
//!
//! Network churn is the steady state of a mesh, so per-connection
//! failures never show up here; they are logged and contained to the
//! affected connection. This enum covers what actually reaches callers:
//! setup failures, encode failures, opted-in ask timeouts, and use
//! after shutdown.

use thiserror::Error;

use crate::wire::WireError;

/// Errors surfaced by the peer facade.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Could not bind the listening socket at start.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Configured port that failed to bind.
        port: u16,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A frame could not be encoded for sending.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// An ask hit its configured timeout before a reply arrived.
    #[error("ask {question:?} timed out")]
    AskTimeout {
        /// Question name the ask carried.
        question: String,
    },

    /// The discovery backend failed a lifecycle call.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Operation on a peer that has been stopped.
    #[error("peer is stopped")]
    Stopped,
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
