//! Pluggable payload serialization.
//!
//! The [`MessageCodec`] trait lets applications bring their own
//! serialization format (JSON, messagepack, bincode, ...) for frame
//! bodies, while [`JsonCodec`] ships as a readable default.
//!
//! # Example
//!
//! ```rust
//! use lanmesh::{JsonCodec, MessageCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Hello {
//!     who: String,
//! }
//!
//! let codec = JsonCodec;
//! let msg = Hello { who: "mesh".to_string() };
//!
//! let bytes = codec.encode(&msg).unwrap();
//! let decoded: Hello = codec.decode(&bytes).unwrap();
//! assert_eq!(msg, decoded);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable serialization format for frame bodies.
///
/// The trait requires `Clone + 'static` so codec instances can be stored
/// on connections and captured by background tasks. Message types go
/// through serde's `Serialize`/`DeserializeOwned` bounds.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// Human-readable on the wire, which makes mesh traffic easy to inspect;
/// swap in a binary codec for production volume.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}
