//! Wire format for framed channel messages.
//!
//! Frame format: `[length:4][body:N]`
//!
//! - **length**: byte length of the body, big-endian u32, not counting
//!   the prefix itself
//! - **body**: codec-serialized [`Frame`] (`{ channel, message }`)
//!
//! TCP delivers a byte stream with no message boundaries, so the
//! receive side accumulates bytes in a [`FrameBuffer`] and drains
//! complete frames as they become available. A read may deliver less
//! than one frame, several frames back to back, or split the length
//! prefix itself; none of that is visible to the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{CodecError, MessageCodec};

/// Length prefix size in bytes.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Maximum accepted frame body size (1MB).
///
/// A declared length beyond this is treated as stream corruption rather
/// than an allocation request.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Wire format error types.
///
/// Any of these is fatal to the connection that produced the bytes:
/// once framing is in doubt the stream can never resynchronize, so the
/// owner must close it.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Declared body length exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge {
        /// The declared body length.
        size: usize,
    },

    /// A complete body failed to decode.
    #[error("corrupt frame body: {0}")]
    Corrupt(#[source] CodecError),

    /// A frame failed to encode.
    #[error("frame encode failed: {0}")]
    Encode(#[source] CodecError),
}

/// One channel-tagged unit of data on a connection.
///
/// Transient: exists only between encode and decode. The `message` is an
/// arbitrary serializable value; reserved channel names (`request`,
/// `request_<id>`, `discover`) carry protocol payloads, everything else
/// is application-defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Logical stream this frame belongs to.
    pub channel: String,
    /// Payload value.
    pub message: Value,
}

/// Encode one frame: length prefix followed by the serialized body.
///
/// # Errors
///
/// Returns [`WireError::Encode`] if the codec rejects the body and
/// [`WireError::FrameTooLarge`] if the body exceeds [`MAX_FRAME_SIZE`].
pub fn encode_frame<C: MessageCodec>(
    codec: &C,
    channel: &str,
    message: Value,
) -> Result<Vec<u8>, WireError> {
    let frame = Frame {
        channel: channel.to_string(),
        message,
    };
    let body = codec.encode(&frame).map_err(WireError::Encode)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: body.len() });
    }

    let mut out = Vec::with_capacity(LEN_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Owned receive buffer that reassembles frames from a byte stream.
///
/// Bytes are appended by [`feed`](FrameBuffer::feed) and consumed in
/// place; no byte is ever lost or handed out twice.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append `bytes` and drain every complete frame now available.
    ///
    /// Returns the decoded frames in stream order. An incomplete tail
    /// (partial prefix or partial body) stays buffered for the next
    /// feed.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::FrameTooLarge`] or [`WireError::Corrupt`]
    /// when the stream is unrecoverable; the caller must close the
    /// connection. Frames decoded before the fault are lost with it.
    pub fn feed<C: MessageCodec>(
        &mut self,
        codec: &C,
        bytes: &[u8],
    ) -> Result<Vec<Frame>, WireError> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < LEN_PREFIX_SIZE {
                break;
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len > MAX_FRAME_SIZE {
                return Err(WireError::FrameTooLarge { size: len });
            }
            if self.buf.len() < LEN_PREFIX_SIZE + len {
                break;
            }

            let frame = codec
                .decode::<Frame>(&self.buf[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + len])
                .map_err(WireError::Corrupt)?;
            self.buf.drain(..LEN_PREFIX_SIZE + len);
            frames.push(frame);
        }
        Ok(frames)
    }
}
