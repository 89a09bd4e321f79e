//! Connection: one TCP link and its background task.
//!
//! Every accepted or dialed socket gets a [`Connection`] handle plus a
//! single background task that owns the socket. The task drains a write
//! queue and reads frames, so all writes on one link are serialized and
//! deferred off the caller, and all frames are processed in strict
//! arrival order.
//!
//! The task hands decoded frames to a [`FrameSink`] (implemented by the
//! peer internals) and reports its own death there too, which is how a
//! connection removes itself from its roster.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::peer::{PeerId, PeerStats};
use crate::router::ChannelRouter;
use crate::wire::{Frame, FrameBuffer, WireError};
use crate::MessageCodec;

/// Which side initiated the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Incoming,
    /// Dialed by us after a discovery event or handshake.
    Outgoing,
}

/// Encodes `(channel, message)` into wire bytes. Injected by the peer so
/// connections stay independent of the codec type parameter.
pub(crate) type FrameEncoder = Rc<dyn Fn(&str, Value) -> Result<Vec<u8>, WireError>>;

pub(crate) enum WriteCmd {
    Frame(Vec<u8>),
    Shutdown,
}

/// Handle to one live TCP link.
///
/// Cheap to clone through `Rc`; destroyed when the socket closes or
/// errors, at which point it leaves its roster and is never reused.
pub struct Connection {
    serial: u64,
    direction: Direction,
    remote_addr: SocketAddr,
    peer_id: RefCell<Option<PeerId>>,
    write_tx: mpsc::UnboundedSender<WriteCmd>,
    encoder: FrameEncoder,
    events: ChannelRouter,
    stats: Rc<RefCell<PeerStats>>,
    closed: Cell<bool>,
}

impl Connection {
    /// Create a handle plus the write-queue receiver for its task.
    pub(crate) fn new(
        serial: u64,
        direction: Direction,
        remote_addr: SocketAddr,
        encoder: FrameEncoder,
        stats: Rc<RefCell<PeerStats>>,
    ) -> (Rc<Self>, mpsc::UnboundedReceiver<WriteCmd>) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let conn = Rc::new(Self {
            serial,
            direction,
            remote_addr,
            peer_id: RefCell::new(None),
            write_tx,
            encoder,
            events: ChannelRouter::new(),
            stats,
            closed: Cell::new(false),
        });
        (conn, write_rx)
    }

    /// Serial number, unique within the owning peer.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Which side initiated this link.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Identity of the remote peer, if known.
    ///
    /// Outgoing connections are tagged at connect time; incoming ones
    /// have no identity until the application learns it out of band.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id.borrow().clone()
    }

    /// Tag this connection with the remote identity. Set once.
    pub(crate) fn set_peer_id(&self, id: PeerId) {
        let mut slot = self.peer_id.borrow_mut();
        debug_assert!(slot.is_none(), "connection identity must not change");
        *slot = Some(id);
    }

    /// Router seeing only this connection's traffic.
    pub fn events(&self) -> &ChannelRouter {
        &self.events
    }

    /// Queue one frame for writing.
    ///
    /// The frame is encoded here and written by the connection task, so
    /// concurrent senders never interleave bytes on the socket. Sending
    /// on an already-closed connection is a silent no-op, matching the
    /// churn-is-normal propagation policy.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] only when encoding fails.
    pub fn send(&self, channel: &str, message: Value) -> Result<(), WireError> {
        let bytes = (self.encoder)(channel, message)?;
        if self.write_tx.send(WriteCmd::Frame(bytes)).is_err() {
            tracing::debug!(serial = self.serial, channel, "send on closed connection");
            return Ok(());
        }
        self.stats.borrow_mut().frames_sent += 1;
        Ok(())
    }

    /// Ask the connection task to shut the socket down.
    pub(crate) fn close(&self) {
        let _ = self.write_tx.send(WriteCmd::Shutdown);
    }

    /// Whether the socket side of this handle is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.set(true);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.serial)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("peer_id", &*self.peer_id.borrow())
            .finish()
    }
}

/// Where the connection task delivers frames and its own death.
pub(crate) trait FrameSink {
    /// One decoded frame, in arrival order.
    fn frame(&self, conn: &Rc<Connection>, frame: Frame);
    /// The task is exiting; remove the connection from its roster.
    fn closed(&self, conn: &Rc<Connection>);
}

/// Background task owning one socket.
///
/// Select loop over the write queue and the read side: writes drain the
/// queue in order, reads feed the frame buffer. Any of EOF, a transport
/// error, or framing corruption ends the task; only this connection is
/// affected.
pub(crate) async fn connection_task<S, C>(
    conn: Rc<Connection>,
    stream: S,
    codec: C,
    mut write_rx: mpsc::UnboundedReceiver<WriteCmd>,
    sink: Rc<dyn FrameSink>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + 'static,
    C: MessageCodec,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut frame_buffer = FrameBuffer::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            cmd = write_rx.recv() => {
                match cmd {
                    Some(WriteCmd::Frame(bytes)) => {
                        if let Err(error) = writer.write_all(&bytes).await {
                            tracing::debug!(serial = conn.serial(), %error, "write failed");
                            break;
                        }
                    }
                    Some(WriteCmd::Shutdown) | None => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!(serial = conn.serial(), "connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        match frame_buffer.feed(&codec, &read_buf[..n]) {
                            Ok(frames) => {
                                for frame in frames {
                                    sink.frame(&conn, frame);
                                }
                            }
                            Err(error) => {
                                // Framing is unrecoverable; dropping the
                                // link beats desynchronized garbage.
                                tracing::warn!(
                                    serial = conn.serial(),
                                    %error,
                                    "framing error, tearing down connection"
                                );
                                break;
                            }
                        }
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::ConnectionReset => {
                        tracing::debug!(serial = conn.serial(), "connection reset by peer");
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(serial = conn.serial(), %error, "connection error");
                        break;
                    }
                }
            }
        }
    }

    conn.mark_closed();
    sink.closed(&conn);
}
