//! Channel routers: typed delivery of channel-tagged messages.
//!
//! The router maps a channel name to its listeners. Two listener kinds
//! exist: multi-shot subscribers backed by an unbounded mpsc channel,
//! and one-shot waiters backed by oneshot channels (the RPC layer uses
//! these for `request_<id>` reply correlation).
//!
//! Each peer owns three routers (incoming, outgoing, combined) and each
//! connection owns one more, so application code can listen to "any
//! connection of this direction", "any connection at all", or "this
//! specific connection".

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::connection::Connection;

/// A routed message: the payload plus the connection it arrived on.
#[derive(Clone)]
pub struct ChannelMessage {
    /// Connection the frame was read from. Useful for replying on the
    /// same link.
    pub from: Rc<Connection>,
    /// Decoded payload value.
    pub message: Value,
}

impl std::fmt::Debug for ChannelMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMessage")
            .field("from", &self.from.serial())
            .field("message", &self.message)
            .finish()
    }
}

#[derive(Default)]
struct RouterInner {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<ChannelMessage>>>,
    waiters: HashMap<String, Vec<oneshot::Sender<ChannelMessage>>>,
}

/// Channel-name to listener routing.
///
/// Single-threaded design: `RefCell` interior mutability, no locks. All
/// access happens on the peer's event loop thread.
#[derive(Default)]
pub struct ChannelRouter {
    inner: RefCell<RouterInner>,
}

impl ChannelRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every future message on `channel`.
    ///
    /// Dropping the receiver unsubscribes; the dead sender is pruned on
    /// the next publish.
    pub fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .borrow_mut()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Wait for exactly one message on `channel`.
    ///
    /// The returned receiver errors if the router is cleared before a
    /// message arrives (peer shutdown).
    pub fn once(&self, channel: &str) -> oneshot::Receiver<ChannelMessage> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .borrow_mut()
            .waiters
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Drop any one-shot waiters registered for `channel`.
    ///
    /// Used when an ask gives up (timeout) so the entry does not linger.
    pub fn forget(&self, channel: &str) {
        self.inner.borrow_mut().waiters.remove(channel);
    }

    /// Deliver `msg` to every listener of `channel`.
    ///
    /// One-shot waiters fire first and are consumed; subscribers with a
    /// dropped receiver are pruned. A message with no listeners is
    /// silently discarded, as with the original emitter semantics.
    pub fn publish(&self, channel: &str, msg: ChannelMessage) {
        let mut inner = self.inner.borrow_mut();

        if let Some(waiters) = inner.waiters.remove(channel) {
            for waiter in waiters {
                let _ = waiter.send(msg.clone());
            }
        }

        if let Some(subs) = inner.subscribers.get_mut(channel) {
            subs.retain(|tx| tx.send(msg.clone()).is_ok());
            if subs.is_empty() {
                inner.subscribers.remove(channel);
            }
        }
    }

    /// Drop every listener. Pending one-shot waiters observe an error.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.subscribers.clear();
        inner.waiters.clear();
    }
}
