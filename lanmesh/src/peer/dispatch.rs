//! Dispatcher: fair distribution of sends across the outgoing roster.
//!
//! Single-target sends walk the roster round-robin; broadcasts hit
//! every member in roster order. Both suspend while the roster is
//! empty. That suspension is a readiness gate, not a failure: a mesh
//! with no links yet is a normal early state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value;
use tokio::sync::Notify;

use crate::connection::Connection;
use crate::error::MeshResult;

pub(crate) struct Dispatcher {
    roster: Rc<RefCell<Vec<Rc<Connection>>>>,
    ready: Notify,
    counter: Cell<u64>,
}

impl Dispatcher {
    pub(crate) fn new(roster: Rc<RefCell<Vec<Rc<Connection>>>>) -> Self {
        Self {
            roster,
            ready: Notify::new(),
            counter: Cell::new(0),
        }
    }

    /// Wake senders suspended on an empty roster.
    pub(crate) fn notify_ready(&self) {
        self.ready.notify_waiters();
    }

    // The wake may race another roster mutation, so re-check in a loop.
    // Creating the Notified future before the emptiness check means no
    // wakeup can slip between check and await on this thread.
    async fn wait_ready(&self) {
        loop {
            let notified = self.ready.notified();
            if !self.roster.borrow().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Send to the next roster member in round-robin order.
    ///
    /// The counter is never reset, so roster growth and shrinkage do
    /// not corrupt the walk; fairness holds for the roster as of each
    /// call.
    pub(crate) async fn send(&self, channel: &str, message: Value) -> MeshResult<()> {
        self.wait_ready().await;
        let conn = {
            let roster = self.roster.borrow();
            let index = (self.counter.get() % roster.len() as u64) as usize;
            self.counter.set(self.counter.get().wrapping_add(1));
            Rc::clone(&roster[index])
        };
        conn.send(channel, message)?;
        Ok(())
    }

    /// Send to every roster member, in roster order.
    ///
    /// A failure on one member is logged and does not stop delivery to
    /// the rest.
    pub(crate) async fn broadcast(&self, channel: &str, message: Value) -> MeshResult<()> {
        self.wait_ready().await;
        let members: Vec<_> = self.roster.borrow().iter().map(Rc::clone).collect();
        for conn in members {
            if let Err(error) = conn.send(channel, message.clone()) {
                tracing::warn!(serial = conn.serial(), %error, "broadcast send failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::connection::{Direction, FrameEncoder, WriteCmd};
    use crate::wire::{encode_frame, FrameBuffer};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fake_conn(serial: u64) -> (Rc<Connection>, mpsc::UnboundedReceiver<WriteCmd>) {
        let codec = JsonCodec;
        let encoder: FrameEncoder =
            Rc::new(move |channel, message| encode_frame(&codec, channel, message));
        Connection::new(
            serial,
            Direction::Outgoing,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000),
            encoder,
            Default::default(),
        )
    }

    fn drain_payloads(rx: &mut mpsc::UnboundedReceiver<WriteCmd>) -> Vec<Value> {
        let mut buffer = FrameBuffer::new();
        let mut out = Vec::new();
        while let Ok(WriteCmd::Frame(bytes)) = rx.try_recv() {
            for frame in buffer.feed(&JsonCodec, &bytes).expect("feed") {
                out.push(frame.message);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_round_robin_cycles_roster_in_order() {
        let roster = Rc::new(RefCell::new(Vec::new()));
        let dispatcher = Dispatcher::new(Rc::clone(&roster));

        let mut rxs = Vec::new();
        for serial in 0..3 {
            let (conn, rx) = fake_conn(serial);
            roster.borrow_mut().push(conn);
            rxs.push(rx);
        }

        for i in 0..6 {
            dispatcher.send("hit", json!(i)).await.expect("send");
        }

        // Two full cycles: member k sees payloads k and k + 3.
        for (k, rx) in rxs.iter_mut().enumerate() {
            assert_eq!(drain_payloads(rx), vec![json!(k), json!(k + 3)]);
        }
    }

    #[tokio::test]
    async fn test_counter_survives_roster_shrink() {
        let roster = Rc::new(RefCell::new(Vec::new()));
        let dispatcher = Dispatcher::new(Rc::clone(&roster));

        let mut rxs = Vec::new();
        for serial in 0..3 {
            let (conn, rx) = fake_conn(serial);
            roster.borrow_mut().push(conn);
            rxs.push(rx);
        }

        dispatcher.send("hit", json!(0)).await.expect("send");
        roster.borrow_mut().remove(1);
        // Modulo arithmetic keeps working against the new length.
        for i in 1..5 {
            dispatcher.send("hit", json!(i)).await.expect("send");
        }

        let total: usize = rxs.iter_mut().map(|rx| drain_payloads(rx).len()).sum();
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_send_waits_for_first_outgoing() {
        let roster = Rc::new(RefCell::new(Vec::new()));
        let dispatcher = Dispatcher::new(Rc::clone(&roster));

        let send = dispatcher.send("gate", json!(1));
        tokio::pin!(send);

        // Empty roster: the send must still be suspended.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), send.as_mut())
                .await
                .is_err()
        );

        let (conn, mut rx) = fake_conn(0);
        roster.borrow_mut().push(conn);
        dispatcher.notify_ready();

        tokio::time::timeout(Duration::from_secs(1), send)
            .await
            .expect("gate should open")
            .expect("send should succeed");
        assert_eq!(drain_payloads(&mut rx), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member_once() {
        let roster = Rc::new(RefCell::new(Vec::new()));
        let dispatcher = Dispatcher::new(Rc::clone(&roster));

        let mut rxs = Vec::new();
        for serial in 0..3 {
            let (conn, rx) = fake_conn(serial);
            roster.borrow_mut().push(conn);
            rxs.push(rx);
        }

        dispatcher.broadcast("ping", json!(1)).await.expect("broadcast");

        for rx in rxs.iter_mut() {
            assert_eq!(drain_payloads(rx), vec![json!(1)]);
        }
    }
}
