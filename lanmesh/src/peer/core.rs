//! Peer facade: lifecycle, rosters, handshake, and the messaging
//! surface.
//!
//! One `Peer` composes the listener, the discovery consumer, the
//! incoming/outgoing rosters, the dispatcher, and the RPC layer, all on
//! a single-threaded runtime. Shared state lives in `Rc<RefCell<...>>`
//! mutated only from the peer's own tasks; no borrow is held across an
//! await.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::MessageCodec;
use crate::connection::{connection_task, Connection, Direction, FrameEncoder, FrameSink};
use crate::discovery::{Discovery, DiscoveryEvent, DiscoveryInfo};
use crate::error::{MeshError, MeshResult};
use crate::net::{Listener, NetworkProvider};
use crate::router::{ChannelMessage, ChannelRouter};
use crate::wire::{encode_frame, Frame};

use super::config::PeerConfig;
use super::dispatch::Dispatcher;
use super::rpc::{
    answer, reply_channel, AskEnvelope, QuestionRegistry, CHANNEL_DISCOVER, CHANNEL_REQUEST,
};
use super::{PeerId, PeerStats};

/// Connection lifecycle notifications observable by the application.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A connection was accepted by our listener.
    Incoming(Rc<Connection>),
    /// A connection we dialed was established.
    Outgoing(Rc<Connection>),
}

/// Wire shape of the discover-handshake payload.
#[derive(Debug, Serialize, Deserialize)]
struct DiscoverPayload {
    port: u16,
    addresses: Vec<IpAddr>,
    id: PeerId,
}

/// State shared between the facade and its background tasks.
struct PeerInner {
    id: PeerId,
    config: PeerConfig,
    encoder: FrameEncoder,

    incoming_roster: RefCell<Vec<Rc<Connection>>>,
    outgoing_roster: Rc<RefCell<Vec<Rc<Connection>>>>,
    // Outgoing connect attempts in flight, so two found events for the
    // same id cannot race past the roster dedup check.
    pending_connects: RefCell<HashSet<PeerId>>,

    dispatcher: Dispatcher,
    questions: QuestionRegistry,
    next_serial: Cell<u64>,
    next_request_id: Cell<u64>,

    incoming: ChannelRouter,
    outgoing: ChannelRouter,
    channels: ChannelRouter,
    event_subs: RefCell<Vec<mpsc::UnboundedSender<PeerEvent>>>,

    stats: Rc<RefCell<PeerStats>>,
    listen_addr: Cell<Option<SocketAddr>>,
    running: Cell<bool>,
    stopped: Cell<bool>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

impl PeerInner {
    fn next_serial(&self) -> u64 {
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        serial
    }

    fn next_request_id(&self) -> u64 {
        let id = self.next_request_id.get();
        self.next_request_id.set(id + 1);
        id
    }

    fn has_outgoing(&self, id: &PeerId) -> bool {
        self.outgoing_roster
            .borrow()
            .iter()
            .any(|conn| conn.peer_id().as_ref() == Some(id))
    }

    fn emit(&self, event: PeerEvent) {
        self.event_subs
            .borrow_mut()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Port remote peers should dial back: the actually bound port when
    /// the listener is up, the configured one otherwise.
    fn advertised_port(&self) -> u16 {
        self.listen_addr
            .get()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port)
    }
}

impl FrameSink for PeerInner {
    fn frame(&self, conn: &Rc<Connection>, frame: Frame) {
        self.stats.borrow_mut().frames_received += 1;

        if frame.channel == CHANNEL_REQUEST {
            // Reserved: never reaches application routers.
            match serde_json::from_value::<AskEnvelope>(frame.message) {
                Ok(envelope) => {
                    self.stats.borrow_mut().requests_answered += 1;
                    let handler = self.questions.get(&envelope.question);
                    answer(handler, Rc::clone(conn), envelope);
                }
                Err(error) => {
                    tracing::warn!(
                        serial = conn.serial(),
                        %error,
                        "malformed request envelope dropped"
                    );
                }
            }
            return;
        }

        let msg = ChannelMessage {
            from: Rc::clone(conn),
            message: frame.message,
        };
        match conn.direction() {
            Direction::Incoming => self.incoming.publish(&frame.channel, msg.clone()),
            Direction::Outgoing => self.outgoing.publish(&frame.channel, msg.clone()),
        }
        self.channels.publish(&frame.channel, msg.clone());
        conn.events().publish(&frame.channel, msg);
    }

    fn closed(&self, conn: &Rc<Connection>) {
        let removed = match conn.direction() {
            Direction::Incoming => remove_by_serial(&mut self.incoming_roster.borrow_mut(), conn),
            Direction::Outgoing => remove_by_serial(&mut self.outgoing_roster.borrow_mut(), conn),
        };
        if removed {
            self.stats.borrow_mut().connections_dropped += 1;
            tracing::debug!(
                serial = conn.serial(),
                direction = ?conn.direction(),
                "connection removed from roster"
            );
        }
    }
}

fn remove_by_serial(roster: &mut Vec<Rc<Connection>>, conn: &Rc<Connection>) -> bool {
    let before = roster.len();
    roster.retain(|member| member.serial() != conn.serial());
    roster.len() != before
}

/// One running instance of the mesh library.
///
/// Construct with [`new`](Peer::new) or [`launch`](Peer::launch), then
/// talk to the mesh through [`send`](Peer::send),
/// [`broadcast`](Peer::broadcast), [`ask`](Peer::ask) and
/// [`question`](Peer::question). All methods must run on the
/// single-threaded runtime the peer was created on, inside a
/// `tokio::task::LocalSet`.
pub struct Peer<N: NetworkProvider, C: MessageCodec> {
    inner: Rc<PeerInner>,
    network: N,
    codec: C,
    discovery: RefCell<Option<Box<dyn Discovery>>>,
}

impl<N, C> Peer<N, C>
where
    N: NetworkProvider + 'static,
    C: MessageCodec,
{
    /// Construct a peer for `service` without starting it.
    ///
    /// The discovery factory receives the generated identity, service
    /// name, and configured port, mirroring how a backend is told what
    /// to advertise and browse for.
    pub fn new<F>(service: &str, config: PeerConfig, network: N, codec: C, discovery: F) -> Rc<Self>
    where
        F: FnOnce(DiscoveryInfo) -> Box<dyn Discovery>,
    {
        let id = PeerId::generate();
        let discovery = discovery(DiscoveryInfo {
            id: id.clone(),
            service: service.to_string(),
            port: config.port,
        });

        let encoder: FrameEncoder = {
            let codec = codec.clone();
            Rc::new(move |channel, message| encode_frame(&codec, channel, message))
        };
        let outgoing_roster = Rc::new(RefCell::new(Vec::new()));

        let inner = Rc::new(PeerInner {
            id,
            config,
            encoder,
            incoming_roster: RefCell::new(Vec::new()),
            outgoing_roster: Rc::clone(&outgoing_roster),
            pending_connects: RefCell::new(HashSet::new()),
            dispatcher: Dispatcher::new(outgoing_roster),
            questions: QuestionRegistry::new(),
            next_serial: Cell::new(0),
            next_request_id: Cell::new(0),
            incoming: ChannelRouter::new(),
            outgoing: ChannelRouter::new(),
            channels: ChannelRouter::new(),
            event_subs: RefCell::new(Vec::new()),
            stats: Rc::new(RefCell::new(PeerStats::default())),
            listen_addr: Cell::new(None),
            running: Cell::new(false),
            stopped: Cell::new(false),
            tasks: RefCell::new(Vec::new()),
        });

        Rc::new(Self {
            inner,
            network,
            codec,
            discovery: RefCell::new(Some(discovery)),
        })
    }

    /// Construct a peer and, unless `auto_start` was disabled, start it.
    ///
    /// # Errors
    ///
    /// Propagates [`start`](Peer::start) failures.
    pub async fn launch<F>(
        service: &str,
        config: PeerConfig,
        network: N,
        codec: C,
        discovery: F,
    ) -> MeshResult<Rc<Self>>
    where
        F: FnOnce(DiscoveryInfo) -> Box<dyn Discovery>,
    {
        let auto_start = config.auto_start;
        let peer = Self::new(service, config, network, codec, discovery);
        if auto_start {
            peer.start().await?;
        }
        Ok(peer)
    }

    /// This peer's generated identity.
    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    /// The active configuration.
    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// Actual listener address once started as a server. Resolves a
    /// configured port 0 to the kernel-assigned port.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.listen_addr.get()
    }

    /// Snapshot of traffic and roster counters.
    pub fn stats(&self) -> PeerStats {
        *self.inner.stats.borrow()
    }

    /// Number of live outgoing connections.
    pub fn outgoing_count(&self) -> usize {
        self.inner.outgoing_roster.borrow().len()
    }

    /// Number of live incoming connections.
    pub fn incoming_count(&self) -> usize {
        self.inner.incoming_roster.borrow().len()
    }

    /// Router seeing traffic from incoming connections.
    pub fn incoming(&self) -> &ChannelRouter {
        &self.inner.incoming
    }

    /// Router seeing traffic from outgoing connections.
    pub fn outgoing(&self) -> &ChannelRouter {
        &self.inner.outgoing
    }

    /// Router seeing traffic from both directions.
    pub fn channels(&self) -> &ChannelRouter {
        &self.inner.channels
    }

    /// Stream of connection-established events.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.event_subs.borrow_mut().push(tx);
        rx
    }

    /// Register a handler for `question`. Last registration wins.
    pub fn question<F, Fut>(&self, question: &str, handler: F)
    where
        F: Fn(Value) -> Fut + 'static,
        Fut: std::future::Future<Output = Value> + 'static,
    {
        self.inner.questions.register(question, handler);
    }

    /// Ask `question` of the next outgoing peer (round-robin) and await
    /// the correlated reply.
    ///
    /// Suspends while no outgoing connection exists. Without a
    /// configured `ask_timeout` an unanswered ask stays pending
    /// indefinitely.
    ///
    /// # Errors
    ///
    /// [`MeshError::AskTimeout`] when the configured timeout elapses,
    /// [`MeshError::Stopped`] when the peer shuts down mid-flight, or
    /// an encode error from the codec.
    pub async fn ask(&self, question: &str, data: Value) -> MeshResult<Value> {
        if self.inner.stopped.get() {
            return Err(MeshError::Stopped);
        }
        let id = self.inner.next_request_id();
        self.inner.stats.borrow_mut().requests_issued += 1;
        let channel = reply_channel(id);

        // Waiter first: it must exist before any reply can possibly be
        // routed. Replies come back over the carrying connection, hence
        // the outgoing router.
        let waiter = self.inner.outgoing.once(&channel);
        let envelope = json!({ "question": question, "data": data, "id": id });
        if let Err(error) = self.inner.dispatcher.send(CHANNEL_REQUEST, envelope).await {
            self.inner.outgoing.forget(&channel);
            return Err(error);
        }

        let reply = match self.inner.config.ask_timeout {
            Some(limit) => match tokio::time::timeout(limit, waiter).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.inner.outgoing.forget(&channel);
                    return Err(MeshError::AskTimeout {
                        question: question.to_string(),
                    });
                }
            },
            None => waiter.await,
        };
        reply
            .map(|msg| msg.message)
            .map_err(|_| MeshError::Stopped)
    }

    /// Fire-and-forget send to the next outgoing peer (round-robin).
    ///
    /// Suspends while no outgoing connection exists.
    ///
    /// # Errors
    ///
    /// Encode errors and [`MeshError::Stopped`] only; delivery itself is
    /// best-effort.
    pub async fn send(&self, channel: &str, data: Value) -> MeshResult<()> {
        if self.inner.stopped.get() {
            return Err(MeshError::Stopped);
        }
        self.inner.dispatcher.send(channel, data).await
    }

    /// Fire-and-forget send to every outgoing peer.
    ///
    /// Suspends while no outgoing connection exists; one member failing
    /// does not stop the rest.
    ///
    /// # Errors
    ///
    /// [`MeshError::Stopped`] after shutdown.
    pub async fn broadcast(&self, channel: &str, data: Value) -> MeshResult<()> {
        if self.inner.stopped.get() {
            return Err(MeshError::Stopped);
        }
        self.inner.dispatcher.broadcast(channel, data).await
    }

    /// Start listening, discovery, and the handshake machinery.
    ///
    /// Idempotent while running.
    ///
    /// # Errors
    ///
    /// [`MeshError::Bind`] if the listener cannot bind,
    /// [`MeshError::Discovery`]-class errors from the backend's
    /// lifecycle calls, [`MeshError::Stopped`] after `stop`.
    pub async fn start(&self) -> MeshResult<()> {
        if self.inner.stopped.get() {
            return Err(MeshError::Stopped);
        }
        if self.inner.running.get() {
            return Ok(());
        }

        if self.inner.config.role.is_server() {
            let bind_addr =
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.inner.config.port);
            let listener = self.network.bind(bind_addr).await.map_err(|source| {
                MeshError::Bind {
                    port: self.inner.config.port,
                    source,
                }
            })?;
            if let Ok(addr) = listener.local_addr() {
                self.inner.listen_addr.set(Some(addr));
            }
            tracing::info!(id = %self.inner.id, addr = ?self.inner.listen_addr.get(), "listening");

            let inner = Rc::clone(&self.inner);
            let codec = self.codec.clone();
            let handle = tokio::task::spawn_local(accept_loop(listener, inner, codec));
            self.inner.tasks.borrow_mut().push(handle);
        }

        if self.inner.config.role.is_client() && self.inner.config.role.is_server() {
            // Reciprocal handshake: a discover frame on an incoming link
            // turns the one-way link into a mesh edge.
            let mut discover_rx = self.inner.incoming.subscribe(CHANNEL_DISCOVER);
            let inner = Rc::clone(&self.inner);
            let network = self.network.clone();
            let codec = self.codec.clone();
            let handle = tokio::task::spawn_local(async move {
                while let Some(msg) = discover_rx.recv().await {
                    handle_discover(&inner, &network, &codec, msg);
                }
            });
            self.inner.tasks.borrow_mut().push(handle);
        }

        let mut discovery = self
            .discovery
            .borrow_mut()
            .take()
            .ok_or(MeshError::Stopped)?;
        let lifecycle = async {
            discovery.start().await?;
            if self.inner.config.role.is_server() {
                discovery.publish().await?;
            }
            if self.inner.config.role.is_client() {
                discovery.search().await?;
            }
            Ok::<_, MeshError>(discovery.take_events())
        }
        .await;
        let events = match lifecycle {
            Ok(events) => events,
            Err(error) => {
                *self.discovery.borrow_mut() = Some(discovery);
                return Err(error);
            }
        };
        *self.discovery.borrow_mut() = Some(discovery);

        if self.inner.config.role.is_client() {
            if let Some(mut events) = events {
                let inner = Rc::clone(&self.inner);
                let network = self.network.clone();
                let codec = self.codec.clone();
                let handle = tokio::task::spawn_local(async move {
                    while let Some(event) = events.recv().await {
                        match event {
                            DiscoveryEvent::Found {
                                id,
                                addresses,
                                port,
                            } => {
                                if id == inner.id {
                                    continue;
                                }
                                tokio::task::spawn_local(connect_to(
                                    Rc::clone(&inner),
                                    network.clone(),
                                    codec.clone(),
                                    addresses,
                                    port,
                                    id,
                                ));
                            }
                            DiscoveryEvent::Closed { id } => {
                                // Tracked only; existing links stay up.
                                tracing::debug!(%id, "peer disappeared");
                            }
                        }
                    }
                });
                self.inner.tasks.borrow_mut().push(handle);
            }
        }

        self.inner.running.set(true);
        Ok(())
    }

    /// Stop discovery, the listener, and every connection.
    ///
    /// Pending asks resolve with [`MeshError::Stopped`]. Idempotent.
    ///
    /// # Errors
    ///
    /// A discovery backend failing its `stop` call surfaces here, after
    /// local teardown has completed anyway.
    pub async fn stop(&self) -> MeshResult<()> {
        if self.inner.stopped.get() {
            return Ok(());
        }
        self.inner.stopped.set(true);
        self.inner.running.set(false);

        let mut result = Ok(());
        let discovery = self.discovery.borrow_mut().take();
        if let Some(mut discovery) = discovery {
            result = discovery.stop().await;
            *self.discovery.borrow_mut() = Some(discovery);
        }

        for handle in self.inner.tasks.borrow_mut().drain(..) {
            handle.abort();
        }

        let members: Vec<_> = {
            let outgoing = self.inner.outgoing_roster.borrow();
            let incoming = self.inner.incoming_roster.borrow();
            outgoing.iter().chain(incoming.iter()).map(Rc::clone).collect()
        };
        for conn in members {
            conn.close();
        }
        self.inner.outgoing_roster.borrow_mut().clear();
        self.inner.incoming_roster.borrow_mut().clear();

        self.inner.incoming.clear();
        self.inner.outgoing.clear();
        self.inner.channels.clear();
        self.inner.event_subs.borrow_mut().clear();

        tracing::info!(id = %self.inner.id, "peer stopped");
        result
    }
}

/// Accept incoming sockets until the listener dies or the task is
/// aborted by `stop`.
async fn accept_loop<L, C>(listener: L, inner: Rc<PeerInner>, codec: C)
where
    L: Listener + 'static,
    C: MessageCodec,
{
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                let (conn, write_rx) = Connection::new(
                    inner.next_serial(),
                    Direction::Incoming,
                    remote_addr,
                    Rc::clone(&inner.encoder),
                    Rc::clone(&inner.stats),
                );
                inner.incoming_roster.borrow_mut().push(Rc::clone(&conn));
                inner.stats.borrow_mut().connections_accepted += 1;

                let sink: Rc<dyn FrameSink> = Rc::clone(&inner) as Rc<dyn FrameSink>;
                tokio::task::spawn_local(connection_task(
                    Rc::clone(&conn),
                    stream,
                    codec.clone(),
                    write_rx,
                    sink,
                ));
                inner.emit(PeerEvent::Incoming(Rc::clone(&conn)));
                tracing::debug!(serial = conn.serial(), %remote_addr, "incoming connection");
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed, listener loop ending");
                break;
            }
        }
    }
}

/// React to a discover-handshake payload by dialing back.
fn handle_discover<N, C>(inner: &Rc<PeerInner>, network: &N, codec: &C, msg: ChannelMessage)
where
    N: NetworkProvider + 'static,
    C: MessageCodec,
{
    let payload = match serde_json::from_value::<DiscoverPayload>(msg.message) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(
                serial = msg.from.serial(),
                %error,
                "malformed discover payload dropped"
            );
            return;
        }
    };

    let mut addresses = payload.addresses;
    if addresses.is_empty() {
        // Nothing advertised: dial back where the bytes came from.
        addresses.push(msg.from.remote_addr().ip());
    }

    tokio::task::spawn_local(connect_to(
        Rc::clone(inner),
        network.clone(),
        codec.clone(),
        addresses,
        payload.port,
        payload.id,
    ));
}

/// Dial one discovered peer, deduplicated by identity.
///
/// Failures stay local to this attempt: they are logged, the pending
/// mark is cleared, and nothing else is affected.
async fn connect_to<N, C>(
    inner: Rc<PeerInner>,
    network: N,
    codec: C,
    addresses: Vec<IpAddr>,
    port: u16,
    id: PeerId,
) where
    N: NetworkProvider + 'static,
    C: MessageCodec,
{
    if inner.has_outgoing(&id) {
        tracing::trace!(%id, "already connected");
        return;
    }
    if !inner.pending_connects.borrow_mut().insert(id.clone()) {
        tracing::trace!(%id, "connect already in flight");
        return;
    }

    let Some(address) = addresses.first().copied() else {
        tracing::warn!(%id, "found event carried no addresses");
        inner.pending_connects.borrow_mut().remove(&id);
        return;
    };
    let addr = SocketAddr::new(address, port);

    let attempt = tokio::time::timeout(inner.config.connect_timeout, network.connect(addr)).await;
    inner.pending_connects.borrow_mut().remove(&id);
    let stream = match attempt {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            tracing::warn!(%id, %addr, %error, "connect failed");
            return;
        }
        Err(_) => {
            tracing::warn!(%id, %addr, "connect timed out");
            return;
        }
    };

    let (conn, write_rx) = Connection::new(
        inner.next_serial(),
        Direction::Outgoing,
        addr,
        Rc::clone(&inner.encoder),
        Rc::clone(&inner.stats),
    );
    conn.set_peer_id(id.clone());
    inner.outgoing_roster.borrow_mut().push(Rc::clone(&conn));
    inner.stats.borrow_mut().connections_established += 1;

    let sink: Rc<dyn FrameSink> = Rc::clone(&inner) as Rc<dyn FrameSink>;
    tokio::task::spawn_local(connection_task(
        Rc::clone(&conn),
        stream,
        codec,
        write_rx,
        sink,
    ));

    inner.dispatcher.notify_ready();
    inner.emit(PeerEvent::Outgoing(Rc::clone(&conn)));
    tracing::info!(%id, %addr, "outgoing connection established");

    if inner.config.role.is_server() {
        // Tell the remote end how to connect back.
        let hello = DiscoverPayload {
            port: inner.advertised_port(),
            addresses: inner.config.advertise_addresses.clone(),
            id: inner.id.clone(),
        };
        match serde_json::to_value(&hello) {
            Ok(hello) => {
                if let Err(error) = conn.send(CHANNEL_DISCOVER, hello) {
                    tracing::warn!(%error, "failed to send discover handshake");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to encode discover handshake");
            }
        }
    }
}
