//! End-to-end mesh tests over real loopback TCP.
//!
//! Every test runs two or more peers on a current-thread runtime inside
//! a `LocalSet`, with port 0 listeners and `StaticDiscovery` seed
//! lists standing in for a real discovery backend.

use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use lanmesh::{
    Discovery, JsonCodec, MeshError, Peer, PeerConfig, PeerEvent, StaticDiscovery, StaticSeed,
    TokioNetworkProvider,
};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::task::LocalSet;

type TestPeer = Rc<Peer<TokioNetworkProvider, JsonCodec>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_peer(config: PeerConfig, seeds: Vec<StaticSeed>) -> TestPeer {
    Peer::launch(
        "test-mesh",
        config,
        TokioNetworkProvider::new(),
        JsonCodec,
        move |_info| -> Box<dyn Discovery> { Box::new(StaticDiscovery::new(seeds)) },
    )
    .await
    .expect("peer should start")
}

fn seed_of(peer: &TestPeer) -> StaticSeed {
    StaticSeed {
        id: peer.id().clone(),
        addresses: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        port: peer
            .listen_addr()
            .expect("server peer should be listening")
            .port(),
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn mesh_handshake_creates_bidirectional_edges() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let a = spawn_peer(PeerConfig::new(0), Vec::new()).await;
            let b = spawn_peer(PeerConfig::new(0), vec![seed_of(&a)]).await;

            // B dials A from discovery; A dials back from the discover
            // handshake. End state: one edge, seen from both sides in
            // both directions.
            wait_until("bidirectional edges", || {
                a.outgoing_count() == 1
                    && a.incoming_count() == 1
                    && b.outgoing_count() == 1
                    && b.incoming_count() == 1
            })
            .await;

            assert_eq!(a.stats().connections_established, 1);
            assert_eq!(b.stats().connections_established, 1);

            a.stop().await.expect("stop a");
            b.stop().await.expect("stop b");
        })
        .await;
}

#[tokio::test]
async fn rpc_ask_resolves_with_handler_result() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
            server.question("square", |v| async move {
                let x = v.as_i64().unwrap_or(0);
                json!(x * x)
            });

            let client = spawn_peer(PeerConfig::client_only(0), vec![seed_of(&server)]).await;

            let reply = tokio::time::timeout(Duration::from_secs(5), client.ask("square", json!(7)))
                .await
                .expect("reply in time")
                .expect("ask should succeed");
            assert_eq!(reply, json!(49));

            client.stop().await.expect("stop client");
            server.stop().await.expect("stop server");
        })
        .await;
}

#[tokio::test]
async fn unknown_question_resolves_null_instead_of_hanging() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
            let client = spawn_peer(PeerConfig::client_only(0), vec![seed_of(&server)]).await;

            let reply =
                tokio::time::timeout(Duration::from_secs(5), client.ask("missing", json!({"x": 1})))
                    .await
                    .expect("reply in time")
                    .expect("ask should succeed");
            assert_eq!(reply, Value::Null);

            client.stop().await.expect("stop client");
            server.stop().await.expect("stop server");
        })
        .await;
}

#[tokio::test]
async fn concurrent_asks_correlate_under_permuted_replies() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
            // Later asks answer sooner, so replies come back in reverse
            // issue order; correlation must still match each future to
            // its own payload.
            server.question("tenfold", |v| async move {
                let i = v.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis((5 - i) * 40)).await;
                json!(i * 10)
            });

            let client = spawn_peer(PeerConfig::client_only(0), vec![seed_of(&server)]).await;

            let mut asks = Vec::new();
            for i in 0..5u64 {
                let client = Rc::clone(&client);
                asks.push(tokio::task::spawn_local(async move {
                    (i, client.ask("tenfold", json!(i)).await)
                }));
            }

            for ask in asks {
                let (i, reply) = tokio::time::timeout(Duration::from_secs(5), ask)
                    .await
                    .expect("ask in time")
                    .expect("task should not panic");
                assert_eq!(reply.expect("ask should succeed"), json!(i * 10));
            }

            client.stop().await.expect("stop client");
            server.stop().await.expect("stop server");
        })
        .await;
}

#[tokio::test]
async fn round_robin_spreads_sends_evenly() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut servers = Vec::new();
            let mut seeds = Vec::new();
            for _ in 0..3 {
                let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
                seeds.push(seed_of(&server));
                servers.push(server);
            }
            let mut receivers: Vec<_> = servers
                .iter()
                .map(|server| server.channels().subscribe("hit"))
                .collect();

            let client = spawn_peer(PeerConfig::client_only(0), seeds).await;
            wait_until("three outgoing connections", || client.outgoing_count() == 3).await;

            for i in 0..6 {
                client.send("hit", json!(i)).await.expect("send");
            }

            // Two full cycles: every server sees exactly two hits.
            for rx in receivers.iter_mut() {
                for _ in 0..2 {
                    tokio::time::timeout(Duration::from_secs(5), rx.recv())
                        .await
                        .expect("hit in time")
                        .expect("router should stay open");
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            for rx in receivers.iter_mut() {
                assert!(rx.try_recv().is_err(), "server saw more than its share");
            }

            client.stop().await.expect("stop client");
            for server in servers {
                server.stop().await.expect("stop server");
            }
        })
        .await;
}

#[tokio::test]
async fn broadcast_reaches_every_connection_exactly_once() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let mut servers = Vec::new();
            let mut seeds = Vec::new();
            for _ in 0..3 {
                let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
                seeds.push(seed_of(&server));
                servers.push(server);
            }
            let mut receivers: Vec<_> = servers
                .iter()
                .map(|server| server.channels().subscribe("ping"))
                .collect();

            let client = spawn_peer(PeerConfig::client_only(0), seeds).await;
            wait_until("three outgoing connections", || client.outgoing_count() == 3).await;

            client.broadcast("ping", json!(1)).await.expect("broadcast");

            for rx in receivers.iter_mut() {
                let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .expect("ping in time")
                    .expect("router should stay open");
                assert_eq!(msg.message, json!(1));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            for rx in receivers.iter_mut() {
                assert!(rx.try_recv().is_err(), "ping observed more than once");
            }

            client.stop().await.expect("stop client");
            for server in servers {
                server.stop().await.expect("stop server");
            }
        })
        .await;
}

#[tokio::test]
async fn duplicate_found_events_yield_one_connection() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
            // The same peer reported twice must still produce a single
            // outgoing connection.
            let seeds = vec![seed_of(&server), seed_of(&server)];
            let client = spawn_peer(PeerConfig::client_only(0), seeds).await;

            wait_until("one outgoing connection", || client.outgoing_count() == 1).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(client.outgoing_count(), 1);
            assert_eq!(server.incoming_count(), 1);

            client.stop().await.expect("stop client");
            server.stop().await.expect("stop server");
        })
        .await;
}

#[tokio::test]
async fn direction_routers_see_only_their_side() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
            let mut on_incoming = server.incoming().subscribe("greet");
            let mut on_outgoing = server.outgoing().subscribe("greet");
            let mut on_any = server.channels().subscribe("greet");
            let mut events = server.subscribe_events();

            let client = spawn_peer(PeerConfig::client_only(0), vec![seed_of(&server)]).await;
            wait_until("client connected", || client.outgoing_count() == 1).await;

            // Subscribe the specific connection's router before traffic.
            let conn = match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("event stream open")
            {
                PeerEvent::Incoming(conn) => conn,
                PeerEvent::Outgoing(_) => panic!("server-only peer cannot dial"),
            };
            let mut on_conn = conn.events().subscribe("greet");

            client.send("greet", json!("hello")).await.expect("send");

            let msg = tokio::time::timeout(Duration::from_secs(5), on_incoming.recv())
                .await
                .expect("greet in time")
                .expect("router open");
            assert_eq!(msg.message, json!("hello"));
            assert_eq!(
                tokio::time::timeout(Duration::from_secs(5), on_any.recv())
                    .await
                    .expect("greet on combined router")
                    .expect("router open")
                    .message,
                json!("hello")
            );
            assert_eq!(
                tokio::time::timeout(Duration::from_secs(5), on_conn.recv())
                    .await
                    .expect("greet on connection router")
                    .expect("router open")
                    .message,
                json!("hello")
            );
            // The frame arrived on an incoming connection; the outgoing
            // router must not see it.
            assert!(on_outgoing.try_recv().is_err());

            client.stop().await.expect("stop client");
            server.stop().await.expect("stop server");
        })
        .await;
}

#[tokio::test]
async fn corrupt_stream_tears_down_only_that_connection() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
            server.question("square", |v| async move {
                let x = v.as_i64().unwrap_or(0);
                json!(x * x)
            });
            let addr = server.listen_addr().expect("listening");

            // A raw socket spewing garbage: the length prefix decodes
            // far beyond the frame cap, which is stream-fatal.
            let mut raw = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
                .await
                .expect("raw connect");
            raw.write_all(&[0xFF; 64]).await.expect("raw write");

            wait_until("corrupt connection dropped", || {
                let stats = server.stats();
                stats.connections_accepted >= 1 && stats.connections_dropped >= 1
            })
            .await;

            // A healthy peer is unaffected.
            let client = spawn_peer(PeerConfig::client_only(0), vec![seed_of(&server)]).await;
            let reply = tokio::time::timeout(Duration::from_secs(5), client.ask("square", json!(3)))
                .await
                .expect("reply in time")
                .expect("ask should succeed");
            assert_eq!(reply, json!(9));

            client.stop().await.expect("stop client");
            server.stop().await.expect("stop server");
        })
        .await;
}

#[tokio::test]
async fn stop_resolves_pending_asks_with_error() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
            server.question("stall", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                json!(null)
            });

            let client = spawn_peer(PeerConfig::client_only(0), vec![seed_of(&server)]).await;
            wait_until("client connected", || client.outgoing_count() == 1).await;

            let pending = {
                let client = Rc::clone(&client);
                tokio::task::spawn_local(async move { client.ask("stall", json!(1)).await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;

            client.stop().await.expect("stop client");

            let result = tokio::time::timeout(Duration::from_secs(1), pending)
                .await
                .expect("pending ask must resolve on stop")
                .expect("task should not panic");
            assert!(matches!(result, Err(MeshError::Stopped)));

            server.stop().await.expect("stop server");
        })
        .await;
}

#[tokio::test]
async fn configured_ask_timeout_rejects_slow_answers() {
    init_tracing();
    let local = LocalSet::new();
    local
        .run_until(async {
            let server = spawn_peer(PeerConfig::server_only(0), Vec::new()).await;
            server.question("stall", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                json!(null)
            });

            let config =
                PeerConfig::client_only(0).with_ask_timeout(Duration::from_millis(200));
            let client = spawn_peer(config, vec![seed_of(&server)]).await;

            let result = tokio::time::timeout(Duration::from_secs(5), client.ask("stall", json!(1)))
                .await
                .expect("ask must resolve via timeout");
            assert!(matches!(result, Err(MeshError::AskTimeout { .. })));

            client.stop().await.expect("stop client");
            server.stop().await.expect("stop server");
        })
        .await;
}
