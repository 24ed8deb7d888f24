//! Integration tests for multiplexed sessions between two gateways: stream
//! dialing, local forwarding, reverse forwarding and bus delivery over QUIC.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use meshgate::{
    Capabilities, CertOptions, ChannelRouter, Gateway, GatewayConfig, Handler, Keypair,
    MeshError, Message, MessageRouter, MuxDialer, QuicMux, Request, Role, SessionKind, Status,
    Stream, Subscriptions, TlsMaterial, TransportOptions, TrustStore, socks5_connect,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

static INIT: Once = Once::new();

/// Use RUST_LOG=debug for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Atomic port counter for unique port allocation across parallel tests.
/// TLS and QUIC share the number (TCP and UDP).
static PORT_COUNTER: AtomicU16 = AtomicU16::new(32000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Node {
    gateway: Gateway,
    router: Arc<ChannelRouter>,
}

async fn node(keypair: Keypair, trust: Arc<TrustStore>) -> Node {
    let addr: SocketAddr = format!("127.0.0.1:{}", next_port()).parse().unwrap();
    let config = GatewayConfig {
        listen: addr,
        mux_listen: addr,
        ..GatewayConfig::default()
    };
    let router = Arc::new(ChannelRouter::new());
    let gateway = Gateway::bind(keypair, config, trust, router.clone())
        .await
        .expect("gateway bind failed");
    Node { gateway, router }
}

/// Client `a` and server `b`; `b` trusts `a` as `admin`.
async fn trusted_pair() -> (Node, Node) {
    let a_key = Keypair::generate();
    let b_trust = Arc::new(TrustStore::new());
    b_trust.trust(a_key.encoded_key(), Role::new("admin"));
    let a = node(a_key, Arc::new(TrustStore::new())).await;
    let b = node(Keypair::generate(), b_trust).await;
    (a, b)
}

/// TCP echo server; returns its address.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn assert_echo(tcp: &mut TcpStream, payload: &[u8]) {
    tcp.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(TEST_TIMEOUT, tcp.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn dial_proxy_reaches_tcp_destination() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let echo = echo_server().await;

    let dialer = timeout(
        TEST_TIMEOUT,
        a.gateway.connect(
            b.gateway.mux_addr().unwrap(),
            b.gateway.encoded_key(),
            Subscriptions::directed(),
        ),
    )
    .await
    .unwrap()
    .expect("connect failed");
    assert_eq!(dialer.kind(), SessionKind::Quic);
    assert_eq!(
        dialer.capabilities(),
        Capabilities {
            forwarding: true,
            reverse_forward: true
        }
    );
    assert_eq!(dialer.peer().address, Some(b.gateway.address()));

    let mut stream = Stream::new(echo.to_string());
    timeout(TEST_TIMEOUT, dialer.dial_proxy(&mut stream))
        .await
        .unwrap()
        .expect("dial_proxy failed");
    assert!(stream.is_attached());

    let (mut server_in, mut server_out) = stream.take_halves().unwrap();
    server_out.write_all(b"over quic").await.unwrap();
    let mut buf = [0u8; 9];
    timeout(TEST_TIMEOUT, server_in.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"over quic");

    // Both ends recorded the session.
    let a_view = a
        .gateway
        .registry()
        .snapshot(b.gateway.address().node_key())
        .await
        .unwrap();
    assert!(a_view.has_outbound);
    assert!(a_view.backoff.is_zero());
    let b_view = b
        .gateway
        .registry()
        .snapshot(a.gateway.address().node_key())
        .await
        .unwrap();
    assert!(b_view.has_inbound);

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn sessions_are_reused() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let mux = b.gateway.mux_addr().unwrap();

    for _ in 0..2 {
        timeout(
            TEST_TIMEOUT,
            a.gateway
                .connect(mux, b.gateway.encoded_key(), Subscriptions::directed()),
        )
        .await
        .unwrap()
        .unwrap();
    }
    assert_eq!(a.gateway.cached_sessions(), 1);

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn guest_cannot_open_streams() {
    init_tracing();
    let a = node(Keypair::generate(), Arc::new(TrustStore::new())).await;
    let b = node(Keypair::generate(), Arc::new(TrustStore::new())).await;
    let echo = echo_server().await;

    let dialer = timeout(
        TEST_TIMEOUT,
        a.gateway.connect(
            b.gateway.mux_addr().unwrap(),
            b.gateway.encoded_key(),
            Subscriptions::directed(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    let mut stream = Stream::new(echo.to_string());
    let result = timeout(TEST_TIMEOUT, dialer.dial_proxy(&mut stream)).await.unwrap();
    assert!(matches!(result, Err(MeshError::DialFailed { .. })));
    assert!(!stream.is_attached());

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn pinned_key_mismatch_fails_dial() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let wrong = Keypair::generate().encoded_key();

    let result = timeout(
        TEST_TIMEOUT,
        a.gateway
            .connect(b.gateway.mux_addr().unwrap(), &wrong, Subscriptions::directed()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(MeshError::DialFailed { .. })));
    assert_eq!(a.gateway.cached_sessions(), 0);

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn dial_node_uses_recorded_gateway() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let b_key = b.gateway.encoded_key().clone();
    let mux = b.gateway.mux_addr().unwrap();

    let registry = a.gateway.registry();
    let node_key = registry.node_for_key(&b_key).await.node_key();
    registry
        .update_gateway_direct(node_key, mux.ip(), None, mux.port(), false)
        .await
        .unwrap();

    let dialer = timeout(
        TEST_TIMEOUT,
        a.gateway.dial_node(&b_key, Subscriptions::topology(), 1),
    )
    .await
    .unwrap()
    .expect("dial_node failed");
    assert!(!dialer.is_closed());

    // A live outbound session is returned as is.
    let again = a
        .gateway
        .dial_node(&b_key, Subscriptions::topology(), 1)
        .await
        .unwrap();
    assert!(!again.is_closed());
    assert_eq!(a.gateway.cached_sessions(), 1);

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn dial_node_without_gateway_fails() {
    init_tracing();
    let a = node(Keypair::generate(), Arc::new(TrustStore::new())).await;
    let unknown = Keypair::generate().encoded_key();

    let node_key = unknown.address().node_key();

    let result = a
        .gateway
        .dial_node(&unknown, Subscriptions::directed(), 3)
        .await;
    assert!(matches!(result, Err(MeshError::DialFailed { .. })));
    assert_eq!(a.gateway.registry().len().await, 1);
    let first = a.gateway.registry().snapshot(node_key).await.unwrap().backoff;
    assert!(first > Duration::ZERO);

    let result = a
        .gateway
        .dial_node(&unknown, Subscriptions::directed(), 1)
        .await;
    assert!(result.is_err());
    let second = a.gateway.registry().snapshot(node_key).await.unwrap().backoff;
    assert!(second > first);

    a.gateway.shutdown();
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn forward_tcp_carries_local_connections() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let echo = echo_server().await;

    let dialer = timeout(
        TEST_TIMEOUT,
        a.gateway.connect(
            b.gateway.mux_addr().unwrap(),
            b.gateway.encoded_key(),
            Subscriptions::directed(),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    let handle = dialer
        .forward_tcp("127.0.0.1:0".parse().unwrap(), &echo.to_string())
        .await
        .expect("forward_tcp failed");

    let mut tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    assert_echo(&mut tcp, b"forwarded").await;
    assert_echo(&mut tcp, b"twice").await;

    drop(handle);
    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn forward_socks_dials_requested_target() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let echo = echo_server().await;

    let dialer = timeout(
        TEST_TIMEOUT,
        a.gateway.connect(
            b.gateway.mux_addr().unwrap(),
            b.gateway.encoded_key(),
            Subscriptions::directed(),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    let handle = dialer
        .forward_socks("127.0.0.1:0".parse().unwrap())
        .await
        .expect("forward_socks failed");

    let mut tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    timeout(
        TEST_TIMEOUT,
        socks5_connect(&mut tcp, &echo.ip().to_string(), echo.port()),
    )
    .await
    .unwrap()
    .expect("SOCKS connect failed");
    assert_echo(&mut tcp, b"socks").await;

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn reverse_listen_reaches_registered_target() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let echo = echo_server().await;
    b.gateway.add_reverse_target("web", 8080, echo);

    timeout(
        TEST_TIMEOUT,
        a.gateway.connect(
            b.gateway.mux_addr().unwrap(),
            b.gateway.encoded_key(),
            Subscriptions::directed(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    let handle = a
        .gateway
        .reverse_listen(
            b.gateway.address().node_key(),
            "127.0.0.1:0".parse().unwrap(),
            "web",
            8080,
        )
        .await
        .expect("reverse_listen failed");

    let mut tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    assert_echo(&mut tcp, b"reverse").await;

    let missing = a
        .gateway
        .reverse_listen(12345, "127.0.0.1:0".parse().unwrap(), "web", 8080)
        .await;
    assert!(matches!(missing, Err(MeshError::UnknownNode(12345))));

    a.gateway.shutdown();
    b.gateway.shutdown();
}

// ============================================================================
// Bus
// ============================================================================

#[tokio::test]
async fn subscribed_messages_are_pushed_over_the_session() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let mut inbox = a.router.add_connection("inbox", Subscriptions::all());

    timeout(
        TEST_TIMEOUT,
        a.gateway.connect(
            b.gateway.mux_addr().unwrap(),
            b.gateway.encoded_key(),
            Subscriptions::topology(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    // Not subscribed: stays on b.
    assert_eq!(b.router.dispatch(Message::new("chat/room", b"x".to_vec())), 0);

    let delivered = b
        .router
        .dispatch(Message::new("topology/announce", b"node-b".to_vec()));
    assert_eq!(delivered, 1);

    let message = timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("message not delivered")
        .unwrap();
    assert_eq!(message.to, "topology/announce");
    assert_eq!(message.data, b"node-b");
    assert_eq!(message.from, b.gateway.address().to_string());

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn guest_subscriptions_are_narrowed() {
    init_tracing();
    let a = node(Keypair::generate(), Arc::new(TrustStore::new())).await;
    let b = node(Keypair::generate(), Arc::new(TrustStore::new())).await;
    let mut inbox = a.router.add_connection("inbox", Subscriptions::all());

    timeout(
        TEST_TIMEOUT,
        a.gateway.connect(
            b.gateway.mux_addr().unwrap(),
            b.gateway.encoded_key(),
            Subscriptions::all(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(b.router.dispatch(Message::new("chat/room", b"x".to_vec())), 0);
    assert_eq!(
        b.router
            .dispatch(Message::new("topology/announce", b"x".to_vec())),
        0
    );

    // Messages addressed to the guest itself still arrive.
    let own = format!("{}/inbox", a.gateway.address());
    assert_eq!(b.router.dispatch(Message::new(own.clone(), b"mine".to_vec())), 1);
    let message = timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("message not delivered")
        .unwrap();
    assert_eq!(message.to, own);

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn cached_session_takes_new_subscriptions() {
    init_tracing();
    let (a, b) = trusted_pair().await;
    let mut inbox = a.router.add_connection("inbox", Subscriptions::all());
    let mux = b.gateway.mux_addr().unwrap();

    for subscriptions in [Subscriptions::directed(), Subscriptions::topology()] {
        timeout(
            TEST_TIMEOUT,
            a.gateway.connect(mux, b.gateway.encoded_key(), subscriptions),
        )
        .await
        .unwrap()
        .unwrap();
    }
    assert_eq!(a.gateway.cached_sessions(), 1);
    assert_eq!(b.router.connection_count(), 1);

    let delivered = b
        .router
        .dispatch(Message::new("topology/announce", b"node-b".to_vec()));
    assert_eq!(delivered, 1);
    let message = timeout(TEST_TIMEOUT, inbox.recv())
        .await
        .expect("message not delivered")
        .unwrap();
    assert_eq!(message.data, b"node-b");

    a.gateway.shutdown();
    b.gateway.shutdown();
}

#[tokio::test]
async fn closed_session_leaves_the_bus() {
    init_tracing();
    let (a, b) = trusted_pair().await;

    timeout(
        TEST_TIMEOUT,
        a.gateway.connect(
            b.gateway.mux_addr().unwrap(),
            b.gateway.encoded_key(),
            Subscriptions::topology(),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(b.router.connection_count(), 1);

    a.gateway.shutdown();
    timeout(TEST_TIMEOUT, async {
        while b.router.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("bus connection outlived its session");

    b.gateway.shutdown();
}

// ============================================================================
// Recovery boundary
// ============================================================================

/// Accepts every stream, then fails halfway through the response.
struct FailsMidResponse;

#[async_trait]
impl Handler for FailsMidResponse {
    async fn handle(&self, request: &mut Request) -> anyhow::Result<()> {
        if request.path().starts_with("/tcp/") {
            request.respond(Status::Ok).await?;
            request.io().write_all(b"partial").await?;
            request.io().flush().await?;
            panic!("stream handler failed");
        }
        Ok(())
    }
}

#[tokio::test]
async fn stream_fault_after_ok_is_not_a_clean_end() {
    init_tracing();
    let server_key = Keypair::generate();
    let server_material = TlsMaterial::generate(&server_key, &CertOptions::default()).unwrap();
    let server = QuicMux::bind(
        "127.0.0.1:0".parse().unwrap(),
        &server_material,
        Arc::new(TrustStore::new()),
        TransportOptions::default(),
    )
    .unwrap();
    let handler: Arc<dyn Handler> = Arc::new(FailsMidResponse);
    server.serve(Arc::downgrade(&handler));

    let client_material =
        TlsMaterial::generate(&Keypair::generate(), &CertOptions::default()).unwrap();
    let client = QuicMux::bind(
        "127.0.0.1:0".parse().unwrap(),
        &client_material,
        Arc::new(TrustStore::new()),
        TransportOptions::default(),
    )
    .unwrap();

    let dialer = timeout(
        TEST_TIMEOUT,
        client.dial_mux(
            server.local_addr().unwrap(),
            &server_key.encoded_key(),
            Subscriptions::directed(),
        ),
    )
    .await
    .unwrap()
    .expect("dial_mux failed");

    let mut stream = Stream::new("10.0.0.1:80");
    let outcome = async {
        dialer.dial_proxy(&mut stream).await?;
        let (mut read, _write) = stream.take_halves().expect("halves attached");
        let mut received = Vec::new();
        read.read_to_end(&mut received).await?;
        Ok::<_, MeshError>(received)
    };
    let result = timeout(TEST_TIMEOUT, outcome).await.unwrap();
    assert!(result.is_err(), "faulted stream ended cleanly: {result:?}");

    client.close();
    server.close();
}
