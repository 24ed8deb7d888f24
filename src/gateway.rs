//! # Gateway
//!
//! The context object tying the pieces together: one identity, one trust store,
//! one registry and one bus router, shared by the TLS listener and the QUIC
//! mux endpoint. Every request on either surface lands in the same route table:
//!
//! | Path | Action |
//! |------|--------|
//! | `/hello` | register the peer, attach its session, subscribe it to the bus |
//! | `/announce` | record a [`NodeAnnounce`] |
//! | `/tcp/<host:port>` | proxy the stream to a TCP destination |
//! | `/dm/<to...>` | read the body into a [`Message`] and dispatch it |
//! | `/rf/<host>/<port>` | reverse-forwarded connection to a registered target |
//!
//! Only peers holding a non-guest role may open TCP streams or reverse-forward.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bus::{Message, MessageRouter, Subscriptions};
use crate::crypto::{CertOptions, TlsMaterial};
use crate::error::MeshError;
use crate::identity::{Address, EncodedKey, Keypair};
use crate::mux::{
    self, ClientDialer, ForwardHandle, HELLO_PATH, MESSAGE_PREFIX, MuxDialer, QuicMux,
    REVERSE_PREFIX, StreamProxy, TCP_PREFIX,
};
use crate::proxy::{self, TcpProxy};
use crate::registry::{
    Announce, DEFAULT_NODE_TTL, DEFAULT_REAP_INTERVAL, Direction, NodeAnnounce, Registry,
};
use crate::transport::{
    DEFAULT_SILENCED, Handler, Listener, MeshClient, Request, Transport, TransportOptions,
};
use crate::trust::{Role, TrustStore};
use crate::wire::{self, Hello, RequestHead, Status};

/// Default TLS listen port.
pub const DEFAULT_TLS_PORT: u16 = 5228;

/// Default QUIC mux port.
pub const DEFAULT_MUX_PORT: u16 = 5222;

/// Upper bound on a `/dm` body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Announce path.
pub const ANNOUNCE_PATH: &str = "/announce";

/// Meta key carrying the mux port of an announcing node.
const META_MUX_PORT: &str = "port";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// TLS listener. An unspecified IPv6 address falls back to IPv4.
    pub listen: SocketAddr,
    /// QUIC mux endpoint (UDP).
    pub mux_listen: SocketAddr,
    /// Answer `403` to TLS requests without a client certificate.
    pub mtls: bool,
    /// Extra DNS names in the local certificate.
    pub san: Vec<String>,
    pub access_log: bool,
    pub silenced: Vec<String>,
    pub node_ttl: Duration,
    pub reap_interval: Duration,
    pub max_message_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_TLS_PORT),
            mux_listen: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_MUX_PORT),
            mtls: true,
            san: Vec::new(),
            access_log: false,
            silenced: DEFAULT_SILENCED.iter().map(|s| s.to_string()).collect(),
            node_ttl: DEFAULT_NODE_TTL,
            reap_interval: DEFAULT_REAP_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl GatewayConfig {
    /// Both surfaces on loopback with OS-assigned ports.
    pub fn loopback() -> Self {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        Self {
            listen: any,
            mux_listen: any,
            ..Self::default()
        }
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            access_log: self.access_log,
            silenced: self.silenced.clone(),
            ..TransportOptions::default()
        }
    }
}

struct GatewayInner {
    key: EncodedKey,
    address: Address,
    config: GatewayConfig,
    trust: Arc<TrustStore>,
    registry: Arc<Registry>,
    router: Arc<dyn MessageRouter>,
    mux: QuicMux,
    client: MeshClient,
    /// `(host key, port key)` -> local TCP target for `/rf` streams.
    reverse_targets: RwLock<HashMap<(String, u16), SocketAddr>>,
}

pub struct Gateway {
    inner: Arc<GatewayInner>,
    listener: Mutex<Listener>,
    reaper: JoinHandle<()>,
}

impl Gateway {
    /// Build the local certificate, bind both surfaces and start serving.
    pub async fn bind(
        keypair: Keypair,
        config: GatewayConfig,
        trust: Arc<TrustStore>,
        router: Arc<dyn MessageRouter>,
    ) -> anyhow::Result<Self> {
        let material = Arc::new(
            TlsMaterial::generate(&keypair, &CertOptions::with_san(config.san.clone()))
                .context("failed to generate local certificate")?,
        );
        let options = config.transport_options();
        let transport = Transport::new(material.clone(), trust.clone(), options.clone())?;
        let mux = bind_mux(config.mux_listen, &material, trust.clone(), options)?;
        let client = transport.client()?;

        let inner = Arc::new(GatewayInner {
            key: keypair.encoded_key(),
            address: keypair.address(),
            config,
            trust,
            registry: Arc::new(Registry::new()),
            router,
            mux,
            client,
            reverse_targets: RwLock::new(HashMap::new()),
        });

        let handler: Arc<dyn Handler> = inner.clone();
        inner.mux.serve(Arc::downgrade(&handler));

        let listen = inner.config.listen;
        let listener = if listen.ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED) {
            transport.listen(listen.port(), handler, inner.config.mtls).await?
        } else {
            transport.listen_on(listen, handler, inner.config.mtls).await?
        };

        let reaper = spawn_reaper(
            inner.registry.clone(),
            inner.config.node_ttl,
            inner.config.reap_interval,
        );

        info!(
            address = %inner.address,
            tls = %listener.local_addr(),
            mux = ?inner.mux.local_addr().ok(),
            "gateway started"
        );
        Ok(Self {
            inner,
            listener: Mutex::new(listener),
            reaper,
        })
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn encoded_key(&self) -> &EncodedKey {
        &self.inner.key
    }

    /// Bound TLS listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local_addr()
    }

    /// Bound QUIC endpoint address.
    pub fn mux_addr(&self) -> Result<SocketAddr, MeshError> {
        Ok(self.inner.mux.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.inner.trust
    }

    pub fn router(&self) -> &Arc<dyn MessageRouter> {
        &self.inner.router
    }

    /// TLS client presenting the gateway certificate.
    pub fn client(&self) -> &MeshClient {
        &self.inner.client
    }

    pub fn cached_sessions(&self) -> usize {
        self.inner.mux.cached_sessions()
    }

    /// Node information sent in the hello of new sessions.
    pub fn set_local_announce(&self, announce: NodeAnnounce) {
        self.inner.mux.set_local_announce(announce);
    }

    /// One session to `addr`, which must hold `key`. On success the session is
    /// attached as the node's outbound tunnel and its backoff is reset.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        key: &EncodedKey,
        subscriptions: Subscriptions,
    ) -> Result<Arc<dyn ClientDialer>, MeshError> {
        let dialer = self.inner.mux.dial_mux(addr, key, subscriptions).await?;
        let registry = &self.inner.registry;
        let node_key = registry.node_for_key(key).await.node_key();
        registry.upsert(Announce::new(key.clone(), SystemTime::now()).from_source(addr)).await;
        registry
            .attach_dialer(node_key, Direction::Outbound, dialer.clone())
            .await?;
        registry.backoff_reset(node_key).await;
        Ok(dialer)
    }

    /// Dial a known node through its gateways in order. Every failed round
    /// advances the node's backoff, and the backoff delay is slept before the
    /// next round. At most `rounds` rounds are made.
    pub async fn dial_node(
        &self,
        key: &EncodedKey,
        subscriptions: Subscriptions,
        rounds: usize,
    ) -> Result<Arc<dyn ClientDialer>, MeshError> {
        let registry = &self.inner.registry;
        let node_key = registry.node_for_key(key).await.node_key();

        if let Some(dialer) = registry.dialer(node_key, Direction::Outbound).await
            && !dialer.is_closed()
        {
            return Ok(dialer);
        }

        let rounds = rounds.max(1);
        let mut last_error = None;
        for round in 0..rounds {
            let gateways = registry.gateways(node_key).await;
            if gateways.is_empty() {
                registry.backoff_failed(node_key).await?;
                return Err(MeshError::dial(key.address().to_string(), "no known gateway"));
            }
            for gateway in gateways {
                match self
                    .connect(gateway.socket_addr(), key, subscriptions.clone())
                    .await
                {
                    Ok(dialer) => return Ok(dialer),
                    Err(e) => {
                        debug!(node_key, gateway = %gateway, round, error = %e, "dial attempt failed");
                        last_error = Some(e);
                    }
                }
            }

            let delay = registry.backoff_failed(node_key).await?;
            if round + 1 < rounds {
                debug!(node_key, delay = ?delay, "backing off");
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_error
            .unwrap_or_else(|| MeshError::dial(key.address().to_string(), "no attempt made")))
    }

    /// Announce the local node to the TLS listener at `dest`.
    pub async fn announce_to(
        &self,
        dest: SocketAddr,
        expected: Option<Address>,
        announce: &NodeAnnounce,
    ) -> Result<(), MeshError> {
        let mut head = RequestHead::new(ANNOUNCE_PATH);
        if let Ok(mux) = self.inner.mux.local_addr() {
            head = head.with_meta(META_MUX_PORT, mux.port().to_string());
        }
        let body = wire::encode(announce)?;
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        let (response, _) = self.inner.client.request(dest, expected, &head, &framed).await?;
        if !response.is_ok() {
            return Err(MeshError::dial(
                dest.to_string(),
                format!("announce refused with status {}", response.status),
            ));
        }
        Ok(())
    }

    /// Serve `/rf/<host_key>/<port_key>` streams by connecting to `target`.
    pub fn add_reverse_target(&self, host_key: impl Into<String>, port_key: u16, target: SocketAddr) {
        self.inner
            .reverse_targets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((host_key.into(), port_key), target);
    }

    /// Accept TCP on `bind` and carry each connection to the node `node_key`,
    /// which serves it from its `host_key`/`port_key` reverse target.
    pub async fn reverse_listen(
        &self,
        node_key: u64,
        bind: SocketAddr,
        host_key: impl Into<String>,
        port_key: u16,
    ) -> Result<ForwardHandle, MeshError> {
        let registry = &self.inner.registry;
        let mut dialer = None;
        for direction in [Direction::Outbound, Direction::Inbound] {
            if let Some(candidate) = registry.dialer(node_key, direction).await
                && !candidate.is_closed()
            {
                dialer = Some(candidate);
                break;
            }
        }
        let forwarder = dialer
            .and_then(|dialer| dialer.reverse_forwarder())
            .ok_or(MeshError::UnknownNode(node_key))?;
        mux::reverse_listen(bind, forwarder, host_key.into(), port_key).await
    }

    /// Stop accepting on both surfaces and stop the reaper.
    pub fn shutdown(&self) {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown();
        self.reaper.abort();
        self.inner.mux.close();
        info!(address = %self.inner.address, "gateway stopped");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.reaper.abort();
        self.inner.mux.close();
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("address", &self.inner.address)
            .field("local_addr", &self.local_addr())
            .field("mux", &self.inner.mux)
            .finish_non_exhaustive()
    }
}

fn bind_mux(
    addr: SocketAddr,
    material: &TlsMaterial,
    trust: Arc<TrustStore>,
    options: TransportOptions,
) -> anyhow::Result<QuicMux> {
    match QuicMux::bind(addr, material, trust.clone(), options.clone()) {
        Ok(mux) => Ok(mux),
        Err(e) if addr.ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED) => {
            debug!(error = %e, "IPv6 mux bind failed, falling back to IPv4");
            let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
            QuicMux::bind(v4, material, trust, options)
        }
        Err(e) => Err(e),
    }
}

fn spawn_reaper(registry: Arc<Registry>, ttl: Duration, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = registry.evict_stale(ttl).await;
            trace!(evicted, "reaper pass");
        }
    })
}

// ============================================================================
// Routes
// ============================================================================

#[async_trait]
impl Handler for GatewayInner {
    async fn handle(&self, request: &mut Request) -> anyhow::Result<()> {
        let path = request.path().to_string();
        if path == HELLO_PATH {
            self.handle_hello(request).await
        } else if path == ANNOUNCE_PATH {
            self.handle_announce(request).await
        } else if let Some(dest) = path.strip_prefix(TCP_PREFIX) {
            self.handle_tcp(request, dest).await
        } else if let Some(to) = path.strip_prefix(MESSAGE_PREFIX) {
            self.handle_message(request, to).await
        } else if let Some(target) = path.strip_prefix(REVERSE_PREFIX) {
            self.handle_reverse(request, target).await
        } else {
            request.respond(Status::NotFound).await?;
            Ok(())
        }
    }
}

/// Topics a peer may subscribe to. Guests only receive messages addressed to
/// their own connection.
fn granted_subscriptions(role: &Role, requested: Subscriptions) -> Subscriptions {
    if role.is_guest() && !requested.topics().is_empty() {
        debug!(topics = ?requested.topics(), "guest subscriptions narrowed to directed");
        return Subscriptions::directed();
    }
    requested
}

impl GatewayInner {
    /// Refuse peers without a certificate. Returns their key otherwise.
    async fn require_key(&self, request: &mut Request) -> anyhow::Result<Option<EncodedKey>> {
        match request.peer().key.clone() {
            Some(key) => Ok(Some(key)),
            None => {
                request.respond(Status::Forbidden).await?;
                Ok(None)
            }
        }
    }

    /// Refuse guests.
    async fn require_role(&self, request: &mut Request) -> anyhow::Result<bool> {
        if request.peer().role.is_guest() {
            debug!(remote = %request.peer().remote, path = %request.path(), "refusing guest");
            request.respond(Status::Forbidden).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn handle_hello(&self, request: &mut Request) -> anyhow::Result<()> {
        let Some(key) = self.require_key(request).await? else {
            return Ok(());
        };
        let hello: Hello = wire::read_frame(request.io()).await?;
        let remote = request.peer().remote;

        let node_key = self.registry.node_for_key(&key).await.node_key();
        let announce = Announce::new(key.clone(), SystemTime::now())
            .from_source(remote)
            .with_info(hello.node);
        self.registry.upsert(announce).await;

        if let Some(session) = request.session().cloned() {
            self.registry
                .attach_dialer(node_key, Direction::Inbound, session.clone())
                .await?;
            let subscriptions = granted_subscriptions(&request.peer().role, hello.subscriptions);
            self.subscribe(key.address(), session, subscriptions);
        }
        request.respond(Status::Ok).await?;
        debug!(peer = %key.address(), remote = %remote, "hello");
        Ok(())
    }

    /// Pump bus messages matching `subscriptions` to the peer over `session`
    /// until the session closes or the bus connection is replaced.
    fn subscribe(
        &self,
        peer: Address,
        session: Arc<dyn ClientDialer>,
        subscriptions: Subscriptions,
    ) {
        let name = peer.to_string();
        let mut rx = self.router.add_connection(&name, subscriptions);
        let router = self.router.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.closed() => {
                        // Disconnected: a newer session registered under the same name.
                        if !matches!(rx.try_recv(), Err(TryRecvError::Disconnected)) {
                            router.remove_connection(&name);
                        }
                        debug!(peer = %name, "session closed, bus connection removed");
                        break;
                    }
                    message = rx.recv() => {
                        let Some(message) = message else {
                            break;
                        };
                        if let Err(e) = session.deliver(&message).await {
                            debug!(peer = %name, id = %message.id, error = %e, "message delivery failed");
                        }
                    }
                }
            }
        });
    }

    async fn handle_announce(&self, request: &mut Request) -> anyhow::Result<()> {
        let Some(key) = self.require_key(request).await? else {
            return Ok(());
        };
        let info: NodeAnnounce = wire::read_frame(request.io()).await?;
        let mut announce = Announce::new(key, SystemTime::now()).with_info(info);
        if let Some(port) = request.meta(META_MUX_PORT).and_then(|p| p.parse().ok()) {
            announce = announce.from_source(SocketAddr::new(request.peer().remote.ip(), port));
        }
        self.registry.upsert(announce).await;
        request.respond(Status::Ok).await?;
        Ok(())
    }

    async fn handle_tcp(&self, request: &mut Request, dest: &str) -> anyhow::Result<()> {
        if !self.require_role(request).await? {
            return Ok(());
        }
        let upstream = match proxy::connect_tcp(dest, None).await {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!(dest, error = %e, "upstream dial failed");
                request.respond(Status::BadGateway).await?;
                return Ok(());
            }
        };
        request.respond(Status::Ok).await?;
        let mut proxy = TcpProxy::with_upstream(request.io(), upstream, dest);
        if let Err(e) = proxy.proxy().await {
            debug!(dest, error = %e, "proxy ended with error");
        }
        proxy.close().await;
        Ok(())
    }

    async fn handle_message(&self, request: &mut Request, to: &str) -> anyhow::Result<()> {
        if to.is_empty() {
            request.respond(Status::BadRequest).await?;
            return Ok(());
        }
        let body = match request.read_body(self.config.max_message_size).await {
            Ok(body) => body,
            Err(MeshError::Wire(reason)) => {
                warn!(remote = %request.peer().remote, reason = %reason, "message rejected");
                request.respond(Status::BadRequest).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let from = match request.peer().address {
            Some(address) => address.to_string(),
            None => request.peer().remote.to_string(),
        };
        let mut message = Message::new(to, body).from_node(from);
        message.meta = request.head().meta.clone();
        let delivered = self.router.dispatch(message);
        trace!(to, delivered, "message dispatched");
        request.respond(Status::Ok).await?;
        Ok(())
    }

    async fn handle_reverse(&self, request: &mut Request, target: &str) -> anyhow::Result<()> {
        if !self.require_role(request).await? {
            return Ok(());
        }
        let parsed = target
            .rsplit_once('/')
            .and_then(|(host, port)| Some((host.to_string(), port.parse::<u16>().ok()?)));
        let Some(key) = parsed else {
            request.respond(Status::BadRequest).await?;
            return Ok(());
        };
        let addr = self
            .reverse_targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .copied();
        let Some(addr) = addr else {
            request.respond(Status::NotFound).await?;
            return Ok(());
        };

        let dest = addr.to_string();
        let upstream = match proxy::connect_tcp(&dest, Some(addr)).await {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!(dest = %dest, error = %e, "reverse target unreachable");
                request.respond(Status::BadGateway).await?;
                return Ok(());
            }
        };
        debug!(
            host_key = %key.0,
            port_key = key.1,
            client_ip = request.meta("ip").unwrap_or_default(),
            client_port = request.meta("port").unwrap_or_default(),
            "reverse connection"
        );
        request.respond(Status::Ok).await?;
        let mut proxy = TcpProxy::with_upstream(request.io(), upstream, dest.as_str());
        if let Err(e) = proxy.proxy().await {
            debug!(dest = %dest, error = %e, "reverse proxy ended with error");
        }
        proxy.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelRouter;
    use crate::transport::PeerIdentity;
    use crate::wire::ResponseHead;
    use tokio::io::AsyncWriteExt;

    async fn gateway() -> (Gateway, Arc<ChannelRouter>) {
        let router = Arc::new(ChannelRouter::new());
        let gateway = Gateway::bind(
            Keypair::generate(),
            GatewayConfig::loopback(),
            Arc::new(TrustStore::new()),
            router.clone(),
        )
        .await
        .unwrap();
        (gateway, router)
    }

    fn request(path: &str, role: Option<Role>) -> (Request, tokio::io::DuplexStream) {
        request_with(RequestHead::new(path), role)
    }

    fn request_with(head: RequestHead, role: Option<Role>) -> (Request, tokio::io::DuplexStream) {
        let (server, client) = tokio::io::duplex(4096);
        let mut peer = PeerIdentity::anonymous("127.0.0.1:40000".parse().unwrap());
        if let Some(role) = role {
            let key = Keypair::generate();
            peer.key = Some(key.encoded_key());
            peer.address = Some(key.address());
            peer.role = role;
        }
        (Request::new(peer, head, Box::new(server)), client)
    }

    #[test]
    fn config_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen.port(), DEFAULT_TLS_PORT);
        assert_eq!(config.mux_listen.port(), DEFAULT_MUX_PORT);
        assert!(config.mtls);
        assert_eq!(config.silenced, vec!["/dns".to_string()]);
        assert_eq!(config.node_ttl, DEFAULT_NODE_TTL);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (gateway, _) = gateway().await;
        let (mut req, _client) = request("/nope", None);
        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::NotFound));
        gateway.shutdown();
    }

    #[tokio::test]
    async fn guests_cannot_open_tcp_streams() {
        let (gateway, _) = gateway().await;
        let (mut req, _client) = request("/tcp/127.0.0.1:1", None);
        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::Forbidden));

        let (mut req, _client) = request("/tcp/127.0.0.1:1", Some(Role::guest()));
        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::Forbidden));
        gateway.shutdown();
    }

    #[test]
    fn guests_cannot_subscribe_to_topics() {
        let guest = Role::guest();
        assert_eq!(
            granted_subscriptions(&guest, Subscriptions::all()),
            Subscriptions::directed()
        );
        assert_eq!(
            granted_subscriptions(&guest, Subscriptions::topology()),
            Subscriptions::directed()
        );

        let admin = Role::new("admin");
        assert_eq!(
            granted_subscriptions(&admin, Subscriptions::all()),
            Subscriptions::all()
        );
        assert_eq!(
            granted_subscriptions(&admin, Subscriptions::topology()),
            Subscriptions::topology()
        );
    }

    #[tokio::test]
    async fn unreachable_tcp_destination_is_bad_gateway() {
        let (gateway, _) = gateway().await;
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);

        let (mut req, mut client) = request(&format!("/tcp/{addr}"), Some(Role::new("admin")));
        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::BadGateway));
        let head: ResponseHead = wire::read_frame(&mut client).await.unwrap();
        assert_eq!(head.status, 502);
        gateway.shutdown();
    }

    #[tokio::test]
    async fn message_is_dispatched_with_sender() {
        let (gateway, router) = gateway().await;
        let mut inbox = router.add_connection("inbox", Subscriptions::all());

        let (mut req, mut client) = request("/dm/chat/room", Some(Role::new("admin")));
        let sender = req.peer().address.unwrap();
        client.write_all(b"hi").await.unwrap();
        client.shutdown().await.unwrap();
        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::Ok));

        let message = inbox.recv().await.unwrap();
        assert_eq!(message.to, "chat/room");
        assert_eq!(message.topic(), "chat");
        assert_eq!(message.data, b"hi");
        assert_eq!(message.from, sender.to_string());
        gateway.shutdown();
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let router = Arc::new(ChannelRouter::new());
        let config = GatewayConfig {
            max_message_size: 4,
            ..GatewayConfig::loopback()
        };
        let gateway = Gateway::bind(
            Keypair::generate(),
            config,
            Arc::new(TrustStore::new()),
            router.clone(),
        )
        .await
        .unwrap();
        let mut inbox = router.add_connection("inbox", Subscriptions::all());

        let (mut req, mut client) = request("/dm/chat", None);
        client.write_all(b"too long").await.unwrap();
        client.shutdown().await.unwrap();
        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::BadRequest));
        assert!(inbox.try_recv().is_err());
        gateway.shutdown();
    }

    #[tokio::test]
    async fn reverse_target_must_be_registered() {
        let (gateway, _) = gateway().await;
        let (mut req, _client) = request("/rf/web/80", Some(Role::new("admin")));
        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::NotFound));

        let (mut req, _client) = request("/rf/web", Some(Role::new("admin")));
        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::BadRequest));
        gateway.shutdown();
    }

    #[tokio::test]
    async fn announce_records_mux_port() {
        let (gateway, _) = gateway().await;
        let head = RequestHead::new(ANNOUNCE_PATH).with_meta(META_MUX_PORT, "6000");
        let (mut req, mut client) = request_with(head, Some(Role::new("admin")));
        let key = req.peer().key.clone().unwrap();
        let info = NodeAnnounce {
            user_agent: "edge-node".into(),
            ..Default::default()
        };
        wire::write_frame(&mut client, &info).await.unwrap();

        gateway.inner.handle(&mut req).await.unwrap();
        assert_eq!(req.responded(), Some(Status::Ok));

        let snap = gateway
            .registry()
            .snapshot(key.address().node_key())
            .await
            .unwrap();
        assert_eq!(snap.last_announce.unwrap().user_agent, "edge-node");
        assert!(snap.gateway.is_none());
        let last4 = snap.last4.unwrap();
        assert_eq!(last4.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(last4.port, 6000);
        gateway.shutdown();
    }
}
