//! # Multiplexed Sessions
//!
//! Capability traits for reusing one authenticated connection to open many
//! logical streams, and the QUIC-backed session implementing them.
//!
//! | Trait | Role |
//! |-------|------|
//! | [`TunDialer`] | open a stream through the session to a destination |
//! | [`ClientDialer`] | plus local SOCKS and TCP port forwarding |
//! | [`MuxDialer`] | establish (or reuse) a session to a node |
//! | [`ReverseForwarder`] | carry an accepted connection back over a session |
//! | [`StreamProxy`] | connect a stream to a TCP destination |
//!
//! One QUIC connection is one session; each bidirectional QUIC stream is one
//! logical stream carrying a [`RequestHead`] like a TLS connection does, so
//! streams are dispatched to the same [`Handler`] as the TLS listener.
//!
//! Both ends of a session accept streams: the dialing side serves requests the
//! acceptor opens back towards it (inbound tunnels, reverse forwarding).

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use lru::LruCache;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bus::{Message, Subscriptions};
use crate::crypto::{self, TlsMaterial};
use crate::error::MeshError;
use crate::identity::{Address, EncodedKey};
use crate::proxy;
use crate::registry::NodeAnnounce;
use crate::transport::{
    AsyncIo, Handler, PeerIdentity, Request, TransportOptions, serve_request, timed_out,
};
use crate::trust::TrustStore;
use crate::wire::{self, Hello, RequestHead, ResponseHead};

/// Session setup exchange.
pub const HELLO_PATH: &str = "/hello";

/// Prefix of proxied TCP streams: `/tcp/<host:port>`.
pub const TCP_PREFIX: &str = "/tcp/";

/// Prefix of bus messages: `/dm/<to...>`.
pub const MESSAGE_PREFIX: &str = "/dm/";

/// Prefix of reverse-forwarded streams: `/rf/<host-key>/<port-key>`.
pub const REVERSE_PREFIX: &str = "/rf/";

/// Bound on QUIC connection establishment.
pub const MUX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sessions kept in the dial cache.
const MAX_CACHED_SESSIONS: usize = 256;

// ============================================================================
// Contracts
// ============================================================================

pub type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Logical stream descriptor. `dial_proxy` attaches the session-side halves.
pub struct Stream {
    pub dest: String,
    pub meta: BTreeMap<String, String>,
    /// Bytes from the destination.
    pub server_in: Option<ReadHalf>,
    /// Bytes to the destination.
    pub server_out: Option<WriteHalf>,
}

impl Stream {
    pub fn new(dest: impl Into<String>) -> Self {
        Self {
            dest: dest.into(),
            meta: BTreeMap::new(),
            server_in: None,
            server_out: None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.server_in.is_some() && self.server_out.is_some()
    }

    pub fn take_halves(&mut self) -> Option<(ReadHalf, WriteHalf)> {
        match (self.server_in.take(), self.server_out.take()) {
            (Some(read), Some(write)) => Some((read, write)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("dest", &self.dest)
            .field("meta", &self.meta)
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub forwarding: bool,
    pub reverse_forward: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Quic,
}

#[async_trait]
pub trait TunDialer: Send + Sync {
    async fn dial_proxy(&self, stream: &mut Stream) -> Result<(), MeshError>;
}

#[async_trait]
pub trait ClientDialer: TunDialer {
    /// Local SOCKS5 listener whose CONNECTs are dialed through the session.
    async fn forward_socks(&self, local: SocketAddr) -> Result<ForwardHandle, MeshError>;

    /// Local listener forwarding every connection to `remote` through the
    /// session.
    async fn forward_tcp(&self, local: SocketAddr, remote: &str) -> Result<ForwardHandle, MeshError>;

    /// Push a bus message to the peer.
    async fn deliver(&self, message: &Message) -> Result<(), MeshError>;

    fn kind(&self) -> SessionKind;

    fn capabilities(&self) -> Capabilities;

    fn peer(&self) -> &PeerIdentity;

    fn is_closed(&self) -> bool;

    /// Resolves once the session has closed, for any reason.
    async fn closed(&self);

    fn reverse_forwarder(&self) -> Option<Arc<dyn ReverseForwarder>>;
}

#[async_trait]
pub trait MuxDialer: Send + Sync {
    /// One session to the node at `addr` holding `expected_key`, announced with
    /// `subscriptions`. Reuses a live cached session.
    async fn dial_mux(
        &self,
        addr: SocketAddr,
        expected_key: &EncodedKey,
        subscriptions: Subscriptions,
    ) -> Result<Arc<dyn ClientDialer>, MeshError>;
}

#[async_trait]
pub trait ReverseForwarder: Send + Sync {
    /// Carry a connection accepted on `ip:port` back over the session to the
    /// target registered as `host_key`/`port_key` on the other end.
    async fn reverse_forward(
        &self,
        input: ReadHalf,
        output: WriteHalf,
        ip: IpAddr,
        port: u16,
        host_key: &str,
        port_key: u16,
    ) -> Result<(), MeshError>;
}

#[async_trait]
pub trait StreamProxy: Send {
    async fn dial(&mut self, dest_host: &str, dest_addr: Option<SocketAddr>) -> Result<(), MeshError>;

    /// Copy in both directions until either side closes. Returns bytes sent
    /// and received.
    async fn proxy(&mut self) -> Result<(u64, u64), MeshError>;

    async fn close(&mut self);
}

/// A running local listener. Dropping it stops accepting.
#[derive(Debug)]
pub struct ForwardHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ForwardHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for ForwardHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// QUIC streams
// ============================================================================

/// One bidirectional QUIC stream as a single byte stream.
pub struct BiStream {
    send: SendStream,
    recv: RecvStream,
}

impl BiStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub fn into_parts(self) -> (SendStream, RecvStream) {
        (self.send, self.recv)
    }
}

impl AsyncRead for BiStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for BiStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Accepted stream handed to the handler. Once `reset` is raised the send half
/// is reset on drop instead of finished, so the peer never mistakes a faulted
/// response for a complete one.
struct ServedStream {
    stream: BiStream,
    reset: Arc<AtomicBool>,
}

impl Drop for ServedStream {
    fn drop(&mut self) {
        if self.reset.load(Ordering::Acquire) {
            let _ = self.stream.send.reset(0u32.into());
        }
    }
}

impl AsyncRead for ServedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.stream), cx, buf)
    }
}

impl AsyncWrite for ServedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.stream), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.stream), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.stream), cx)
    }
}

fn connection_error(remote: SocketAddr, err: impl ToString) -> MeshError {
    MeshError::dial(remote.to_string(), err)
}

/// Identity of the remote end of an established QUIC connection.
pub(crate) fn peer_from_connection(
    connection: &Connection,
    trust: &TrustStore,
) -> Result<PeerIdentity, MeshError> {
    let certs = connection
        .peer_identity()
        .and_then(|identity| {
            identity
                .downcast::<Vec<rustls::pki_types::CertificateDer<'static>>>()
                .ok()
        })
        .ok_or(MeshError::Unauthenticated)?;
    let leaf = certs.first().ok_or(MeshError::Unauthenticated)?;
    PeerIdentity::from_certificate(leaf.as_ref(), trust, connection.remote_address())
}

// ============================================================================
// Session
// ============================================================================

/// An authenticated QUIC connection. Cheap to clone.
#[derive(Clone)]
pub struct QuicSession {
    connection: Connection,
    peer: PeerIdentity,
}

impl QuicSession {
    pub fn new(connection: Connection, peer: PeerIdentity) -> Self {
        Self { connection, peer }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn close(&self) {
        self.connection.close(0u32.into(), b"closed");
    }

    /// Open a stream and send `head`. The response head is read by the caller.
    async fn open_stream(&self, head: &RequestHead) -> Result<BiStream, MeshError> {
        let remote = self.remote_address();
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| connection_error(remote, e))?;
        let mut stream = BiStream::new(send, recv);
        wire::write_frame(&mut stream, head).await?;
        Ok(stream)
    }

    /// Open a stream, send `head` and wait for the response head.
    pub async fn request(&self, head: &RequestHead) -> Result<(ResponseHead, BiStream), MeshError> {
        let mut stream = self.open_stream(head).await?;
        let response: ResponseHead = wire::read_frame(&mut stream).await?;
        Ok((response, stream))
    }

    /// Announce the local node and its subscriptions on a fresh session.
    pub async fn hello(&self, hello: &Hello) -> Result<(), MeshError> {
        let remote = self.remote_address();
        let mut stream = self.open_stream(&RequestHead::new(HELLO_PATH)).await?;
        wire::write_frame(&mut stream, hello).await?;
        stream.shutdown().await?;
        let response: ResponseHead = wire::read_frame(&mut stream).await?;
        if !response.is_ok() {
            return Err(connection_error(
                remote,
                format!("hello rejected with status {}", response.status),
            ));
        }
        Ok(())
    }

    fn forward(
        &self,
        listener: TcpListener,
        local_addr: SocketAddr,
        socks: bool,
        remote: Option<String>,
    ) -> ForwardHandle {
        let session = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let (tcp, client) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(local = %local_addr, error = %e, "forward accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let session = session.clone();
                let remote = remote.clone();
                tokio::spawn(async move {
                    let result = if socks {
                        session.forward_socks_connection(tcp).await
                    } else {
                        session
                            .forward_connection(tcp, remote.unwrap_or_default())
                            .await
                    };
                    if let Err(e) = result {
                        debug!(client = %client, error = %e, "forwarded connection failed");
                    }
                });
            }
        });
        ForwardHandle { local_addr, task }
    }

    async fn forward_connection(&self, tcp: TcpStream, dest: String) -> Result<(), MeshError> {
        let mut stream = Stream::new(dest);
        self.dial_proxy(&mut stream).await?;
        splice(tcp, stream).await
    }

    async fn forward_socks_connection(&self, mut tcp: TcpStream) -> Result<(), MeshError> {
        let target = proxy::read_socks_request(&mut tcp).await?;
        let mut stream = Stream::new(target.to_string());
        if let Err(e) = self.dial_proxy(&mut stream).await {
            let _ = proxy::write_socks_reply(&mut tcp, proxy::REPLY_HOST_UNREACHABLE).await;
            return Err(e);
        }
        proxy::write_socks_reply(&mut tcp, proxy::REPLY_SUCCEEDED).await?;
        splice(tcp, stream).await
    }
}

impl std::fmt::Debug for QuicSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicSession")
            .field("remote", &self.connection.remote_address())
            .field("peer", &self.peer.address)
            .finish()
    }
}

async fn bind_local(local: SocketAddr) -> Result<(TcpListener, SocketAddr), MeshError> {
    let listener = TcpListener::bind(local)
        .await
        .map_err(|source| MeshError::ListenerBindFailed { addr: local, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| MeshError::ListenerBindFailed { addr: local, source })?;
    Ok((listener, local_addr))
}

/// Copy a local TCP connection to and from an attached stream.
async fn splice(tcp: TcpStream, mut stream: Stream) -> Result<(), MeshError> {
    let (mut server_in, mut server_out) = stream
        .take_halves()
        .ok_or_else(|| MeshError::dial(stream.dest.clone(), "stream not attached"))?;
    let (mut read, mut write) = tcp.into_split();
    let upload = async {
        let n = tokio::io::copy(&mut read, &mut server_out).await?;
        server_out.shutdown().await?;
        Ok::<_, io::Error>(n)
    };
    let download = async {
        let n = tokio::io::copy(&mut server_in, &mut write).await?;
        write.shutdown().await?;
        Ok::<_, io::Error>(n)
    };
    let (sent, received) = tokio::try_join!(upload, download)?;
    trace!(dest = %stream.dest, sent, received, "stream finished");
    Ok(())
}

#[async_trait]
impl TunDialer for QuicSession {
    async fn dial_proxy(&self, stream: &mut Stream) -> Result<(), MeshError> {
        let mut head = RequestHead::new(format!("{TCP_PREFIX}{}", stream.dest));
        head.meta = stream.meta.clone();
        let (response, bi) = self
            .request(&head)
            .await
            .map_err(|e| MeshError::dial(stream.dest.clone(), e))?;
        if !response.is_ok() {
            return Err(MeshError::dial(
                stream.dest.clone(),
                format!("refused with status {}", response.status),
            ));
        }
        let (send, recv) = bi.into_parts();
        stream.server_in = Some(Box::new(recv));
        stream.server_out = Some(Box::new(send));
        Ok(())
    }
}

#[async_trait]
impl ClientDialer for QuicSession {
    async fn forward_socks(&self, local: SocketAddr) -> Result<ForwardHandle, MeshError> {
        let (listener, local_addr) = bind_local(local).await?;
        info!(local = %local_addr, via = %self.remote_address(), "SOCKS forwarding");
        Ok(self.forward(listener, local_addr, true, None))
    }

    async fn forward_tcp(&self, local: SocketAddr, remote: &str) -> Result<ForwardHandle, MeshError> {
        let (listener, local_addr) = bind_local(local).await?;
        info!(local = %local_addr, remote, via = %self.remote_address(), "TCP forwarding");
        Ok(self.forward(listener, local_addr, false, Some(remote.to_string())))
    }

    async fn deliver(&self, message: &Message) -> Result<(), MeshError> {
        let mut head = RequestHead::new(format!("{MESSAGE_PREFIX}{}", message.to));
        head.meta = message.meta.clone();
        head.meta.insert("id".to_string(), message.id.clone());
        let mut stream = self.open_stream(&head).await?;
        stream.write_all(&message.data).await?;
        stream.shutdown().await?;
        let response: ResponseHead = wire::read_frame(&mut stream).await?;
        if !response.is_ok() {
            return Err(MeshError::dial(
                message.to.clone(),
                format!("message refused with status {}", response.status),
            ));
        }
        Ok(())
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Quic
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            forwarding: true,
            reverse_forward: true,
        }
    }

    fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    async fn closed(&self) {
        let reason = self.connection.closed().await;
        trace!(remote = %self.remote_address(), reason = %reason, "session closed");
    }

    fn reverse_forwarder(&self) -> Option<Arc<dyn ReverseForwarder>> {
        Some(Arc::new(self.clone()))
    }
}

#[async_trait]
impl ReverseForwarder for QuicSession {
    async fn reverse_forward(
        &self,
        mut input: ReadHalf,
        mut output: WriteHalf,
        ip: IpAddr,
        port: u16,
        host_key: &str,
        port_key: u16,
    ) -> Result<(), MeshError> {
        let dest = format!("{host_key}/{port_key}");
        let head = RequestHead::new(format!("{REVERSE_PREFIX}{dest}"))
            .with_meta("ip", ip.to_string())
            .with_meta("port", port.to_string());
        let (response, bi) = self
            .request(&head)
            .await
            .map_err(|e| MeshError::dial(dest.clone(), e))?;
        if !response.is_ok() {
            return Err(MeshError::dial(
                dest,
                format!("refused with status {}", response.status),
            ));
        }

        let (mut send, mut recv) = bi.into_parts();
        let upload = async {
            let n = tokio::io::copy(&mut input, &mut send).await?;
            AsyncWriteExt::shutdown(&mut send).await?;
            Ok::<_, io::Error>(n)
        };
        let download = async {
            let n = tokio::io::copy(&mut recv, &mut output).await?;
            output.shutdown().await?;
            Ok::<_, io::Error>(n)
        };
        tokio::try_join!(upload, download)?;
        Ok(())
    }
}

/// Accept TCP on `bind` and carry each connection back over `forwarder`.
pub async fn reverse_listen(
    bind: SocketAddr,
    forwarder: Arc<dyn ReverseForwarder>,
    host_key: String,
    port_key: u16,
) -> Result<ForwardHandle, MeshError> {
    let (listener, local_addr) = bind_local(bind).await?;
    info!(local = %local_addr, host_key = %host_key, port_key, "reverse forwarding");
    let task = tokio::spawn(async move {
        loop {
            let (tcp, client) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(local = %local_addr, error = %e, "reverse accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let forwarder = forwarder.clone();
            let host_key = host_key.clone();
            tokio::spawn(async move {
                let (read, write) = tcp.into_split();
                if let Err(e) = forwarder
                    .reverse_forward(
                        Box::new(read),
                        Box::new(write),
                        client.ip(),
                        client.port(),
                        &host_key,
                        port_key,
                    )
                    .await
                {
                    debug!(client = %client, error = %e, "reverse forward failed");
                }
            });
        }
    });
    Ok(ForwardHandle { local_addr, task })
}

// ============================================================================
// Endpoint
// ============================================================================

struct SessionContext {
    trust: Arc<TrustStore>,
    options: TransportOptions,
    handler: OnceLock<Weak<dyn Handler>>,
}

/// QUIC endpoint accepting sessions and dialing them, with a bounded cache of
/// outbound sessions keyed by address and pinned peer.
pub struct QuicMux {
    endpoint: Endpoint,
    client_config: quinn::ClientConfig,
    ctx: Arc<SessionContext>,
    local: RwLock<NodeAnnounce>,
    sessions: Mutex<LruCache<(SocketAddr, Address), CachedSession>>,
}

/// A dialed session and the subscriptions last announced on it.
#[derive(Clone)]
struct CachedSession {
    session: QuicSession,
    subscriptions: Subscriptions,
}

impl QuicMux {
    pub fn bind(
        addr: SocketAddr,
        material: &TlsMaterial,
        trust: Arc<TrustStore>,
        options: TransportOptions,
    ) -> anyhow::Result<Self> {
        let server_config = crypto::create_quic_server_config(material)?;
        let client_config = crypto::create_quic_client_config(material)?;
        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {addr}"))?;
        let capacity = NonZeroUsize::new(MAX_CACHED_SESSIONS).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            endpoint,
            client_config,
            ctx: Arc::new(SessionContext {
                trust,
                options,
                handler: OnceLock::new(),
            }),
            local: RwLock::new(NodeAnnounce::default()),
            sessions: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Start accepting sessions; streams on every session (accepted or dialed)
    /// go to `handler`. Later calls are ignored.
    pub fn serve(&self, handler: Weak<dyn Handler>) {
        if self.ctx.handler.set(handler).is_err() {
            return;
        }
        let endpoint = self.endpoint.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_session(ctx, incoming).await {
                        debug!(error = %e, "session ended with error");
                    }
                });
            }
            debug!("QUIC endpoint closed");
        });
    }

    /// Node information sent in the hello of every new outbound session.
    pub fn set_local_announce(&self, announce: NodeAnnounce) {
        *self.local.write().unwrap_or_else(|e| e.into_inner()) = announce;
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }

    fn cached(&self, key: &(SocketAddr, Address)) -> Option<CachedSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let cached = sessions.get(key).cloned()?;
        if cached.session.is_closed() {
            sessions.pop(key);
            return None;
        }
        Some(cached)
    }

    fn remember(&self, key: (SocketAddr, Address), session: QuicSession, subscriptions: Subscriptions) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key, CachedSession { session, subscriptions });
    }

    fn hello(&self, subscriptions: Subscriptions) -> Hello {
        Hello {
            node: self.local.read().unwrap_or_else(|e| e.into_inner()).clone(),
            subscriptions,
        }
    }

    async fn connect(&self, addr: SocketAddr, expected: Address) -> Result<QuicSession, MeshError> {
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &expected.to_sni())
            .map_err(|e| connection_error(addr, e))?;
        let connection = tokio::time::timeout(MUX_CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| connection_error(addr, "connect timed out"))?
            .map_err(|e| connection_error(addr, e))?;
        let peer = peer_from_connection(&connection, &self.ctx.trust)?;
        Ok(QuicSession::new(connection, peer))
    }
}

impl std::fmt::Debug for QuicMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicMux")
            .field("local_addr", &self.endpoint.local_addr().ok())
            .field("cached_sessions", &self.cached_sessions())
            .finish()
    }
}

#[async_trait]
impl MuxDialer for QuicMux {
    async fn dial_mux(
        &self,
        addr: SocketAddr,
        expected_key: &EncodedKey,
        subscriptions: Subscriptions,
    ) -> Result<Arc<dyn ClientDialer>, MeshError> {
        let expected = expected_key.address();
        let cache_key = (addr, expected);
        if let Some(cached) = self.cached(&cache_key) {
            if cached.subscriptions == subscriptions {
                trace!(addr = %addr, "reusing cached session");
                return Ok(Arc::new(cached.session));
            }
            // The peer replaces its bus connection for us on every hello.
            match cached.session.hello(&self.hello(subscriptions.clone())).await {
                Ok(()) => {
                    debug!(addr = %addr, topics = ?subscriptions.topics(), "session resubscribed");
                    self.remember(cache_key, cached.session.clone(), subscriptions);
                    return Ok(Arc::new(cached.session));
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "resubscribe failed, redialing");
                    cached.session.close();
                    self.sessions
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .pop(&cache_key);
                }
            }
        }

        let session = self.connect(addr, expected).await?;
        if let Some(handler) = self.ctx.handler.get() {
            tokio::spawn(serve_session(
                session.clone(),
                handler.clone(),
                self.ctx.options.clone(),
            ));
        }

        if let Err(e) = session.hello(&self.hello(subscriptions.clone())).await {
            session.close();
            return Err(e);
        }

        debug!(addr = %addr, peer = %expected, "session established");
        self.remember(cache_key, session.clone(), subscriptions);
        Ok(Arc::new(session))
    }
}

async fn accept_session(ctx: Arc<SessionContext>, incoming: quinn::Incoming) -> Result<(), MeshError> {
    let remote = incoming.remote_address();
    let connecting = incoming.accept().map_err(|e| connection_error(remote, e))?;
    let connection = tokio::time::timeout(ctx.options.handshake_timeout, connecting)
        .await
        .map_err(|_| timed_out("QUIC handshake"))?
        .map_err(|e| connection_error(remote, e))?;

    let peer = match peer_from_connection(&connection, &ctx.trust) {
        Ok(peer) => peer,
        Err(e) => {
            warn!(remote = %remote, error = %e, "rejecting session: could not verify peer identity");
            connection.close(1u32.into(), b"unauthenticated");
            return Err(e);
        }
    };
    debug!(remote = %remote, peer = ?peer.address, role = %peer.role, "session accepted");

    let Some(handler) = ctx.handler.get() else {
        return Ok(());
    };
    serve_session(
        QuicSession::new(connection, peer),
        handler.clone(),
        ctx.options.clone(),
    )
    .await
}

/// Dispatch every stream the peer opens on `session` until it closes.
async fn serve_session(
    session: QuicSession,
    handler: Weak<dyn Handler>,
    options: TransportOptions,
) -> Result<(), MeshError> {
    let remote = session.remote_address();
    loop {
        let (send, recv) = match session.connection.accept_bi().await {
            Ok(streams) => streams,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(remote = %remote, "session closed");
                return Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "session idle timeout");
                return Ok(());
            }
            Err(e) => return Err(connection_error(remote, e)),
        };

        let Some(handler) = handler.upgrade() else {
            session.close();
            return Ok(());
        };
        let session = session.clone();
        let options = options.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_stream(handler, options, session, send, recv).await {
                debug!(remote = %remote, error = %e, "stream error");
            }
        });
    }
}

async fn serve_stream(
    handler: Arc<dyn Handler>,
    options: TransportOptions,
    session: QuicSession,
    send: SendStream,
    recv: RecvStream,
) -> Result<(), MeshError> {
    let reset = Arc::new(AtomicBool::new(false));
    let mut io: Box<dyn AsyncIo> = Box::new(ServedStream {
        stream: BiStream::new(send, recv),
        reset: reset.clone(),
    });
    let head: RequestHead = tokio::time::timeout(options.head_timeout, wire::read_frame(&mut io))
        .await
        .map_err(|_| timed_out("stream head read"))??;
    let peer = session.peer.clone();
    let request = Request::new(peer, head, io)
        .with_session(Arc::new(session))
        .with_reset_signal(reset);
    serve_request(handler.as_ref(), &options, request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_attachment() {
        let mut stream = Stream::new("10.0.0.1:80");
        assert!(!stream.is_attached());
        assert!(stream.take_halves().is_none());

        let (a, _b) = tokio::io::duplex(8);
        let (read, write) = tokio::io::split(a);
        stream.server_in = Some(Box::new(read));
        stream.server_out = Some(Box::new(write));
        assert!(stream.is_attached());
        assert!(stream.take_halves().is_some());
        assert!(!stream.is_attached());
    }

    #[tokio::test]
    async fn forward_handle_stops_on_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let handle = ForwardHandle { local_addr, task };
        assert_eq!(handle.local_addr(), local_addr);
        handle.close();
        drop(handle);
    }
}
