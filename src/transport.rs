//! # Authenticated Transport
//!
//! TLS over TCP with client-certificate authentication, and the request
//! dispatch boundary shared with multiplexed sessions ([`crate::mux`]).
//!
//! ## Per-connection pipeline
//!
//! ```text
//! accept -> TLS handshake -> identity extraction -> read RequestHead
//!        -> mTLS gate (403) -> handler (panic boundary) -> access log
//! ```
//!
//! Client certificates are always requested but never required by the TLS
//! layer itself. A listener started with `mtls = true` answers `403` to a peer
//! that presented none, and the handler never sees the request.
//!
//! The peer's role is looked up once, after the handshake, from the trust store
//! and travels with the request in [`PeerIdentity`].

use std::any::Any;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, trace, warn};

use crate::crypto::{self, TlsMaterial};
use crate::error::MeshError;
use crate::identity::{Address, EncodedKey};
use crate::mux::ClientDialer;
use crate::proxy;
use crate::trust::{Role, TrustStore};
use crate::wire::{self, RequestHead, ResponseHead, Status};

/// Bound on the TLS handshake of an accepted connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on reading the request head once the handshake completed.
pub const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle bound on a client exchange.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Local SOCKS5 proxy used by [`MeshClient::via_socks`] callers by default.
pub const DEFAULT_SOCKS_PROXY: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 15004);

/// Path fragments never written to the access log by default.
pub const DEFAULT_SILENCED: &[&str] = &["/dns"];

/// Bounds on reading past a rejected request head.
const REJECT_DRAIN_LIMIT: u64 = 64 * 1024;
const REJECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Identity and requests
// ============================================================================

/// Byte stream carried by a request, TLS or a QUIC stream.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// Authenticated identity of the remote end of one connection.
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    pub role: Role,
    pub san: Vec<String>,
    /// `None` when the peer presented no certificate.
    pub key: Option<EncodedKey>,
    pub address: Option<Address>,
    pub remote: SocketAddr,
    pub started: Instant,
}

impl PeerIdentity {
    pub fn anonymous(remote: SocketAddr) -> Self {
        Self {
            role: Role::guest(),
            san: Vec::new(),
            key: None,
            address: None,
            remote,
            started: Instant::now(),
        }
    }

    /// Build the identity from an already verified leaf certificate.
    pub fn from_certificate(
        der: &[u8],
        trust: &TrustStore,
        remote: SocketAddr,
    ) -> Result<Self, MeshError> {
        let cert = crypto::parse_peer_certificate(der)?;
        Ok(Self {
            role: trust.authorize(&cert.key),
            san: cert.san,
            address: Some(cert.address),
            key: Some(cert.key),
            remote,
            started: Instant::now(),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }
}

/// One inbound request: identity, head and the stream it arrived on.
pub struct Request {
    peer: PeerIdentity,
    head: RequestHead,
    io: Box<dyn AsyncIo>,
    session: Option<Arc<dyn ClientDialer>>,
    received: Instant,
    responded: Option<Status>,
    /// The handler faulted after the head was sent; the stream must not end
    /// cleanly.
    aborted: bool,
    reset: Option<Arc<AtomicBool>>,
}

impl Request {
    pub fn new(peer: PeerIdentity, head: RequestHead, io: Box<dyn AsyncIo>) -> Self {
        Self {
            peer,
            head,
            io,
            session: None,
            received: Instant::now(),
            responded: None,
            aborted: false,
            reset: None,
        }
    }

    /// Flag raised when the request is aborted, for streams that can signal
    /// a reset to the peer on drop.
    pub(crate) fn with_reset_signal(mut self, signal: Arc<AtomicBool>) -> Self {
        self.reset = Some(signal);
        self
    }

    /// Mark the request as carried by a multiplexed session.
    pub fn with_session(mut self, session: Arc<dyn ClientDialer>) -> Self {
        self.session = Some(session);
        self
    }

    /// The session this request arrived on, for opening streams back to the
    /// peer. `None` for plain TLS connections.
    pub fn session(&self) -> Option<&Arc<dyn ClientDialer>> {
        self.session.as_ref()
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn meta(&self, name: &str) -> Option<&str> {
        self.head.meta.get(name).map(String::as_str)
    }

    pub fn responded(&self) -> Option<Status> {
        self.responded
    }

    /// Send the response head. Only the first call writes.
    pub async fn respond(&mut self, status: Status) -> Result<(), MeshError> {
        if let Some(previous) = self.responded {
            return Err(MeshError::Wire(format!(
                "response already sent ({previous})"
            )));
        }
        self.responded = Some(status);
        wire::write_status(&mut self.io, status).await
    }

    /// Stream payload following the head.
    pub fn io(&mut self) -> &mut Box<dyn AsyncIo> {
        &mut self.io
    }

    /// Read the remaining payload, failing past `limit` bytes.
    pub async fn read_body(&mut self, limit: usize) -> Result<Vec<u8>, MeshError> {
        let mut body = Vec::new();
        (&mut self.io)
            .take(limit as u64 + 1)
            .read_to_end(&mut body)
            .await?;
        if body.len() > limit {
            return Err(MeshError::Wire(format!("body exceeds {limit} bytes")));
        }
        Ok(body)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("peer", &self.peer)
            .field("head", &self.head)
            .field("responded", &self.responded)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: &mut Request) -> anyhow::Result<()>;
}

// ============================================================================
// Recovery boundary
// ============================================================================

fn describe_panic(payload: &(dyn Any + Send)) -> (&'static str, String) {
    if let Some(s) = payload.downcast_ref::<&str>() {
        ("string", (*s).to_string())
    } else if let Some(s) = payload.downcast_ref::<String>() {
        ("string", s.clone())
    } else if let Some(e) = payload.downcast_ref::<MeshError>() {
        ("error", e.to_string())
    } else if let Some(e) = payload.downcast_ref::<anyhow::Error>() {
        ("error", format!("{e:#}"))
    } else {
        ("unknown", "unknown panic payload".to_string())
    }
}

/// Run the handler, containing panics and errors to this request.
///
/// A fault answers `500` unless the handler already responded, in which case
/// the request is marked aborted. Either way it is returned as
/// [`MeshError::HandlerFault`]. A handler that succeeds without responding
/// gets `200`.
pub(crate) async fn dispatch(handler: &dyn Handler, request: &mut Request) -> Result<(), MeshError> {
    let outcome = AssertUnwindSafe(handler.handle(request)).catch_unwind().await;

    let fault = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(("error", format!("{e:#}"))),
        Err(payload) => Some(describe_panic(payload.as_ref())),
    };

    match fault {
        None => {
            if request.responded.is_none() {
                request.respond(Status::Ok).await?;
            }
            Ok(())
        }
        Some((kind, reason)) => {
            warn!(
                path = %request.path(),
                remote = %request.peer.remote,
                kind,
                reason = %reason,
                "handler fault"
            );
            if request.responded.is_none() {
                let _ = request.respond(Status::InternalError).await;
            } else {
                request.aborted = true;
            }
            Err(MeshError::HandlerFault(reason))
        }
    }
}

// ============================================================================
// Access log
// ============================================================================

/// Collapse per-destination paths so log lines group by route.
pub fn trace_path(path: &str) -> &str {
    if path.starts_with("/tcp/") {
        "/tcp"
    } else if path.starts_with("/dm/") {
        "/dm"
    } else {
        path
    }
}

#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub access_log: bool,
    /// Requests whose path contains any of these are not logged.
    pub silenced: Vec<String>,
    pub handshake_timeout: Duration,
    pub head_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            access_log: false,
            silenced: DEFAULT_SILENCED.iter().map(|s| s.to_string()).collect(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            head_timeout: HEAD_READ_TIMEOUT,
        }
    }
}

impl TransportOptions {
    fn log_access(&self, request: &Request) {
        if !self.access_log {
            return;
        }
        let path = request.path();
        if self.silenced.iter().any(|fragment| path.contains(fragment.as_str())) {
            return;
        }
        let peer = request.peer();
        info!(
            target: "meshgate::access",
            path = trace_path(path),
            san = ?peer.san,
            address = ?peer.address,
            role = %peer.role,
            remote = %peer.remote,
            status = request.responded.map(Status::code).unwrap_or_default(),
            latency_ms = request.received.elapsed().as_millis() as u64,
            "request"
        );
    }
}

/// Dispatch, log, then close the stream.
///
/// An aborted request is dropped without a graceful close: TLS peers see the
/// connection end without `close_notify`, QUIC peers see a stream reset.
pub(crate) async fn serve_request(
    handler: &dyn Handler,
    options: &TransportOptions,
    mut request: Request,
) -> Result<(), MeshError> {
    let result = dispatch(handler, &mut request).await;
    options.log_access(&request);
    if request.aborted {
        if let Some(reset) = &request.reset {
            reset.store(true, Ordering::Release);
        }
        debug!(path = %trace_path(request.path()), "aborting stream after handler fault");
    } else {
        let _ = request.io.shutdown().await;
    }
    result
}

pub(crate) fn timed_out(what: &str) -> MeshError {
    MeshError::Io(io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out")))
}

// ============================================================================
// Server
// ============================================================================

/// Builds listeners and clients from one local identity.
pub struct Transport {
    material: Arc<TlsMaterial>,
    acceptor: TlsAcceptor,
    trust: Arc<TrustStore>,
    options: TransportOptions,
}

impl Transport {
    pub fn new(
        material: Arc<TlsMaterial>,
        trust: Arc<TrustStore>,
        options: TransportOptions,
    ) -> anyhow::Result<Self> {
        let server_config = crypto::create_server_config(&material, false)
            .context("failed to build TLS server config")?;
        Ok(Self {
            material,
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            trust,
            options,
        })
    }

    pub fn material(&self) -> &Arc<TlsMaterial> {
        &self.material
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Client presenting the local certificate.
    pub fn client(&self) -> anyhow::Result<MeshClient> {
        MeshClient::new(Some(&self.material))
    }

    /// Listen on all interfaces, IPv6 first with an IPv4 fallback.
    pub async fn listen(
        &self,
        port: u16,
        handler: Arc<dyn Handler>,
        mtls: bool,
    ) -> Result<Listener, MeshError> {
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
        match self.listen_on(v6, handler.clone(), mtls).await {
            Ok(listener) => Ok(listener),
            Err(e) => {
                debug!(error = %e, "IPv6 bind failed, falling back to IPv4");
                let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                self.listen_on(v4, handler, mtls).await
            }
        }
    }

    pub async fn listen_on(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        mtls: bool,
    ) -> Result<Listener, MeshError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MeshError::ListenerBindFailed { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| MeshError::ListenerBindFailed { addr, source })?;

        let ctx = Arc::new(ConnectionContext {
            acceptor: self.acceptor.clone(),
            trust: self.trust.clone(),
            options: self.options.clone(),
            handler,
            mtls,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        info!(addr = %local_addr, mtls, "listening");
        Ok(Listener {
            local_addr,
            shutdown: Some(shutdown_tx),
        })
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Handle to a running listener. Dropping it stops the accept loop.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already accepted run to completion.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

struct ConnectionContext {
    acceptor: TlsAcceptor,
    trust: Arc<TrustStore>,
    options: TransportOptions,
    handler: Arc<dyn Handler>,
    mtls: bool,
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((tcp, remote)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(ctx, tcp, remote).await {
                            debug!(remote = %remote, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Discard what the peer still sends on a rejected connection, so closing it
/// does not reset the response away.
async fn drain(io: &mut Box<dyn AsyncIo>) {
    let mut rest = io.take(REJECT_DRAIN_LIMIT);
    let mut sink = tokio::io::sink();
    let discard = tokio::io::copy(&mut rest, &mut sink);
    let _ = tokio::time::timeout(REJECT_DRAIN_TIMEOUT, discard).await;
}

async fn handle_connection(
    ctx: Arc<ConnectionContext>,
    tcp: TcpStream,
    remote: SocketAddr,
) -> Result<(), MeshError> {
    let _ = tcp.set_nodelay(true);
    let tls = tokio::time::timeout(ctx.options.handshake_timeout, ctx.acceptor.accept(tcp))
        .await
        .map_err(|_| timed_out("TLS handshake"))??;

    let leaf = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec());
    let peer = match leaf {
        Some(der) => PeerIdentity::from_certificate(&der, &ctx.trust, remote)?,
        None => PeerIdentity::anonymous(remote),
    };

    let mut io: Box<dyn AsyncIo> = Box::new(tls);
    let head: RequestHead = tokio::time::timeout(ctx.options.head_timeout, wire::read_frame(&mut io))
        .await
        .map_err(|_| timed_out("request head read"))??;

    if ctx.mtls && !peer.is_authenticated() {
        warn!(remote = %remote, path = %trace_path(&head.path), "rejecting request without client certificate");
        let _ = wire::write_status(&mut io, Status::Forbidden).await;
        let _ = io.shutdown().await;
        drain(&mut io).await;
        return Err(MeshError::Unauthenticated);
    }

    trace!(remote = %remote, path = %head.path, role = %peer.role, "request");
    serve_request(ctx.handler.as_ref(), &ctx.options, Request::new(peer, head, io)).await
}

// ============================================================================
// Client
// ============================================================================

/// An exchange after the response head was received. `io` carries the rest of
/// the stream in both directions.
pub struct Exchange {
    pub response: ResponseHead,
    pub io: Box<dyn AsyncIo>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

/// Outbound TLS client, built once and reused across destinations.
#[derive(Clone)]
pub struct MeshClient {
    connector: TlsConnector,
    socks: Option<SocketAddr>,
    timeout: Duration,
}

impl MeshClient {
    /// `None` builds a client that presents no certificate.
    pub fn new(material: Option<&TlsMaterial>) -> anyhow::Result<Self> {
        let config = crypto::create_client_config(material)
            .context("failed to build TLS client config")?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            socks: None,
            timeout: CLIENT_TIMEOUT,
        })
    }

    /// Tunnel the TCP leg through a SOCKS5 proxy.
    pub fn via_socks(mut self, proxy: SocketAddr) -> Self {
        self.socks = Some(proxy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open a stream to `dest`, send `head` and wait for the response head.
    /// With `expected`, the server must hold the key behind that address.
    pub async fn connect(
        &self,
        dest: SocketAddr,
        expected: Option<Address>,
        head: &RequestHead,
    ) -> Result<Exchange, MeshError> {
        tokio::time::timeout(self.timeout, self.connect_inner(dest, expected, head))
            .await
            .map_err(|_| MeshError::dial(dest.to_string(), "timed out"))?
    }

    /// TCP (direct or through SOCKS), TLS handshake, then the request head.
    async fn open(
        &self,
        dest: SocketAddr,
        expected: Option<Address>,
        head: &RequestHead,
    ) -> Result<Box<dyn AsyncIo>, MeshError> {
        let tcp = match self.socks {
            Some(proxy) => {
                let mut tcp = TcpStream::connect(proxy)
                    .await
                    .map_err(|e| MeshError::dial(proxy.to_string(), e))?;
                proxy::socks5_connect(&mut tcp, &dest.ip().to_string(), dest.port())
                    .await
                    .map_err(|e| MeshError::dial(dest.to_string(), e))?;
                tcp
            }
            None => TcpStream::connect(dest)
                .await
                .map_err(|e| MeshError::dial(dest.to_string(), e))?,
        };
        let _ = tcp.set_nodelay(true);

        let server_name = match expected {
            Some(address) => ServerName::try_from(address.to_sni())
                .map_err(|e| MeshError::dial(dest.to_string(), e))?,
            None => ServerName::IpAddress(dest.ip().into()),
        };
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| MeshError::dial(dest.to_string(), e))?;

        let mut io: Box<dyn AsyncIo> = Box::new(tls);
        wire::write_frame(&mut io, head).await?;
        Ok(io)
    }

    async fn connect_inner(
        &self,
        dest: SocketAddr,
        expected: Option<Address>,
        head: &RequestHead,
    ) -> Result<Exchange, MeshError> {
        let mut io = self.open(dest, expected, head).await?;
        let response: ResponseHead = wire::read_frame(&mut io).await?;
        Ok(Exchange { response, io })
    }

    /// One request with a complete body; returns the response head and the
    /// payload read to end of stream.
    ///
    /// The body is sent and the write half closed before the response head is
    /// read. A server that rejects the request without reading the body may
    /// break the write; its response head is still returned when it arrived.
    pub async fn request(
        &self,
        dest: SocketAddr,
        expected: Option<Address>,
        head: &RequestHead,
        body: &[u8],
    ) -> Result<(ResponseHead, Vec<u8>), MeshError> {
        let exchange = async {
            let mut io = self.open(dest, expected, head).await?;
            let sent = match io.write_all(body).await {
                Ok(()) => io.shutdown().await,
                Err(e) => Err(e),
            };
            let response: ResponseHead = match wire::read_frame(&mut io).await {
                Ok(response) => response,
                Err(e) => return Err(sent.err().map(MeshError::from).unwrap_or(e)),
            };
            if let Err(e) = &sent {
                trace!(dest = %dest, error = %e, status = response.status, "request body not fully sent");
            }

            let mut payload = Vec::new();
            if let Err(e) = io.read_to_end(&mut payload).await
                && response.is_ok()
            {
                return Err(e.into());
            }
            Ok::<_, MeshError>((response, payload))
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| MeshError::dial(dest.to_string(), "timed out"))?
    }
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("socks", &self.socks)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
