//! TCP stream proxying and the minimal SOCKS5 (RFC 1928) subset used by the
//! gateway: no authentication, `CONNECT` only.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::MeshError;
use crate::mux::StreamProxy;
use crate::transport::AsyncIo;

/// Bound on establishing the upstream TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS_VERSION: u8 = 5;
const NO_AUTH: u8 = 0;
const NO_ACCEPTABLE_METHOD: u8 = 0xff;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

pub const REPLY_SUCCEEDED: u8 = 0;
pub const REPLY_GENERAL_FAILURE: u8 = 1;
pub const REPLY_HOST_UNREACHABLE: u8 = 4;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 7;

/// Destination requested by a SOCKS5 client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocksTarget {
    Addr(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for SocksTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksTarget::Addr(addr) => write!(f, "{addr}"),
            SocksTarget::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Server side: negotiate no-auth and read the `CONNECT` request. Unsupported
/// methods or commands are answered before returning the error.
pub async fn read_socks_request<S>(stream: &mut S) -> io::Result<SocksTarget>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(protocol_error(format!("unsupported SOCKS version {}", greeting[0])));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHOD]).await?;
        return Err(protocol_error("client offers no acceptable auth method"));
    }
    stream.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(protocol_error("bad request version"));
    }
    if header[1] != CMD_CONNECT {
        write_socks_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(protocol_error(format!("unsupported command {}", header[1])));
    }

    let target = match header[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            SocksTarget::Addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            SocksTarget::Addr(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut host = vec![0u8; len];
            stream.read_exact(&mut host).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8(host).map_err(|_| protocol_error("domain is not UTF-8"))?;
            SocksTarget::Domain(host, port)
        }
        other => {
            write_socks_reply(stream, REPLY_GENERAL_FAILURE).await?;
            return Err(protocol_error(format!("unsupported address type {other}")));
        }
    };
    trace!(target = %target, "SOCKS request");
    Ok(target)
}

/// Reply with an unspecified IPv4 bound address.
pub async fn write_socks_reply<S>(stream: &mut S, reply: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&[SOCKS_VERSION, reply, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

/// Client side: ask the proxy on `stream` to connect to `host:port`.
pub async fn socks5_connect<S>(stream: &mut S, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(&[SOCKS_VERSION, 1, NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, NO_AUTH] {
        return Err(protocol_error("proxy refused no-auth"));
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| protocol_error("host name too long"))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != REPLY_SUCCEEDED {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy reply {}", reply[1]),
        ));
    }
    let bound_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => stream.read_u8().await? as usize,
        other => return Err(protocol_error(format!("bad bound address type {other}"))),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

// ============================================================================
// TCP proxy
// ============================================================================

/// Connect to `dest_addr`, or resolve `dest_host` (`host:port`) when absent.
pub async fn connect_tcp(dest_host: &str, dest_addr: Option<SocketAddr>) -> Result<TcpStream, MeshError> {
    let connect = async {
        match dest_addr {
            Some(addr) => TcpStream::connect(addr).await,
            None => TcpStream::connect(dest_host).await,
        }
    };
    let upstream = tokio::time::timeout(DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| MeshError::dial(dest_host, "timed out"))?
        .map_err(|e| MeshError::dial(dest_host, e))?;
    let _ = upstream.set_nodelay(true);
    debug!(dest = dest_host, "upstream connected");
    Ok(upstream)
}

/// Proxies a client stream to a TCP destination.
pub struct TcpProxy<S> {
    client: S,
    upstream: Option<TcpStream>,
    dest: String,
}

impl<S: AsyncIo> TcpProxy<S> {
    pub fn new(client: S) -> Self {
        Self {
            client,
            upstream: None,
            dest: String::new(),
        }
    }

    /// Proxy over an upstream connection that is already established.
    pub fn with_upstream(client: S, upstream: TcpStream, dest: impl Into<String>) -> Self {
        Self {
            client,
            upstream: Some(upstream),
            dest: dest.into(),
        }
    }
}

#[async_trait]
impl<S: AsyncIo> StreamProxy for TcpProxy<S> {
    async fn dial(&mut self, dest_host: &str, dest_addr: Option<SocketAddr>) -> Result<(), MeshError> {
        let upstream = connect_tcp(dest_host, dest_addr).await?;
        self.dest = dest_host.to_string();
        self.upstream = Some(upstream);
        Ok(())
    }

    async fn proxy(&mut self) -> Result<(u64, u64), MeshError> {
        let upstream = self
            .upstream
            .as_mut()
            .ok_or_else(|| MeshError::dial(self.dest.clone(), "not dialed"))?;
        let (sent, received) = tokio::io::copy_bidirectional(&mut self.client, upstream).await?;
        trace!(dest = %self.dest, sent, received, "proxy finished");
        Ok((sent, received))
    }

    async fn close(&mut self) {
        if let Some(mut upstream) = self.upstream.take() {
            let _ = upstream.shutdown().await;
        }
        let _ = self.client.shutdown().await;
    }
}
