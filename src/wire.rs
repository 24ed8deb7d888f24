//! # Stream Heads
//!
//! Every authenticated stream, TLS over TCP or a QUIC bidirectional stream,
//! starts with a length-prefixed request head from the dialer and a
//! length-prefixed response head from the acceptor. Whatever follows is the
//! raw stream payload (proxied bytes, a message body, ...).
//!
//! ```text
//! dialer   -> [u32 BE len][bincode RequestHead]  [payload ...]
//! acceptor <- [u32 BE len][bincode ResponseHead] [payload ...]
//! ```
//!
//! Heads are bounded by [`MAX_HEAD_SIZE`]; larger length prefixes are rejected
//! before any allocation.

use std::collections::BTreeMap;
use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bus::Subscriptions;
use crate::error::MeshError;
use crate::registry::NodeAnnounce;

/// Maximum encoded size of any head (64 KiB).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_HEAD_SIZE as u64)
        .with_fixint_encoding()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub path: String,
    pub meta: BTreeMap<String, String>,
}

impl RequestHead {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(name.into(), value.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
}

impl ResponseHead {
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok.code()
    }
}

impl From<Status> for ResponseHead {
    fn from(status: Status) -> Self {
        Self {
            status: status.code(),
        }
    }
}

/// Response statuses used by the gateway and transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
    BadGateway,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
            Status::BadGateway => 502,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.code(), self)
    }
}

/// Exchanged once when a multiplexed session is set up, in both directions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node: NodeAnnounce,
    pub subscriptions: Subscriptions,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MeshError> {
    Ok(bincode_options().serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MeshError> {
    Ok(bincode_options().deserialize(bytes)?)
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), MeshError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = encode(value)?;
    if bytes.len() > MAX_HEAD_SIZE {
        return Err(MeshError::Wire(format!(
            "head too large: {} bytes (max {})",
            bytes.len(),
            MAX_HEAD_SIZE
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, MeshError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_HEAD_SIZE {
        return Err(MeshError::Wire(format!(
            "head too large: {} bytes (max {})",
            len, MAX_HEAD_SIZE
        )));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    decode(&bytes)
}

pub async fn write_status<W>(writer: &mut W, status: Status) -> Result<(), MeshError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame(writer, &ResponseHead::from(status)).await
}
