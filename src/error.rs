//! Error kinds surfaced by the authenticated transport and topology layer.
//!
//! Verification errors are all-or-nothing per certificate. Handler faults are
//! recovered at the transport boundary and only ever logged. Dial failures are
//! reported to the caller and drive the per-node backoff in the registry.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    /// Structurally unparseable certificate, key or extension.
    #[error("invalid certificate: {0}")]
    CertificateInvalid(String),

    #[error("expired certificate")]
    CertificateExpired,

    #[error("certificate is not valid yet")]
    CertificateNotYetValid,

    /// Mutual TLS was required but the peer presented no certificate.
    #[error("peer presented no client certificate")]
    Unauthenticated,

    /// A caught failure from a wrapped handler (panic or returned error).
    #[error("handler fault: {0}")]
    HandlerFault(String),

    #[error("dial to {dest} failed: {reason}")]
    DialFailed { dest: String, reason: String },

    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("unknown node {0:016x}")]
    UnknownNode(u64),

    #[error("wire format error: {0}")]
    Wire(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MeshError {
    pub(crate) fn dial(dest: impl Into<String>, reason: impl ToString) -> Self {
        MeshError::DialFailed {
            dest: dest.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<bincode::Error> for MeshError {
    fn from(err: bincode::Error) -> Self {
        MeshError::Wire(err.to_string())
    }
}

/// Maps verification failures onto the rustls alert the handshake reports.
impl From<MeshError> for rustls::Error {
    fn from(err: MeshError) -> Self {
        use rustls::CertificateError;
        match err {
            MeshError::CertificateExpired => {
                rustls::Error::InvalidCertificate(CertificateError::Expired)
            }
            MeshError::CertificateNotYetValid => {
                rustls::Error::InvalidCertificate(CertificateError::NotValidYet)
            }
            MeshError::CertificateInvalid(_) => {
                rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
            }
            other => rustls::Error::General(other.to_string()),
        }
    }
}
