//! # Certificates and TLS Verification
//!
//! - **Self-signed certificates**: each node issues its own Ed25519 certificate;
//!   the CN carries the hex public key and the SAN list carries the address SNI
//!   name plus any configured DNS names.
//! - **Peer verification**: no CA chain is built. A presented leaf is accepted
//!   once it parses and the current time is inside its validity window. Trust
//!   is decided afterwards from the exact public key (see [`crate::trust`]).
//! - **Pinning**: a client that dials `<hex-address>.mesh` only accepts a server
//!   whose key derives to that address.
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` rustls APIs are used on purpose: identity is bound to the
//! public key, not to a CA-signed chain.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use x509_parser::prelude::*;

use crate::error::MeshError;
use crate::identity::{Address, EncodedKey, KeyType, Keypair, encode_spki};

/// Lazily-initialized ring provider shared by every TLS config.
pub(crate) static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for all meshgate TLS and QUIC connections.
pub const ALPN: &[u8] = b"meshgate";

/// Default certificate lifetime.
pub const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Backdating applied to `not_before` to absorb clock skew between peers.
const CERT_BACKDATE: Duration = Duration::from_secs(3600);

/// Idle timeout for QUIC sessions.
const QUIC_IDLE_TIMEOUT_MS: u32 = 60_000;

/// Keep-alive for QUIC sessions so idle tunnels are not reaped.
const QUIC_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Concurrent logical streams allowed per session.
const MAX_CONCURRENT_STREAMS: u32 = 256;

// ============================================================================
// Certificate generation
// ============================================================================

/// Validity window and extra SAN names for a generated certificate.
#[derive(Clone, Debug)]
pub struct CertOptions {
    pub san: Vec<String>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl Default for CertOptions {
    fn default() -> Self {
        let now = SystemTime::now();
        Self {
            san: Vec::new(),
            not_before: now - CERT_BACKDATE,
            not_after: now + DEFAULT_CERT_VALIDITY,
        }
    }
}

impl CertOptions {
    pub fn with_san(san: Vec<String>) -> Self {
        Self {
            san,
            ..Self::default()
        }
    }
}

/// Local certificate chain and private key, built once and shared.
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    pub fn generate(keypair: &Keypair, options: &CertOptions) -> Result<Self> {
        let (certs, key) = generate_certificate(keypair, options)?;
        Ok(Self { certs, key })
    }

    pub fn clone_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

pub fn generate_certificate(
    keypair: &Keypair,
    options: &CertOptions,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut names = vec![keypair.address().to_sni()];
    names.extend(options.san.iter().cloned());

    let mut params =
        rcgen::CertificateParams::new(names).context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );
    params.not_before = ::time::OffsetDateTime::from(options.not_before);
    params.not_after = ::time::OffsetDateTime::from(options.not_after);

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

// ============================================================================
// Certificate parsing
// ============================================================================

/// Identity facts extracted from a verified leaf certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCertificate {
    pub key_type: KeyType,
    pub key: EncodedKey,
    pub address: Address,
    pub san: Vec<String>,
}

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>, MeshError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| MeshError::CertificateInvalid(format!("x509: {e}")))?;
    Ok(cert)
}

/// Parse a leaf certificate into its key, derived address and SAN names.
pub fn parse_peer_certificate(der: &[u8]) -> Result<PeerCertificate, MeshError> {
    let cert = parse_certificate(der)?;
    peer_certificate(&cert)
}

fn peer_certificate(cert: &X509Certificate<'_>) -> Result<PeerCertificate, MeshError> {
    let (key_type, key) = encode_spki(cert.public_key());
    if key.as_bytes().is_empty() {
        return Err(MeshError::CertificateInvalid("empty public key".to_string()));
    }
    let san = match san_extension(cert) {
        Some(value) => parse_san(value)?,
        None => Vec::new(),
    };
    Ok(PeerCertificate {
        key_type,
        address: key.address(),
        key,
        san,
    })
}

/// Parse, then reject certificates outside their validity window at `now`.
pub fn verify_leaf(der: &[u8], now: SystemTime) -> Result<PeerCertificate, MeshError> {
    let cert = parse_certificate(der)?;
    check_validity(&cert, now)?;
    peer_certificate(&cert)
}

fn check_validity(cert: &X509Certificate<'_>, now: SystemTime) -> Result<(), MeshError> {
    let now = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let validity = cert.validity();
    if now < validity.not_before.timestamp() {
        return Err(MeshError::CertificateNotYetValid);
    }
    if now > validity.not_after.timestamp() {
        return Err(MeshError::CertificateExpired);
    }
    Ok(())
}

fn san_extension<'a>(cert: &'a X509Certificate<'_>) -> Option<&'a [u8]> {
    use x509_parser::oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME;

    cert.extensions()
        .iter()
        .find(|ext| ext.oid == OID_X509_EXT_SUBJECT_ALT_NAME)
        .map(|ext| ext.value)
}

/// GeneralName tag of `dNSName` (RFC 5280, 4.2.1.6).
const NAME_TYPE_DNS: u32 = 2;

/// Extract the DNS names from a certificate's SAN extension, in encoded order.
pub fn extract_san(cert_der: &[u8]) -> Result<Vec<String>, MeshError> {
    let cert = parse_certificate(cert_der)?;
    match san_extension(&cert) {
        Some(value) => parse_san(value),
        None => Ok(Vec::new()),
    }
}

/// Decode a raw SubjectAltName extension value.
///
/// ```text
/// SubjectAltName ::= GeneralNames
/// GeneralNames   ::= SEQUENCE SIZE (1..MAX) OF GeneralName
/// GeneralName    ::= CHOICE { ..., dNSName [2] IA5String, ... }
/// ```
///
/// Only `dNSName` entries are returned; other choices are skipped.
pub fn parse_san(extension: &[u8]) -> Result<Vec<String>, MeshError> {
    use x509_parser::der_parser::asn1_rs::{Any, Class, FromDer, Tag};

    let (rest, seq) = Any::from_der(extension)
        .map_err(|e| MeshError::CertificateInvalid(format!("SAN: {e}")))?;
    if !rest.is_empty() {
        return Err(MeshError::CertificateInvalid(
            "trailing data after X.509 extension".to_string(),
        ));
    }
    if !seq.header.is_constructed() || seq.tag() != Tag::Sequence || seq.class() != Class::Universal
    {
        return Err(MeshError::CertificateInvalid("bad SAN sequence".to_string()));
    }

    let mut dns = Vec::new();
    let mut rest: &[u8] = &seq.data;
    while !rest.is_empty() {
        let (next, name) = Any::from_der(rest)
            .map_err(|e| MeshError::CertificateInvalid(format!("SAN entry: {e}")))?;
        if name.class() == Class::ContextSpecific && name.tag() == Tag(NAME_TYPE_DNS) {
            let value = std::str::from_utf8(&name.data)
                .map_err(|e| MeshError::CertificateInvalid(format!("SAN dNSName: {e}")))?;
            dns.push(value.to_string());
        }
        rest = next;
    }
    Ok(dns)
}

fn unix_time_to_system(now: UnixTime) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(now.as_secs())
}

// ============================================================================
// rustls verifiers
// ============================================================================

/// Server-side verifier: requests a client certificate, checks structure and
/// validity window. Whether a certificate is mandatory is decided per listener.
#[derive(Debug)]
pub(crate) struct MeshClientCertVerifier {
    mandatory: bool,
}

impl MeshClientCertVerifier {
    pub(crate) fn new(mandatory: bool) -> Self {
        Self { mandatory }
    }
}

impl rustls::server::danger::ClientCertVerifier for MeshClientCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        verify_leaf(end_entity.as_ref(), unix_time_to_system(now))?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client-side verifier: validity window, plus address pinning when the
/// server name has the `<hex>.mesh` form.
#[derive(Debug)]
pub(crate) struct MeshServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for MeshServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let peer = verify_leaf(end_entity.as_ref(), unix_time_to_system(now))?;

        if let ServerName::DnsName(name) = server_name
            && let Some(expected) = Address::from_sni(name.as_ref())
            && expected != peer.address
        {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ============================================================================
// Config builders
// ============================================================================

pub fn create_server_config(
    material: &TlsMaterial,
    require_client_cert: bool,
) -> Result<rustls::ServerConfig> {
    let verifier = Arc::new(MeshClientCertVerifier::new(require_client_cert));
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        .context("unsupported TLS protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.certs.clone(), material.clone_key())
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];
    Ok(server_crypto)
}

/// Client TLS config. `None` builds an anonymous client that presents no
/// certificate.
pub fn create_client_config(material: Option<&TlsMaterial>) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        .context("unsupported TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(MeshServerCertVerifier));

    let mut client_crypto = match material {
        Some(material) => builder
            .with_client_auth_cert(material.certs.clone(), material.clone_key())
            .context("failed to create client TLS config with client auth")?,
        None => builder.with_no_client_auth(),
    };
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];
    Ok(client_crypto)
}

fn quic_transport_config() -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(quinn::VarInt::from_u32(QUIC_IDLE_TIMEOUT_MS).into()));
    transport.keep_alive_interval(Some(QUIC_KEEP_ALIVE));
    transport.max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    transport
}

/// QUIC server config for multiplexed sessions. Client certificates are
/// mandatory: a session is always mutually authenticated.
pub fn create_quic_server_config(material: &TlsMaterial) -> Result<quinn::ServerConfig> {
    let server_crypto = create_server_config(material, true)?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.migration(true);
    server_config.transport_config(Arc::new(quic_transport_config()));
    Ok(server_config)
}

pub fn create_quic_client_config(material: &TlsMaterial) -> Result<quinn::ClientConfig> {
    let client_crypto = create_client_config(Some(material))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(quic_transport_config()));
    Ok(client_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{derive_address, encode_key};
    use rustls::client::danger::ServerCertVerifier;
    use rustls::server::danger::ClientCertVerifier;

    const HOUR: Duration = Duration::from_secs(3600);

    fn cert_with_window(not_before: SystemTime, not_after: SystemTime) -> Vec<u8> {
        let keypair = Keypair::generate();
        let options = CertOptions {
            san: vec![],
            not_before,
            not_after,
        };
        let (certs, _) = generate_certificate(&keypair, &options).expect("cert generation");
        certs[0].to_vec()
    }

    /// DER for `SEQUENCE { [2] "a.example", [7] 10.0.0.1, [2] "b.example" }`.
    fn san_value() -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0x82);
        body.push(9);
        body.extend_from_slice(b"a.example");
        body.extend_from_slice(&[0x87, 4, 10, 0, 0, 1]);
        body.push(0x82);
        body.push(9);
        body.extend_from_slice(b"b.example");

        let mut seq = vec![0x30, body.len() as u8];
        seq.extend_from_slice(&body);
        seq
    }

    #[test]
    fn certificate_contains_identity_public_key() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _) = generate_certificate(&keypair, &CertOptions::default())
                .expect("cert generation must succeed");

            let peer = parse_peer_certificate(certs[0].as_ref()).expect("parse");
            assert_eq!(peer.key, keypair.encoded_key());
            assert_eq!(peer.key_type, KeyType::Ed25519);
            assert_eq!(peer.address, keypair.address());
        }
    }

    #[test]
    fn generated_certificate_carries_san_names() {
        let keypair = Keypair::generate();
        let options = CertOptions::with_san(vec!["a.example".into(), "b.example".into()]);
        let (certs, _) = generate_certificate(&keypair, &options).unwrap();

        let san = extract_san(certs[0].as_ref()).unwrap();
        assert_eq!(
            san,
            vec![
                keypair.address().to_sni(),
                "a.example".to_string(),
                "b.example".to_string()
            ]
        );
    }

    #[test]
    fn san_returns_dns_names_in_order() {
        let names = parse_san(&san_value()).unwrap();
        assert_eq!(names, vec!["a.example", "b.example"]);
    }

    #[test]
    fn san_rejects_non_sequence() {
        // OCTET STRING instead of SEQUENCE
        let value = [0x04, 0x03, 0x82, 0x01, b'a'];
        assert!(matches!(
            parse_san(&value),
            Err(MeshError::CertificateInvalid(msg)) if msg.contains("bad SAN sequence")
        ));

        // SET is constructed but has the wrong tag
        let value = [0x31, 0x03, 0x82, 0x01, b'a'];
        assert!(matches!(parse_san(&value), Err(MeshError::CertificateInvalid(_))));
    }

    #[test]
    fn san_rejects_trailing_bytes() {
        let mut value = san_value();
        value.extend_from_slice(&[0x00, 0x00]);
        assert!(matches!(
            parse_san(&value),
            Err(MeshError::CertificateInvalid(msg)) if msg.contains("trailing")
        ));
    }

    #[test]
    fn san_rejects_undecodable_dns_name() {
        // SEQUENCE { [2] "ok", [2] 0xff 0xfe }
        let value = [0x30, 0x08, 0x82, 0x02, b'o', b'k', 0x82, 0x02, 0xff, 0xfe];
        assert!(matches!(
            parse_san(&value),
            Err(MeshError::CertificateInvalid(msg)) if msg.contains("dNSName")
        ));
    }

    #[test]
    fn san_rejects_garbage() {
        assert!(parse_san(&[0x30]).is_err());
        assert!(parse_san(&[0x30, 0x05, 0x82, 0x09]).is_err());
    }

    #[test]
    fn certificate_not_yet_valid() {
        let now = SystemTime::now();
        let der = cert_with_window(now + HOUR, now + 2 * HOUR);
        assert!(matches!(
            verify_leaf(&der, now),
            Err(MeshError::CertificateNotYetValid)
        ));
    }

    #[test]
    fn certificate_expired() {
        let now = SystemTime::now();
        let der = cert_with_window(now - 2 * HOUR, now - HOUR);
        assert!(matches!(
            verify_leaf(&der, now),
            Err(MeshError::CertificateExpired)
        ));
    }

    #[test]
    fn certificate_within_window() {
        let now = SystemTime::now();
        let der = cert_with_window(now - HOUR, now + HOUR);
        assert!(verify_leaf(&der, now).is_ok());
    }

    #[test]
    fn malformed_certificate_is_invalid() {
        assert!(matches!(
            verify_leaf(&[0x30, 0x03, 0x01, 0x01, 0xff], SystemTime::now()),
            Err(MeshError::CertificateInvalid(_))
        ));
    }

    #[test]
    fn ecdsa_certificate_key_encoding() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["ec.example".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let first = parse_peer_certificate(cert.der()).unwrap();
        let second = parse_peer_certificate(cert.der()).unwrap();
        assert_eq!(first.key_type, KeyType::EcdsaP256);
        assert_eq!(first.key, second.key);
        assert_eq!(first.key.as_bytes().len(), 65);
        assert_eq!(first.key.as_bytes()[0], 0x04);

        let (_, from_spki) = encode_key(&key_pair.public_key_der()).unwrap();
        assert_eq!(from_spki, first.key);
        assert_eq!(first.address, derive_address(&from_spki));
        assert_eq!(first.san, vec!["ec.example"]);
    }

    #[test]
    fn client_verifier_rejects_expired_leaf() {
        let now = SystemTime::now();
        let der = cert_with_window(now - 2 * HOUR, now - HOUR);
        let verifier = MeshClientCertVerifier::new(true);
        let result = verifier.verify_client_cert(
            &CertificateDer::from(der),
            &[],
            UnixTime::now(),
        );
        assert!(matches!(
            result,
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::Expired
            ))
        ));
    }

    #[test]
    fn server_verifier_pins_address() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let (certs, _) = generate_certificate(&keypair, &CertOptions::default()).unwrap();

        let verifier = MeshServerCertVerifier;
        let pinned = ServerName::try_from(keypair.address().to_sni()).unwrap();
        assert!(
            verifier
                .verify_server_cert(&certs[0], &[], &pinned, &[], UnixTime::now())
                .is_ok()
        );

        let wrong = ServerName::try_from(other.address().to_sni()).unwrap();
        assert!(matches!(
            verifier.verify_server_cert(&certs[0], &[], &wrong, &[], UnixTime::now()),
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName
            ))
        ));

        let plain = ServerName::try_from("gateway.example").unwrap();
        assert!(
            verifier
                .verify_server_cert(&certs[0], &[], &plain, &[], UnixTime::now())
                .is_ok()
        );
    }

    #[test]
    fn config_builders_accept_generated_material() {
        let keypair = Keypair::generate();
        let material = TlsMaterial::generate(&keypair, &CertOptions::default()).unwrap();
        assert!(create_server_config(&material, true).is_ok());
        assert!(create_client_config(Some(&material)).is_ok());
        assert!(create_client_config(None).is_ok());
        assert!(create_quic_server_config(&material).is_ok());
        assert!(create_quic_client_config(&material).is_ok());
    }
}
