//! # Identity and Overlay Addressing
//!
//! - [`Keypair`]: the local Ed25519 signing keypair
//! - [`EncodedKey`]: canonical, algorithm-independent bytes of a public key
//! - [`Address`]: 16-byte overlay address derived from an [`EncodedKey`]
//!
//! ## Address Derivation
//!
//! `Address = 0xfd || BLAKE3(ADDRESS_DOMAIN || encoded_key)[..15]`
//!
//! The leading byte places every overlay address in the IPv6 ULA range, so
//! addresses render and route as ordinary IPv6. Derivation needs no
//! coordination between nodes and is stable for the lifetime of the key.
//! The registry keys nodes by [`Address::node_key`], the big-endian u64 of the
//! last eight address bytes.
//!
//! ## Key Encoding
//!
//! Peers may present Ed25519, ECDSA or RSA certificates. The canonical encoding
//! is the content of the SubjectPublicKeyInfo `subjectPublicKey` BIT STRING:
//! the raw 32 bytes for Ed25519, the uncompressed SEC1 point for EC keys and the
//! PKCS#1 `RSAPublicKey` DER for RSA.

use std::fmt;
use std::net::Ipv6Addr;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// IPv6 unique-local prefix shared by all overlay addresses.
pub const ADDRESS_PREFIX: u8 = 0xfd;

/// Domain separation prefix for address hashing.
const ADDRESS_DOMAIN: &[u8] = b"meshgate-address-v1:";

/// Label appended to SNI names that carry an expected peer address.
pub const SNI_SUFFIX: &str = "mesh";

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Ed25519 public keys encode as their raw 32 bytes.
    pub fn encoded_key(&self) -> EncodedKey {
        EncodedKey::from(self.public_key_bytes().to_vec())
    }

    pub fn address(&self) -> Address {
        derive_address(&self.encoded_key())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }

    /// Load a hex-encoded secret key, or generate one and persist it when the
    /// file does not exist. Keeps the overlay address stable across restarts.
    pub fn load_or_generate(path: &Path) -> Result<Self, MeshError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let bytes = hex::decode(contents.trim())
                    .map_err(|e| MeshError::Config(format!("{}: {}", path.display(), e)))?;
                let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    MeshError::Config(format!(
                        "{}: expected 32-byte secret, got {} bytes",
                        path.display(),
                        bytes.len()
                    ))
                })?;
                Ok(Self::from_secret_key_bytes(&secret))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                std::fs::write(path, hex::encode(keypair.secret_key_bytes()))?;
                Ok(keypair)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Public key algorithm of a presented certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Ed25519,
    EcdsaP256,
    Rsa,
    Other,
}

/// Canonical public key bytes. Used as the trust-store lookup key and as the
/// address digest input.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey(Vec<u8>);

impl EncodedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.is_empty() {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Self(bytes))
    }

    pub fn address(&self) -> Address {
        derive_address(self)
    }
}

impl From<Vec<u8>> for EncodedKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for EncodedKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "EncodedKey({})", &hex[..hex.len().min(16)])
    }
}

/// Encode the public key carried in a DER SubjectPublicKeyInfo.
pub fn encode_key(spki_der: &[u8]) -> Result<(KeyType, EncodedKey), MeshError> {
    use x509_parser::prelude::*;

    let (rest, spki) = SubjectPublicKeyInfo::from_der(spki_der)
        .map_err(|e| MeshError::CertificateInvalid(format!("public key info: {e}")))?;
    if !rest.is_empty() {
        return Err(MeshError::CertificateInvalid(
            "trailing data after public key info".to_string(),
        ));
    }
    Ok(encode_spki(&spki))
}

pub(crate) fn encode_spki(
    spki: &x509_parser::x509::SubjectPublicKeyInfo<'_>,
) -> (KeyType, EncodedKey) {
    use x509_parser::oid_registry::{
        OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION, OID_SIG_ED25519,
    };

    let bytes = spki.subject_public_key.data.to_vec();
    let algorithm = &spki.algorithm.algorithm;
    let key_type = if *algorithm == OID_SIG_ED25519 && bytes.len() == 32 {
        KeyType::Ed25519
    } else if *algorithm == OID_KEY_TYPE_EC_PUBLIC_KEY && bytes.len() == 65 && bytes[0] == 0x04 {
        KeyType::EcdsaP256
    } else if *algorithm == OID_PKCS1_RSAENCRYPTION {
        KeyType::Rsa
    } else {
        KeyType::Other
    };
    (key_type, EncodedKey(bytes))
}

/// Fixed-width overlay address, rendered as IPv6.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address([u8; 16]);

impl Address {
    pub fn from_bytes(bytes: [u8; 16]) -> Result<Self, MeshError> {
        if bytes[0] != ADDRESS_PREFIX {
            return Err(MeshError::Config(format!(
                "invalid address prefix: expected 0x{:02x}, got 0x{:02x}",
                ADDRESS_PREFIX, bytes[0]
            )));
        }
        Ok(Self(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Registry map key: the last eight bytes as a big-endian integer.
    #[inline]
    pub fn node_key(&self) -> u64 {
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&self.0[8..16]);
        u64::from_be_bytes(tail)
    }

    pub fn to_ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// TLS server name that pins the peer to this address: `<hex>.mesh`.
    pub fn to_sni(&self) -> String {
        format!("{}.{}", self.to_hex(), SNI_SUFFIX)
    }

    /// Inverse of [`Address::to_sni`]; `None` for ordinary host names.
    pub fn from_sni(sni: &str) -> Option<Self> {
        let (label, suffix) = sni.split_once('.')?;
        if suffix != SNI_SUFFIX {
            return None;
        }
        let bytes = hex::decode(label).ok()?;
        let bytes: [u8; 16] = bytes.as_slice().try_into().ok()?;
        Self::from_bytes(bytes).ok()
    }
}

/// Derive the overlay address of a public key.
pub fn derive_address(key: &EncodedKey) -> Address {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ADDRESS_DOMAIN);
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes[0] = ADDRESS_PREFIX;
    bytes[1..16].copy_from_slice(&hash.as_bytes()[..15]);
    Address(bytes)
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_ipv6())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ipv6())
    }
}

impl From<Address> for Ipv6Addr {
    fn from(addr: Address) -> Self {
        Ipv6Addr::from(addr.0)
    }
}
