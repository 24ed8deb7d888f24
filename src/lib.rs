//! # meshgate - Authenticated Mesh Gateway
//!
//! Core of a peer-to-peer mesh gateway:
//!
//! - **Identity**: self-certifying 128-bit overlay addresses derived from public keys
//! - **Transport**: mutual TLS with SAN extraction, a per-request panic boundary
//!   and an access log
//! - **Registry**: known nodes, their gateways and per-node reconnect backoff
//! - **Multiplexing**: QUIC sessions carrying many logical streams, with SOCKS,
//!   TCP and reverse forwarding
//!
//! ## Security Model
//!
//! - Every certificate is checked for structure and validity window only;
//!   trust is decided once per connection from the authorized-keys store
//! - A node's address is a domain-separated BLAKE3 hash of its encoded public
//!   key, so a pinned address pins the key
//! - Peers without a certificate are guests; guests cannot open tunnels
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, key encoding, overlay addresses |
//! | `crypto` | Certificate generation, verification, SAN parsing, TLS configs |
//! | `trust` | Authorized keys and roles |
//! | `transport` | TLS listener, request dispatch boundary, TLS client |
//! | `registry` | Node table, gateways, backoff, eviction |
//! | `mux` | Session traits and the QUIC implementation |
//! | `proxy` | SOCKS5 and TCP stream proxying |
//! | `wire` | Stream head framing |
//! | `bus` | Message routing boundary |
//! | `gateway` | The context object serving all routes |

mod bus;
mod crypto;
mod error;
mod gateway;
mod identity;
mod mux;
mod proxy;
mod registry;
mod transport;
mod trust;
mod wire;

pub use bus::{
    ChannelRouter, FIREHOSE, Message, MessageRouter, Subscriptions, TOPIC_CONNECT_UP,
    TOPIC_TOPOLOGY,
};
pub use crypto::{
    CertOptions, PeerCertificate, TlsMaterial, extract_san, generate_certificate,
    parse_peer_certificate, parse_san, verify_leaf,
};
pub use error::MeshError;
pub use gateway::{
    ANNOUNCE_PATH, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MUX_PORT, DEFAULT_TLS_PORT, Gateway,
    GatewayConfig,
};
pub use identity::{Address, EncodedKey, KeyType, Keypair, derive_address, encode_key};
pub use mux::{
    BiStream, Capabilities, ClientDialer, ForwardHandle, MuxDialer, QuicMux, QuicSession,
    ReverseForwarder, SessionKind, Stream, StreamProxy, TunDialer, reverse_listen,
};
pub use proxy::{SocksTarget, TcpProxy, connect_tcp, read_socks_request, socks5_connect};
pub use registry::{
    Announce, Backoff, DEFAULT_NODE_TTL, DEFAULT_REAP_INTERVAL, Direction, GatewayAddr,
    MeshState, NodeAnnounce, NodeSnapshot, Registry, UpsertOutcome,
};
pub use transport::{
    DEFAULT_SOCKS_PROXY, Exchange, Handler, Listener, MeshClient, PeerIdentity, Request,
    Transport, TransportOptions, trace_path,
};
pub use trust::{Role, TrustStore, parse_authorized_keys};
pub use wire::{Hello, RequestHead, ResponseHead, Status};
