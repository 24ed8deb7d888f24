//! # Node Registry
//!
//! In-memory topology state: every known peer keyed by the u64 projection of
//! its overlay address, plus mesh-wide interface state.
//!
//! All mutation goes through [`Registry`] methods holding a single writer lock.
//! No lock is held across a sleep or I/O; [`Registry::backoff_sleep`] reads and
//! advances the delay under the lock, then sleeps without it.
//!
//! ## Ordering
//!
//! `last_seen` never moves backward. An announce stamped earlier than the
//! stored `last_seen` is counted as stale and otherwise ignored.
//!
//! ## Backoff
//!
//! ```text
//! Idle(0) --fail--> 5s --fail--> 10s --> ... --> 300s (cap)
//!    ^                                              |
//!    +------------------- success ------------------+
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::error::MeshError;
use crate::identity::{Address, EncodedKey};
use crate::mux::ClientDialer;

/// Entries kept in each node's recent-seen ring.
pub const SEEN_HISTORY: usize = 100;

/// Default age after which an unseen node is evicted.
pub const DEFAULT_NODE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Default period of the eviction reaper.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(600);

// ============================================================================
// Value types
// ============================================================================

/// Reachability address of a node as seen from here.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayAddr {
    pub ip: IpAddr,
    pub port: u16,
    /// Interface scope for IPv6 link-local addresses.
    pub zone: Option<String>,
}

impl GatewayAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            zone: None,
        }
    }
}

impl GatewayAddr {
    /// Socket address to dial. Numeric zones become the IPv6 scope id.
    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip {
            IpAddr::V6(ip) => {
                let scope = self
                    .zone
                    .as_deref()
                    .and_then(|zone| zone.parse().ok())
                    .unwrap_or(0);
                SocketAddr::V6(std::net::SocketAddrV6::new(ip, self.port, 0, scope))
            }
            IpAddr::V4(ip) => SocketAddr::new(IpAddr::V4(ip), self.port),
        }
    }
}

impl From<SocketAddr> for GatewayAddr {
    fn from(addr: SocketAddr) -> Self {
        let zone = match addr {
            SocketAddr::V6(v6) if v6.scope_id() != 0 => Some(v6.scope_id().to_string()),
            _ => None,
        };
        Self {
            ip: addr.ip().to_canonical(),
            port: addr.port(),
            zone,
        }
    }
}

impl fmt::Display for GatewayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.ip, &self.zone) {
            (IpAddr::V6(ip), Some(zone)) => write!(f, "[{}%{}]:{}", ip, zone, self.port),
            (IpAddr::V6(ip), None) => write!(f, "[{}]:{}", ip, self.port),
            (IpAddr::V4(ip), _) => write!(f, "{}:{}", ip, self.port),
        }
    }
}

/// Information a node publishes about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnounce {
    pub user_agent: String,
    /// Non-link-local addresses of the node.
    pub ips: Vec<String>,
    /// SSID of the access point the node runs, if any.
    pub ssid: String,
    /// SSID of the access point the node is connected to.
    pub ap: String,
    pub ack: bool,
    pub vpn: String,
}

/// One received announce, as handed to [`Registry::upsert`].
#[derive(Clone, Debug)]
pub struct Announce {
    pub key: EncodedKey,
    pub timestamp: SystemTime,
    /// Source socket of the announce; the family selects v4/v6 bookkeeping.
    pub source: Option<SocketAddr>,
    /// Received on the local P2P interface.
    pub on_p2p: bool,
    /// Sent by the peer from its P2P interface.
    pub from_p2p: bool,
    pub info: Option<NodeAnnounce>,
}

impl Announce {
    pub fn new(key: EncodedKey, timestamp: SystemTime) -> Self {
        Self {
            key,
            timestamp,
            source: None,
            on_p2p: false,
            from_p2p: false,
            info: None,
        }
    }

    pub fn from_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_info(mut self, info: NodeAnnounce) -> Self {
        self.info = Some(info);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Older than the stored `last_seen`; only counted.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Tunnel the peer opened to us.
    Inbound,
    /// Tunnel we dialed to the peer.
    Outbound,
}

/// Reconnect backoff: floor 5s, doubling until the 5 minute ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub const FLOOR: Duration = Duration::from_secs(5);
    pub const CEILING: Duration = Duration::from_secs(300);

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_zero()
    }

    /// The delay to wait now. Advances to the next step for the following call.
    pub fn next_delay(&mut self) -> Duration {
        if self.current.is_zero() {
            self.current = Self::FLOOR;
        }
        let delay = self.current;
        if self.current < Self::CEILING {
            self.current = (self.current * 2).min(Self::CEILING);
        }
        delay
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Mesh-wide interface and uplink state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshState {
    /// Active P2P interface name.
    pub active_p2p: Option<String>,
    /// Active VPN server.
    pub vpn: Option<String>,
    /// SSID of the wifi network this node is connected to.
    pub connected_wifi: Option<String>,
    pub user_agent: String,
    /// SSID of the access point this node runs.
    pub ap: Option<String>,
    pub ap_state: String,
    pub public_ips: Vec<IpAddr>,
    /// Gateway of the upstream network.
    pub gateway_addr: Option<GatewayAddr>,
    /// Node key of the mesh node providing the upstream AP.
    pub upstream_ap: Option<u64>,
}

// ============================================================================
// Node
// ============================================================================

struct Node {
    address: Address,
    key: Option<EncodedKey>,
    first_seen: SystemTime,
    last_seen: SystemTime,
    last_seen4: Option<SystemTime>,
    last_seen6: Option<SystemTime>,
    gateway: Option<GatewayAddr>,
    last4: Option<GatewayAddr>,
    last6: Option<GatewayAddr>,
    announces: u64,
    announces_on_p2p: u64,
    announces_from_p2p: u64,
    stale_announces: u64,
    labels: HashMap<String, String>,
    backoff: Backoff,
    inbound: Option<Arc<dyn ClientDialer>>,
    outbound: Option<Arc<dyn ClientDialer>>,
    last_announce: Option<NodeAnnounce>,
    seen: VecDeque<u64>,
}

impl Node {
    fn new(address: Address, key: Option<EncodedKey>, now: SystemTime) -> Self {
        Self {
            address,
            key,
            first_seen: now,
            last_seen: now,
            last_seen4: None,
            last_seen6: None,
            gateway: None,
            last4: None,
            last6: None,
            announces: 0,
            announces_on_p2p: 0,
            announces_from_p2p: 0,
            stale_announces: 0,
            labels: HashMap::new(),
            backoff: Backoff::default(),
            inbound: None,
            outbound: None,
            last_announce: None,
            seen: VecDeque::with_capacity(SEEN_HISTORY),
        }
    }

    fn touch(&mut self, at: SystemTime) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    fn record_seen(&mut self, at: SystemTime) {
        let offset = at
            .duration_since(self.first_seen)
            .unwrap_or_default()
            .as_secs();
        if self.seen.len() == SEEN_HISTORY {
            self.seen.pop_front();
        }
        self.seen.push_back(offset);
    }

    fn apply(&mut self, announce: Announce) {
        self.touch(announce.timestamp);
        if self.key.is_none() {
            self.key = Some(announce.key);
        }

        if let Some(source) = announce.source {
            let addr = GatewayAddr::from(source);
            if addr.ip.is_ipv4() {
                self.last_seen4 = Some(announce.timestamp);
                self.last4 = Some(addr);
            } else {
                self.last_seen6 = Some(announce.timestamp);
                self.last6 = Some(addr);
            }
        }

        self.announces += 1;
        if announce.on_p2p {
            self.announces_on_p2p += 1;
        }
        if announce.from_p2p {
            self.announces_from_p2p += 1;
        }
        if let Some(info) = announce.info {
            self.last_announce = Some(info);
        }
        self.record_seen(announce.timestamp);
    }

    fn gateways(&self) -> Vec<GatewayAddr> {
        [&self.gateway, &self.last4, &self.last6]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            address: self.address,
            key: self.key.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            last_seen4: self.last_seen4,
            last_seen6: self.last_seen6,
            gateway: self.gateway.clone(),
            last4: self.last4.clone(),
            last6: self.last6.clone(),
            announces: self.announces,
            announces_on_p2p: self.announces_on_p2p,
            announces_from_p2p: self.announces_from_p2p,
            stale_announces: self.stale_announces,
            labels: self.labels.clone(),
            backoff: self.backoff.current(),
            has_inbound: self.inbound.is_some(),
            has_outbound: self.outbound.is_some(),
            last_announce: self.last_announce.clone(),
            seen: self.seen.iter().copied().collect(),
        }
    }
}

/// Point-in-time copy of a node. Mutation goes through the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub address: Address,
    pub key: Option<EncodedKey>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub last_seen4: Option<SystemTime>,
    pub last_seen6: Option<SystemTime>,
    pub gateway: Option<GatewayAddr>,
    pub last4: Option<GatewayAddr>,
    pub last6: Option<GatewayAddr>,
    pub announces: u64,
    pub announces_on_p2p: u64,
    pub announces_from_p2p: u64,
    pub stale_announces: u64,
    pub labels: HashMap<String, String>,
    pub backoff: Duration,
    pub has_inbound: bool,
    pub has_outbound: bool,
    pub last_announce: Option<NodeAnnounce>,
    pub seen: Vec<u64>,
}

impl NodeSnapshot {
    pub fn node_key(&self) -> u64 {
        self.address.node_key()
    }

    /// Candidate addresses, direct gateway first, then last v4 and last v6.
    pub fn gateways(&self) -> Vec<GatewayAddr> {
        [&self.gateway, &self.last4, &self.last6]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    nodes: HashMap<u64, Node>,
    mesh: MeshState,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announce, creating the node on first sight.
    pub async fn upsert(&self, announce: Announce) -> UpsertOutcome {
        let address = announce.key.address();
        let node_key = address.node_key();
        let mut inner = self.inner.write().await;

        match inner.nodes.get_mut(&node_key) {
            Some(node) if announce.timestamp < node.last_seen => {
                node.stale_announces += 1;
                trace!(node = %address, "ignoring stale announce");
                UpsertOutcome::Stale
            }
            Some(node) => {
                node.apply(announce);
                UpsertOutcome::Updated
            }
            None => {
                let mut node = Node::new(address, None, announce.timestamp);
                node.apply(announce);
                inner.nodes.insert(node_key, node);
                debug!(node = %address, "new node");
                UpsertOutcome::Created
            }
        }
    }

    /// Snapshot of the node owning `key`, created with zero counters if absent.
    pub async fn node_for_key(&self, key: &EncodedKey) -> NodeSnapshot {
        let address = key.address();
        let mut inner = self.inner.write().await;
        inner
            .nodes
            .entry(address.node_key())
            .or_insert_with(|| {
                debug!(node = %address, "registering node");
                Node::new(address, Some(key.clone()), SystemTime::now())
            })
            .snapshot()
    }

    /// Record the direct link-local gateway a node was reached through.
    pub async fn update_gateway_direct(
        &self,
        node_key: u64,
        ip: IpAddr,
        zone: Option<String>,
        port: u16,
        is_response: bool,
    ) -> Result<(), MeshError> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&node_key)
            .ok_or(MeshError::UnknownNode(node_key))?;
        node.touch(SystemTime::now());
        node.gateway = Some(GatewayAddr { ip, port, zone });
        trace!(node = %node.address, is_response, "direct gateway updated");
        Ok(())
    }

    /// `[direct, last4, last6]`, skipping unknown entries.
    pub async fn gateways(&self, node_key: u64) -> Vec<GatewayAddr> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .get(&node_key)
            .map(Node::gateways)
            .unwrap_or_default()
    }

    pub async fn backoff_reset(&self, node_key: u64) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(&node_key) {
            node.backoff.reset();
        }
    }

    /// Record a failed dial: advance the node's backoff and return the delay
    /// to wait before the next attempt.
    pub async fn backoff_failed(&self, node_key: u64) -> Result<Duration, MeshError> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&node_key)
            .ok_or(MeshError::UnknownNode(node_key))?;
        Ok(node.backoff.next_delay())
    }

    /// Sleep the node's current backoff delay and advance it. Returns the
    /// delay slept. The registry lock is released before sleeping.
    pub async fn backoff_sleep(&self, node_key: u64) -> Result<Duration, MeshError> {
        let delay = self.backoff_failed(node_key).await?;
        debug!(node_key, delay = ?delay, "backing off");
        tokio::time::sleep(delay).await;
        Ok(delay)
    }

    pub async fn snapshot(&self, node_key: u64) -> Option<NodeSnapshot> {
        let inner = self.inner.read().await;
        inner.nodes.get(&node_key).map(Node::snapshot)
    }

    pub async fn nodes(&self) -> Vec<NodeSnapshot> {
        let inner = self.inner.read().await;
        inner.nodes.values().map(Node::snapshot).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.nodes.is_empty()
    }

    pub async fn set_label(
        &self,
        node_key: u64,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MeshError> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&node_key)
            .ok_or(MeshError::UnknownNode(node_key))?;
        node.labels.insert(name.into(), value.into());
        Ok(())
    }

    pub async fn labels(&self, node_key: u64) -> HashMap<String, String> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .get(&node_key)
            .map(|node| node.labels.clone())
            .unwrap_or_default()
    }

    pub async fn attach_dialer(
        &self,
        node_key: u64,
        direction: Direction,
        dialer: Arc<dyn ClientDialer>,
    ) -> Result<(), MeshError> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&node_key)
            .ok_or(MeshError::UnknownNode(node_key))?;
        match direction {
            Direction::Inbound => node.inbound = Some(dialer),
            Direction::Outbound => node.outbound = Some(dialer),
        }
        debug!(node = %node.address, ?direction, "tunnel attached");
        Ok(())
    }

    pub async fn detach_dialer(&self, node_key: u64, direction: Direction) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.nodes.get_mut(&node_key) {
            match direction {
                Direction::Inbound => node.inbound = None,
                Direction::Outbound => node.outbound = None,
            }
        }
    }

    pub async fn dialer(&self, node_key: u64, direction: Direction) -> Option<Arc<dyn ClientDialer>> {
        let inner = self.inner.read().await;
        let node = inner.nodes.get(&node_key)?;
        match direction {
            Direction::Inbound => node.inbound.clone(),
            Direction::Outbound => node.outbound.clone(),
        }
    }

    pub async fn mesh_state(&self) -> MeshState {
        self.inner.read().await.mesh.clone()
    }

    pub async fn update_mesh_state<F>(&self, update: F)
    where
        F: FnOnce(&mut MeshState),
    {
        let mut inner = self.inner.write().await;
        update(&mut inner.mesh);
    }

    pub async fn set_upstream_ap(&self, node_key: Option<u64>) {
        let mut inner = self.inner.write().await;
        inner.mesh.upstream_ap = node_key;
    }

    /// Remove nodes unseen for longer than `max_age`. Returns how many were
    /// removed.
    pub async fn evict_stale(&self, max_age: Duration) -> usize {
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return 0;
        };
        let mut inner = self.inner.write().await;
        let before = inner.nodes.len();
        inner.nodes.retain(|_, node| node.last_seen >= cutoff);
        let evicted = before - inner.nodes.len();
        if evicted > 0 {
            info!(evicted, remaining = inner.nodes.len(), "evicted stale nodes");
        }
        evicted
    }
}
