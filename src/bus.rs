//! Message bus boundary.
//!
//! The gateway turns `/dm/<to...>` requests into [`Message`]s and hands them to
//! a [`MessageRouter`]. Routing policy lives behind the trait; [`ChannelRouter`]
//! is the in-process implementation used by the binary.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Topology updates: announces and node changes.
pub const TOPIC_TOPOLOGY: &str = "topology";

/// A node gained an upstream connection.
pub const TOPIC_CONNECT_UP: &str = "connectUP";

/// Subscription matching every topic.
pub const FIREHOSE: &str = "*";

/// Per-connection queue depth in [`ChannelRouter`].
const CONNECTION_QUEUE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub time: SystemTime,
    /// Destination path, `topic[/sub...]` or `<connection>/...`.
    pub to: String,
    pub from: String,
    pub meta: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(to: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: new_message_id(),
            time: SystemTime::now(),
            to: to.into(),
            from: String::new(),
            meta: BTreeMap::new(),
            data,
        }
    }

    pub fn from_node(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    /// First segment of `to`.
    pub fn topic(&self) -> &str {
        self.to.split('/').next().unwrap_or_default()
    }
}

fn new_message_id() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        bytes = rand::random();
    }
    hex::encode(bytes)
}

/// Topics a connection asked to receive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriptions(Vec<String>);

impl Subscriptions {
    pub fn new(topics: Vec<String>) -> Self {
        Self(topics)
    }

    /// Trusted upstream: everything.
    pub fn all() -> Self {
        Self(vec![FIREHOSE.to_string()])
    }

    /// Access-point peer: topology changes only.
    pub fn topology() -> Self {
        Self(vec![TOPIC_TOPOLOGY.to_string(), TOPIC_CONNECT_UP.to_string()])
    }

    /// Leaf: only messages addressed to the connection itself.
    pub fn directed() -> Self {
        Self(Vec::new())
    }

    pub fn topics(&self) -> &[String] {
        &self.0
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.0.iter().any(|t| t == FIREHOSE || t == topic)
    }
}

pub trait MessageRouter: Send + Sync {
    /// Register a named connection; messages for it arrive on the receiver.
    fn add_connection(&self, name: &str, subscriptions: Subscriptions) -> mpsc::Receiver<Message>;

    fn remove_connection(&self, name: &str);

    /// Deliver to every matching connection. Returns the number of deliveries.
    fn dispatch(&self, message: Message) -> usize;
}

struct Connection {
    subscriptions: Subscriptions,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
pub struct ChannelRouter {
    connections: Mutex<HashMap<String, Connection>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl MessageRouter for ChannelRouter {
    fn add_connection(&self, name: &str, subscriptions: Subscriptions) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        debug!(connection = name, topics = ?subscriptions.topics(), "bus connection added");
        connections.insert(
            name.to_string(),
            Connection { subscriptions, tx },
        );
        rx
    }

    fn remove_connection(&self, name: &str) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.remove(name);
    }

    fn dispatch(&self, message: Message) -> usize {
        let topic = message.topic().to_string();
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;

        connections.retain(|name, conn| {
            if conn.tx.is_closed() {
                return false;
            }
            if *name == message.from {
                return true;
            }
            if *name == topic || conn.subscriptions.matches(&topic) {
                match conn.tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => trace!(connection = %name, error = %e, "dropping message"),
                }
            }
            true
        });

        trace!(id = %message.id, to = %message.to, delivered, "dispatched");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_presets() {
        assert!(Subscriptions::all().matches("anything"));
        assert!(Subscriptions::topology().matches(TOPIC_TOPOLOGY));
        assert!(Subscriptions::topology().matches(TOPIC_CONNECT_UP));
        assert!(!Subscriptions::topology().matches("chat"));
        assert!(!Subscriptions::directed().matches("topology"));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Message::new("x", vec![]);
        let b = Message::new("x", vec![]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
    }

    #[tokio::test]
    async fn routes_by_topic_and_connection_name() {
        let router = ChannelRouter::new();
        let mut upstream = router.add_connection("upstream", Subscriptions::all());
        let mut ap = router.add_connection("ap", Subscriptions::topology());
        let mut leaf = router.add_connection("leaf", Subscriptions::directed());

        let delivered = router.dispatch(Message::new("topology/announce", b"t".to_vec()));
        assert_eq!(delivered, 2);
        assert_eq!(upstream.recv().await.unwrap().to, "topology/announce");
        assert_eq!(ap.recv().await.unwrap().data, b"t");
        assert!(leaf.try_recv().is_err());

        let delivered = router.dispatch(Message::new("leaf/inbox", b"d".to_vec()));
        assert_eq!(delivered, 2);
        assert_eq!(leaf.recv().await.unwrap().to, "leaf/inbox");
        assert!(ap.try_recv().is_err());
    }

    #[tokio::test]
    async fn skips_sender_and_closed_connections() {
        let router = ChannelRouter::new();
        let mut origin = router.add_connection("origin", Subscriptions::all());
        let closed = router.add_connection("closed", Subscriptions::all());
        drop(closed);

        let delivered = router.dispatch(Message::new("chat", vec![]).from_node("origin"));
        assert_eq!(delivered, 0);
        assert!(origin.try_recv().is_err());
        assert_eq!(router.connection_count(), 1);
    }
}
