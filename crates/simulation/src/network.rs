//! Simulated network with latency, packet loss, and partitions.
//!
//! Each validator gets an unbounded inbound channel. Messages are delivered
//! from spawned tokio tasks after the sampled latency, so the network must be
//! used from within a tokio runtime.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_production::{InboundMessages, PeerMessage, PeerTransport};
use strata_types::NodeIndex;
use tokio::sync::mpsc;
use tracing::trace;

/// Configuration for simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this probability.
    pub packet_loss_rate: f64,
    /// Seed for latency and loss sampling.
    pub seed: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(2),
            jitter_fraction: 0.1,
            packet_loss_rate: 0.0,
            seed: 42,
        }
    }
}

#[derive(Debug)]
struct Links {
    /// If (a, b) is in this set, messages from a to b are dropped.
    partitions: HashSet<(NodeIndex, NodeIndex)>,
    packet_loss_rate: f64,
    rng: ChaCha8Rng,
}

/// In-process network connecting the validators of a simulation.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    inboxes: Vec<mpsc::UnboundedSender<(NodeIndex, PeerMessage)>>,
    links: Mutex<Links>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SimulatedNetwork {
    /// Create a network for `node_count` validators. Returns each
    /// validator's inbound channel, by index.
    pub fn new(node_count: usize, config: NetworkConfig) -> (Arc<Self>, Vec<InboundMessages>) {
        let (inboxes, receivers): (Vec<_>, Vec<InboundMessages>) =
            (0..node_count).map(|_| mpsc::unbounded_channel()).unzip();
        let network = Self {
            links: Mutex::new(Links {
                partitions: HashSet::new(),
                packet_loss_rate: config.packet_loss_rate,
                rng: ChaCha8Rng::seed_from_u64(config.seed),
            }),
            config,
            inboxes,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (Arc::new(network), receivers)
    }

    /// Transport for validator `node`.
    pub fn transport(self: &Arc<Self>, node: NodeIndex) -> Arc<dyn PeerTransport> {
        Arc::new(NodeTransport {
            node,
            network: self.clone(),
        })
    }

    pub fn node_count(&self) -> usize {
        self.inboxes.len()
    }

    // ─── Partitions ───

    /// Check if two nodes are partitioned (message from `from` to `to` would be dropped).
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.links.lock().partitions.contains(&(from, to))
    }

    /// Create a unidirectional partition: messages from `from` to `to` are dropped.
    pub fn partition_unidirectional(&self, from: NodeIndex, to: NodeIndex) {
        self.links.lock().partitions.insert((from, to));
    }

    pub fn partition_bidirectional(&self, a: NodeIndex, b: NodeIndex) {
        let mut links = self.links.lock();
        links.partitions.insert((a, b));
        links.partitions.insert((b, a));
    }

    /// Cut `node` off from everybody else.
    pub fn isolate_node(&self, node: NodeIndex) {
        let mut links = self.links.lock();
        for other in 0..self.inboxes.len() {
            if other != node {
                links.partitions.insert((node, other));
                links.partitions.insert((other, node));
            }
        }
    }

    /// Heal all partitions - restore full network connectivity.
    pub fn heal_all(&self) {
        self.links.lock().partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.links.lock().partitions.len()
    }

    // ─── Packet Loss ───

    /// Set the packet loss rate (0.0 - 1.0).
    pub fn set_packet_loss_rate(&self, rate: f64) {
        self.links.lock().packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    // ─── Delivery ───

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Decide whether a message from `from` to `to` is delivered and after
    /// how long. `None` means dropped.
    fn should_deliver(&self, from: NodeIndex, to: NodeIndex) -> Option<Duration> {
        let mut links = self.links.lock();
        if links.partitions.contains(&(from, to)) {
            return None;
        }
        let loss = links.packet_loss_rate;
        if loss > 0.0 && links.rng.gen::<f64>() < loss {
            return None;
        }

        let base = self.config.latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            links.rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        Some(Duration::from_secs_f64((base + jitter).max(0.0)))
    }

    fn deliver(&self, from: NodeIndex, to: NodeIndex, message: PeerMessage) {
        let Some(inbox) = self.inboxes.get(to) else {
            return;
        };
        let Some(latency) = self.should_deliver(from, to) else {
            trace!(from, to, kind = message.kind(), "Dropped message");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);

        let inbox = inbox.clone();
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            // A stopped validator has dropped its receiver.
            let _ = inbox.send((from, message));
        });
    }
}

struct NodeTransport {
    node: NodeIndex,
    network: Arc<SimulatedNetwork>,
}

impl PeerTransport for NodeTransport {
    fn send(&self, to: NodeIndex, message: PeerMessage) {
        if to != self.node {
            self.network.deliver(self.node, to, message);
        }
    }

    fn broadcast(&self, message: PeerMessage) {
        for to in 0..self.network.node_count() {
            if to != self.node {
                self.network.deliver(self.node, to, message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::NodeStatus;

    fn status() -> PeerMessage {
        PeerMessage::Status(NodeStatus::default())
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_else() {
        let (network, mut inboxes) = SimulatedNetwork::new(3, NetworkConfig::default());
        network.transport(0).broadcast(status());

        for inbox in inboxes.iter_mut().skip(1) {
            let (from, message) = inbox.recv().await.unwrap();
            assert_eq!(from, 0);
            assert_eq!(message, status());
        }
        assert!(inboxes[0].try_recv().is_err());
        assert_eq!(network.delivered_count(), 2);
    }

    #[tokio::test]
    async fn test_unidirectional_partition() {
        let (network, mut inboxes) = SimulatedNetwork::new(2, NetworkConfig::default());
        network.partition_unidirectional(0, 1);
        assert!(network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(1, 0));

        network.transport(0).send(1, status());
        network.transport(1).send(0, status());
        assert_eq!(inboxes[0].recv().await.map(|(from, _)| from), Some(1));
        assert_eq!(network.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_isolate_and_heal() {
        let (network, _inboxes) = SimulatedNetwork::new(4, NetworkConfig::default());
        network.isolate_node(2);
        assert_eq!(network.partition_count(), 6);
        assert!(network.is_partitioned(2, 0));
        assert!(network.is_partitioned(3, 2));
        assert!(!network.is_partitioned(0, 1));

        network.heal_all();
        assert_eq!(network.partition_count(), 0);
    }

    #[tokio::test]
    async fn test_full_packet_loss_drops_everything() {
        let (network, _inboxes) = SimulatedNetwork::new(3, NetworkConfig::default());
        network.set_packet_loss_rate(1.0);
        network.transport(1).broadcast(status());
        assert_eq!(network.dropped_count(), 2);
        assert_eq!(network.delivered_count(), 0);
    }
}
