//! In-memory collaborators and a multi-validator harness.
//!
//! The consensus core only needs a [`BlockchainEngine`], a transaction
//! queue and a peer transport. This crate provides in-memory versions of
//! all three so that whole clusters can run inside one test process:
//!
//! - [`MemoryEngine`] over a per-validator [`MemoryChain`]
//! - [`MemoryTransactionQueue`]
//! - [`SimulatedNetwork`] with latency, packet loss and partitions
//! - [`SimulationCluster`] wiring N validators together
//!
//! Unlike a deterministic simulator, validators run on a real tokio runtime
//! with wall-clock timers. Tests assert on eventual outcomes.
//!
//! [`BlockchainEngine`]: strata_production::BlockchainEngine

mod cluster;
mod engine;
mod network;
mod queue;

pub use cluster::{ClusterConfig, ClusterError, SimulatedNode, SimulationCluster};
pub use engine::{compute_block_rid, EngineFaults, MemoryChain, MemoryEngine, ValidatorKeys};
pub use network::{NetworkConfig, SimulatedNetwork};
pub use queue::MemoryTransactionQueue;
