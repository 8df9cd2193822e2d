//! Async side of the consensus core.
//!
//! This crate wraps the synchronous status state machine with real I/O:
//!
//! - Block database operations on a dedicated pipeline thread
//! - Intent execution with completions on the tokio runtime
//! - Peer message handling, status gossip and revolts via the sync manager
//! - Prometheus metrics and `tracing` setup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Validator                                    │
//! │                                                                         │
//! │  tokio task: ValidatorSyncManager                                       │
//! │    └─ loop { select!(shutdown, inbound message, tick) }                 │
//! │                                │                                        │
//! │                                ▼                                        │
//! │  IntentExecutor ──── lock ───► StatusManager (Arc<Mutex<_>>)            │
//! │        │                                                                │
//! │        │ submit (one in flight)                                         │
//! │        ▼                                                                │
//! │  BlockPipeline thread "{node}-block-pipeline"                           │
//! │    └─ FIFO jobs against the BlockchainEngine                            │
//! │        │                                                                │
//! │        └─ PipelineFuture ──► completion task re-locks and pumps         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The status manager lock is the only lock held while deciding what to do.
//! Block I/O never runs under it.

mod engine;
mod executor;
mod messages;
pub mod metrics;
mod pipeline;
mod sync;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use engine::{BlockBuilder, BlockchainEngine, EngineError};
pub use executor::IntentExecutor;
pub use messages::{PeerMessage, PeerTransport};
pub use metrics::MetricsObserver;
pub use pipeline::{BlockPipeline, PipelineConfig, PipelineError, PipelineFuture};
pub use sync::{InboundMessages, ShutdownHandle, SyncConfig, ValidatorSyncManager};
pub use telemetry::{gather_metrics, init_telemetry, TelemetryConfig, TelemetryError};
