//! Production metrics using native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Gauge, HistogramVec,
};
use std::sync::OnceLock;
use strata_bft::{BlockIntent, Rejection, StatusObserver, TracingObserver};
use strata_types::{NodeIndex, NodeState};

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for production monitoring.
pub struct Metrics {
    // === Consensus ===
    pub blocks_committed: Counter,
    pub blocks_built: Counter,
    pub blocks_loaded: Counter,
    pub block_height: Gauge,
    pub view_changes: Counter,
    pub revolts_started: Counter,
    pub recompute_limit_hits: Counter,

    // === Pipeline ===
    pub pipeline_failures: CounterVec,
    pub pipeline_job_latency: HistogramVec,
    pub pipeline_queued_blocks: Gauge,

    // === Sync ===
    pub peer_messages_received: CounterVec,
    pub peer_messages_sent: Counter,
    pub invalid_messages_received: Counter,
    pub fast_syncs: Counter,
    pub fast_synced_blocks: Counter,
}

impl Metrics {
    fn new() -> Self {
        // Latency buckets: 1ms to 30s
        let latency_buckets = vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
        ];

        Self {
            // Consensus
            blocks_committed: register_counter!(
                "strata_blocks_committed_total",
                "Total number of blocks committed"
            )
            .unwrap(),

            blocks_built: register_counter!(
                "strata_blocks_built_total",
                "Total number of blocks built as primary"
            )
            .unwrap(),

            blocks_loaded: register_counter!(
                "strata_blocks_loaded_total",
                "Total number of unfinished blocks loaded from the primary"
            )
            .unwrap(),

            block_height: register_gauge!("strata_block_height", "Last committed block height")
                .unwrap(),

            view_changes: register_counter!(
                "strata_view_changes_total",
                "Total number of successful revolts"
            )
            .unwrap(),

            revolts_started: register_counter!(
                "strata_revolts_started_total",
                "Total number of revolts started locally"
            )
            .unwrap(),

            recompute_limit_hits: register_counter!(
                "strata_recompute_limit_hits_total",
                "Status recomputes that ran into the iteration bound"
            )
            .unwrap(),

            // Pipeline
            pipeline_failures: register_counter_vec!(
                "strata_pipeline_failures_total",
                "Failed block pipeline operations",
                &["operation"]
            )
            .unwrap(),

            pipeline_job_latency: register_histogram_vec!(
                "strata_pipeline_job_latency_seconds",
                "Block pipeline job execution time",
                &["operation"],
                latency_buckets
            )
            .unwrap(),

            pipeline_queued_blocks: register_gauge!(
                "strata_pipeline_queued_blocks",
                "Fetched blocks waiting to be added"
            )
            .unwrap(),

            // Sync
            peer_messages_received: register_counter_vec!(
                "strata_peer_messages_received_total",
                "Peer messages received by kind",
                &["kind"]
            )
            .unwrap(),

            peer_messages_sent: register_counter!(
                "strata_peer_messages_sent_total",
                "Peer messages sent"
            )
            .unwrap(),

            invalid_messages_received: register_counter!(
                "strata_invalid_messages_received_total",
                "Peer messages from unknown senders"
            )
            .unwrap(),

            fast_syncs: register_counter!(
                "strata_fast_syncs_total",
                "Switches to fast sync after falling behind"
            )
            .unwrap(),

            fast_synced_blocks: register_counter!(
                "strata_fast_synced_blocks_total",
                "Blocks added during fast sync"
            )
            .unwrap(),
        }
    }
}

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Record a committed block.
pub fn record_block_committed(height: u64) {
    let m = metrics();
    m.blocks_committed.inc();
    m.block_height.set(height as f64);
}

pub fn record_block_built() {
    metrics().blocks_built.inc();
}

pub fn record_block_loaded() {
    metrics().blocks_loaded.inc();
}

/// Record a revolt started by the liveness detector.
pub fn record_revolt_started() {
    metrics().revolts_started.inc();
}

/// Record a failed pipeline operation.
///
/// `operation` must be one of the pipeline's fixed operation names.
pub fn record_pipeline_failure(operation: &'static str) {
    metrics()
        .pipeline_failures
        .with_label_values(&[operation])
        .inc();
}

pub fn record_pipeline_job(operation: &'static str, latency_secs: f64) {
    metrics()
        .pipeline_job_latency
        .with_label_values(&[operation])
        .observe(latency_secs);
}

pub fn set_pipeline_queued_blocks(count: usize) {
    metrics().pipeline_queued_blocks.set(count as f64);
}

/// Record a received peer message. `kind` is the message's fixed kind name.
pub fn record_peer_message_received(kind: &'static str) {
    metrics()
        .peer_messages_received
        .with_label_values(&[kind])
        .inc();
}

pub fn record_peer_message_sent() {
    metrics().peer_messages_sent.inc();
}

pub fn record_invalid_message() {
    metrics().invalid_messages_received.inc();
}

pub fn record_fast_sync_started() {
    metrics().fast_syncs.inc();
}

pub fn record_fast_synced_block() {
    metrics().fast_synced_blocks.inc();
}

/// [`StatusObserver`] that feeds consensus metrics and logs like
/// [`TracingObserver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver {
    log: TracingObserver,
}

impl StatusObserver for MetricsObserver {
    fn intent_changed(&self, from: &BlockIntent, to: &BlockIntent) {
        self.log.intent_changed(from, to);
    }

    fn state_changed(&self, height: u64, from: NodeState, to: NodeState) {
        self.log.state_changed(height, from, to);
    }

    fn round_advanced(&self, height: u64, round: u64) {
        metrics().view_changes.inc();
        self.log.round_advanced(height, round);
    }

    fn height_advanced(&self, height: u64) {
        self.log.height_advanced(height);
    }

    fn revolt_observed(&self, node_index: NodeIndex, primary: NodeIndex, height: u64, round: u64) {
        self.log.revolt_observed(node_index, primary, height, round);
    }

    fn input_rejected(&self, rejection: &Rejection) {
        self.log.input_rejected(rejection);
    }

    fn recompute_limit_reached(&self, iterations: usize) {
        metrics().recompute_limit_hits.inc();
        self.log.recompute_limit_reached(iterations);
    }
}
