//! Multi-validator harness.
//!
//! Wires N validators together over a [`SimulatedNetwork`], each with its own
//! [`MemoryChain`], transaction queue, block pipeline, intent executor and
//! sync manager running on the current tokio runtime.

use crate::engine::{EngineFaults, MemoryChain, MemoryEngine, ValidatorKeys};
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::queue::MemoryTransactionQueue;
use std::sync::Arc;
use std::time::Duration;
use strata_bft::{
    BaseBlockBuildingStrategy, BftConfig, BftStats, BlockBuildingConfig, Clock, ConfigError,
    RevoltConfig, StatusManager, SystemClock,
};
use strata_production::{
    BlockPipeline, IntentExecutor, MetricsObserver, PipelineConfig, PipelineError,
    ShutdownHandle, SyncConfig, ValidatorSyncManager,
};
use strata_types::{BlockRid, NodeIndex};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Cluster must be started from within a tokio runtime")]
    NoRuntime,
}

/// Configuration for a simulated cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_count: usize,
    pub bft: BftConfig,
    pub sync: SyncConfig,
    pub pipeline: PipelineConfig,
    pub network: NetworkConfig,
    /// Seed for validator keys and peer selection.
    pub seed: u64,
}

impl Default for ClusterConfig {
    /// Four validators with timings scaled down for tests.
    fn default() -> Self {
        let bft = BftConfig::default()
            .with_revolt(RevoltConfig {
                timeout: Duration::from_millis(400),
                exponential_delay_base: Duration::from_millis(100),
                exponential_delay_max: Duration::from_secs(2),
                fast_revolt_status_timeout: None,
            })
            .with_block_building(BlockBuildingConfig {
                max_block_time: Duration::from_millis(100),
                max_tx_delay: Duration::from_millis(50),
                ..BlockBuildingConfig::default()
            });
        let sync = SyncConfig::default()
            .with_tick_interval(Duration::from_millis(10))
            .with_status_resend_interval(Duration::from_millis(200))
            .with_request_resend_interval(Duration::from_millis(200));
        Self {
            node_count: 4,
            bft,
            sync,
            pipeline: PipelineConfig::default(),
            network: NetworkConfig::default(),
            seed: 1,
        }
    }
}

impl ClusterConfig {
    pub fn with_node_count(mut self, node_count: usize) -> Self {
        self.node_count = node_count;
        self
    }

    pub fn with_bft(mut self, bft: BftConfig) -> Self {
        self.bft = bft;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }
}

/// One validator of the cluster.
pub struct SimulatedNode {
    index: NodeIndex,
    executor: IntentExecutor,
    chain: Arc<MemoryChain>,
    queue: Arc<MemoryTransactionQueue>,
    faults: Arc<EngineFaults>,
    shutdown: Option<ShutdownHandle>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedNode {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn executor(&self) -> &IntentExecutor {
        &self.executor
    }

    pub fn chain(&self) -> &Arc<MemoryChain> {
        &self.chain
    }

    pub fn queue(&self) -> &Arc<MemoryTransactionQueue> {
        &self.queue
    }

    pub fn faults(&self) -> &Arc<EngineFaults> {
        &self.faults
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn stats(&self) -> BftStats {
        self.executor.status_manager().lock().stats()
    }

    /// Stop the sync manager and wait for it to shut down the pipeline.
    async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.shutdown();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// N validators wired together.
pub struct SimulationCluster {
    nodes: Vec<SimulatedNode>,
    network: Arc<SimulatedNetwork>,
    keys: Arc<ValidatorKeys>,
}

impl SimulationCluster {
    /// Start all validators on the current tokio runtime.
    pub fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        config.bft.validate()?;
        let runtime = Handle::try_current().map_err(|_| ClusterError::NoRuntime)?;

        let node_count = config.node_count;
        let keys = Arc::new(ValidatorKeys::new(node_count, config.seed));
        let (network, inboxes) = SimulatedNetwork::new(node_count, config.network.clone());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut nodes = Vec::with_capacity(node_count);
        for (index, inbox) in inboxes.into_iter().enumerate() {
            let chain = Arc::new(MemoryChain::new());
            let queue = Arc::new(MemoryTransactionQueue::new());
            let faults = Arc::new(EngineFaults::default());
            let strategy = Arc::new(BaseBlockBuildingStrategy::new(
                config.bft.block_building.clone(),
                queue.clone(),
                Duration::ZERO,
            ));
            let engine = MemoryEngine::new(
                index,
                keys.clone(),
                chain.clone(),
                queue.clone(),
                strategy.clone(),
                clock.clone(),
            )
            .with_faults(faults.clone());
            let pipeline = BlockPipeline::new(
                format!("node-{}", index),
                Box::new(engine),
                config.pipeline.clone(),
            )?;

            let next_height = chain.height() + 1;
            let status = StatusManager::new(node_count, index, next_height, config.bft.clone())
                .with_observer(Arc::new(MetricsObserver::default()))
                .into_shared();
            let executor = IntentExecutor::new(
                status,
                Arc::new(pipeline),
                strategy,
                clock.clone(),
                runtime.clone(),
            );
            let sync = ValidatorSyncManager::new(
                executor.clone(),
                network.transport(index),
                config.sync.clone().with_seed(config.seed.wrapping_add(index as u64)),
            );

            let (shutdown, signal) = ShutdownHandle::channel();
            let task = runtime.spawn(sync.run(inbox, signal));
            nodes.push(SimulatedNode {
                index,
                executor,
                chain,
                queue,
                faults,
                shutdown: Some(shutdown),
                task: Some(task),
            });
        }

        info!(node_count, "Started simulation cluster");
        Ok(Self {
            nodes,
            network,
            keys,
        })
    }

    pub fn node(&self, index: NodeIndex) -> &SimulatedNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[SimulatedNode] {
        &self.nodes
    }

    pub fn network(&self) -> &Arc<SimulatedNetwork> {
        &self.network
    }

    pub fn keys(&self) -> &Arc<ValidatorKeys> {
        &self.keys
    }

    /// Submit a transaction to every validator's queue.
    pub fn submit_transaction(&self, tx: Vec<u8>) {
        for node in &self.nodes {
            node.queue.push(tx.clone());
        }
    }

    /// Committed chain height of every validator.
    pub fn committed_heights(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.chain.height()).collect()
    }

    /// Whether all validators agree on every block they have in common.
    pub fn chains_agree(&self) -> bool {
        let chains: Vec<Vec<BlockRid>> = self.nodes.iter().map(|n| n.chain.block_rids()).collect();
        chains.iter().all(|chain| {
            chains
                .iter()
                .all(|other| chain.iter().zip(other).all(|(a, b)| a == b))
        })
    }

    /// Poll `condition` until it holds or `timeout` passes.
    pub async fn wait_for(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every listed validator has committed at least `height`.
    pub async fn wait_for_height(
        &self,
        nodes: &[NodeIndex],
        height: u64,
        timeout: Duration,
    ) -> bool {
        self.wait_for(timeout, |cluster| {
            nodes.iter().all(|&i| cluster.nodes[i].chain.height() >= height)
        })
        .await
    }

    /// Stop one validator. It goes silent but keeps its chain.
    pub async fn stop_node(&mut self, index: NodeIndex) {
        self.nodes[index].stop().await;
        info!(node = index, "Stopped validator");
    }

    /// Stop all validators.
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            node.stop().await;
        }
    }
}
