//! Shared fixtures for executor and sync tests.

use crate::engine::{BlockBuilder, BlockchainEngine, EngineError};
use crate::executor::IntentExecutor;
use crate::pipeline::{BlockPipeline, PipelineConfig};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_bft::{BftConfig, BlockBuildingStrategy, ManualClock, StatusManager};
use strata_types::{
    BlockData, BlockDataWithWitness, BlockHeader, BlockRid, BlockWitness, NodeIndex, Signature,
};
use tokio::runtime::Handle;

#[derive(Default)]
pub struct TestStrategy {
    pub build: AtomicBool,
    pub failed: AtomicUsize,
    pub committed: AtomicUsize,
    pub force_stop: AtomicBool,
}

impl BlockBuildingStrategy for TestStrategy {
    fn should_build_block(&self, _now: Duration) -> bool {
        self.build.load(Ordering::SeqCst)
    }

    fn must_wait_before_build_block(&self, _now: Duration) -> bool {
        false
    }

    fn should_stop_building_block(&self, _transaction_count: usize) -> bool {
        false
    }

    fn block_committed(&self, _timestamp: Duration) {
        self.committed.fetch_add(1, Ordering::SeqCst);
    }

    fn block_failed(&self, _now: Duration) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn set_force_stop_block_building(&self, value: bool) {
        self.force_stop.store(value, Ordering::SeqCst);
    }

    fn should_force_stop_block_building(&self) -> bool {
        self.force_stop.load(Ordering::SeqCst)
    }
}

/// Committed blocks, shared between the engine and the test.
#[derive(Default)]
pub struct TestChain {
    pub height: AtomicU64,
    pub blocks: Mutex<BTreeMap<u64, BlockData>>,
}

struct TestBuilder {
    block: BlockData,
    signer: u8,
    chain: Arc<TestChain>,
}

impl BlockBuilder for TestBuilder {
    fn height(&self) -> u64 {
        self.block.height()
    }

    fn block_data(&self) -> &BlockData {
        &self.block
    }

    fn my_signature(&self) -> Signature {
        Signature::new(vec![self.signer], self.block.block_rid().as_bytes().to_vec())
    }

    fn apply_signature(&mut self, _signature: &Signature) -> Result<(), EngineError> {
        Ok(())
    }

    fn witness(&self) -> BlockWitness {
        BlockWitness::new(vec![self.my_signature()])
    }

    fn commit(self: Box<Self>, _witness: &BlockWitness) -> Result<(), EngineError> {
        let height = self.block.height();
        self.chain.blocks.lock().insert(height, self.block);
        self.chain.height.store(height, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

pub struct TestEngine {
    signer: u8,
    chain: Arc<TestChain>,
    fail_builds: Arc<AtomicBool>,
}

impl BlockchainEngine for TestEngine {
    fn load_unfinished_block(
        &mut self,
        block: &BlockData,
    ) -> Result<Box<dyn BlockBuilder>, EngineError> {
        Ok(Box::new(TestBuilder {
            block: block.clone(),
            signer: self.signer,
            chain: self.chain.clone(),
        }))
    }

    fn build_block(&mut self) -> Result<Box<dyn BlockBuilder>, EngineError> {
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("disk full".into()));
        }
        let height = self.chain.height.load(Ordering::SeqCst) + 1;
        self.load_unfinished_block(&make_block(height))
    }

    fn block_at_height(
        &self,
        height: u64,
        _include_transactions: bool,
    ) -> Result<Option<BlockDataWithWitness>, EngineError> {
        Ok(self
            .chain
            .blocks
            .lock()
            .get(&height)
            .map(|block| BlockDataWithWitness::new(block.clone(), BlockWitness::default())))
    }

    fn block_signature(&self, block_rid: &BlockRid) -> Result<Option<Signature>, EngineError> {
        let known = self
            .chain
            .blocks
            .lock()
            .values()
            .any(|block| block.block_rid() == *block_rid);
        Ok(known.then(|| Signature::new(vec![self.signer], block_rid.as_bytes().to_vec())))
    }

    fn last_block_height(&self) -> Result<Option<u64>, EngineError> {
        Ok(Some(self.chain.height.load(Ordering::SeqCst)))
    }

    fn retry_taken_transactions(&mut self) {}
}

pub fn make_block(height: u64) -> BlockData {
    BlockData {
        header: BlockHeader {
            block_rid: BlockRid::hash_of(&height.to_le_bytes()),
            prev_block_rid: BlockRid::ZERO,
            height,
            timestamp: 1_000 * height,
        },
        transactions: Vec::new(),
    }
}

pub struct Harness {
    pub executor: IntentExecutor,
    pub strategy: Arc<TestStrategy>,
    pub clock: Arc<ManualClock>,
    pub chain: Arc<TestChain>,
    pub fail_builds: Arc<AtomicBool>,
}

/// Executor over a [`TestEngine`] whose chain holds `my_next_height - 1`
/// blocks. Must be called from within a tokio runtime.
pub fn make_executor(node_count: usize, my_index: NodeIndex, my_next_height: u64) -> Harness {
    let chain = Arc::new(TestChain::default());
    for height in 1..my_next_height {
        chain.blocks.lock().insert(height, make_block(height));
    }
    chain.height.store(my_next_height - 1, Ordering::SeqCst);

    let fail_builds = Arc::new(AtomicBool::new(false));
    let engine = TestEngine {
        signer: my_index as u8,
        chain: chain.clone(),
        fail_builds: fail_builds.clone(),
    };
    let pipeline =
        BlockPipeline::new("test", Box::new(engine), PipelineConfig::default()).unwrap();
    let status =
        StatusManager::new(node_count, my_index, my_next_height, BftConfig::default())
            .into_shared();
    let strategy = Arc::new(TestStrategy::default());
    let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
    let executor = IntentExecutor::new(
        status,
        Arc::new(pipeline),
        strategy.clone(),
        clock.clone(),
        Handle::current(),
    );
    Harness {
        executor,
        strategy,
        clock,
        chain,
        fail_builds,
    }
}

/// Wait until the executor has no operation in flight.
pub async fn settle(executor: &IntentExecutor) {
    for _ in 0..100 {
        executor.wait_for_running_operations().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        if !executor.is_processing() {
            return;
        }
    }
}

/// Poll `condition` every few milliseconds for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
