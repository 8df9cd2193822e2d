//! In-memory blockchain engine.
//!
//! Stands in for real storage and transaction execution. Blocks are plain
//! transaction lists; signatures are keyed hashes, `blake3(secret || rid)`,
//! with every validator's secret derived from a shared seed.

use crate::queue::MemoryTransactionQueue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata_bft::{BlockBuildingStrategy, Clock};
use strata_production::{BlockBuilder, BlockchainEngine, EngineError};
use strata_types::{
    bft_quorum, BlockData, BlockDataWithWitness, BlockHeader, BlockRid, BlockWitness, NodeIndex,
    Signature,
};
use tracing::{debug, trace};

// ═══════════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════════

/// Signing secrets and public identities of all validators.
#[derive(Debug)]
pub struct ValidatorKeys {
    secrets: Vec<[u8; 32]>,
    public_ids: Vec<Vec<u8>>,
}

impl ValidatorKeys {
    pub fn new(node_count: usize, seed: u64) -> Self {
        let secrets: Vec<[u8; 32]> = (0..node_count as u64)
            .map(|index| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&seed.to_le_bytes());
                hasher.update(&index.to_le_bytes());
                *hasher.finalize().as_bytes()
            })
            .collect();
        let public_ids = secrets
            .iter()
            .map(|secret| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(b"public");
                hasher.update(secret);
                hasher.finalize().as_bytes().to_vec()
            })
            .collect();
        Self {
            secrets,
            public_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn public_id(&self, index: NodeIndex) -> &[u8] {
        &self.public_ids[index]
    }

    pub fn sign(&self, index: NodeIndex, block_rid: &BlockRid) -> Signature {
        Signature::new(
            self.public_ids[index].clone(),
            Self::signature_data(&self.secrets[index], block_rid),
        )
    }

    /// Check `signature` over `block_rid` and return the signer's index.
    pub fn verify(
        &self,
        signature: &Signature,
        block_rid: &BlockRid,
    ) -> Result<NodeIndex, EngineError> {
        let index = self
            .public_ids
            .iter()
            .position(|id| *id == signature.subject_id)
            .ok_or_else(|| EngineError::UnknownSigner(hex_prefix(&signature.subject_id)))?;
        if signature.data != Self::signature_data(&self.secrets[index], block_rid) {
            return Err(EngineError::BadData(format!(
                "invalid signature from validator {} over {}",
                index, block_rid
            )));
        }
        Ok(index)
    }

    fn signature_data(secret: &[u8; 32], block_rid: &BlockRid) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(secret);
        hasher.update(block_rid.as_bytes());
        hasher.finalize().as_bytes().to_vec()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Block reference over the header fields and transactions.
pub fn compute_block_rid(
    prev_block_rid: &BlockRid,
    height: u64,
    timestamp: u64,
    transactions: &[Vec<u8>],
) -> BlockRid {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev_block_rid.as_bytes());
    hasher.update(&height.to_le_bytes());
    hasher.update(&timestamp.to_le_bytes());
    for tx in transactions {
        hasher.update(&(tx.len() as u64).to_le_bytes());
        hasher.update(tx);
    }
    BlockRid::from_raw(*hasher.finalize().as_bytes())
}

// ═══════════════════════════════════════════════════════════════════════════
// Chain
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct ChainInner {
    /// `blocks[i]` is at height `i + 1`.
    blocks: Vec<BlockDataWithWitness>,
    my_signatures: HashMap<BlockRid, Signature>,
}

/// Committed blocks of one validator.
#[derive(Debug, Default)]
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Height of the last committed block, 0 for an empty chain.
    pub fn height(&self) -> u64 {
        self.inner.lock().blocks.len() as u64
    }

    pub fn last_block_rid(&self) -> BlockRid {
        self.inner
            .lock()
            .blocks
            .last()
            .map(BlockDataWithWitness::block_rid)
            .unwrap_or(BlockRid::ZERO)
    }

    pub fn block_at_height(&self, height: u64) -> Option<BlockDataWithWitness> {
        let index = usize::try_from(height.checked_sub(1)?).ok()?;
        self.inner.lock().blocks.get(index).cloned()
    }

    /// Rids of all committed blocks, by height.
    pub fn block_rids(&self) -> Vec<BlockRid> {
        self.inner
            .lock()
            .blocks
            .iter()
            .map(BlockDataWithWitness::block_rid)
            .collect()
    }

    /// All committed transactions, in order.
    pub fn transactions(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .blocks
            .iter()
            .flat_map(|b| b.block.transactions.iter().cloned())
            .collect()
    }

    pub fn my_signature(&self, block_rid: &BlockRid) -> Option<Signature> {
        self.inner.lock().my_signatures.get(block_rid).cloned()
    }

    fn check_extends(&self, header: &BlockHeader) -> Result<(), EngineError> {
        let inner = self.inner.lock();
        let expected_height = inner.blocks.len() as u64 + 1;
        if header.height != expected_height {
            return Err(EngineError::BadData(format!(
                "block height {} does not follow {}",
                header.height,
                expected_height - 1
            )));
        }
        let last = inner
            .blocks
            .last()
            .map(BlockDataWithWitness::block_rid)
            .unwrap_or(BlockRid::ZERO);
        if header.prev_block_rid != last {
            return Err(EngineError::BadData(format!(
                "block {} does not extend {}",
                header.block_rid, last
            )));
        }
        Ok(())
    }

    fn append(
        &self,
        block: BlockData,
        witness: BlockWitness,
        my_signature: Signature,
    ) -> Result<(), EngineError> {
        self.check_extends(&block.header)?;
        let mut inner = self.inner.lock();
        inner.my_signatures.insert(block.block_rid(), my_signature);
        inner.blocks.push(BlockDataWithWitness::new(block, witness));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fault injection
// ═══════════════════════════════════════════════════════════════════════════

/// Counters of upcoming engine operations that should fail.
#[derive(Debug, Default)]
pub struct EngineFaults {
    builds: AtomicUsize,
    loads: AtomicUsize,
}

impl EngineFaults {
    pub fn fail_next_builds(&self, count: usize) {
        self.builds.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_loads(&self, count: usize) {
        self.loads.store(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// [`BlockchainEngine`] over a [`MemoryChain`].
pub struct MemoryEngine {
    my_index: NodeIndex,
    keys: Arc<ValidatorKeys>,
    chain: Arc<MemoryChain>,
    queue: Arc<MemoryTransactionQueue>,
    strategy: Arc<dyn BlockBuildingStrategy>,
    clock: Arc<dyn Clock>,
    faults: Arc<EngineFaults>,
    /// Transactions taken from the queue by the pending built block.
    taken: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: bool,
}

impl MemoryEngine {
    pub fn new(
        my_index: NodeIndex,
        keys: Arc<ValidatorKeys>,
        chain: Arc<MemoryChain>,
        queue: Arc<MemoryTransactionQueue>,
        strategy: Arc<dyn BlockBuildingStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            my_index,
            keys,
            chain,
            queue,
            strategy,
            clock,
            faults: Arc::new(EngineFaults::default()),
            taken: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    pub fn with_faults(mut self, faults: Arc<EngineFaults>) -> Self {
        self.faults = faults;
        self
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::AlreadyClosed);
        }
        Ok(())
    }

    fn builder(&self, block: BlockData) -> Box<dyn BlockBuilder> {
        let my_signature = self.keys.sign(self.my_index, &block.block_rid());
        let mut witness = BTreeMap::new();
        witness.insert(self.my_index, my_signature.clone());
        Box::new(MemoryBlockBuilder {
            block,
            my_signature,
            witness,
            keys: self.keys.clone(),
            chain: self.chain.clone(),
            queue: self.queue.clone(),
            taken: self.taken.clone(),
        })
    }
}

impl BlockchainEngine for MemoryEngine {
    fn load_unfinished_block(
        &mut self,
        block: &BlockData,
    ) -> Result<Box<dyn BlockBuilder>, EngineError> {
        self.ensure_open()?;
        if EngineFaults::take(&self.faults.loads) {
            return Err(EngineError::Storage("injected load failure".into()));
        }

        let header = &block.header;
        self.chain.check_extends(header)?;
        let expected = compute_block_rid(
            &header.prev_block_rid,
            header.height,
            header.timestamp,
            &block.transactions,
        );
        if expected != header.block_rid {
            return Err(EngineError::BadData(format!(
                "block rid {} does not match contents",
                header.block_rid
            )));
        }
        if block.transactions.iter().any(Vec::is_empty) {
            return Err(EngineError::BadData("empty transaction".into()));
        }

        trace!(height = header.height, block_rid = %header.block_rid, "Loaded block");
        Ok(self.builder(block.clone()))
    }

    fn build_block(&mut self) -> Result<Box<dyn BlockBuilder>, EngineError> {
        self.ensure_open()?;
        if EngineFaults::take(&self.faults.builds) {
            return Err(EngineError::Storage("injected build failure".into()));
        }

        let mut transactions = Vec::new();
        while !self.strategy.should_stop_building_block(transactions.len()) {
            if self.strategy.should_force_stop_block_building() {
                self.queue.requeue(transactions);
                return Err(EngineError::ForceStopped);
            }
            match self.queue.pop() {
                Some(tx) => transactions.push(tx),
                None => break,
            }
        }

        let height = self.chain.height() + 1;
        let prev_block_rid = self.chain.last_block_rid();
        let timestamp = self.clock.now_millis();
        let block_rid = compute_block_rid(&prev_block_rid, height, timestamp, &transactions);
        *self.taken.lock() = transactions.clone();

        debug!(height, %block_rid, txs = transactions.len(), "Built block");
        Ok(self.builder(BlockData {
            header: BlockHeader {
                block_rid,
                prev_block_rid,
                height,
                timestamp,
            },
            transactions,
        }))
    }

    fn block_at_height(
        &self,
        height: u64,
        include_transactions: bool,
    ) -> Result<Option<BlockDataWithWitness>, EngineError> {
        self.ensure_open()?;
        Ok(self.chain.block_at_height(height).map(|mut block| {
            if !include_transactions {
                block.block.transactions.clear();
            }
            block
        }))
    }

    fn block_signature(&self, block_rid: &BlockRid) -> Result<Option<Signature>, EngineError> {
        self.ensure_open()?;
        Ok(self.chain.my_signature(block_rid))
    }

    fn last_block_height(&self) -> Result<Option<u64>, EngineError> {
        self.ensure_open()?;
        Ok(Some(self.chain.height()).filter(|h| *h > 0))
    }

    fn retry_taken_transactions(&mut self) {
        let taken = std::mem::take(&mut *self.taken.lock());
        if !taken.is_empty() {
            debug!(count = taken.len(), "Returning taken transactions to the queue");
            self.queue.requeue(taken);
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

struct MemoryBlockBuilder {
    block: BlockData,
    my_signature: Signature,
    witness: BTreeMap<NodeIndex, Signature>,
    keys: Arc<ValidatorKeys>,
    chain: Arc<MemoryChain>,
    queue: Arc<MemoryTransactionQueue>,
    taken: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryBlockBuilder {
    fn check_witness(&self, witness: &BlockWitness) -> Result<(), EngineError> {
        let block_rid = self.block.block_rid();
        let mut signers = Vec::new();
        for signature in &witness.signatures {
            let index = self.keys.verify(signature, &block_rid)?;
            if !signers.contains(&index) {
                signers.push(index);
            }
        }
        let quorum = bft_quorum(self.keys.len());
        if signers.len() < quorum {
            return Err(EngineError::BadData(format!(
                "witness has {} of {} required signatures",
                signers.len(),
                quorum
            )));
        }
        Ok(())
    }
}

impl BlockBuilder for MemoryBlockBuilder {
    fn height(&self) -> u64 {
        self.block.height()
    }

    fn block_data(&self) -> &BlockData {
        &self.block
    }

    fn my_signature(&self) -> Signature {
        self.my_signature.clone()
    }

    fn apply_signature(&mut self, signature: &Signature) -> Result<(), EngineError> {
        let index = self.keys.verify(signature, &self.block.block_rid())?;
        self.witness.insert(index, signature.clone());
        Ok(())
    }

    fn witness(&self) -> BlockWitness {
        BlockWitness::new(self.witness.values().cloned().collect())
    }

    fn commit(self: Box<Self>, witness: &BlockWitness) -> Result<(), EngineError> {
        if let Err(e) = self.check_witness(witness) {
            self.rollback();
            return Err(e);
        }
        let transactions = self.block.transactions.clone();
        if let Err(e) = self
            .chain
            .append(self.block.clone(), witness.clone(), self.my_signature.clone())
        {
            self.rollback();
            return Err(e);
        }
        self.taken.lock().clear();
        self.queue.remove_included(&transactions);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        let taken = std::mem::take(&mut *self.taken.lock());
        if !taken.is_empty() {
            self.queue.requeue(taken);
        }
    }
}
