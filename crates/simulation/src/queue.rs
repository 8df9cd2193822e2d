//! In-memory transaction queue.

use parking_lot::Mutex;
use std::collections::VecDeque;
use strata_bft::TransactionQueue;

/// FIFO of raw transactions waiting for a block.
#[derive(Debug, Default)]
pub struct MemoryTransactionQueue {
    txs: Mutex<VecDeque<Vec<u8>>>,
}

impl MemoryTransactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tx: Vec<u8>) {
        self.txs.lock().push_back(tx);
    }

    /// Remove and return the next transaction.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.txs.lock().pop_front()
    }

    /// Put transactions taken by an abandoned block back at the front, in
    /// their original order.
    pub fn requeue(&self, txs: Vec<Vec<u8>>) {
        let mut queue = self.txs.lock();
        for tx in txs.into_iter().rev() {
            queue.push_front(tx);
        }
    }

    /// Drop transactions that were included in a committed block.
    pub fn remove_included(&self, included: &[Vec<u8>]) {
        if included.is_empty() {
            return;
        }
        self.txs.lock().retain(|tx| !included.contains(tx));
    }

    pub fn len(&self) -> usize {
        self.txs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.lock().is_empty()
    }
}

impl TransactionQueue for MemoryTransactionQueue {
    fn queue_size(&self) -> usize {
        self.len()
    }
}
