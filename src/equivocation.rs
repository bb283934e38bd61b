/// Equivocation Detector: flags a proposer that has signed more than one
/// block at the same step, by querying the Block Store for every block at
/// the just-inserted block's step. Aura permits two blocks at the same
/// step to land at different heights, so the lookup is step-indexed
/// rather than height-indexed.
use std::collections::HashMap;

use crate::error::MonitorError;
use crate::store::{BlockStore, StoreTxn};
use crate::types::{Address, Block, ReportEvent};

/// Whatever can answer "every block stored at this step", whether or not
/// it has been committed yet — implemented by both the durable store and
/// an in-flight transaction, so the detector sees blocks inserted earlier
/// in the same still-open cycle.
pub trait BlockLookup {
    fn blocks_by_step(&self, step: u64) -> Result<Vec<Block>, MonitorError>;
}

impl BlockLookup for BlockStore {
    fn blocks_by_step(&self, step: u64) -> Result<Vec<Block>, MonitorError> {
        self.get_blocks_by_step(step)
    }
}

impl<'a> BlockLookup for StoreTxn<'a> {
    fn blocks_by_step(&self, step: u64) -> Result<Vec<Block>, MonitorError> {
        self.get_blocks_by_step(step)
    }
}

pub struct EquivocationDetector {
    /// Last emitted hash-set size per `(step, proposer)`, so growth is
    /// reported once per new distinct hash rather than on every repeat.
    last_emitted_count: HashMap<(u64, Address), usize>,
}

impl EquivocationDetector {
    pub fn new() -> Self {
        Self { last_emitted_count: HashMap::new() }
    }

    /// Rebuilds state from a checkpoint snapshot.
    pub fn restore(records: Vec<(u64, Address, usize)>) -> Self {
        let last_emitted_count = records.into_iter().map(|(step, proposer, count)| ((step, proposer), count)).collect();
        Self { last_emitted_count }
    }

    /// Snapshot suitable for persisting in a checkpoint.
    pub fn snapshot(&self) -> Vec<(u64, Address, usize)> {
        self.last_emitted_count.iter().map(|((step, proposer), count)| (*step, *proposer, *count)).collect()
    }

    pub fn on_block<L: BlockLookup>(&mut self, block: &Block, lookup: &L) -> Result<Vec<ReportEvent>, MonitorError> {
        let siblings: Vec<Block> = lookup
            .blocks_by_step(block.step)?
            .into_iter()
            .filter(|b| b.proposer == block.proposer)
            .collect();

        let count = siblings.len();
        if count < 2 {
            return Ok(Vec::new());
        }

        let key = (block.step, block.proposer);
        let last = *self.last_emitted_count.get(&key).unwrap_or(&0);
        if count <= last {
            return Ok(Vec::new());
        }
        self.last_emitted_count.insert(key, count);
        Ok(vec![ReportEvent::Equivocation { proposer: block.proposer, step: block.step, blocks: siblings }])
    }
}

impl Default for EquivocationDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHash;
    use tempfile::TempDir;

    fn block(hash_byte: u8, height: u64, step: u64, proposer: Address) -> Block {
        Block {
            hash: BlockHash([hash_byte; 32]),
            parent_hash: BlockHash([0; 32]),
            height,
            step,
            timestamp: step * 5,
            signature: [0u8; 65],
            proposer,
            header_rlp: Vec::new(),
        }
    }

    #[test]
    fn no_event_for_single_block_per_step() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let b = block(1, 10, 77, Address([9; 20]));
        let mut txn = store.begin();
        let branch = txn.new_branch_id().unwrap();
        txn.insert_block(&b, branch).unwrap();
        txn.commit().unwrap();

        let mut detector = EquivocationDetector::new();
        let events = detector.on_block(&b, &store).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn emits_once_when_second_block_appears() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let proposer = Address([9; 20]);
        let a = block(1, 77, 77, proposer);
        let b = block(2, 77, 77, proposer);

        let mut txn = store.begin();
        let branch_a = txn.new_branch_id().unwrap();
        txn.insert_block(&a, branch_a).unwrap();
        txn.commit().unwrap();

        let mut detector = EquivocationDetector::new();
        assert!(detector.on_block(&a, &store).unwrap().is_empty());

        let mut txn = store.begin();
        let branch_b = txn.new_branch_id().unwrap();
        txn.insert_block(&b, branch_b).unwrap();
        txn.commit().unwrap();

        let events = detector.on_block(&b, &store).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReportEvent::Equivocation { blocks, .. } => assert_eq!(blocks.len(), 2),
            _ => panic!("wrong event"),
        }

        // A third call with no new block must not re-emit.
        let events_again = detector.on_block(&b, &store).unwrap();
        assert!(events_again.is_empty());
    }

    #[test]
    fn detects_equivocation_across_different_heights_at_the_same_step() {
        // Aura allows two blocks at the same step but different heights;
        // the detector must key off step, not height.
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let proposer = Address([5; 20]);
        let a = block(1, 100, 77, proposer);
        let b = block(2, 101, 77, proposer);
        assert_ne!(a.height, b.height);
        assert_eq!(a.step, b.step);

        let mut txn = store.begin();
        let branch_a = txn.new_branch_id().unwrap();
        let branch_b = txn.new_branch_id().unwrap();
        txn.insert_block(&a, branch_a).unwrap();
        txn.insert_block(&b, branch_b).unwrap();
        txn.commit().unwrap();

        let mut detector = EquivocationDetector::new();
        let events = detector.on_block(&b, &store).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReportEvent::Equivocation { blocks, step, .. } => {
                assert_eq!(*step, 77);
                assert_eq!(blocks.len(), 2);
            }
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn sees_sibling_inserted_earlier_in_the_same_uncommitted_transaction() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let proposer = Address([3; 20]);
        let a = block(1, 50, 42, proposer);
        let b = block(2, 50, 42, proposer);

        let mut txn = store.begin();
        let branch_a = txn.new_branch_id().unwrap();
        let branch_b = txn.new_branch_id().unwrap();
        txn.insert_block(&a, branch_a).unwrap();
        txn.insert_block(&b, branch_b).unwrap();

        let mut detector = EquivocationDetector::new();
        let events = detector.on_block(&b, &txn).unwrap();
        assert_eq!(events.len(), 1);
    }
}
