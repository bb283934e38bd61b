/// Durable block store: canonical blocks, branch tips, and the checkpoint
/// blob, backed by RocksDB.
///
/// All mutations within one fetch cycle are staged into a `StoreTxn` and
/// committed with a single `rocksdb::WriteBatch`, following the
/// all-or-nothing commit shape used elsewhere in this codebase for
/// multi-column-family writes, kept synchronous here since the core
/// pipeline has no internal concurrency to hand writes off to.
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::MonitorError;
use crate::types::{Address, Block, BlockHash, BranchId};

const CF_BLOCKS: &str = "blocks";
const CF_BLOCKS_BY_HEIGHT: &str = "blocks_by_height";
const CF_BLOCKS_BY_STEP: &str = "blocks_by_step";
const CF_BRANCH_TIPS: &str = "branch_tips";
const CF_META: &str = "meta";

/// Subdirectory of `--db-dir` the RocksDB store actually lives in.
pub const DB_FILE_NAME: &str = "tlbc-monitor.db";

const KEY_CHECKPOINT: &[u8] = b"checkpoint";
const KEY_NEXT_BRANCH_ID: &[u8] = b"next_branch_id";

#[derive(Serialize, Deserialize)]
struct StoredBlock {
    hash: [u8; 32],
    parent_hash: [u8; 32],
    height: u64,
    step: u64,
    timestamp: u64,
    signature: Vec<u8>,
    proposer: [u8; 20],
    header_rlp: Vec<u8>,
    branch_id: u64,
}

impl From<(&Block, BranchId)> for StoredBlock {
    fn from((b, branch): (&Block, BranchId)) -> Self {
        StoredBlock {
            hash: b.hash.0,
            parent_hash: b.parent_hash.0,
            height: b.height,
            step: b.step,
            timestamp: b.timestamp,
            signature: b.signature.to_vec(),
            proposer: b.proposer.0,
            header_rlp: b.header_rlp.clone(),
            branch_id: branch.0,
        }
    }
}

impl StoredBlock {
    fn into_block(self) -> Result<(Block, BranchId), MonitorError> {
        if self.signature.len() != 65 {
            return Err(MonitorError::InvalidData("stored signature wrong length".into()));
        }
        let mut signature = [0u8; 65];
        signature.copy_from_slice(&self.signature);
        Ok((
            Block {
                hash: BlockHash(self.hash),
                parent_hash: BlockHash(self.parent_hash),
                height: self.height,
                step: self.step,
                timestamp: self.timestamp,
                signature,
                proposer: Address(self.proposer),
                header_rlp: self.header_rlp,
            },
            BranchId(self.branch_id),
        ))
    }
}

pub struct BlockStore {
    db: Arc<DB>,
}

/// Stages writes for one fetch cycle. Nothing is visible to readers of
/// `BlockStore` until `commit` is called. Blocks inserted earlier in the
/// same still-open transaction remain visible to `get_block`/
/// `get_blocks_by_height`/`get_blocks_by_step` on this `StoreTxn` through
/// an in-memory overlay, since a `rocksdb::WriteBatch`'s writes are not
/// themselves readable until committed.
pub struct StoreTxn<'a> {
    store: &'a BlockStore,
    batch: rocksdb::WriteBatch,
    pending_blocks: Vec<(Block, BranchId)>,
    pending_next_branch_id: Option<u64>,
}

impl BlockStore {
    pub fn open(path: &Path) -> Result<Self, MonitorError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_BLOCKS, CF_BLOCKS_BY_HEIGHT, CF_BLOCKS_BY_STEP, CF_BRANCH_TIPS, CF_META]
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cfs)
            .map_err(|e| MonitorError::InvalidData(format!("opening block store: {e}")))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Opens the store without the ability to create or mutate it, for
    /// diagnostic/validation tools that must never write to the store
    /// they're auditing.
    pub fn open_read_only(path: &Path) -> Result<Self, MonitorError> {
        let opts = Options::default();
        let cfs = [CF_BLOCKS, CF_BLOCKS_BY_HEIGHT, CF_BLOCKS_BY_STEP, CF_BRANCH_TIPS, CF_META];
        let db = DB::open_cf_for_read_only(&opts, path, cfs, false)
            .map_err(|e| MonitorError::InvalidData(format!("opening block store read-only: {e}")))?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn begin(&self) -> StoreTxn<'_> {
        StoreTxn {
            store: self,
            batch: rocksdb::WriteBatch::default(),
            pending_blocks: Vec::new(),
            pending_next_branch_id: None,
        }
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, MonitorError> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(&cf, hash.0)? {
            Some(bytes) => {
                let stored: StoredBlock = bincode::deserialize(&bytes)
                    .map_err(|e| MonitorError::InvalidData(format!("corrupt block record: {e}")))?;
                Ok(Some(stored.into_block()?.0))
            }
            None => Ok(None),
        }
    }

    /// All blocks stored at `height`, across all branches — the basis for
    /// equivocation detection.
    pub fn get_blocks_by_height(&self, height: u64) -> Result<Vec<Block>, MonitorError> {
        let cf = self.cf(CF_BLOCKS_BY_HEIGHT)?;
        let hashes: Vec<[u8; 32]> = match self.db.get_cf(&cf, height.to_be_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| MonitorError::InvalidData(format!("corrupt height index: {e}")))?,
            None => Vec::new(),
        };
        hashes
            .into_iter()
            .map(|h| {
                self.get_block(&BlockHash(h))?
                    .ok_or_else(|| MonitorError::InvalidData("height index points at missing block".into()))
            })
            .collect()
    }

    /// All blocks stored at `step`, across all heights and branches —
    /// Aura allows two blocks at the same step but different heights, so
    /// equivocation detection keys off this rather than the height index.
    pub fn get_blocks_by_step(&self, step: u64) -> Result<Vec<Block>, MonitorError> {
        let cf = self.cf(CF_BLOCKS_BY_STEP)?;
        let hashes: Vec<[u8; 32]> = match self.db.get_cf(&cf, step.to_be_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| MonitorError::InvalidData(format!("corrupt step index: {e}")))?,
            None => Vec::new(),
        };
        hashes
            .into_iter()
            .map(|h| {
                self.get_block(&BlockHash(h))?
                    .ok_or_else(|| MonitorError::InvalidData("step index points at missing block".into()))
            })
            .collect()
    }

    pub fn get_branch_tip(&self, branch: BranchId) -> Result<Option<BlockHash>, MonitorError> {
        let cf = self.cf(CF_BRANCH_TIPS)?;
        match self.db.get_cf(&cf, branch.0.to_be_bytes())? {
            Some(bytes) if bytes.len() == 32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                Ok(Some(BlockHash(h)))
            }
            Some(_) => Err(MonitorError::InvalidData("corrupt branch tip record".into())),
            None => Ok(None),
        }
    }

    /// Current value of the branch counter, ignoring any not-yet-committed
    /// allocation staged in an open `StoreTxn`. Branch allocation itself
    /// happens through `StoreTxn::new_branch_id` so it lands in the same
    /// atomic commit as the blocks it tags.
    fn next_branch_id(&self) -> Result<u64, MonitorError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, KEY_NEXT_BRANCH_ID)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(b))
            }
            Some(_) => Err(MonitorError::InvalidData("corrupt branch counter".into())),
            None => Ok(0),
        }
    }

    pub fn load_checkpoint(&self) -> Result<Option<Vec<u8>>, MonitorError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, KEY_CHECKPOINT)?)
    }

    /// Highest height with at least one stored block, for diagnostics.
    pub fn highest_stored_height(&self) -> Result<Option<u64>, MonitorError> {
        let cf = self.cf(CF_BLOCKS_BY_HEIGHT)?;
        let mut iter = self.db.iterator_cf(&cf, rocksdb::IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item.map_err(|e| MonitorError::InvalidData(e.to_string()))?;
                if key.len() != 8 {
                    return Err(MonitorError::InvalidData("corrupt height index key".into()));
                }
                let mut h = [0u8; 8];
                h.copy_from_slice(&key);
                Ok(Some(u64::from_be_bytes(h)))
            }
            None => Ok(None),
        }
    }

    /// Drops all stored blocks, height-index, and step-index entries
    /// below `height`. Branch tip and checkpoint records are left
    /// untouched; pruning is a best-effort space reclaim, not part of
    /// the invariants the checkpoint depends on.
    pub fn prune_below(&self, height: u64) -> Result<(), MonitorError> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let height_cf = self.cf(CF_BLOCKS_BY_HEIGHT)?;
        let step_cf = self.cf(CF_BLOCKS_BY_STEP)?;
        let mut batch = rocksdb::WriteBatch::default();
        let iter = self.db.iterator_cf(&height_cf, rocksdb::IteratorMode::Start);
        for item in iter {
            let (key, value) = item.map_err(|e| MonitorError::InvalidData(e.to_string()))?;
            if key.len() != 8 {
                continue;
            }
            let mut h = [0u8; 8];
            h.copy_from_slice(&key);
            if u64::from_be_bytes(h) >= height {
                continue;
            }
            let hashes: Vec<[u8; 32]> = bincode::deserialize(&value)
                .map_err(|e| MonitorError::InvalidData(format!("corrupt height index: {e}")))?;
            for hash in hashes {
                if let Some(block) = self.get_block(&BlockHash(hash))? {
                    let mut by_step = self
                        .get_blocks_by_step(block.step)?
                        .into_iter()
                        .map(|b| b.hash.0)
                        .collect::<Vec<_>>();
                    by_step.retain(|h| *h != hash);
                    if by_step.is_empty() {
                        batch.delete_cf(&step_cf, block.step.to_be_bytes());
                    } else {
                        let encoded = bincode::serialize(&by_step)
                            .map_err(|e| MonitorError::InvalidData(format!("serializing step index: {e}")))?;
                        batch.put_cf(&step_cf, block.step.to_be_bytes(), encoded);
                    }
                }
                batch.delete_cf(&blocks_cf, hash);
            }
            batch.delete_cf(&height_cf, key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, MonitorError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| MonitorError::InvalidData(format!("missing column family {name}")))
    }
}

impl<'a> StoreTxn<'a> {
    /// Read-only access to the committed store, for callers that only
    /// need data from prior, already-committed cycles (e.g. walking the
    /// old chain during a reorg).
    pub fn store(&self) -> &'a BlockStore {
        self.store
    }

    /// Like `BlockStore::get_block`, but also sees blocks inserted
    /// earlier in this same, still-uncommitted transaction.
    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, MonitorError> {
        if let Some((block, _)) = self.pending_blocks.iter().find(|(b, _)| b.hash == *hash) {
            return Ok(Some(block.clone()));
        }
        self.store.get_block(hash)
    }

    /// Like `BlockStore::get_blocks_by_height`, merged with this
    /// transaction's not-yet-committed inserts.
    pub fn get_blocks_by_height(&self, height: u64) -> Result<Vec<Block>, MonitorError> {
        let mut out = self.store.get_blocks_by_height(height)?;
        for (block, _) in &self.pending_blocks {
            if block.height == height && !out.iter().any(|b| b.hash == block.hash) {
                out.push(block.clone());
            }
        }
        Ok(out)
    }

    /// Like `BlockStore::get_blocks_by_step`, merged with this
    /// transaction's not-yet-committed inserts.
    pub fn get_blocks_by_step(&self, step: u64) -> Result<Vec<Block>, MonitorError> {
        let mut out = self.store.get_blocks_by_step(step)?;
        for (block, _) in &self.pending_blocks {
            if block.step == step && !out.iter().any(|b| b.hash == block.hash) {
                out.push(block.clone());
            }
        }
        Ok(out)
    }

    /// Allocates the next branch id, staging the counter write into this
    /// transaction's batch so it lands atomically with the blocks it
    /// tags rather than as a separate, out-of-band write.
    pub fn new_branch_id(&mut self) -> Result<BranchId, MonitorError> {
        let current = match self.pending_next_branch_id {
            Some(v) => v,
            None => self.store.next_branch_id()?,
        };
        let cf = self.store.cf(CF_META)?;
        self.batch.put_cf(&cf, KEY_NEXT_BRANCH_ID, (current + 1).to_be_bytes());
        self.pending_next_branch_id = Some(current + 1);
        Ok(BranchId(current))
    }

    /// Inserts `block` on `branch`, advancing that branch's tip record.
    /// Idempotent: inserting an already-stored hash overwrites it with an
    /// identical record and leaves the height/step indexes deduplicated.
    pub fn insert_block(&mut self, block: &Block, branch: BranchId) -> Result<(), MonitorError> {
        let stored = StoredBlock::from((block, branch));
        let bytes = bincode::serialize(&stored)
            .map_err(|e| MonitorError::InvalidData(format!("serializing block: {e}")))?;
        let blocks_cf = self.store.cf(CF_BLOCKS)?;
        self.batch.put_cf(&blocks_cf, block.hash.0, bytes);

        let height_cf = self.store.cf(CF_BLOCKS_BY_HEIGHT)?;
        let mut by_height = self.get_blocks_by_height(block.height)?
            .into_iter()
            .map(|b| b.hash.0)
            .collect::<Vec<_>>();
        if !by_height.contains(&block.hash.0) {
            by_height.push(block.hash.0);
        }
        let encoded = bincode::serialize(&by_height)
            .map_err(|e| MonitorError::InvalidData(format!("serializing height index: {e}")))?;
        self.batch.put_cf(&height_cf, block.height.to_be_bytes(), encoded);

        let step_cf = self.store.cf(CF_BLOCKS_BY_STEP)?;
        let mut by_step = self.get_blocks_by_step(block.step)?
            .into_iter()
            .map(|b| b.hash.0)
            .collect::<Vec<_>>();
        if !by_step.contains(&block.hash.0) {
            by_step.push(block.hash.0);
        }
        let encoded = bincode::serialize(&by_step)
            .map_err(|e| MonitorError::InvalidData(format!("serializing step index: {e}")))?;
        self.batch.put_cf(&step_cf, block.step.to_be_bytes(), encoded);

        let tips_cf = self.store.cf(CF_BRANCH_TIPS)?;
        self.batch.put_cf(&tips_cf, branch.0.to_be_bytes(), block.hash.0);

        self.pending_blocks.push((block.clone(), branch));
        Ok(())
    }

    pub fn save_checkpoint(&mut self, bytes: Vec<u8>) -> Result<(), MonitorError> {
        let cf = self.store.cf(CF_META)?;
        self.batch.put_cf(&cf, KEY_CHECKPOINT, bytes);
        Ok(())
    }

    /// Commits every staged write as a single atomic `WriteBatch`. Either
    /// every operation lands, or (on error) none do.
    pub fn commit(self) -> Result<(), MonitorError> {
        self.store.db.write(self.batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_block(height: u64, hash_byte: u8, parent_byte: u8) -> Block {
        Block {
            hash: BlockHash([hash_byte; 32]),
            parent_hash: BlockHash([parent_byte; 32]),
            height,
            step: height * 2,
            timestamp: height * 10,
            signature: [0u8; 65],
            proposer: Address([1u8; 20]),
            header_rlp: vec![0xaa, 0xbb],
        }
    }

    #[test]
    fn insert_and_get_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let block = sample_block(1, 0x11, 0x00);

        let mut txn = store.begin();
        let branch = txn.new_branch_id().unwrap();
        txn.insert_block(&block, branch).unwrap();
        txn.commit().unwrap();

        let fetched = store.get_block(&block.hash).unwrap().unwrap();
        assert_eq!(fetched.height, 1);
        assert_eq!(store.get_branch_tip(branch).unwrap(), Some(block.hash));
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let block = sample_block(1, 0x22, 0x00);

        let mut branch = BranchId(0);
        for _ in 0..2 {
            let mut txn = store.begin();
            branch = txn.new_branch_id().unwrap();
            txn.insert_block(&block, branch).unwrap();
            txn.commit().unwrap();
        }
        let _ = branch;

        let at_height = store.get_blocks_by_height(1).unwrap();
        assert_eq!(at_height.len(), 1);
    }

    #[test]
    fn multiple_blocks_same_height_are_both_kept() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let a = sample_block(5, 0x01, 0x00);
        let b = sample_block(5, 0x02, 0x00);

        let mut txn = store.begin();
        let branch_a = txn.new_branch_id().unwrap();
        let branch_b = txn.new_branch_id().unwrap();
        txn.insert_block(&a, branch_a).unwrap();
        txn.insert_block(&b, branch_b).unwrap();
        txn.commit().unwrap();

        let at_height = store.get_blocks_by_height(5).unwrap();
        assert_eq!(at_height.len(), 2);
    }

    #[test]
    fn branch_ids_never_repeat() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let mut txn = store.begin();
        let a = txn.new_branch_id().unwrap();
        let b = txn.new_branch_id().unwrap();
        txn.commit().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn branch_id_allocation_is_not_visible_until_commit() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let mut txn = store.begin();
        let first = txn.new_branch_id().unwrap();
        drop(txn);

        // Dropping the transaction without committing must not advance
        // the durable counter.
        let mut txn = store.begin();
        let second = txn.new_branch_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn get_blocks_by_step_sees_uncommitted_inserts_in_same_transaction() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let block = sample_block(9, 0x33, 0x00);

        let mut txn = store.begin();
        let branch = txn.new_branch_id().unwrap();
        txn.insert_block(&block, branch).unwrap();

        // Not committed yet: invisible to the plain store, visible
        // through the open transaction.
        assert!(store.get_blocks_by_step(block.step).unwrap().is_empty());
        assert_eq!(txn.get_blocks_by_step(block.step).unwrap().len(), 1);

        txn.commit().unwrap();
        assert_eq!(store.get_blocks_by_step(block.step).unwrap().len(), 1);
    }

    #[test]
    fn checkpoint_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());

        let mut txn = store.begin();
        txn.save_checkpoint(vec![1, 2, 3]).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.load_checkpoint().unwrap(), Some(vec![1, 2, 3]));
    }
}
