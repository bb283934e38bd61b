/// Block Fetcher: head tracking, branch discovery, bounded reorg
/// resolution, in-order delivery to registered observers.
use crate::constants;
use crate::error::MonitorError;
use crate::rpc::RpcClient;
use crate::store::StoreTxn;
use crate::types::{Block, BlockHash, BranchId};

/// A reporter's `on_block` capability, composed by the App Controller at
/// startup. No runtime graph of listeners beyond this fixed list is
/// needed. `txn` is the cycle's single open transaction, staging writes
/// that have not yet been committed but are visible to its own reads.
pub trait BlockObserver {
    fn on_block(&mut self, block: &Block, txn: &mut StoreTxn) -> Result<(), MonitorError>;
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub head_height: u64,
    pub remote_height: u64,
    pub fraction: f64,
    pub syncing: bool,
}

pub struct BlockFetcher {
    head: Option<Block>,
    current_branch_id: Option<BranchId>,
    start_height: Option<u64>,
}

impl BlockFetcher {
    pub fn new() -> Self {
        Self { head: None, current_branch_id: None, start_height: None }
    }

    /// Restores fetcher state from a checkpoint.
    pub fn restore(head: Option<Block>, branch_id: Option<BranchId>, start_height: Option<u64>) -> Self {
        Self { head, current_branch_id: branch_id, start_height }
    }

    pub fn head(&self) -> Option<&Block> {
        self.head.as_ref()
    }

    pub fn current_branch_id(&self) -> Option<BranchId> {
        self.current_branch_id
    }

    pub fn sync_status(&self, remote_height: u64) -> SyncStatus {
        let head_height = self.head.as_ref().map(|b| b.height).unwrap_or(0);
        let start = self.start_height.unwrap_or(head_height);
        let denom = (remote_height.saturating_sub(start)).max(1) as f64;
        let numer = head_height.saturating_sub(start) as f64;
        SyncStatus {
            head_height,
            remote_height,
            fraction: (numer / denom).min(1.0),
            syncing: remote_height > head_height,
        }
    }

    /// Resolves the configured `sync_from` token against the remote head.
    pub fn resolve_initial_height(sync_from: &str, remote_height: u64) -> Result<u64, MonitorError> {
        match sync_from {
            "latest" => Ok(remote_height),
            "earliest" => Ok(0),
            other => {
                let offset: i64 = other
                    .parse()
                    .map_err(|_| MonitorError::InvalidData(format!("invalid --sync-from value {other}")))?;
                if offset < 0 {
                    Ok(remote_height.saturating_sub(offset.unsigned_abs()))
                } else {
                    Ok(offset as u64)
                }
            }
        }
    }

    /// Advances the canonical chain, emitting each newly canonical block
    /// to `observers` in order, and returns how many blocks were emitted.
    /// Stops at `max_count` emissions, at `head.height >= max_height`, or
    /// when the remote head has been reached with nothing further
    /// available. Every insert (including branch allocation) is staged
    /// into `txn`; the caller commits once, after the whole cycle
    /// (fetch, report, checkpoint) has succeeded.
    pub fn fetch_and_insert_new_blocks(
        &mut self,
        rpc: &RpcClient,
        txn: &mut StoreTxn,
        sync_from: &str,
        max_count: usize,
        max_height: u64,
        observers: &mut [&mut dyn BlockObserver],
    ) -> Result<usize, MonitorError> {
        let remote_height = rpc.block_number()?;

        if self.head.is_none() {
            let initial_height = Self::resolve_initial_height(sync_from, remote_height)?;
            let block = rpc
                .get_block_by_height(initial_height)?
                .ok_or_else(|| MonitorError::Transient(format!("initial block {initial_height} not available")))?;
            let branch = txn.new_branch_id()?;
            txn.insert_block(&block, branch)?;
            self.start_height = Some(block.height);
            self.current_branch_id = Some(branch);
            self.head = Some(block);
        }

        let mut emitted = 0usize;
        loop {
            if emitted >= max_count {
                break;
            }
            let head = self.head.as_ref().expect("head set above");
            if head.height >= max_height {
                break;
            }
            let next_height = head.height + 1;
            if next_height > remote_height {
                break;
            }
            let candidate = match rpc.get_block_by_height(next_height)? {
                Some(b) => b,
                None => break,
            };

            if candidate.parent_hash == head.hash {
                let branch = self.current_branch_id.expect("branch set with head");
                txn.insert_block(&candidate, branch)?;
                self.head = Some(candidate.clone());
                for observer in observers.iter_mut() {
                    observer.on_block(&candidate, txn)?;
                }
                emitted += 1;
            } else {
                let path = self.resolve_reorg(rpc, txn, candidate)?;
                let new_branch = txn.new_branch_id()?;
                for block in &path {
                    txn.insert_block(block, new_branch)?;
                }
                self.current_branch_id = Some(new_branch);
                for block in &path {
                    self.head = Some(block.clone());
                    for observer in observers.iter_mut() {
                        observer.on_block(block, txn)?;
                    }
                    emitted += 1;
                    if emitted >= max_count {
                        break;
                    }
                }
            }
        }
        Ok(emitted)
    }

    /// Walks back from `new_tip` and from the current head in lockstep
    /// until a common ancestor is found, returning the new branch's
    /// blocks from the ancestor's child up to `new_tip`, ascending.
    fn resolve_reorg(
        &self,
        rpc: &RpcClient,
        txn: &StoreTxn,
        new_tip: Block,
    ) -> Result<Vec<Block>, MonitorError> {
        let head = self.head.clone().expect("reorg only reachable with a head");

        let mut new_chain_desc = vec![new_tip.clone()];
        let mut new_cursor_parent: BlockHash = new_tip.parent_hash;
        let mut old_cursor: BlockHash = head.hash;
        let mut depth = 0u64;

        loop {
            if new_cursor_parent == old_cursor {
                break;
            }
            depth += 1;
            if depth > constants::MAX_REORG_DEPTH {
                return Err(MonitorError::ReorgTooDeep(format!(
                    "no common ancestor within {} blocks",
                    constants::MAX_REORG_DEPTH
                )));
            }
            let new_block = rpc
                .get_block_by_hash(&new_cursor_parent)?
                .ok_or_else(|| MonitorError::ReorgTooDeep("fork ancestor unavailable from RPC".into()))?;
            let old_block = txn
                .get_block(&old_cursor)?
                .ok_or_else(|| MonitorError::ReorgTooDeep("old chain ancestor missing from store".into()))?;

            new_cursor_parent = new_block.parent_hash;
            old_cursor = old_block.parent_hash;
            new_chain_desc.push(new_block);
        }

        new_chain_desc.reverse();
        Ok(new_chain_desc)
    }
}

impl Default for BlockFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_latest_and_earliest() {
        assert_eq!(BlockFetcher::resolve_initial_height("latest", 100).unwrap(), 100);
        assert_eq!(BlockFetcher::resolve_initial_height("earliest", 100).unwrap(), 0);
    }

    #[test]
    fn resolves_negative_offset_from_remote_head() {
        assert_eq!(BlockFetcher::resolve_initial_height("-1000", 5000).unwrap(), 4000);
    }

    #[test]
    fn resolves_absolute_height() {
        assert_eq!(BlockFetcher::resolve_initial_height("42", 5000).unwrap(), 42);
    }

    #[test]
    fn sync_status_reports_fully_synced() {
        let fetcher = BlockFetcher::restore(
            Some(super::blocks_test_support::block_at(100)),
            Some(BranchId(0)),
            Some(0),
        );
        let status = fetcher.sync_status(100);
        assert!(!status.syncing);
        assert_eq!(status.fraction, 1.0);
    }
}

#[cfg(test)]
pub mod blocks_test_support {
    use crate::types::{Address, Block, BlockHash};

    pub fn block_at(height: u64) -> Block {
        Block {
            hash: BlockHash([height as u8; 32]),
            parent_hash: BlockHash([height.saturating_sub(1) as u8; 32]),
            height,
            step: height,
            timestamp: height * 5,
            signature: [0u8; 65],
            proposer: Address([0u8; 20]),
            header_rlp: Vec::new(),
        }
    }
}
