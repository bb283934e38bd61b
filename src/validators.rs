/// Primary Oracle (step -> expected proposer) and epoch discovery.
use crate::chain_spec::range_for_height;
use crate::error::MonitorError;
use crate::rpc::RpcClient;
use crate::types::{Address, Epoch, ValidatorRange, ValidatorSource};

/// Holds an ordered list of epochs and a `max_height` watermark; bounds
/// every lookup so the oracle never answers for a height beyond what its
/// epochs actually cover.
#[derive(Debug, Default)]
pub struct PrimaryOracle {
    epochs: Vec<Epoch>,
    max_height: u64,
}

impl PrimaryOracle {
    pub fn new() -> Self {
        Self { epochs: Vec::new(), max_height: 0 }
    }

    /// Appends a new epoch. Panics if `start_height` does not strictly
    /// exceed the previous epoch's, mirroring the append-only invariant on
    /// epoch ordering.
    pub fn add_epoch(&mut self, epoch: Epoch) {
        if let Some(last) = self.epochs.last() {
            assert!(
                epoch.start_height > last.start_height,
                "epoch start_height must strictly increase: {} <= {}",
                epoch.start_height,
                last.start_height
            );
        }
        self.epochs.push(epoch);
    }

    pub fn set_max_height(&mut self, height: u64) {
        self.max_height = height;
    }

    pub fn max_height(&self) -> u64 {
        self.max_height
    }

    fn epoch_for_height(&self, height: u64) -> Option<&Epoch> {
        self.epochs
            .iter()
            .filter(|e| e.start_height <= height)
            .max_by_key(|e| e.start_height)
    }

    /// `validators[step mod N]`, where `validators` is taken from the
    /// epoch governing `height`.
    pub fn get_proposer(&self, step: u64, height: u64) -> Result<Address, MonitorError> {
        if height > self.max_height {
            return Err(MonitorError::EpochNotReady(format!(
                "height {height} exceeds known epoch watermark {}",
                self.max_height
            )));
        }
        let epoch = self.epoch_for_height(height).ok_or_else(|| {
            MonitorError::EpochNotReady(format!("no epoch governs height {height}"))
        })?;
        if epoch.validators.is_empty() {
            return Err(MonitorError::InvalidData("epoch has no validators".into()));
        }
        let idx = (step % epoch.validators.len() as u64) as usize;
        Ok(Address(epoch.validators[idx]))
    }

    /// Every step in `[lo, hi)` assigned to `proposer` under the epoch
    /// governing `height`, computed by modular arithmetic rather than
    /// enumeration.
    pub fn get_assigned_steps(
        &self,
        proposer: &Address,
        lo: u64,
        hi: u64,
        height: u64,
    ) -> Result<Vec<u64>, MonitorError> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        if height > self.max_height {
            return Err(MonitorError::EpochNotReady(format!(
                "height {height} exceeds known epoch watermark {}",
                self.max_height
            )));
        }
        let epoch = self.epoch_for_height(height).ok_or_else(|| {
            MonitorError::EpochNotReady(format!("no epoch governs height {height}"))
        })?;
        let n = epoch.validators.len() as u64;
        if n == 0 {
            return Err(MonitorError::InvalidData("epoch has no validators".into()));
        }
        let position = epoch
            .validators
            .iter()
            .position(|v| *v == proposer.0)
            .ok_or_else(|| {
                MonitorError::InvalidData(format!("proposer {proposer} not in governing epoch"))
            })? as u64;

        let mut steps = Vec::new();
        let first = lo + ((position + n - (lo % n)) % n);
        let mut s = first;
        while s < hi {
            steps.push(s);
            s += n;
        }
        Ok(steps)
    }
}

/// Discovers epochs from the chain-spec's static/contract ranges and
/// tracks how far the contract ranges have been scanned.
pub struct EpochFetcher {
    ranges: Vec<ValidatorRange>,
    static_emitted: Vec<bool>,
    contract_scanned_to: Vec<u64>,
    pub last_fetch_height: u64,
}

impl EpochFetcher {
    pub fn new(ranges: Vec<ValidatorRange>) -> Self {
        let static_emitted = vec![false; ranges.len()];
        let contract_scanned_to = ranges.iter().map(|r| r.start_height.saturating_sub(1)).collect();
        Self { ranges, static_emitted, contract_scanned_to, last_fetch_height: 0 }
    }

    /// Advances epoch discovery up to `head_height`, returning newly
    /// discovered epochs in ascending `start_height` order. Static ranges
    /// yield one epoch each, emitted as soon as their start height is
    /// known (immediately). Contract ranges are scanned for
    /// `InitiateChange` logs up to `head_height`, bounded by the range's
    /// own `end_height`.
    pub fn update(&mut self, rpc: &RpcClient, head_height: u64) -> Result<Vec<Epoch>, MonitorError> {
        let mut discovered = Vec::new();

        for (idx, range) in self.ranges.iter().enumerate() {
            match &range.source {
                ValidatorSource::List(addrs) => {
                    if !self.static_emitted[idx] {
                        discovered.push(Epoch {
                            start_height: range.start_height,
                            validators: addrs.iter().map(|a| a.0).collect(),
                        });
                        self.static_emitted[idx] = true;
                    }
                }
                ValidatorSource::Contract(contract) => {
                    let scan_to = range.end_height.map(|e| e.min(head_height)).unwrap_or(head_height);
                    let scan_from = self.contract_scanned_to[idx] + 1;
                    if scan_from > scan_to {
                        continue;
                    }
                    let logs = rpc.get_initiate_change_logs(contract, scan_from.max(range.start_height), scan_to)?;
                    for log in logs {
                        let validators = decode_initiate_change_data(&log.data)?;
                        let log_height = u64::from_str_radix(
                            log.block_number.trim_start_matches("0x"),
                            16,
                        )
                        .map_err(|e| MonitorError::InvalidData(format!("bad log blockNumber: {e}")))?;
                        discovered.push(Epoch {
                            start_height: log_height + 1,
                            validators,
                        });
                    }
                    self.contract_scanned_to[idx] = scan_to;
                }
            }
        }

        discovered.sort_by_key(|e| e.start_height);
        self.last_fetch_height = head_height;
        Ok(discovered)
    }

    pub fn range_for(&self, height: u64) -> Option<&ValidatorRange> {
        range_for_height(&self.ranges, height)
    }
}

/// Decodes the ABI-encoded `(bytes32 parentHash, address[] newSet)` log
/// payload of an `InitiateChange` event into the new validator list.
fn decode_initiate_change_data(data_hex: &str) -> Result<Vec<[u8; 20]>, MonitorError> {
    let data = hex::decode(data_hex.trim_start_matches("0x"))
        .map_err(|e| MonitorError::InvalidData(format!("bad log data hex: {e}")))?;
    if data.len() < 64 {
        return Err(MonitorError::InvalidData("InitiateChange log data too short".into()));
    }
    // Word 0 is parentHash (ignored), word 1 is the offset to the dynamic
    // address[] parameter.
    let offset = u64_from_word(&data[32..64])? as usize;
    if data.len() < offset + 32 {
        return Err(MonitorError::InvalidData("InitiateChange log data truncated".into()));
    }
    let len = u64_from_word(&data[offset..offset + 32])? as usize;
    let elements_start = offset + 32;
    let needed = elements_start + len * 32;
    if data.len() < needed {
        return Err(MonitorError::InvalidData("InitiateChange address array truncated".into()));
    }
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let word = &data[elements_start + i * 32..elements_start + (i + 1) * 32];
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&word[12..32]);
        out.push(addr);
    }
    Ok(out)
}

fn u64_from_word(word: &[u8]) -> Result<u64, MonitorError> {
    if word.len() != 32 {
        return Err(MonitorError::InvalidData("ABI word not 32 bytes".into()));
    }
    if word[..24].iter().any(|b| *b != 0) {
        return Err(MonitorError::InvalidData("ABI word exceeds u64 range".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..32]);
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn oracle_with_epoch(validators: Vec<Address>, start: u64, max_height: u64) -> PrimaryOracle {
        let mut oracle = PrimaryOracle::new();
        oracle.add_epoch(Epoch { start_height: start, validators: validators.iter().map(|a| a.0).collect() });
        oracle.set_max_height(max_height);
        oracle
    }

    #[test]
    fn proposer_is_modular() {
        let oracle = oracle_with_epoch(vec![addr(1), addr(2), addr(3)], 0, 1000);
        assert_eq!(oracle.get_proposer(0, 10).unwrap(), addr(1));
        assert_eq!(oracle.get_proposer(1, 10).unwrap(), addr(2));
        assert_eq!(oracle.get_proposer(3, 10).unwrap(), addr(1));
    }

    #[test]
    fn epoch_not_ready_beyond_max_height() {
        let oracle = oracle_with_epoch(vec![addr(1)], 0, 5);
        assert!(matches!(oracle.get_proposer(0, 6), Err(MonitorError::EpochNotReady(_))));
    }

    #[test]
    fn assigned_steps_matches_brute_force() {
        let oracle = oracle_with_epoch(vec![addr(1), addr(2)], 0, 1000);
        let assigned = oracle.get_assigned_steps(&addr(2), 95, 110, 10).unwrap();
        let brute: Vec<u64> = (95..110).filter(|s| s % 2 == 1).collect();
        assert_eq!(assigned, brute);
    }

    #[test]
    #[should_panic]
    fn add_epoch_panics_on_non_increasing_start() {
        let mut oracle = PrimaryOracle::new();
        oracle.add_epoch(Epoch { start_height: 10, validators: vec![[1; 20]] });
        oracle.add_epoch(Epoch { start_height: 10, validators: vec![[2; 20]] });
    }

    #[test]
    fn decodes_initiate_change_payload() {
        // parentHash (zero), offset=0x40, len=2, two addresses.
        let mut data = vec![0u8; 32];
        data.extend_from_slice(&[0u8; 31]);
        data.push(0x40);
        data.extend_from_slice(&[0u8; 31]);
        data.push(2);
        let mut a1 = [0u8; 32];
        a1[12..].copy_from_slice(&[0xaa; 20]);
        let mut a2 = [0u8; 32];
        a2[12..].copy_from_slice(&[0xbb; 20]);
        data.extend_from_slice(&a1);
        data.extend_from_slice(&a2);
        let hex_data = format!("0x{}", hex::encode(&data));
        let decoded = decode_initiate_change_data(&hex_data).unwrap();
        assert_eq!(decoded, vec![[0xaa; 20], [0xbb; 20]]);
    }
}
