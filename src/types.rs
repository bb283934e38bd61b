/// Core data types shared across the monitor's pipeline.
use std::fmt;

/// A 32-byte block or transaction hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn from_hex(s: &str) -> Result<Self, crate::error::MonitorError> {
        let s = s.trim_start_matches("0x");
        let bytes = hex::decode(s)
            .map_err(|e| crate::error::MonitorError::InvalidData(format!("bad hash hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(crate::error::MonitorError::InvalidData(format!(
                "hash has {} bytes, want 32",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(BlockHash(out))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::LowerHex for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A 20-byte validator / contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_hex(s: &str) -> Result<Self, crate::error::MonitorError> {
        let s = s.trim_start_matches("0x");
        let bytes = hex::decode(s)
            .map_err(|e| crate::error::MonitorError::InvalidData(format!("bad address hex: {e}")))?;
        if bytes.len() != 20 {
            return Err(crate::error::MonitorError::InvalidData(format!(
                "address has {} bytes, want 20",
                bytes.len()
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Monotonic, never-reused identifier for a branch of stored blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct BranchId(pub u64);

/// A block in canonical form, as reconstructed from RPC data.
#[derive(Clone)]
pub struct Block {
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub height: u64,
    pub step: u64,
    pub timestamp: u64,
    /// Aura step-signature by the proposer, recovery-id included.
    pub signature: [u8; 65],
    /// Recovered from `signature` over the header RLP without the
    /// signature field.
    pub proposer: Address,
    /// Full header RLP, signature included, kept for equivocation evidence.
    pub header_rlp: Vec<u8>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("hash", &self.hash)
            .field("parent_hash", &self.parent_hash)
            .field("height", &self.height)
            .field("step", &self.step)
            .field("proposer", &self.proposer)
            .finish()
    }
}

/// Source of a validator set for a definition range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatorSource {
    /// A fixed list taken straight from the chain-spec file.
    List(Vec<Address>),
    /// A contract whose `InitiateChange` logs publish new lists; the chain
    /// spec treats `safeContract` and `contract` the same way downstream.
    Contract(Address),
}

/// One `[start_height, end_height)` range from the chain-spec file, bound
/// to either a static list or a contract. The last range is open-ended
/// (`end_height = None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRange {
    pub start_height: u64,
    pub end_height: Option<u64>,
    pub source: ValidatorSource,
}

/// A validator set governing all heights `>= start_height` up to the next
/// epoch's `start_height`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Epoch {
    pub start_height: u64,
    pub validators: Vec<[u8; 20]>,
}

impl Epoch {
    pub fn validators(&self) -> Vec<Address> {
        self.validators.iter().map(|b| Address(*b)).collect()
    }
}

/// An emitted misbehavior record, handed to a report sink.
#[derive(Debug, Clone)]
pub enum ReportEvent {
    SkippedProposal {
        validator: Address,
        step: u64,
    },
    OfflineValidator {
        validator: Address,
        missed_steps: Vec<u64>,
    },
    Equivocation {
        proposer: Address,
        step: u64,
        blocks: Vec<Block>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_roundtrip() {
        let h = BlockHash([0x11; 32]);
        let hex = h.to_hex();
        let back = BlockHash::from_hex(&hex).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn address_rejects_wrong_length() {
        assert!(Address::from_hex("0x1234").is_err());
    }
}
