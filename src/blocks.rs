/// Header decoding and proposer recovery.
///
/// Turns the raw JSON-RPC block representation into the canonical `Block`
/// form, RLP-decoding the two seal fields (`seal[0] = step`,
/// `seal[1] = signature`) and recovering the proposer address by ECDSA
/// recovery over the header RLP with the signature field excluded.
use rlp::RlpStream;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, SECP256K1};
use serde::Deserialize;
use sha3::{Digest, Keccak256};

use crate::error::MonitorError;
use crate::types::{Address, Block, BlockHash};

/// Shape of an `eth_getBlockByNumber`/`eth_getBlockByHash` response with
/// `full_transactions = false`. Field names match the JSON-RPC convention
/// used by Aura/AuthorityRound nodes (OpenEthereum-style).
#[derive(Debug, Deserialize)]
pub struct RawBlock {
    pub hash: String,
    #[serde(rename = "parentHash")]
    pub parent_hash: String,
    pub number: String,
    pub timestamp: String,
    #[serde(rename = "sha3Uncles")]
    pub uncles_hash: String,
    pub author: String,
    #[serde(rename = "stateRoot")]
    pub state_root: String,
    #[serde(rename = "transactionsRoot")]
    pub transactions_root: String,
    #[serde(rename = "receiptsRoot")]
    pub receipts_root: String,
    #[serde(rename = "logsBloom")]
    pub logs_bloom: String,
    pub difficulty: String,
    #[serde(rename = "gasLimit")]
    pub gas_limit: String,
    #[serde(rename = "gasUsed")]
    pub gas_used: String,
    #[serde(rename = "extraData")]
    pub extra_data: String,
    #[serde(rename = "sealFields")]
    pub seal_fields: Vec<String>,
}

fn hex_to_bytes(s: &str) -> Result<Vec<u8>, MonitorError> {
    let s = s.trim_start_matches("0x");
    let s = if s.len() % 2 == 1 { format!("0{s}") } else { s.to_string() };
    hex::decode(&s).map_err(|e| MonitorError::InvalidData(format!("bad hex {s}: {e}")))
}

fn hex_to_u64(s: &str) -> Result<u64, MonitorError> {
    let s = s.trim_start_matches("0x");
    u64::from_str_radix(s, 16).map_err(|e| MonitorError::InvalidData(format!("bad hex int {s}: {e}")))
}

/// RLP-encodes the header. When `with_signature` is false, only the first
/// seal field (step) is appended and the signature is omitted, producing
/// the message the proposer actually signed.
fn encode_header(raw: &RawBlock, with_signature: bool) -> Result<Vec<u8>, MonitorError> {
    if raw.seal_fields.len() != 2 {
        return Err(MonitorError::InvalidData(format!(
            "header has {} seal fields, want 2",
            raw.seal_fields.len()
        )));
    }
    let field_count = if with_signature { 15 } else { 14 };
    let mut stream = RlpStream::new_list(field_count);
    stream.append(&hex_to_bytes(&raw.parent_hash)?);
    stream.append(&hex_to_bytes(&raw.uncles_hash)?);
    stream.append(&hex_to_bytes(&raw.author)?);
    stream.append(&hex_to_bytes(&raw.state_root)?);
    stream.append(&hex_to_bytes(&raw.transactions_root)?);
    stream.append(&hex_to_bytes(&raw.receipts_root)?);
    stream.append(&hex_to_bytes(&raw.logs_bloom)?);
    stream.append(&hex_to_bytes(&raw.difficulty)?);
    stream.append(&hex_to_u64(&raw.number)?);
    stream.append(&hex_to_u64(&raw.gas_limit)?);
    stream.append(&hex_to_u64(&raw.gas_used)?);
    stream.append(&hex_to_u64(&raw.timestamp)?);
    stream.append(&hex_to_bytes(&raw.extra_data)?);

    let seal_step_raw = hex_to_bytes(&raw.seal_fields[0])?;
    stream.append_raw(&seal_step_raw, 1);
    if with_signature {
        let seal_sig_raw = hex_to_bytes(&raw.seal_fields[1])?;
        stream.append_raw(&seal_sig_raw, 1);
    }
    Ok(stream.out().to_vec())
}

fn decode_step(raw: &RawBlock) -> Result<u64, MonitorError> {
    let step_rlp = hex_to_bytes(&raw.seal_fields[0])?;
    let step_bytes: Vec<u8> = rlp::decode(&step_rlp)
        .map_err(|e| MonitorError::InvalidData(format!("decoding step seal field: {e}")))?;
    if step_bytes.len() > 8 {
        return Err(MonitorError::InvalidData("step field wider than 8 bytes".into()));
    }
    let mut buf = [0u8; 8];
    buf[8 - step_bytes.len()..].copy_from_slice(&step_bytes);
    Ok(u64::from_be_bytes(buf))
}

fn decode_signature(raw: &RawBlock) -> Result<[u8; 65], MonitorError> {
    let sig_rlp = hex_to_bytes(&raw.seal_fields[1])?;
    let sig_bytes: Vec<u8> = rlp::decode(&sig_rlp)
        .map_err(|e| MonitorError::InvalidData(format!("decoding signature seal field: {e}")))?;
    if sig_bytes.len() != 65 {
        return Err(MonitorError::InvalidData(format!(
            "signature has {} bytes, want 65",
            sig_bytes.len()
        )));
    }
    let mut out = [0u8; 65];
    out.copy_from_slice(&sig_bytes);
    Ok(out)
}

fn recover_proposer(message_rlp: &[u8], signature: &[u8; 65]) -> Result<Address, MonitorError> {
    let digest = Keccak256::digest(message_rlp);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| MonitorError::InvalidData(format!("bad recovery digest: {e}")))?;
    let recovery_id = RecoveryId::from_i32(signature[64] as i32)
        .map_err(|e| MonitorError::InvalidData(format!("bad recovery id: {e}")))?;
    let sig = RecoverableSignature::from_compact(&signature[0..64], recovery_id)
        .map_err(|e| MonitorError::InvalidData(format!("bad recoverable signature: {e}")))?;
    let pubkey = SECP256K1
        .recover_ecdsa(&message, &sig)
        .map_err(|e| MonitorError::InvalidData(format!("recovery failed: {e}")))?;
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    Ok(Address(addr))
}

/// Decodes a raw JSON-RPC block into canonical form, recovering the
/// proposer address.
pub fn decode_block(raw: RawBlock) -> Result<Block, MonitorError> {
    let hash = BlockHash::from_hex(&raw.hash)?;
    let parent_hash = BlockHash::from_hex(&raw.parent_hash)?;
    let height = hex_to_u64(&raw.number)?;
    let timestamp = hex_to_u64(&raw.timestamp)?;
    let step = decode_step(&raw)?;
    let signature = decode_signature(&raw)?;
    let message_rlp = encode_header(&raw, false)?;
    let proposer = recover_proposer(&message_rlp, &signature)?;
    let header_rlp = encode_header(&raw, true)?;

    Ok(Block {
        hash,
        parent_hash,
        height,
        step,
        timestamp,
        signature,
        proposer,
        header_rlp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_seal_arity() {
        let mut raw = sample_raw();
        raw.seal_fields.pop();
        let err = decode_block(raw).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidData(_)));
    }

    fn sample_raw() -> RawBlock {
        // A syntactically well-formed but not cryptographically valid
        // header; used only to exercise the seal-arity check above, since
        // a real signature requires a live secp256k1 keypair.
        RawBlock {
            hash: "0x".to_string() + &"11".repeat(32),
            parent_hash: "0x".to_string() + &"22".repeat(32),
            number: "0x1".to_string(),
            timestamp: "0x5".to_string(),
            uncles_hash: "0x".to_string() + &"00".repeat(32),
            author: "0x".to_string() + &"33".repeat(20),
            state_root: "0x".to_string() + &"00".repeat(32),
            transactions_root: "0x".to_string() + &"00".repeat(32),
            receipts_root: "0x".to_string() + &"00".repeat(32),
            logs_bloom: "0x".to_string() + &"00".repeat(256),
            difficulty: "0x1".to_string(),
            gas_limit: "0x7a1200".to_string(),
            gas_used: "0x0".to_string(),
            extra_data: "0x".to_string(),
            seal_fields: vec!["0x05".to_string(), format!("0x{}", "00".repeat(65))],
        }
    }
}
