/// Narrow JSON-RPC 2.0 facade: `eth_blockNumber`, `eth_getBlockByNumber`,
/// `eth_getBlockByHash`, and `eth_getLogs` for `InitiateChange` events.
///
/// RPC calls are synchronous from the core's perspective even though the
/// transport (`reqwest::blocking`) runs its own internal executor.
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::blocks::{decode_block, RawBlock};
use crate::error::MonitorError;
use crate::types::{Address, Block, BlockHash};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct RpcClient {
    uri: String,
    http: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct LogEntry {
    pub address: String,
    pub data: String,
    pub topics: Vec<String>,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
}

impl RpcClient {
    pub fn new(uri: impl Into<String>) -> Result<Self, MonitorError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| MonitorError::Transient(format!("building RPC client: {e}")))?;
        Ok(Self { uri: uri.into(), http })
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, MonitorError> {
        let req = JsonRpcRequest { jsonrpc: "2.0", method, params, id: 1 };
        let resp = self
            .http
            .post(&self.uri)
            .json(&req)
            .send()
            .map_err(|e| MonitorError::Transient(format!("{method} request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(MonitorError::Transient(format!(
                "{method} returned HTTP {}",
                resp.status()
            )));
        }
        let body: JsonRpcResponse = resp
            .json()
            .map_err(|e| MonitorError::Transient(format!("{method} bad JSON body: {e}")))?;
        if let Some(err) = body.error {
            return Err(MonitorError::InvalidData(format!(
                "{method} RPC error {}: {}",
                err.code, err.message
            )));
        }
        body.result
            .ok_or_else(|| MonitorError::InvalidData(format!("{method} returned no result")))
    }

    /// Current remote chain head height.
    pub fn block_number(&self) -> Result<u64, MonitorError> {
        let result = self.call("eth_blockNumber", json!([]))?;
        let s = result
            .as_str()
            .ok_or_else(|| MonitorError::InvalidData("eth_blockNumber result not a string".into()))?;
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|e| MonitorError::InvalidData(format!("bad block number {s}: {e}")))
    }

    /// Fetches a block by height. `tag` accepts a `0x`-prefixed hex height
    /// or one of the reserved tags `"latest"`/`"earliest"`.
    pub fn get_block_by_number(&self, tag: &str) -> Result<Option<Block>, MonitorError> {
        let result = self.call("eth_getBlockByNumber", json!([tag, false]))?;
        self.parse_block_result(result)
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, MonitorError> {
        self.get_block_by_number(&format!("0x{height:x}"))
    }

    pub fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, MonitorError> {
        let result = self.call("eth_getBlockByHash", json!([hash.to_hex(), false]))?;
        self.parse_block_result(result)
    }

    fn parse_block_result(&self, result: Value) -> Result<Option<Block>, MonitorError> {
        if result.is_null() {
            return Ok(None);
        }
        let raw: RawBlock = serde_json::from_value(result)
            .map_err(|e| MonitorError::InvalidData(format!("malformed block: {e}")))?;
        Ok(Some(decode_block(raw)?))
    }

    /// Queries `InitiateChange(bytes32,address[])` logs emitted by
    /// `contract` in `[from_height, to_height]`.
    pub fn get_initiate_change_logs(
        &self,
        contract: &Address,
        from_height: u64,
        to_height: u64,
    ) -> Result<Vec<LogEntry>, MonitorError> {
        let topic = initiate_change_topic_hex();
        let filter = json!({
            "fromBlock": format!("0x{from_height:x}"),
            "toBlock": format!("0x{to_height:x}"),
            "address": contract.to_hex(),
            "topics": [topic],
        });
        let result = self.call("eth_getLogs", json!([filter]))?;
        serde_json::from_value(result)
            .map_err(|e| MonitorError::InvalidData(format!("malformed log entry: {e}")))
    }
}

/// `keccak256("InitiateChange(bytes32,address[])")`, as the event's topic0.
pub fn initiate_change_topic_hex() -> String {
    use sha3::{Digest, Keccak256};
    const EVENT_NAME: &[u8] = b"InitiateChange(bytes32,address[])";
    let hash = Keccak256::digest(EVENT_NAME);
    format!("0x{}", hex::encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_hash_is_32_bytes() {
        let topic = initiate_change_topic_hex();
        assert_eq!(topic.len(), 2 + 64);
    }
}
