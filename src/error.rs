/// Error kinds propagated out of the monitor's core pipeline.
///
/// Reporters never let a recoverable condition cross a callback boundary;
/// they either emit or stall. Only the Fetcher and the Block Store raise
/// `MonitorError`, and only between emissions, so downstream state is never
/// partially advanced.
use std::fmt;

#[derive(Debug)]
pub enum MonitorError {
    /// RPC timeout, 5xx, or transport failure. The cycle aborts without
    /// committing; the next cycle retries.
    Transient(String),
    /// Malformed block: seal fields missing/mis-typed, wrong signature
    /// length, schema mismatch, or corrupt checkpoint bytes.
    InvalidData(String),
    /// Reorg walked back further than `MAX_REORG_DEPTH` without finding a
    /// common ancestor.
    ReorgTooDeep(String),
    /// Oracle was asked about a height beyond its `max_height` watermark.
    EpochNotReady(String),
    /// Checkpoint carries an unknown or unsupported version tag.
    InvalidAppState(String),
    /// The chain-spec file changed on disk while being watched.
    ChainSpecChanged(String),
}

impl MonitorError {
    /// Whether the App Controller should retry the next cycle rather than
    /// exit the process.
    pub fn is_transient(&self) -> bool {
        matches!(self, MonitorError::Transient(_) | MonitorError::EpochNotReady(_))
    }

    /// Process exit code per the CLI contract: 0 only for a clean stop,
    /// which is handled separately from this enum.
    pub fn exit_code(&self) -> i32 {
        match self {
            MonitorError::Transient(_) => 1,
            MonitorError::InvalidData(_) => 2,
            MonitorError::ReorgTooDeep(_) => 3,
            MonitorError::EpochNotReady(_) => 1,
            MonitorError::InvalidAppState(_) => 4,
            MonitorError::ChainSpecChanged(_) => 0,
        }
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Transient(msg) => write!(f, "transient error: {msg}"),
            MonitorError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            MonitorError::ReorgTooDeep(msg) => write!(f, "reorg too deep: {msg}"),
            MonitorError::EpochNotReady(msg) => write!(f, "epoch not ready: {msg}"),
            MonitorError::InvalidAppState(msg) => write!(f, "invalid app state: {msg}"),
            MonitorError::ChainSpecChanged(msg) => write!(f, "chain spec changed: {msg}"),
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<rocksdb::Error> for MonitorError {
    fn from(e: rocksdb::Error) -> Self {
        MonitorError::InvalidData(e.to_string())
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(e: reqwest::Error) -> Self {
        MonitorError::Transient(e.to_string())
    }
}

pub type MonitorResult<T> = Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_predicate() {
        assert!(MonitorError::Transient("x".into()).is_transient());
        assert!(MonitorError::EpochNotReady("x".into()).is_transient());
        assert!(!MonitorError::InvalidData("x".into()).is_transient());
        assert!(!MonitorError::ReorgTooDeep("x".into()).is_transient());
    }

    #[test]
    fn clean_stop_exits_zero() {
        assert_eq!(MonitorError::ChainSpecChanged("x".into()).exit_code(), 0);
    }
}
