/// Durable sinks for the three misbehavior report kinds, in the layout
/// `{report-dir}/skips`, `{report-dir}/offline_report_{validator}_steps_{lo}_to_{hi}`,
/// and `{report-dir}/equivocation_reports_for_proposer_{addr}`.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::STEP_DURATION;
use crate::error::MonitorError;
use crate::rpc::RpcClient;
use crate::types::{Address, Block};

fn open_append(path: &Path) -> Result<File, MonitorError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| MonitorError::InvalidData(format!("opening {path:?}: {e}")))
}

fn step_to_utc_string(step: u64) -> String {
    seconds_to_utc_string(step * STEP_DURATION)
}

/// The current wall-clock moment, formatted the same way as
/// `step_to_utc_string` — used where a report records the real time
/// detection happened rather than a step-derived estimate.
fn now_utc_string() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    seconds_to_utc_string(secs)
}

fn seconds_to_utc_string(secs: u64) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    // Avoids pulling in a chrono/time dependency for a single formatted
    // line; days-since-epoch -> calendar date via a plain civil-from-days
    // conversion (Howard Hinnant's algorithm), good for any date this
    // monitor will ever see.
    let (y, m, d) = civil_from_days(days as i64);
    format!(
        "{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Appends one `step,validator_hex,utc_time` line.
pub struct SkipLog {
    file: File,
}

impl SkipLog {
    pub fn open(report_dir: &Path) -> Result<Self, MonitorError> {
        std::fs::create_dir_all(report_dir)
            .map_err(|e| MonitorError::InvalidData(format!("creating report dir: {e}")))?;
        Ok(Self { file: open_append(&report_dir.join("skips"))? })
    }

    pub fn append(&mut self, step: u64, validator: Address) -> Result<(), MonitorError> {
        writeln!(self.file, "{step},{},{}", validator.to_hex(), step_to_utc_string(step))
            .map_err(|e| MonitorError::InvalidData(format!("writing skip log: {e}")))?;
        self.file
            .flush()
            .map_err(|e| MonitorError::InvalidData(format!("flushing skip log: {e}")))
    }
}

/// Writes `offline_report_{validator_hex}_steps_{lo}_to_{hi}` as JSON.
pub fn write_offline_report(
    report_dir: &Path,
    validator: Address,
    missed_steps: &[u64],
) -> Result<PathBuf, MonitorError> {
    std::fs::create_dir_all(report_dir)
        .map_err(|e| MonitorError::InvalidData(format!("creating report dir: {e}")))?;
    let lo = missed_steps.iter().min().copied().unwrap_or(0);
    let hi = missed_steps.iter().max().copied().unwrap_or(0);
    let path = report_dir.join(format!(
        "offline_report_{}_steps_{lo}_to_{hi}",
        validator.to_hex().trim_start_matches("0x")
    ));
    let body = serde_json::json!({
        "validator": validator.to_hex(),
        "missed_steps": missed_steps,
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&body).unwrap())
        .map_err(|e| MonitorError::InvalidData(format!("writing offline report: {e}")))?;
    Ok(path)
}

/// Appends a human-readable equivocation report, re-fetching the blocks by
/// hash so the evidence carries their full signed header RLP.
pub fn write_equivocation_report(
    report_dir: &Path,
    rpc: &RpcClient,
    proposer: Address,
    step: u64,
    blocks: &[Block],
) -> Result<PathBuf, MonitorError> {
    std::fs::create_dir_all(report_dir)
        .map_err(|e| MonitorError::InvalidData(format!("creating report dir: {e}")))?;
    let path = report_dir.join(format!(
        "equivocation_reports_for_proposer_{}",
        proposer.to_hex().trim_start_matches("0x")
    ));
    let mut file = open_append(&path)?;

    writeln!(file, "=== Equivocation ===")
        .map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    writeln!(file, "proposer: {}", proposer.to_hex())
        .map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    writeln!(file, "step: {step}").map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    writeln!(file, "detected_at: {}", now_utc_string())
        .map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    writeln!(file, "blocks:").map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    for b in blocks {
        writeln!(file, "  - hash={} timestamp={}", b.hash.to_hex(), b.timestamp)
            .map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    }

    writeln!(file, "evidence:").map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    for b in blocks.iter().take(2) {
        let refetched = rpc.get_block_by_hash(&b.hash)?.unwrap_or_else(|| b.clone());
        writeln!(file, "  header_rlp={}", hex::encode(&refetched.header_rlp))
            .map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    }
    writeln!(file).map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    file.flush().map_err(|e| MonitorError::InvalidData(e.to_string()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_formatting_of_epoch_zero() {
        assert_eq!(step_to_utc_string(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn now_utc_string_has_the_expected_shape() {
        let s = now_utc_string();
        assert_eq!(s.len(), "2026-07-31T00:00:00Z".len());
        assert!(s.ends_with('Z'));
    }

    #[test]
    fn skip_log_appends_csv_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut log = SkipLog::open(dir.path()).unwrap();
        log.append(101, Address([0x20; 20])).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("skips")).unwrap();
        assert!(contents.starts_with("101,0x2020202020202020202020202020202020202020,"));
    }

    #[test]
    fn offline_report_name_encodes_step_range() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_offline_report(dir.path(), Address([0xab; 20]), &[5, 7, 6]).unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().contains("steps_5_to_7"));
    }
}
