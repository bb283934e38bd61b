/// CLI surface and resolved configuration, stashed in a process-wide
/// `OnceCell` so helpers nested deep in the reporting path (report
/// filename builders, the sync-from resolver) can read it without being
/// threaded through every call.
use clap::Parser;
use once_cell::sync::OnceCell;
use std::path::PathBuf;

use crate::constants::{DEFAULT_ALLOWED_SKIP_RATE, DEFAULT_OFFLINE_WINDOW_SIZE_IN_SECONDS, DEFAULT_SYNC_FROM};

static GLOBAL_CONFIG: OnceCell<AppConfig> = OnceCell::new();

#[derive(Parser, Debug, Clone)]
#[command(name = "tlbc-monitor", version, about = "Aura/AuthorityRound validator misbehavior monitor")]
pub struct Cli {
    /// JSON-RPC HTTP endpoint of the node to follow.
    #[arg(long, default_value = "http://localhost:8545")]
    pub rpc_uri: String,

    /// Path to the chain-spec JSON file.
    #[arg(long)]
    pub chain_spec_path: PathBuf,

    /// Re-read the chain-spec file each cycle and stop cleanly if it changed.
    #[arg(long, default_value_t = false)]
    pub watch_chain_spec: bool,

    /// Directory for report files (skip log, offline reports, equivocation reports).
    #[arg(long, default_value = "./reports")]
    pub report_dir: PathBuf,

    /// Directory for the RocksDB-backed block store and checkpoint.
    #[arg(long, default_value = "./db")]
    pub db_dir: PathBuf,

    /// Fraction of assignments a validator may miss before being reported offline.
    #[arg(long, default_value_t = DEFAULT_ALLOWED_SKIP_RATE, value_parser = parse_skip_rate)]
    pub skip_rate: f64,

    /// Sliding window size for the offline reporter, in seconds.
    #[arg(long, default_value_t = DEFAULT_OFFLINE_WINDOW_SIZE_IN_SECONDS)]
    pub offline_window: u64,

    /// Initial sync point: an absolute height, "latest", "earliest", or a
    /// negative offset from the remote head.
    #[arg(long, default_value = DEFAULT_SYNC_FROM)]
    pub sync_from: String,

    /// Upgrade a v1 checkpoint found in the db directory to the current format.
    #[arg(long, default_value_t = false)]
    pub upgrade_db: bool,
}

fn parse_skip_rate(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| format!("`{s}` isn't a valid floating-point number"))?;
    if !(0.0..=1.0).contains(&v) {
        return Err(format!("skip-rate must be between 0.0 and 1.0, got {v}"));
    }
    Ok(v)
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rpc_uri: String,
    pub chain_spec_path: PathBuf,
    pub watch_chain_spec: bool,
    pub report_dir: PathBuf,
    pub db_dir: PathBuf,
    pub skip_rate: f64,
    pub offline_window: u64,
    pub sync_from: String,
    pub upgrade_db: bool,
}

impl From<Cli> for AppConfig {
    fn from(cli: Cli) -> Self {
        Self {
            rpc_uri: cli.rpc_uri,
            chain_spec_path: cli.chain_spec_path,
            watch_chain_spec: cli.watch_chain_spec,
            report_dir: cli.report_dir,
            db_dir: cli.db_dir,
            skip_rate: cli.skip_rate,
            offline_window: cli.offline_window,
            sync_from: cli.sync_from,
            upgrade_db: cli.upgrade_db,
        }
    }
}

/// Parses CLI arguments, creates the report/db directories eagerly, and
/// stashes the resolved config globally.
pub fn init_global_config_from_cli() -> Result<&'static AppConfig, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config: AppConfig = cli.into();
    std::fs::create_dir_all(&config.report_dir)?;
    std::fs::create_dir_all(&config.db_dir)?;
    GLOBAL_CONFIG.set(config).map_err(|_| "config already initialized")?;
    Ok(get_global_config())
}

pub fn get_global_config() -> &'static AppConfig {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config_from_cli() first");
        std::process::exit(1);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_constants() {
        let cli = Cli::parse_from(["tlbc-monitor", "--chain-spec-path", "spec.json"]);
        assert_eq!(cli.skip_rate, DEFAULT_ALLOWED_SKIP_RATE);
        assert_eq!(cli.offline_window, DEFAULT_OFFLINE_WINDOW_SIZE_IN_SECONDS);
        assert_eq!(cli.sync_from, DEFAULT_SYNC_FROM);
        assert!(!cli.watch_chain_spec);
        assert!(!cli.upgrade_db);
    }

    #[test]
    fn skip_rate_out_of_range_is_rejected() {
        let result = Cli::try_parse_from([
            "tlbc-monitor",
            "--chain-spec-path",
            "spec.json",
            "--skip-rate",
            "5.0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn skip_rate_boundaries_are_accepted() {
        for value in ["0.0", "1.0"] {
            let cli = Cli::parse_from(["tlbc-monitor", "--chain-spec-path", "spec.json", "--skip-rate", value]);
            assert_eq!(cli.skip_rate, value.parse::<f64>().unwrap());
        }
    }
}
