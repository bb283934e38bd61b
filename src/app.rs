/// App Controller: owns every reporter instance, drives one fetch cycle at
/// a time, persists the checkpoint, and handles cooperative shutdown.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::chain_spec;
use crate::config::AppConfig;
use crate::constants::{BLOCK_FETCH_INTERVAL_SECS, MAX_BLOCKS_PER_CYCLE, STEP_DURATION};
use crate::equivocation::EquivocationDetector;
use crate::error::MonitorError;
use crate::fetcher::{BlockFetcher, BlockObserver};
use crate::metrics::Metrics;
use crate::offline_reporter::OfflineReporter;
use crate::reports::{self, SkipLog};
use crate::rpc::RpcClient;
use crate::skip_reporter::SkipReporter;
use crate::store::{BlockStore, StoreTxn, DB_FILE_NAME};
use crate::types::{Address, Block, BlockHash, BranchId, ReportEvent};
use crate::validators::{EpochFetcher, PrimaryOracle};

#[derive(Serialize, Deserialize, Default)]
struct AppStateV1 {
    head_hash: Option<[u8; 32]>,
    branch_id: Option<u64>,
    start_height: Option<u64>,
    latest_step: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone)]
struct OfflineWindowRecord {
    validator: [u8; 20],
    missed_steps: Vec<u64>,
    already_reported: bool,
}

#[derive(Serialize, Deserialize, Clone)]
struct EquivocationCountRecord {
    step: u64,
    proposer: [u8; 20],
    count: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct AppStateV2 {
    head_hash: Option<[u8; 32]>,
    branch_id: Option<u64>,
    start_height: Option<u64>,
    latest_step: Option<u64>,
    offline_windows: Vec<OfflineWindowRecord>,
    equivocation_counts: Vec<EquivocationCountRecord>,
}

fn upgrade_v1_to_v2(v1: AppStateV1) -> AppStateV2 {
    AppStateV2 {
        head_hash: v1.head_hash,
        branch_id: v1.branch_id,
        start_height: v1.start_height,
        latest_step: v1.latest_step,
        offline_windows: Vec::new(),
        equivocation_counts: Vec::new(),
    }
}

#[derive(Serialize, Deserialize)]
enum AppState {
    V1(AppStateV1),
    V2(AppStateV2),
}

fn load_app_state(store: &BlockStore, upgrade_db: bool) -> Result<AppStateV2, MonitorError> {
    match store.load_checkpoint()? {
        None => Ok(AppStateV2::default()),
        Some(bytes) => match bincode::deserialize::<AppState>(&bytes) {
            Ok(AppState::V2(v2)) => Ok(v2),
            Ok(AppState::V1(v1)) => {
                if upgrade_db {
                    Ok(upgrade_v1_to_v2(v1))
                } else {
                    Err(MonitorError::InvalidAppState(
                        "found a v1 checkpoint; rerun with --upgrade-db".into(),
                    ))
                }
            }
            Err(e) => Err(MonitorError::InvalidAppState(format!("unreadable checkpoint: {e}"))),
        },
    }
}

/// Composite observer that drives the skip, offline, and equivocation
/// reporters for each block the Fetcher emits, and writes their events to
/// the durable sinks immediately.
struct ReporterPipeline<'a> {
    rpc: &'a RpcClient,
    oracle: &'a PrimaryOracle,
    skip_reporter: &'a mut SkipReporter,
    offline_reporter: &'a mut OfflineReporter,
    equivocation_detector: &'a mut EquivocationDetector,
    skip_log: &'a mut SkipLog,
    report_dir: &'a std::path::Path,
    metrics: Option<&'a Metrics>,
}

impl<'a> BlockObserver for ReporterPipeline<'a> {
    fn on_block(&mut self, block: &Block, txn: &mut StoreTxn) -> Result<(), MonitorError> {
        let skip_events = self.skip_reporter.on_block(block, self.oracle)?;
        for event in &skip_events {
            if let ReportEvent::SkippedProposal { validator, step } = event {
                self.skip_log.append(*step, *validator)?;
                self.offline_reporter.on_skip(*validator, *step);
                if let Some(m) = self.metrics {
                    m.skips_emitted_total.inc();
                }
            }
        }

        let offline_events = self.offline_reporter.check(block.step, block.height, self.oracle)?;
        for event in &offline_events {
            if let ReportEvent::OfflineValidator { validator, missed_steps } = event {
                reports::write_offline_report(self.report_dir, *validator, missed_steps)?;
                if let Some(m) = self.metrics {
                    m.offline_events_emitted_total.inc();
                }
            }
        }

        let equivocation_events = self.equivocation_detector.on_block(block, &*txn)?;
        for event in &equivocation_events {
            if let ReportEvent::Equivocation { proposer, step, blocks } = event {
                reports::write_equivocation_report(self.report_dir, self.rpc, *proposer, *step, blocks)?;
                if let Some(m) = self.metrics {
                    m.equivocations_emitted_total.inc();
                }
            }
        }

        Ok(())
    }
}

pub struct App {
    config: AppConfig,
    store: BlockStore,
    rpc: RpcClient,
    oracle: PrimaryOracle,
    epoch_fetcher: EpochFetcher,
    fetcher: BlockFetcher,
    skip_reporter: SkipReporter,
    offline_reporter: OfflineReporter,
    equivocation_detector: EquivocationDetector,
    skip_log: SkipLog,
    chain_spec_hash: [u8; 32],
    metrics: Option<Metrics>,
    shutdown: Arc<AtomicBool>,
}

impl App {
    pub fn new(config: AppConfig, metrics: Option<Metrics>) -> Result<Self, MonitorError> {
        let ranges = chain_spec::load_validator_ranges(&config.chain_spec_path)?;
        let chain_spec_hash = hash_chain_spec(&config.chain_spec_path)?;

        let store = BlockStore::open(&config.db_dir.join(DB_FILE_NAME))?;
        let rpc = RpcClient::new(&config.rpc_uri)?;
        let state = load_app_state(&store, config.upgrade_db)?;

        let fetcher = match state.head_hash {
            Some(hash) => {
                let block = store
                    .get_block(&BlockHash(hash))?
                    .ok_or_else(|| MonitorError::InvalidAppState("checkpoint head missing from store".into()))?;
                BlockFetcher::restore(Some(block), state.branch_id.map(BranchId), state.start_height)
            }
            None => BlockFetcher::new(),
        };
        let skip_reporter = SkipReporter::restore(state.latest_step);
        let offline_records = state
            .offline_windows
            .iter()
            .map(|r| (Address(r.validator), r.missed_steps.clone(), r.already_reported))
            .collect();
        // `--offline-window` is given in seconds; the reporter's window is
        // tracked in steps.
        let offline_window_in_steps = config.offline_window / STEP_DURATION;
        let offline_reporter = OfflineReporter::restore(offline_window_in_steps, config.skip_rate, offline_records);
        let equivocation_records = state
            .equivocation_counts
            .iter()
            .map(|r| (r.step, Address(r.proposer), r.count as usize))
            .collect();
        let equivocation_detector = EquivocationDetector::restore(equivocation_records);

        let skip_log = SkipLog::open(&config.report_dir)?;

        Ok(Self {
            config,
            store,
            rpc,
            oracle: PrimaryOracle::new(),
            epoch_fetcher: EpochFetcher::new(ranges),
            fetcher,
            skip_reporter,
            offline_reporter,
            equivocation_detector,
            skip_log,
            chain_spec_hash,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers the cooperative shutdown handler for SIGINT/SIGTERM.
    pub fn install_signal_handler(&self) -> Result<(), MonitorError> {
        let flag = self.shutdown.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .map_err(|e| MonitorError::InvalidData(format!("installing signal handler: {e}")))
    }

    /// Drives the monitor until a cooperative stop is requested or a fatal
    /// error occurs. Each cycle: refresh epochs, fetch and report, persist
    /// the checkpoint, optionally check the chain spec for changes, sleep
    /// if nothing new arrived.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            let cycle_start = Instant::now();
            let emitted = match self.run_cycle() {
                Ok(n) => n,
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "transient error this cycle, retrying next cycle");
                    0
                }
                Err(e) => return Err(e),
            };

            if let Some(m) = &self.metrics {
                m.last_cycle_duration_seconds.set(cycle_start.elapsed().as_secs_f64());
            }

            if self.config.watch_chain_spec {
                let current_hash = hash_chain_spec(&self.config.chain_spec_path)?;
                if current_hash != self.chain_spec_hash {
                    return Err(MonitorError::ChainSpecChanged(format!(
                        "{:?} changed on disk",
                        self.config.chain_spec_path
                    )));
                }
            }

            if emitted == 0 {
                std::thread::sleep(Duration::from_secs_f64(BLOCK_FETCH_INTERVAL_SECS));
            }
        }
    }

    /// Runs exactly one cycle: epoch refresh, then fetch-and-report, then
    /// checkpoint commit. Returns the number of blocks emitted.
    fn run_cycle(&mut self) -> Result<usize, MonitorError> {
        let remote_height = self.rpc.block_number()?;
        let new_epochs = self.epoch_fetcher.update(&self.rpc, remote_height)?;
        for epoch in new_epochs {
            self.oracle.add_epoch(epoch);
        }
        // Bound the oracle by what epoch discovery has actually scanned,
        // every cycle, even when nothing new was found this time.
        self.oracle.set_max_height(self.epoch_fetcher.last_fetch_height);

        let max_height = self.oracle.max_height();
        let mut txn = self.store.begin();
        let emitted = {
            let mut pipeline = ReporterPipeline {
                rpc: &self.rpc,
                oracle: &self.oracle,
                skip_reporter: &mut self.skip_reporter,
                offline_reporter: &mut self.offline_reporter,
                equivocation_detector: &mut self.equivocation_detector,
                skip_log: &mut self.skip_log,
                report_dir: &self.config.report_dir,
                metrics: self.metrics.as_ref(),
            };
            let mut observers: [&mut dyn BlockObserver; 1] = [&mut pipeline];
            self.fetcher.fetch_and_insert_new_blocks(
                &self.rpc,
                &mut txn,
                &self.config.sync_from,
                MAX_BLOCKS_PER_CYCLE,
                max_height,
                &mut observers,
            )?
        };

        if let Some(m) = &self.metrics {
            let status = self.fetcher.sync_status(remote_height);
            m.chain_head_height.set(status.head_height as f64);
            m.sync_fraction.set(status.fraction);
        }

        self.persist_checkpoint(&mut txn)?;
        txn.commit()?;
        Ok(emitted)
    }

    /// Stages the checkpoint write into `txn` — the same transaction the
    /// cycle's block inserts and branch allocation are staged in, so all
    /// of it lands in one atomic commit or none does.
    fn persist_checkpoint(&self, txn: &mut StoreTxn) -> Result<(), MonitorError> {
        let offline_windows = self
            .offline_reporter
            .snapshot()
            .into_iter()
            .map(|(v, missed, reported)| OfflineWindowRecord { validator: v.0, missed_steps: missed, already_reported: reported })
            .collect();
        let equivocation_counts = self
            .equivocation_detector
            .snapshot()
            .into_iter()
            .map(|(step, proposer, count)| EquivocationCountRecord { step, proposer: proposer.0, count: count as u64 })
            .collect();

        let state = AppStateV2 {
            head_hash: self.fetcher.head().map(|b| b.hash.0),
            branch_id: self.fetcher.current_branch_id().map(|b| b.0),
            start_height: self.fetcher.head().map(|b| b.height),
            latest_step: self.skip_reporter.latest_step(),
            offline_windows,
            equivocation_counts,
        };
        let bytes = bincode::serialize(&AppState::V2(state))
            .map_err(|e| MonitorError::InvalidData(format!("serializing checkpoint: {e}")))?;

        txn.save_checkpoint(bytes)
    }
}

fn hash_chain_spec(path: &std::path::Path) -> Result<[u8; 32], MonitorError> {
    let bytes = std::fs::read(path).map_err(|e| MonitorError::InvalidData(format!("reading chain spec: {e}")))?;
    let digest = Keccak256::digest(&bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_to_v2_upgrade_carries_fetcher_and_skip_state_drops_offline_history() {
        let v1 = AppStateV1 {
            head_hash: Some([7; 32]),
            branch_id: Some(3),
            start_height: Some(100),
            latest_step: Some(555),
        };
        let v2 = upgrade_v1_to_v2(v1);
        assert_eq!(v2.head_hash, Some([7; 32]));
        assert_eq!(v2.branch_id, Some(3));
        assert_eq!(v2.latest_step, Some(555));
        assert!(v2.offline_windows.is_empty());
        assert!(v2.equivocation_counts.is_empty());
    }
}
