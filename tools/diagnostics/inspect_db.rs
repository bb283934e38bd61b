/// Standalone diagnostic: opens the block store read-only and prints
/// basic stats (block and branch-tip counts, checkpoint presence).
use clap::Parser;
use rocksdb::{Options, DB};
use std::path::PathBuf;

#[derive(Parser)]
struct Args {
    /// Directory containing the RocksDB block store.
    #[arg(long)]
    db_dir: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let db_path = args.db_dir.join("tlbc-monitor.db");

    let cf_names = ["blocks", "blocks_by_height", "blocks_by_step", "branch_tips", "meta"];
    let opts = Options::default();
    let db = DB::open_cf_for_read_only(&opts, &db_path, cf_names, false)?;

    let blocks_cf = db.cf_handle("blocks").ok_or("missing blocks column family")?;
    let height_cf = db.cf_handle("blocks_by_height").ok_or("missing blocks_by_height column family")?;
    let step_cf = db.cf_handle("blocks_by_step").ok_or("missing blocks_by_step column family")?;
    let tips_cf = db.cf_handle("branch_tips").ok_or("missing branch_tips column family")?;
    let meta_cf = db.cf_handle("meta").ok_or("missing meta column family")?;

    let block_count = db.iterator_cf(&blocks_cf, rocksdb::IteratorMode::Start).count();
    let height_entries = db.iterator_cf(&height_cf, rocksdb::IteratorMode::Start).count();
    let step_entries = db.iterator_cf(&step_cf, rocksdb::IteratorMode::Start).count();
    let branch_count = db.iterator_cf(&tips_cf, rocksdb::IteratorMode::Start).count();
    let has_checkpoint = db.get_cf(&meta_cf, b"checkpoint")?.is_some();

    println!("db_dir: {db_path:?}");
    println!("stored blocks: {block_count}");
    println!("distinct heights indexed: {height_entries}");
    println!("distinct steps indexed: {step_entries}");
    println!("known branches: {branch_count}");
    println!("checkpoint present: {has_checkpoint}");

    Ok(())
}
