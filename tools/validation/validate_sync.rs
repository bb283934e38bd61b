/// Standalone diagnostic: compares the local block store's highest stored
/// height against the RPC node's reported head, and walks back from the
/// highest stored block to confirm the parent chain has no gaps.
use clap::Parser;
use std::path::PathBuf;

use tlbc_monitor::rpc::RpcClient;
use tlbc_monitor::store::BlockStore;

#[derive(Parser)]
struct Args {
    /// Directory containing the RocksDB block store.
    #[arg(long)]
    db_dir: PathBuf,

    /// JSON-RPC endpoint of the node to compare against.
    #[arg(long, default_value = "http://localhost:8545")]
    rpc_uri: String,

    /// How many ancestors to walk back checking for gaps.
    #[arg(long, default_value_t = 1000)]
    max_walk: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let store = BlockStore::open_read_only(&args.db_dir.join("tlbc-monitor.db"))?;
    let rpc = RpcClient::new(&args.rpc_uri)?;

    let remote_height = rpc.block_number()?;
    println!("remote head height: {remote_height}");

    let Some(local_height) = store.highest_stored_height()? else {
        println!("local store is empty; nothing to validate");
        return Ok(());
    };
    println!("local highest stored height: {local_height}");
    if remote_height > local_height {
        println!("behind by {} blocks", remote_height - local_height);
    } else {
        println!("caught up with remote head");
    }

    let candidates = store.get_blocks_by_height(local_height)?;
    let Some(mut cursor) = candidates.into_iter().next() else {
        println!("height index points at an empty bucket, this is a bug in the store");
        return Ok(());
    };

    let mut walked = 0u64;
    while cursor.height > 0 && walked < args.max_walk {
        match store.get_block(&cursor.parent_hash)? {
            Some(parent) => {
                cursor = parent;
                walked += 1;
            }
            None => {
                println!("chain break: no parent found for block at height {}", cursor.height);
                return Ok(());
            }
        }
    }
    println!("walked {walked} contiguous ancestors back from the highest stored block without a gap");

    Ok(())
}
