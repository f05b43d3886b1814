//! Shardline dev node.
//!
//! Runs one shard of the system in a single process: the shard's chain,
//! for worker shards a read-only mirror of the reference chain, and the
//! mining worker. Network ingestion (peer gossip, remote transaction
//! submission) attaches through the chain's public APIs and is out of
//! scope here.

mod pool;

use clap::Parser;
use pool::DevPool;
use shardline_chain::{BlockChain, ChainConfig, CrossShardState, DataLog, DevEngine, EventHub};
use shardline_miner::{Worker, WorkerConfig, TX_CHAN_SIZE};
use shardline_state::StateDb;
use shardline_storage::MemoryDb;
use shardline_types::{Address, Block, ShardId};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Block gas limit fixed for the whole chain at genesis.
const GENESIS_GAS_LIMIT: u64 = 80_000_000;

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Sharded execution engine dev node")]
#[command(version)]
struct Cli {
    /// Shard to operate (0 is the reference shard).
    #[arg(long, default_value = "0")]
    shard: u64,

    /// Number of shards in the system.
    #[arg(long, default_value = "2")]
    num_shards: u64,

    /// Directory for measurement log files.
    #[arg(long, default_value = "logs")]
    logdir: PathBuf,

    /// Directory holding init-contracts<shard>.json.
    #[arg(long, default_value = ".")]
    contracts_dir: PathBuf,

    /// Resubmit interval for mining work (e.g. "3s").
    #[arg(long, default_value = "3s")]
    recommit: humantime::Duration,

    /// Coinbase address as 40 hex characters.
    #[arg(long)]
    coinbase: Option<String>,

    /// Extra data embedded into mined blocks.
    #[arg(long)]
    extra: Option<String>,

    /// Keep every state snapshot instead of pruning old ones.
    #[arg(long)]
    archive: bool,

    /// Start mining immediately.
    #[arg(long)]
    mine: bool,
}

fn parse_coinbase(hex_addr: &str) -> Result<Address, String> {
    let trimmed = hex_addr.trim_start_matches("0x");
    let bytes = hex::decode(trimmed).map_err(|e| format!("invalid coinbase hex: {e}"))?;
    if bytes.len() != Address::BYTES {
        return Err(format!(
            "coinbase must be {} bytes, got {}",
            Address::BYTES,
            bytes.len()
        ));
    }
    Ok(Address::from_slice(&bytes))
}

/// Build a chain over a fresh in-memory store with an empty-state genesis.
fn open_chain(
    shard: ShardId,
    num_shards: u64,
    ref_mirror: bool,
    archive: bool,
    shared: Arc<CrossShardState>,
    datalog: DataLog,
) -> Arc<BlockChain> {
    let db = Arc::new(MemoryDb::new());
    let mut state = StateDb::new();
    let root = state.commit(db.as_ref());

    let block_shard = if ref_mirror { ShardId(0) } else { shard };
    let mut genesis = Block::genesis(block_shard, GENESIS_GAS_LIMIT);
    genesis.header.state_root = root;
    BlockChain::write_genesis(db.as_ref(), &genesis);

    let chain = BlockChain::new(
        db,
        ChainConfig {
            shard,
            num_shards,
            ref_mirror,
            archive,
        },
        Arc::new(DevEngine::new()),
        shared,
        Arc::new(EventHub::new()),
        datalog,
        // Locally mined blocks win total-difficulty ties.
        Some(Arc::new(|_: &Block| true)),
    )
    .unwrap_or_else(|err| {
        error!(%err, "failed to open chain");
        std::process::exit(1);
    });
    BlockChain::spawn_janitor(&chain);
    chain
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let shard = ShardId(cli.shard);

    if let Err(err) = std::fs::create_dir_all(&cli.logdir) {
        error!(%err, "failed to create log directory");
        std::process::exit(1);
    }
    let datalog = DataLog::new(&cli.logdir);

    let shared = Arc::new(CrossShardState::new());

    // Worker shards run a read-only mirror of the reference chain next to
    // their own chain; the mirror must come first so the shared genesis
    // commitments are seeded before the local chain starts.
    let ref_chain = if shard.is_reference() {
        None
    } else {
        Some(open_chain(
            shard,
            cli.num_shards,
            true,
            cli.archive,
            Arc::clone(&shared),
            datalog.clone(),
        ))
    };
    let chain = open_chain(
        shard,
        cli.num_shards,
        false,
        cli.archive,
        Arc::clone(&shared),
        datalog.clone(),
    );

    let (txs_tx, txs_rx) = mpsc::channel(TX_CHAN_SIZE);
    let tx_pool = Arc::new(DevPool::new(shard, cli.num_shards, txs_tx));

    let worker = Worker::new(
        WorkerConfig {
            shard,
            num_shards: cli.num_shards,
            recommit: *cli.recommit,
            init_contracts_dir: cli.contracts_dir.clone(),
        },
        Arc::clone(&chain),
        ref_chain.clone(),
        Arc::clone(&tx_pool) as Arc<dyn shardline_chain::TxPool>,
        txs_rx,
        datalog,
    );

    if let Some(extra) = &cli.extra {
        worker.set_extra(extra.clone().into_bytes());
    }
    if let Some(coinbase) = &cli.coinbase {
        match parse_coinbase(coinbase) {
            Ok(addr) => worker.set_coinbase(addr),
            Err(err) => {
                error!(%err, "invalid --coinbase");
                std::process::exit(1);
            }
        }
    }

    info!(
        shard = shard.0,
        num_shards = cli.num_shards,
        mirror = ref_chain.is_some(),
        mining = cli.mine,
        "shardline node started"
    );

    if cli.mine {
        if cli.coinbase.is_none() {
            error!("--mine requires --coinbase");
            std::process::exit(1);
        }
        worker.start();
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutting down");

    worker.stop();
    worker.close();
    chain.stop();
    if let Some(mirror) = ref_chain {
        mirror.stop();
    }
}
