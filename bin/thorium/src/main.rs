//! Solo-mode node: a dev genesis, an in-memory store, and every core loop
//! wired together. Blocks are minted on a fixed cadence outside PoA.

mod instance;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use thorium_consensus::{Committer, Consensus, ConsensusLoop};
use thorium_network::{InProcNet, TxSync};
use thorium_packer::{Bandwidth, PackMode, Packer, PackerLoop, PackerLoopOptions};
use thorium_pruner::{Pruner, PrunerOptions};
use thorium_state::genesis::dev_accounts;
use thorium_state::{GenesisBuilder, SpacedNodeStore, Stater};
use thorium_storage::{ChainRepository, KvStore, LogDb, MemKv};
use thorium_txpool::{PoolOptions, TxPool, TxStash};
use thorium_types::constants::BLOCK_INTERVAL;
use thorium_types::ForkConfig;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Genesis timestamp of the dev network; every run rebuilds the same chain.
const DEV_LAUNCH_TIME: u64 = 1_526_400_000;

#[derive(Parser, Debug)]
#[command(name = "thorium", about = "Thorium solo node")]
struct Args {
    /// Directory holding per-instance files (master key, tx stash).
    #[arg(long, default_value = ".thorium")]
    data_dir: String,

    /// Seconds between minted blocks.
    #[arg(long, default_value_t = BLOCK_INTERVAL)]
    block_interval: u64,

    /// Block gas limit; 0 follows the parent.
    #[arg(long, default_value_t = 10_000_000)]
    gas_limit: u64,

    /// Pool capacity.
    #[arg(long, default_value_t = 10_000)]
    tx_pool_limit: usize,

    /// Per-account pool capacity.
    #[arg(long, default_value_t = 128)]
    tx_pool_limit_per_account: usize,

    /// Skip writing event/transfer logs.
    #[arg(long)]
    skip_logs: bool,

    /// Keep the state-history pruner off.
    #[arg(long)]
    disable_pruner: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let args = Args::parse();

    let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let node_store = Arc::new(SpacedNodeStore::open(kv.clone()).context("opening trie store")?);
    let stater = Stater::new(node_store.clone());

    let genesis = GenesisBuilder::dev_net(DEV_LAUNCH_TIME)
        .gas_limit(args.gas_limit)
        .build(&stater)
        .context("building genesis")?;
    let genesis_id = genesis.id();
    let repo = ChainRepository::initialize(kv.clone(), genesis).context("opening repository")?;
    info!(genesis = %genesis_id, tag = repo.chain_tag(), "chain ready");

    let instance = instance::InstanceDir::open(&args.data_dir, genesis_id)
        .context("opening instance directory")?;
    let master_key = instance.master_key().context("loading master key")?;

    for account in dev_accounts() {
        info!(address = %account.address, "dev account funded");
    }

    let fork = ForkConfig::all_at_genesis();
    let pool = Arc::new(TxPool::new(
        repo.clone(),
        PoolOptions {
            limit: args.tx_pool_limit,
            limit_per_account: args.tx_pool_limit_per_account,
            ..Default::default()
        },
    ));
    let stash = TxStash::new(instance.tx_stash_path());
    match stash.load(&pool) {
        Ok(count) if count > 0 => info!(count, "tx stash restored"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "tx stash not restored"),
    }

    // Solo: the loopback peer layer reports synced from the start.
    let net = Arc::new(InProcNet::new(true));
    let logdb = Arc::new(LogDb::new(kv.clone()));
    let bandwidth = Arc::new(Bandwidth::new());

    let packer = Arc::new(Packer::new(
        stater.clone(),
        repo.clone(),
        thorium_types::crypto::address_of(&master_key),
        None,
        fork,
        0,
        args.block_interval,
    ));
    let committer = Committer::new(
        repo.clone(),
        kv.clone(),
        node_store.clone(),
        logdb.clone(),
        pool.clone(),
        net.clone(),
        args.skip_logs,
    );
    let validator = Consensus::new(stater.clone(), repo.clone(), fork, args.block_interval);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (packed_tx, packed_rx) = mpsc::channel(1);
    let mut tasks = Vec::new();

    let consensus_loop = ConsensusLoop::new(
        repo.clone(),
        validator,
        committer,
        net.clone(),
        packed_rx,
        args.block_interval,
    );
    tasks.push(tokio::spawn(consensus_loop.run(cancel_rx.clone())));

    let packer_loop = PackerLoop::new(
        packer,
        repo.clone(),
        pool.clone(),
        net.clone(),
        bandwidth,
        master_key,
        fork,
        PackerLoopOptions {
            mode: PackMode::Solo,
            block_interval: args.block_interval,
            adaptive_gas_limit: false,
            solo_gas_limit: args.gas_limit,
        },
        packed_tx,
    );
    tasks.push(tokio::spawn(packer_loop.run(cancel_rx.clone())));

    let tx_sync = Arc::new(TxSync::new(pool.clone(), net.clone()));
    {
        let tx_sync = tx_sync.clone();
        let cancel = cancel_rx.clone();
        tasks.push(tokio::spawn(async move {
            tx_sync.run_outbound(cancel).await;
            Ok(())
        }));
    }
    {
        let cancel = cancel_rx.clone();
        tasks.push(tokio::spawn(async move {
            tx_sync.run_inbound(cancel).await;
            Ok(())
        }));
    }

    if !args.disable_pruner {
        let pruner = Pruner::new(
            repo.clone(),
            kv.clone(),
            node_store.clone(),
            PrunerOptions {
                poll_interval: Duration::from_secs(1),
                ..Default::default()
            },
        );
        tasks.push(tokio::spawn(pruner.run(cancel_rx.clone())));
    }

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    cancel_tx.send(true).ok();
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "task ended with error"),
            Err(e) => warn!(error = %e, "task panicked"),
        }
    }
    if let Err(e) = stash.save(&pool) {
        warn!(error = %e, "tx stash not saved");
    }
    info!("bye");
    Ok(())
}
