use super::*;
use crate::commit::{CommitOutcome, Committer};
use crate::validator::{Consensus, ValidationError};
use std::time::Duration;
use thorium_network::InProcNet;
use thorium_packer::{Packer, PackedEvent};
use thorium_state::genesis::{dev_accounts, DevAccount};
use thorium_state::{GenesisBuilder, SpacedNodeStore, Stater};
use thorium_storage::{KvStore, LogDb, MemKv, TransferCriteria};
use thorium_txpool::{PoolOptions, TxPool};
use thorium_state::Stage;
use thorium_types::transaction::{Clause, Pricing};
use thorium_types::{
    Address, BlockId, Bytes, Features, ForkConfig, Receipt, Transaction, B256, U256,
};
use tokio::sync::oneshot;

struct Harness {
    kv: Arc<dyn KvStore>,
    stater: Stater,
    repo: Arc<ChainRepository>,
    pool: Arc<TxPool>,
    net: Arc<InProcNet>,
    logdb: Arc<LogDb>,
    committer: Committer,
    validator: Consensus,
    accounts: Vec<DevAccount>,
    fork: ForkConfig,
}

fn harness_with(fork: ForkConfig, two_authorities: bool, skip_logs: bool) -> Harness {
    let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
    let node_store = Arc::new(SpacedNodeStore::open(kv.clone()).unwrap());
    let stater = Stater::new(node_store.clone());
    let accounts = dev_accounts();

    let mut builder = GenesisBuilder::new(1_000);
    for account in &accounts {
        builder = builder.fund(
            account.address,
            U256::from(1_000_000u64) * U256::from(10u64).pow(U256::from(18u8)),
        );
    }
    builder = builder.authority(accounts[0].address, accounts[0].address, B256::ZERO);
    if two_authorities {
        builder = builder.authority(accounts[1].address, accounts[1].address, B256::ZERO);
    }
    let genesis = builder.build(&stater).unwrap();

    let repo = ChainRepository::initialize(kv.clone(), genesis).unwrap();
    let pool = Arc::new(TxPool::new(repo.clone(), PoolOptions::default()));
    let net = Arc::new(InProcNet::new(true));
    let logdb = Arc::new(LogDb::new(kv.clone()));
    let committer = Committer::new(
        repo.clone(),
        kv.clone(),
        node_store.clone(),
        logdb.clone(),
        pool.clone(),
        net.clone(),
        skip_logs,
    );
    let validator = Consensus::new(stater.clone(), repo.clone(), fork, 10);
    Harness {
        kv,
        stater,
        repo,
        pool,
        net,
        logdb,
        committer,
        validator,
        accounts,
        fork,
    }
}

fn harness() -> Harness {
    harness_with(ForkConfig::all_at_genesis(), false, false)
}

impl Harness {
    fn packer_for(&self, index: usize) -> Packer {
        Packer::new(
            self.stater.clone(),
            self.repo.clone(),
            self.accounts[index].address,
            None,
            self.fork,
            0,
            10,
        )
    }

    fn transfer(&self, from: usize, value: u64, nonce: u64) -> Transaction {
        Transaction {
            chain_tag: self.repo.chain_tag(),
            block_ref: [0; 8],
            expiration: 720,
            clauses: vec![Clause::transfer(
                Address::repeat_byte(0xaa),
                U256::from(value),
            )],
            pricing: Pricing::Legacy { gas_price_coef: 0 },
            gas: 100_000,
            depends_on: None,
            nonce,
            features: Features::default(),
            signature: Bytes::new(),
        }
        .sign(&self.accounts[from].key)
    }

    /// Builds a PoA-valid block by `signer_index` on top of `parent_id`,
    /// scheduling no earlier than `now`.
    fn build_block(
        &self,
        signer_index: usize,
        parent_id: BlockId,
        now: u64,
        txs: &[Transaction],
    ) -> (Arc<Block>, Stage, Vec<Receipt>) {
        let parent = self.repo.get_block_summary(parent_id).unwrap().unwrap();
        let mut flow = self.packer_for(signer_index).schedule(&parent, now).unwrap();
        for tx in txs {
            flow.adopt(tx).unwrap();
        }
        let (block, stage, receipts) = flow.pack(&self.accounts[signer_index].key).unwrap();
        (Arc::new(block), stage, receipts)
    }
}

#[test]
fn packed_blocks_validate_cleanly() {
    let harness = harness();
    let genesis = harness.repo.best_block_summary();
    let tx = harness.transfer(2, 10_000, 1);
    let (block, stage, receipts) =
        harness.build_block(0, genesis.id(), genesis.header.timestamp + 1, &[tx]);

    let (validated_stage, validated_receipts) = harness
        .validator
        .process(&genesis, &block, block.header().timestamp)
        .unwrap();
    assert_eq!(validated_stage.hash(), block.header().state_root);
    assert_eq!(validated_receipts, receipts);
    assert_eq!(stage.hash(), validated_stage.hash());
}

#[test]
fn tampered_state_root_is_permanently_invalid() {
    let harness = harness();
    let genesis = harness.repo.best_block_summary();
    let (block, _, _) =
        harness.build_block(0, genesis.id(), genesis.header.timestamp + 1, &[]);
    let mut header = block.header().clone();
    header.state_root = B256::repeat_byte(0xde);
    let header = header.sign(&harness.accounts[0].key);
    let tampered = Block::new(header, Vec::new());

    let result = harness
        .validator
        .process(&genesis, &tampered, tampered.header().timestamp);
    assert!(matches!(result, Err(ValidationError::Invalid(_))));
}

#[test]
fn stranger_signed_blocks_are_rejected() {
    let harness = harness();
    let genesis = harness.repo.best_block_summary();
    let (block, _, _) =
        harness.build_block(0, genesis.id(), genesis.header.timestamp + 1, &[]);
    // Re-sign with a non-authority key.
    let header = block.header().clone().sign(&harness.accounts[5].key);
    let forged = Block::new(header, Vec::new());

    let result = harness
        .validator
        .process(&genesis, &forged, forged.header().timestamp);
    assert!(matches!(result, Err(ValidationError::Invalid(_))));
}

#[test]
fn future_blocks_park_in_the_heap_until_their_time() {
    let harness = harness();
    let genesis = harness.repo.best_block_summary();
    let (block, _, receipts) =
        harness.build_block(0, genesis.id(), genesis.header.timestamp + 1, &[]);
    let when = block.header().timestamp;

    // Well before the slot: tolerance exceeded, parked.
    let early = when - 11;
    let result = harness.validator.process(&genesis, &block, early);
    assert!(matches!(result, Err(ValidationError::FutureBlock)));

    let mut heap = FutureHeap::new();
    assert!(!heap.contains(block.id()));
    heap.push(block.clone());

    assert!(heap.pop_expired(when - 1).is_none());
    let released = heap.pop_expired(when).unwrap();
    let (stage, validated_receipts) = harness
        .validator
        .process(&genesis, &released, when)
        .unwrap();
    assert_eq!(validated_receipts, receipts);
    let outcome = harness
        .committer
        .commit_block(released, Some(stage), validated_receipts)
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Trunk);
    assert_eq!(harness.repo.best_block_summary().id(), block.id());
}

#[test]
fn commit_writes_transfer_logs_with_clause_indices() {
    let harness = harness();
    let genesis = harness.repo.best_block_summary();
    let tx = harness.transfer(2, 10_000, 1);
    let (block, stage, receipts) =
        harness.build_block(0, genesis.id(), genesis.header.timestamp + 1, &[tx]);

    let outcome = harness
        .committer
        .commit_block(block.clone(), Some(stage), receipts)
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Trunk);

    let rows = harness
        .logdb
        .filter_transfers(&TransferCriteria::default())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].clause_index, 0);
    assert_eq!(rows[0].amount, U256::from(10_000u64));
    assert_eq!(rows[0].block_id, block.id());
    assert_eq!(harness.logdb.newest_block_id().unwrap(), Some(block.id()));

    // Recipient credited in the committed state.
    let state = harness
        .stater
        .new_state(block.header().state_root);
    assert_eq!(
        state.balance(Address::repeat_byte(0xaa)).unwrap(),
        U256::from(10_000u64)
    );

    // The commit broadcast the block.
    assert_eq!(harness.net.broadcast_block_ids(), vec![block.id()]);
}

#[test]
fn skip_logs_leaves_the_log_db_untouched() {
    let harness = harness_with(ForkConfig::all_at_genesis(), false, true);
    let genesis = harness.repo.best_block_summary();
    let tx = harness.transfer(2, 10_000, 1);
    let (block, stage, receipts) =
        harness.build_block(0, genesis.id(), genesis.header.timestamp + 1, &[tx]);
    harness
        .committer
        .commit_block(block, Some(stage), receipts)
        .unwrap();
    assert_eq!(harness.logdb.newest_block_id().unwrap(), None);
}

#[test]
fn reorg_requeues_abandoned_txs_and_rewrites_logs() {
    let mut fork = ForkConfig::all_at_genesis();
    fork.vip214 = u32::MAX; // deterministic round-robin
    let harness = harness_with(fork, true, false);
    let genesis = harness.repo.best_block_summary();
    let start = genesis.header.timestamp;

    // Authority 1 owns the first slot: an on-time block scoring the full
    // active count, carrying one transfer.
    let trunk_tx = harness.transfer(2, 10_000, 1);
    let (trunk, trunk_stage, trunk_receipts) =
        harness.build_block(1, genesis.id(), start + 1, &[trunk_tx.clone()]);
    assert_eq!(trunk.header().total_score, 2);
    harness
        .committer
        .commit_block(trunk.clone(), Some(trunk_stage), trunk_receipts)
        .unwrap();
    assert_eq!(harness.repo.best_block_summary().id(), trunk.id());

    // Authority 0 builds a competing branch from genesis, skipping slot 1,
    // so its first block scores less and stays a branch.
    let (b1, b1_stage, b1_receipts) =
        harness.build_block(0, genesis.id(), start + 11, &[]);
    assert_eq!(b1.header().total_score, 1);
    let outcome = harness
        .committer
        .commit_block(b1.clone(), Some(b1_stage), b1_receipts)
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Branch);
    assert_eq!(harness.repo.best_block_summary().id(), trunk.id());

    // The branch keeps growing until its score strictly beats the trunk.
    let (b2, b2_stage, b2_receipts) =
        harness.build_block(0, b1.id(), b1.header().timestamp + 1, &[]);
    harness
        .committer
        .commit_block(b2.clone(), Some(b2_stage), b2_receipts)
        .unwrap();
    let (b3, b3_stage, b3_receipts) =
        harness.build_block(0, b2.id(), b2.header().timestamp + 1, &[]);
    assert!(b3.header().total_score > trunk.header().total_score);
    let outcome = harness
        .committer
        .commit_block(b3.clone(), Some(b3_stage), b3_receipts)
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Trunk);
    assert_eq!(harness.repo.best_block_summary().id(), b3.id());

    // The abandoned trunk's transaction went back to the pool.
    assert!(harness.pool.contains(trunk_tx.id().unwrap()));

    // The log db follows the new trunk only.
    assert!(!harness.logdb.has_block_id(trunk.id()).unwrap());
    assert!(harness.logdb.has_block_id(b3.id()).unwrap());
    assert!(harness
        .logdb
        .filter_transfers(&TransferCriteria::default())
        .unwrap()
        .is_empty());

    // The new head was broadcast.
    assert!(harness.net.broadcast_block_ids().contains(&b3.id()));
}

#[tokio::test]
async fn consensus_loop_resolves_orphans_one_generation_at_a_time() {
    // Producer side: two blocks on its own store.
    let producer = harness();
    let genesis = producer.repo.best_block_summary();
    let (b1, b1_stage, b1_receipts) =
        producer.build_block(0, genesis.id(), genesis.header.timestamp + 1, &[]);
    producer
        .committer
        .commit_block(b1.clone(), Some(b1_stage), b1_receipts)
        .unwrap();
    let (b2, b2_stage, b2_receipts) =
        producer.build_block(0, b1.id(), b1.header().timestamp + 1, &[]);
    producer
        .committer
        .commit_block(b2.clone(), Some(b2_stage), b2_receipts)
        .unwrap();

    // Consumer side: same genesis, fresh store, fed out of order.
    let consumer = harness();
    let (packed_tx, packed_rx) = tokio::sync::mpsc::channel::<PackedEvent>(1);
    let consensus_loop = ConsensusLoop::new(
        consumer.repo.clone(),
        Consensus::new(
            consumer.stater.clone(),
            consumer.repo.clone(),
            consumer.fork,
            10,
        ),
        Committer::new(
            consumer.repo.clone(),
            consumer.kv.clone(),
            consumer.stater.store().clone(),
            consumer.logdb.clone(),
            consumer.pool.clone(),
            consumer.net.clone(),
            false,
        ),
        consumer.net.clone(),
        packed_rx,
        1,
    );
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { consensus_loop.run(cancel_rx).await });

    // Child first, then parent; re-announce until the loop has caught up
    // (announcements before its subscription exists are lost by design).
    let mut settled = false;
    for _ in 0..500 {
        consumer.net.announce_block(b2.clone());
        consumer.net.announce_block(b1.clone());
        if consumer.repo.best_block_summary().id() == b2.id() {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "orphan chain never resolved");
    assert!(consumer.repo.contains_block(b1.id()).unwrap());

    cancel_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    drop(packed_tx);
}

#[tokio::test]
async fn consensus_loop_commits_packed_blocks_without_validation() {
    let harness = harness();
    let genesis = harness.repo.best_block_summary();

    // A mock (out-of-consensus) block: the packed path must accept it.
    let packer = harness.packer_for(0);
    let mut flow = packer
        .mock(&genesis, genesis.header.timestamp + 10, 10_000_000)
        .unwrap();
    let tx = harness.transfer(2, 7_777, 1);
    flow.adopt(&tx).unwrap();
    let (block, stage, receipts) = flow.pack(&harness.accounts[0].key).unwrap();
    let block = Arc::new(block);

    let (packed_tx, packed_rx) = tokio::sync::mpsc::channel::<PackedEvent>(1);
    let consensus_loop = ConsensusLoop::new(
        harness.repo.clone(),
        Consensus::new(
            harness.stater.clone(),
            harness.repo.clone(),
            harness.fork,
            10,
        ),
        Committer::new(
            harness.repo.clone(),
            harness.kv.clone(),
            harness.stater.store().clone(),
            harness.logdb.clone(),
            harness.pool.clone(),
            harness.net.clone(),
            false,
        ),
        harness.net.clone(),
        packed_rx,
        1,
    );
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { consensus_loop.run(cancel_rx).await });

    let (ack, acked) = oneshot::channel();
    packed_tx
        .send(PackedEvent {
            block: block.clone(),
            stage,
            receipts,
            ack,
        })
        .await
        .unwrap();
    acked.await.expect("committer acks after the commit");

    assert_eq!(harness.repo.best_block_summary().id(), block.id());
    cancel_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
