use super::*;
use secp256k1::SecretKey;
use thorium_state::{GenesisBuilder, Stater, Trie};
use thorium_storage::MemKv;
use thorium_types::block::txs_root;
use thorium_types::receipt::receipts_root;
use thorium_types::{Address, Block, Bytes, Features, Header};
use thorium_types::U256;

struct Chain {
    kv: Arc<dyn KvStore>,
    store: Arc<SpacedNodeStore>,
    stater: Stater,
    repo: Arc<ChainRepository>,
    head_root: B256,
    head_index_root: B256,
    key: SecretKey,
}

impl Chain {
    fn new() -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(MemKv::new());
        let store = Arc::new(SpacedNodeStore::open(kv.clone()).unwrap());
        let stater = Stater::new(store.clone());
        let genesis = GenesisBuilder::dev_net(1_000).build(&stater).unwrap();
        let head_root = genesis.header().state_root;
        let repo = ChainRepository::initialize(kv.clone(), genesis).unwrap();
        Self {
            kv,
            store,
            stater,
            repo,
            head_root,
            head_index_root: EMPTY_ROOT,
            key: SecretKey::new(&mut rand::thread_rng()),
        }
    }

    /// Appends one best block whose state writes `counter` into a balance.
    fn grow(&mut self, counter: u64) {
        let best = self.repo.best_block_summary();
        let number = best.number() + 1;

        let mut state = self.stater.new_state(self.head_root);
        state
            .set_balance(Address::repeat_byte(0x42), U256::from(counter))
            .unwrap();
        let root = state.stage(number).unwrap().commit().unwrap();

        let header = Header {
            parent_id: best.id(),
            timestamp: best.header.timestamp + 10,
            gas_limit: best.header.gas_limit,
            beneficiary: Address::ZERO,
            gas_used: 0,
            total_score: best.header.total_score + 1,
            txs_root: txs_root(&[]),
            state_root: root,
            receipts_root: receipts_root(&[]),
            features: Features::default(),
            signature: Bytes::new(),
        }
        .sign(&self.key);
        let block = Block::new(header, Vec::new());
        let id = block.id();
        self.repo.add_block(block, Vec::new(), 0, true).unwrap();
        self.head_index_root = index::extend(
            self.store.as_ref(),
            &self.kv,
            self.head_index_root,
            id,
        )
        .unwrap();
        self.head_root = root;
    }

    fn pruner(&self, options: PrunerOptions) -> Pruner {
        Pruner::new(self.repo.clone(), self.kv.clone(), self.store.clone(), options)
    }
}

#[test]
fn status_round_trips_through_the_store() {
    let chain = Chain::new();
    let pruner = chain.pruner(PrunerOptions::default());
    assert!(matches!(pruner.load_status().unwrap().step, Step::Initiate));

    let status = Status {
        n1: 3,
        n2: 9,
        step: Step::DropStale,
        cycles: 2,
    };
    pruner.save_status(&status).unwrap();
    let loaded = pruner.load_status().unwrap();
    assert_eq!(loaded.n1, 3);
    assert_eq!(loaded.n2, 9);
    assert_eq!(loaded.cycles, 2);
    assert!(matches!(loaded.step, Step::DropStale));
}

#[test]
fn bootstrap_archive_keeps_both_endpoints_readable_after_a_sweep() {
    let mut chain = Chain::new();
    for counter in 1..=5 {
        chain.grow(counter);
    }
    let head_root = chain.head_root;
    let head_index_root = chain.head_index_root;

    let pruner = chain.pruner(PrunerOptions::default());
    assert!(pruner.archive_index(0, 5, true).unwrap() > 0);
    assert!(pruner.archive_accounts(0, 5, true).unwrap() > 0);

    chain.store.switch_slot().unwrap();
    chain.store.sweep_retired(u32::MAX).unwrap();

    // The archived head state answers reads without the live space.
    let state = chain.stater.new_state(head_root);
    assert_eq!(
        state.balance(Address::repeat_byte(0x42)).unwrap(),
        U256::from(5u64)
    );

    // The archived index trie still resolves heights.
    let index_trie = Trie::open(chain.store.as_ref(), head_index_root);
    let resolved = index_trie.get(&3u32.to_be_bytes()).unwrap().unwrap();
    let chain_view = chain.repo.new_chain(chain.repo.best_block_summary().id());
    assert_eq!(
        resolved,
        chain_view.block_id_at(3).unwrap().unwrap().as_bytes().to_vec()
    );

    // The genesis endpoint survived too.
    let genesis_header = chain
        .repo
        .get_block_header(chain_view.block_id_at(0).unwrap().unwrap())
        .unwrap()
        .unwrap();
    let genesis_state = chain.stater.new_state(genesis_header.state_root);
    assert!(genesis_state
        .balance(thorium_state::genesis::dev_accounts()[0].address)
        .unwrap()
        > U256::ZERO);
}

#[test]
fn follow_up_cycles_copy_only_the_diff() {
    let mut chain = Chain::new();
    for counter in 1..=3 {
        chain.grow(counter);
    }
    let pruner = chain.pruner(PrunerOptions::default());
    let bootstrap_copied = pruner.archive_accounts(0, 3, true).unwrap();

    for counter in 4..=6 {
        chain.grow(counter);
    }
    let incremental_copied = pruner.archive_accounts(3, 6, false).unwrap();
    assert!(incremental_copied > 0);
    assert!(incremental_copied < bootstrap_copied);
}

#[tokio::test]
async fn run_completes_a_cycle_and_persists_progress() {
    let mut chain = Chain::new();
    chain.grow(1);

    let pruner = chain.pruner(PrunerOptions {
        max_state_history: 0,
        poll_interval: Duration::from_millis(2),
    });
    let repo = chain.repo.clone();
    let kv = chain.kv.clone();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { pruner.run(cancel_rx).await });

    // Feed blocks until the pruner has been through a full cycle.
    let mut counter = 1u64;
    let mut cycled = false;
    for _ in 0..2_000 {
        chain.grow(counter + 1);
        counter += 1;
        let status: Option<Status> = kv
            .get(SPACE_META, KEY_STATUS)
            .unwrap()
            .and_then(|raw| bcs::from_bytes(&raw).ok());
        if status.map(|s| s.cycles).unwrap_or(0) >= 1 {
            cycled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(cycled, "pruner never completed a cycle");

    cancel_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // The swept window endpoint still resolves through the archive.
    let best = repo.best_block_summary();
    assert!(best.number() > 140);
}
