//! What the core needs from the peer layer: block/tx announcement feeds,
//! broadcast, and the initial-sync signal.

use std::sync::{Arc, Mutex};
use thorium_events::{Broadcaster, Subscription};
use thorium_types::{Block, BlockId, Transaction, TxId};
use tokio::sync::watch;

/// A block announced by some peer, flagged with the announcer's sync view.
#[derive(Clone)]
pub struct PeerBlockEvent {
    pub block: Arc<Block>,
    pub is_synced: bool,
}

pub trait PeerNet: Send + Sync {
    fn subscribe_block(&self) -> Subscription<PeerBlockEvent>;
    fn subscribe_tx(&self) -> Subscription<Arc<Transaction>>;
    fn broadcast_block(&self, block: Arc<Block>);
    fn broadcast_tx(&self, tx: Arc<Transaction>);
    /// Resolves to `true` once initial sync completes; solo nodes
    /// pre-assert it.
    fn synced(&self) -> watch::Receiver<bool>;
    fn is_synced(&self) -> bool;
}

/// Loopback peer layer for solo mode and tests: announcements are injected
/// by hand, broadcasts are recorded for inspection.
pub struct InProcNet {
    blocks: Broadcaster<PeerBlockEvent>,
    txs: Broadcaster<Arc<Transaction>>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
    sent_blocks: Mutex<Vec<BlockId>>,
    sent_txs: Mutex<Vec<TxId>>,
}

impl InProcNet {
    pub fn new(synced: bool) -> Self {
        let (synced_tx, synced_rx) = watch::channel(synced);
        Self {
            blocks: Broadcaster::new(),
            txs: Broadcaster::new(),
            synced_tx,
            synced_rx,
            sent_blocks: Mutex::new(Vec::new()),
            sent_txs: Mutex::new(Vec::new()),
        }
    }

    /// Injects a peer block announcement.
    pub fn announce_block(&self, block: Arc<Block>) {
        self.blocks.send(PeerBlockEvent {
            block,
            is_synced: self.is_synced(),
        });
    }

    /// Injects a peer transaction announcement.
    pub fn announce_tx(&self, tx: Arc<Transaction>) {
        self.txs.send(tx);
    }

    pub fn set_synced(&self, synced: bool) {
        let _ = self.synced_tx.send(synced);
    }

    /// Ids of the blocks this node broadcast, in order.
    pub fn broadcast_block_ids(&self) -> Vec<BlockId> {
        self.sent_blocks.lock().expect("net lock").clone()
    }

    /// Ids of the transactions this node broadcast, in order.
    pub fn broadcast_tx_ids(&self) -> Vec<TxId> {
        self.sent_txs.lock().expect("net lock").clone()
    }
}

impl PeerNet for InProcNet {
    fn subscribe_block(&self) -> Subscription<PeerBlockEvent> {
        self.blocks.subscribe()
    }

    fn subscribe_tx(&self) -> Subscription<Arc<Transaction>> {
        self.txs.subscribe()
    }

    fn broadcast_block(&self, block: Arc<Block>) {
        self.sent_blocks.lock().expect("net lock").push(block.id());
    }

    fn broadcast_tx(&self, tx: Arc<Transaction>) {
        if let Ok(id) = tx.id() {
            self.sent_txs.lock().expect("net lock").push(id);
        }
    }

    fn synced(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    fn is_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }
}
