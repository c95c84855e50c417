//! Transaction sync: local pool admissions go out to peers, peer
//! announcements come into the pool. Two single-purpose loops.

use crate::peer::PeerNet;
use std::sync::Arc;
use thorium_txpool::{PoolError, TxPool, TxSource};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct TxSync {
    pool: Arc<TxPool>,
    net: Arc<dyn PeerNet>,
}

impl TxSync {
    pub fn new(pool: Arc<TxPool>, net: Arc<dyn PeerNet>) -> Self {
        Self { pool, net }
    }

    /// Forwards locally-admitted transactions to peers until cancelled.
    pub async fn run_outbound(&self, mut cancel: watch::Receiver<bool>) {
        let mut events = self.pool.subscribe_tx_events();
        info!("tx sync outbound started");
        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if event.source == TxSource::Local {
                        self.net.broadcast_tx(event.tx);
                    }
                }
            }
        }
        events.unsubscribe();
        info!("tx sync outbound stopped");
    }

    /// Admits peer-announced transactions into the pool until cancelled.
    pub async fn run_inbound(&self, mut cancel: watch::Receiver<bool>) {
        let mut announcements = self.net.subscribe_tx();
        info!("tx sync inbound started");
        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                tx = announcements.recv() => {
                    let Some(tx) = tx else { break };
                    match self.pool.add(Arc::unwrap_or_clone(tx), TxSource::Remote) {
                        Ok(id) => debug!(tx = %id, "peer tx pooled"),
                        Err(PoolError::BadTx(reason)) => {
                            warn!(reason, "peer tx discarded");
                        }
                        Err(PoolError::Known(_)) => {}
                        Err(e) => debug!(error = %e, "peer tx not admitted"),
                    }
                }
            }
        }
        announcements.unsubscribe();
        info!("tx sync inbound stopped");
    }
}
