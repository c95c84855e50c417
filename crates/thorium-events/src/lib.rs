//! A small fan-out event primitive: `Broadcaster<T>` hands out
//! `Subscription<T>`s, each backed by its own unbounded channel. Every loop
//! owns its subscription and unsubscribes (or drops it) on cancel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Registry<T> {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<T>>,
}

/// Clonable fan-out sender. Sending walks all live subscriptions and prunes
/// the ones whose receiver is gone.
pub struct Broadcaster<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }
}

impl<T: Clone> Broadcaster<T> {
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock().expect("registry poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.senders.insert(id, tx);
        Subscription {
            id,
            rx,
            registry: self.registry.clone(),
        }
    }

    pub fn send(&self, event: T) {
        let mut registry = self.registry.lock().expect("registry poisoned");
        registry
            .senders
            .retain(|_, sender| sender.send(event.clone()).is_ok());
    }

    pub fn receiver_count(&self) -> usize {
        self.registry.lock().expect("registry poisoned").senders.len()
    }
}

/// One receiver's end of a broadcast. Dropping it detaches as well; calling
/// [`Subscription::unsubscribe`] makes the detach explicit.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Subscription<T> {
    /// Receives the next event; `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.senders.remove(&self.id);
        }
    }
}
