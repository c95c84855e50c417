//! Checkpointed world-state mutation over the account trie, staged into a
//! new root without touching the previous version until commit.

use crate::store::NodeStore;
use crate::trie::{Trie, EMPTY_ROOT};
use crate::Result;
use crate::StateError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thorium_types::{Address, B256, U256};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: U256,
    pub code: Vec<u8>,
    pub storage_root: [u8; 32],
}

impl Account {
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.code.is_empty() && self.storage_root == EMPTY_ROOT.0
    }
}

/// Opens [`State`]s at arbitrary roots over one node store.
#[derive(Clone)]
pub struct Stater {
    store: Arc<dyn NodeStore>,
}

impl Stater {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }

    pub fn new_state(&self, root: B256) -> State {
        State {
            store: self.store.clone(),
            root,
            accounts: HashMap::new(),
            storage: HashMap::new(),
            journal: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }
}

enum JournalEntry {
    Account {
        address: Address,
        prior: Option<Account>,
    },
    Storage {
        address: Address,
        key: Vec<u8>,
        prior: Option<Vec<u8>>,
    },
}

/// A mutable overlay rooted at one state root. Reads fall through to the
/// trie; writes stay in the overlay until [`State::stage`].
pub struct State {
    store: Arc<dyn NodeStore>,
    root: B256,
    accounts: HashMap<Address, Account>,
    storage: HashMap<(Address, Vec<u8>), Vec<u8>>,
    journal: Vec<JournalEntry>,
}

impl State {
    pub fn root(&self) -> B256 {
        self.root
    }

    pub fn get_account(&self, address: Address) -> Result<Account> {
        if let Some(account) = self.accounts.get(&address) {
            return Ok(account.clone());
        }
        self.load_account(address)
    }

    pub fn balance(&self, address: Address) -> Result<U256> {
        Ok(self.get_account(address)?.balance)
    }

    pub fn set_balance(&mut self, address: Address, balance: U256) -> Result<()> {
        let mut account = self.get_account(address)?;
        account.balance = balance;
        self.write_account(address, account);
        Ok(())
    }

    pub fn add_balance(&mut self, address: Address, amount: U256) -> Result<()> {
        let balance = self.balance(address)?;
        self.set_balance(address, balance.saturating_add(amount))
    }

    /// Debits `amount`; returns false (and leaves the balance alone) when
    /// the account cannot cover it.
    pub fn sub_balance(&mut self, address: Address, amount: U256) -> Result<bool> {
        let balance = self.balance(address)?;
        if balance < amount {
            return Ok(false);
        }
        self.set_balance(address, balance - amount)?;
        Ok(true)
    }

    pub fn code(&self, address: Address) -> Result<Vec<u8>> {
        Ok(self.get_account(address)?.code)
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) -> Result<()> {
        let mut account = self.get_account(address)?;
        account.code = code;
        self.write_account(address, account);
        Ok(())
    }

    pub fn get_storage(&self, address: Address, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(value) = self.storage.get(&(address, key.to_vec())) {
            return Ok(value.clone());
        }
        let account = self.get_account(address)?;
        let trie = Trie::open(self.store.as_ref(), B256::new(account.storage_root));
        Ok(trie.get(key)?.unwrap_or_default())
    }

    /// An empty value clears the slot.
    pub fn set_storage(&mut self, address: Address, key: &[u8], value: Vec<u8>) {
        let map_key = (address, key.to_vec());
        let prior = self.storage.insert(map_key, value);
        self.journal.push(JournalEntry::Storage {
            address,
            key: key.to_vec(),
            prior,
        });
    }

    /// Marks the current mutation point; [`State::revert_to`] unwinds back
    /// to it.
    pub fn new_checkpoint(&self) -> usize {
        self.journal.len()
    }

    pub fn revert_to(&mut self, checkpoint: usize) {
        while self.journal.len() > checkpoint {
            match self.journal.pop().expect("journal entry") {
                JournalEntry::Account { address, prior } => match prior {
                    Some(account) => {
                        self.accounts.insert(address, account);
                    }
                    None => {
                        self.accounts.remove(&address);
                    }
                },
                JournalEntry::Storage { address, key, prior } => {
                    let map_key = (address, key);
                    match prior {
                        Some(value) => {
                            self.storage.insert(map_key, value);
                        }
                        None => {
                            self.storage.remove(&map_key);
                        }
                    }
                }
            }
        }
    }

    /// Folds the overlay into fresh trie nodes. The returned [`Stage`] is
    /// uncommitted; dropping it discards every staged node.
    pub fn stage(&self, ref_number: u32) -> Result<Stage> {
        let mut nodes = Vec::new();

        // Storage tries first; their roots land in the owning accounts.
        let mut storage_by_account: HashMap<Address, Vec<(&[u8], &[u8])>> = HashMap::new();
        for ((address, key), value) in &self.storage {
            storage_by_account
                .entry(*address)
                .or_default()
                .push((key.as_slice(), value.as_slice()));
        }

        let mut touched: HashMap<Address, Account> = self.accounts.clone();
        for (address, mut writes) in storage_by_account {
            let mut account = match touched.get(&address) {
                Some(account) => account.clone(),
                None => self.load_account(address)?,
            };
            writes.sort();
            let mut trie = Trie::open(self.store.as_ref(), B256::new(account.storage_root));
            for (key, value) in writes {
                if value.is_empty() {
                    trie.remove(key)?;
                } else {
                    trie.insert(key, value.to_vec())?;
                }
            }
            account.storage_root = trie.commit(&mut nodes)?.0;
            touched.insert(address, account);
        }

        let mut account_trie = Trie::open(self.store.as_ref(), self.root);
        let mut ordered: Vec<_> = touched.into_iter().collect();
        ordered.sort_by_key(|(address, _)| *address);
        for (address, account) in ordered {
            if account.is_empty() {
                account_trie.remove(address.as_slice())?;
            } else {
                let encoded =
                    bcs::to_bytes(&account).map_err(|e| StateError::Corrupt(e.to_string()))?;
                account_trie.insert(address.as_slice(), encoded)?;
            }
        }
        let root = account_trie.commit(&mut nodes)?;

        Ok(Stage {
            store: self.store.clone(),
            root,
            nodes,
            ref_number,
        })
    }

    fn load_account(&self, address: Address) -> Result<Account> {
        let trie = Trie::open(self.store.as_ref(), self.root);
        match trie.get(address.as_slice())? {
            None => Ok(Account::default()),
            Some(raw) => bcs::from_bytes(&raw).map_err(|e| StateError::Corrupt(e.to_string())),
        }
    }

    fn write_account(&mut self, address: Address, account: Account) {
        let prior = self.accounts.insert(address, account);
        self.journal.push(JournalEntry::Account { address, prior });
    }
}

/// An uncommitted state mutation set: the post-state root plus the nodes
/// that realize it.
pub struct Stage {
    store: Arc<dyn NodeStore>,
    root: B256,
    nodes: Vec<(B256, Vec<u8>)>,
    ref_number: u32,
}

impl Stage {
    /// The root [`Stage::commit`] will make durable.
    pub fn hash(&self) -> B256 {
        self.root
    }

    /// Persists the staged nodes and returns the root.
    pub fn commit(self) -> Result<B256> {
        for (hash, bytes) in &self.nodes {
            self.store.put_node(hash, bytes, self.ref_number)?;
        }
        Ok(self.root)
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;
