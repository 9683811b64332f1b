// src/state.rs
// Abstract state database plus the swap-capable canonical reference.
//
// The consensus core never owns a state-trie implementation; it sees a
// narrow key-value capability with `fork()` for speculative execution and
// an outer mediator whose `swap()` atomically re-points every consumer at a
// replacement (used when sync installs a fully replayed fork).

use parking_lot::RwLock;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::block::Address;

/// Narrow state capability. Mutation goes through `&self`; implementations
/// carry their own interior locking.
pub trait StateDb: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: &[u8], value: Vec<u8>);
    fn delete(&self, key: &[u8]);

    /// Isolated deep copy for speculative execution. Writes to the fork are
    /// invisible to the parent until the fork is swapped in.
    fn fork(&self) -> Arc<dyn StateDb>;

    /// Deterministic digest of the full key-value contents.
    fn root(&self) -> [u8; 32];

    fn len(&self) -> usize;
}

/// In-memory state database. The canonical state of the consensus core is
/// one of these; the persistent trie engine lives behind the same trait in
/// the storage layer.
#[derive(Default)]
pub struct MemState {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn StateDb> {
        Arc::new(Self::new())
    }
}

impl StateDb for MemState {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().get(key).cloned()
    }

    fn set(&self, key: &[u8], value: Vec<u8>) {
        self.inner.write().insert(key.to_vec(), value);
    }

    fn delete(&self, key: &[u8]) {
        self.inner.write().remove(key);
    }

    fn fork(&self) -> Arc<dyn StateDb> {
        Arc::new(MemState {
            inner: RwLock::new(self.inner.read().clone()),
        })
    }

    fn root(&self) -> [u8; 32] {
        let map = self.inner.read();
        let mut hasher = Sha256::new();
        for (k, v) in map.iter() {
            hasher.update((k.len() as u32).to_be_bytes());
            hasher.update(k);
            hasher.update((v.len() as u32).to_be_bytes());
            hasher.update(v);
        }
        hasher.finalize().into()
    }

    fn len(&self) -> usize {
        self.inner.read().len()
    }
}

/// Swap-capable reference to the canonical state. Readers call `current()`
/// per use and never cache the inner Arc across suspension points, so a
/// `swap()` from the sync path is observed by every consumer.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<RwLock<Arc<dyn StateDb>>>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState").finish()
    }
}

impl SharedState {
    pub fn new(state: Arc<dyn StateDb>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemState::shared())
    }

    pub fn current(&self) -> Arc<dyn StateDb> {
        self.inner.read().clone()
    }

    /// Atomically install a replacement state. Returns the previous one so
    /// the caller can log its root.
    pub fn swap(&self, new: Arc<dyn StateDb>) -> Arc<dyn StateDb> {
        std::mem::replace(&mut *self.inner.write(), new)
    }
}

/// Account record stored under `acct/{hex addr}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
}

pub fn account_key(addr: &Address) -> Vec<u8> {
    let mut key = b"acct/".to_vec();
    key.extend_from_slice(hex::encode(addr).as_bytes());
    key
}

pub fn get_account(state: &dyn StateDb, addr: &Address) -> Account {
    state
        .get(&account_key(addr))
        .and_then(|bytes| bincode::deserialize(&bytes).ok())
        .unwrap_or_default()
}

pub fn set_account(state: &dyn StateDb, addr: &Address, account: &Account) {
    if let Ok(bytes) = bincode::serialize(account) {
        state.set(&account_key(addr), bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_is_isolated_until_swapped() {
        let shared = SharedState::in_memory();
        shared.current().set(b"k", b"v1".to_vec());
        let before = shared.current().root();

        let fork = shared.current().fork();
        fork.set(b"k", b"v2".to_vec());
        assert_eq!(shared.current().get(b"k"), Some(b"v1".to_vec()));
        assert_eq!(shared.current().root(), before);

        shared.swap(fork);
        assert_eq!(shared.current().get(b"k"), Some(b"v2".to_vec()));
        assert_ne!(shared.current().root(), before);
    }

    #[test]
    fn root_tracks_contents_not_insertion_order() {
        let a = MemState::new();
        a.set(b"x", b"1".to_vec());
        a.set(b"y", b"2".to_vec());
        let b = MemState::new();
        b.set(b"y", b"2".to_vec());
        b.set(b"x", b"1".to_vec());
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn account_round_trip() {
        let state = MemState::new();
        let addr = [9u8; 20];
        let acct = Account {
            balance: U256::from(1_000u64),
            nonce: 3,
        };
        set_account(&state, &addr, &acct);
        assert_eq!(get_account(&state, &addr), acct);
        assert_eq!(get_account(&state, &[0u8; 20]), Account::default());
    }
}
