// src/mempool.rs
// Pending transaction pool: dedup by hash, per-sender nonce ordering,
// base-fee pruning on every commit.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::block::{Address, Transaction, TxHash};
use crate::state::{get_account, StateDb};

/// Pool capacity; admissions beyond this are refused outright.
pub const MAX_MEMPOOL_SIZE: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool")]
    DuplicateTx,
    #[error("nonce {tx_nonce} below account nonce {account_nonce}")]
    NonceGap { tx_nonce: u64, account_nonce: u64 },
    #[error("gas price {offered} below base fee {base_fee}")]
    Underpriced { offered: u64, base_fee: u64 },
    #[error("mempool full")]
    PoolFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MempoolEvent {
    Added(TxHash),
}

#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: Transaction,
    arrived_at_ms: u64,
}

pub struct Mempool {
    entries: HashMap<TxHash, MempoolEntry>,
    /// sender -> nonce -> tx hash; one slot per (sender, nonce).
    by_sender: HashMap<Address, BTreeMap<u64, TxHash>>,
    events: Option<mpsc::UnboundedSender<MempoolEvent>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_sender: HashMap::new(),
            events: None,
        }
    }

    /// Wire the `OnAdded` event stream into the coordinator loop.
    pub fn with_events(events: mpsc::UnboundedSender<MempoolEvent>) -> Self {
        let mut pool = Self::new();
        pool.events = Some(events);
        pool
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &TxHash) -> Option<&Transaction> {
        self.entries.get(hash).map(|e| &e.tx)
    }

    /// Admit a transaction. A same-nonce replacement is accepted when it
    /// pays a strictly higher fee, otherwise it is a duplicate.
    pub fn add(
        &mut self,
        tx: Transaction,
        state: &dyn StateDb,
        base_fee: u64,
        now_ms: u64,
    ) -> Result<TxHash, MempoolError> {
        let hash = tx.hash();
        if self.entries.contains_key(&hash) {
            return Err(MempoolError::DuplicateTx);
        }

        let account_nonce = get_account(state, &tx.sender).nonce;
        if tx.nonce < account_nonce {
            return Err(MempoolError::NonceGap {
                tx_nonce: tx.nonce,
                account_nonce,
            });
        }
        let offered = tx.effective_gas_price(base_fee);
        if offered < base_fee {
            return Err(MempoolError::Underpriced { offered, base_fee });
        }
        if self.entries.len() >= MAX_MEMPOOL_SIZE {
            return Err(MempoolError::PoolFull);
        }

        let slots = self.by_sender.entry(tx.sender).or_default();
        if let Some(existing_hash) = slots.get(&tx.nonce).copied() {
            let existing_price = self
                .entries
                .get(&existing_hash)
                .map(|e| e.tx.effective_gas_price(base_fee))
                .unwrap_or(0);
            if offered <= existing_price {
                return Err(MempoolError::DuplicateTx);
            }
            self.entries.remove(&existing_hash);
        }
        slots.insert(tx.nonce, hash);
        self.entries.insert(
            hash,
            MempoolEntry {
                tx,
                arrived_at_ms: now_ms,
            },
        );

        if let Some(events) = &self.events {
            let _ = events.send(MempoolEvent::Added(hash));
        }
        Ok(hash)
    }

    /// Up to `limit` executable transactions: per sender a contiguous nonce
    /// run starting at the account nonce, funds-checked cumulatively against
    /// the given state snapshot; across senders ordered by nonce then
    /// effective gas price (descending).
    pub fn pending(&self, limit: usize, state: &dyn StateDb, base_fee: u64) -> Vec<Transaction> {
        let mut candidates: Vec<&Transaction> = Vec::new();

        for (sender, slots) in &self.by_sender {
            let account = get_account(state, sender);
            let mut expected = account.nonce;
            let mut spendable = account.balance;
            for (nonce, hash) in slots.range(account.nonce..) {
                if *nonce != expected {
                    break; // gap, later nonces are not executable yet
                }
                let Some(entry) = self.entries.get(hash) else {
                    break;
                };
                let cost = entry.tx.max_cost();
                if spendable < cost {
                    break;
                }
                spendable -= cost;
                expected += 1;
                candidates.push(&entry.tx);
            }
        }

        candidates.sort_by(|a, b| {
            a.nonce.cmp(&b.nonce).then_with(|| {
                b.effective_gas_price(base_fee)
                    .cmp(&a.effective_gas_price(base_fee))
                    .then_with(|| a.hash().cmp(&b.hash()))
            })
        });
        candidates.into_iter().take(limit).cloned().collect()
    }

    /// Drop transactions that made it into a finalised block.
    pub fn remove_confirmed(&mut self, txs: &[Transaction]) {
        for tx in txs {
            let hash = tx.hash();
            if self.entries.remove(&hash).is_some() {
                if let Some(slots) = self.by_sender.get_mut(&tx.sender) {
                    slots.remove(&tx.nonce);
                    if slots.is_empty() {
                        self.by_sender.remove(&tx.sender);
                    }
                }
            }
        }
    }

    /// Drop everything made stale by the latest commit: nonces the account
    /// has already passed and prices under the new base fee.
    pub fn prune_stale(&mut self, state: &dyn StateDb, base_fee: u64) {
        let mut doomed: Vec<(Address, u64, TxHash)> = Vec::new();
        for (hash, entry) in &self.entries {
            let account_nonce = get_account(state, &entry.tx.sender).nonce;
            if entry.tx.nonce < account_nonce
                || entry.tx.effective_gas_price(base_fee) < base_fee
            {
                doomed.push((entry.tx.sender, entry.tx.nonce, *hash));
            }
        }
        for (sender, nonce, hash) in doomed {
            self.entries.remove(&hash);
            if let Some(slots) = self.by_sender.get_mut(&sender) {
                slots.remove(&nonce);
                if slots.is_empty() {
                    self.by_sender.remove(&sender);
                }
            }
        }
    }

    /// Age of the oldest entry, for operator dashboards.
    pub fn oldest_entry_ms(&self) -> Option<u64> {
        self.entries.values().map(|e| e.arrived_at_ms).min()
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}
