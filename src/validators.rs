// src/validators.rs
// Ordered validator roster with quorum arithmetic and stake-weighted leader
// selection. The stake snapshot is frozen into the alias table when the set
// is installed, so every node with the same epoch state elects the same
// leader for the same view.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

use crate::block::{Address, ValidatorIndex, View};

/// 64-bit commit bitmaps bound the set size.
pub const MAX_VALIDATORS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub index: ValidatorIndex,
    pub peer_id: String,
    /// Classical (ed25519) key for proposals and the wire handshake.
    pub public_key: Vec<u8>,
    /// Aggregate-capable key used for votes and QCs.
    pub agg_public_key: Vec<u8>,
    pub address: Address,
    pub stake: U256,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("validator set has {0} members, maximum is {MAX_VALIDATORS}")]
    TooLarge(usize),
    #[error("validator set is empty")]
    Empty,
    #[error("validator indices must be dense, missing index {0}")]
    SparseIndices(ValidatorIndex),
}

#[derive(Debug, Clone)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    by_peer: HashMap<String, ValidatorIndex>,
    alias: AliasTable,
    /// Digest of the installed roster, mixed into leader hashing.
    seed: [u8; 32],
}

impl ValidatorSet {
    /// Install a roster. Indices must be dense `0..n`; membership changes
    /// only through `replace` at epoch boundaries.
    pub fn new(mut roster: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        if roster.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        if roster.len() > MAX_VALIDATORS {
            return Err(ValidatorSetError::TooLarge(roster.len()));
        }
        roster.sort_by_key(|v| v.index);
        for (i, v) in roster.iter().enumerate() {
            if v.index as usize != i {
                return Err(ValidatorSetError::SparseIndices(i as ValidatorIndex));
            }
        }

        let by_peer = roster
            .iter()
            .map(|v| (v.peer_id.clone(), v.index))
            .collect();
        let alias = AliasTable::build(&roster.iter().map(|v| v.stake).collect::<Vec<_>>());
        let seed = roster_digest(&roster);

        Ok(Self {
            validators: roster,
            by_peer,
            alias,
            seed,
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// `q = ⌊2n/3⌋ + 1`.
    pub fn quorum_threshold(&self) -> usize {
        (2 * self.validators.len()) / 3 + 1
    }

    pub fn get(&self, index: ValidatorIndex) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn get_by_peer(&self, peer_id: &str) -> Option<&Validator> {
        self.by_peer
            .get(peer_id)
            .and_then(|idx| self.get(*idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    /// Deterministic stake-weighted leader for `view`: hash the view into
    /// the alias table built at install time.
    pub fn leader(&self, view: View) -> &Validator {
        let mut hasher = Sha256::new();
        hasher.update(b"basalt-leader");
        hasher.update(self.seed);
        hasher.update(view.to_be_bytes());
        let digest = hasher.finalize();

        let column_draw = u64::from_be_bytes(digest[0..8].try_into().unwrap_or_default());
        let coin_draw = u32::from_be_bytes(digest[8..12].try_into().unwrap_or_default());
        let index = self.alias.pick(column_draw, coin_draw);
        &self.validators[index]
    }

    /// Epoch-boundary swap. Only the epoch manager's output lands here;
    /// indices inside one epoch never change.
    pub fn replace(&mut self, next: ValidatorSet) {
        *self = next;
    }

    /// Reconcile a placeholder row once the peer's real identity arrives in
    /// its handshake.
    pub fn update_identity(
        &mut self,
        index: ValidatorIndex,
        peer_id: String,
        public_key: Vec<u8>,
        agg_public_key: Vec<u8>,
    ) -> bool {
        let Some(v) = self.validators.get_mut(index as usize) else {
            return false;
        };
        self.by_peer.remove(&v.peer_id);
        v.peer_id = peer_id.clone();
        v.public_key = public_key;
        v.agg_public_key = agg_public_key;
        self.by_peer.insert(peer_id, index);
        true
    }

    /// `(index, agg_public_key)` pairs for the validators set in `bitmap`,
    /// ascending, as the aggregate verifier expects.
    pub fn signers_from_bitmap(&self, bitmap: u64) -> Vec<(ValidatorIndex, Vec<u8>)> {
        self.validators
            .iter()
            .filter(|v| bitmap & (1u64 << v.index) != 0)
            .map(|v| (v.index, v.agg_public_key.clone()))
            .collect()
    }
}

fn roster_digest(roster: &[Validator]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for v in roster {
        hasher.update([v.index]);
        hasher.update(&v.address);
        let mut stake = [0u8; 32];
        v.stake.to_big_endian(&mut stake);
        hasher.update(stake);
    }
    hasher.finalize().into()
}

/// Integer Vose alias table over validator stakes. Column probabilities are
/// scaled to 2^32 so sampling needs no floating point.
#[derive(Debug, Clone)]
struct AliasTable {
    prob: Vec<u64>,
    alias: Vec<usize>,
}

const ALIAS_SCALE: u128 = 1 << 32;

impl AliasTable {
    fn build(stakes: &[U256]) -> Self {
        let n = stakes.len();
        let mut weights: Vec<u128> = stakes
            .iter()
            .map(|s| s.min(&U256::from(u128::MAX)).as_u128())
            .collect();
        if weights.iter().all(|w| *w == 0) {
            // zero-stake roster (placeholder boot set): uniform
            weights = vec![1; n];
        }
        let total: u128 = weights.iter().sum();

        let mut scaled: Vec<u128> = weights
            .iter()
            .map(|w| w * n as u128 * ALIAS_SCALE / total)
            .collect();

        let mut prob = vec![ALIAS_SCALE as u64; n];
        let mut alias: Vec<usize> = (0..n).collect();
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (i, s) in scaled.iter().enumerate() {
            if *s < ALIAS_SCALE {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            prob[s] = scaled[s] as u64;
            alias[s] = l;
            scaled[l] = scaled[l] + scaled[s] - ALIAS_SCALE;
            if scaled[l] < ALIAS_SCALE {
                small.push(l);
            } else {
                large.push(l);
            }
        }
        // leftovers keep prob = SCALE (always pick own column)

        Self { prob, alias }
    }

    fn pick(&self, column_draw: u64, coin_draw: u32) -> usize {
        let n = self.prob.len();
        let column = (column_draw % n as u64) as usize;
        if (coin_draw as u64) < self.prob[column] {
            column
        } else {
            self.alias[column]
        }
    }
}
