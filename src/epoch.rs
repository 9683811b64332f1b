// src/epoch.rs
// Per-block commit bitmaps, liveness accounting and the epoch-boundary
// validator-set rebuild.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::{BlockNumber, ValidatorIndex};
use crate::staking::StakingState;
use crate::storage::BlockStore;
use crate::validators::{Validator, ValidatorSet, ValidatorSetError};

/// Blocks per epoch.
pub const EPOCH_LENGTH: u64 = 100;

/// A validator must sign at least this share of an epoch's commits.
pub const LIVENESS_THRESHOLD_PCT: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InactiveValidator {
    pub validator_index: ValidatorIndex,
    pub first_missed_block: BlockNumber,
    pub last_missed_block: BlockNumber,
    pub missed: u64,
}

/// Produced at a boundary, before any slashing has been applied. The
/// coordinator slashes the inactive validators first and only then asks for
/// the next set, so the snapshot sees the reduced stakes.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: u64,
    pub window_start: BlockNumber,
    pub window_end: BlockNumber,
    pub inactive: Vec<InactiveValidator>,
}

pub struct EpochManager {
    epoch_length: u64,
    validator_set_size: usize,
    liveness_threshold_pct: u64,
    /// Ring of `(block_number, bitmap)` covering the current and previous
    /// epoch.
    bitmaps: VecDeque<(BlockNumber, u64)>,
}

impl EpochManager {
    pub fn new(epoch_length: u64, validator_set_size: usize) -> Self {
        Self {
            epoch_length: epoch_length.max(1),
            validator_set_size: validator_set_size.max(1),
            liveness_threshold_pct: LIVENESS_THRESHOLD_PCT,
            bitmaps: VecDeque::new(),
        }
    }

    pub fn epoch_length(&self) -> u64 {
        self.epoch_length
    }

    /// Rebuild the ring from persisted bitmaps so the boundary computation
    /// after a restart matches the one the original process would have run.
    pub fn replay(&mut self, store: &Arc<dyn BlockStore>, latest: BlockNumber) -> anyhow::Result<()> {
        self.bitmaps.clear();
        if latest == 0 {
            return Ok(());
        }
        let start = (latest - latest % self.epoch_length).max(1);
        for n in start..=latest {
            if let Some(bitmap) = store.get_commit_bitmap(n)? {
                self.record(n, bitmap);
            } else {
                log::warn!("missing commit bitmap for block {} during replay", n);
            }
        }
        log::info!(
            "epoch replay: {} bitmaps loaded up to block {}",
            self.bitmaps.len(),
            latest
        );
        Ok(())
    }

    fn record(&mut self, number: BlockNumber, bitmap: u64) {
        self.bitmaps.push_back((number, bitmap));
        let cap = (2 * self.epoch_length) as usize;
        while self.bitmaps.len() > cap {
            self.bitmaps.pop_front();
        }
    }

    /// Record the commit bitmap of a finalised block; at an epoch boundary
    /// return the liveness summary for the ending epoch.
    pub fn on_block_finalised(
        &mut self,
        number: BlockNumber,
        bitmap: u64,
        n_validators: usize,
    ) -> Option<EpochSummary> {
        self.record(number, bitmap);
        if number == 0 || number % self.epoch_length != 0 {
            return None;
        }

        let window_start = number + 1 - self.epoch_length;
        let window: Vec<&(BlockNumber, u64)> = self
            .bitmaps
            .iter()
            .filter(|(n, _)| *n >= window_start && *n <= number)
            .collect();
        let total = window.len() as u64;

        let mut inactive = Vec::new();
        for index in 0..n_validators.min(crate::validators::MAX_VALIDATORS) {
            let bit = 1u64 << index;
            let signed = window.iter().filter(|(_, b)| b & bit != 0).count() as u64;
            if signed * 100 >= self.liveness_threshold_pct * total {
                continue;
            }
            let first_missed = window
                .iter()
                .find(|(_, b)| b & bit == 0)
                .map(|(n, _)| *n)
                .unwrap_or(window_start);
            let last_missed = window
                .iter()
                .rev()
                .find(|(_, b)| b & bit == 0)
                .map(|(n, _)| *n)
                .unwrap_or(number);
            inactive.push(InactiveValidator {
                validator_index: index as ValidatorIndex,
                first_missed_block: first_missed,
                last_missed_block: last_missed,
                missed: total - signed,
            });
        }

        Some(EpochSummary {
            epoch: number / self.epoch_length,
            window_start,
            window_end: number,
            inactive,
        })
    }

    /// Snapshot the top-k stakers into the next validator set. Called after
    /// epoch-scope slashing has landed. Returning validators keep their
    /// network identity; new entrants get a placeholder row reconciled at
    /// handshake.
    pub fn build_next_set(
        &self,
        staking: &StakingState,
        current: &ValidatorSet,
    ) -> Result<ValidatorSet, ValidatorSetError> {
        let snapshot = staking.snapshot_top_k(self.validator_set_size);
        let roster: Vec<Validator> = snapshot
            .into_iter()
            .enumerate()
            .map(|(i, (address, stake))| {
                let known = current.iter().find(|v| v.address == address);
                match known {
                    Some(v) => Validator {
                        index: i as ValidatorIndex,
                        peer_id: v.peer_id.clone(),
                        public_key: v.public_key.clone(),
                        agg_public_key: v.agg_public_key.clone(),
                        address,
                        stake,
                    },
                    None => Validator {
                        index: i as ValidatorIndex,
                        peer_id: format!("pending-{}", hex::encode(address)),
                        public_key: Vec::new(),
                        agg_public_key: Vec::new(),
                        address,
                        stake,
                    },
                }
            })
            .collect();
        ValidatorSet::new(roster)
    }
}
