// src/slashing.rs
// Applies equivocation and inactivity penalties against the staking ledger
// and records the evidence that justified them.

use chrono::{DateTime, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::block::{Address, BlockHash, BlockNumber, ValidatorIndex, View};
use crate::staking::{StakingError, StakingState};
use crate::storage::EvidenceStore;

/// Structured misbehaviour proof. The storage key is derived from the
/// variant fields only, which is what makes resubmission idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Evidence {
    Equivocation {
        validator_index: ValidatorIndex,
        block_number: BlockNumber,
        view: View,
        hash_a: BlockHash,
        hash_b: BlockHash,
    },
    Inactivity {
        validator_index: ValidatorIndex,
        first_missed_block: BlockNumber,
        last_missed_block: BlockNumber,
    },
}

impl Evidence {
    pub fn kind(&self) -> &'static str {
        match self {
            Evidence::Equivocation { .. } => "equivocation",
            Evidence::Inactivity { .. } => "inactivity",
        }
    }

    pub fn validator_index(&self) -> ValidatorIndex {
        match self {
            Evidence::Equivocation { validator_index, .. } => *validator_index,
            Evidence::Inactivity { validator_index, .. } => *validator_index,
        }
    }

    pub fn block_number(&self) -> BlockNumber {
        match self {
            Evidence::Equivocation { block_number, .. } => *block_number,
            Evidence::Inactivity { first_missed_block, .. } => *first_missed_block,
        }
    }

    /// `(block_number, validator_index, kind)` storage key.
    pub fn key(&self) -> String {
        format!(
            "{:020}/{:03}/{}",
            self.block_number(),
            self.validator_index(),
            self.kind()
        )
    }
}

/// Persisted slashing outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub evidence: Evidence,
    pub validator: Address,
    pub stake_before: U256,
    pub slashed_amount: U256,
    pub stake_after: U256,
    pub observed_at: DateTime<Utc>,
}

impl EvidenceRecord {
    pub fn key(&self) -> String {
        self.evidence.key()
    }
}

#[derive(Debug, Error)]
pub enum SlashError {
    #[error("evidence for block {block} is older than the evidence window (current block {current})")]
    StaleEvidence {
        block: BlockNumber,
        current: BlockNumber,
    },
    #[error("validator {0} has no stake to slash")]
    NoStake(String),
    #[error(transparent)]
    Staking(#[from] StakingError),
    #[error("evidence store: {0}")]
    Store(String),
}

impl From<anyhow::Error> for SlashError {
    fn from(e: anyhow::Error) -> Self {
        SlashError::Store(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SlashingConfig {
    /// Percent of stake burned on equivocation.
    pub equivocation_penalty_pct: u64,
    /// Percent of stake burned at an epoch boundary for inactivity.
    pub inactivity_penalty_pct: u64,
    /// Evidence older than this many epochs is refused.
    pub evidence_window_epochs: u64,
    pub epoch_length: u64,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        Self {
            equivocation_penalty_pct: 50,
            inactivity_penalty_pct: 5,
            evidence_window_epochs: 2,
            epoch_length: crate::epoch::EPOCH_LENGTH,
        }
    }
}

pub struct SlashingEngine {
    store: Arc<dyn EvidenceStore>,
    config: SlashingConfig,
}

impl SlashingEngine {
    pub fn new(store: Arc<dyn EvidenceStore>, config: SlashingConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SlashingConfig {
        &self.config
    }

    fn check_window(
        &self,
        evidence_block: BlockNumber,
        current_block: BlockNumber,
    ) -> Result<(), SlashError> {
        let epoch_of = |n: BlockNumber| n / self.config.epoch_length.max(1);
        if epoch_of(evidence_block) + self.config.evidence_window_epochs < epoch_of(current_block) {
            return Err(SlashError::StaleEvidence {
                block: evidence_block,
                current: current_block,
            });
        }
        Ok(())
    }

    /// Apply an equivocation penalty. Idempotent: identical evidence slashes
    /// exactly once, later submissions return `Ok(None)`.
    pub fn slash_equivocation(
        &self,
        staking: &mut StakingState,
        addr: Address,
        evidence: Evidence,
        current_block: BlockNumber,
    ) -> Result<Option<EvidenceRecord>, SlashError> {
        debug_assert!(matches!(evidence, Evidence::Equivocation { .. }));
        self.check_window(evidence.block_number(), current_block)?;
        self.apply(staking, addr, evidence, self.config.equivocation_penalty_pct)
    }

    /// Apply an inactivity penalty. Only the epoch manager calls this, at
    /// boundaries.
    pub fn slash_inactivity(
        &self,
        staking: &mut StakingState,
        addr: Address,
        evidence: Evidence,
        current_block: BlockNumber,
    ) -> Result<Option<EvidenceRecord>, SlashError> {
        debug_assert!(matches!(evidence, Evidence::Inactivity { .. }));
        self.check_window(evidence.block_number(), current_block)?;
        self.apply(staking, addr, evidence, self.config.inactivity_penalty_pct)
    }

    fn apply(
        &self,
        staking: &mut StakingState,
        addr: Address,
        evidence: Evidence,
        penalty_pct: u64,
    ) -> Result<Option<EvidenceRecord>, SlashError> {
        if self.store.has_evidence(&evidence.key())? {
            log::debug!("evidence {} already applied, skipping", evidence.key());
            return Ok(None);
        }

        let stake_before = staking.get_stake(&addr);
        if stake_before.is_zero() {
            return Err(SlashError::NoStake(hex::encode(addr)));
        }

        let slashed_amount = staking.slash(&addr, penalty_pct)?;
        let stake_after = staking.get_stake(&addr);

        log::error!(
            "SLASHING validator {} ({}): {} of stake burned ({}%), {} remaining",
            evidence.validator_index(),
            evidence.kind(),
            slashed_amount,
            penalty_pct,
            stake_after
        );

        let record = EvidenceRecord {
            evidence,
            validator: addr,
            stake_before,
            slashed_amount,
            stake_after,
            observed_at: Utc::now(),
        };
        self.store.put_evidence(&record)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    fn addr(n: u8) -> Address {
        [n; 20]
    }

    fn engine() -> SlashingEngine {
        SlashingEngine::new(
            MemStore::shared(),
            SlashingConfig {
                equivocation_penalty_pct: 50,
                inactivity_penalty_pct: 5,
                evidence_window_epochs: 2,
                epoch_length: 100,
            },
        )
    }

    fn equivocation_at(block: BlockNumber) -> Evidence {
        Evidence::Equivocation {
            validator_index: 2,
            block_number: block,
            view: block,
            hash_a: [1u8; 32],
            hash_b: [2u8; 32],
        }
    }

    #[test]
    fn identical_evidence_slashes_once() {
        let engine = engine();
        let mut staking = StakingState::new();
        staking.register(addr(2), U256::from(1000u64)).unwrap();

        let first = engine
            .slash_equivocation(&mut staking, addr(2), equivocation_at(10), 12)
            .unwrap();
        assert!(first.is_some());
        assert_eq!(staking.get_stake(&addr(2)), U256::from(500u64));

        let second = engine
            .slash_equivocation(&mut staking, addr(2), equivocation_at(10), 12)
            .unwrap();
        assert!(second.is_none());
        assert_eq!(staking.get_stake(&addr(2)), U256::from(500u64));
    }

    #[test]
    fn stale_evidence_is_refused() {
        let engine = engine();
        let mut staking = StakingState::new();
        staking.register(addr(2), U256::from(1000u64)).unwrap();

        // evidence from epoch 0, currently in epoch 3
        let err = engine
            .slash_equivocation(&mut staking, addr(2), equivocation_at(10), 310)
            .unwrap_err();
        assert!(matches!(err, SlashError::StaleEvidence { .. }));
        assert_eq!(staking.get_stake(&addr(2)), U256::from(1000u64));
    }

    #[test]
    fn inactivity_uses_smaller_penalty() {
        let engine = engine();
        let mut staking = StakingState::new();
        staking.register(addr(4), U256::from(1000u64)).unwrap();

        let record = engine
            .slash_inactivity(
                &mut staking,
                addr(4),
                Evidence::Inactivity {
                    validator_index: 4,
                    first_missed_block: 1,
                    last_missed_block: 100,
                },
                100,
            )
            .unwrap()
            .unwrap();
        assert_eq!(record.slashed_amount, U256::from(50u64));
        assert_eq!(staking.get_stake(&addr(4)), U256::from(950u64));
    }
}
