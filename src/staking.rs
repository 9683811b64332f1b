// src/staking.rs
// Per-address stake ledger: self stake, delegations, slashing pool.
// Mutated only by the coordinator task; epoch snapshots feed the
// ValidatorSet.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::block::Address;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StakingError {
    #[error("validator {0} already registered")]
    DuplicateValidator(String),
    #[error("unknown validator {0}")]
    UnknownValidator(String),
    #[error("undelegate amount exceeds delegation")]
    InsufficientDelegation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StakeEntry {
    pub self_stake: U256,
    pub delegations: HashMap<Address, U256>,
}

impl StakeEntry {
    /// total = self + Σ delegations, maintained by construction.
    pub fn total(&self) -> U256 {
        self.delegations
            .values()
            .fold(self.self_stake, |acc, d| acc + *d)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StakingState {
    entries: HashMap<Address, StakeEntry>,
    /// Burned stake accumulates here; governance decides its fate.
    pub slashed_pool: U256,
}

impl StakingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, addr: Address, self_stake: U256) -> Result<(), StakingError> {
        if self.entries.contains_key(&addr) {
            return Err(StakingError::DuplicateValidator(hex::encode(addr)));
        }
        self.entries.insert(
            addr,
            StakeEntry {
                self_stake,
                delegations: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn delegate(
        &mut self,
        delegator: Address,
        validator: Address,
        amount: U256,
    ) -> Result<(), StakingError> {
        let entry = self
            .entries
            .get_mut(&validator)
            .ok_or_else(|| StakingError::UnknownValidator(hex::encode(validator)))?;
        *entry.delegations.entry(delegator).or_insert_with(U256::zero) += amount;
        Ok(())
    }

    pub fn undelegate(
        &mut self,
        delegator: Address,
        validator: Address,
        amount: U256,
    ) -> Result<(), StakingError> {
        let entry = self
            .entries
            .get_mut(&validator)
            .ok_or_else(|| StakingError::UnknownValidator(hex::encode(validator)))?;
        let current = entry
            .delegations
            .get_mut(&delegator)
            .ok_or(StakingError::InsufficientDelegation)?;
        if *current < amount {
            return Err(StakingError::InsufficientDelegation);
        }
        *current -= amount;
        if current.is_zero() {
            entry.delegations.remove(&delegator);
        }
        Ok(())
    }

    pub fn get_stake(&self, addr: &Address) -> U256 {
        self.entries.get(addr).map_or_else(U256::zero, |e| e.total())
    }

    pub fn entry(&self, addr: &Address) -> Option<&StakeEntry> {
        self.entries.get(addr)
    }

    /// Burn `percent` of a validator's stake, self and delegated alike, so
    /// every participant loses in proportion to their share. Returns the
    /// total amount burned.
    pub fn slash(&mut self, addr: &Address, percent: u64) -> Result<U256, StakingError> {
        let entry = self
            .entries
            .get_mut(addr)
            .ok_or_else(|| StakingError::UnknownValidator(hex::encode(addr)))?;

        let pct = U256::from(percent.min(100));
        let self_cut = entry.self_stake * pct / 100;
        entry.self_stake -= self_cut;
        let mut burned = self_cut;
        for amount in entry.delegations.values_mut() {
            let cut = *amount * pct / 100;
            *amount -= cut;
            burned += cut;
        }
        entry.delegations.retain(|_, amount| !amount.is_zero());
        self.slashed_pool += burned;
        Ok(burned)
    }

    /// Top `k` addresses by total stake, ties broken by address so every
    /// node computes the same snapshot.
    pub fn snapshot_top_k(&self, k: usize) -> Vec<(Address, U256)> {
        let mut all: Vec<(Address, U256)> = self
            .entries
            .iter()
            .map(|(addr, entry)| (*addr, entry.total()))
            .filter(|(_, total)| !total.is_zero())
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        all.truncate(k);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        [n; 20]
    }

    #[test]
    fn totals_include_delegations() {
        let mut staking = StakingState::new();
        staking.register(addr(1), U256::from(100u64)).unwrap();
        staking.delegate(addr(9), addr(1), U256::from(50u64)).unwrap();
        assert_eq!(staking.get_stake(&addr(1)), U256::from(150u64));
        staking
            .undelegate(addr(9), addr(1), U256::from(20u64))
            .unwrap();
        assert_eq!(staking.get_stake(&addr(1)), U256::from(130u64));
    }

    #[test]
    fn undelegate_cannot_exceed_delegation() {
        let mut staking = StakingState::new();
        staking.register(addr(1), U256::from(100u64)).unwrap();
        staking.delegate(addr(9), addr(1), U256::from(10u64)).unwrap();
        assert_eq!(
            staking.undelegate(addr(9), addr(1), U256::from(11u64)),
            Err(StakingError::InsufficientDelegation)
        );
    }

    #[test]
    fn slash_burns_proportionally() {
        let mut staking = StakingState::new();
        staking.register(addr(1), U256::from(1000u64)).unwrap();
        staking
            .delegate(addr(9), addr(1), U256::from(500u64))
            .unwrap();

        let burned = staking.slash(&addr(1), 50).unwrap();
        assert_eq!(burned, U256::from(750u64));
        assert_eq!(staking.get_stake(&addr(1)), U256::from(750u64));
        assert_eq!(staking.slashed_pool, U256::from(750u64));
        // delegator retains exactly half of their share
        assert_eq!(
            staking.entry(&addr(1)).unwrap().delegations[&addr(9)],
            U256::from(250u64)
        );
    }

    #[test]
    fn snapshot_is_deterministic_under_ties() {
        let mut staking = StakingState::new();
        staking.register(addr(3), U256::from(100u64)).unwrap();
        staking.register(addr(1), U256::from(100u64)).unwrap();
        staking.register(addr(2), U256::from(200u64)).unwrap();

        let snap = staking.snapshot_top_k(2);
        assert_eq!(snap[0].0, addr(2));
        assert_eq!(snap[1].0, addr(1)); // tie resolved by address
    }
}
