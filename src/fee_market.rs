// src/fee_market.rs
// Dynamic base fee, adjusted 1/8 toward target gas per finalised block.

use serde::{Deserialize, Serialize};

/// Hard floor for the base fee.
pub const MIN_BASE_FEE: u64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeMarket {
    pub base_fee: u64,
    pub target_gas_per_block: u64,
    pub max_gas_per_block: u64,
}

impl Default for FeeMarket {
    fn default() -> Self {
        Self {
            base_fee: 10_000,
            target_gas_per_block: 15_000_000,
            max_gas_per_block: 30_000_000,
        }
    }
}

impl FeeMarket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per finalised block with that block's gas usage.
    pub fn on_block_finalised(&mut self, gas_used: u64) {
        if gas_used > self.target_gas_per_block {
            let gas_delta = gas_used - self.target_gas_per_block;
            let fee_delta = (self.base_fee * gas_delta) / self.target_gas_per_block / 8;
            self.base_fee += fee_delta.max(1);
        } else if gas_used < self.target_gas_per_block {
            let gas_delta = self.target_gas_per_block - gas_used;
            let fee_delta = (self.base_fee * gas_delta) / self.target_gas_per_block / 8;
            self.base_fee = self.base_fee.saturating_sub(fee_delta);
        }
        self.base_fee = self.base_fee.max(MIN_BASE_FEE);
    }
}
