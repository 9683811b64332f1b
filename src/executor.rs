// src/executor.rs
// Transaction runtime capability. The contract VM proper is a collaborator
// behind this trait; the consensus core ships the transfer runtime and
// treats `payload` as opaque bytes.

use primitive_types::U256;

use crate::block::{Block, BlockNumber, Receipt, Transaction, TRANSFER_GAS};
use crate::crypto::{address_from_public, verify_bytes};
use crate::state::{get_account, set_account, StateDb};

pub trait TxRuntime: Send + Sync {
    /// Apply one transaction. A failing transaction yields a failed receipt
    /// and leaves the state untouched; it never aborts the block.
    fn execute(
        &self,
        state: &dyn StateDb,
        tx: &Transaction,
        block_number: BlockNumber,
        base_fee: u64,
    ) -> Receipt;
}

/// Balance/nonce transfer runtime.
pub struct TransferRuntime {
    chain_id: u32,
    /// Contract runtime hint from config; the transfer path ignores it but
    /// the in-process VM selects its isolation mode from it.
    pub sandboxed: bool,
}

impl TransferRuntime {
    pub fn new(chain_id: u32, sandboxed: bool) -> Self {
        Self { chain_id, sandboxed }
    }

    fn validate(&self, state: &dyn StateDb, tx: &Transaction, base_fee: u64) -> Result<(), String> {
        if tx.chain_id != self.chain_id {
            return Err(format!("wrong chain id {}", tx.chain_id));
        }
        if address_from_public(&tx.public_key) != tx.sender {
            return Err("public key does not match sender".into());
        }
        if !verify_bytes(&tx.public_key, &tx.signing_bytes(), &tx.signature) {
            return Err("invalid signature".into());
        }
        if tx.gas_limit < TRANSFER_GAS {
            return Err("gas limit below transfer cost".into());
        }
        if tx.effective_gas_price(base_fee) < base_fee {
            return Err("fee below base fee".into());
        }
        let account = get_account(state, &tx.sender);
        if tx.nonce != account.nonce {
            return Err(format!(
                "nonce mismatch: tx {} account {}",
                tx.nonce, account.nonce
            ));
        }
        let fee = U256::from(TRANSFER_GAS) * U256::from(tx.effective_gas_price(base_fee));
        if account.balance < tx.amount + fee {
            return Err("insufficient funds".into());
        }
        Ok(())
    }
}

impl TxRuntime for TransferRuntime {
    fn execute(
        &self,
        state: &dyn StateDb,
        tx: &Transaction,
        block_number: BlockNumber,
        base_fee: u64,
    ) -> Receipt {
        let tx_hash = tx.hash();
        if let Err(error) = self.validate(state, tx, base_fee) {
            return Receipt {
                tx_hash,
                block_number,
                success: false,
                gas_used: 0,
                error: Some(error),
            };
        }

        let fee = U256::from(TRANSFER_GAS) * U256::from(tx.effective_gas_price(base_fee));
        let mut sender = get_account(state, &tx.sender);
        sender.balance -= tx.amount + fee; // fee is burned
        sender.nonce += 1;
        set_account(state, &tx.sender, &sender);

        let mut recipient = get_account(state, &tx.recipient);
        recipient.balance += tx.amount;
        set_account(state, &tx.recipient, &recipient);

        Receipt {
            tx_hash,
            block_number,
            success: true,
            gas_used: TRANSFER_GAS,
            error: None,
        }
    }
}

/// Run every transaction of a block in order. Returns the receipts and the
/// total gas used.
pub fn execute_block(
    runtime: &dyn TxRuntime,
    state: &dyn StateDb,
    block: &Block,
    block_number: BlockNumber,
) -> (Vec<Receipt>, u64) {
    let base_fee = block.header.base_fee;
    let mut receipts = Vec::with_capacity(block.transactions.len());
    let mut gas_used = 0u64;
    for tx in &block.transactions {
        let receipt = runtime.execute(state, tx, block_number, base_fee);
        gas_used += receipt.gas_used;
        receipts.push(receipt);
    }
    (receipts, gas_used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{public_from_seed, sign_bytes};
    use crate::state::{Account, MemState};

    fn signed_transfer(seed: &[u8; 32], nonce: u64, amount: u64) -> Transaction {
        let public_key = public_from_seed(seed).unwrap();
        let sender = address_from_public(&public_key);
        let mut tx = Transaction {
            sender,
            recipient: [9u8; 20],
            amount: U256::from(amount),
            nonce,
            gas_limit: TRANSFER_GAS,
            max_fee_per_gas: 20_000,
            max_priority_fee: 0,
            payload: Vec::new(),
            chain_id: 31337,
            public_key,
            signature: Vec::new(),
        };
        tx.signature = sign_bytes(seed, &tx.signing_bytes()).unwrap();
        tx
    }

    fn fund(state: &dyn StateDb, addr: &crate::block::Address, balance: u64) {
        set_account(
            state,
            addr,
            &Account {
                balance: U256::from(balance),
                nonce: 0,
            },
        );
    }

    #[test]
    fn transfer_moves_funds_and_bumps_nonce() {
        let runtime = TransferRuntime::new(31337, false);
        let state = MemState::new();
        let seed = [3u8; 32];
        let tx = signed_transfer(&seed, 0, 100);
        fund(&state, &tx.sender, 1_000_000_000);

        let receipt = runtime.execute(&state, &tx, 1, 10_000);
        assert!(receipt.success, "{:?}", receipt.error);
        assert_eq!(receipt.gas_used, TRANSFER_GAS);

        let sender = get_account(&state, &tx.sender);
        assert_eq!(sender.nonce, 1);
        let recipient = get_account(&state, &tx.recipient);
        assert_eq!(recipient.balance, U256::from(100u64));
    }

    #[test]
    fn bad_nonce_fails_without_state_change() {
        let runtime = TransferRuntime::new(31337, false);
        let state = MemState::new();
        let seed = [3u8; 32];
        let tx = signed_transfer(&seed, 5, 100);
        fund(&state, &tx.sender, 1_000_000_000);
        let root_before = state.root();

        let receipt = runtime.execute(&state, &tx, 1, 10_000);
        assert!(!receipt.success);
        assert_eq!(receipt.gas_used, 0);
        assert_eq!(state.root(), root_before);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let runtime = TransferRuntime::new(31337, false);
        let state = MemState::new();
        let seed = [3u8; 32];
        let mut tx = signed_transfer(&seed, 0, 100);
        fund(&state, &tx.sender, 1_000_000_000);
        tx.amount = U256::from(999u64); // signature no longer covers this

        let receipt = runtime.execute(&state, &tx, 1, 10_000);
        assert!(!receipt.success);
    }
}
