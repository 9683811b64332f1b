// src/block.rs
// Core chain types: headers, blocks, transactions, receipts.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type BlockNumber = u64;
pub type View = u64;
/// Stable validator slot, dense in `[0, 64)` within an epoch.
pub type ValidatorIndex = u8;
pub type BlockHash = [u8; 32];
pub type TxHash = [u8; 32];
pub type Address = [u8; 20];

/// Protocol version stamped into every header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Flat gas charge for a value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

/// Block header. The block hash is the SHA-256 of the bincode encoding of
/// this struct, so field order is part of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: BlockHash,
    pub state_root: [u8; 32],
    pub tx_root: [u8; 32],
    pub receipt_root: [u8; 32],
    pub timestamp_ms: u64,
    pub proposer: Address,
    pub chain_id: u32,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub base_fee: u64,
    pub protocol_version: u32,
    pub extra: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn number_of(parent_number: BlockNumber) -> BlockNumber {
        parent_number + 1
    }

    /// Hash of the header only; transactions are committed via `tx_root`.
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        // bincode cannot fail on these types
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl BlockHeader {
    pub fn hash(&self) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(bincode::serialize(self).unwrap_or_default());
        hasher.finalize().into()
    }
}

/// Signed value transfer. `payload` is opaque to the consensus core; the
/// contract surface interprets it elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: u64,
    pub max_priority_fee: u64,
    pub payload: Vec<u8>,
    pub chain_id: u32,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> TxHash {
        let mut hasher = Sha256::new();
        hasher.update(bincode::serialize(self).unwrap_or_default());
        hasher.finalize().into()
    }

    /// Canonical bytes covered by the sender signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(&self.recipient);
        let mut amount = [0u8; 32];
        self.amount.to_big_endian(&mut amount);
        out.extend_from_slice(&amount);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.gas_limit.to_be_bytes());
        out.extend_from_slice(&self.max_fee_per_gas.to_be_bytes());
        out.extend_from_slice(&self.max_priority_fee.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.chain_id.to_be_bytes());
        out
    }

    /// EIP-1559 effective price against the current base fee.
    pub fn effective_gas_price(&self, base_fee: u64) -> u64 {
        self.max_fee_per_gas.min(base_fee.saturating_add(self.max_priority_fee))
    }

    /// Upper bound on what the sender can be charged, amount included.
    pub fn max_cost(&self) -> U256 {
        self.amount + U256::from(self.gas_limit) * U256::from(self.max_fee_per_gas)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: BlockNumber,
    pub success: bool,
    pub gas_used: u64,
    pub error: Option<String>,
}

/// Flat commitment over an ordered list of 32-byte hashes.
pub fn root_of(hashes: &[[u8; 32]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for h in hashes {
        hasher.update(h);
    }
    hasher.finalize().into()
}

pub fn tx_root(txs: &[Transaction]) -> [u8; 32] {
    let hashes: Vec<TxHash> = txs.iter().map(|t| t.hash()).collect();
    root_of(&hashes)
}

pub fn receipt_root(receipts: &[Receipt]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for r in receipts {
        hasher.update(bincode::serialize(r).unwrap_or_default());
    }
    hasher.finalize().into()
}

/// Genesis hash pins chain identity; peers with a different one are refused
/// at handshake.
pub fn genesis_hash(chain_id: u32, network_name: &str) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(b"basalt-genesis");
    hasher.update(chain_id.to_be_bytes());
    hasher.update(network_name.as_bytes());
    hasher.finalize().into()
}

/// Short hex form for log lines.
pub fn short_hex(bytes: &[u8]) -> String {
    let full = hex::encode(bytes);
    if full.len() > 12 {
        format!("{}..", &full[..12])
    } else {
        full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            parent_hash: [1u8; 32],
            state_root: [2u8; 32],
            tx_root: [3u8; 32],
            receipt_root: [4u8; 32],
            timestamp_ms: 1_700_000_000_000,
            proposer: [5u8; 20],
            chain_id: 31337,
            gas_used: 0,
            gas_limit: 30_000_000,
            base_fee: 10_000,
            protocol_version: PROTOCOL_VERSION,
            extra: Vec::new(),
        }
    }

    #[test]
    fn header_hash_is_stable() {
        let h = sample_header();
        assert_eq!(h.hash(), h.hash());
        let mut other = sample_header();
        other.gas_used = 1;
        assert_ne!(h.hash(), other.hash());
    }

    #[test]
    fn block_round_trips() {
        let block = Block {
            header: sample_header(),
            transactions: vec![],
        };
        let bytes = block.encode();
        let back = Block::decode(&bytes).unwrap();
        assert_eq!(block, back);
    }

    #[test]
    fn effective_price_is_capped_by_max_fee() {
        let mut tx = Transaction {
            sender: [0u8; 20],
            recipient: [1u8; 20],
            amount: U256::zero(),
            nonce: 0,
            gas_limit: TRANSFER_GAS,
            max_fee_per_gas: 100,
            max_priority_fee: 10,
            payload: Vec::new(),
            chain_id: 31337,
            public_key: Vec::new(),
            signature: Vec::new(),
        };
        assert_eq!(tx.effective_gas_price(50), 60);
        tx.max_fee_per_gas = 55;
        assert_eq!(tx.effective_gas_price(50), 55);
    }

    #[test]
    fn genesis_hash_depends_on_chain_id() {
        assert_ne!(genesis_hash(1, "basalt"), genesis_hash(2, "basalt"));
        assert_ne!(genesis_hash(1, "basalt"), genesis_hash(1, "other"));
    }
}
