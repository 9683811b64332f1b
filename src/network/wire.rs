// src/network/wire.rs
// Typed wire protocol. Frames are length-prefixed bincode; after the
// handshake every frame additionally carries a session MAC (see mod.rs).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bft::messages::{Proposal, QuorumCertificate, ViewChange, Vote};
use crate::block::{BlockHash, BlockNumber, Transaction, TxHash};

/// Per-connection message size cap.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// First message on every connection, both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub chain_id: u32,
    pub peer_id: String,
    pub classical_pub: Vec<u8>,
    pub aggregate_pub: Vec<u8>,
    pub listen_port: u16,
    pub listen_hostname: String,
    pub best_block_number: BlockNumber,
    pub best_block_hash: BlockHash,
    pub genesis_hash: BlockHash,
    pub ephemeral_kex_pub: [u8; 32],
}

/// One block as shipped during catch-up, with the commit bitmap the serving
/// peer stored for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBlock {
    pub number: BlockNumber,
    pub raw_bytes: Vec<u8>,
    pub commit_bitmap: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),

    TxAnnounce { hashes: Vec<TxHash> },
    TxRequest { hashes: Vec<TxHash> },
    TxPayload { txs: Vec<Transaction> },

    BlockAnnounce { number: BlockNumber, hash: BlockHash },
    BlockRequest { number: BlockNumber },
    BlockPayload { blocks: Vec<SyncBlock> },

    SyncRequest { from: BlockNumber, max_blocks: u32 },
    SyncResponse { blocks: Vec<SyncBlock>, best_block: BlockNumber },

    ConsensusProposal(Proposal),
    ConsensusVote(Vote),
    AggregateVote(QuorumCertificate),
    ViewChange(ViewChange),

    Ping(u64),
    Pong(u64),

    // gossip mesh control
    IHave { ids: Vec<[u8; 32]> },
    IWant { ids: Vec<[u8; 32]> },
    Graft,
    Prune,
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Gossip message id: hash of the serialised bytes.
    pub fn id_of(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::messages::VotePhase;

    #[test]
    fn messages_round_trip() {
        let samples = vec![
            Message::Ping(42),
            Message::TxAnnounce {
                hashes: vec![[7u8; 32]],
            },
            Message::BlockAnnounce {
                number: 12,
                hash: [3u8; 32],
            },
            Message::SyncRequest {
                from: 1,
                max_blocks: 50,
            },
            Message::SyncResponse {
                blocks: vec![SyncBlock {
                    number: 1,
                    raw_bytes: vec![1, 2, 3],
                    commit_bitmap: 0b111,
                }],
                best_block: 47,
            },
            Message::ConsensusVote(Vote {
                phase: VotePhase::PreVote,
                view: u64::MAX,
                block_number: 9,
                block_hash: [1u8; 32],
                validator_index: 63,
                signature: vec![0u8; 64],
            }),
            Message::IHave { ids: vec![[5u8; 32]] },
            Message::Graft,
        ];
        for msg in samples {
            let bytes = msg.encode();
            assert!(bytes.len() < MAX_FRAME_SIZE);
            assert_eq!(Message::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn id_is_stable_per_payload() {
        let a = Message::Ping(1).encode();
        let b = Message::Ping(1).encode();
        assert_eq!(Message::id_of(&a), Message::id_of(&b));
        assert_ne!(Message::id_of(&a), Message::id_of(&Message::Ping(2).encode()));
    }
}
