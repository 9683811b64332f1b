// src/bft/messages.rs
// Consensus message types. Canonical signing payloads live next to the
// types so every module signs and verifies the exact same bytes.

use serde::{Deserialize, Serialize};

use crate::block::{BlockHash, BlockNumber, ValidatorIndex, View};

/// Round phase of an undecided block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Proposing,
    PreVote,
    PreCommit,
    Commit,
    ViewChange,
}

/// Vote flavour; the commit bitmap comes from the decisive `Commit` QC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VotePhase {
    PreVote,
    PreCommit,
    Commit,
    ViewChange,
}

impl VotePhase {
    fn tag(self) -> u8 {
        match self {
            VotePhase::PreVote => 1,
            VotePhase::PreCommit => 2,
            VotePhase::Commit => 3,
            VotePhase::ViewChange => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub view: View,
    pub block_number: BlockNumber,
    pub block_hash: BlockHash,
    pub block_bytes: Vec<u8>,
    pub proposer_index: ValidatorIndex,
    /// Classical leader signature over `proposal_signing_bytes`.
    pub signature: Vec<u8>,
    /// After a view change the new leader re-proposes the locked block and
    /// attaches the PreCommit QC that locked it.
    pub justify: Option<QuorumCertificate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub phase: VotePhase,
    pub view: View,
    pub block_number: BlockNumber,
    pub block_hash: BlockHash,
    pub validator_index: ValidatorIndex,
    /// Aggregate-capable signature over `vote_signing_bytes`.
    pub signature: Vec<u8>,
}

/// Quorum certificate: proof that a quorum signed the same
/// `(phase, view, block_number, block_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub phase: VotePhase,
    pub view: View,
    pub block_number: BlockNumber,
    pub block_hash: BlockHash,
    pub bitmap: u64,
    pub agg_signature: Vec<u8>,
}

impl QuorumCertificate {
    pub fn signer_count(&self) -> u32 {
        self.bitmap.count_ones()
    }
}

/// Broadcast on a view timeout; quorum of these moves the round to
/// `vote.view` under a new leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    /// phase = ViewChange, view = the view being moved to.
    pub vote: Vote,
    /// Highest PreCommit QC the sender has seen (lock-on-highest-QC).
    pub highest_qc: Option<QuorumCertificate>,
}

/// Consensus payloads as routed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMsg {
    Proposal(Proposal),
    Vote(Vote),
    Aggregate(QuorumCertificate),
    ViewChange(ViewChange),
}

impl ConsensusMsg {
    pub fn block_number(&self) -> BlockNumber {
        match self {
            ConsensusMsg::Proposal(p) => p.block_number,
            ConsensusMsg::Vote(v) => v.block_number,
            ConsensusMsg::Aggregate(qc) => qc.block_number,
            ConsensusMsg::ViewChange(vc) => vc.vote.block_number,
        }
    }
}

/// Bytes covered by the leader's proposal signature.
pub fn proposal_signing_bytes(
    view: View,
    block_number: BlockNumber,
    block_hash: &BlockHash,
    proposer_index: ValidatorIndex,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + 32 + 1);
    out.extend_from_slice(&view.to_be_bytes());
    out.extend_from_slice(&block_number.to_be_bytes());
    out.extend_from_slice(block_hash);
    out.push(proposer_index);
    out
}

/// Bytes covered by every vote of a `(phase, view, block_number, hash)`
/// group. The validator index is deliberately absent so signatures over the
/// group aggregate.
pub fn vote_signing_bytes(
    phase: VotePhase,
    view: View,
    block_number: BlockNumber,
    block_hash: &BlockHash,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 8 + 32);
    out.push(phase.tag());
    out.extend_from_slice(&view.to_be_bytes());
    out.extend_from_slice(&block_number.to_be_bytes());
    out.extend_from_slice(block_hash);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_bytes_distinguish_phases() {
        let hash = [7u8; 32];
        let prevote = vote_signing_bytes(VotePhase::PreVote, 3, 3, &hash);
        let precommit = vote_signing_bytes(VotePhase::PreCommit, 3, 3, &hash);
        assert_ne!(prevote, precommit);
    }

    #[test]
    fn view_width_survives_serialisation() {
        let vote = Vote {
            phase: VotePhase::Commit,
            view: u64::MAX - 1,
            block_number: u64::MAX - 2,
            block_hash: [1u8; 32],
            validator_index: 63,
            signature: vec![0u8; 64],
        };
        let bytes = bincode::serialize(&vote).unwrap();
        let back: Vote = bincode::deserialize(&bytes).unwrap();
        assert_eq!(vote, back);
    }
}
