// src/bft/qc.rs
// Quorum arithmetic, QC formation and verification.

use crate::bft::messages::{vote_signing_bytes, QuorumCertificate, Vote, VotePhase};
use crate::block::{BlockHash, BlockNumber, ValidatorIndex, View};
use crate::crypto::AggregateScheme;
use crate::validators::ValidatorSet;

/// `q = ⌊2n/3⌋ + 1`.
pub fn quorum_threshold(n: usize) -> usize {
    (2 * n) / 3 + 1
}

pub fn bitmap_of(indices: impl Iterator<Item = ValidatorIndex>) -> u64 {
    indices.fold(0u64, |acc, idx| acc | (1u64 << idx))
}

/// Aggregate a quorum of same-group votes into a certificate. Caller has
/// already checked the count; signatures are assumed individually verified.
pub fn form_qc(
    phase: VotePhase,
    view: View,
    block_number: BlockNumber,
    block_hash: BlockHash,
    votes: &[(ValidatorIndex, Vec<u8>)],
    scheme: &dyn AggregateScheme,
) -> QuorumCertificate {
    QuorumCertificate {
        phase,
        view,
        block_number,
        block_hash,
        bitmap: bitmap_of(votes.iter().map(|(idx, _)| *idx)),
        agg_signature: scheme.aggregate(votes),
    }
}

/// Full check of an incoming certificate: signer count against the quorum,
/// bitmap within the set, aggregate signature against the bitmap's keys.
pub fn verify_qc(
    qc: &QuorumCertificate,
    set: &ValidatorSet,
    scheme: &dyn AggregateScheme,
) -> bool {
    if (qc.signer_count() as usize) < set.quorum_threshold() {
        return false;
    }
    if set.len() < 64 && qc.bitmap >> set.len() != 0 {
        return false; // signer outside the set
    }
    let signers = set.signers_from_bitmap(qc.bitmap);
    if signers.len() != qc.signer_count() as usize {
        return false;
    }
    let msg = vote_signing_bytes(qc.phase, qc.view, qc.block_number, &qc.block_hash);
    scheme.verify_aggregate(&signers, &msg, &qc.agg_signature)
}

/// Verify one individual vote against the sender's aggregate-capable key.
pub fn verify_vote(vote: &Vote, set: &ValidatorSet, scheme: &dyn AggregateScheme) -> bool {
    let Some(validator) = set.get(vote.validator_index) else {
        return false;
    };
    let msg = vote_signing_bytes(vote.phase, vote.view, vote.block_number, &vote.block_hash);
    scheme.verify_one(&validator.agg_public_key, &msg, &vote.signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{public_from_seed, MultiEd25519};
    use crate::validators::Validator;
    use primitive_types::U256;

    fn seed(i: u8) -> [u8; 32] {
        [i + 1; 32]
    }

    fn test_set(n: u8) -> ValidatorSet {
        let roster = (0..n)
            .map(|i| {
                let pk = public_from_seed(&seed(i)).unwrap();
                Validator {
                    index: i,
                    peer_id: format!("peer-{}", i),
                    public_key: pk.clone(),
                    agg_public_key: pk,
                    address: [i; 20],
                    stake: U256::from(100u64),
                }
            })
            .collect();
        ValidatorSet::new(roster).unwrap()
    }

    #[test]
    fn quorum_threshold_table() {
        for (n, q) in [(1usize, 1usize), (2, 2), (3, 3), (4, 3), (7, 5), (10, 7)] {
            assert_eq!(quorum_threshold(n), q);
        }
    }

    #[test]
    fn formed_qc_verifies() {
        let scheme = MultiEd25519;
        let set = test_set(4);
        let hash = [9u8; 32];
        let msg = vote_signing_bytes(VotePhase::PreVote, 5, 5, &hash);

        let votes: Vec<(ValidatorIndex, Vec<u8>)> = [0u8, 1, 3]
            .iter()
            .map(|i| (*i, scheme.sign(&seed(*i), &msg).unwrap()))
            .collect();
        let qc = form_qc(VotePhase::PreVote, 5, 5, hash, &votes, &scheme);

        assert_eq!(qc.bitmap, 0b1011);
        assert_eq!(qc.signer_count(), 3);
        assert!(verify_qc(&qc, &set, &scheme));
    }

    #[test]
    fn sub_quorum_qc_is_rejected() {
        let scheme = MultiEd25519;
        let set = test_set(4);
        let hash = [9u8; 32];
        let msg = vote_signing_bytes(VotePhase::PreVote, 5, 5, &hash);
        let votes: Vec<(ValidatorIndex, Vec<u8>)> = [0u8, 1]
            .iter()
            .map(|i| (*i, scheme.sign(&seed(*i), &msg).unwrap()))
            .collect();
        let qc = form_qc(VotePhase::PreVote, 5, 5, hash, &votes, &scheme);
        assert!(!verify_qc(&qc, &set, &scheme));
    }

    #[test]
    fn foreign_signer_bit_is_rejected() {
        let scheme = MultiEd25519;
        let set = test_set(4);
        let hash = [9u8; 32];
        let msg = vote_signing_bytes(VotePhase::Commit, 5, 5, &hash);
        let votes: Vec<(ValidatorIndex, Vec<u8>)> = [0u8, 1, 2]
            .iter()
            .map(|i| (*i, scheme.sign(&seed(*i), &msg).unwrap()))
            .collect();
        let mut qc = form_qc(VotePhase::Commit, 5, 5, hash, &votes, &scheme);
        qc.bitmap |= 1 << 7; // index outside the 4-member set
        assert!(!verify_qc(&qc, &set, &scheme));
    }
}
