// src/crypto/aggregate.rs
// Aggregate-capable signature seam. Consensus only ever talks to the
// `AggregateScheme` trait; the concrete scheme is pluggable so a pairing
// based signer can be dropped in without touching the engines.

use crate::block::ValidatorIndex;
use crate::crypto::keys::{sign_bytes, verify_bytes};

const SIG_LEN: usize = 64;

/// Narrow capability over the aggregate signature primitive.
///
/// `signers` are always `(validator_index, aggregate_public_key)` pairs in
/// ascending index order, matching the QC bitmap.
pub trait AggregateScheme: Send + Sync {
    /// Sign `msg` with the validator's aggregate-capable secret seed.
    fn sign(&self, seed: &[u8], msg: &[u8]) -> Option<Vec<u8>>;

    /// Verify one individual signature.
    fn verify_one(&self, pubkey: &[u8], msg: &[u8], sig: &[u8]) -> bool;

    /// Combine individual signatures into one aggregate. Input pairs may
    /// arrive in any order; the output is canonical (ascending index).
    fn aggregate(&self, sigs: &[(ValidatorIndex, Vec<u8>)]) -> Vec<u8>;

    /// Verify an aggregate signature against the ordered signer set.
    fn verify_aggregate(
        &self,
        signers: &[(ValidatorIndex, Vec<u8>)],
        msg: &[u8],
        agg: &[u8],
    ) -> bool;
}

/// Default scheme: deterministic multi-ed25519. The aggregate is the
/// signer-index-ordered concatenation of the individual signatures, verified
/// pairwise against the bitmap-selected public keys. Compact pairing-based
/// aggregation can replace this behind the same trait.
#[derive(Debug, Default, Clone)]
pub struct MultiEd25519;

impl AggregateScheme for MultiEd25519 {
    fn sign(&self, seed: &[u8], msg: &[u8]) -> Option<Vec<u8>> {
        sign_bytes(seed, msg)
    }

    fn verify_one(&self, pubkey: &[u8], msg: &[u8], sig: &[u8]) -> bool {
        verify_bytes(pubkey, msg, sig)
    }

    fn aggregate(&self, sigs: &[(ValidatorIndex, Vec<u8>)]) -> Vec<u8> {
        let mut ordered: Vec<&(ValidatorIndex, Vec<u8>)> = sigs.iter().collect();
        ordered.sort_by_key(|(idx, _)| *idx);
        let mut out = Vec::with_capacity(ordered.len() * SIG_LEN);
        for (_, sig) in ordered {
            out.extend_from_slice(sig);
        }
        out
    }

    fn verify_aggregate(
        &self,
        signers: &[(ValidatorIndex, Vec<u8>)],
        msg: &[u8],
        agg: &[u8],
    ) -> bool {
        if agg.len() != signers.len() * SIG_LEN {
            return false;
        }
        let mut ordered: Vec<&(ValidatorIndex, Vec<u8>)> = signers.iter().collect();
        ordered.sort_by_key(|(idx, _)| *idx);
        for (slot, (_, pubkey)) in ordered.iter().enumerate() {
            let sig = &agg[slot * SIG_LEN..(slot + 1) * SIG_LEN];
            if !verify_bytes(pubkey, msg, sig) {
                return false;
            }
        }
        true
    }
}
