// src/bft/evidence.rs
// Sliding window of observed proposals. The key is the full
// `(view, block_number, proposer)` triple: view numbers are reused across
// block numbers after view changes, so the view alone cannot identify a
// proposal slot.

use std::collections::HashMap;

use crate::block::{BlockHash, BlockNumber, ValidatorIndex, View};
use crate::slashing::Evidence;

/// Proposals older than this many views are pruned, bounding memory and
/// avoiding false positives on view reuse.
pub const EVIDENCE_WINDOW_VIEWS: u64 = 10;

pub struct EvidenceWindow {
    seen: HashMap<(View, BlockNumber, ValidatorIndex), BlockHash>,
    window_views: u64,
    highest_view: View,
}

impl EvidenceWindow {
    pub fn new() -> Self {
        Self::with_window(EVIDENCE_WINDOW_VIEWS)
    }

    pub fn with_window(window_views: u64) -> Self {
        Self {
            seen: HashMap::new(),
            window_views: window_views.max(1),
            highest_view: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Record a proposal sighting. A second hash in the same slot is
    /// equivocation evidence.
    pub fn observe_proposal(
        &mut self,
        view: View,
        block_number: BlockNumber,
        proposer: ValidatorIndex,
        block_hash: BlockHash,
    ) -> Option<Evidence> {
        self.highest_view = self.highest_view.max(view);
        let key = (view, block_number, proposer);
        match self.seen.get(&key) {
            Some(existing) if *existing != block_hash => Some(Evidence::Equivocation {
                validator_index: proposer,
                block_number,
                view,
                hash_a: *existing,
                hash_b: block_hash,
            }),
            Some(_) => None,
            None => {
                self.seen.insert(key, block_hash);
                self.prune();
                None
            }
        }
    }

    fn prune(&mut self) {
        let cutoff = self.highest_view.saturating_sub(self.window_views);
        self.seen.retain(|(view, _, _), _| *view >= cutoff);
    }
}

impl Default for EvidenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_proposal_yields_evidence() {
        let mut window = EvidenceWindow::new();
        assert!(window.observe_proposal(7, 7, 2, [1u8; 32]).is_none());
        let evidence = window.observe_proposal(7, 7, 2, [2u8; 32]).unwrap();
        match evidence {
            Evidence::Equivocation {
                validator_index,
                view,
                hash_a,
                hash_b,
                ..
            } => {
                assert_eq!(validator_index, 2);
                assert_eq!(view, 7);
                assert_eq!(hash_a, [1u8; 32]);
                assert_eq!(hash_b, [2u8; 32]);
            }
            other => panic!("unexpected evidence {:?}", other),
        }
    }

    #[test]
    fn same_view_different_block_number_is_not_equivocation() {
        let mut window = EvidenceWindow::new();
        assert!(window.observe_proposal(7, 7, 2, [1u8; 32]).is_none());
        // view reused for the next block after a view change elsewhere
        assert!(window.observe_proposal(7, 8, 2, [2u8; 32]).is_none());
    }

    #[test]
    fn old_entries_are_pruned() {
        let mut window = EvidenceWindow::with_window(10);
        window.observe_proposal(1, 1, 0, [1u8; 32]);
        for v in 2..=30u64 {
            window.observe_proposal(v, v, 0, [v as u8; 32]);
        }
        assert!(window.len() <= 11);
        // the pruned slot no longer raises evidence
        assert!(window.observe_proposal(1, 1, 0, [9u8; 32]).is_none());
    }
}
