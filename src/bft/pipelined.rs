// src/bft/pipelined.rs
// Pipelined variant: up to `depth` consecutive rounds in flight, each
// following the single-round rules. Finalisation is strictly in order; a
// view change in round n bumps `min_next_view` and re-opens everything
// above n so later rounds chain from the surviving proposal.

use std::collections::{BTreeMap, VecDeque};

use crate::bft::engine::MAX_FUTURE_BUFFER;
use crate::bft::messages::ConsensusMsg;
use crate::bft::round::{Action, FinalizedBlock, Round, RoundContext};
use crate::block::{BlockHash, BlockNumber, View};

/// Rounds in flight at once.
pub const PIPELINE_DEPTH: usize = 4;

pub struct PipelinedBft {
    rounds: BTreeMap<BlockNumber, Round>,
    /// Lowest undecided block number.
    next_to_finalize: BlockNumber,
    /// Hash of the last block emitted in order.
    tip_hash: BlockHash,
    /// Floor for new rounds' starting views, bumped by view changes so the
    /// proposer that just timed out is not immediately re-elected.
    min_next_view: View,
    depth: usize,
    /// Rounds decided out of order, waiting for their predecessors.
    pending: BTreeMap<BlockNumber, FinalizedBlock>,
    future: VecDeque<ConsensusMsg>,
    stalled: Option<BlockNumber>,
}

impl PipelinedBft {
    pub fn new(start_block: BlockNumber, tip_hash: BlockHash, depth: usize) -> Self {
        Self {
            rounds: BTreeMap::new(),
            next_to_finalize: start_block,
            tip_hash,
            min_next_view: 0,
            depth: depth.max(1),
            pending: BTreeMap::new(),
            future: VecDeque::new(),
            stalled: None,
        }
    }

    pub fn current_block(&self) -> BlockNumber {
        self.next_to_finalize
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    pub fn stalled_expecting(&self) -> Option<BlockNumber> {
        self.stalled
    }

    /// After sync: restart the pipeline from the new tip.
    pub fn restart(&mut self, start_block: BlockNumber, tip_hash: BlockHash) {
        self.rounds.clear();
        self.pending.clear();
        self.next_to_finalize = start_block;
        self.tip_hash = tip_hash;
        self.stalled = None;
        self.future.retain(|msg| msg.block_number() >= start_block);
    }

    fn in_window(&self, number: BlockNumber) -> bool {
        number >= self.next_to_finalize
            && number < self.next_to_finalize + self.depth as BlockNumber
    }

    /// Parent hash a proposal for `number` must chain from, if known yet.
    fn expected_parent(&self, number: BlockNumber) -> Option<BlockHash> {
        if number == self.next_to_finalize {
            return Some(self.tip_hash);
        }
        self.rounds
            .get(&(number - 1))
            .and_then(|round| round.proposed_hash())
    }

    fn ensure_round(&mut self, number: BlockNumber, ctx: &RoundContext) {
        let floor = self.min_next_view;
        self.rounds.entry(number).or_insert_with(|| {
            Round::new(number, number.max(floor), ctx.now, ctx.view_timeout)
        });
    }

    /// Blocks this node should currently build proposals for, with the
    /// parent hash each must chain from.
    pub fn proposal_slots(&mut self, ctx: &RoundContext) -> Vec<(BlockNumber, BlockHash)> {
        if self.stalled.is_some() {
            return Vec::new();
        }
        let mut slots = Vec::new();
        for offset in 0..self.depth as BlockNumber {
            let number = self.next_to_finalize + offset;
            let Some(parent) = self.expected_parent(number) else {
                break; // later rounds chain from this one; nothing to do yet
            };
            self.ensure_round(number, ctx);
            let mut round_ctx = *ctx;
            round_ctx.expected_parent = parent;
            if self.rounds.get(&number).is_some_and(|r| r.wants_proposal(&round_ctx)) {
                slots.push((number, parent));
            }
        }
        slots
    }

    pub fn try_propose(
        &mut self,
        number: BlockNumber,
        fresh: Option<crate::block::Block>,
        ctx: &RoundContext,
    ) -> Vec<Action> {
        if self.stalled.is_some() || !self.in_window(number) {
            return Vec::new();
        }
        let Some(parent) = self.expected_parent(number) else {
            return Vec::new();
        };
        self.ensure_round(number, ctx);
        let mut round_ctx = *ctx;
        round_ctx.expected_parent = parent;
        let view_before = self.rounds.get(&number).map(|r| r.view).unwrap_or(0);
        let actions = match self.rounds.get_mut(&number) {
            Some(round) => round.try_propose(fresh, &round_ctx),
            None => Vec::new(),
        };
        self.postprocess(number, view_before, actions)
    }

    pub fn handle_message(&mut self, msg: ConsensusMsg, ctx: &RoundContext) -> Vec<Action> {
        if self.stalled.is_some() {
            return Vec::new();
        }
        let number = msg.block_number();
        if number < self.next_to_finalize {
            return Vec::new();
        }
        if !self.in_window(number) {
            if matches!(msg, ConsensusMsg::Aggregate(_)) {
                self.stalled = Some(number);
                return vec![Action::Behind { expected: number }];
            }
            if self.future.len() < MAX_FUTURE_BUFFER {
                self.future.push_back(msg);
            }
            return Vec::new();
        }
        let Some(parent) = self.expected_parent(number) else {
            // predecessor not proposed yet; retry from the buffer on tick
            if self.future.len() < MAX_FUTURE_BUFFER {
                self.future.push_back(msg);
            }
            return Vec::new();
        };

        self.ensure_round(number, ctx);
        let mut round_ctx = *ctx;
        round_ctx.expected_parent = parent;
        let view_before = self.rounds.get(&number).map(|r| r.view).unwrap_or(0);
        let actions = match self.rounds.get_mut(&number) {
            Some(round) => match msg {
                ConsensusMsg::Proposal(p) => round.handle_proposal(p, &round_ctx),
                ConsensusMsg::Vote(v) => round.handle_vote(v, &round_ctx),
                ConsensusMsg::Aggregate(qc) => round.apply_qc(qc, &round_ctx),
                ConsensusMsg::ViewChange(vc) => round.handle_view_change(vc, &round_ctx),
            },
            None => Vec::new(),
        };
        self.postprocess(number, view_before, actions)
    }

    /// Timer sweep plus a drain of buffered messages that became routable.
    pub fn tick(&mut self, ctx: &RoundContext) -> Vec<Action> {
        let mut out = Vec::new();
        if self.stalled.is_some() {
            return out;
        }

        let open: Vec<BlockNumber> = self.rounds.keys().copied().collect();
        for number in open {
            let timed_out = self
                .rounds
                .get(&number)
                .map(|r| r.timed_out(ctx.now))
                .unwrap_or(false);
            if !timed_out {
                continue;
            }
            let view_before = self.rounds.get(&number).map(|r| r.view).unwrap_or(0);
            let actions = match self.rounds.get_mut(&number) {
                Some(round) => round.on_timeout(ctx),
                None => Vec::new(),
            };
            out.extend(self.postprocess(number, view_before, actions));
        }

        // retry buffered messages whose round became routable
        let waiting: Vec<ConsensusMsg> = self.future.drain(..).collect();
        for msg in waiting {
            if self.in_window(msg.block_number())
                && self.expected_parent(msg.block_number()).is_some()
            {
                out.extend(self.handle_message(msg, ctx));
            } else if msg.block_number() >= self.next_to_finalize
                && self.future.len() < MAX_FUTURE_BUFFER
            {
                self.future.push_back(msg);
            }
        }
        out
    }

    fn postprocess(
        &mut self,
        number: BlockNumber,
        view_before: View,
        actions: Vec<Action>,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        for action in actions {
            match action {
                Action::Behind { expected } => {
                    self.stalled = Some(expected);
                    out.push(Action::Behind { expected });
                }
                Action::Finalized(fb) => {
                    self.pending.insert(fb.block_number, fb);
                }
                other => out.push(other),
            }
        }

        // view change: the proposer above may now chain from a dead block
        let view_now = self.rounds.get(&number).map(|r| r.view).unwrap_or(view_before);
        if view_now > view_before {
            self.min_next_view = self.min_next_view.max(view_now + 1);
            let doomed: Vec<BlockNumber> = self
                .rounds
                .keys()
                .copied()
                .filter(|n| *n > number)
                .collect();
            for n in doomed {
                self.rounds.remove(&n);
                self.pending.remove(&n);
            }
        }

        // in-order release of decided blocks
        while let Some(fb) = self.pending.remove(&self.next_to_finalize) {
            self.tip_hash = fb.block_hash;
            self.rounds.remove(&fb.block_number);
            self.next_to_finalize += 1;
            out.push(Action::Finalized(fb));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds_follow_next_to_finalize() {
        let engine = PipelinedBft::new(5, [0u8; 32], 3);
        assert!(engine.in_window(5));
        assert!(engine.in_window(7));
        assert!(!engine.in_window(8));
        assert!(!engine.in_window(4));
    }

    #[test]
    fn parent_of_head_round_is_tip() {
        let engine = PipelinedBft::new(5, [9u8; 32], 3);
        assert_eq!(engine.expected_parent(5), Some([9u8; 32]));
        assert_eq!(engine.expected_parent(6), None);
    }

    #[test]
    fn restart_clears_stall_and_old_buffered() {
        let mut engine = PipelinedBft::new(1, [0u8; 32], 2);
        engine.stalled = Some(40);
        engine.restart(48, [7u8; 32]);
        assert!(!engine.is_stalled());
        assert_eq!(engine.current_block(), 48);
        assert_eq!(engine.expected_parent(48), Some([7u8; 32]));
    }
}
