// src/bft/engine.rs
// Single-round engine: exactly one undecided block at a time. Wraps the
// round machine with future-message buffering and the behind/stall latch.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::bft::messages::ConsensusMsg;
use crate::bft::round::{Action, Round, RoundContext};
use crate::block::BlockNumber;

/// Votes for future blocks are buffered up to this many entries, then
/// dropped with no error.
pub const MAX_FUTURE_BUFFER: usize = 256;

pub struct BftEngine {
    round: Round,
    future: VecDeque<ConsensusMsg>,
    /// Set when a QC ahead of us proves we are behind; every state change
    /// is refused until the coordinator syncs and restarts the round.
    stalled: Option<BlockNumber>,
}

impl BftEngine {
    pub fn new(start_block: BlockNumber, now: Instant, view_timeout: Duration) -> Self {
        Self {
            round: Round::new(start_block, start_block, now, view_timeout),
            future: VecDeque::new(),
            stalled: None,
        }
    }

    pub fn current_block(&self) -> BlockNumber {
        self.round.block_number
    }

    pub fn current_view(&self) -> u64 {
        self.round.view
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    pub fn stalled_expecting(&self) -> Option<BlockNumber> {
        self.stalled
    }

    /// Open the round for `block_number` (view starts equal to it) and
    /// replay any buffered messages that were waiting for it.
    pub fn start_round(&mut self, block_number: BlockNumber, ctx: &RoundContext) -> Vec<Action> {
        self.stalled = None;
        self.round = Round::new(block_number, block_number, ctx.now, ctx.view_timeout);

        let mut actions = Vec::new();
        let waiting: Vec<ConsensusMsg> = {
            let mut rest = VecDeque::new();
            let mut matched = Vec::new();
            while let Some(msg) = self.future.pop_front() {
                if msg.block_number() == block_number {
                    matched.push(msg);
                } else if msg.block_number() > block_number {
                    rest.push_back(msg);
                }
                // older than the new round: obsolete, dropped
            }
            self.future = rest;
            matched
        };
        for msg in waiting {
            actions.extend(self.route(msg, ctx));
        }
        self.postprocess(actions)
    }

    pub fn wants_proposal(&self, ctx: &RoundContext) -> bool {
        self.stalled.is_none() && self.round.wants_proposal(ctx)
    }

    pub fn try_propose(
        &mut self,
        fresh: Option<crate::block::Block>,
        ctx: &RoundContext,
    ) -> Vec<Action> {
        if self.stalled.is_some() {
            return Vec::new();
        }
        let actions = self.round.try_propose(fresh, ctx);
        self.postprocess(actions)
    }

    pub fn handle_message(&mut self, msg: ConsensusMsg, ctx: &RoundContext) -> Vec<Action> {
        if self.stalled.is_some() {
            return Vec::new();
        }
        let current = self.round.block_number;
        let number = msg.block_number();

        if number < current {
            return Vec::new(); // past blocks: silently dropped
        }
        if number > current {
            // a QC further than the next block proves the network moved on
            if matches!(msg, ConsensusMsg::Aggregate(_)) && number > current + 1 {
                self.stalled = Some(number);
                return vec![Action::Behind { expected: number }];
            }
            if self.future.len() < MAX_FUTURE_BUFFER {
                self.future.push_back(msg);
            }
            return Vec::new();
        }

        let actions = self.route(msg, ctx);
        self.postprocess(actions)
    }

    pub fn check_timeout(&mut self, ctx: &RoundContext) -> Vec<Action> {
        if self.stalled.is_some() || !self.round.timed_out(ctx.now) {
            return Vec::new();
        }
        let actions = self.round.on_timeout(ctx);
        self.postprocess(actions)
    }

    fn route(&mut self, msg: ConsensusMsg, ctx: &RoundContext) -> Vec<Action> {
        match msg {
            ConsensusMsg::Proposal(p) => self.round.handle_proposal(p, ctx),
            ConsensusMsg::Vote(v) => self.round.handle_vote(v, ctx),
            ConsensusMsg::Aggregate(qc) => self.round.apply_qc(qc, ctx),
            ConsensusMsg::ViewChange(vc) => self.round.handle_view_change(vc, ctx),
        }
    }

    fn postprocess(&mut self, actions: Vec<Action>) -> Vec<Action> {
        for action in &actions {
            if let Action::Behind { expected } = action {
                self.stalled = Some(*expected);
            }
        }
        actions
    }
}
