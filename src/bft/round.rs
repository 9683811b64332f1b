// src/bft/round.rs
// One round = the attempt to decide one block number. The machine is
// synchronous: every handler returns the outbound actions it wants taken
// and the coordinator is the only component that turns them into I/O.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::bft::messages::{
    proposal_signing_bytes, ConsensusMsg, Phase, Proposal, QuorumCertificate, ViewChange, Vote,
    VotePhase,
};
use crate::bft::qc::{form_qc, verify_qc, verify_vote};
use crate::block::{Block, BlockHash, BlockNumber, ValidatorIndex, View};
use crate::crypto::{AggregateScheme, SecretSeed};
use crate::slashing::Evidence;
use crate::validators::ValidatorSet;

/// Outbound effect requested by a handler.
#[derive(Debug, Clone)]
pub enum Action {
    Broadcast(ConsensusMsg),
    /// Individual votes go straight to the view's leader.
    SendToLeader(ValidatorIndex, ConsensusMsg),
    Finalized(FinalizedBlock),
    /// A QC ahead of us was observed; the coordinator must sync.
    Behind { expected: BlockNumber },
    Evidence(Evidence),
}

#[derive(Debug, Clone)]
pub struct FinalizedBlock {
    pub block_number: BlockNumber,
    pub block_hash: BlockHash,
    pub block: Block,
    pub raw_bytes: Vec<u8>,
    pub bitmap: u64,
}

/// Everything a handler needs from the node, borrowed per call so the round
/// itself stays plain data.
#[derive(Clone, Copy)]
pub struct RoundContext<'a> {
    pub set: &'a ValidatorSet,
    /// Our validator slot; `None` runs the round as a non-voting observer.
    pub me: Option<ValidatorIndex>,
    pub classical_seed: Option<&'a SecretSeed>,
    pub agg_seed: Option<&'a SecretSeed>,
    pub scheme: &'a dyn AggregateScheme,
    /// Hash the proposed block must chain from.
    pub expected_parent: BlockHash,
    pub view_timeout: Duration,
    pub now: Instant,
}

impl<'a> RoundContext<'a> {
    fn is_me(&self, index: ValidatorIndex) -> bool {
        self.me == Some(index)
    }
}

pub struct Round {
    pub block_number: BlockNumber,
    pub view: View,
    pub phase: Phase,
    proposed_hash: Option<BlockHash>,
    proposed_block: Option<Block>,
    proposed_raw: Vec<u8>,
    /// Leader-side accumulation: (phase, hash) -> signer -> signature.
    votes: HashMap<(VotePhase, BlockHash), HashMap<ValidatorIndex, Vec<u8>>>,
    /// First hash seen per (phase, signer) this view, for equivocation.
    vote_hashes: HashMap<(VotePhase, ValidatorIndex), BlockHash>,
    qc_emitted: HashSet<VotePhase>,
    /// View-change accumulation per target view.
    view_change_votes: HashMap<View, HashMap<ValidatorIndex, Vec<u8>>>,
    prevote_qc: Option<QuorumCertificate>,
    /// Highest PreCommit QC seen; what a new leader must re-propose.
    locked_qc: Option<QuorumCertificate>,
    /// Our own pre-commits per view (safety rule bookkeeping).
    my_precommits: HashMap<View, BlockHash>,
    /// Next view-change target; advances on every timeout.
    vc_target: View,
    deadline: Instant,
    timeout_exponent: u32,
    finalized: bool,
}

impl Round {
    pub fn new(block_number: BlockNumber, view: View, now: Instant, timeout: Duration) -> Self {
        Self {
            block_number,
            view,
            phase: Phase::Proposing,
            proposed_hash: None,
            proposed_block: None,
            proposed_raw: Vec::new(),
            votes: HashMap::new(),
            vote_hashes: HashMap::new(),
            qc_emitted: HashSet::new(),
            view_change_votes: HashMap::new(),
            prevote_qc: None,
            locked_qc: None,
            my_precommits: HashMap::new(),
            vc_target: view,
            deadline: now + timeout,
            timeout_exponent: 0,
            finalized: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn proposed_hash(&self) -> Option<BlockHash> {
        self.proposed_hash
    }

    pub fn locked_qc(&self) -> Option<&QuorumCertificate> {
        self.locked_qc.as_ref()
    }

    pub fn prevote_qc(&self) -> Option<&QuorumCertificate> {
        self.prevote_qc.as_ref()
    }

    pub fn leader_index(&self, set: &ValidatorSet) -> ValidatorIndex {
        set.leader(self.view).index
    }

    /// True when this node should build and publish a proposal.
    pub fn wants_proposal(&self, ctx: &RoundContext) -> bool {
        !self.finalized
            && self.phase == Phase::Proposing
            && self.proposed_hash.is_none()
            && ctx.is_me(self.leader_index(ctx.set))
    }

    /// Leader path. `fresh` is the coordinator-built candidate; it is
    /// ignored when a locked QC forces re-proposing an earlier block.
    pub fn try_propose(&mut self, fresh: Option<Block>, ctx: &RoundContext) -> Vec<Action> {
        if !self.wants_proposal(ctx) {
            return Vec::new();
        }
        let Some(classical) = ctx.classical_seed else {
            return Vec::new();
        };

        let (block, justify) = match (&self.locked_qc, &self.proposed_block) {
            (Some(lock), Some(prev)) if prev.hash() == lock.block_hash => {
                (prev.clone(), Some(lock.clone()))
            }
            (Some(lock), _) => {
                // locked on a block whose bytes we never saw; only sync can help
                log::warn!(
                    "leader locked on unknown block {} at view {}, cannot propose",
                    crate::block::short_hex(&lock.block_hash),
                    self.view
                );
                return Vec::new();
            }
            (None, _) => match fresh {
                Some(block) => (block, None),
                None => return Vec::new(),
            },
        };

        let block_hash = block.hash();
        let me = self.leader_index(ctx.set);
        let payload = proposal_signing_bytes(self.view, self.block_number, &block_hash, me);
        let proposal = Proposal {
            view: self.view,
            block_number: self.block_number,
            block_hash,
            block_bytes: block.encode(),
            proposer_index: me,
            signature: classical.sign(&payload),
            justify,
        };

        self.proposed_hash = Some(block_hash);
        self.proposed_raw = proposal.block_bytes.clone();
        self.proposed_block = Some(block);
        self.phase = Phase::PreVote;

        let mut actions = vec![Action::Broadcast(ConsensusMsg::Proposal(proposal))];
        actions.extend(self.cast_vote(VotePhase::PreVote, block_hash, ctx));
        actions
    }

    /// Replica path: validate the leader's proposal and pre-vote for it.
    pub fn handle_proposal(&mut self, p: Proposal, ctx: &RoundContext) -> Vec<Action> {
        if self.finalized || p.block_number != self.block_number {
            return Vec::new();
        }
        if p.view != self.view {
            // stale proposals are dropped; future views arrive via view change
            return Vec::new();
        }

        let leader = match ctx.set.get(self.leader_index(ctx.set)) {
            Some(v) => v,
            None => return Vec::new(),
        };
        if p.proposer_index != leader.index {
            log::warn!(
                "proposal for view {} from non-leader index {}",
                p.view,
                p.proposer_index
            );
            return Vec::new();
        }
        let payload = proposal_signing_bytes(p.view, p.block_number, &p.block_hash, p.proposer_index);
        if !crate::crypto::verify_bytes(&leader.public_key, &payload, &p.signature) {
            log::warn!("proposal signature check failed for view {}", p.view);
            return Vec::new();
        }

        let block = match Block::decode(&p.block_bytes) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("undecodable proposal at view {}: {}", p.view, e);
                return Vec::new();
            }
        };
        if block.hash() != p.block_hash {
            log::warn!("proposal hash does not match block bytes at view {}", p.view);
            return Vec::new();
        }
        if block.header.parent_hash != ctx.expected_parent {
            log::warn!(
                "proposal at view {} does not chain from {} (got {})",
                p.view,
                crate::block::short_hex(&ctx.expected_parent),
                crate::block::short_hex(&block.header.parent_hash)
            );
            return Vec::new();
        }

        // a second, different proposal in the same view is equivocation
        if let Some(existing) = self.proposed_hash {
            if existing != p.block_hash {
                return vec![Action::Evidence(Evidence::Equivocation {
                    validator_index: p.proposer_index,
                    block_number: self.block_number,
                    view: self.view,
                    hash_a: existing,
                    hash_b: p.block_hash,
                })];
            }
            return Vec::new(); // duplicate delivery
        }

        let justified = p.justify.as_ref().is_some_and(|j| {
            j.phase == VotePhase::PreCommit
                && j.block_hash == p.block_hash
                && verify_qc(j, ctx.set, ctx.scheme)
        });
        if let Some(justify) = p.justify.as_ref().filter(|_| justified) {
            self.update_lock(justify.clone());
        }

        // safety: never pre-vote against an earlier own pre-commit unless a
        // higher QC justifies it
        let conflicting_precommit = self
            .my_precommits
            .iter()
            .any(|(v, h)| *v < self.view && *h != p.block_hash);
        if conflicting_precommit && !justified {
            log::warn!(
                "refusing to pre-vote {} at view {}: conflicts with own pre-commit",
                crate::block::short_hex(&p.block_hash),
                self.view
            );
            return Vec::new();
        }
        if let Some(lock) = &self.locked_qc {
            if lock.block_hash != p.block_hash && !justified {
                log::warn!(
                    "refusing proposal at view {}: locked on {}",
                    self.view,
                    crate::block::short_hex(&lock.block_hash)
                );
                return Vec::new();
            }
        }

        self.proposed_hash = Some(p.block_hash);
        self.proposed_raw = p.block_bytes;
        self.proposed_block = Some(block);
        if self.phase == Phase::Proposing || self.phase == Phase::ViewChange {
            self.phase = Phase::PreVote;
        }
        self.cast_vote(VotePhase::PreVote, p.block_hash, ctx)
    }

    /// Leader path: accumulate an individual vote, publish the aggregate QC
    /// once a quorum for one hash exists.
    pub fn handle_vote(&mut self, v: Vote, ctx: &RoundContext) -> Vec<Action> {
        if self.finalized || v.block_number != self.block_number || v.view != self.view {
            return Vec::new(); // votes for past views are silently dropped
        }
        if v.phase == VotePhase::ViewChange {
            return Vec::new(); // view changes arrive as ViewChange messages
        }
        if !ctx.is_me(self.leader_index(ctx.set)) {
            return Vec::new(); // only the leader accumulates
        }
        if !verify_vote(&v, ctx.set, ctx.scheme) {
            log::warn!(
                "vote signature check failed: index {} view {}",
                v.validator_index,
                v.view
            );
            return Vec::new();
        }

        // double-signing the same (phase, view) with a different hash
        match self.vote_hashes.get(&(v.phase, v.validator_index)) {
            Some(existing) if *existing != v.block_hash => {
                return vec![Action::Evidence(Evidence::Equivocation {
                    validator_index: v.validator_index,
                    block_number: self.block_number,
                    view: self.view,
                    hash_a: *existing,
                    hash_b: v.block_hash,
                })];
            }
            Some(_) => return Vec::new(), // duplicate
            None => {
                self.vote_hashes
                    .insert((v.phase, v.validator_index), v.block_hash);
            }
        }

        let bucket = self.votes.entry((v.phase, v.block_hash)).or_default();
        bucket.insert(v.validator_index, v.signature.clone());

        if bucket.len() >= ctx.set.quorum_threshold() && !self.qc_emitted.contains(&v.phase) {
            self.qc_emitted.insert(v.phase);
            let votes: Vec<(ValidatorIndex, Vec<u8>)> = bucket
                .iter()
                .map(|(idx, sig)| (*idx, sig.clone()))
                .collect();
            let qc = form_qc(
                v.phase,
                self.view,
                self.block_number,
                v.block_hash,
                &votes,
                ctx.scheme,
            );
            let mut actions = vec![Action::Broadcast(ConsensusMsg::Aggregate(qc.clone()))];
            actions.extend(self.apply_qc(qc, ctx));
            return actions;
        }
        Vec::new()
    }

    /// Apply an aggregate certificate, ours or a received one.
    pub fn apply_qc(&mut self, qc: QuorumCertificate, ctx: &RoundContext) -> Vec<Action> {
        if self.finalized || qc.block_number != self.block_number {
            return Vec::new();
        }
        if !verify_qc(&qc, ctx.set, ctx.scheme) {
            log::warn!(
                "invalid QC dropped: phase {:?} view {} signers {}",
                qc.phase,
                qc.view,
                qc.signer_count()
            );
            return Vec::new();
        }

        // lock on the highest PreCommit QC regardless of its view
        if qc.phase == VotePhase::PreCommit {
            self.update_lock(qc.clone());
        }
        if qc.view != self.view && qc.phase != VotePhase::Commit {
            return Vec::new(); // old-view QC only contributes its lock
        }

        match qc.phase {
            VotePhase::PreVote => {
                if !matches!(self.phase, Phase::Proposing | Phase::PreVote | Phase::ViewChange) {
                    return Vec::new();
                }
                // safety: one pre-commit hash per view, ever
                if let Some(h) = self.my_precommits.get(&self.view) {
                    if *h != qc.block_hash {
                        log::error!(
                            "refusing second pre-commit at view {}: {} vs {}",
                            self.view,
                            crate::block::short_hex(h),
                            crate::block::short_hex(&qc.block_hash)
                        );
                        return Vec::new();
                    }
                }
                self.prevote_qc = Some(qc.clone());
                self.phase = Phase::PreCommit;
                self.my_precommits.insert(self.view, qc.block_hash);
                self.cast_vote(VotePhase::PreCommit, qc.block_hash, ctx)
            }
            VotePhase::PreCommit => {
                if !matches!(
                    self.phase,
                    Phase::Proposing | Phase::PreVote | Phase::PreCommit | Phase::ViewChange
                ) {
                    return Vec::new();
                }
                self.phase = Phase::Commit;
                self.cast_vote(VotePhase::Commit, qc.block_hash, ctx)
            }
            VotePhase::Commit => self.finalize(qc),
            VotePhase::ViewChange => Vec::new(),
        }
    }

    fn finalize(&mut self, qc: QuorumCertificate) -> Vec<Action> {
        match &self.proposed_block {
            Some(block) if block.hash() == qc.block_hash => {
                self.finalized = true;
                self.phase = Phase::Commit;
                vec![Action::Finalized(FinalizedBlock {
                    block_number: self.block_number,
                    block_hash: qc.block_hash,
                    block: block.clone(),
                    raw_bytes: self.proposed_raw.clone(),
                    bitmap: qc.bitmap,
                })]
            }
            _ => {
                // the network decided a block we never received in full
                log::warn!(
                    "commit QC for unknown block {} at {}",
                    crate::block::short_hex(&qc.block_hash),
                    self.block_number
                );
                vec![Action::Behind {
                    expected: self.block_number,
                }]
            }
        }
    }

    /// View-change votes are broadcast; every replica counts them so a dead
    /// leader cannot stall the quorum detection.
    pub fn handle_view_change(&mut self, vc: ViewChange, ctx: &RoundContext) -> Vec<Action> {
        if self.finalized
            || vc.vote.block_number != self.block_number
            || vc.vote.phase != VotePhase::ViewChange
        {
            return Vec::new();
        }
        let target = vc.vote.view;
        if target <= self.view {
            return Vec::new();
        }
        if !verify_vote(&vc.vote, ctx.set, ctx.scheme) {
            log::warn!(
                "view-change signature check failed: index {}",
                vc.vote.validator_index
            );
            return Vec::new();
        }
        if let Some(qc) = vc.highest_qc {
            if qc.phase == VotePhase::PreCommit
                && qc.block_number == self.block_number
                && verify_qc(&qc, ctx.set, ctx.scheme)
            {
                self.update_lock(qc);
            }
        }

        let bucket = self.view_change_votes.entry(target).or_default();
        bucket.insert(vc.vote.validator_index, vc.vote.signature.clone());
        if bucket.len() < ctx.set.quorum_threshold() {
            return Vec::new();
        }

        let old_view = self.view;
        self.enter_view(target, ctx);
        log::warn!(
            "view change: block {} moved from view {} to {} (new leader {})",
            self.block_number,
            old_view,
            target,
            self.leader_index(ctx.set)
        );
        Vec::new()
    }

    fn enter_view(&mut self, view: View, ctx: &RoundContext) {
        self.view = view;
        self.vc_target = view;
        self.phase = Phase::Proposing;
        self.votes.clear();
        self.vote_hashes.clear();
        self.qc_emitted.clear();
        self.prevote_qc = None;
        self.proposed_hash = None; // proposed_block kept for re-proposal
        self.view_change_votes.retain(|target, _| *target > view);
        self.timeout_exponent = self.timeout_exponent.saturating_add(1);
        self.deadline = ctx.now + self.backoff_timeout(ctx.view_timeout);
    }

    fn backoff_timeout(&self, base: Duration) -> Duration {
        base * 2u32.saturating_pow(self.timeout_exponent.min(6))
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Timer expiry on any non-final phase: vote to move one view ahead.
    pub fn on_timeout(&mut self, ctx: &RoundContext) -> Vec<Action> {
        if self.finalized {
            return Vec::new();
        }
        let Some(me) = ctx.me else {
            return Vec::new();
        };
        let Some(agg) = ctx.agg_seed else {
            return Vec::new();
        };

        self.vc_target = self.vc_target.max(self.view).saturating_add(1);
        self.phase = Phase::ViewChange;
        self.timeout_exponent = self.timeout_exponent.saturating_add(1);
        self.deadline = ctx.now + self.backoff_timeout(ctx.view_timeout);

        let locked_hash = self
            .locked_qc
            .as_ref()
            .map(|qc| qc.block_hash)
            .unwrap_or_default();
        let payload = crate::bft::messages::vote_signing_bytes(
            VotePhase::ViewChange,
            self.vc_target,
            self.block_number,
            &locked_hash,
        );
        let vote = Vote {
            phase: VotePhase::ViewChange,
            view: self.vc_target,
            block_number: self.block_number,
            block_hash: locked_hash,
            validator_index: me,
            signature: ctx.scheme.sign(agg.as_bytes(), &payload).unwrap_or_default(),
        };
        log::warn!(
            "view timeout: block {} view {} -> voting for view {}",
            self.block_number,
            self.view,
            self.vc_target
        );
        vec![Action::Broadcast(ConsensusMsg::ViewChange(ViewChange {
            vote,
            highest_qc: self.locked_qc.clone(),
        }))]
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        !self.finalized && now >= self.deadline
    }

    fn update_lock(&mut self, qc: QuorumCertificate) {
        let higher = self.locked_qc.as_ref().map_or(true, |l| qc.view > l.view);
        if higher {
            self.locked_qc = Some(qc);
        }
    }

    fn cast_vote(
        &mut self,
        phase: VotePhase,
        block_hash: BlockHash,
        ctx: &RoundContext,
    ) -> Vec<Action> {
        let Some(me) = ctx.me else {
            return Vec::new(); // observers follow but never vote
        };
        let Some(agg) = ctx.agg_seed else {
            return Vec::new();
        };
        let payload = crate::bft::messages::vote_signing_bytes(
            phase,
            self.view,
            self.block_number,
            &block_hash,
        );
        let vote = Vote {
            phase,
            view: self.view,
            block_number: self.block_number,
            block_hash,
            validator_index: me,
            signature: ctx.scheme.sign(agg.as_bytes(), &payload).unwrap_or_default(),
        };
        vec![Action::SendToLeader(
            self.leader_index(ctx.set),
            ConsensusMsg::Vote(vote),
        )]
    }
}
