// src/coordinator.rs
// The single-writer dispatch loop. Every network message, timer tick and
// callback funnels through here; components return actions and this module
// is the only place that turns them into I/O or state mutation.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bft::evidence::EvidenceWindow;
use crate::bft::messages::ConsensusMsg;
use crate::bft::round::{Action, FinalizedBlock, RoundContext};
use crate::bft::{BftEngine, PipelinedBft};
use crate::block::{
    receipt_root, short_hex, tx_root, Block, BlockHash, BlockHeader, BlockNumber, ValidatorIndex,
    PROTOCOL_VERSION,
};
use crate::crypto::{AggregateScheme, SecretSeed};
use crate::epoch::EpochManager;
use crate::executor::{execute_block, TxRuntime};
use crate::fee_market::FeeMarket;
use crate::mempool::{Mempool, MempoolError, MempoolEvent};
use crate::network::gossip::GossipLayer;
use crate::network::peer::PeerManager;
use crate::network::wire::Message;
use crate::network::{ConnectionTable, NodeEvent, TipHandle};
use crate::slashing::{Evidence, SlashError, SlashingEngine};
use crate::staking::StakingState;
use crate::state::SharedState;
use crate::storage::{BlockStore, ReceiptStore};
use crate::sync::{serve_sync_request, SyncAction, SyncProtocol};
use crate::validators::ValidatorSet;

/// Dispatch loop cadence.
pub const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Minimum spacing between blocks we lead.
pub const BLOCK_TIME: Duration = Duration::from_secs(1);

/// Base per-view timeout before a view-change vote.
pub const VIEW_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded shutdown; the process aborts the loop after this.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Transactions packed per proposal.
pub const MAX_BLOCK_TXS: usize = 200;

/// Gossip tiers are rebalanced every this many ticks (~10 s).
const REBALANCE_TICKS: u64 = 50;

/// Peers are pinged for latency every this many ticks (~4 s).
const PING_TICKS: u64 = 20;

/// Either consensus engine; both share the round rules.
pub enum ConsensusEngine {
    Single(BftEngine),
    Pipelined(PipelinedBft),
}

/// Context for one engine call, borrowing the coordinator's fields
/// individually so the engine itself can be borrowed mutably alongside.
fn ctx_of<'a>(
    validators: &'a ValidatorSet,
    me: Option<ValidatorIndex>,
    classical: Option<&'a SecretSeed>,
    agg: Option<&'a SecretSeed>,
    scheme: &'a dyn AggregateScheme,
    expected_parent: BlockHash,
    now: Instant,
) -> RoundContext<'a> {
    RoundContext {
        set: validators,
        me,
        classical_seed: classical,
        agg_seed: agg,
        scheme,
        expected_parent,
        view_timeout: VIEW_TIMEOUT,
        now,
    }
}

pub struct Coordinator {
    // identity
    me: Option<ValidatorIndex>,
    classical_seed: Option<SecretSeed>,
    agg_seed: Option<SecretSeed>,
    scheme: Arc<dyn AggregateScheme>,
    chain_id: u32,

    // singletons owned by the loop
    validators: ValidatorSet,
    staking: StakingState,
    slashing: SlashingEngine,
    epochs: EpochManager,
    mempool: Mempool,
    fee_market: FeeMarket,
    evidence_window: EvidenceWindow,
    engine: ConsensusEngine,
    sync: SyncProtocol,
    gossip: GossipLayer,
    peers: PeerManager,

    // collaborators
    shared_state: SharedState,
    block_store: Arc<dyn BlockStore>,
    receipt_store: Arc<dyn ReceiptStore>,
    runtime: Arc<dyn TxRuntime>,
    connections: ConnectionTable,
    tip: TipHandle,

    // chain position
    latest_number: BlockNumber,
    latest_hash: BlockHash,
    last_commit_at: Instant,

    // leader-side speculative post-states for pipelined proposals
    spec_forks: BTreeMap<BlockNumber, (BlockHash, Arc<dyn crate::state::StateDb>)>,

    // ping bookkeeping for gossip latency
    ping_nonce: u64,
    pings_in_flight: HashMap<u64, (String, Instant)>,

    events_rx: mpsc::Receiver<NodeEvent>,
    mempool_events_rx: mpsc::UnboundedReceiver<MempoolEvent>,
    shutdown: CancellationToken,
    tick_count: u64,
}

/// Construction bundle; the node assembly in lib.rs fills this in.
pub struct CoordinatorSeed {
    pub me: Option<ValidatorIndex>,
    pub classical_seed: Option<SecretSeed>,
    pub agg_seed: Option<SecretSeed>,
    pub scheme: Arc<dyn AggregateScheme>,
    pub chain_id: u32,
    pub validators: ValidatorSet,
    pub staking: StakingState,
    pub slashing: SlashingEngine,
    pub epochs: EpochManager,
    pub shared_state: SharedState,
    pub block_store: Arc<dyn BlockStore>,
    pub receipt_store: Arc<dyn ReceiptStore>,
    pub runtime: Arc<dyn TxRuntime>,
    pub connections: ConnectionTable,
    pub tip: TipHandle,
    pub latest_number: BlockNumber,
    pub latest_hash: BlockHash,
    pub use_pipelining: bool,
    pub events_rx: mpsc::Receiver<NodeEvent>,
    pub mempool_events_rx: mpsc::UnboundedReceiver<MempoolEvent>,
    pub mempool: Mempool,
    pub local_peer_id: String,
    pub shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(seed: CoordinatorSeed) -> Self {
        let now = Instant::now();
        let next = seed.latest_number + 1;
        let engine = if seed.use_pipelining {
            ConsensusEngine::Pipelined(PipelinedBft::new(
                next,
                seed.latest_hash,
                crate::bft::pipelined::PIPELINE_DEPTH,
            ))
        } else {
            ConsensusEngine::Single(BftEngine::new(next, now, VIEW_TIMEOUT))
        };
        Self {
            me: seed.me,
            classical_seed: seed.classical_seed,
            agg_seed: seed.agg_seed,
            scheme: seed.scheme,
            chain_id: seed.chain_id,
            validators: seed.validators,
            staking: seed.staking,
            slashing: seed.slashing,
            epochs: seed.epochs,
            mempool: seed.mempool,
            fee_market: FeeMarket::new(),
            evidence_window: EvidenceWindow::new(),
            engine,
            sync: SyncProtocol::new(),
            gossip: GossipLayer::new(),
            peers: PeerManager::new(seed.local_peer_id),
            shared_state: seed.shared_state,
            block_store: seed.block_store,
            receipt_store: seed.receipt_store,
            runtime: seed.runtime,
            connections: seed.connections,
            tip: seed.tip,
            latest_number: seed.latest_number,
            latest_hash: seed.latest_hash,
            last_commit_at: now,
            spec_forks: BTreeMap::new(),
            ping_nonce: 0,
            pings_in_flight: HashMap::new(),
            events_rx: seed.events_rx,
            mempool_events_rx: seed.mempool_events_rx,
            shutdown: seed.shutdown,
            tick_count: 0,
        }
    }

    /// The event loop: wakes every tick and on every inbound event, honours
    /// the shutdown token at every suspension point.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!(
            "coordinator running at block {} ({} validators, quorum {})",
            self.latest_number,
            self.validators.len(),
            self.validators.quorum_threshold()
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("coordinator: shutdown token observed, draining");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.on_tick(now);
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => {
                            let now = Instant::now();
                            self.on_event(event, now);
                        }
                        None => return Ok(()), // all transports gone
                    }
                }
                Some(ev) = self.mempool_events_rx.recv() => {
                    self.on_mempool_event(ev);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // ticks

    fn on_tick(&mut self, now: Instant) {
        self.tick_count += 1;

        if let Some(action) = self.sync.check_timeout(now) {
            self.apply_sync_actions(vec![action], now);
        }

        // trailing the best advertised peer by >= 1 block starts a session
        if !self.sync.is_active() {
            let stalled_target = match &self.engine {
                ConsensusEngine::Single(e) => e.stalled_expecting(),
                ConsensusEngine::Pipelined(e) => e.stalled_expecting(),
            };
            let best_peer = self.peers.best_sync_peer().map(|p| p.best_block).unwrap_or(0);
            if stalled_target.is_some() || best_peer > self.latest_number {
                self.maybe_start_sync(stalled_target.unwrap_or(best_peer), now);
            }
        }

        self.try_propose(now);
        let timeout_actions = self.engine_tick(now);
        self.dispatch_actions(timeout_actions, now);

        if self.tick_count % PING_TICKS == 0 {
            self.ping_peers(now);
        }
        if self.tick_count % REBALANCE_TICKS == 0 {
            let sends = self.gossip.rebalance(&self.peers);
            for send in sends {
                self.connections.send(&send.peer_id, send.message);
            }
        }
    }

    fn ping_peers(&mut self, now: Instant) {
        for peer_id in self.connections.peer_ids() {
            self.ping_nonce = self.ping_nonce.wrapping_add(1);
            let nonce = self.ping_nonce;
            if self.connections.send(&peer_id, Message::Ping(nonce)) {
                self.pings_in_flight.insert(nonce, (peer_id, now));
            }
        }
        // forget pings nobody answered
        self.pings_in_flight
            .retain(|_, (_, sent)| now.duration_since(*sent) < Duration::from_secs(30));
    }

    // ------------------------------------------------------------------
    // inbound events

    fn on_event(&mut self, event: NodeEvent, now: Instant) {
        match event {
            NodeEvent::PeerConnected { identity, endpoint } => {
                if !self.peers.register(
                    &identity.peer_id,
                    &endpoint,
                    identity.best_block_number,
                    identity.best_block_hash,
                ) {
                    return;
                }
                self.gossip.add_peer(&identity.peer_id);
                self.reconcile_validator_identity(&identity);
                log::info!(
                    "peer {} connected (best block {})",
                    identity.peer_id,
                    identity.best_block_number
                );
                if identity.best_block_number > self.latest_number {
                    self.maybe_start_sync(identity.best_block_number, now);
                }
            }
            NodeEvent::PeerDisconnected { peer_id } => {
                self.gossip.remove_peer(&peer_id);
                log::info!("peer {} disconnected", peer_id);
            }
            NodeEvent::PeerMessage { peer_id, raw, msg } => {
                if self.peers.is_banned(&peer_id) {
                    return;
                }
                self.dispatch_message(&peer_id, raw, msg, now);
            }
        }
    }

    /// Placeholder validator rows (new entrants from an epoch snapshot) are
    /// reconciled once the peer's handshake proves its keys.
    fn reconcile_validator_identity(&mut self, identity: &crate::network::handshake::PeerIdentity) {
        let addr = crate::crypto::address_from_public(&identity.classical_pub);
        let slot = self
            .validators
            .iter()
            .find(|v| v.address == addr && v.peer_id != identity.peer_id)
            .map(|v| v.index);
        if let Some(index) = slot {
            self.validators.update_identity(
                index,
                identity.peer_id.clone(),
                identity.classical_pub.clone(),
                identity.aggregate_pub.clone(),
            );
            log::info!("validator {} identity reconciled from handshake", index);
        }
    }

    fn on_mempool_event(&mut self, event: MempoolEvent) {
        match event {
            MempoolEvent::Added(hash) => {
                let sends = self
                    .gossip
                    .broadcast(&Message::TxAnnounce { hashes: vec![hash] }, None);
                for send in sends {
                    self.connections.send(&send.peer_id, send.message);
                }
            }
        }
    }

    fn dispatch_message(&mut self, peer_id: &str, raw: Vec<u8>, msg: Message, now: Instant) {
        // boundary dedup for everything that travels by gossip
        let gossiped = matches!(
            msg,
            Message::TxAnnounce { .. }
                | Message::TxPayload { .. }
                | Message::BlockAnnounce { .. }
                | Message::ConsensusProposal(_)
                | Message::AggregateVote(_)
                | Message::ViewChange(_)
        );
        if gossiped && !self.gossip.observe_inbound(peer_id, &raw) {
            return;
        }

        match msg {
            Message::Hello(_) => {} // handshake is over; ignore

            Message::TxAnnounce { hashes } => {
                let missing: Vec<_> = hashes
                    .into_iter()
                    .filter(|h| !self.mempool.contains(h))
                    .collect();
                if !missing.is_empty() {
                    self.connections
                        .send(peer_id, Message::TxRequest { hashes: missing });
                }
            }
            Message::TxRequest { hashes } => {
                let txs: Vec<_> = hashes
                    .iter()
                    .filter_map(|h| self.mempool.get(h).cloned())
                    .collect();
                if !txs.is_empty() {
                    self.connections.send(peer_id, Message::TxPayload { txs });
                }
            }
            Message::TxPayload { txs } => {
                let state = self.shared_state.current();
                let base_fee = self.fee_market.base_fee;
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                for tx in txs {
                    match self.mempool.add(tx, &*state, base_fee, now_ms) {
                        Ok(_) => {}
                        Err(MempoolError::DuplicateTx) => {}
                        Err(e) => log::debug!("tx from {} rejected: {}", peer_id, e),
                    }
                }
                // re-broadcast the payload so the mesh converges
                self.forward_gossip(&raw, peer_id);
            }

            Message::BlockAnnounce { number, hash } => {
                self.peers.note_best_block(peer_id, number, hash);
                if number > self.latest_number {
                    self.maybe_start_sync(number, now);
                }
            }
            Message::BlockRequest { number } => {
                if let Ok((blocks, _)) = serve_sync_request(&self.block_store, number, 1) {
                    self.connections.send(peer_id, Message::BlockPayload { blocks });
                }
            }
            Message::BlockPayload { blocks } => {
                if let Some(best) = blocks.iter().map(|b| b.number).max() {
                    self.peers.note_best_block(peer_id, best, [0u8; 32]);
                    if best > self.latest_number {
                        self.maybe_start_sync(best, now);
                    }
                }
            }

            Message::SyncRequest { from, max_blocks } => {
                match serve_sync_request(&self.block_store, from, max_blocks) {
                    Ok((blocks, best_block)) => {
                        self.connections.send(
                            peer_id,
                            Message::SyncResponse { blocks, best_block },
                        );
                    }
                    Err(e) => log::warn!("failed to serve sync request: {}", e),
                }
            }
            Message::SyncResponse { blocks, best_block } => {
                self.peers.note_best_block(peer_id, best_block, [0u8; 32]);
                let actions = self.sync.handle_response(
                    peer_id,
                    &blocks,
                    best_block,
                    self.runtime.as_ref(),
                    &self.shared_state,
                    &self.block_store,
                    &self.receipt_store,
                    self.validators.quorum_threshold(),
                    now,
                );
                self.apply_sync_actions(actions, now);
            }

            Message::ConsensusProposal(p) => {
                // coordinator-level equivocation watch, keyed on the full
                // (view, block_number, proposer) triple
                if let Some(evidence) = self.evidence_window.observe_proposal(
                    p.view,
                    p.block_number,
                    p.proposer_index,
                    p.block_hash,
                ) {
                    self.handle_evidence(evidence);
                }
                self.forward_gossip(&raw, peer_id);
                let actions = self.engine_handle(ConsensusMsg::Proposal(p), now);
                self.dispatch_actions(actions, now);
            }
            Message::ConsensusVote(v) => {
                let leader = self.validators.leader(v.view).index;
                if self.me != Some(leader) {
                    // not ours to aggregate; relay toward the leader
                    if let Some(validator) = self.validators.get(leader) {
                        let peer = validator.peer_id.clone();
                        self.connections.send(&peer, Message::ConsensusVote(v));
                    }
                    return;
                }
                let actions = self.engine_handle(ConsensusMsg::Vote(v), now);
                self.dispatch_actions(actions, now);
            }
            Message::AggregateVote(qc) => {
                self.forward_gossip(&raw, peer_id);
                let actions = self.engine_handle(ConsensusMsg::Aggregate(qc), now);
                self.dispatch_actions(actions, now);
            }
            Message::ViewChange(vc) => {
                self.forward_gossip(&raw, peer_id);
                let actions = self.engine_handle(ConsensusMsg::ViewChange(vc), now);
                self.dispatch_actions(actions, now);
            }

            Message::Ping(nonce) => {
                self.connections.send(peer_id, Message::Pong(nonce));
            }
            Message::Pong(nonce) => {
                if let Some((pinged, sent)) = self.pings_in_flight.remove(&nonce) {
                    if pinged == peer_id {
                        let sample = now.duration_since(sent).as_millis() as u64;
                        if let Some(peer) = self.peers.get_mut(peer_id) {
                            peer.note_latency(sample);
                        }
                    }
                }
            }

            Message::IHave { ids } => {
                if let Some(send) = self.gossip.handle_ihave(peer_id, &ids) {
                    self.connections.send(&send.peer_id, send.message);
                }
            }
            Message::IWant { ids } => {
                for send in self.gossip.handle_iwant(peer_id, &ids) {
                    self.connections.send(&send.peer_id, send.message);
                }
            }
            Message::Graft => self.gossip.handle_graft(peer_id),
            Message::Prune => self.gossip.handle_prune(peer_id),
        }
    }

    /// Re-broadcast a gossiped frame to the rest of the mesh.
    fn forward_gossip(&mut self, raw: &[u8], from: &str) {
        let Ok(msg) = Message::decode(raw) else { return };
        self.gossip.cache_payload(raw, &msg);
        let sends = self.gossip.broadcast(&msg, Some(from));
        for send in sends {
            self.connections.send(&send.peer_id, send.message);
        }
    }

    // ------------------------------------------------------------------
    // consensus plumbing

    fn engine_handle(&mut self, msg: ConsensusMsg, now: Instant) -> Vec<Action> {
        if let ConsensusMsg::Proposal(p) = &msg {
            self.note_speculative_block(p);
        }
        let ctx = ctx_of(
            &self.validators,
            self.me,
            self.classical_seed.as_ref(),
            self.agg_seed.as_ref(),
            self.scheme.as_ref(),
            self.latest_hash,
            now,
        );
        match &mut self.engine {
            ConsensusEngine::Single(e) => e.handle_message(msg, &ctx),
            ConsensusEngine::Pipelined(e) => e.handle_message(msg, &ctx),
        }
    }

    fn engine_tick(&mut self, now: Instant) -> Vec<Action> {
        let ctx = ctx_of(
            &self.validators,
            self.me,
            self.classical_seed.as_ref(),
            self.agg_seed.as_ref(),
            self.scheme.as_ref(),
            self.latest_hash,
            now,
        );
        match &mut self.engine {
            ConsensusEngine::Single(e) => e.check_timeout(&ctx),
            ConsensusEngine::Pipelined(e) => e.tick(&ctx),
        }
    }

    /// Leader duties on tick: build proposals against forked state, never
    /// against the canonical copy.
    fn try_propose(&mut self, now: Instant) {
        if self.me.is_none() || now.duration_since(self.last_commit_at) < BLOCK_TIME {
            return;
        }
        if matches!(self.engine, ConsensusEngine::Single(_)) {
            let wants = {
                let ctx = ctx_of(
                    &self.validators,
                    self.me,
                    self.classical_seed.as_ref(),
                    self.agg_seed.as_ref(),
                    self.scheme.as_ref(),
                    self.latest_hash,
                    now,
                );
                match &self.engine {
                    ConsensusEngine::Single(e) => e.wants_proposal(&ctx),
                    ConsensusEngine::Pipelined(_) => false,
                }
            };
            if !wants {
                return;
            }
            let block = self.build_block(self.latest_number + 1, self.latest_hash, true);
            let actions = {
                let ctx = ctx_of(
                    &self.validators,
                    self.me,
                    self.classical_seed.as_ref(),
                    self.agg_seed.as_ref(),
                    self.scheme.as_ref(),
                    self.latest_hash,
                    now,
                );
                match &mut self.engine {
                    ConsensusEngine::Single(e) => e.try_propose(block, &ctx),
                    ConsensusEngine::Pipelined(_) => Vec::new(),
                }
            };
            self.dispatch_actions(actions, now);
            return;
        }

        // pipelined: one proposal per open slot whose parent is known; only
        // the head slot carries transactions, later slots chain empty
        // blocks off speculative state
        let slots = {
            let ctx = ctx_of(
                &self.validators,
                self.me,
                self.classical_seed.as_ref(),
                self.agg_seed.as_ref(),
                self.scheme.as_ref(),
                self.latest_hash,
                now,
            );
            match &mut self.engine {
                ConsensusEngine::Pipelined(e) => e.proposal_slots(&ctx),
                ConsensusEngine::Single(_) => Vec::new(),
            }
        };
        for (number, parent) in slots {
            let head = number == self.latest_number + 1;
            let block = self.build_block(number, parent, head);
            let actions = {
                let ctx = ctx_of(
                    &self.validators,
                    self.me,
                    self.classical_seed.as_ref(),
                    self.agg_seed.as_ref(),
                    self.scheme.as_ref(),
                    parent,
                    now,
                );
                match &mut self.engine {
                    ConsensusEngine::Pipelined(e) => e.try_propose(number, block, &ctx),
                    ConsensusEngine::Single(_) => Vec::new(),
                }
            };
            self.dispatch_actions(actions, now);
        }
    }

    /// Build a candidate block for `number` on top of `parent`. The state
    /// base is the canonical copy for the head slot, or the speculative
    /// post-state of the parent for pipelined slots.
    fn build_block(&mut self, number: BlockNumber, parent: BlockHash, with_txs: bool) -> Option<Block> {
        let base = if number == self.latest_number + 1 {
            self.shared_state.current().fork()
        } else {
            match self.spec_forks.get(&(number - 1)) {
                Some((hash, fork)) if *hash == parent => fork.fork(),
                _ => return None, // parent's post-state unknown yet
            }
        };

        let base_fee = self.fee_market.base_fee;
        let txs = if with_txs {
            self.mempool.pending(MAX_BLOCK_TXS, &*base, base_fee)
        } else {
            Vec::new()
        };

        let candidate = Block {
            header: BlockHeader {
                parent_hash: parent,
                state_root: [0u8; 32],
                tx_root: tx_root(&txs),
                receipt_root: [0u8; 32],
                timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
                proposer: self
                    .classical_seed
                    .as_ref()
                    .map(|s| s.address())
                    .unwrap_or_default(),
                chain_id: self.chain_id,
                gas_used: 0,
                gas_limit: self.fee_market.max_gas_per_block,
                base_fee,
                protocol_version: PROTOCOL_VERSION,
                extra: Vec::new(),
            },
            transactions: txs,
        };

        let (receipts, gas_used) = execute_block(self.runtime.as_ref(), &*base, &candidate, number);
        let mut block = candidate;
        block.header.gas_used = gas_used;
        block.header.receipt_root = receipt_root(&receipts);
        block.header.state_root = base.root();

        self.spec_forks.insert(number, (block.hash(), base));
        Some(block)
    }

    /// Track the post-state of proposals we accept, so pipelined children
    /// can chain off them.
    fn note_speculative_block(&mut self, p: &crate::bft::messages::Proposal) {
        if matches!(self.engine, ConsensusEngine::Single(_)) {
            return;
        }
        if self
            .spec_forks
            .get(&p.block_number)
            .is_some_and(|(hash, _)| *hash == p.block_hash)
        {
            return;
        }
        let base = if p.block_number == self.latest_number + 1 {
            self.shared_state.current().fork()
        } else {
            match self.spec_forks.get(&(p.block_number - 1)) {
                Some((_, fork)) => fork.fork(),
                None => return,
            }
        };
        let Ok(block) = Block::decode(&p.block_bytes) else {
            return;
        };
        let _ = execute_block(self.runtime.as_ref(), &*base, &block, p.block_number);
        if base.root() != block.header.state_root {
            log::warn!(
                "proposal {} state root differs from local replay",
                short_hex(&p.block_hash)
            );
        }
        self.spec_forks.insert(p.block_number, (p.block_hash, base));
    }

    /// Convert returned actions into I/O. Local deliveries (our own votes,
    /// our own broadcasts) are looped back through the engine iteratively.
    fn dispatch_actions(&mut self, actions: Vec<Action>, now: Instant) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Broadcast(cmsg) => {
                    let wire_msg = consensus_to_wire(cmsg.clone());
                    let sends = self.gossip.broadcast(&wire_msg, None);
                    for send in sends {
                        self.connections.send(&send.peer_id, send.message);
                    }
                    // we are part of the mesh too
                    queue.extend(self.engine_handle(cmsg, now));
                }
                Action::SendToLeader(index, cmsg) => {
                    if self.me == Some(index) {
                        queue.extend(self.engine_handle(cmsg, now));
                    } else if let Some(validator) = self.validators.get(index) {
                        let peer = validator.peer_id.clone();
                        self.connections.send(&peer, consensus_to_wire(cmsg));
                    }
                }
                Action::Finalized(fb) => {
                    let follow_up = self.finalize_block(fb, now);
                    queue.extend(follow_up);
                }
                Action::Behind { expected } => {
                    self.maybe_start_sync(expected, now);
                }
                Action::Evidence(evidence) => {
                    self.handle_evidence(evidence);
                }
            }
        }
    }

    /// Commit path: execute against canonical state, persist, prune the
    /// mempool, feed the epoch manager, announce, open the next round.
    fn finalize_block(&mut self, fb: FinalizedBlock, now: Instant) -> Vec<Action> {
        let canonical = self.shared_state.current();
        let (receipts, gas_used) = execute_block(
            self.runtime.as_ref(),
            &*canonical,
            &fb.block,
            fb.block_number,
        );
        if canonical.root() != fb.block.header.state_root {
            // reported, not fatal: we follow the committed chain
            log::error!(
                "block {} state root mismatch after execution",
                fb.block_number
            );
        }

        if let Err(e) = self
            .block_store
            .put_full_block(&fb.block, &fb.raw_bytes, fb.bitmap)
        {
            log::error!("block store write failed: {}", e);
        }
        if let Err(e) = self.receipt_store.put_receipts(fb.block_number, &receipts) {
            log::error!("receipt store write failed: {}", e);
        }

        self.latest_number = fb.block_number;
        self.latest_hash = fb.block_hash;
        self.tip.set(fb.block_number, fb.block_hash);
        self.last_commit_at = now;
        self.fee_market.on_block_finalised(gas_used);

        let state = self.shared_state.current();
        self.mempool.remove_confirmed(&fb.block.transactions);
        self.mempool.prune_stale(&*state, self.fee_market.base_fee);

        self.spec_forks.retain(|n, _| *n > fb.block_number);

        log::info!(
            "finalised block {} {} ({} txs, bitmap {:#b})",
            fb.block_number,
            short_hex(&fb.block_hash),
            fb.block.transactions.len(),
            fb.bitmap
        );

        // epoch accounting and, at boundaries, the validator-set swap
        if let Some(summary) =
            self.epochs
                .on_block_finalised(fb.block_number, fb.bitmap, self.validators.len())
        {
            self.apply_epoch_summary(summary);
        }

        let announce = Message::BlockAnnounce {
            number: fb.block_number,
            hash: fb.block_hash,
        };
        let sends = self.gossip.broadcast(&announce, None);
        for send in sends {
            self.connections.send(&send.peer_id, send.message);
        }

        // open the next round
        match &mut self.engine {
            ConsensusEngine::Single(e) => {
                let ctx = ctx_of(
                    &self.validators,
                    self.me,
                    self.classical_seed.as_ref(),
                    self.agg_seed.as_ref(),
                    self.scheme.as_ref(),
                    self.latest_hash,
                    now,
                );
                e.start_round(fb.block_number + 1, &ctx)
            }
            // the pipelined engine advanced internally
            ConsensusEngine::Pipelined(_) => Vec::new(),
        }
    }

    fn apply_epoch_summary(&mut self, summary: crate::epoch::EpochSummary) {
        log::info!(
            "epoch {} boundary at block {}: {} inactive validators",
            summary.epoch,
            summary.window_end,
            summary.inactive.len()
        );
        for inactive in &summary.inactive {
            let Some(validator) = self.validators.get(inactive.validator_index) else {
                continue;
            };
            let addr = validator.address;
            let evidence = Evidence::Inactivity {
                validator_index: inactive.validator_index,
                first_missed_block: inactive.first_missed_block,
                last_missed_block: inactive.last_missed_block,
            };
            match self
                .slashing
                .slash_inactivity(&mut self.staking, addr, evidence, self.latest_number)
            {
                Ok(Some(record)) => log::warn!(
                    "validator {} slashed {} for missing {} commits",
                    inactive.validator_index,
                    record.slashed_amount,
                    inactive.missed
                ),
                Ok(None) => {}
                Err(e) => log::warn!("inactivity slash skipped: {}", e),
            }
        }

        match self.epochs.build_next_set(&self.staking, &self.validators) {
            Ok(next) => {
                log::info!(
                    "installing validator set for epoch {}: {} members",
                    summary.epoch + 1,
                    next.len()
                );
                self.validators.replace(next);
            }
            Err(e) => log::error!("validator set rebuild failed, keeping old set: {}", e),
        }
    }

    fn handle_evidence(&mut self, evidence: Evidence) {
        let index = evidence.validator_index();
        let Some(validator) = self.validators.get(index) else {
            return;
        };
        let addr = validator.address;
        match evidence {
            Evidence::Equivocation { .. } => {
                match self.slashing.slash_equivocation(
                    &mut self.staking,
                    addr,
                    evidence,
                    self.latest_number,
                ) {
                    Ok(Some(record)) => log::error!(
                        "validator {} slashed {} for equivocation",
                        index,
                        record.slashed_amount
                    ),
                    Ok(None) => log::debug!("duplicate equivocation evidence ignored"),
                    Err(SlashError::StaleEvidence { .. }) => {
                        log::warn!("equivocation evidence outside window, dropped")
                    }
                    Err(e) => log::warn!("equivocation slash failed: {}", e),
                }
            }
            Evidence::Inactivity { .. } => {
                // inactivity evidence only originates from the epoch manager
                log::debug!("stray inactivity evidence ignored");
            }
        }
    }

    // ------------------------------------------------------------------
    // sync plumbing

    fn maybe_start_sync(&mut self, target: BlockNumber, now: Instant) {
        if self.sync.is_active() {
            return; // atomic guard: one session at a time
        }
        let Some(peer) = self.peers.best_sync_peer() else {
            return;
        };
        if peer.best_block <= self.latest_number {
            return;
        }
        let peer_id = peer.peer_id.clone();
        let target = target.max(peer.best_block);
        if let Some(action) = self.sync.begin(
            &peer_id,
            target,
            self.latest_number,
            self.latest_hash,
            &self.shared_state,
            now,
        ) {
            self.apply_sync_actions(vec![action], now);
        }
    }

    fn apply_sync_actions(&mut self, actions: Vec<SyncAction>, now: Instant) {
        for action in actions {
            match action {
                SyncAction::Request {
                    peer_id,
                    from,
                    max_blocks,
                } => {
                    self.connections
                        .send(&peer_id, Message::SyncRequest { from, max_blocks });
                }
                SyncAction::Installed {
                    new_tip,
                    new_tip_hash,
                } => {
                    self.finish_sync(new_tip, new_tip_hash, now);
                }
                SyncAction::Aborted { peer_id, ban } => {
                    if ban {
                        self.peers.ban(&peer_id);
                    }
                    log::warn!("sync session with {} aborted (ban: {})", peer_id, ban);
                }
            }
        }
    }

    /// Sync landed: advance the chain position, replay epoch bitmaps, and
    /// restart consensus at the new height.
    fn finish_sync(&mut self, new_tip: BlockNumber, new_tip_hash: BlockHash, now: Instant) {
        if new_tip <= self.latest_number {
            return;
        }
        log::info!("sync complete: tip {} -> {}", self.latest_number, new_tip);
        self.latest_number = new_tip;
        self.latest_hash = new_tip_hash;
        self.tip.set(new_tip, new_tip_hash);
        self.last_commit_at = now;
        self.spec_forks.clear();

        if let Err(e) = self.epochs.replay(&self.block_store, new_tip) {
            log::error!("epoch replay after sync failed: {}", e);
        }
        let state = self.shared_state.current();
        self.mempool.prune_stale(&*state, self.fee_market.base_fee);

        let actions = match &mut self.engine {
            ConsensusEngine::Single(e) => {
                let ctx = ctx_of(
                    &self.validators,
                    self.me,
                    self.classical_seed.as_ref(),
                    self.agg_seed.as_ref(),
                    self.scheme.as_ref(),
                    self.latest_hash,
                    now,
                );
                e.start_round(new_tip + 1, &ctx)
            }
            ConsensusEngine::Pipelined(e) => {
                e.restart(new_tip + 1, new_tip_hash);
                Vec::new()
            }
        };
        self.dispatch_actions(actions, now);
    }
}

fn consensus_to_wire(msg: ConsensusMsg) -> Message {
    match msg {
        ConsensusMsg::Proposal(p) => Message::ConsensusProposal(p),
        ConsensusMsg::Vote(v) => Message::ConsensusVote(v),
        ConsensusMsg::Aggregate(qc) => Message::AggregateVote(qc),
        ConsensusMsg::ViewChange(vc) => Message::ViewChange(vc),
    }
}
