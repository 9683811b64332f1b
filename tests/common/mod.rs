// tests/common/mod.rs
// In-process cluster harness: drives BftEngine instances directly and
// routes returned actions as a lossless in-memory network.
#![allow(dead_code)] // each scenario binary uses a different subset

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use basalt::bft::round::{Action, RoundContext};
use basalt::bft::{BftEngine, ConsensusMsg};
use basalt::block::{
    genesis_hash, root_of, Block, BlockHash, BlockHeader, BlockNumber, ValidatorIndex,
    PROTOCOL_VERSION,
};
use basalt::crypto::{MultiEd25519, SecretSeed};
use basalt::derive_agg_seed;
use basalt::slashing::Evidence;
use basalt::validators::{Validator, ValidatorSet};
use primitive_types::U256;

pub const TEST_CHAIN_ID: u32 = 31337;
pub const VIEW_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestKeys {
    pub classical: SecretSeed,
    pub agg: SecretSeed,
}

pub fn keys_for(index: u8) -> TestKeys {
    let mut seed = [0u8; 32];
    seed[0] = index + 1;
    seed[31] = 0xb5;
    let classical = SecretSeed::from_bytes(seed);
    let agg = derive_agg_seed(&classical);
    TestKeys { classical, agg }
}

pub fn make_set(stakes: &[u64]) -> (ValidatorSet, Vec<TestKeys>) {
    let keys: Vec<TestKeys> = (0..stakes.len() as u8).map(keys_for).collect();
    let roster = keys
        .iter()
        .enumerate()
        .map(|(i, k)| Validator {
            index: i as ValidatorIndex,
            peer_id: format!("peer-{}", i),
            public_key: k.classical.public(),
            agg_public_key: k.agg.public(),
            address: k.classical.address(),
            stake: U256::from(stakes[i]),
        })
        .collect();
    (ValidatorSet::new(roster).unwrap(), keys)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedRecord {
    pub number: BlockNumber,
    pub hash: BlockHash,
    pub parent: BlockHash,
    pub bitmap: u64,
}

pub struct SimNode {
    pub index: ValidatorIndex,
    pub keys: TestKeys,
    pub engine: BftEngine,
    pub latest_number: BlockNumber,
    pub latest_hash: BlockHash,
    pub finalized: Vec<FinalizedRecord>,
    pub evidence: Vec<Evidence>,
    pub behind: Option<BlockNumber>,
    pub down: bool,
}

enum Target {
    All,
    One(ValidatorIndex),
}

struct Delivery {
    target: Target,
    msg: ConsensusMsg,
}

pub struct Cluster {
    pub set: ValidatorSet,
    pub scheme: MultiEd25519,
    pub nodes: Vec<SimNode>,
    pub now: Instant,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        Self::with_stakes(&vec![100u64; n])
    }

    pub fn with_stakes(stakes: &[u64]) -> Self {
        let genesis = genesis_hash(TEST_CHAIN_ID, "basalt-test");
        Self::starting_at(stakes, 0, genesis)
    }

    /// Cluster whose nodes resume from an already-synced tip.
    pub fn starting_at(stakes: &[u64], tip_number: BlockNumber, tip_hash: BlockHash) -> Self {
        let (set, keys) = make_set(stakes);
        let now = Instant::now();
        let nodes = keys
            .into_iter()
            .enumerate()
            .map(|(i, keys)| SimNode {
                index: i as ValidatorIndex,
                keys,
                engine: BftEngine::new(tip_number + 1, now, VIEW_TIMEOUT),
                latest_number: tip_number,
                latest_hash: tip_hash,
                finalized: Vec::new(),
                evidence: Vec::new(),
                behind: None,
                down: false,
            })
            .collect();
        Self {
            set,
            scheme: MultiEd25519,
            nodes,
            now,
        }
    }

    pub fn leader_of_view(&self, view: u64) -> ValidatorIndex {
        self.set.leader(view).index
    }

    /// Empty block chained on `parent`; deterministic apart from nothing.
    pub fn empty_block(&self, parent: BlockHash, proposer: ValidatorIndex) -> Block {
        Block {
            header: BlockHeader {
                parent_hash: parent,
                state_root: [0u8; 32],
                tx_root: root_of(&[]),
                receipt_root: root_of(&[]),
                timestamp_ms: 0,
                proposer: self.nodes[proposer as usize].keys.classical.address(),
                chain_id: TEST_CHAIN_ID,
                gas_used: 0,
                gas_limit: 30_000_000,
                base_fee: 10_000,
                protocol_version: PROTOCOL_VERSION,
                extra: Vec::new(),
            },
            transactions: Vec::new(),
        }
    }

    /// Every live leader that should propose does so, then the network
    /// drains to quiescence.
    pub fn step(&mut self) {
        let mut bus: VecDeque<Delivery> = VecDeque::new();
        for i in 0..self.nodes.len() {
            if self.nodes[i].down {
                continue;
            }
            let wants = {
                let set = &self.set;
                let scheme = &self.scheme;
                let node = &self.nodes[i];
                let ctx = RoundContext {
                    set,
                    me: Some(node.index),
                    classical_seed: Some(&node.keys.classical),
                    agg_seed: Some(&node.keys.agg),
                    scheme,
                    expected_parent: node.latest_hash,
                    view_timeout: VIEW_TIMEOUT,
                    now: self.now,
                };
                node.engine.wants_proposal(&ctx)
            };
            if !wants {
                continue;
            }
            let block = self.empty_block(self.nodes[i].latest_hash, self.nodes[i].index);
            let actions = {
                let set = &self.set;
                let scheme = &self.scheme;
                let now = self.now;
                let node = &mut self.nodes[i];
                let ctx = RoundContext {
                    set,
                    me: Some(node.index),
                    classical_seed: Some(&node.keys.classical),
                    agg_seed: Some(&node.keys.agg),
                    scheme,
                    expected_parent: node.latest_hash,
                    view_timeout: VIEW_TIMEOUT,
                    now,
                };
                node.engine.try_propose(Some(block), &ctx)
            };
            self.collect(i, actions, &mut bus);
        }
        self.pump(bus);
    }

    /// Move virtual time forward and fire any expired view timers.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        let mut bus: VecDeque<Delivery> = VecDeque::new();
        for i in 0..self.nodes.len() {
            if self.nodes[i].down {
                continue;
            }
            let actions = {
                let set = &self.set;
                let scheme = &self.scheme;
                let now = self.now;
                let node = &mut self.nodes[i];
                let ctx = RoundContext {
                    set,
                    me: Some(node.index),
                    classical_seed: Some(&node.keys.classical),
                    agg_seed: Some(&node.keys.agg),
                    scheme,
                    expected_parent: node.latest_hash,
                    view_timeout: VIEW_TIMEOUT,
                    now,
                };
                node.engine.check_timeout(&ctx)
            };
            self.collect(i, actions, &mut bus);
        }
        self.pump(bus);
    }

    /// Inject a message as if it arrived from the wire at one node.
    pub fn deliver(&mut self, to: ValidatorIndex, msg: ConsensusMsg) {
        let mut bus = VecDeque::new();
        bus.push_back(Delivery {
            target: Target::One(to),
            msg,
        });
        self.pump(bus);
    }

    fn pump(&mut self, mut bus: VecDeque<Delivery>) {
        while let Some(delivery) = bus.pop_front() {
            let targets: Vec<usize> = match delivery.target {
                Target::All => (0..self.nodes.len()).collect(),
                Target::One(idx) => vec![idx as usize],
            };
            for t in targets {
                if t >= self.nodes.len() || self.nodes[t].down {
                    continue;
                }
                let actions = {
                    let set = &self.set;
                    let scheme = &self.scheme;
                    let now = self.now;
                    let node = &mut self.nodes[t];
                    let ctx = RoundContext {
                        set,
                        me: Some(node.index),
                        classical_seed: Some(&node.keys.classical),
                        agg_seed: Some(&node.keys.agg),
                        scheme,
                        expected_parent: node.latest_hash,
                        view_timeout: VIEW_TIMEOUT,
                        now,
                    };
                    node.engine.handle_message(delivery.msg.clone(), &ctx)
                };
                self.collect(t, actions, &mut bus);
            }
        }
    }

    fn collect(&mut self, node_i: usize, actions: Vec<Action>, bus: &mut VecDeque<Delivery>) {
        let mut work: VecDeque<Action> = actions.into();
        while let Some(action) = work.pop_front() {
            match action {
                Action::Broadcast(msg) => bus.push_back(Delivery {
                    target: Target::All,
                    msg,
                }),
                Action::SendToLeader(idx, msg) => bus.push_back(Delivery {
                    target: Target::One(idx),
                    msg,
                }),
                Action::Finalized(fb) => {
                    let follow_up = {
                        let set = &self.set;
                        let scheme = &self.scheme;
                        let now = self.now;
                        let node = &mut self.nodes[node_i];
                        node.latest_number = fb.block_number;
                        node.latest_hash = fb.block_hash;
                        node.finalized.push(FinalizedRecord {
                            number: fb.block_number,
                            hash: fb.block_hash,
                            parent: fb.block.header.parent_hash,
                            bitmap: fb.bitmap,
                        });
                        let ctx = RoundContext {
                            set,
                            me: Some(node.index),
                            classical_seed: Some(&node.keys.classical),
                            agg_seed: Some(&node.keys.agg),
                            scheme,
                            expected_parent: node.latest_hash,
                            view_timeout: VIEW_TIMEOUT,
                            now,
                        };
                        node.engine.start_round(fb.block_number + 1, &ctx)
                    };
                    work.extend(follow_up);
                }
                Action::Behind { expected } => {
                    self.nodes[node_i].behind = Some(expected);
                }
                Action::Evidence(evidence) => {
                    self.nodes[node_i].evidence.push(evidence);
                }
            }
        }
    }
}
