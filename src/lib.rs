// src/lib.rs
pub mod bft;
pub mod block;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod epoch;
pub mod executor;
pub mod fee_market;
pub mod mempool;
pub mod network;
pub mod slashing;
pub mod staking;
pub mod state;
pub mod storage;
pub mod sync;
pub mod validators;

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::block::{genesis_hash, Block, BlockHash, BlockNumber};
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorSeed};
use crate::crypto::{MultiEd25519, SecretSeed};
use crate::epoch::{EpochManager, EPOCH_LENGTH};
use crate::executor::{execute_block, TransferRuntime, TxRuntime};
use crate::mempool::Mempool;
use crate::network::handshake::LocalIdentity;
use crate::network::{ConnectionTable, Network, TipHandle};
use crate::slashing::{SlashingConfig, SlashingEngine};
use crate::staking::StakingState;
use crate::state::{MemState, SharedState, StateDb};
use crate::storage::{BlockStore, EvidenceStore, ReceiptStore};
use crate::validators::{Validator, ValidatorSet};

/// Coordinator inbox depth; per-peer readers block when it is full, which
/// is the only backpressure the loop needs.
pub const EVENT_QUEUE: usize = 1024;

/// Genesis self-stake for a validator bootstrapped from config alone.
pub const GENESIS_STAKE: u64 = 1_000_000;

/// Deterministically derive the aggregate-capable seed from the classical
/// one so operators manage a single secret.
pub fn derive_agg_seed(classical: &SecretSeed) -> SecretSeed {
    let mut hasher = Sha256::new();
    hasher.update(b"basalt-agg-seed");
    hasher.update(classical.as_bytes());
    SecretSeed::from_bytes(hasher.finalize().into())
}

/// Replay the persisted chain into a fresh in-memory state. Returns the
/// canonical state plus the tip position. A state root that disagrees with
/// the latest header is unrecoverable corruption.
pub fn recover_state(
    store: &Arc<dyn BlockStore>,
    runtime: &dyn TxRuntime,
    chain_id: u32,
    network_name: &str,
) -> Result<(SharedState, BlockNumber, BlockHash)> {
    let state: Arc<dyn StateDb> = Arc::new(MemState::new());
    let latest = store.get_latest_block_number()?.unwrap_or(0);
    let mut tip_hash = genesis_hash(chain_id, network_name);

    for number in 1..=latest {
        let raw = store
            .get_raw_block_by_number(number)?
            .ok_or_else(|| anyhow!("block {} missing from store", number))?;
        let block = Block::decode(&raw)?;
        if block.header.chain_id != chain_id {
            return Err(anyhow!(
                "data directory holds chain {} but chain_id is {}",
                block.header.chain_id,
                chain_id
            ));
        }
        if block.header.parent_hash != tip_hash {
            return Err(anyhow!("block {} does not chain from its parent", number));
        }
        let _ = execute_block(runtime, &*state, &block, number);
        if state.root() != block.header.state_root {
            return Err(anyhow!(
                "state root after replaying block {} does not match its header",
                number
            ));
        }
        tip_hash = block.hash();
    }

    log::info!(
        "recovered chain state: {} blocks, tip {}",
        latest,
        crate::block::short_hex(&tip_hash)
    );
    Ok((SharedState::new(state), latest, tip_hash))
}

/// Running node handles: the coordinator task plus its shutdown token.
pub struct Node {
    pub shutdown: CancellationToken,
    pub coordinator: tokio::task::JoinHandle<Result<()>>,
}

/// Assemble and spawn a node from config and opened stores. The validator
/// roster bootstraps from our own key; epoch snapshots and handshake
/// reconciliation grow it from staking state.
pub fn spawn_node(
    config: &Config,
    block_store: Arc<dyn BlockStore>,
    receipt_store: Arc<dyn ReceiptStore>,
    evidence_store: Arc<dyn EvidenceStore>,
) -> Result<Node> {
    let runtime: Arc<dyn TxRuntime> =
        Arc::new(TransferRuntime::new(config.chain_id, config.use_sandbox));
    let (shared_state, latest_number, latest_hash) = recover_state(
        &block_store,
        runtime.as_ref(),
        config.chain_id,
        &config.network_name,
    )?;

    let classical_seed = config.validator_key.clone();
    let agg_seed = classical_seed.as_ref().map(derive_agg_seed);
    let local_peer_id = classical_seed
        .as_ref()
        .map(|s| hex::encode(s.public()))
        .unwrap_or_else(|| format!("observer-{}", std::process::id()));

    let mut staking = StakingState::new();
    let validators = match (&classical_seed, config.validator_slot()) {
        (Some(seed), Some(0)) => {
            let addr = seed.address();
            staking.register(addr, GENESIS_STAKE.into())?;
            ValidatorSet::new(vec![Validator {
                index: 0,
                peer_id: local_peer_id.clone(),
                public_key: seed.public(),
                agg_public_key: agg_seed
                    .as_ref()
                    .map(|s| s.public())
                    .unwrap_or_default(),
                address: addr,
                stake: GENESIS_STAKE.into(),
            }])?
        }
        _ => {
            // observers and non-zero slots join an existing roster; rows
            // fill in from epoch snapshots and peer handshakes
            let addr = [0u8; 20];
            staking.register(addr, GENESIS_STAKE.into())?;
            ValidatorSet::new(vec![Validator {
                index: 0,
                peer_id: format!("pending-{}", hex::encode(addr)),
                public_key: Vec::new(),
                agg_public_key: Vec::new(),
                address: addr,
                stake: GENESIS_STAKE.into(),
            }])?
        }
    };

    let shutdown = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (mempool_events_tx, mempool_events_rx) = mpsc::unbounded_channel();
    let connections = ConnectionTable::new();
    let tip = TipHandle::new(latest_number, latest_hash);

    let network = Arc::new(Network {
        local: LocalIdentity {
            chain_id: config.chain_id,
            peer_id: local_peer_id.clone(),
            classical_pub: classical_seed
                .as_ref()
                .map(|s| s.public())
                .unwrap_or_default(),
            aggregate_pub: agg_seed.as_ref().map(|s| s.public()).unwrap_or_default(),
            listen_port: config.p2p_port,
            listen_hostname: "0.0.0.0".to_string(),
            genesis_hash: genesis_hash(config.chain_id, &config.network_name),
        },
        events: events_tx,
        connections: connections.clone(),
        tip: tip.clone(),
        shutdown: shutdown.clone(),
    });

    let p2p_port = config.p2p_port;
    tokio::spawn({
        let network = network.clone();
        async move {
            if let Err(e) = crate::network::run_listener(network, p2p_port).await {
                tracing::error!("p2p listener failed: {}", e);
            }
        }
    });
    tokio::spawn(crate::network::maintain_static_peers(
        network,
        config.peers.clone(),
    ));

    let seed = CoordinatorSeed {
        me: if config.consensus_enabled() {
            config.validator_slot()
        } else {
            None
        },
        classical_seed,
        agg_seed,
        scheme: Arc::new(MultiEd25519),
        chain_id: config.chain_id,
        validators,
        staking,
        slashing: SlashingEngine::new(evidence_store.clone(), SlashingConfig::default()),
        epochs: {
            let mut epochs = EpochManager::new(EPOCH_LENGTH, crate::validators::MAX_VALIDATORS);
            epochs.replay(&block_store, latest_number)?;
            epochs
        },
        shared_state,
        block_store,
        receipt_store,
        runtime,
        connections,
        tip,
        latest_number,
        latest_hash,
        use_pipelining: config.use_pipelining,
        events_rx,
        mempool_events_rx,
        mempool: Mempool::with_events(mempool_events_tx),
        local_peer_id,
        shutdown: shutdown.clone(),
    };

    let coordinator = tokio::spawn(Coordinator::new(seed).run());
    Ok(Node {
        shutdown,
        coordinator,
    })
}
