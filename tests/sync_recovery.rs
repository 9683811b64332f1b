// tests/sync_recovery.rs
// Catch-up scenarios: batch requests, atomic fork swap, abort on invalid
// blocks, and the restart-replay law.

mod common;

use std::sync::Arc;
use std::time::Instant;

use basalt::block::{
    genesis_hash, receipt_root, root_of, Block, BlockHash, BlockHeader, PROTOCOL_VERSION,
};
use basalt::executor::TransferRuntime;
use basalt::state::{MemState, SharedState, StateDb};
use basalt::storage::{BlockStore, MemStore, ReceiptStore};
use basalt::sync::{serve_sync_request, SyncAction, SyncProtocol, MAX_SYNC_BATCH};

use common::{Cluster, TEST_CHAIN_ID};

/// Build a chain of empty blocks in a fresh store, single-signer bitmaps.
fn build_server_chain(blocks: u64) -> (Arc<MemStore>, Arc<dyn StateDb>, BlockHash) {
    let store = MemStore::shared();
    let state: Arc<dyn StateDb> = Arc::new(MemState::new());
    let mut parent = genesis_hash(TEST_CHAIN_ID, "basalt-test");

    for _ in 1..=blocks {
        let block = Block {
            header: BlockHeader {
                parent_hash: parent,
                state_root: state.root(),
                tx_root: root_of(&[]),
                receipt_root: receipt_root(&[]),
                timestamp_ms: 0,
                proposer: [0u8; 20],
                chain_id: TEST_CHAIN_ID,
                gas_used: 0,
                gas_limit: 30_000_000,
                base_fee: 10_000,
                protocol_version: PROTOCOL_VERSION,
                extra: Vec::new(),
            },
            transactions: Vec::new(),
        };
        store
            .put_full_block(&block, &block.encode(), 0b1)
            .expect("mem store write");
        parent = block.hash();
    }
    (store, state, parent)
}

#[test]
fn sync_recovery_applies_and_swaps_atomically() {
    let (server_store, server_state, server_tip_hash) = build_server_chain(47);
    let server_blocks: Arc<dyn BlockStore> = server_store;

    let runtime = TransferRuntime::new(TEST_CHAIN_ID, false);
    let shared = SharedState::in_memory();
    let client_store = MemStore::shared();
    let client_blocks: Arc<dyn BlockStore> = client_store.clone();
    let client_receipts: Arc<dyn ReceiptStore> = client_store.clone();

    let genesis = genesis_hash(TEST_CHAIN_ID, "basalt-test");
    let mut sync = SyncProtocol::new();
    let now = Instant::now();

    // trailing by 47 blocks starts a session with one batch request of 50
    let first = sync
        .begin("peer-1", 47, 0, genesis, &shared, now)
        .expect("session should open");
    let (mut from, mut max_blocks) = match first {
        SyncAction::Request {
            from, max_blocks, ..
        } => (from, max_blocks),
        other => panic!("expected request, got {:?}", other),
    };
    assert_eq!(from, 1);
    assert_eq!(max_blocks, MAX_SYNC_BATCH);
    assert!(sync.is_active());

    // re-entry while a session is active is a no-op
    assert!(sync.begin("peer-2", 47, 0, genesis, &shared, now).is_none());

    let (new_tip, new_tip_hash) = loop {
        let (blocks, best) = serve_sync_request(&server_blocks, from, max_blocks).unwrap();
        let actions = sync.handle_response(
            "peer-1",
            &blocks,
            best,
            &runtime,
            &shared,
            &client_blocks,
            &client_receipts,
            1,
            now,
        );
        match actions.into_iter().next().expect("an action") {
            SyncAction::Request {
                from: f,
                max_blocks: m,
                ..
            } => {
                from = f;
                max_blocks = m;
            }
            SyncAction::Installed {
                new_tip,
                new_tip_hash,
            } => break (new_tip, new_tip_hash),
            SyncAction::Aborted { .. } => panic!("honest sync aborted"),
        }
    };

    assert_eq!(new_tip, 47);
    assert_eq!(new_tip_hash, server_tip_hash);
    assert!(!sync.is_active());
    // swapped state is bit-for-bit the server's
    assert_eq!(shared.current().root(), server_state.root());
    assert_eq!(client_blocks.get_latest_block_number().unwrap(), Some(47));
    assert_eq!(client_blocks.get_commit_bitmap(47).unwrap(), Some(0b1));

    // consensus restarts at block 48 and finalises it in the next round
    let mut cluster = Cluster::starting_at(&[100], 47, new_tip_hash);
    cluster.step();
    assert_eq!(cluster.nodes[0].latest_number, 48);
    assert_eq!(cluster.nodes[0].finalized[0].parent, new_tip_hash);
}

#[test]
fn failed_batch_leaves_canonical_state_untouched() {
    let (server_store, _, _) = build_server_chain(10);
    let server_blocks: Arc<dyn BlockStore> = server_store;

    let runtime = TransferRuntime::new(TEST_CHAIN_ID, false);
    let shared = SharedState::in_memory();
    shared.current().set(b"pre-sync", b"marker".to_vec());
    let root_before = shared.current().root();

    let client_store = MemStore::shared();
    let client_blocks: Arc<dyn BlockStore> = client_store.clone();
    let client_receipts: Arc<dyn ReceiptStore> = client_store;

    let genesis = genesis_hash(TEST_CHAIN_ID, "basalt-test");
    let mut sync = SyncProtocol::new();
    let now = Instant::now();
    sync.begin("peer-1", 10, 0, genesis, &shared, now).unwrap();

    // tamper with the third block of the batch
    let (mut blocks, best) = serve_sync_request(&server_blocks, 1, 50).unwrap();
    let mut bad = Block::decode(&blocks[2].raw_bytes).unwrap();
    bad.header.state_root = [0xee; 32];
    blocks[2].raw_bytes = bad.encode();

    let actions = sync.handle_response(
        "peer-1",
        &blocks,
        best,
        &runtime,
        &shared,
        &client_blocks,
        &client_receipts,
        1,
        now,
    );
    match actions.as_slice() {
        [SyncAction::Aborted { peer_id, ban }] => {
            assert_eq!(peer_id.as_str(), "peer-1");
            assert!(*ban, "invalid blocks must ban the serving peer");
        }
        other => panic!("expected abort, got {:?}", other),
    }
    assert!(!sync.is_active());
    // invariant: the canonical root is exactly the pre-sync root
    assert_eq!(shared.current().root(), root_before);
    assert_eq!(client_blocks.get_latest_block_number().unwrap(), None);
}

#[test]
fn batch_timeout_aborts_without_ban() {
    let shared = SharedState::in_memory();
    let genesis = genesis_hash(TEST_CHAIN_ID, "basalt-test");
    let mut sync = SyncProtocol::new();
    let now = Instant::now();
    sync.begin("peer-1", 5, 0, genesis, &shared, now).unwrap();

    assert!(sync.check_timeout(now).is_none());
    let later = now + basalt::sync::SYNC_BATCH_TIMEOUT + std::time::Duration::from_millis(1);
    match sync.check_timeout(later) {
        Some(SyncAction::Aborted { peer_id, ban }) => {
            assert_eq!(peer_id, "peer-1");
            assert!(!ban, "silence is not a bannable offence");
        }
        other => panic!("expected abort, got {:?}", other),
    }
    assert!(!sync.is_active());
}

#[test]
fn restart_replay_reproduces_the_state_root() {
    let (server_store, server_state, server_tip_hash) = build_server_chain(23);
    let server_blocks: Arc<dyn BlockStore> = server_store;
    let runtime = TransferRuntime::new(TEST_CHAIN_ID, false);

    let (recovered, latest, tip_hash) =
        basalt::recover_state(&server_blocks, &runtime, TEST_CHAIN_ID, "basalt-test").unwrap();
    assert_eq!(latest, 23);
    assert_eq!(tip_hash, server_tip_hash);
    assert_eq!(recovered.current().root(), server_state.root());
}

#[test]
fn recovery_refuses_a_foreign_chain_id() {
    let (server_store, _, _) = build_server_chain(3);
    let server_blocks: Arc<dyn BlockStore> = server_store;
    let runtime = TransferRuntime::new(999, false);
    let err = basalt::recover_state(&server_blocks, &runtime, 999, "basalt-test").unwrap_err();
    assert!(err.to_string().contains("chain"));
}
