// src/sync.rs
// Chain-sync client: bounded batches replayed against a forked state,
// swapped into the canonical reference only when a whole batch applied.
// One session at a time; starting a second one is a no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::block::{receipt_root, tx_root, Block, BlockHash, BlockNumber};
use crate::executor::{execute_block, TxRuntime};
use crate::network::wire::SyncBlock;
use crate::state::{SharedState, StateDb};
use crate::storage::{BlockStore, ReceiptStore};

/// Blocks per sync request.
pub const MAX_SYNC_BATCH: u32 = 50;

/// Peer silence past this aborts the session (without banning).
pub const SYNC_BATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// What the coordinator must do on behalf of the sync state machine.
#[derive(Debug, Clone)]
pub enum SyncAction {
    /// Send a SyncRequest to the session peer.
    Request {
        peer_id: String,
        from: BlockNumber,
        max_blocks: u32,
    },
    /// Sync finished; consensus restarts from this tip.
    Installed {
        new_tip: BlockNumber,
        new_tip_hash: BlockHash,
    },
    /// Session died. `ban` is set when the peer served invalid blocks.
    Aborted { peer_id: String, ban: bool },
}

struct SyncSession {
    peer_id: String,
    target_block: BlockNumber,
    /// First block of the batch we are waiting for.
    next_request_from: BlockNumber,
    /// Hash the next applied block must chain from.
    parent_hash: BlockHash,
    /// Speculative state the current batch executes against.
    fork: Arc<dyn StateDb>,
    batch_deadline: Instant,
}

pub struct SyncProtocol {
    session: Option<SyncSession>,
}

impl SyncProtocol {
    pub fn new() -> Self {
        Self { session: None }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_peer(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.peer_id.as_str())
    }

    /// Open a session against `peer_id`. Re-entry while one is active is a
    /// no-op, which is the atomic guard the dispatch loop relies on.
    pub fn begin(
        &mut self,
        peer_id: &str,
        target_block: BlockNumber,
        current_tip: BlockNumber,
        current_tip_hash: BlockHash,
        shared: &SharedState,
        now: Instant,
    ) -> Option<SyncAction> {
        if self.session.is_some() {
            return None;
        }
        if target_block <= current_tip {
            return None;
        }
        let from = current_tip + 1;
        tracing::info!(
            "sync: starting against {} for blocks {}..={}",
            peer_id,
            from,
            target_block
        );
        self.session = Some(SyncSession {
            peer_id: peer_id.to_string(),
            target_block,
            next_request_from: from,
            parent_hash: current_tip_hash,
            fork: shared.current().fork(),
            batch_deadline: now + SYNC_BATCH_TIMEOUT,
        });
        Some(SyncAction::Request {
            peer_id: peer_id.to_string(),
            from,
            max_blocks: MAX_SYNC_BATCH,
        })
    }

    /// Apply one response batch. A fully valid batch is swapped into the
    /// canonical state and persisted; any invalid block discards the fork,
    /// aborts the session and bans the peer.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_response(
        &mut self,
        from_peer: &str,
        blocks: &[SyncBlock],
        peer_best: BlockNumber,
        runtime: &dyn TxRuntime,
        shared: &SharedState,
        block_store: &Arc<dyn BlockStore>,
        receipt_store: &Arc<dyn ReceiptStore>,
        quorum: usize,
        now: Instant,
    ) -> Vec<SyncAction> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.peer_id != from_peer {
            return Vec::new(); // response from a peer we never asked
        }
        session.target_block = session.target_block.max(peer_best);

        if blocks.is_empty() {
            // peer has nothing past our tip; session ends where we are
            let tip = session.next_request_from - 1;
            let tip_hash = session.parent_hash;
            tracing::info!("sync: peer {} exhausted at block {}", from_peer, tip);
            self.session = None;
            return vec![SyncAction::Installed {
                new_tip: tip,
                new_tip_hash: tip_hash,
            }];
        }

        type AppliedBlock = (BlockNumber, Block, Vec<u8>, u64, Vec<crate::block::Receipt>);
        let mut applied: Vec<AppliedBlock> = Vec::new();
        let mut expected_number = session.next_request_from;
        let mut parent = session.parent_hash;

        for sync_block in blocks {
            match Self::validate_and_apply(
                sync_block,
                expected_number,
                parent,
                &*session.fork,
                runtime,
                quorum,
            ) {
                Ok((block, receipts)) => {
                    parent = block.hash();
                    applied.push((
                        expected_number,
                        block,
                        sync_block.raw_bytes.clone(),
                        sync_block.commit_bitmap,
                        receipts,
                    ));
                    expected_number += 1;
                }
                Err(reason) => {
                    tracing::warn!(
                        "sync: invalid block {} from {}: {}",
                        sync_block.number,
                        from_peer,
                        reason
                    );
                    let peer_id = session.peer_id.clone();
                    self.session = None; // fork dropped with the session
                    return vec![SyncAction::Aborted { peer_id, ban: true }];
                }
            }
        }

        // whole batch applied: install the fork atomically, then persist
        shared.swap(session.fork.clone());
        for (number, block, raw, bitmap, receipts) in &applied {
            if let Err(e) = block_store.put_full_block(block, raw, *bitmap) {
                tracing::error!("sync: block store write failed: {}", e);
            }
            if let Err(e) = receipt_store.put_receipts(*number, receipts) {
                tracing::error!("sync: receipt store write failed: {}", e);
            }
        }

        let new_tip = expected_number - 1;
        session.next_request_from = expected_number;
        session.parent_hash = parent;
        session.batch_deadline = now + SYNC_BATCH_TIMEOUT;
        tracing::info!(
            "sync: applied batch up to block {} (target {})",
            new_tip,
            session.target_block
        );

        if new_tip >= session.target_block {
            self.session = None;
            return vec![SyncAction::Installed {
                new_tip,
                new_tip_hash: parent,
            }];
        }

        // next batch runs against a fresh fork of the just-installed state
        session.fork = shared.current().fork();
        vec![SyncAction::Request {
            peer_id: session.peer_id.clone(),
            from: expected_number,
            max_blocks: MAX_SYNC_BATCH,
        }]
    }

    fn validate_and_apply(
        sync_block: &SyncBlock,
        expected_number: BlockNumber,
        expected_parent: BlockHash,
        fork: &dyn StateDb,
        runtime: &dyn TxRuntime,
        quorum: usize,
    ) -> Result<(Block, Vec<crate::block::Receipt>), String> {
        if sync_block.number != expected_number {
            return Err(format!(
                "expected block {}, got {}",
                expected_number, sync_block.number
            ));
        }
        if (sync_block.commit_bitmap.count_ones() as usize) < quorum {
            return Err(format!(
                "commit bitmap has {} signers, quorum is {}",
                sync_block.commit_bitmap.count_ones(),
                quorum
            ));
        }
        let block = Block::decode(&sync_block.raw_bytes).map_err(|e| e.to_string())?;
        if block.header.parent_hash != expected_parent {
            return Err("parent hash does not chain".into());
        }
        if tx_root(&block.transactions) != block.header.tx_root {
            return Err("tx root mismatch".into());
        }

        let (receipts, gas_used) = execute_block(runtime, fork, &block, expected_number);
        if gas_used != block.header.gas_used {
            return Err(format!(
                "gas used mismatch: header {}, replay {}",
                block.header.gas_used, gas_used
            ));
        }
        if receipt_root(&receipts) != block.header.receipt_root {
            return Err("receipt root mismatch".into());
        }
        if fork.root() != block.header.state_root {
            return Err("state root mismatch after replay".into());
        }
        Ok((block, receipts))
    }

    /// Batch timer: silence aborts the session without banning.
    pub fn check_timeout(&mut self, now: Instant) -> Option<SyncAction> {
        let expired = self
            .session
            .as_ref()
            .map(|s| now >= s.batch_deadline)
            .unwrap_or(false);
        if !expired {
            return None;
        }
        let session = self.session.take().expect("checked above");
        tracing::warn!(
            "sync: batch timeout waiting for block {} from {}",
            session.next_request_from,
            session.peer_id
        );
        Some(SyncAction::Aborted {
            peer_id: session.peer_id,
            ban: false,
        })
    }
}

impl Default for SyncProtocol {
    fn default() -> Self {
        Self::new()
    }
}

/// Server side: answer a SyncRequest from our own store.
pub fn serve_sync_request(
    block_store: &Arc<dyn BlockStore>,
    from: BlockNumber,
    max_blocks: u32,
) -> anyhow::Result<(Vec<SyncBlock>, BlockNumber)> {
    let latest = block_store.get_latest_block_number()?.unwrap_or(0);
    let mut blocks = Vec::new();
    let capped = max_blocks.min(MAX_SYNC_BATCH) as u64;
    let mut number = from;
    while number <= latest && (blocks.len() as u64) < capped {
        let Some(raw_bytes) = block_store.get_raw_block_by_number(number)? else {
            break;
        };
        let commit_bitmap = block_store.get_commit_bitmap(number)?.unwrap_or(0);
        blocks.push(SyncBlock {
            number,
            raw_bytes,
            commit_bitmap,
        });
        number += 1;
    }
    Ok((blocks, latest))
}
