// src/network/peer.rs
// Peer records: advertised tips, bans, reconnect backoff, gossip quality
// counters. One transport connection per peer id; simultaneous-connect
// collisions resolve deterministically by comparing peer ids.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::{BlockHash, BlockNumber};

/// Hard cap on tracked peers.
pub const MAX_PEERS: usize = 64;

/// Ban duration for protocol violations.
pub const BAN_SECS: u64 = 600;

pub fn current_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub endpoint: String,
    pub best_block: BlockNumber,
    pub best_block_hash: BlockHash,
    pub last_seen_unix: u64,
    pub ban_until_unix: Option<u64>,
    pub failures: u32,
    pub backoff_secs: u64,
    pub next_retry_unix: Option<u64>,
    /// Duplicate frames received, feeds gossip tier demotion.
    pub duplicates: u64,
    /// Smoothed ping round-trip.
    pub latency_ms: u64,
}

impl PeerRecord {
    pub fn new(peer_id: String, endpoint: String) -> Self {
        Self {
            peer_id,
            endpoint,
            best_block: 0,
            best_block_hash: [0u8; 32],
            last_seen_unix: current_unix(),
            ban_until_unix: None,
            failures: 0,
            backoff_secs: 0,
            next_retry_unix: None,
            duplicates: 0,
            latency_ms: 0,
        }
    }

    /// Exponential backoff with jitter before the next connect attempt.
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.backoff_secs = match self.failures {
            0..=1 => 5,
            2 => 10,
            3 => 20,
            4 => 40,
            5 => 80,
            6 => 160,
            _ => 300,
        };
        let jitter = (current_unix() % (self.backoff_secs / 4 + 1)).max(1);
        self.next_retry_unix = Some(current_unix() + self.backoff_secs + jitter);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.backoff_secs = 0;
        self.next_retry_unix = None;
        self.last_seen_unix = current_unix();
    }

    pub fn ready_for_retry(&self, now_unix: u64) -> bool {
        self.next_retry_unix.map_or(true, |t| now_unix >= t)
    }

    pub fn is_banned(&self, now_unix: u64) -> bool {
        self.ban_until_unix.map_or(false, |t| now_unix < t)
    }

    pub fn note_latency(&mut self, sample_ms: u64) {
        // EWMA, 1/4 weight on the new sample
        self.latency_ms = if self.latency_ms == 0 {
            sample_ms
        } else {
            (self.latency_ms * 3 + sample_ms) / 4
        };
    }
}

pub struct PeerManager {
    local_peer_id: String,
    peers: HashMap<String, PeerRecord>,
}

impl PeerManager {
    pub fn new(local_peer_id: String) -> Self {
        Self {
            local_peer_id,
            peers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Insert or refresh a record after a completed handshake. Refuses new
    /// peers past the cap and anyone currently banned.
    pub fn register(
        &mut self,
        peer_id: &str,
        endpoint: &str,
        best_block: BlockNumber,
        best_block_hash: BlockHash,
    ) -> bool {
        let now = current_unix();
        if let Some(existing) = self.peers.get_mut(peer_id) {
            if existing.is_banned(now) {
                return false;
            }
            existing.endpoint = endpoint.to_string();
            existing.best_block = best_block;
            existing.best_block_hash = best_block_hash;
            existing.record_success();
            return true;
        }
        if self.peers.len() >= MAX_PEERS {
            tracing::warn!("peer table full, refusing {}", peer_id);
            return false;
        }
        let mut record = PeerRecord::new(peer_id.to_string(), endpoint.to_string());
        record.best_block = best_block;
        record.best_block_hash = best_block_hash;
        self.peers.insert(peer_id.to_string(), record);
        true
    }

    pub fn note_best_block(&mut self, peer_id: &str, number: BlockNumber, hash: BlockHash) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if number > peer.best_block {
                peer.best_block = number;
                peer.best_block_hash = hash;
            }
            peer.last_seen_unix = current_unix();
        }
    }

    pub fn ban(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.ban_until_unix = Some(current_unix() + BAN_SECS);
            tracing::warn!("peer {} banned for {}s", peer_id, BAN_SECS);
        }
    }

    pub fn is_banned(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .map_or(false, |p| p.is_banned(current_unix()))
    }

    /// Best peer to sync from: the highest advertised block among peers
    /// that are neither banned nor backing off.
    pub fn best_sync_peer(&self) -> Option<&PeerRecord> {
        let now = current_unix();
        self.peers
            .values()
            .filter(|p| !p.is_banned(now))
            .max_by_key(|p| (p.best_block, std::cmp::Reverse(p.peer_id.clone())))
    }

    /// Simultaneous-connect rule: of the two crossing connections, the one
    /// initiated by the smaller peer id survives. Returns true if OUR
    /// connection (initiated = we dialled) should be kept.
    pub fn keep_connection(&self, remote_peer_id: &str, we_initiated: bool) -> bool {
        (self.local_peer_id.as_str() < remote_peer_id) == we_initiated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_rule_is_symmetric() {
        let a = PeerManager::new("aaaa".into());
        let b = PeerManager::new("bbbb".into());
        // exactly one direction survives
        assert!(a.keep_connection("bbbb", true));
        assert!(!a.keep_connection("bbbb", false));
        assert!(!b.keep_connection("aaaa", true));
        assert!(b.keep_connection("aaaa", false));
    }

    #[test]
    fn backoff_grows_and_resets() {
        let mut record = PeerRecord::new("p".into(), "127.0.0.1:1".into());
        record.record_failure();
        let first = record.backoff_secs;
        record.record_failure();
        record.record_failure();
        assert!(record.backoff_secs > first);
        assert!(!record.ready_for_retry(current_unix()));
        record.record_success();
        assert!(record.ready_for_retry(current_unix()));
    }

    #[test]
    fn banned_peer_is_not_a_sync_candidate() {
        let mut mgr = PeerManager::new("me".into());
        mgr.register("p1", "e1", 10, [1u8; 32]);
        mgr.register("p2", "e2", 47, [2u8; 32]);
        assert_eq!(mgr.best_sync_peer().unwrap().peer_id, "p2");
        mgr.ban("p2");
        assert_eq!(mgr.best_sync_peer().unwrap().peer_id, "p1");
    }
}
