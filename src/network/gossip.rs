// src/network/gossip.rs
// Two-tier gossip mesh: eager peers get full payloads, lazy peers get
// IHave announcements and pull what they miss with IWant. Promotion and
// demotion are periodic, driven by observed latency and duplicate rate.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;

use crate::network::peer::PeerManager;
use crate::network::wire::Message;

/// Recent message ids remembered for dedup.
pub const GOSSIP_DEDUP_CAPACITY: usize = 4096;

/// Payloads cached for serving IWant pulls.
pub const GOSSIP_PAYLOAD_CACHE: usize = 512;

/// How many eager peers the mesh aims for.
pub const EAGER_TARGET: usize = 8;

/// Demote an eager peer whose duplicate share exceeds this percentage.
const DEMOTE_DUPLICATE_PCT: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Eager,
    Lazy,
}

/// A directed frame the coordinator should put on the wire.
#[derive(Debug, Clone)]
pub struct GossipSend {
    pub peer_id: String,
    pub message: Message,
}

struct PeerMeshState {
    tier: Tier,
    /// Frames received from this peer since the last rebalance.
    received: u64,
    duplicates: u64,
}

pub struct GossipLayer {
    mesh: HashMap<String, PeerMeshState>,
    recent: LruCache<[u8; 32], ()>,
    payloads: LruCache<[u8; 32], Message>,
}

impl GossipLayer {
    pub fn new() -> Self {
        Self {
            mesh: HashMap::new(),
            recent: LruCache::new(NonZeroUsize::new(GOSSIP_DEDUP_CAPACITY).unwrap()),
            payloads: LruCache::new(NonZeroUsize::new(GOSSIP_PAYLOAD_CACHE).unwrap()),
        }
    }

    pub fn add_peer(&mut self, peer_id: &str) {
        let eager_count = self.eager_count();
        self.mesh.entry(peer_id.to_string()).or_insert(PeerMeshState {
            tier: if eager_count < EAGER_TARGET {
                Tier::Eager
            } else {
                Tier::Lazy
            },
            received: 0,
            duplicates: 0,
        });
    }

    pub fn remove_peer(&mut self, peer_id: &str) {
        self.mesh.remove(peer_id);
    }

    pub fn tier_of(&self, peer_id: &str) -> Option<Tier> {
        self.mesh.get(peer_id).map(|s| s.tier)
    }

    fn eager_count(&self) -> usize {
        self.mesh.values().filter(|s| s.tier == Tier::Eager).count()
    }

    /// Serialise once, push to eager peers, announce to lazy peers.
    /// `except` suppresses the echo back to the message's origin.
    pub fn broadcast(&mut self, message: &Message, except: Option<&str>) -> Vec<GossipSend> {
        let bytes = message.encode();
        let id = Message::id_of(&bytes);
        self.recent.put(id, ());
        self.payloads.put(id, message.clone());

        let mut sends = Vec::new();
        let mut lazy_targets = Vec::new();
        for (peer_id, state) in &self.mesh {
            if Some(peer_id.as_str()) == except {
                continue;
            }
            match state.tier {
                Tier::Eager => sends.push(GossipSend {
                    peer_id: peer_id.clone(),
                    message: message.clone(),
                }),
                Tier::Lazy => lazy_targets.push(peer_id.clone()),
            }
        }
        for peer_id in lazy_targets {
            sends.push(GossipSend {
                peer_id,
                message: Message::IHave { ids: vec![id] },
            });
        }
        sends
    }

    /// Dedup at the boundary. Returns false (and counts the duplicate) if
    /// the payload was already seen.
    pub fn observe_inbound(&mut self, peer_id: &str, bytes: &[u8]) -> bool {
        let id = Message::id_of(bytes);
        let state = self.mesh.get_mut(peer_id);
        if let Some(state) = state {
            state.received += 1;
        }
        if self.recent.contains(&id) {
            if let Some(state) = self.mesh.get_mut(peer_id) {
                state.duplicates += 1;
            }
            return false;
        }
        self.recent.put(id, ());
        true
    }

    /// Cache a forwardable payload so lazy pulls can be served later.
    pub fn cache_payload(&mut self, bytes: &[u8], message: &Message) {
        self.payloads.put(Message::id_of(bytes), message.clone());
    }

    pub fn handle_ihave(&mut self, peer_id: &str, ids: &[[u8; 32]]) -> Option<GossipSend> {
        let missing: Vec<[u8; 32]> = ids
            .iter()
            .filter(|id| !self.recent.contains(*id))
            .copied()
            .collect();
        if missing.is_empty() {
            return None;
        }
        Some(GossipSend {
            peer_id: peer_id.to_string(),
            message: Message::IWant { ids: missing },
        })
    }

    pub fn handle_iwant(&mut self, peer_id: &str, ids: &[[u8; 32]]) -> Vec<GossipSend> {
        ids.iter()
            .filter_map(|id| self.payloads.get(id).cloned())
            .map(|message| GossipSend {
                peer_id: peer_id.to_string(),
                message,
            })
            .collect()
    }

    pub fn handle_graft(&mut self, peer_id: &str) {
        if let Some(state) = self.mesh.get_mut(peer_id) {
            state.tier = Tier::Eager;
        }
    }

    pub fn handle_prune(&mut self, peer_id: &str) {
        if let Some(state) = self.mesh.get_mut(peer_id) {
            state.tier = Tier::Lazy;
        }
    }

    /// Periodic tier maintenance. Demotes noisy eager peers, promotes the
    /// lowest-latency lazy peers until the eager target is met. Returns the
    /// Graft/Prune control frames to send.
    pub fn rebalance(&mut self, peers: &PeerManager) -> Vec<GossipSend> {
        let mut sends = Vec::new();

        // demote high-duplicate eager peers
        let mut demote = Vec::new();
        for (peer_id, state) in &self.mesh {
            if state.tier == Tier::Eager
                && state.received >= 20
                && state.duplicates * 100 > state.received * DEMOTE_DUPLICATE_PCT
            {
                demote.push(peer_id.clone());
            }
        }
        for peer_id in demote {
            if let Some(state) = self.mesh.get_mut(&peer_id) {
                state.tier = Tier::Lazy;
            }
            sends.push(GossipSend {
                peer_id,
                message: Message::Prune,
            });
        }

        // promote by latency until the target is met
        let mut deficit = EAGER_TARGET.saturating_sub(self.eager_count());
        if deficit > 0 {
            let mut candidates: Vec<(u64, String)> = self
                .mesh
                .iter()
                .filter(|(_, s)| s.tier == Tier::Lazy)
                .map(|(id, _)| {
                    let latency = peers.get(id).map(|p| p.latency_ms).unwrap_or(u64::MAX);
                    (latency, id.clone())
                })
                .collect();
            candidates.sort();
            for (_, peer_id) in candidates {
                if deficit == 0 {
                    break;
                }
                if let Some(state) = self.mesh.get_mut(&peer_id) {
                    state.tier = Tier::Eager;
                }
                sends.push(GossipSend {
                    peer_id,
                    message: Message::Graft,
                });
                deficit -= 1;
            }
        }

        // window reset
        for state in self.mesh.values_mut() {
            state.received = 0;
            state.duplicates = 0;
        }
        sends
    }
}

impl Default for GossipLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_with(n_eager_then_lazy: usize) -> GossipLayer {
        let mut layer = GossipLayer::new();
        for i in 0..n_eager_then_lazy {
            layer.add_peer(&format!("p{}", i));
        }
        layer
    }

    #[test]
    fn broadcast_splits_eager_and_lazy() {
        let mut layer = layer_with(EAGER_TARGET + 2);
        let sends = layer.broadcast(&Message::Ping(1), None);
        let full = sends
            .iter()
            .filter(|s| matches!(s.message, Message::Ping(_)))
            .count();
        let ihave = sends
            .iter()
            .filter(|s| matches!(s.message, Message::IHave { .. }))
            .count();
        assert_eq!(full, EAGER_TARGET);
        assert_eq!(ihave, 2);
    }

    #[test]
    fn inbound_dedup_counts_duplicates() {
        let mut layer = layer_with(2);
        let bytes = Message::Ping(7).encode();
        assert!(layer.observe_inbound("p0", &bytes));
        assert!(!layer.observe_inbound("p1", &bytes));
        assert_eq!(layer.mesh["p1"].duplicates, 1);
    }

    #[test]
    fn ihave_pulls_only_missing() {
        let mut layer = layer_with(2);
        let known = Message::id_of(&Message::Ping(1).encode());
        layer.recent.put(known, ());
        let unknown = [9u8; 32];
        let send = layer.handle_ihave("p0", &[known, unknown]).unwrap();
        match send.message {
            Message::IWant { ids } => assert_eq!(ids, vec![unknown]),
            other => panic!("expected IWant, got {:?}", other),
        }
        assert!(layer.handle_ihave("p0", &[known]).is_none());
    }

    #[test]
    fn iwant_serves_cached_payloads() {
        let mut layer = layer_with(1);
        let msg = Message::Ping(3);
        let bytes = msg.encode();
        layer.cache_payload(&bytes, &msg);
        let sends = layer.handle_iwant("p0", &[Message::id_of(&bytes)]);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].message, msg);
    }
}
