// src/network/mod.rs
// TCP transport: listener, dialer, per-peer read/write tasks. Inbound
// messages are delivered to the coordinator through one channel per
// connection; all protocol decisions happen there.

pub mod gossip;
pub mod handshake;
pub mod peer;
pub mod wire;

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::block::{BlockHash, BlockNumber};
use handshake::{LocalIdentity, PeerIdentity};
use wire::{Message, MAX_FRAME_SIZE};

/// Outbound queue depth per connection; a slow peer loses frames rather
/// than stalling the coordinator.
pub const PEER_SEND_QUEUE: usize = 256;

/// Reconnect cadence for statically configured peers.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);

type HmacSha256 = Hmac<Sha256>;

/// Everything the coordinator hears from the transport.
#[derive(Debug)]
pub enum NodeEvent {
    PeerConnected {
        identity: PeerIdentity,
        endpoint: String,
    },
    PeerMessage {
        peer_id: String,
        /// Raw frame payload, used for gossip dedup ids.
        raw: Vec<u8>,
        msg: Message,
    },
    PeerDisconnected {
        peer_id: String,
    },
}

/// Chain tip snapshot advertised in handshakes; the coordinator updates it
/// on every commit.
#[derive(Clone)]
pub struct TipHandle {
    inner: Arc<RwLock<(BlockNumber, BlockHash)>>,
}

impl TipHandle {
    pub fn new(number: BlockNumber, hash: BlockHash) -> Self {
        Self {
            inner: Arc::new(RwLock::new((number, hash))),
        }
    }

    pub fn get(&self) -> (BlockNumber, BlockHash) {
        *self.inner.read()
    }

    pub fn set(&self, number: BlockNumber, hash: BlockHash) {
        *self.inner.write() = (number, hash);
    }
}

struct ConnectionEntry {
    sender: mpsc::Sender<Message>,
    endpoint: String,
}

/// Live connections keyed by peer id; at most one per peer.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.inner.read().contains_key(peer_id)
    }

    pub fn endpoint_connected(&self, endpoint: &str) -> bool {
        self.inner.read().values().any(|e| e.endpoint == endpoint)
    }

    /// Queue a frame for a peer. Frames to a full queue are dropped; gossip
    /// redundancy covers the loss.
    pub fn send(&self, peer_id: &str, msg: Message) -> bool {
        let guard = self.inner.read();
        match guard.get(peer_id) {
            Some(entry) => entry.sender.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Install a connection, resolving simultaneous-connect collisions: the
    /// connection initiated by the smaller peer id wins. Returns false if
    /// this connection lost and must be closed.
    fn insert_resolving(
        &self,
        local_peer_id: &str,
        peer_id: &str,
        sender: mpsc::Sender<Message>,
        endpoint: String,
        we_initiated: bool,
    ) -> bool {
        let mut guard = self.inner.write();
        if guard.contains_key(peer_id) {
            let keep_new = (local_peer_id < peer_id) == we_initiated;
            if !keep_new {
                tracing::debug!("duplicate connection to {} loses, closing", peer_id);
                return false;
            }
        }
        guard.insert(peer_id.to_string(), ConnectionEntry { sender, endpoint });
        true
    }

    /// Remove only if the entry still belongs to this task's sender.
    fn remove_if_same(&self, peer_id: &str, sender: &mpsc::Sender<Message>) {
        let mut guard = self.inner.write();
        if let Some(entry) = guard.get(peer_id) {
            if entry.sender.same_channel(sender) {
                guard.remove(peer_id);
            }
        }
    }
}

/// Shared transport state handed to every connection task.
pub struct Network {
    pub local: LocalIdentity,
    pub events: mpsc::Sender<NodeEvent>,
    pub connections: ConnectionTable,
    pub tip: TipHandle,
    pub shutdown: CancellationToken,
}

/// MAC-then-payload framing under the handshake-derived session key.
fn seal(key: &[u8; 32], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    let tag = mac.finalize().into_bytes();
    let mut out = Vec::with_capacity(32 + payload.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(payload);
    out
}

fn open(key: &[u8; 32], frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 32 {
        return Err(anyhow!("frame shorter than its MAC"));
    }
    let (tag, payload) = frame.split_at(32);
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    mac.verify_slice(tag).map_err(|_| anyhow!("bad frame MAC"))?;
    Ok(payload.to_vec())
}

fn framed_with_cap(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(MAX_FRAME_SIZE);
    Framed::new(stream, codec)
}

/// Accept loop. Each inbound socket gets its own handshake + session task.
pub async fn run_listener(net: Arc<Network>, port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("p2p listening on port {}", port);
    loop {
        tokio::select! {
            _ = net.shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let net = net.clone();
                tokio::spawn(async move {
                    let endpoint = addr.to_string();
                    let mut framed = framed_with_cap(stream);
                    let best = net.tip.get();
                    match handshake::respond(&mut framed, &net.local, best).await {
                        Ok(identity) => {
                            run_session(net, framed, identity, endpoint, false).await;
                        }
                        Err(e) => {
                            tracing::debug!("inbound handshake from {} failed: {}", endpoint, e);
                        }
                    }
                });
            }
        }
    }
}

/// Dial one peer and run the session until it ends.
pub async fn connect_peer(net: Arc<Network>, addr: String) -> Result<()> {
    let stream = TcpStream::connect(&addr).await?;
    let mut framed = framed_with_cap(stream);
    let best = net.tip.get();
    let identity = handshake::initiate(&mut framed, &net.local, best).await?;
    run_session(net, framed, identity, addr, true).await;
    Ok(())
}

/// Keep dialling the statically configured peers that are not connected.
pub async fn maintain_static_peers(net: Arc<Network>, addrs: Vec<String>) {
    loop {
        for addr in &addrs {
            if net.connections.endpoint_connected(addr) {
                continue;
            }
            let net = net.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                if let Err(e) = connect_peer(net, addr.clone()).await {
                    tracing::debug!("dial {} failed: {}", addr, e);
                }
            });
        }
        tokio::select! {
            _ = net.shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
        }
    }
}

/// Post-handshake session: writer drains the outbound queue, reader pushes
/// authenticated frames into the coordinator channel.
async fn run_session(
    net: Arc<Network>,
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    identity: PeerIdentity,
    endpoint: String,
    we_initiated: bool,
) {
    let peer_id = identity.peer_id.clone();
    let session_key = identity.session_key;
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(PEER_SEND_QUEUE);

    if !net.connections.insert_resolving(
        &net.local.peer_id,
        &peer_id,
        outbound_tx.clone(),
        endpoint.clone(),
        we_initiated,
    ) {
        return; // lost the simultaneous-connect race
    }

    if net
        .events
        .send(NodeEvent::PeerConnected {
            identity: identity.clone(),
            endpoint: endpoint.clone(),
        })
        .await
        .is_err()
    {
        return; // coordinator is gone, we are shutting down
    }

    let (mut sink, mut stream) = framed.split();
    let write_key = session_key;
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let sealed = seal(&write_key, &msg.encode());
            if sink.send(sealed.into()).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = net.shutdown.cancelled() => break,
            frame = stream.next() => {
                let Some(Ok(frame)) = frame else { break };
                let payload = match open(&session_key, &frame) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("peer {}: {}", peer_id, e);
                        break;
                    }
                };
                let msg = match Message::decode(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("peer {}: undecodable frame: {}", peer_id, e);
                        continue; // one bad frame is not a session failure
                    }
                };
                if net
                    .events
                    .send(NodeEvent::PeerMessage {
                        peer_id: peer_id.clone(),
                        raw: payload,
                        msg,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    writer.abort();
    net.connections.remove_if_same(&peer_id, &outbound_tx);
    let _ = net
        .events
        .send(NodeEvent::PeerDisconnected { peer_id })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"payload");
        assert_eq!(open(&key, &sealed).unwrap(), b"payload");
    }

    #[test]
    fn open_rejects_wrong_key_and_tampering() {
        let key = [7u8; 32];
        let other = [8u8; 32];
        let mut sealed = seal(&key, b"payload");
        assert!(open(&other, &sealed).is_err());
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(open(&key, &sealed).is_err());
        assert!(open(&key, &[0u8; 5]).is_err());
    }

    #[test]
    fn connection_table_send_and_collision() {
        let table = ConnectionTable::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        assert!(table.insert_resolving("aa", "bb", tx1.clone(), "e1".into(), true));
        assert!(table.send("bb", Message::Ping(1)));
        assert!(matches!(rx1.try_recv(), Ok(Message::Ping(1))));

        // crossing connection from the same peer: "aa" < "bb", so the one
        // we initiated wins and the inbound one must be dropped
        let (tx2, _rx2) = mpsc::channel(4);
        assert!(!table.insert_resolving("aa", "bb", tx2, "e2".into(), false));

        table.remove_if_same("bb", &tx1);
        assert!(!table.is_connected("bb"));
    }
}
