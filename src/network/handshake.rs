// src/network/handshake.rs
// Hello exchange: both sides swap identities, check chain and genesis, and
// derive the symmetric session key from the ephemeral x25519 exchange.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::block::{BlockHash, BlockNumber};
use crate::crypto::EphemeralKex;
use crate::network::wire::{Hello, Message};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer closed during handshake")]
    Closed,
    #[error("expected hello, got another message")]
    NotHello,
    #[error("chain id mismatch: ours {ours}, theirs {theirs}")]
    ChainMismatch { ours: u32, theirs: u32 },
    #[error("genesis hash mismatch")]
    GenesisMismatch,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(String),
}

/// What the local node advertises in its Hello.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub chain_id: u32,
    pub peer_id: String,
    pub classical_pub: Vec<u8>,
    pub aggregate_pub: Vec<u8>,
    pub listen_port: u16,
    pub listen_hostname: String,
    pub genesis_hash: BlockHash,
}

/// The authenticated result of a completed handshake.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub peer_id: String,
    pub classical_pub: Vec<u8>,
    pub aggregate_pub: Vec<u8>,
    pub best_block_number: BlockNumber,
    pub best_block_hash: BlockHash,
    pub listen_port: u16,
    pub listen_hostname: String,
    pub session_key: [u8; 32],
}

fn hello_of(local: &LocalIdentity, best: (BlockNumber, BlockHash), kex: &EphemeralKex) -> Hello {
    Hello {
        chain_id: local.chain_id,
        peer_id: local.peer_id.clone(),
        classical_pub: local.classical_pub.clone(),
        aggregate_pub: local.aggregate_pub.clone(),
        listen_port: local.listen_port,
        listen_hostname: local.listen_hostname.clone(),
        best_block_number: best.0,
        best_block_hash: best.1,
        genesis_hash: local.genesis_hash,
        ephemeral_kex_pub: kex.public(),
    }
}

fn check(local: &LocalIdentity, hello: &Hello) -> Result<(), HandshakeError> {
    if hello.chain_id != local.chain_id {
        return Err(HandshakeError::ChainMismatch {
            ours: local.chain_id,
            theirs: hello.chain_id,
        });
    }
    if hello.genesis_hash != local.genesis_hash {
        return Err(HandshakeError::GenesisMismatch);
    }
    Ok(())
}

fn identity_from(hello: Hello, kex: &EphemeralKex) -> PeerIdentity {
    let session_key = kex.session_key(&hello.ephemeral_kex_pub);
    PeerIdentity {
        peer_id: hello.peer_id,
        classical_pub: hello.classical_pub,
        aggregate_pub: hello.aggregate_pub,
        best_block_number: hello.best_block_number,
        best_block_hash: hello.best_block_hash,
        listen_port: hello.listen_port,
        listen_hostname: hello.listen_hostname,
        session_key,
    }
}

async fn send_hello<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    hello: &Hello,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = Message::Hello(hello.clone()).encode();
    framed.send(bytes.into()).await?;
    Ok(())
}

async fn recv_hello<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
) -> Result<Hello, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed.next().await.ok_or(HandshakeError::Closed)??;
    match Message::decode(&frame).map_err(|e| HandshakeError::Codec(e.to_string()))? {
        Message::Hello(hello) => Ok(hello),
        _ => Err(HandshakeError::NotHello),
    }
}

/// Initiator side: send our Hello, read the echo.
pub async fn initiate<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    local: &LocalIdentity,
    best: (BlockNumber, BlockHash),
) -> Result<PeerIdentity, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let kex = EphemeralKex::generate();
    send_hello(framed, &hello_of(local, best, &kex)).await?;
    let hello = recv_hello(framed).await?;
    check(local, &hello)?;
    Ok(identity_from(hello, &kex))
}

/// Responder side: read their Hello first; only echo ours if it checks out,
/// so a wrong-chain peer learns nothing beyond the refusal.
pub async fn respond<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    local: &LocalIdentity,
    best: (BlockNumber, BlockHash),
) -> Result<PeerIdentity, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = recv_hello(framed).await?;
    check(local, &hello)?;
    let kex = EphemeralKex::generate();
    send_hello(framed, &hello_of(local, best, &kex)).await?;
    Ok(identity_from(hello, &kex))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::LengthDelimitedCodec;

    fn identity(chain_id: u32, name: &str) -> LocalIdentity {
        LocalIdentity {
            chain_id,
            peer_id: name.to_string(),
            classical_pub: vec![1u8; 32],
            aggregate_pub: vec![2u8; 32],
            listen_port: 30303,
            listen_hostname: "localhost".into(),
            genesis_hash: crate::block::genesis_hash(chain_id, "basalt"),
        }
    }

    #[tokio::test]
    async fn handshake_derives_matching_session_keys() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut framed_a = Framed::new(a, LengthDelimitedCodec::new());
        let mut framed_b = Framed::new(b, LengthDelimitedCodec::new());

        let local_a = identity(31337, "alice");
        let local_b = identity(31337, "bob");

        let (ra, rb) = tokio::join!(
            initiate(&mut framed_a, &local_a, (5, [5u8; 32])),
            respond(&mut framed_b, &local_b, (9, [9u8; 32])),
        );
        let pa = ra.unwrap();
        let pb = rb.unwrap();
        assert_eq!(pa.peer_id, "bob");
        assert_eq!(pb.peer_id, "alice");
        assert_eq!(pa.session_key, pb.session_key);
        assert_eq!(pa.best_block_number, 9);
        assert_eq!(pb.best_block_number, 5);
    }

    #[tokio::test]
    async fn chain_mismatch_aborts() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut framed_a = Framed::new(a, LengthDelimitedCodec::new());

        let local_a = identity(1, "alice");
        let local_b = identity(2, "bob");

        // responder runs in its own task so its end of the pipe closes on
        // failure and the initiator observes the abort
        let responder = tokio::spawn(async move {
            let mut framed_b = Framed::new(b, LengthDelimitedCodec::new());
            respond(&mut framed_b, &local_b, (0, [0u8; 32])).await
        });

        let ra = initiate(&mut framed_a, &local_a, (0, [0u8; 32])).await;
        let rb = responder.await.unwrap();
        assert!(matches!(rb, Err(HandshakeError::ChainMismatch { .. })));
        assert!(ra.is_err());
    }
}
