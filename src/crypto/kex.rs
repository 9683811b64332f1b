// src/crypto/kex.rs
// Ephemeral x25519 exchange for the handshake session key.

use curve25519_dalek::constants::X25519_BASEPOINT;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// One-shot Diffie-Hellman keypair. Generated per connection attempt and
/// dropped with it; the derived session key is all that survives.
pub struct EphemeralKex {
    secret: Scalar,
}

impl EphemeralKex {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self {
            secret: Scalar::from_bytes_mod_order(bytes),
        }
    }

    pub fn public(&self) -> [u8; 32] {
        (X25519_BASEPOINT * self.secret).to_bytes()
    }

    /// Both sides arrive at the same key: sha256(domain || dh(secret, peer)).
    pub fn session_key(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let shared = MontgomeryPoint(*peer_public) * self.secret;
        let mut hasher = Sha256::new();
        hasher.update(b"basalt-session-v1");
        hasher.update(shared.to_bytes());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_key() {
        let a = EphemeralKex::generate();
        let b = EphemeralKex::generate();
        assert_eq!(a.session_key(&b.public()), b.session_key(&a.public()));
    }

    #[test]
    fn different_peers_derive_different_keys() {
        let a = EphemeralKex::generate();
        let b = EphemeralKex::generate();
        let c = EphemeralKex::generate();
        assert_ne!(a.session_key(&b.public()), a.session_key(&c.public()));
    }
}
