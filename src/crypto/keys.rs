// src/crypto/keys.rs
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use signature::{Signer, Verifier};
use zeroize::Zeroize;

use crate::block::Address;

/// Verify a signature over `msg` using `pubkey` (32 bytes) and signature
/// bytes. Returns `true` if the signature verifies.
pub fn verify_bytes(pubkey: &[u8], msg: &[u8], sig_bytes: &[u8]) -> bool {
    if pubkey.len() != 32 || sig_bytes.len() != 64 {
        return false;
    }
    let vk = match <&[u8; 32]>::try_from(pubkey) {
        Ok(arr) => match VerifyingKey::from_bytes(arr) {
            Ok(v) => v,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    let sig = match <&[u8; 64]>::try_from(sig_bytes) {
        Ok(arr) => Signature::from_bytes(arr),
        Err(_) => return false,
    };
    vk.verify(msg, &sig).is_ok()
}

/// Sign `msg` with a 32-byte secret seed. Returns None for an invalid seed.
pub fn sign_bytes(secret_seed: &[u8], msg: &[u8]) -> Option<Vec<u8>> {
    if secret_seed.len() != 32 {
        return None;
    }
    let sk = match <&[u8; 32]>::try_from(secret_seed) {
        Ok(arr) => SigningKey::from_bytes(arr),
        Err(_) => return None,
    };
    let sig: Signature = sk.sign(msg);
    Some(sig.to_bytes().to_vec())
}

/// Derive verifying (public) key bytes from a 32-byte seed.
pub fn public_from_seed(seed: &[u8]) -> Option<Vec<u8>> {
    if seed.len() != 32 {
        return None;
    }
    let sk = match <&[u8; 32]>::try_from(seed) {
        Ok(arr) => SigningKey::from_bytes(arr),
        Err(_) => return None,
    };
    Some(VerifyingKey::from(&sk).to_bytes().to_vec())
}

/// On-chain address: last 20 bytes of SHA-256 of the public key.
pub fn address_from_public(pubkey: &[u8]) -> Address {
    let digest = Sha256::digest(pubkey);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..32]);
    addr
}

/// Validator signing seed. The raw bytes are wiped when the owner drops it.
#[derive(Clone)]
pub struct SecretSeed {
    bytes: [u8; 32],
}

impl SecretSeed {
    /// Parse and vet a hex seed. Rejects wrong length, non-hex, all-zero
    /// and repeating-byte seeds (weak-entropy patterns).
    pub fn from_hex(hex_seed: &str) -> Result<Self, SeedError> {
        let decoded = hex::decode(hex_seed.trim()).map_err(|_| SeedError::NotHex)?;
        if decoded.len() != 32 {
            return Err(SeedError::BadLength(decoded.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        if bytes.iter().all(|&b| b == 0) {
            return Err(SeedError::AllZero);
        }
        if bytes.iter().all(|&b| b == bytes[0]) {
            return Err(SeedError::RepeatingPattern);
        }
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        // seed length is validated at construction, sign_bytes cannot fail
        sign_bytes(&self.bytes, msg).unwrap_or_default()
    }

    pub fn public(&self) -> Vec<u8> {
        public_from_seed(&self.bytes).unwrap_or_default()
    }

    pub fn address(&self) -> Address {
        address_from_public(&self.public())
    }
}

impl Drop for SecretSeed {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        write!(f, "SecretSeed(..)")
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SeedError {
    #[error("validator key is not valid hex")]
    NotHex,
    #[error("validator key must be 32 bytes, got {0}")]
    BadLength(usize),
    #[error("validator key is all zeros")]
    AllZero,
    #[error("validator key uses a repeating byte pattern")]
    RepeatingPattern,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let seed = [7u8; 32];
        let pk = public_from_seed(&seed).unwrap();
        let sig = sign_bytes(&seed, b"hello").unwrap();
        assert!(verify_bytes(&pk, b"hello", &sig));
        assert!(!verify_bytes(&pk, b"other", &sig));
    }

    #[test]
    fn seed_rejects_weak_patterns() {
        assert_eq!(
            SecretSeed::from_hex(&"00".repeat(32)).unwrap_err(),
            SeedError::AllZero
        );
        assert_eq!(
            SecretSeed::from_hex(&"ab".repeat(32)).unwrap_err(),
            SeedError::RepeatingPattern
        );
        assert!(matches!(
            SecretSeed::from_hex("abcd").unwrap_err(),
            SeedError::BadLength(2)
        ));
        assert!(SecretSeed::from_hex(&hex::encode((0u8..32).collect::<Vec<_>>())).is_ok());
    }
}
