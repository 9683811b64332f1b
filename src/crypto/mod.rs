// src/crypto/mod.rs
pub mod aggregate;
pub mod keys;
pub mod kex;

pub use aggregate::{AggregateScheme, MultiEd25519};
pub use keys::{address_from_public, public_from_seed, sign_bytes, verify_bytes, SecretSeed, SeedError};
pub use kex::EphemeralKex;
