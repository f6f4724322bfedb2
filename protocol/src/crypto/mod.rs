//! # Cryptographic Primitives
//!
//! Thin wrappers over audited implementations: Ed25519 node identities
//! (ed25519-dalek), SHA-256 for signed digests, BLAKE3 for local ids.
//! Nothing here touches Monero key material.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, blake3_parts, sha256, sha256_hex};
pub use keys::{KeyError, NodeKeypair, PublicKey, Signature};
