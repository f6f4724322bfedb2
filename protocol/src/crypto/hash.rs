//! # Hashing Utilities
//!
//! Two hash functions, two jobs:
//!
//! - **SHA-256** for anything a counterparty signs: contract hashes and
//!   offer signing digests. Peers on other implementations expect it.
//! - **BLAKE3** for local identifiers: multisig address derivation in the
//!   simulated wallet, transaction ids, chat attachment digests.

use sha2::{Digest, Sha256};

/// SHA-256 as a fixed-size array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut output = [0u8; 32];
    output.copy_from_slice(&hasher.finalize());
    output
}

/// SHA-256 rendered as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 over several parts with length prefixes, so `("ab", "c")` and
/// `("a", "bc")` never collide.
pub fn blake3_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_blake3_deterministic() {
        assert_eq!(blake3_hash(b"xmrx"), blake3_hash(b"xmrx"));
        assert_ne!(blake3_hash(b"xmrx"), blake3_hash(b"xmry"));
    }

    #[test]
    fn test_blake3_parts_are_length_prefixed() {
        assert_ne!(
            blake3_parts(&[&b"ab"[..], &b"c"[..]]),
            blake3_parts(&[&b"a"[..], &b"bc"[..]])
        );
    }
}
