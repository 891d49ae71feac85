//! Content hashing for compiled instruction sequences.
//!
//! The hash is a deterministic rolling product over the serialized bytes,
//! meant for identity and cache-key comparisons only. It is not a security
//! property.

use serde::{Deserialize, Serialize};

const HASH_FACTOR: u32 = 65599;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub u32);

impl ContentHash {
    pub fn to_hex(&self) -> String {
        format!("{:08x}", self.0)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hash: u32 = 0;
    for &b in bytes {
        hash = hash.wrapping_mul(HASH_FACTOR).wrapping_add(u32::from(b));
    }
    ContentHash(hash)
}
