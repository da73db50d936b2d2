/*
    hash.rs - blake3 hashing helpers

    - secure_hash: full 32-byte hash, `hash_z…`
    - short_hash: first 19 bytes, used for content-derived CoValue ids
    - SessionHasher: running hash over a session's transactions; signatures
      are made over its current value
*/

use super::encoding::encode_z;
use super::keys::{Hash, ShortHash};

/// Number of bytes kept by `short_hash`
pub const SHORT_HASH_LENGTH: usize = 19;

pub fn secure_hash(bytes: &[u8]) -> Hash {
    Hash::from_raw(encode_z("hash", blake3::hash(bytes).as_bytes()))
}

pub fn short_hash(bytes: &[u8]) -> ShortHash {
    let hash = blake3::hash(bytes);
    ShortHash::from_raw(encode_z("shortHash", &hash.as_bytes()[..SHORT_HASH_LENGTH]))
}

/// Raw short hash bytes, for ids that carry their own prefix
pub fn short_hash_bytes(bytes: &[u8]) -> [u8; SHORT_HASH_LENGTH] {
    let hash = blake3::hash(bytes);
    let mut out = [0u8; SHORT_HASH_LENGTH];
    out.copy_from_slice(&hash.as_bytes()[..SHORT_HASH_LENGTH]);
    out
}

/// Derive a 96-bit AEAD nonce from arbitrary nonce material
pub(crate) fn nonce_from_material(material: &[u8]) -> [u8; 12] {
    let hash = blake3::hash(material);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&hash.as_bytes()[..12]);
    nonce
}

/// Running hash over the serialized transactions of one session.
///
/// Cloning is cheap and is how verification works on a candidate run of
/// transactions without touching the committed state.
#[derive(Clone, Default)]
pub struct SessionHasher {
    hasher: blake3::Hasher,
}

impl SessionHasher {
    pub fn new() -> Self {
        Self { hasher: blake3::Hasher::new() }
    }

    pub fn update(&mut self, tx_bytes: &[u8]) {
        self.hasher.update(tx_bytes);
    }

    /// Hash of everything fed so far
    pub fn current(&self) -> Hash {
        Hash::from_raw(encode_z("hash", self.hasher.finalize().as_bytes()))
    }
}

impl std::fmt::Debug for SessionHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHasher").field("current", &self.current()).finish()
    }
}
