/*
    core_crypto - Signing, sealing, encryption and hashing

    The leaf of the dependency graph. Everything above talks to a
    `CryptoProvider` and only ever sees the prefixed string forms of keys,
    signatures and ciphertexts.
*/

mod encoding;
pub mod errors;
pub mod hash;
pub mod keys;
pub mod provider;

pub use errors::{CryptoError, CryptoResult};
pub use hash::{secure_hash, short_hash, short_hash_bytes, SessionHasher};
pub use keys::{
    AgentId, AgentSecret, Encrypted, Hash, KeyId, KeySecret, Sealed, SealerId, SealerSecret,
    ShortHash, Signature, SignerId, SignerSecret,
};
pub use provider::{CryptoProvider, PureCrypto};

pub(crate) use encoding::random_base58;
