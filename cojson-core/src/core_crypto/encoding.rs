/*
    encoding.rs - Textual encodings for key material and ciphertexts

    Everything that crosses the wire or lands in storage is a prefixed string:
    - `<prefix>_z<base58>` for keys, ids, hashes and signatures
    - `<prefix>_U<base64url>` for ciphertexts
*/

use super::errors::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

pub(crate) fn encode_z(prefix: &str, bytes: &[u8]) -> String {
    format!("{}_z{}", prefix, bs58::encode(bytes).into_string())
}

pub(crate) fn decode_z(kind: &'static str, prefix: &str, value: &str) -> CryptoResult<Vec<u8>> {
    let payload = value
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix("_z"))
        .ok_or_else(|| CryptoError::InvalidEncoding {
            kind,
            reason: format!("expected prefix '{}_z'", prefix),
        })?;

    bs58::decode(payload)
        .into_vec()
        .map_err(|e| CryptoError::InvalidEncoding { kind, reason: e.to_string() })
}

pub(crate) fn decode_z_32(kind: &'static str, prefix: &str, value: &str) -> CryptoResult<[u8; 32]> {
    let bytes = decode_z(kind, prefix, value)?;
    bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidEncoding {
        kind,
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

pub(crate) fn encode_u(prefix: &str, bytes: &[u8]) -> String {
    format!("{}_U{}", prefix, URL_SAFE_NO_PAD.encode(bytes))
}

pub(crate) fn decode_u(kind: &'static str, prefix: &str, value: &str) -> CryptoResult<Vec<u8>> {
    let payload = value
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix("_U"))
        .ok_or_else(|| CryptoError::InvalidEncoding {
            kind,
            reason: format!("expected prefix '{}_U'", prefix),
        })?;

    URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| CryptoError::InvalidEncoding { kind, reason: e.to_string() })
}

/// Random base58 string built from `len` random bytes
pub(crate) fn random_base58(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    bs58::encode(bytes).into_string()
}
