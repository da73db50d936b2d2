//! Crypto provider trait and the default pure-Rust implementation
//!
//! Signatures use Ed25519, sealing uses X25519 + HKDF-SHA256 + ChaCha20-Poly1305,
//! symmetric encryption uses ChaCha20-Poly1305 with nonces derived from the
//! caller's nonce material (CoValue id + transaction id), so the same plaintext
//! never reuses a nonce under the same key.

use super::encoding::{decode_u, decode_z_32, encode_u, encode_z, random_base58};
use super::errors::{CryptoError, CryptoResult};
use super::hash::{nonce_from_material, secure_hash, short_hash};
use super::keys::{
    AgentId, AgentSecret, Encrypted, Hash, KeyId, KeySecret, Sealed, SealerId, SealerSecret,
    ShortHash, Signature, SignerId, SignerSecret,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Domain separation salt for sealing keys
const SEAL_SALT: &[u8] = b"cojson seal v1";

/// HKDF info for sealing keys
const SEAL_INFO: &[u8] = b"cojson sealing key";

/// Pluggable crypto surface used by every other component.
///
/// Stateless apart from the key material passed in.
pub trait CryptoProvider: Send + Sync + std::fmt::Debug {
    fn new_signer_secret(&self) -> SignerSecret;
    fn signer_id(&self, secret: &SignerSecret) -> CryptoResult<SignerId>;
    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> CryptoResult<Signature>;
    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> CryptoResult<bool>;

    fn new_sealer_secret(&self) -> SealerSecret;
    fn sealer_id(&self, secret: &SealerSecret) -> CryptoResult<SealerId>;
    fn seal(
        &self,
        message: &[u8],
        from: &SealerSecret,
        to: &SealerId,
        nonce_material: &[u8],
    ) -> CryptoResult<Sealed>;
    fn unseal(
        &self,
        sealed: &Sealed,
        to: &SealerSecret,
        from: &SealerId,
        nonce_material: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    fn new_key_secret(&self) -> (KeyId, KeySecret);
    fn encrypt(&self, plaintext: &[u8], key: &KeySecret, nonce_material: &[u8]) -> CryptoResult<Encrypted>;
    fn decrypt(&self, ciphertext: &Encrypted, key: &KeySecret, nonce_material: &[u8]) -> CryptoResult<Vec<u8>>;

    fn secure_hash(&self, bytes: &[u8]) -> Hash {
        secure_hash(bytes)
    }

    fn short_hash(&self, bytes: &[u8]) -> ShortHash {
        short_hash(bytes)
    }

    fn new_agent_secret(&self) -> AgentSecret {
        AgentSecret::from_parts(self.new_sealer_secret(), self.new_signer_secret())
    }

    fn agent_id(&self, secret: &AgentSecret) -> CryptoResult<AgentId> {
        let sealer = self.sealer_id(secret.sealer_secret())?;
        let signer = self.signer_id(secret.signer_secret())?;
        Ok(AgentId::from_parts(&sealer, &signer))
    }

    /// Random suffix for session ids and uniqueness values
    fn random_suffix(&self) -> String {
        random_base58(12)
    }

    /// Sealer secret derived from a read key, so every reader holds it
    fn group_sealer_secret(&self, read_key: &KeySecret) -> CryptoResult<SealerSecret> {
        let mut material = decode_z_32("key secret", "keySecret", read_key.expose())?;
        let mut derived = blake3::derive_key("cojson group sealer v1", &material);
        let secret = SealerSecret::from_raw(encode_z("sealerSecret", &derived));
        material.zeroize();
        derived.zeroize();
        Ok(secret)
    }
}

/// Default provider backed by dalek, chacha20poly1305 and blake3
#[derive(Debug, Default, Clone, Copy)]
pub struct PureCrypto;

impl PureCrypto {
    pub fn new() -> Self {
        Self
    }

    fn signing_key(secret: &SignerSecret) -> CryptoResult<SigningKey> {
        let mut seed = decode_z_32("signer secret", "signerSecret", secret.expose())?;
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(key)
    }

    fn static_secret(secret: &SealerSecret) -> CryptoResult<StaticSecret> {
        let bytes = decode_z_32("sealer secret", "sealerSecret", secret.expose())?;
        Ok(StaticSecret::from(bytes))
    }

    fn sealing_cipher(
        secret: &SealerSecret,
        public: &SealerId,
    ) -> CryptoResult<ChaCha20Poly1305> {
        let secret = Self::static_secret(secret)?;
        let public = X25519PublicKey::from(decode_z_32("sealer id", "sealer", public.as_str())?);
        let shared = secret.diffie_hellman(&public);

        let hk = Hkdf::<Sha256>::new(Some(SEAL_SALT), shared.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(SEAL_INFO, &mut key)
            .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Ok(cipher)
    }

    fn symmetric_cipher(key: &KeySecret) -> CryptoResult<ChaCha20Poly1305> {
        let mut bytes = decode_z_32("key secret", "keySecret", key.expose())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&bytes));
        bytes.zeroize();
        Ok(cipher)
    }
}

impl CryptoProvider for PureCrypto {
    fn new_signer_secret(&self) -> SignerSecret {
        let mut seed: [u8; 32] = rand::random();
        let secret = SignerSecret::from_raw(encode_z("signerSecret", &seed));
        seed.zeroize();
        secret
    }

    fn signer_id(&self, secret: &SignerSecret) -> CryptoResult<SignerId> {
        let key = Self::signing_key(secret)?;
        Ok(SignerId::from_raw(encode_z("signer", key.verifying_key().as_bytes())))
    }

    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> CryptoResult<Signature> {
        let key = Self::signing_key(secret)?;
        let signature = key.sign(message);
        Ok(Signature::from_raw(encode_z("signature", &signature.to_bytes())))
    }

    fn verify(&self, signer: &SignerId, message: &[u8], signature: &Signature) -> CryptoResult<bool> {
        let public = decode_z_32("signer id", "signer", signer.as_str())?;
        let verifying_key = VerifyingKey::from_bytes(&public)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid Ed25519 public key: {}", e)))?;

        let sig_bytes = super::encoding::decode_z("signature", "signature", signature.as_str())?;
        let signature = match ed25519_dalek::Signature::from_slice(&sig_bytes) {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        };

        Ok(verifying_key.verify(message, &signature).is_ok())
    }

    fn new_sealer_secret(&self) -> SealerSecret {
        let mut bytes: [u8; 32] = rand::random();
        let secret = SealerSecret::from_raw(encode_z("sealerSecret", &bytes));
        bytes.zeroize();
        secret
    }

    fn sealer_id(&self, secret: &SealerSecret) -> CryptoResult<SealerId> {
        let secret = Self::static_secret(secret)?;
        let public = X25519PublicKey::from(&secret);
        Ok(SealerId::from_raw(encode_z("sealer", public.as_bytes())))
    }

    fn seal(
        &self,
        message: &[u8],
        from: &SealerSecret,
        to: &SealerId,
        nonce_material: &[u8],
    ) -> CryptoResult<Sealed> {
        let cipher = Self::sealing_cipher(from, to)?;
        let nonce = nonce_from_material(nonce_material);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), message)
            .map_err(|_| CryptoError::Encryption)?;
        Ok(Sealed::from_raw(encode_u("sealed", &ciphertext)))
    }

    fn unseal(
        &self,
        sealed: &Sealed,
        to: &SealerSecret,
        from: &SealerId,
        nonce_material: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let cipher = Self::sealing_cipher(to, from)?;
        let nonce = nonce_from_material(nonce_material);
        let ciphertext = decode_u("sealed ciphertext", "sealed", sealed.as_str())?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Decryption)
    }

    fn new_key_secret(&self) -> (KeyId, KeySecret) {
        let mut bytes: [u8; 32] = rand::random();
        let secret = KeySecret::from_raw(encode_z("keySecret", &bytes));
        bytes.zeroize();
        let id = KeyId::from_raw(format!("key_z{}", random_base58(12)));
        (id, secret)
    }

    fn encrypt(&self, plaintext: &[u8], key: &KeySecret, nonce_material: &[u8]) -> CryptoResult<Encrypted> {
        let cipher = Self::symmetric_cipher(key)?;
        let nonce = nonce_from_material(nonce_material);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;
        Ok(Encrypted::from_raw(encode_u("encrypted", &ciphertext)))
    }

    fn decrypt(&self, ciphertext: &Encrypted, key: &KeySecret, nonce_material: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = Self::symmetric_cipher(key)?;
        let nonce = nonce_from_material(nonce_material);
        let bytes = decode_u("ciphertext", "encrypted", ciphertext.as_str())?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), bytes.as_slice())
            .map_err(|_| CryptoError::Decryption)
    }
}
