//! Key, identity and ciphertext newtypes
//!
//! All of these are thin wrappers around their wire representation. Secrets
//! are zeroized on drop and never printed by `Debug`.

use super::errors::{CryptoError, CryptoResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

macro_rules! public_string_type {
    ($(#[$meta:meta])* $name:ident, $prefix:expr, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Wire prefix of this type
            pub const PREFIX: &'static str = $prefix;

            /// Parse from the wire representation, checking the prefix
            pub fn parse(value: impl Into<String>) -> CryptoResult<Self> {
                let value = value.into();
                if !value.starts_with(Self::PREFIX) {
                    return Err(CryptoError::InvalidEncoding {
                        kind: $kind,
                        reason: format!("expected prefix '{}'", Self::PREFIX),
                    });
                }
                Ok(Self(value))
            }

            pub(crate) fn from_raw(value: String) -> Self {
                Self(value)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CryptoError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0.clone()
            }
        }
    };
}

macro_rules! secret_string_type {
    ($(#[$meta:meta])* $name:ident, $prefix:expr, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Wire prefix of this type
            pub const PREFIX: &'static str = $prefix;

            /// Parse from the wire representation, checking the prefix
            pub fn parse(value: impl Into<String>) -> CryptoResult<Self> {
                let value = value.into();
                if !value.starts_with(Self::PREFIX) {
                    return Err(CryptoError::InvalidEncoding {
                        kind: $kind,
                        reason: format!("expected prefix '{}'", Self::PREFIX),
                    });
                }
                Ok(Self(value))
            }

            pub(crate) fn from_raw(value: String) -> Self {
                Self(value)
            }

            /// Wire representation (handle with care)
            pub fn expose(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(<redacted>)", stringify!($name))
            }
        }

        impl TryFrom<String> for $name {
            type Error = CryptoError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0.clone()
            }
        }
    };
}

public_string_type!(
    /// Ed25519 verifying key, `signer_z…`
    SignerId, "signer_z", "signer id"
);
public_string_type!(
    /// X25519 public key, `sealer_z…`
    SealerId, "sealer_z", "sealer id"
);
public_string_type!(
    /// Ed25519 signature, `signature_z…`
    Signature, "signature_z", "signature"
);
public_string_type!(
    /// Identifier of a symmetric read key, `key_z…`
    KeyId, "key_z", "key id"
);
public_string_type!(
    /// blake3 hash, `hash_z…`
    Hash, "hash_z", "hash"
);
public_string_type!(
    /// Truncated blake3 hash, `shortHash_z…`
    ShortHash, "shortHash_z", "short hash"
);
public_string_type!(
    /// Symmetric ciphertext, `encrypted_U…`
    Encrypted, "encrypted_U", "ciphertext"
);
public_string_type!(
    /// Asymmetrically sealed ciphertext, `sealed_U…`
    Sealed, "sealed_U", "sealed ciphertext"
);

secret_string_type!(
    /// Ed25519 signing key seed
    SignerSecret, "signerSecret_z", "signer secret"
);
secret_string_type!(
    /// X25519 static secret
    SealerSecret, "sealerSecret_z", "sealer secret"
);
secret_string_type!(
    /// Symmetric read key
    KeySecret, "keySecret_z", "key secret"
);

/// Public identity of an agent: `sealer_z…/signer_z…`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    pub fn from_parts(sealer: &SealerId, signer: &SignerId) -> Self {
        Self(format!("{}/{}", sealer, signer))
    }

    pub fn parse(value: impl Into<String>) -> CryptoResult<Self> {
        let value = value.into();
        let (sealer, signer) = value.split_once('/').ok_or_else(|| CryptoError::InvalidEncoding {
            kind: "agent id",
            reason: "missing '/' separator".to_string(),
        })?;
        SealerId::parse(sealer)?;
        SignerId::parse(signer)?;
        Ok(Self(value))
    }

    pub fn sealer_id(&self) -> SealerId {
        let (sealer, _) = self.0.split_once('/').unwrap_or((&self.0, ""));
        SealerId::from_raw(sealer.to_string())
    }

    pub fn signer_id(&self) -> SignerId {
        let (_, signer) = self.0.split_once('/').unwrap_or(("", &self.0));
        SignerId::from_raw(signer.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cheap syntactic check used when classifying session owners
    pub fn looks_like(value: &str) -> bool {
        value.starts_with(SealerId::PREFIX) && value.contains('/')
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentId {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AgentId> for String {
    fn from(value: AgentId) -> String {
        value.0
    }
}

/// Secret half of an agent: `sealerSecret_z…/signerSecret_z…`
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AgentSecret {
    sealer: SealerSecret,
    signer: SignerSecret,
}

impl AgentSecret {
    pub fn from_parts(sealer: SealerSecret, signer: SignerSecret) -> Self {
        Self { sealer, signer }
    }

    pub fn parse(value: &str) -> CryptoResult<Self> {
        let (sealer, signer) = value.split_once('/').ok_or_else(|| CryptoError::InvalidEncoding {
            kind: "agent secret",
            reason: "missing '/' separator".to_string(),
        })?;
        Ok(Self { sealer: SealerSecret::parse(sealer)?, signer: SignerSecret::parse(signer)? })
    }

    pub fn sealer_secret(&self) -> &SealerSecret {
        &self.sealer
    }

    pub fn signer_secret(&self) -> &SignerSecret {
        &self.signer
    }

    /// Wire representation (handle with care)
    pub fn expose(&self) -> String {
        format!("{}/{}", self.sealer.expose(), self.signer.expose())
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentSecret(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checks_prefix() {
        assert!(SignerId::parse("signer_zabc").is_ok());
        assert!(SignerId::parse("sealer_zabc").is_err());
        assert!(KeyId::parse("key_z123").is_ok());
    }

    #[test]
    fn test_agent_id_parts() {
        let sealer = SealerId::parse("sealer_zAAA").unwrap();
        let signer = SignerId::parse("signer_zBBB").unwrap();
        let agent = AgentId::from_parts(&sealer, &signer);

        assert_eq!(agent.as_str(), "sealer_zAAA/signer_zBBB");
        assert_eq!(agent.sealer_id(), sealer);
        assert_eq!(agent.signer_id(), signer);
        assert!(AgentId::looks_like(agent.as_str()));
        assert!(!AgentId::looks_like("co_zXYZ"));
    }

    #[test]
    fn test_agent_id_serde_round_trip() {
        let agent = AgentId::parse("sealer_zAAA/signer_zBBB").unwrap();
        let json = serde_json::to_string(&agent).unwrap();
        assert_eq!(json, "\"sealer_zAAA/signer_zBBB\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, agent);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = KeySecret::parse("keySecret_zsupersecret").unwrap();
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("supersecret"));
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let result: Result<SignerId, _> = serde_json::from_str("\"nope\"");
        assert!(result.is_err());
    }
}
