/*
    ids.rs - Identifiers for CoValues, sessions and transactions

    - RawCoId: `co_z<base58>`, content-derived from the header
    - SessionOwner: the account or agent that signs a session
    - SessionId: `<owner>_session_z<random>` or `<owner>_deleted_z<random>`
    - TransactionId: (session, index)
*/

use super::errors::{CoValueError, CoValueResult};
use crate::core_crypto::AgentId;
use serde::{Deserialize, Serialize};
use std::fmt;

const SESSION_MARKER: &str = "_session_z";
const DELETED_MARKER: &str = "_deleted_z";

/// Content-derived CoValue identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RawCoId(String);

impl RawCoId {
    pub const PREFIX: &'static str = "co_z";

    pub fn parse(value: impl Into<String>) -> CoValueResult<Self> {
        let value = value.into();
        if !value.starts_with(Self::PREFIX) || value.len() <= Self::PREFIX.len() {
            return Err(CoValueError::InvalidId(value));
        }
        Ok(Self(value))
    }

    pub(crate) fn from_short_hash(bytes: &[u8]) -> Self {
        Self(format!("{}{}", Self::PREFIX, bs58::encode(bytes).into_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn looks_like(value: &str) -> bool {
        value.starts_with(Self::PREFIX)
    }
}

impl fmt::Display for RawCoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RawCoId {
    type Error = CoValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RawCoId> for String {
    fn from(value: RawCoId) -> String {
        value.0
    }
}

/// Who signs a session: an account CoValue or a bare agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SessionOwner {
    Account(RawCoId),
    Agent(AgentId),
}

impl SessionOwner {
    pub fn parse(value: &str) -> CoValueResult<Self> {
        if RawCoId::looks_like(value) {
            Ok(SessionOwner::Account(RawCoId::parse(value)?))
        } else if AgentId::looks_like(value) {
            Ok(SessionOwner::Agent(
                AgentId::parse(value).map_err(|_| CoValueError::InvalidId(value.to_string()))?,
            ))
        } else {
            Err(CoValueError::InvalidId(value.to_string()))
        }
    }

    pub fn as_account(&self) -> Option<&RawCoId> {
        match self {
            SessionOwner::Account(id) => Some(id),
            SessionOwner::Agent(_) => None,
        }
    }
}

impl fmt::Display for SessionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOwner::Account(id) => write!(f, "{}", id),
            SessionOwner::Agent(agent) => write!(f, "{}", agent),
        }
    }
}

impl From<RawCoId> for SessionOwner {
    fn from(id: RawCoId) -> Self {
        SessionOwner::Account(id)
    }
}

impl From<AgentId> for SessionOwner {
    fn from(agent: AgentId) -> Self {
        SessionOwner::Agent(agent)
    }
}

impl TryFrom<String> for SessionOwner {
    type Error = CoValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionOwner> for String {
    fn from(value: SessionOwner) -> String {
        value.to_string()
    }
}

/// One signer's append-only log within a CoValue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(owner: &SessionOwner, suffix: &str) -> Self {
        Self(format!("{}{}{}", owner, SESSION_MARKER, suffix))
    }

    /// Session that carries a deletion tombstone
    pub fn new_deleted(owner: &SessionOwner, suffix: &str) -> Self {
        Self(format!("{}{}{}", owner, DELETED_MARKER, suffix))
    }

    pub fn parse(value: impl Into<String>) -> CoValueResult<Self> {
        let value = value.into();
        let id = Self(value);
        id.split()?;
        Ok(id)
    }

    fn split(&self) -> CoValueResult<(SessionOwner, bool)> {
        if let Some(idx) = self.0.rfind(DELETED_MARKER) {
            return Ok((SessionOwner::parse(&self.0[..idx])?, true));
        }
        if let Some(idx) = self.0.rfind(SESSION_MARKER) {
            return Ok((SessionOwner::parse(&self.0[..idx])?, false));
        }
        Err(CoValueError::InvalidId(self.0.clone()))
    }

    pub fn owner(&self) -> SessionOwner {
        // Ids are validated on construction
        match self.split() {
            Ok((owner, _)) => owner,
            Err(_) => unreachable!("session id validated at construction"),
        }
    }

    pub fn is_deleted_session(&self) -> bool {
        self.0.contains(DELETED_MARKER)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> String {
        value.0
    }
}

/// Position of a transaction inside a CoValue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub session_id: SessionId,
    pub tx_index: u32,
}

impl TransactionId {
    pub fn new(session_id: SessionId, tx_index: u32) -> Self {
        Self { session_id, tx_index }
    }

    /// Nonce material binding a ciphertext to its CoValue and position
    pub fn nonce_material(&self, co_id: &RawCoId) -> Vec<u8> {
        format!("{}/{}/{}", co_id, self.session_id, self.tx_index).into_bytes()
    }
}
