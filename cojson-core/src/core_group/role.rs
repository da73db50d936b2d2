//! Group roles

use super::errors::PermissionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a member in a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Can change roles, rotate keys and delete owned CoValues
    Admin,
    Writer,
    Reader,
    /// Former member, no access
    Revoked,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::Revoked => "revoked",
        }
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin | Role::Writer)
    }

    pub fn can_read(&self) -> bool {
        !matches!(self, Role::Revoked)
    }

    /// Roles that may be granted to `everyone`
    pub fn is_valid_for_everyone(&self) -> bool {
        matches!(self, Role::Reader | Role::Writer | Role::Revoked)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "writer" => Ok(Role::Writer),
            "reader" => Ok(Role::Reader),
            "revoked" => Ok(Role::Revoked),
            other => Err(PermissionError::InvalidRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("revoked".parse::<Role>().unwrap(), Role::Revoked);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_capabilities() {
        assert!(Role::Admin.can_write());
        assert!(Role::Writer.can_write());
        assert!(!Role::Reader.can_write());
        assert!(Role::Reader.can_read());
        assert!(!Role::Revoked.can_read());
        assert!(!Role::Admin.is_valid_for_everyone());
    }
}
