/*
    errors.rs - Permission errors

    Raised synchronously at the point of an attempted mutation; a refused
    mutation is never partially applied.
*/

use crate::core_covalue::RawCoId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Cannot delete Group or Account coValues")]
    CannotDeleteGroupOrAccount,

    #[error("Only admins can delete coValues")]
    OnlyAdminsCanDelete,

    /// Role, key or sealer change by a non-admin
    #[error("Only admins can {0}")]
    AdminRequired(&'static str),

    #[error("{member} cannot write to {id}")]
    WriteDenied { member: String, id: RawCoId },

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("No readable key for {0}")]
    NoReadKey(RawCoId),

    /// The account of a member is not loaded, so nothing can be sealed to it
    #[error("Unknown member {0}")]
    UnknownMember(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_delete_messages() {
        assert_eq!(
            PermissionError::CannotDeleteGroupOrAccount.to_string(),
            "Cannot delete Group or Account coValues"
        );
        assert_eq!(PermissionError::OnlyAdminsCanDelete.to_string(), "Only admins can delete coValues");
        assert_eq!(PermissionError::AdminRequired("change roles").to_string(), "Only admins can change roles");
    }
}
