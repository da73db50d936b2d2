/*
    core_group - Groups, roles and the permission model

    A group is a CoValue with the group ruleset whose content is read as a
    role table plus sealed read keys. Every other CoValue's transactions are
    checked against its owning group's roles at the time they were made.
*/

pub mod errors;
pub mod keys;
pub mod ops;
pub mod role;
pub mod ruleset;
pub mod state;

pub use errors::PermissionError;
pub use keys::{current_read_key, read_key_secret, KeyAccess};
pub use ops::{initial_group_ops, GroupEditor};
pub use role::Role;
pub use ruleset::{
    account_agent_from_header, determine_valid_transactions, has_valid_tombstone, is_deleted, signer_for_session,
    AgentResolver, NoAccounts, ValidTransaction,
};
pub use state::{GroupEntry, GroupState, MapOp, EVERYONE};
