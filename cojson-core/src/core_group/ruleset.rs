/*
    ruleset.rs - The ruleset interpreter

    One exhaustive match over the closed Ruleset enum decides which
    transactions of a CoValue are valid:

    - Group: trusting transactions authorized by the group's own role table
    - OwnedByGroup: author must be writer/admin of the owning group at
      `made_at`; tombstones only from admins
    - UnsafeAllowAll: everything
*/

use super::role::Role;
use super::state::GroupState;
use crate::core_covalue::{CoValueHeader, RawCoId, Ruleset, SessionId, SessionOwner, Transaction, TransactionId, VerifiedState};
use crate::core_crypto::{AgentId, SignerId};

/// Looks up the agent behind an account
pub trait AgentResolver {
    /// Agent of a loaded account, `None` if it is not available
    fn account_agent(&self, account: &RawCoId) -> Option<AgentId>;

    fn agent_of(&self, owner: &SessionOwner) -> Option<AgentId> {
        match owner {
            SessionOwner::Agent(agent) => Some(agent.clone()),
            SessionOwner::Account(id) => self.account_agent(id),
        }
    }
}

/// Resolver that knows no accounts
pub struct NoAccounts;

impl AgentResolver for NoAccounts {
    fn account_agent(&self, _account: &RawCoId) -> Option<AgentId> {
        None
    }
}

/// Agent of an account header (a group whose initial admin is an agent)
pub fn account_agent_from_header(header: &CoValueHeader) -> Option<AgentId> {
    match &header.ruleset {
        Ruleset::Group { initial_admin: SessionOwner::Agent(agent) } if header.is_account() => Some(agent.clone()),
        _ => None,
    }
}

/// Signer allowed to append to `session` of the CoValue `co_id`.
///
/// An account writing to itself is signed by its initial agent.
pub fn signer_for_session(
    co_id: &RawCoId,
    header: &CoValueHeader,
    session: &SessionId,
    resolver: &dyn AgentResolver,
) -> Option<SignerId> {
    match session.owner() {
        SessionOwner::Agent(agent) => Some(agent.signer_id()),
        SessionOwner::Account(id) if &id == co_id => match &header.ruleset {
            Ruleset::Group { initial_admin: SessionOwner::Agent(agent) } => Some(agent.signer_id()),
            _ => None,
        },
        SessionOwner::Account(id) => resolver.account_agent(&id).map(|a| a.signer_id()),
    }
}

#[derive(Debug, Clone)]
pub struct ValidTransaction<'a> {
    pub tx_id: TransactionId,
    pub tx: &'a Transaction,
}

/// Transactions of `state` that its ruleset accepts, in `(made_at, session, index)` order.
///
/// `owning_group` must be the interpreted owning group for `OwnedByGroup`
/// CoValues; without it nothing is valid.
pub fn determine_valid_transactions<'a>(
    state: &'a VerifiedState,
    owning_group: Option<&GroupState>,
) -> Vec<ValidTransaction<'a>> {
    let ordered = state.transactions_in_order();
    match &state.header().ruleset {
        Ruleset::Group { .. } => {
            let Some(group) = GroupState::from_verified(state) else {
                return Vec::new();
            };
            ordered
                .into_iter()
                .filter(|(tx_id, _)| group.is_valid(tx_id))
                .map(|(tx_id, tx)| ValidTransaction { tx_id, tx })
                .collect()
        }
        Ruleset::OwnedByGroup { .. } => {
            let Some(group) = owning_group else {
                return Vec::new();
            };
            ordered
                .into_iter()
                .filter(|(tx_id, tx)| {
                    let role = group.role_of_at(&tx_id.session_id.owner(), tx.made_at());
                    if tx.is_tombstone() {
                        role == Some(Role::Admin)
                    } else {
                        role.is_some_and(|r| r.can_write())
                    }
                })
                .map(|(tx_id, tx)| ValidTransaction { tx_id, tx })
                .collect()
        }
        Ruleset::UnsafeAllowAll => ordered
            .into_iter()
            .map(|(tx_id, tx)| ValidTransaction { tx_id, tx })
            .collect(),
    }
}

/// Whether any accepted transaction is a tombstone
pub fn has_valid_tombstone(valid: &[ValidTransaction<'_>]) -> bool {
    valid.iter().any(|v| v.tx.is_tombstone())
}

/// Whether `state` is deleted. Only group-owned CoValues can be, and only
/// through a tombstone from an admin of the owning group; a tombstone in a
/// group or an unowned CoValue is plain content.
pub fn is_deleted(state: &VerifiedState, owning_group: Option<&GroupState>) -> bool {
    match &state.header().ruleset {
        Ruleset::OwnedByGroup { .. } => has_valid_tombstone(&determine_valid_transactions(state, owning_group)),
        Ruleset::Group { .. } | Ruleset::UnsafeAllowAll => false,
    }
}
