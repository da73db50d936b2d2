/*
    keys.rs - Read-key distribution

    Every epoch has one symmetric read key. It is sealed individually to each
    member (`<keyId>_for_<member>`), revealed in plaintext when everyone may
    read (`<keyId>_for_everyone`) and chained to its successor
    (`<oldKeyId>_for_<newKeyId>`) so that members who only hold a newer key
    can still read older content.
*/

use super::ruleset::AgentResolver;
use super::state::{key_for, GroupState, MapOp, EVERYONE, GROUP_SEALER, READ_KEY};
use crate::core_covalue::{RawCoId, SessionOwner};
use crate::core_crypto::{
    AgentId, AgentSecret, CryptoProvider, CryptoResult, Encrypted, KeyId, KeySecret, Sealed,
};
use tracing::debug;

/// Bound on how far back a key chain is followed
const MAX_KEY_CHAIN_DEPTH: usize = 64;

/// Everything needed to open keys on behalf of one member
pub struct KeyAccess<'a> {
    pub crypto: &'a dyn CryptoProvider,
    pub resolver: &'a dyn AgentResolver,
    pub member: &'a SessionOwner,
    pub secret: &'a AgentSecret,
}

fn seal_nonce(group: &RawCoId, key_id: &KeyId, member: &str) -> Vec<u8> {
    format!("{}/{}", group, key_for(key_id, member)).into_bytes()
}

fn chain_nonce(group: &RawCoId, old: &KeyId, new: &KeyId) -> Vec<u8> {
    format!("{}/{}", group, key_for(old, new.as_str())).into_bytes()
}

/// Secret of `key_id` if `access.member` can reach it
pub fn read_key_secret(group: &GroupState, key_id: &KeyId, access: &KeyAccess<'_>) -> Option<KeySecret> {
    unlock(group, key_id, access, 0)
}

/// Secret of the current read key
pub fn current_read_key(group: &GroupState, access: &KeyAccess<'_>) -> Option<(KeyId, KeySecret)> {
    let key_id = group.read_key_id()?;
    let secret = read_key_secret(group, &key_id, access)?;
    Some((key_id, secret))
}

fn unlock(group: &GroupState, key_id: &KeyId, access: &KeyAccess<'_>, depth: usize) -> Option<KeySecret> {
    if depth > MAX_KEY_CHAIN_DEPTH {
        return None;
    }

    if let Some(revealed) = group.get(&key_for(key_id, EVERYONE)).and_then(|v| v.as_str()) {
        if let Ok(secret) = KeySecret::parse(revealed) {
            return Some(secret);
        }
    }

    let member = access.member.to_string();
    if let Some(entry) = group.get_entry(&key_for(key_id, &member)) {
        let opened = entry
            .value
            .as_str()
            .and_then(|s| Sealed::parse(s).ok())
            .zip(access.resolver.agent_of(&entry.author))
            .and_then(|(sealed, author)| {
                access
                    .crypto
                    .unseal(
                        &sealed,
                        access.secret.sealer_secret(),
                        &author.sealer_id(),
                        &seal_nonce(group.id(), key_id, &member),
                    )
                    .ok()
            })
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| KeySecret::parse(s).ok());
        if opened.is_some() {
            return opened;
        }
        debug!(group = %group.id(), key = %key_id, "Sealed read key could not be opened");
    }

    for newer in group.newer_keys_for(key_id) {
        let Some(newer_secret) = unlock(group, &newer, access, depth + 1) else {
            continue;
        };
        let Some(encrypted) = group
            .get(&key_for(key_id, newer.as_str()))
            .and_then(|v| v.as_str())
            .and_then(|s| Encrypted::parse(s).ok())
        else {
            continue;
        };
        if let Ok(bytes) = access.crypto.decrypt(&encrypted, &newer_secret, &chain_nonce(group.id(), key_id, &newer)) {
            if let Some(secret) = String::from_utf8(bytes).ok().and_then(|s| KeySecret::parse(s).ok()) {
                return Some(secret);
            }
        }
    }
    None
}

/// `<keyId>_for_<member>` sealed from `author` to `recipient`
pub fn seal_key_for_member(
    crypto: &dyn CryptoProvider,
    group: &RawCoId,
    key_id: &KeyId,
    key_secret: &KeySecret,
    author: &AgentSecret,
    member: &SessionOwner,
    recipient: &AgentId,
) -> CryptoResult<MapOp> {
    let member = member.to_string();
    let sealed = crypto.seal(
        key_secret.expose().as_bytes(),
        author.sealer_secret(),
        &recipient.sealer_id(),
        &seal_nonce(group, key_id, &member),
    )?;
    Ok(MapOp::set(key_for(key_id, &member), sealed.as_str()))
}

/// `<oldKeyId>_for_<newKeyId>`: the old secret encrypted with the new one
pub fn chain_key(
    crypto: &dyn CryptoProvider,
    group: &RawCoId,
    old_id: &KeyId,
    old_secret: &KeySecret,
    new_id: &KeyId,
    new_secret: &KeySecret,
) -> CryptoResult<MapOp> {
    let encrypted = crypto.encrypt(old_secret.expose().as_bytes(), new_secret, &chain_nonce(group, old_id, new_id))?;
    Ok(MapOp::set(key_for(old_id, new_id.as_str()), encrypted.as_str()))
}

/// `<keyId>_for_everyone`
pub fn reveal_key(key_id: &KeyId, key_secret: &KeySecret) -> MapOp {
    MapOp::set(key_for(key_id, EVERYONE), key_secret.expose())
}

pub fn set_read_key(key_id: &KeyId) -> MapOp {
    MapOp::set(READ_KEY, key_id.as_str())
}

/// `groupSealer` for the epoch of `key_secret`
pub fn group_sealer_op(crypto: &dyn CryptoProvider, key_secret: &KeySecret) -> CryptoResult<MapOp> {
    let secret = crypto.group_sealer_secret(key_secret)?;
    Ok(MapOp::set(GROUP_SEALER, crypto.sealer_id(&secret)?.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_covalue::{
        CoValueHeader, CoValueType, Ruleset, SessionId, Transaction, VerifiedState, DEFAULT_MAX_BYTES_PER_SIGNATURE,
    };
    use crate::core_crypto::PureCrypto;
    use crate::core_group::ruleset::NoAccounts;
    use serde_json::json;

    struct Actor {
        secret: AgentSecret,
        agent: AgentId,
        owner: SessionOwner,
        session: SessionId,
    }

    fn actor(crypto: &PureCrypto, name: &str) -> Actor {
        let secret = crypto.new_agent_secret();
        let agent = crypto.agent_id(&secret).unwrap();
        let owner = SessionOwner::Agent(agent.clone());
        let session = SessionId::new(&owner, name);
        Actor { secret, agent, owner, session }
    }

    fn write(state: &mut VerifiedState, crypto: &PureCrypto, who: &Actor, made_at: u64, ops: Vec<MapOp>) {
        let changes: Vec<_> = ops.iter().map(MapOp::to_json).collect();
        state
            .make_transaction(
                crypto,
                &who.session,
                who.secret.signer_secret(),
                Transaction::trusting(made_at, &changes, None).unwrap(),
            )
            .unwrap();
    }

    fn access<'a>(crypto: &'a PureCrypto, who: &'a Actor) -> KeyAccess<'a> {
        KeyAccess { crypto, resolver: &NoAccounts, member: &who.owner, secret: &who.secret }
    }

    #[test]
    fn test_key_rotation_keeps_history_readable() {
        let crypto = PureCrypto::new();
        let admin = actor(&crypto, "a");
        let old_member = actor(&crypto, "o");
        let new_member = actor(&crypto, "n");

        let header = CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::Group { initial_admin: admin.owner.clone() },
            json!("g"),
        );
        let id = header.id().unwrap();
        let mut state = VerifiedState::new(id.clone(), header, DEFAULT_MAX_BYTES_PER_SIGNATURE).unwrap();

        let (k1, s1) = crypto.new_key_secret();
        write(
            &mut state,
            &crypto,
            &admin,
            1,
            vec![
                MapOp::set(admin.owner.to_string(), "admin"),
                MapOp::set(old_member.owner.to_string(), "reader"),
                seal_key_for_member(&crypto, &id, &k1, &s1, &admin.secret, &admin.owner, &admin.agent).unwrap(),
                seal_key_for_member(&crypto, &id, &k1, &s1, &admin.secret, &old_member.owner, &old_member.agent)
                    .unwrap(),
                set_read_key(&k1),
            ],
        );

        let (k2, s2) = crypto.new_key_secret();
        write(
            &mut state,
            &crypto,
            &admin,
            2,
            vec![
                MapOp::set(old_member.owner.to_string(), "revoked"),
                MapOp::set(new_member.owner.to_string(), "reader"),
                seal_key_for_member(&crypto, &id, &k2, &s2, &admin.secret, &admin.owner, &admin.agent).unwrap(),
                seal_key_for_member(&crypto, &id, &k2, &s2, &admin.secret, &new_member.owner, &new_member.agent)
                    .unwrap(),
                chain_key(&crypto, &id, &k1, &s1, &k2, &s2).unwrap(),
                set_read_key(&k2),
            ],
        );

        let group = GroupState::from_verified(&state).unwrap();
        assert_eq!(group.read_key_id(), Some(k2.clone()));

        // New member reads the old epoch through the chain
        let newcomer = access(&crypto, &new_member);
        assert_eq!(read_key_secret(&group, &k1, &newcomer), Some(s1.clone()));
        assert_eq!(current_read_key(&group, &newcomer), Some((k2.clone(), s2)));

        // Revoked member keeps the old key only
        let revoked = access(&crypto, &old_member);
        assert_eq!(read_key_secret(&group, &k1, &revoked), Some(s1));
        assert_eq!(read_key_secret(&group, &k2, &revoked), None);
    }

    #[test]
    fn test_revealed_key_readable_by_anyone() {
        let crypto = PureCrypto::new();
        let admin = actor(&crypto, "a");
        let stranger = actor(&crypto, "s");
        let header = CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::Group { initial_admin: admin.owner.clone() },
            json!("pub"),
        );
        let mut state = VerifiedState::new(header.id().unwrap(), header, DEFAULT_MAX_BYTES_PER_SIGNATURE).unwrap();
        let (k, s) = crypto.new_key_secret();
        write(&mut state, &crypto, &admin, 1, vec![MapOp::set(EVERYONE, "reader"), reveal_key(&k, &s), set_read_key(&k)]);

        let group = GroupState::from_verified(&state).unwrap();
        assert_eq!(read_key_secret(&group, &k, &access(&crypto, &stranger)), Some(s));
    }

    #[test]
    fn test_group_sealer_op() {
        let crypto = PureCrypto::new();
        let (_, s) = crypto.new_key_secret();
        match group_sealer_op(&crypto, &s).unwrap() {
            MapOp::Set { key, value } => {
                assert_eq!(key, GROUP_SEALER);
                assert!(value.as_str().unwrap().starts_with("sealer_z"));
            }
            MapOp::Del { .. } => panic!("expected set"),
        }
    }
}
