/*
    message.rs - Wire messages exchanged between peers

    JSON objects tagged by `action`:

    ```json
    { "action": "pull",      "known": { "id": "co_z…", "header": true, "sessions": {…} } }
    { "action": "data",      "known": {…}, "content": [ NewContent, … ] }
    { "action": "push",      "content": [ NewContent, … ] }
    { "action": "known",     "known": {…}, "correction": false }
    { "action": "reconcile", "batch_id": "…", "offset": 0, "known_states": [ … ] }
    { "action": "ack",       "batch_id": "…", "next_offset": 100 }
    ```

    Every `pull` is answered by exactly one `data`. A `data` whose `known`
    has `header: false` and no content means the responder does not have
    the CoValue.
*/

use super::errors::SyncResult;
use crate::core_covalue::{CoValuePriority, KnownState, NewContent, RawCoId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Ask for everything beyond `known`
    Pull { known: KnownState },

    /// Reply to a pull: the responder's holdings plus what the puller lacks
    Data {
        known: KnownState,
        #[serde(default)]
        content: Vec<NewContent>,
    },

    /// Unsolicited new content, pieces in checkpoint order
    Push { content: Vec<NewContent> },

    /// Acknowledge a push; `correction` asks the sender to resend from `known`
    Known {
        known: KnownState,
        #[serde(default)]
        correction: bool,
    },

    /// A batch of stored known states for storage reconciliation
    Reconcile {
        batch_id: String,
        offset: u64,
        known_states: Vec<KnownState>,
    },

    /// Reconciliation batch processed
    Ack { batch_id: String, next_offset: u64 },
}

impl SyncMessage {
    pub fn unknown(id: RawCoId) -> Self {
        SyncMessage::Data { known: KnownState::empty(id), content: Vec::new() }
    }

    /// CoValue the message is about, if any
    pub fn co_value_id(&self) -> Option<&RawCoId> {
        match self {
            SyncMessage::Pull { known } | SyncMessage::Data { known, .. } | SyncMessage::Known { known, .. } => {
                Some(&known.id)
            }
            SyncMessage::Push { content } => content.first().map(|c| &c.id),
            SyncMessage::Reconcile { .. } | SyncMessage::Ack { .. } => None,
        }
    }

    /// Control traffic goes first; content travels in its CoValue's lane
    pub fn priority(&self) -> CoValuePriority {
        match self {
            SyncMessage::Data { content, .. } | SyncMessage::Push { content } => content
                .iter()
                .map(|c| c.priority)
                .min()
                .unwrap_or(CoValuePriority::High),
            SyncMessage::Pull { .. }
            | SyncMessage::Known { .. }
            | SyncMessage::Reconcile { .. }
            | SyncMessage::Ack { .. } => CoValuePriority::High,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Pull { .. } => "pull",
            SyncMessage::Data { .. } => "data",
            SyncMessage::Push { .. } => "push",
            SyncMessage::Known { .. } => "known",
            SyncMessage::Reconcile { .. } => "reconcile",
            SyncMessage::Ack { .. } => "ack",
        }
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_covalue::{CoValueHeader, CoValueType, Ruleset};
    use serde_json::json;

    fn id() -> RawCoId {
        RawCoId::parse("co_zMsg").unwrap()
    }

    #[test]
    fn test_tagged_by_action() {
        let value = serde_json::to_value(SyncMessage::Pull { known: KnownState::empty(id()) }).unwrap();
        assert_eq!(value["action"], "pull");
        assert_eq!(value["known"]["id"], "co_zMsg");

        let value = serde_json::to_value(SyncMessage::Ack { batch_id: "b1".into(), next_offset: 7 }).unwrap();
        assert_eq!(value, json!({"action": "ack", "batch_id": "b1", "next_offset": 7}));
    }

    #[test]
    fn test_unknown_reply_shape() {
        let text = SyncMessage::unknown(id()).to_json().unwrap();
        match SyncMessage::from_json(&text).unwrap() {
            SyncMessage::Data { known, content } => {
                assert!(!known.header);
                assert!(content.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_data_content_defaults_to_empty() {
        let msg = SyncMessage::from_json(r#"{"action":"data","known":{"id":"co_zMsg","header":false}}"#).unwrap();
        assert_eq!(msg, SyncMessage::unknown(id()));
    }

    #[test]
    fn test_priority_follows_content() {
        let header = CoValueHeader::new(CoValueType::BinaryCoStream, Ruleset::UnsafeAllowAll, json!("b"));
        let mut content = NewContent::empty(header.id().unwrap(), CoValuePriority::Low);
        content.header = Some(header);

        let push = SyncMessage::Push { content: vec![content] };
        assert_eq!(push.priority(), CoValuePriority::Low);
        assert_eq!(SyncMessage::Pull { known: KnownState::empty(id()) }.priority(), CoValuePriority::High);
    }

    #[test]
    fn test_rejects_unknown_action() {
        assert!(SyncMessage::from_json(r#"{"action":"gossip"}"#).is_err());
    }
}
