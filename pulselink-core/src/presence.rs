//! Presence hooks.
//!
//! The runtime only maintains the per-channel member map implied by the
//! attach/detach lifecycle: inbound PRESENCE envelopes upsert or remove
//! members, and the map is cleared whenever the channel leaves `attached`.
//! Set reconciliation beyond that is out of scope.

use pulselink_protocol::{PresenceAction, PresenceMessage};
use std::collections::HashMap;

/// A member currently present on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMember {
    pub client_id: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
pub(crate) struct PresenceMap {
    members: HashMap<String, PresenceMember>,
}

impl PresenceMap {
    pub fn apply(&mut self, msg: &PresenceMessage) {
        let Some(client_id) = msg.client_id.as_deref() else {
            tracing::debug!("presence message without clientId dropped");
            return;
        };
        match msg.action {
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                self.members.insert(
                    client_id.to_string(),
                    PresenceMember {
                        client_id: client_id.to_string(),
                        data: msg.data.clone(),
                    },
                );
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                self.members.remove(client_id);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<PresenceMember> {
        let mut members: Vec<PresenceMember> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        members
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn presence(action: PresenceAction, client_id: &str) -> PresenceMessage {
        PresenceMessage {
            action,
            client_id: Some(client_id.to_string()),
            data: None,
        }
    }

    #[test]
    fn enter_update_leave_round_trip() {
        let mut map = PresenceMap::default();
        map.apply(&presence(PresenceAction::Enter, "alice"));
        map.apply(&presence(PresenceAction::Enter, "bob"));
        map.apply(&PresenceMessage {
            action: PresenceAction::Update,
            client_id: Some("alice".into()),
            data: Some(json!({"status": "busy"})),
        });
        let members = map.snapshot();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].client_id, "alice");
        assert_eq!(members[0].data, Some(json!({"status": "busy"})));

        map.apply(&presence(PresenceAction::Leave, "alice"));
        assert_eq!(map.snapshot().len(), 1);
    }

    #[test]
    fn clear_empties_the_map() {
        let mut map = PresenceMap::default();
        map.apply(&presence(PresenceAction::Enter, "alice"));
        map.clear();
        assert!(map.snapshot().is_empty());
    }
}
