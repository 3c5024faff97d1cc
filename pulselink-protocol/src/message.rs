use crate::{Action, ErrorInfo};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Server-advertised connection parameters, delivered with CONNECTED.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Maximum interval between inbound messages before the connection is
    /// considered dead, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl_ms: Option<u64>,
}

/// A user data message. The payload is opaque to the runtime.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Epoch milliseconds, stamped by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Presence event discriminator. Wire values are fixed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum PresenceAction {
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The discriminated envelope exchanged between client and server.
///
/// Exactly which optional fields are populated depends on `action`;
/// constructors below cover the envelopes the client runtime emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            channel: None,
            msg_serial: None,
            count: None,
            error: None,
            connection_id: None,
            connection_details: None,
            messages: None,
            presence: None,
        }
    }

    pub fn attach(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::new(Action::Attach)
        }
    }

    pub fn detach(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::new(Action::Detach)
        }
    }

    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    pub fn publish(channel: impl Into<String>, serial: i64, messages: Vec<Message>) -> Self {
        Self {
            channel: Some(channel.into()),
            msg_serial: Some(serial),
            count: Some(messages.len() as u32),
            messages: Some(messages),
            ..Self::new(Action::Message)
        }
    }

    pub fn presence(
        channel: impl Into<String>,
        serial: i64,
        presence: Vec<PresenceMessage>,
    ) -> Self {
        Self {
            channel: Some(channel.into()),
            msg_serial: Some(serial),
            count: Some(presence.len() as u32),
            presence: Some(presence),
            ..Self::new(Action::Presence)
        }
    }

    /// Whether this envelope should be routed to a channel rather than to
    /// the connection itself.
    #[inline]
    pub fn is_channel_scoped(&self) -> bool {
        self.channel.is_some() && (self.action.is_channel_type() || self.action == Action::Error)
    }
}
