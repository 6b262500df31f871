use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::Message;

/// An untyped broadcast frame as it arrives off the wire.
/// Nothing downstream of the channel boundary sees this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBroadcast {
    pub event: String,
    pub payload: Value,
}

impl RawBroadcast {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinAction {
    Pin,
    Unpin,
}

/// Ephemeral room events carried by the broadcast channel.
/// Delivery is at-most-once and unordered; none of these are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum RoomBroadcast {
    /// A user started or stopped typing
    #[serde(rename_all = "camelCase")]
    Typing {
        user_id: Uuid,
        user_name: String,
        is_typing: bool,
    },

    /// A reaction was added to or removed from a message
    #[serde(rename_all = "camelCase")]
    Reaction {
        message_id: Uuid,
        reaction_key: String,
        reactor_id: Uuid,
        action: ReactionAction,
    },

    /// A reader acknowledged everything up to a message
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        last_read_message_id: Uuid,
        reader_id: Uuid,
    },

    /// A message was pinned or unpinned
    #[serde(rename_all = "camelCase")]
    PinMessage { message_id: Uuid, action: PinAction },
}

impl RoomBroadcast {
    pub const EVENT_NAMES: [&'static str; 4] =
        ["typing", "reaction", "read_receipt", "pin_message"];

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Typing { .. } => "typing",
            Self::Reaction { .. } => "reaction",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::PinMessage { .. } => "pin_message",
        }
    }

    /// Validate a raw frame into a typed event. Anything that fails here is
    /// dropped by the caller without touching room state.
    pub fn from_raw(raw: &RawBroadcast) -> Result<Self, MalformedEvent> {
        if !Self::EVENT_NAMES.contains(&raw.event.as_str()) {
            return Err(MalformedEvent::UnknownEvent(raw.event.clone()));
        }

        let tagged = serde_json::json!({ "event": raw.event, "payload": raw.payload });
        let event: Self =
            serde_json::from_value(tagged).map_err(|source| MalformedEvent::InvalidPayload {
                event: raw.event.clone(),
                source,
            })?;

        if let Self::Reaction { reaction_key, .. } = &event {
            if reaction_key.trim().is_empty() {
                return Err(MalformedEvent::EmptyReactionKey);
            }
        }

        Ok(event)
    }

    pub fn to_raw(&self) -> RawBroadcast {
        let payload = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        RawBroadcast::new(self.event_name(), payload)
    }
}

/// Why a broadcast frame was rejected at the channel boundary.
#[derive(Debug, thiserror::Error)]
pub enum MalformedEvent {
    #[error("unknown broadcast event '{0}'")]
    UnknownEvent(String),

    #[error("invalid '{event}' payload: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("reaction key is empty")]
    EmptyReactionKey,
}

/// Change-feed entries emitted by the message store, scoped to one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ChangeFeedEvent {
    Insert { record: Message },
    Delete { id: Uuid },
}

/// Full online-set state. Each sync replaces the previous one wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSync {
    pub online: BTreeSet<Uuid>,
}

/// What a client announces about itself when it starts tracking presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDescriptor {
    pub user_id: Uuid,
    pub display_name: String,
    pub online_at: DateTime<Utc>,
}
