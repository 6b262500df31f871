//! Seams to the outside world. The session only ever talks to these traits;
//! concrete transports live in `haven-gateway`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use haven_types::events::{ChangeFeedEvent, PresenceDescriptor, PresenceSync, RawBroadcast};
use haven_types::models::{Message, NewMessage};

use crate::error::{ChannelError, StoreError, UploadError};

/// Authoritative append/delete log of messages with a per-room change feed.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return the record as stored. The id is the
    /// caller's; the timestamp is the store's.
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// All messages in a room, ordered by `created_at` ascending.
    async fn query(&self, room_id: Uuid) -> Result<Vec<Message>, StoreError>;

    /// Change feed for one room. The stream ending means the subscription dropped.
    async fn subscribe(
        &self,
        room_id: Uuid,
    ) -> Result<BoxStream<'static, ChangeFeedEvent>, ChannelError>;
}

/// Fire-and-forget pub/sub for ephemeral room events. No ordering or
/// delivery guarantee, and a client never receives its own sends.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn send(&self, room_id: Uuid, event: RawBroadcast) -> Result<(), ChannelError>;

    async fn subscribe(
        &self,
        room_id: Uuid,
    ) -> Result<BoxStream<'static, RawBroadcast>, ChannelError>;
}

/// Full-state online-set sync. The first item after subscribing is the
/// current state; every item replaces the last.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn track(&self, room_id: Uuid, me: PresenceDescriptor) -> Result<(), ChannelError>;

    async fn subscribe(&self, room_id: Uuid)
    -> Result<BoxStream<'static, PresenceSync>, ChannelError>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Upload bytes and return a URL the rest of the room can fetch.
    async fn upload(&self, bytes: Bytes, content_type: &str) -> Result<String, UploadError>;
}

/// The four collaborators a room session needs.
#[derive(Clone)]
pub struct RoomAdapters {
    pub messages: Arc<dyn MessageStore>,
    pub broadcast: Arc<dyn BroadcastChannel>,
    pub presence: Arc<dyn PresenceChannel>,
    pub content: Arc<dyn ContentStore>,
}
