use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use haven_room::adapters::{BroadcastChannel, MessageStore, PresenceChannel};
use haven_room::error::{ChannelError, StoreError};
use haven_types::events::{ChangeFeedEvent, PresenceDescriptor, PresenceSync, RawBroadcast};
use haven_types::models::{Message, NewMessage};

/// A broadcast tagged with the connection that sent it, so the sender can be
/// skipped on fan-out.
#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    event: RawBroadcast,
}

/// Per-room fan-out. Replacing these senders ends every open subscription.
struct RoomChannels {
    changes: broadcast::Sender<ChangeFeedEvent>,
    broadcasts: broadcast::Sender<Envelope>,
    presence: watch::Sender<PresenceSync>,
    /// Tracked presence per connection id.
    tracked: BTreeMap<Uuid, PresenceDescriptor>,
}

impl RoomChannels {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        let (broadcasts, _) = broadcast::channel(1024);
        let (presence, _) = watch::channel(PresenceSync::default());
        Self {
            changes,
            broadcasts,
            presence,
            tracked: BTreeMap::new(),
        }
    }

    fn publish_presence(&self) {
        let online = self.tracked.values().map(|d| d.user_id).collect();
        self.presence.send_replace(PresenceSync { online });
    }
}

#[derive(Default)]
struct Faults {
    /// Reason for the next insert to fail, if armed.
    fail_next_insert: Option<String>,
    unreachable: bool,
}

/// In-process stand-in for the hosted backend: message log with a change
/// feed, room broadcast fan-out, and presence. Every client of the same hub
/// sees the same rooms.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    messages: RwLock<Vec<Message>>,
    rooms: RwLock<HashMap<Uuid, RoomChannels>>,
    faults: RwLock<Faults>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh connection for one user.
    pub fn connect(&self, user_id: Uuid) -> HubClient {
        let conn_id = Uuid::new_v4();
        debug!("User {} connected to hub as {}", user_id, conn_id);
        HubClient {
            hub: self.clone(),
            conn_id,
            user_id,
        }
    }

    /// Make the next insert fail with `reason`.
    pub async fn fail_next_insert(&self, reason: impl Into<String>) {
        self.inner.faults.write().await.fail_next_insert = Some(reason.into());
    }

    /// While unreachable, every store and channel call fails.
    pub async fn set_reachable(&self, reachable: bool) {
        self.inner.faults.write().await.unreachable = !reachable;
    }

    /// End every open subscription on a room, as a network drop would.
    pub async fn drop_connections(&self, room_id: Uuid) {
        let mut rooms = self.inner.rooms.write().await;
        if rooms.insert(room_id, RoomChannels::new()).is_some() {
            info!("Dropped all connections to room {}", room_id);
        }
    }

    /// Deliver a broadcast that no connected client sent.
    pub async fn inject_raw(&self, room_id: Uuid, event: RawBroadcast) {
        self.fan_out(room_id, Uuid::nil(), event).await;
    }

    /// Untrack every presence entry a user holds in any room.
    pub async fn disconnect(&self, user_id: Uuid) {
        let mut rooms = self.inner.rooms.write().await;
        for channels in rooms.values_mut() {
            let before = channels.tracked.len();
            channels.tracked.retain(|_, d| d.user_id != user_id);
            if channels.tracked.len() != before {
                channels.publish_presence();
            }
        }
        info!("User {} disconnected from hub", user_id);
    }

    /// Snapshot of one room's log, oldest first.
    pub async fn messages(&self, room_id: Uuid) -> Vec<Message> {
        let mut found: Vec<Message> = self
            .inner
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        found.sort_by_key(Message::sort_key);
        found
    }

    async fn ensure_reachable(&self) -> Result<(), ChannelError> {
        if self.inner.faults.read().await.unreachable {
            return Err(ChannelError::Transport("hub unreachable".into()));
        }
        Ok(())
    }

    async fn with_room<T>(&self, room_id: Uuid, f: impl FnOnce(&mut RoomChannels) -> T) -> T {
        let mut rooms = self.inner.rooms.write().await;
        f(rooms.entry(room_id).or_insert_with(RoomChannels::new))
    }

    async fn fan_out(&self, room_id: Uuid, origin: Uuid, event: RawBroadcast) {
        self.with_room(room_id, |room| {
            let _ = room.broadcasts.send(Envelope { origin, event });
        })
        .await;
    }
}

/// One user's connection to a `LocalHub`. Implements the room adapters.
#[derive(Clone)]
pub struct HubClient {
    hub: LocalHub,
    conn_id: Uuid,
    user_id: Uuid,
}

impl HubClient {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

#[async_trait]
impl MessageStore for HubClient {
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
        {
            let mut faults = self.hub.inner.faults.write().await;
            if let Some(reason) = faults.fail_next_insert.take() {
                warn!("Rejecting insert from {}: {}", self.user_id, reason);
                return Err(StoreError::Rejected(reason));
            }
            if faults.unreachable {
                return Err(StoreError::Unavailable("hub unreachable".into()));
            }
        }

        let mut log = self.hub.inner.messages.write().await;
        // A retried insert with a known id is answered with the stored record.
        if let Some(existing) = log.iter().find(|m| m.id == message.id) {
            debug!("Message {} already stored", existing.id);
            return Ok(existing.clone());
        }
        // The log orders by timestamp; keep each room strictly increasing.
        let latest = log
            .iter()
            .filter(|m| m.room_id == message.room_id)
            .map(|m| m.created_at)
            .max();
        let created_at = match latest {
            Some(last) => Utc::now().max(last + chrono::Duration::microseconds(1)),
            None => Utc::now(),
        };
        let record = message.into_message(created_at);
        log.push(record.clone());
        drop(log);

        debug!("Stored message {} in room {}", record.id, record.room_id);
        self.hub
            .with_room(record.room_id, |room| {
                let _ = room.changes.send(ChangeFeedEvent::Insert {
                    record: record.clone(),
                });
            })
            .await;
        Ok(record)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.hub
            .ensure_reachable()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let room_id = {
            let mut log = self.hub.inner.messages.write().await;
            let index = log
                .iter()
                .position(|m| m.id == id)
                .ok_or(StoreError::NotFound(id))?;
            log.remove(index).room_id
        };

        self.hub
            .with_room(room_id, |room| {
                let _ = room.changes.send(ChangeFeedEvent::Delete { id });
            })
            .await;
        Ok(())
    }

    async fn query(&self, room_id: Uuid) -> Result<Vec<Message>, StoreError> {
        self.hub
            .ensure_reachable()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(self.hub.messages(room_id).await)
    }

    async fn subscribe(
        &self,
        room_id: Uuid,
    ) -> Result<BoxStream<'static, ChangeFeedEvent>, ChannelError> {
        self.hub.ensure_reachable().await?;
        let rx = self.hub.with_room(room_id, |room| room.changes.subscribe()).await;
        Ok(receiver_stream(rx).boxed())
    }
}

#[async_trait]
impl BroadcastChannel for HubClient {
    async fn send(&self, room_id: Uuid, event: RawBroadcast) -> Result<(), ChannelError> {
        self.hub.ensure_reachable().await?;
        self.hub.fan_out(room_id, self.conn_id, event).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: Uuid,
    ) -> Result<BoxStream<'static, RawBroadcast>, ChannelError> {
        self.hub.ensure_reachable().await?;
        let rx = self
            .hub
            .with_room(room_id, |room| room.broadcasts.subscribe())
            .await;
        let me = self.conn_id;
        Ok(receiver_stream(rx)
            .filter_map(move |envelope| {
                future::ready((envelope.origin != me).then_some(envelope.event))
            })
            .boxed())
    }
}

#[async_trait]
impl PresenceChannel for HubClient {
    async fn track(&self, room_id: Uuid, me: PresenceDescriptor) -> Result<(), ChannelError> {
        self.hub.ensure_reachable().await?;
        let conn_id = self.conn_id;
        self.hub
            .with_room(room_id, |room| {
                room.tracked.insert(conn_id, me);
                room.publish_presence();
            })
            .await;
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: Uuid,
    ) -> Result<BoxStream<'static, PresenceSync>, ChannelError> {
        self.hub.ensure_reachable().await?;
        let rx = self
            .hub
            .with_room(room_id, |room| room.presence.subscribe())
            .await;

        // Current state first, then every change. Ends when the sender is replaced.
        let stream = stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let sync = rx.borrow_and_update().clone();
            Some((sync, (rx, false)))
        });
        Ok(stream.boxed())
    }
}

fn receiver_stream<T>(rx: broadcast::Receiver<T>) -> impl futures_util::Stream<Item = T> + Send
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(RecvError::Lagged(n)) => {
                    warn!("Hub receiver lagged by {} messages", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
