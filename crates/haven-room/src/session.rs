//! One active room view.
//!
//! A single task owns the `RoomState` and is the only writer. Everything else
//! (UI hooks, delivery tasks, channel subscriptions) reaches it through
//! messages, and the loop never awaits adapter I/O directly: sends, deletes
//! and (re)connects run in spawned tasks and report back as `Completion`s.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use haven_types::events::{
    ChangeFeedEvent, PinAction, PresenceDescriptor, PresenceSync, RawBroadcast, ReactionAction,
    RoomBroadcast,
};
use haven_types::models::{Message, Participant};

use crate::adapters::RoomAdapters;
use crate::config::RoomConfig;
use crate::error::{ChannelError, DeleteError, SendError, StoreError};
use crate::mention;
use crate::reconciler::{RoomSnapshot, RoomState};
use crate::send::{self, Attachment, ComposerState, Delivery, Submission};
use crate::typing::{TypingDebouncer, TypingSignal};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Non-fatal things the UI may want to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomNotice {
    Connected,
    /// A subscription dropped; a full resync follows the reconnect.
    Disconnected { reason: String },
    Resynced { messages: usize },
    /// The attachment was dropped but the text was still sent.
    UploadFailed { reason: String },
    MalformedEventDropped { reason: String },
}

enum RoomCommand {
    SetInput(String),
    SetReplyTarget(Option<Uuid>),
    SelectMention(Uuid),
    SetRoster(Vec<Participant>),
    Submit {
        attachment: Option<Attachment>,
        reply: oneshot::Sender<Result<Message, SendError>>,
    },
    React {
        message_id: Uuid,
        key: String,
        action: ReactionAction,
    },
    Pin {
        message_id: Uuid,
        action: PinAction,
    },
    MarkRead(Uuid),
    Delete {
        message_id: Uuid,
        reply: oneshot::Sender<Result<(), DeleteError>>,
    },
    Close,
}

/// Fresh subscriptions plus the history fetched right after subscribing.
struct Links {
    feed: BoxStream<'static, ChangeFeedEvent>,
    broadcasts: BoxStream<'static, RawBroadcast>,
    presence: BoxStream<'static, PresenceSync>,
    history: Vec<Message>,
}

enum Completion {
    Delivered(Delivery, oneshot::Sender<Result<Message, SendError>>),
    Deleted {
        message_id: Uuid,
        result: Result<(), StoreError>,
        reply: oneshot::Sender<Result<(), DeleteError>>,
    },
    Connected(Result<Links, ChannelError>),
}

enum Step {
    Command(RoomCommand),
    Completed(Completion),
    Feed(Option<ChangeFeedEvent>),
    Broadcast(Option<RawBroadcast>),
    Presence(Option<PresenceSync>),
    DebounceElapsed,
    Sweep,
    Reconnect,
    Close,
}

/// Cheap, clonable front door to a running room session.
#[derive(Clone)]
pub struct RoomHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
    snapshot: watch::Receiver<Arc<RoomSnapshot>>,
    composer: watch::Receiver<ComposerState>,
    notices: broadcast::Sender<RoomNotice>,
}

impl RoomHandle {
    fn command(&self, command: RoomCommand) {
        let _ = self.commands.send(command);
    }

    pub fn snapshot(&self) -> Arc<RoomSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Snapshot stream for rendering. Only real changes are published.
    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<RoomSnapshot>> {
        self.snapshot.clone()
    }

    pub fn composer(&self) -> ComposerState {
        self.composer.borrow().clone()
    }

    pub fn watch_composer(&self) -> watch::Receiver<ComposerState> {
        self.composer.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<RoomNotice> {
        self.notices.subscribe()
    }

    /// Text-change hook: feeds typing and mention suggestions.
    pub fn set_input(&self, text: impl Into<String>) {
        self.command(RoomCommand::SetInput(text.into()));
    }

    pub fn set_reply_target(&self, message_id: Option<Uuid>) {
        self.command(RoomCommand::SetReplyTarget(message_id));
    }

    pub fn select_mention(&self, user_id: Uuid) {
        self.command(RoomCommand::SelectMention(user_id));
    }

    pub fn set_roster(&self, roster: Vec<Participant>) {
        self.command(RoomCommand::SetRoster(roster));
    }

    /// Send whatever is in the composer. Resolves once the store answers.
    pub async fn submit(&self, attachment: Option<Attachment>) -> Result<Message, SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RoomCommand::Submit { attachment, reply })
            .map_err(|_| SendError::SessionClosed)?;
        rx.await.map_err(|_| SendError::SessionClosed)?
    }

    pub fn react(&self, message_id: Uuid, key: impl Into<String>, action: ReactionAction) {
        self.command(RoomCommand::React {
            message_id,
            key: key.into(),
            action,
        });
    }

    pub fn pin(&self, message_id: Uuid, action: PinAction) {
        self.command(RoomCommand::Pin { message_id, action });
    }

    pub fn mark_read(&self, message_id: Uuid) {
        self.command(RoomCommand::MarkRead(message_id));
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<(), DeleteError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RoomCommand::Delete { message_id, reply })
            .map_err(|_| DeleteError::SessionClosed)?;
        rx.await.map_err(|_| DeleteError::SessionClosed)?
    }

    pub fn close(&self) {
        self.command(RoomCommand::Close);
    }
}

/// A running room session and its task.
pub struct RoomSession {
    handle: RoomHandle,
    task: JoinHandle<()>,
}

impl RoomSession {
    pub fn open(
        room_id: Uuid,
        me: Participant,
        roster: Vec<Participant>,
        adapters: RoomAdapters,
        config: RoomConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(RoomSnapshot::default()));
        let (composer_tx, composer_rx) = watch::channel(ComposerState::default());
        let (notices_tx, _) = broadcast::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let outbound = tokio::spawn(run_outbound(adapters.clone(), room_id, outbound_rx));

        info!("{} ({}) opening room {}", me.display_name, me.id, room_id);

        let actor = RoomActor {
            room_id,
            debouncer: TypingDebouncer::new(config.typing_debounce),
            config,
            me,
            roster,
            adapters,
            state: RoomState::new(),
            composer: ComposerState::default(),
            snapshot_tx,
            composer_tx,
            notices: notices_tx.clone(),
            outbound: outbound_tx,
            last_receipt: None,
            snapshot_dirty: false,
            composer_dirty: false,
        };
        let task = tokio::spawn(actor.run(commands_rx, outbound));

        Self {
            handle: RoomHandle {
                commands: commands_tx,
                snapshot: snapshot_rx,
                composer: composer_rx,
                notices: notices_tx,
            },
            task,
        }
    }

    pub fn handle(&self) -> RoomHandle {
        self.handle.clone()
    }

    /// Close the session and wait for its final typing stop to go out.
    pub async fn shutdown(self) {
        self.handle.close();
        if let Err(e) = self.task.await {
            error!("room session task failed: {}", e);
        }
    }
}

struct RoomActor {
    room_id: Uuid,
    me: Participant,
    roster: Vec<Participant>,
    config: RoomConfig,
    adapters: RoomAdapters,
    state: RoomState,
    composer: ComposerState,
    debouncer: TypingDebouncer,
    snapshot_tx: watch::Sender<Arc<RoomSnapshot>>,
    composer_tx: watch::Sender<ComposerState>,
    notices: broadcast::Sender<RoomNotice>,
    outbound: mpsc::UnboundedSender<RoomBroadcast>,
    last_receipt: Option<Uuid>,
    snapshot_dirty: bool,
    composer_dirty: bool,
}

impl RoomActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RoomCommand>,
        outbound: JoinHandle<()>,
    ) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

        let mut feed: Option<BoxStream<'static, ChangeFeedEvent>> = None;
        let mut broadcasts: Option<BoxStream<'static, RawBroadcast>> = None;
        let mut presence: Option<BoxStream<'static, PresenceSync>> = None;
        let mut connecting = false;
        let mut reconnect_at = Some(Instant::now());

        let mut sweep = tokio::time::interval(self.config.typing_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let debounce_at = self.debouncer.deadline();

            let step = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(RoomCommand::Close) | None => Step::Close,
                    Some(cmd) => Step::Command(cmd),
                },
                Some(done) = done_rx.recv() => Step::Completed(done),
                item = next_item(&mut feed) => Step::Feed(item),
                item = next_item(&mut broadcasts) => Step::Broadcast(item),
                item = next_item(&mut presence) => Step::Presence(item),
                _ = sleep_until(debounce_at) => Step::DebounceElapsed,
                _ = sweep.tick() => Step::Sweep,
                _ = sleep_until(reconnect_at) => Step::Reconnect,
            };

            match step {
                Step::Close => break,
                Step::Command(cmd) => self.on_command(cmd, &done_tx),
                Step::Completed(Completion::Connected(Ok(links))) => {
                    connecting = false;
                    feed = Some(links.feed);
                    broadcasts = Some(links.broadcasts);
                    presence = Some(links.presence);
                    self.on_connected(links.history);
                }
                Step::Completed(Completion::Connected(Err(e))) => {
                    connecting = false;
                    warn!("Room {} connect failed: {}", self.room_id, e);
                    reconnect_at = Some(Instant::now() + self.config.reconnect_backoff);
                }
                Step::Completed(done) => self.on_completion(done),
                Step::Feed(Some(event)) => self.on_change(event),
                Step::Broadcast(Some(raw)) => self.on_broadcast(raw),
                Step::Presence(Some(sync)) => {
                    self.snapshot_dirty |= self.state.apply_presence_sync(sync.online);
                }
                Step::Feed(None) | Step::Broadcast(None) | Step::Presence(None) => {
                    feed = None;
                    broadcasts = None;
                    presence = None;
                    warn!(
                        "Room {} subscription dropped, retrying in {:?}",
                        self.room_id, self.config.reconnect_backoff
                    );
                    self.notify(RoomNotice::Disconnected {
                        reason: ChannelError::Closed.to_string(),
                    });
                    reconnect_at = Some(Instant::now() + self.config.reconnect_backoff);
                }
                Step::DebounceElapsed => {
                    if let Some(signal) = self.debouncer.poll(Instant::now()) {
                        self.send_typing(signal);
                    }
                }
                Step::Sweep => {
                    self.snapshot_dirty |= self.state.sweep_typing(Instant::now());
                }
                Step::Reconnect => {
                    reconnect_at = None;
                    if !connecting {
                        connecting = true;
                        self.spawn_connect(&done_tx);
                    }
                }
            }

            self.publish();
        }

        if let Some(signal) = self.debouncer.stop() {
            self.send_typing(signal);
        }
        info!("{} ({}) left room {}", self.me.display_name, self.me.id, self.room_id);

        // Let queued broadcasts drain before reporting closed.
        drop(self.outbound);
        if let Err(e) = outbound.await {
            error!("room outbound task failed: {}", e);
        }
    }

    fn spawn_connect(&self, done: &mpsc::UnboundedSender<Completion>) {
        let adapters = self.adapters.clone();
        let room_id = self.room_id;
        let descriptor = PresenceDescriptor {
            user_id: self.me.id,
            display_name: self.me.display_name.clone(),
            online_at: Utc::now(),
        };
        let done = done.clone();

        tokio::spawn(async move {
            let attempt = connect(adapters, room_id, descriptor);
            let result = tokio::time::timeout(CONNECT_TIMEOUT, attempt)
                .await
                .unwrap_or(Err(ChannelError::Timeout(CONNECT_TIMEOUT)));
            let _ = done.send(Completion::Connected(result));
        });
    }

    fn on_connected(&mut self, history: Vec<Message>) {
        let count = history.len();
        self.snapshot_dirty |= self.state.resync(history);
        info!("Room {} synced ({} messages)", self.room_id, count);
        self.notify(RoomNotice::Connected);
        self.notify(RoomNotice::Resynced { messages: count });
        self.auto_read_receipt();
    }

    fn on_command(&mut self, cmd: RoomCommand, done: &mpsc::UnboundedSender<Completion>) {
        match cmd {
            RoomCommand::SetInput(text) => self.set_input(text),
            RoomCommand::SetReplyTarget(target) => {
                if self.composer.reply_to != target {
                    self.composer.reply_to = target;
                    self.composer_dirty = true;
                }
            }
            RoomCommand::SelectMention(user_id) => {
                let Some(member) = self.roster.iter().find(|m| m.id == user_id) else {
                    debug!("Mention target {} not in roster", user_id);
                    return;
                };
                let text = mention::apply_selection(&self.composer.text, member);
                self.set_input(text);
            }
            RoomCommand::SetRoster(roster) => {
                self.roster = roster;
                self.refresh_mentions();
            }
            RoomCommand::Submit { attachment, reply } => self.submit(attachment, reply, done),
            RoomCommand::React {
                message_id,
                key,
                action,
            } => {
                if self.state.apply_reaction(message_id, &key, self.me.id, action) {
                    self.snapshot_dirty = true;
                    self.queue(RoomBroadcast::Reaction {
                        message_id,
                        reaction_key: key,
                        reactor_id: self.me.id,
                        action,
                    });
                }
            }
            RoomCommand::Pin { message_id, action } => {
                if self.state.apply_pin(message_id, action) {
                    self.snapshot_dirty = true;
                    self.queue(RoomBroadcast::PinMessage { message_id, action });
                }
            }
            RoomCommand::MarkRead(message_id) => self.mark_read(message_id),
            RoomCommand::Delete { message_id, reply } => {
                let store = self.adapters.messages.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    let result = store.delete(message_id).await;
                    let _ = done.send(Completion::Deleted {
                        message_id,
                        result,
                        reply,
                    });
                });
            }
            RoomCommand::Close => {}
        }
    }

    fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Delivered(delivery, reply) => self.on_delivered(delivery, reply),
            Completion::Deleted {
                message_id,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(()) => {
                        self.snapshot_dirty |= self.state.apply_remote_delete(message_id);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Delete of message {} failed: {}", message_id, e);
                        Err(DeleteError::Store(e))
                    }
                };
                self.publish();
                let _ = reply.send(outcome);
            }
            Completion::Connected(_) => {}
        }
    }

    fn set_input(&mut self, text: String) {
        if text == self.composer.text {
            return;
        }
        self.composer.text = text;
        self.composer_dirty = true;
        self.refresh_mentions();

        let signal = if self.composer.text.is_empty() {
            self.debouncer.stop()
        } else {
            self.debouncer.on_keystroke(Instant::now())
        };
        if let Some(signal) = signal {
            self.send_typing(signal);
        }
    }

    fn refresh_mentions(&mut self) {
        let mentions: Vec<Participant> = mention::candidates(
            &self.composer.text,
            &self.roster,
            self.me.id,
            self.config.mention_limit,
        )
        .into_iter()
        .cloned()
        .collect();

        if mentions != self.composer.mentions {
            self.composer.mentions = mentions;
            self.composer_dirty = true;
        }
    }

    fn submit(
        &mut self,
        attachment: Option<Attachment>,
        reply: oneshot::Sender<Result<Message, SendError>>,
        done: &mpsc::UnboundedSender<Completion>,
    ) {
        let submission = match Submission::take(&mut self.composer, attachment) {
            Ok(submission) => submission,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.composer_dirty = true;
        if let Some(signal) = self.debouncer.stop() {
            self.send_typing(signal);
        }

        let placeholder = submission.placeholder(self.room_id, self.me.id, Utc::now());
        let handle = self.state.apply_optimistic_insert(placeholder);
        self.snapshot_dirty = true;

        let store = self.adapters.messages.clone();
        let content = self.adapters.content.clone();
        let (room_id, sender_id) = (self.room_id, self.me.id);
        let done = done.clone();
        tokio::spawn(async move {
            let delivery =
                send::deliver(store, content, room_id, sender_id, handle, submission).await;
            let _ = done.send(Completion::Delivered(delivery, reply));
        });
    }

    fn on_delivered(
        &mut self,
        delivery: Delivery,
        reply: oneshot::Sender<Result<Message, SendError>>,
    ) {
        if let Some(e) = &delivery.upload_error {
            self.notify(RoomNotice::UploadFailed {
                reason: e.to_string(),
            });
        }

        let outcome = match delivery.result {
            Ok(record) => {
                self.snapshot_dirty |=
                    self.state.commit_optimistic(delivery.handle, record.clone());
                Ok(record)
            }
            Err(e) => {
                self.snapshot_dirty |= self.state.discard_optimistic(delivery.handle);
                if delivery.submission.restore_into(&mut self.composer) {
                    self.composer_dirty = true;
                    self.refresh_mentions();
                }
                Err(e)
            }
        };
        // Callers read the snapshot as soon as the reply lands.
        self.publish();
        let _ = reply.send(outcome);
    }

    fn on_change(&mut self, event: ChangeFeedEvent) {
        match event {
            ChangeFeedEvent::Insert { record } => {
                if record.room_id != self.room_id {
                    return;
                }
                let from_other = record.sender_id != self.me.id;
                self.snapshot_dirty |= self.state.apply_remote_insert(record);
                if from_other {
                    self.auto_read_receipt();
                }
            }
            ChangeFeedEvent::Delete { id } => {
                self.snapshot_dirty |= self.state.apply_remote_delete(id);
            }
        }
    }

    fn on_broadcast(&mut self, raw: RawBroadcast) {
        let event = match RoomBroadcast::from_raw(&raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("Room {} dropped broadcast: {}", self.room_id, e);
                self.notify(RoomNotice::MalformedEventDropped {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let changed = match event {
            RoomBroadcast::Typing {
                user_id,
                user_name,
                is_typing,
            } => {
                if user_id == self.me.id {
                    return;
                }
                trace!("{} ({}) typing={}", user_name, user_id, is_typing);
                self.state.apply_typing(
                    user_id,
                    &user_name,
                    is_typing,
                    Instant::now(),
                    self.config.typing_ttl,
                )
            }
            RoomBroadcast::Reaction {
                message_id,
                reaction_key,
                reactor_id,
                action,
            } => self
                .state
                .apply_reaction(message_id, &reaction_key, reactor_id, action),
            RoomBroadcast::ReadReceipt {
                last_read_message_id,
                reader_id,
            } => self.state.apply_read_receipt(reader_id, last_read_message_id),
            RoomBroadcast::PinMessage { message_id, action } => {
                self.state.apply_pin(message_id, action)
            }
        };
        self.snapshot_dirty |= changed;
    }

    fn mark_read(&mut self, message_id: Uuid) {
        if !self.state.is_committed(&message_id) || self.last_receipt == Some(message_id) {
            return;
        }
        self.snapshot_dirty |= self.state.apply_read_receipt(self.me.id, message_id);
        self.last_receipt = Some(message_id);
        self.queue(RoomBroadcast::ReadReceipt {
            last_read_message_id: message_id,
            reader_id: self.me.id,
        });
    }

    fn auto_read_receipt(&mut self) {
        if !self.config.auto_read_receipts {
            return;
        }
        if let Some(id) = self.state.latest_from_others(self.me.id).map(|m| m.id) {
            self.mark_read(id);
        }
    }

    fn send_typing(&mut self, signal: TypingSignal) {
        trace!("{} ({}) local typing {:?}", self.me.display_name, self.me.id, signal);
        self.queue(RoomBroadcast::Typing {
            user_id: self.me.id,
            user_name: self.me.display_name.clone(),
            is_typing: signal.is_typing(),
        });
    }

    fn queue(&self, event: RoomBroadcast) {
        let _ = self.outbound.send(event);
    }

    fn notify(&self, notice: RoomNotice) {
        let _ = self.notices.send(notice);
    }

    fn publish(&mut self) {
        if self.snapshot_dirty {
            self.snapshot_dirty = false;
            self.snapshot_tx
                .send_replace(Arc::new(self.state.snapshot().clone()));
        }
        if self.composer_dirty {
            self.composer_dirty = false;
            self.composer_tx.send_replace(self.composer.clone());
        }
    }
}

/// Subscribe first, then fetch, so nothing committed in between is missed.
async fn connect(
    adapters: RoomAdapters,
    room_id: Uuid,
    me: PresenceDescriptor,
) -> Result<Links, ChannelError> {
    let feed = adapters.messages.subscribe(room_id).await?;
    let broadcasts = adapters.broadcast.subscribe(room_id).await?;
    let presence = adapters.presence.subscribe(room_id).await?;
    adapters.presence.track(room_id, me).await?;

    let history = adapters
        .messages
        .query(room_id)
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;

    Ok(Links {
        feed,
        broadcasts,
        presence,
        history,
    })
}

/// Serializes outgoing broadcasts so a typing stop never overtakes its start.
async fn run_outbound(
    adapters: RoomAdapters,
    room_id: Uuid,
    mut events: mpsc::UnboundedReceiver<RoomBroadcast>,
) {
    while let Some(event) = events.recv().await {
        let name = event.event_name();
        if let Err(e) = adapters.broadcast.send(room_id, event.to_raw()).await {
            warn!("Room {} broadcast '{}' not sent: {}", room_id, name, e);
        }
    }
}

async fn next_item<T>(stream: &mut Option<BoxStream<'static, T>>) -> Option<T> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
