//! Canonical per-room state.
//!
//! `RoomState` merges the change feed, the broadcast channel, presence sync and
//! local optimistic sends into one `RoomSnapshot`. Every `apply_*` is total:
//! unknown ids are no-ops, repeats are idempotent, and each call reports
//! whether anything changed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use haven_types::api::ReactionGroup;
use haven_types::events::{PinAction, ReactionAction};
use haven_types::models::Message;

use crate::config::StreakConfig;
use crate::streak;
use crate::typing::TypingSet;

/// messageId -> reactionKey -> users
pub type ReactionIndex = BTreeMap<Uuid, BTreeMap<String, BTreeSet<Uuid>>>;
/// messageId -> readers
pub type ReadReceiptIndex = BTreeMap<Uuid, BTreeSet<Uuid>>;
pub type PinnedSet = BTreeSet<Uuid>;
pub type PresenceSet = BTreeSet<Uuid>;

/// Identifies one optimistic placeholder until its send resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingHandle(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: Message,
    /// Set while this entry is a local placeholder awaiting the store.
    pub pending: Option<PendingHandle>,
}

impl TimelineEntry {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn key(&self) -> (DateTime<Utc>, Uuid) {
        self.message.sort_key()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub messages: Vec<TimelineEntry>,
    pub reactions: ReactionIndex,
    pub read_receipts: ReadReceiptIndex,
    pub pinned: PinnedSet,
    pub typing: TypingSet,
    pub presence: PresenceSet,
}

impl RoomSnapshot {
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().map(|entry| &entry.message)
    }

    pub fn committed(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|entry| !entry.is_pending())
            .map(|entry| &entry.message)
    }

    pub fn get(&self, id: &Uuid) -> Option<&TimelineEntry> {
        self.messages.iter().find(|entry| entry.message.id == *id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.get(id).is_some()
    }

    /// Case-insensitive substring search over message content, in timeline order.
    pub fn search(&self, needle: &str) -> Vec<&Message> {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.messages()
            .filter(|message| message.content.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn reaction_groups(&self, message_id: &Uuid) -> Vec<ReactionGroup> {
        self.reactions
            .get(message_id)
            .map(|by_key| {
                by_key
                    .iter()
                    .map(|(emoji, users)| ReactionGroup {
                        emoji: emoji.clone(),
                        count: users.len(),
                        user_ids: users.iter().copied().collect(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn readers(&self, message_id: &Uuid) -> Option<&BTreeSet<Uuid>> {
        self.read_receipts.get(message_id)
    }

    pub fn is_pinned(&self, message_id: &Uuid) -> bool {
        self.pinned.contains(message_id)
    }

    pub fn pinned_messages(&self) -> Vec<&Message> {
        self.messages()
            .filter(|message| self.pinned.contains(&message.id))
            .collect()
    }

    pub fn is_online(&self, user_id: &Uuid) -> bool {
        self.presence.contains(user_id)
    }

    /// Mutual-activity streak over the committed history.
    pub fn streak(&self, now: DateTime<Utc>, config: &StreakConfig) -> u32 {
        streak::streak(
            self.committed().map(|message| (message.sender_id, message.created_at)),
            now,
            config,
        )
    }
}

/// Single-owner mutable room state. Lives inside exactly one session task.
#[derive(Debug, Default)]
pub struct RoomState {
    snapshot: RoomSnapshot,
    next_handle: u64,
}

impl RoomState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &RoomSnapshot {
        &self.snapshot
    }

    fn position(&self, id: &Uuid) -> Option<usize> {
        self.snapshot
            .messages
            .iter()
            .position(|entry| entry.message.id == *id)
    }

    fn position_of_handle(&self, handle: PendingHandle) -> Option<usize> {
        self.snapshot
            .messages
            .iter()
            .position(|entry| entry.pending == Some(handle))
    }

    fn insert_sorted(&mut self, entry: TimelineEntry) {
        let key = entry.key();
        let at = self.snapshot.messages.partition_point(|e| e.key() <= key);
        self.snapshot.messages.insert(at, entry);
    }

    /// Put `entry` at `idx` if that keeps the order, otherwise move it.
    fn replace_at(&mut self, idx: usize, entry: TimelineEntry) {
        let key = entry.key();
        let messages = &self.snapshot.messages;
        let fits_before = idx == 0 || messages[idx - 1].key() <= key;
        let fits_after = idx + 1 >= messages.len() || key <= messages[idx + 1].key();

        if fits_before && fits_after {
            self.snapshot.messages[idx] = entry;
        } else {
            self.snapshot.messages.remove(idx);
            self.insert_sorted(entry);
        }
    }

    /// Committed record from the change feed (or a resolved send).
    pub fn apply_remote_insert(&mut self, record: Message) -> bool {
        let sender = record.sender_id;
        let typing_cleared = self.snapshot.typing.clear(sender);

        let entry = TimelineEntry {
            message: record,
            pending: None,
        };

        let changed = match self.position(&entry.message.id) {
            Some(idx) if self.snapshot.messages[idx] == entry => false,
            Some(idx) => {
                debug!("Replacing message {} in place", entry.message.id);
                self.replace_at(idx, entry);
                true
            }
            None => {
                debug!("Inserting message {} from {}", entry.message.id, sender);
                self.insert_sorted(entry);
                true
            }
        };

        changed || typing_cleared
    }

    pub fn apply_remote_delete(&mut self, id: Uuid) -> bool {
        let Some(idx) = self.position(&id) else {
            return false;
        };

        self.snapshot.messages.remove(idx);
        self.snapshot.reactions.remove(&id);
        self.snapshot.read_receipts.remove(&id);
        self.snapshot.pinned.remove(&id);
        debug!("Deleted message {}", id);
        true
    }

    /// Append a local placeholder at the tail. Its timestamp is nudged past the
    /// current tail so appending never breaks the sort order.
    pub fn apply_optimistic_insert(&mut self, mut draft: Message) -> PendingHandle {
        if let Some(tail) = self.snapshot.messages.last() {
            if draft.sort_key() <= tail.key() {
                draft.created_at = tail.message.created_at + chrono::Duration::microseconds(1);
            }
        }

        let handle = PendingHandle(self.next_handle);
        self.next_handle += 1;

        trace!("Placeholder {} for draft {}", handle.0, draft.id);
        self.snapshot.messages.push(TimelineEntry {
            message: draft,
            pending: Some(handle),
        });
        handle
    }

    /// Swap a placeholder for the record the store returned.
    ///
    /// Placeholder and record share an id, so a feed echo that arrived first
    /// already replaced the placeholder and this is a no-op.
    pub fn commit_optimistic(&mut self, handle: PendingHandle, record: Message) -> bool {
        let placeholder = self.position_of_handle(handle);
        let existing = self.position(&record.id);

        match (placeholder, existing) {
            (Some(p), Some(e)) if p != e => {
                self.snapshot.messages.remove(p);
                self.apply_remote_insert(record);
                true
            }
            (Some(p), _) => {
                self.snapshot.typing.clear(record.sender_id);
                self.replace_at(
                    p,
                    TimelineEntry {
                        message: record,
                        pending: None,
                    },
                );
                true
            }
            (None, _) => self.apply_remote_insert(record),
        }
    }

    /// Remove a placeholder whose send failed.
    pub fn discard_optimistic(&mut self, handle: PendingHandle) -> bool {
        match self.position_of_handle(handle) {
            Some(idx) => {
                let entry = self.snapshot.messages.remove(idx);
                let id = entry.message.id;
                self.snapshot.reactions.remove(&id);
                self.snapshot.read_receipts.remove(&id);
                self.snapshot.pinned.remove(&id);
                true
            }
            None => false,
        }
    }

    /// True when `id` is in the timeline and no longer a placeholder.
    pub fn is_committed(&self, id: &Uuid) -> bool {
        self.snapshot.get(id).is_some_and(|entry| !entry.is_pending())
    }

    pub fn apply_reaction(
        &mut self,
        message_id: Uuid,
        key: &str,
        user_id: Uuid,
        action: ReactionAction,
    ) -> bool {
        if !self.is_committed(&message_id) {
            return false;
        }

        match action {
            ReactionAction::Add => self
                .snapshot
                .reactions
                .entry(message_id)
                .or_default()
                .entry(key.to_string())
                .or_default()
                .insert(user_id),
            ReactionAction::Remove => {
                let Some(by_key) = self.snapshot.reactions.get_mut(&message_id) else {
                    return false;
                };
                let Some(users) = by_key.get_mut(key) else {
                    return false;
                };
                let removed = users.remove(&user_id);
                if users.is_empty() {
                    by_key.remove(key);
                }
                if by_key.is_empty() {
                    self.snapshot.reactions.remove(&message_id);
                }
                removed
            }
        }
    }

    pub fn apply_pin(&mut self, message_id: Uuid, action: PinAction) -> bool {
        if !self.is_committed(&message_id) {
            return false;
        }
        match action {
            PinAction::Pin => self.snapshot.pinned.insert(message_id),
            PinAction::Unpin => self.snapshot.pinned.remove(&message_id),
        }
    }

    /// Walk backward from `last_read_message_id` and mark `reader_id` on every
    /// message not sent by the reader.
    ///
    /// In rooms where several senders interleave, this also marks messages the
    /// reader may not have scrolled past. Marks are never removed.
    pub fn apply_read_receipt(&mut self, reader_id: Uuid, last_read_message_id: Uuid) -> bool {
        let Some(start) = self.position(&last_read_message_id) else {
            return false;
        };

        let mut changed = false;
        for entry in self.snapshot.messages[..=start].iter().rev() {
            if entry.is_pending() || entry.message.sender_id == reader_id {
                continue;
            }
            changed |= self
                .snapshot
                .read_receipts
                .entry(entry.message.id)
                .or_default()
                .insert(reader_id);
        }
        changed
    }

    pub fn apply_typing(
        &mut self,
        user_id: Uuid,
        display_name: &str,
        is_typing: bool,
        now: Instant,
        ttl: Duration,
    ) -> bool {
        self.snapshot
            .typing
            .apply(user_id, display_name, is_typing, now, ttl)
    }

    pub fn sweep_typing(&mut self, now: Instant) -> bool {
        let expired = self.snapshot.typing.sweep(now);
        for user_id in &expired {
            trace!("Typing indicator for {} expired", user_id);
        }
        !expired.is_empty()
    }

    pub fn apply_presence_sync(&mut self, online: PresenceSet) -> bool {
        if self.snapshot.presence == online {
            return false;
        }
        self.snapshot.presence = online;
        true
    }

    /// Replace committed history with a freshly fetched list.
    ///
    /// In-flight placeholders stay at the tail. Broadcast-derived state for
    /// surviving ids is kept; missed broadcasts are not recovered.
    pub fn resync(&mut self, records: Vec<Message>) -> bool {
        let before = self.snapshot.messages.clone();

        let mut seen = BTreeSet::new();
        let mut committed: Vec<TimelineEntry> = records
            .into_iter()
            .filter(|record| seen.insert(record.id))
            .map(|message| TimelineEntry {
                message,
                pending: None,
            })
            .collect();
        committed.sort_by_key(TimelineEntry::key);

        let placeholders: Vec<TimelineEntry> = self
            .snapshot
            .messages
            .drain(..)
            .filter(|entry| entry.is_pending() && !seen.contains(&entry.message.id))
            .collect();

        self.snapshot.messages = committed;
        for placeholder in placeholders {
            self.insert_sorted(placeholder);
        }

        let live: BTreeSet<Uuid> = self.snapshot.messages().map(|m| m.id).collect();
        self.snapshot.reactions.retain(|id, _| live.contains(id));
        self.snapshot.read_receipts.retain(|id, _| live.contains(id));
        self.snapshot.pinned.retain(|id| live.contains(id));

        self.snapshot.messages != before
    }

    /// Newest committed message not sent by `reader`, if any.
    pub fn latest_from_others(&self, reader: Uuid) -> Option<&Message> {
        self.snapshot
            .committed()
            .filter(|message| message.sender_id != reader)
            .last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(sender: Uuid, secs: i64, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            room_id: Uuid::nil(),
            sender_id: sender,
            content: content.into(),
            image_url: None,
            reply_to_id: None,
            created_at: at(secs),
        }
    }

    fn assert_sorted_unique(state: &RoomState) {
        let keys: Vec<_> = state.snapshot().messages.iter().map(TimelineEntry::key).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "timeline out of order: {keys:?}");
    }

    #[test]
    fn inserts_and_deletes_keep_order_without_duplicates() {
        let mut state = RoomState::new();
        let alice = Uuid::new_v4();
        let records: Vec<Message> = [30, 10, 20, 10, 50, 40]
            .into_iter()
            .map(|secs| msg(alice, secs, "x"))
            .collect();

        for record in &records {
            state.apply_remote_insert(record.clone());
            assert_sorted_unique(&state);
        }
        // duplicate delivery
        for record in &records {
            assert!(!state.apply_remote_insert(record.clone()));
        }
        assert_eq!(state.snapshot().messages.len(), records.len());

        assert!(state.apply_remote_delete(records[2].id));
        assert!(!state.apply_remote_delete(records[2].id));
        assert!(!state.apply_remote_delete(Uuid::new_v4()));
        assert_sorted_unique(&state);
        assert_eq!(state.snapshot().messages.len(), records.len() - 1);
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let mut state = RoomState::new();
        let alice = Uuid::new_v4();
        let mut a = msg(alice, 5, "a");
        let mut b = msg(alice, 5, "b");
        a.id = Uuid::from_u128(2);
        b.id = Uuid::from_u128(1);

        state.apply_remote_insert(a.clone());
        state.apply_remote_insert(b.clone());

        let ids: Vec<Uuid> = state.snapshot().messages().map(|m| m.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[test]
    fn delete_cascades_into_indices() {
        let mut state = RoomState::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let record = msg(alice, 1, "pin me");
        state.apply_remote_insert(record.clone());

        state.apply_reaction(record.id, "+1", bob, ReactionAction::Add);
        state.apply_pin(record.id, PinAction::Pin);
        state.apply_read_receipt(bob, record.id);

        assert!(state.apply_remote_delete(record.id));
        let snap = state.snapshot();
        assert!(snap.reactions.is_empty());
        assert!(snap.read_receipts.is_empty());
        assert!(snap.pinned.is_empty());
    }

    #[test]
    fn reaction_add_is_idempotent() {
        let mut state = RoomState::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let record = msg(alice, 1, "hi");
        state.apply_remote_insert(record.clone());

        assert!(state.apply_reaction(record.id, "+1", bob, ReactionAction::Add));
        let once = state.snapshot().clone();
        assert!(!state.apply_reaction(record.id, "+1", bob, ReactionAction::Add));
        assert_eq!(state.snapshot(), &once);
    }

    #[test]
    fn reaction_add_then_remove_restores_index() {
        let mut state = RoomState::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let record = msg(alice, 1, "hi");
        state.apply_remote_insert(record.clone());
        state.apply_reaction(record.id, "heart", alice, ReactionAction::Add);
        let before = state.snapshot().reactions.clone();

        state.apply_reaction(record.id, "+1", bob, ReactionAction::Add);
        state.apply_reaction(record.id, "+1", bob, ReactionAction::Remove);
        assert_eq!(state.snapshot().reactions, before);

        state.apply_reaction(record.id, "heart", alice, ReactionAction::Remove);
        assert!(state.snapshot().reactions.is_empty());
        assert!(!state.apply_reaction(record.id, "heart", alice, ReactionAction::Remove));
    }

    #[test]
    fn two_reactors_share_a_key() {
        let mut state = RoomState::new();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let record = msg(alice, 1, "hi");
        state.apply_remote_insert(record.clone());

        state.apply_reaction(record.id, "+1", bob, ReactionAction::Add);
        state.apply_reaction(record.id, "+1", carol, ReactionAction::Add);

        let groups = state.snapshot().reaction_groups(&record.id);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 2);
        assert!(groups[0].user_ids.contains(&bob));
        assert!(groups[0].user_ids.contains(&carol));
    }

    #[test]
    fn indices_ignore_unknown_messages() {
        let mut state = RoomState::new();
        let ghost = Uuid::new_v4();
        assert!(!state.apply_reaction(ghost, "+1", Uuid::new_v4(), ReactionAction::Add));
        assert!(!state.apply_pin(ghost, PinAction::Pin));
        assert!(!state.apply_read_receipt(Uuid::new_v4(), ghost));
        assert_eq!(state.snapshot(), &RoomSnapshot::default());
    }

    #[test]
    fn pin_and_unpin_are_idempotent() {
        let mut state = RoomState::new();
        let record = msg(Uuid::new_v4(), 1, "hi");
        state.apply_remote_insert(record.clone());

        assert!(state.apply_pin(record.id, PinAction::Pin));
        assert!(!state.apply_pin(record.id, PinAction::Pin));
        assert_eq!(state.snapshot().pinned_messages().len(), 1);
        assert!(state.apply_pin(record.id, PinAction::Unpin));
        assert!(!state.apply_pin(record.id, PinAction::Unpin));
    }

    #[test]
    fn read_receipt_marks_backward_from_last_read() {
        let mut state = RoomState::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let m1 = msg(alice, 1, "one");
        let m2 = msg(bob, 2, "two");
        let m3 = msg(alice, 3, "three");
        let m4 = msg(alice, 4, "four");
        for m in [&m1, &m2, &m3, &m4] {
            state.apply_remote_insert(m.clone());
        }

        assert!(state.apply_read_receipt(bob, m3.id));
        let snap = state.snapshot();
        assert!(snap.readers(&m1.id).unwrap().contains(&bob));
        assert!(snap.readers(&m3.id).unwrap().contains(&bob));
        assert!(snap.readers(&m2.id).is_none(), "reader's own message is not marked");
        assert!(snap.readers(&m4.id).is_none(), "nothing after last read is marked");

        // monotonic: an older receipt never unmarks
        assert!(!state.apply_read_receipt(bob, m1.id));
        assert!(state.snapshot().readers(&m3.id).unwrap().contains(&bob));
    }

    #[test]
    fn read_receipt_over_marks_interleaved_senders() {
        let mut state = RoomState::new();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let from_carol = msg(carol, 1, "earlier");
        let from_alice = msg(alice, 2, "later");
        state.apply_remote_insert(from_carol.clone());
        state.apply_remote_insert(from_alice.clone());

        state.apply_read_receipt(bob, from_alice.id);
        assert!(state.snapshot().readers(&from_carol.id).unwrap().contains(&bob));
    }

    #[test]
    fn optimistic_commit_swaps_in_place() {
        let mut state = RoomState::new();
        let me = Uuid::new_v4();
        state.apply_remote_insert(msg(Uuid::new_v4(), 1, "earlier"));

        let draft = msg(me, 2, "hello");
        let handle = state.apply_optimistic_insert(draft.clone());
        assert!(state.snapshot().messages.last().unwrap().is_pending());

        let mut record = draft.clone();
        record.created_at = at(3);
        assert!(state.commit_optimistic(handle, record.clone()));

        let snap = state.snapshot();
        assert_eq!(snap.messages.len(), 2);
        assert_eq!(snap.messages[1].message, record);
        assert!(state.is_committed(&draft.id));
        assert!(snap.messages.iter().all(|e| !e.is_pending()));
    }

    #[test]
    fn commit_after_feed_delivery_leaves_one_entry() {
        let mut state = RoomState::new();
        let me = Uuid::new_v4();
        let draft = msg(me, 2, "hello");
        let handle = state.apply_optimistic_insert(draft.clone());

        let mut record = draft;
        record.created_at = at(3);
        state.apply_remote_insert(record.clone());
        assert_eq!(state.snapshot().messages.len(), 1);
        assert!(!state.snapshot().messages[0].is_pending());

        state.commit_optimistic(handle, record.clone());
        assert_eq!(state.snapshot().messages.len(), 1);
        assert_eq!(state.snapshot().messages[0].message, record);
        assert!(!state.snapshot().messages[0].is_pending());
    }

    #[test]
    fn pending_entries_refuse_reactions_and_pins() {
        let mut state = RoomState::new();
        let me = Uuid::new_v4();
        let draft = msg(me, 1, "hello");
        let handle = state.apply_optimistic_insert(draft.clone());

        assert!(!state.is_committed(&draft.id));
        assert!(!state.apply_reaction(draft.id, "+1", me, ReactionAction::Add));
        assert!(!state.apply_pin(draft.id, PinAction::Pin));
        assert!(state.snapshot().reactions.is_empty());
        assert!(state.snapshot().pinned.is_empty());

        let mut record = draft.clone();
        record.created_at = at(2);
        assert!(state.commit_optimistic(handle, record));
        assert!(state.is_committed(&draft.id));
        assert!(state.apply_reaction(draft.id, "+1", me, ReactionAction::Add));
        assert!(state.apply_pin(draft.id, PinAction::Pin));

        let snap = state.snapshot();
        assert!(snap.reactions.keys().all(|id| snap.contains(id)));
        assert!(snap.pinned.iter().all(|id| snap.contains(id)));
    }

    #[test]
    fn discard_removes_placeholder() {
        let mut state = RoomState::new();
        let handle = state.apply_optimistic_insert(msg(Uuid::new_v4(), 1, "hello"));

        assert!(state.discard_optimistic(handle));
        assert!(state.snapshot().messages.is_empty());
        assert!(!state.discard_optimistic(handle));
    }

    #[test]
    fn placeholder_stays_sorted_behind_future_tail() {
        let mut state = RoomState::new();
        state.apply_remote_insert(msg(Uuid::new_v4(), 100, "from the future"));
        state.apply_optimistic_insert(msg(Uuid::new_v4(), 1, "mine"));
        assert_sorted_unique(&state);
    }

    #[test]
    fn remote_message_clears_sender_typing() {
        let mut state = RoomState::new();
        let alice = Uuid::new_v4();
        let now = Instant::now();
        state.apply_typing(alice, "Alice", true, now, Duration::from_secs(5));

        state.apply_remote_insert(msg(alice, 1, "done typing"));
        assert!(state.snapshot().typing.is_empty());
    }

    #[test]
    fn presence_sync_replaces_wholesale() {
        let mut state = RoomState::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(state.apply_presence_sync([a, b].into_iter().collect()));
        assert!(state.apply_presence_sync([c].into_iter().collect()));
        assert!(!state.snapshot().is_online(&a));
        assert!(state.snapshot().is_online(&c));
        assert!(!state.apply_presence_sync([c].into_iter().collect()));
    }

    #[test]
    fn resync_keeps_placeholders_and_prunes_indices() {
        let mut state = RoomState::new();
        let (alice, me) = (Uuid::new_v4(), Uuid::new_v4());
        let kept = msg(alice, 1, "kept");
        let gone = msg(alice, 2, "gone");
        state.apply_remote_insert(kept.clone());
        state.apply_remote_insert(gone.clone());
        state.apply_pin(gone.id, PinAction::Pin);
        state.apply_reaction(kept.id, "+1", me, ReactionAction::Add);
        state.apply_optimistic_insert(msg(me, 3, "in flight"));

        let missed = msg(alice, 4, "sent while offline");
        assert!(state.resync(vec![missed.clone(), kept.clone(), kept.clone()]));

        let snap = state.snapshot();
        let contents: Vec<&str> = snap.messages().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["kept", "in flight", "sent while offline"]);
        assert!(snap.pinned.is_empty());
        assert_eq!(snap.reaction_groups(&kept.id).len(), 1);
        assert_sorted_unique(&state);
    }

    #[test]
    fn resync_drops_placeholder_already_in_history() {
        let mut state = RoomState::new();
        let me = Uuid::new_v4();
        let draft = msg(me, 1, "hello");
        state.apply_optimistic_insert(draft.clone());

        let mut stored = draft.clone();
        stored.created_at = at(2);
        assert!(state.resync(vec![stored.clone()]));

        let snap = state.snapshot();
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(snap.messages[0].message, stored);
        assert!(!snap.messages[0].is_pending());
    }

    #[test]
    fn search_is_case_insensitive_and_ordered() {
        let mut state = RoomState::new();
        let alice = Uuid::new_v4();
        state.apply_remote_insert(msg(alice, 2, "Lunch at noon?"));
        state.apply_remote_insert(msg(alice, 1, "lunch tomorrow"));
        state.apply_remote_insert(msg(alice, 3, "dinner"));

        let hits: Vec<&str> = state
            .snapshot()
            .search("LUNCH")
            .into_iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(hits, vec!["lunch tomorrow", "Lunch at noon?"]);
        assert!(state.snapshot().search("  ").is_empty());
    }
}
