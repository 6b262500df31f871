//! Typing indicator lifecycle.
//!
//! Remote side: `TypingSet` holds one entry per user with an expiry. A `true`
//! broadcast creates or refreshes it, a `false` broadcast or a committed
//! message from that user removes it, and `sweep` drops anything past its
//! expiry. Stop events are not guaranteed to arrive, so expiry is the backstop.
//!
//! Local side: `TypingDebouncer` decides when this client announces
//! `isTyping` for its own keystrokes.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub display_name: String,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingSet {
    entries: BTreeMap<Uuid, TypingEntry>,
}

impl TypingSet {
    /// Apply a remote typing broadcast. Returns true if the set changed.
    pub fn apply(
        &mut self,
        user_id: Uuid,
        display_name: &str,
        is_typing: bool,
        now: Instant,
        ttl: Duration,
    ) -> bool {
        if !is_typing {
            return self.entries.remove(&user_id).is_some();
        }

        let entry = TypingEntry {
            display_name: display_name.to_string(),
            expires_at: now + ttl,
        };
        self.entries.insert(user_id, entry.clone()) != Some(entry)
    }

    /// A committed message supersedes the indicator.
    pub fn clear(&mut self, user_id: Uuid) -> bool {
        self.entries.remove(&user_id).is_some()
    }

    /// Drop every entry whose expiry has passed. Returns the users removed.
    pub fn sweep(&mut self, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(user_id, _)| *user_id)
            .collect();

        for user_id in &expired {
            self.entries.remove(user_id);
        }
        expired
    }

    /// Users typing as of `now`, even if the sweep has not run yet.
    pub fn active(&self, now: Instant) -> impl Iterator<Item = (Uuid, &TypingEntry)> + '_ {
        self.entries
            .iter()
            .filter(move |(_, entry)| entry.expires_at > now)
            .map(|(user_id, entry)| (*user_id, entry))
    }

    pub fn get(&self, user_id: &Uuid) -> Option<&TypingEntry> {
        self.entries.get(user_id)
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.entries.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the local client should broadcast about its own typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

impl TypingSignal {
    pub fn is_typing(self) -> bool {
        matches!(self, Self::Start)
    }
}

/// Local keystroke debouncer.
///
/// `Start` goes out on the first keystroke and again at most once per window
/// while typing continues, so the remote TTL never lapses mid-sentence.
/// `Stop` goes out once a full window passes with no keystroke. Every
/// keystroke moves the deadline; it never stacks.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    window: Duration,
    last_announced: Option<Instant>,
    deadline: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_announced: None,
            deadline: None,
        }
    }

    pub fn on_keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        self.deadline = Some(now + self.window);

        let due = match self.last_announced {
            None => true,
            Some(at) => now.duration_since(at) >= self.window,
        };
        if due {
            self.last_announced = Some(now);
            Some(TypingSignal::Start)
        } else {
            None
        }
    }

    /// When the session should call `poll` next, if a stop is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.stop(),
            _ => None,
        }
    }

    /// Stop right away (message sent, input cleared, session closing).
    pub fn stop(&mut self) -> Option<TypingSignal> {
        self.deadline = None;
        self.last_announced.take().map(|_| TypingSignal::Stop)
    }

    pub fn is_announced(&self) -> bool {
        self.last_announced.is_some()
    }
}
