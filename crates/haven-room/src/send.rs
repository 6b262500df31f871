//! Optimistic send pipeline.
//!
//! `Drafting --submit--> PendingRemote --ok--> Committed`
//! `PendingRemote --err--> Drafting (text restored)`
//!
//! The session takes a `Submission` out of the composer, places a placeholder,
//! and runs `deliver` off the loop. The returned `Delivery` carries the
//! placeholder's handle back so the session resolves it directly.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use haven_types::models::{Message, NewMessage, Participant};

use crate::adapters::{ContentStore, MessageStore};
use crate::error::{SendError, UploadError};
use crate::reconciler::PendingHandle;

/// An image picked to go with the next message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub bytes: Bytes,
    pub content_type: String,
}

/// The input buffer and everything derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposerState {
    pub text: String,
    pub reply_to: Option<Uuid>,
    /// Mention suggestions for the trailing `@token`, if any.
    pub mentions: Vec<Participant>,
}

/// What was in the composer at the moment of submit.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Client-chosen message id, shared by the placeholder and the stored record.
    pub id: Uuid,
    /// Trimmed content that is actually sent.
    pub text: String,
    /// The buffer exactly as typed, for restoring after a failure.
    pub draft: String,
    pub reply_to: Option<Uuid>,
    pub attachment: Option<Attachment>,
}

impl Submission {
    /// Take the draft out of the composer, clearing it. Blank drafts without
    /// an attachment are refused and the composer is left alone.
    pub fn take(
        composer: &mut ComposerState,
        attachment: Option<Attachment>,
    ) -> Result<Self, SendError> {
        if composer.text.trim().is_empty() && attachment.is_none() {
            return Err(SendError::Empty);
        }

        let draft = std::mem::take(&mut composer.text);
        let reply_to = composer.reply_to.take();
        composer.mentions.clear();

        Ok(Self {
            id: Uuid::new_v4(),
            text: draft.trim().to_string(),
            draft,
            reply_to,
            attachment,
        })
    }

    /// The local stand-in shown until the store answers.
    pub fn placeholder(&self, room_id: Uuid, sender_id: Uuid, now: DateTime<Utc>) -> Message {
        Message {
            id: self.id,
            room_id,
            sender_id,
            content: self.text.clone(),
            image_url: None,
            reply_to_id: self.reply_to,
            created_at: now,
        }
    }

    /// Put the draft back after a failed send, unless the user already started
    /// a new one. Returns true if the composer changed.
    pub fn restore_into(&self, composer: &mut ComposerState) -> bool {
        if !composer.text.is_empty() {
            return false;
        }
        composer.text = self.draft.clone();
        composer.reply_to = self.reply_to;
        true
    }
}

/// Result of one delivery attempt, routed back to the session loop.
#[derive(Debug)]
pub struct Delivery {
    pub handle: PendingHandle,
    pub submission: Submission,
    /// Set when the attachment failed but the text went ahead anyway.
    pub upload_error: Option<UploadError>,
    pub result: Result<Message, SendError>,
}

/// Upload the attachment (if any), then insert. Never retries.
pub async fn deliver(
    store: Arc<dyn MessageStore>,
    content: Arc<dyn ContentStore>,
    room_id: Uuid,
    sender_id: Uuid,
    handle: PendingHandle,
    submission: Submission,
) -> Delivery {
    let mut upload_error = None;
    let mut image_url = None;

    if let Some(attachment) = &submission.attachment {
        match content
            .upload(attachment.bytes.clone(), &attachment.content_type)
            .await
        {
            Ok(url) => image_url = Some(url),
            Err(e) => {
                warn!("Attachment upload failed, sending text only: {}", e);
                upload_error = Some(e);
            }
        }
    }

    if submission.text.is_empty() && image_url.is_none() {
        let error = upload_error.take().unwrap_or(UploadError::MissingUrl);
        return Delivery {
            handle,
            submission,
            upload_error: None,
            result: Err(SendError::Upload(error)),
        };
    }

    let request = NewMessage {
        id: submission.id,
        room_id,
        sender_id,
        content: submission.text.clone(),
        image_url,
        reply_to_id: submission.reply_to,
    };

    let result = match store.insert(request).await {
        Ok(record) => {
            debug!("Message {} committed in room {}", record.id, room_id);
            Ok(record)
        }
        Err(source) => {
            warn!("Insert into room {} failed: {}", room_id, source);
            Err(SendError::Persistence {
                text: submission.draft.clone(),
                source,
            })
        }
    };

    Delivery {
        handle,
        submission,
        upload_error,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream, StreamExt};
    use haven_types::events::ChangeFeedEvent;

    use crate::error::{ChannelError, StoreError};
    use crate::reconciler::RoomState;

    #[derive(Default)]
    struct FakeStore {
        fail: bool,
        inserted: Mutex<Vec<NewMessage>>,
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
            if self.fail {
                return Err(StoreError::Rejected("disk full".into()));
            }
            self.inserted.lock().unwrap().push(message.clone());
            Ok(message.into_message(Utc::now()))
        }

        async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
            Err(StoreError::NotFound(id))
        }

        async fn query(&self, _room_id: Uuid) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }

        async fn subscribe(
            &self,
            _room_id: Uuid,
        ) -> Result<BoxStream<'static, ChangeFeedEvent>, ChannelError> {
            Ok(stream::empty().boxed())
        }
    }

    struct FakeContent {
        fail: bool,
    }

    #[async_trait]
    impl ContentStore for FakeContent {
        async fn upload(&self, _bytes: Bytes, _content_type: &str) -> Result<String, UploadError> {
            if self.fail {
                Err(UploadError::Status { status: 503 })
            } else {
                Ok("https://cdn.example/img.png".into())
            }
        }
    }

    fn draft(text: &str) -> ComposerState {
        ComposerState {
            text: text.into(),
            ..ComposerState::default()
        }
    }

    fn image() -> Option<Attachment> {
        Some(Attachment {
            bytes: Bytes::from_static(b"\x89PNG"),
            content_type: "image/png".into(),
        })
    }

    #[test]
    fn submit_clears_composer() {
        let reply = Uuid::new_v4();
        let mut composer = ComposerState {
            text: "  hello  ".into(),
            reply_to: Some(reply),
            mentions: vec![Participant::new(Uuid::new_v4(), "John")],
        };

        let submission = Submission::take(&mut composer, None).unwrap();
        assert_eq!(submission.text, "hello");
        assert_eq!(submission.reply_to, Some(reply));
        assert_eq!(composer, ComposerState::default());
    }

    #[test]
    fn blank_submit_is_refused() {
        let mut composer = draft("   ");
        assert!(matches!(Submission::take(&mut composer, None), Err(SendError::Empty)));
        assert_eq!(composer.text, "   ");
    }

    #[test]
    fn restore_only_into_empty_composer() {
        let mut composer = draft("  hello \n");
        let submission = Submission::take(&mut composer, None).unwrap();
        assert_eq!(submission.text, "hello");

        assert!(submission.restore_into(&mut composer));
        assert_eq!(composer.text, "  hello \n");

        let mut busy = draft("new draft");
        assert!(!submission.restore_into(&mut busy));
        assert_eq!(busy.text, "new draft");
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_placeholder() {
        let mut state = RoomState::new();
        let mut input = draft("hello");
        let (room, me) = (Uuid::new_v4(), Uuid::new_v4());

        let submission = Submission::take(&mut input, None).unwrap();
        let handle = state.apply_optimistic_insert(submission.placeholder(room, me, Utc::now()));
        assert_eq!(state.snapshot().messages.len(), 1);

        let store = Arc::new(FakeStore {
            fail: true,
            ..FakeStore::default()
        });
        let content = Arc::new(FakeContent { fail: false });
        let delivery = deliver(store, content, room, me, handle, submission).await;

        let Err(SendError::Persistence { text, .. }) = &delivery.result else {
            panic!("expected persistence error, got {:?}", delivery.result);
        };
        assert_eq!(text, "hello");

        state.discard_optimistic(delivery.handle);
        delivery.submission.restore_into(&mut input);
        assert!(state.snapshot().messages.is_empty());
        assert_eq!(input.text, "hello");
    }

    #[tokio::test]
    async fn upload_failure_degrades_to_text() {
        let store = Arc::new(FakeStore::default());
        let mut input = draft("look at this");
        let submission = Submission::take(&mut input, image()).unwrap();

        let mut state = RoomState::new();
        let placeholder = submission.placeholder(Uuid::nil(), Uuid::nil(), Utc::now());
        let handle = state.apply_optimistic_insert(placeholder);
        let delivery = deliver(
            store.clone(),
            Arc::new(FakeContent { fail: true }),
            Uuid::nil(),
            Uuid::nil(),
            handle,
            submission,
        )
        .await;

        assert!(matches!(delivery.upload_error, Some(UploadError::Status { status: 503 })));
        let record = delivery.result.unwrap();
        assert_eq!(record.content, "look at this");
        assert_eq!(record.image_url, None);
        assert_eq!(store.inserted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn image_only_with_failed_upload_sends_nothing() {
        let store = Arc::new(FakeStore::default());
        let mut input = draft("");
        let submission = Submission::take(&mut input, image()).unwrap();

        let mut state = RoomState::new();
        let placeholder = submission.placeholder(Uuid::nil(), Uuid::nil(), Utc::now());
        let handle = state.apply_optimistic_insert(placeholder);
        let delivery = deliver(
            store.clone(),
            Arc::new(FakeContent { fail: true }),
            Uuid::nil(),
            Uuid::nil(),
            handle,
            submission,
        )
        .await;

        assert!(matches!(delivery.result, Err(SendError::Upload(_))));
        assert!(store.inserted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn uploaded_image_url_goes_with_message() {
        let store = Arc::new(FakeStore::default());
        let mut input = draft("");
        let submission = Submission::take(&mut input, image()).unwrap();

        let mut state = RoomState::new();
        let placeholder = submission.placeholder(Uuid::nil(), Uuid::nil(), Utc::now());
        let draft_id = placeholder.id;
        let handle = state.apply_optimistic_insert(placeholder);
        let delivery = deliver(
            store,
            Arc::new(FakeContent { fail: false }),
            Uuid::nil(),
            Uuid::nil(),
            handle,
            submission,
        )
        .await;

        assert!(delivery.upload_error.is_none());
        let record = delivery.result.unwrap();
        assert_eq!(record.image_url.as_deref(), Some("https://cdn.example/img.png"));
        assert_eq!(record.id, draft_id);
        assert!(state.commit_optimistic(delivery.handle, record));
        assert!(!state.snapshot().messages[0].is_pending());
    }
}
