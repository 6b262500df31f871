use uuid::Uuid;

/// Subscription-level failures. Always transient: the session backs off and
/// resubscribes, then resyncs the full room state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("channel timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("channel transport error: {0}")]
    Transport(String),
}

/// Message store write/read failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("message store rejected the write: {0}")]
    Rejected(String),

    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    #[error("upload rejected with status {status}")]
    Status { status: u16 },

    #[error("upload transport error: {0}")]
    Transport(String),

    #[error("upload response missing url")]
    MissingUrl,
}

/// Errors surfaced to whoever called into the room handle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("nothing to send")]
    Empty,

    /// The store refused the insert. The placeholder has been removed and
    /// `text` is the draft that was submitted.
    #[error("send failed: {source}")]
    Persistence {
        text: String,
        #[source]
        source: StoreError,
    },

    /// An image-only message whose upload failed.
    #[error("attachment upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("room session closed")]
    SessionClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeleteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("room session closed")]
    SessionClosed,
}
