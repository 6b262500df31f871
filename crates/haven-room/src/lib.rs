pub mod adapters;
pub mod config;
pub mod error;
pub mod mention;
pub mod reconciler;
pub mod send;
pub mod session;
pub mod streak;
pub mod typing;

pub use adapters::{BroadcastChannel, ContentStore, MessageStore, PresenceChannel, RoomAdapters};
pub use config::{RoomConfig, StreakConfig};
pub use error::{ChannelError, ConfigError, DeleteError, SendError, StoreError, UploadError};
pub use reconciler::{RoomSnapshot, RoomState, TimelineEntry};
pub use send::{Attachment, ComposerState};
pub use session::{RoomHandle, RoomNotice, RoomSession};
