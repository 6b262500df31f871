pub mod content;
pub mod hub;

use std::sync::Arc;

use haven_room::adapters::{ContentStore, RoomAdapters};
use uuid::Uuid;

pub use content::{HttpContentStore, MemoryContentStore};
pub use hub::{HubClient, LocalHub};

/// Room adapters for `user_id` backed by one hub connection.
pub fn local_adapters(
    hub: &LocalHub,
    user_id: Uuid,
    content: Arc<dyn ContentStore>,
) -> RoomAdapters {
    let client = Arc::new(hub.connect(user_id));
    RoomAdapters {
        messages: client.clone(),
        broadcast: client.clone(),
        presence: client,
        content,
    }
}
