use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use haven_gateway::{HttpContentStore, LocalHub, MemoryContentStore, local_adapters};
use haven_room::adapters::ContentStore;
use haven_room::{RoomConfig, RoomHandle, RoomNotice, RoomSession, RoomSnapshot};
use haven_types::events::{PinAction, ReactionAction};
use haven_types::models::Participant;

/// Two clients on one in-process hub, walking through a short conversation.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven=debug,haven_room=debug,haven_gateway=debug".into()),
        )
        .init();

    // Config
    let config = RoomConfig::from_env()?;
    let content: Arc<dyn ContentStore> = match std::env::var("HAVEN_CONTENT_URL") {
        Ok(url) => {
            info!("Uploading attachments to {}", url);
            let store = HttpContentStore::new(url);
            match std::env::var("HAVEN_CONTENT_TOKEN") {
                Ok(token) => Arc::new(store.with_token(token)),
                Err(_) => Arc::new(store),
            }
        }
        Err(_) => Arc::new(MemoryContentStore::new()),
    };

    let hub = LocalHub::new();
    let room_id = Uuid::new_v4();
    let alice = Participant::new(Uuid::new_v4(), "Alice");
    let bob = Participant::new(Uuid::new_v4(), "Bob");
    let roster = vec![alice.clone(), bob.clone()];

    let alice_session = RoomSession::open(
        room_id,
        alice.clone(),
        roster.clone(),
        local_adapters(&hub, alice.id, content.clone()),
        config.clone(),
    );
    let bob_session = RoomSession::open(
        room_id,
        bob.clone(),
        roster,
        local_adapters(&hub, bob.id, content),
        config.clone(),
    );
    let (a, b) = (alice_session.handle(), bob_session.handle());
    tokio::spawn(log_notices("Alice", a.clone()));
    tokio::spawn(log_notices("Bob", b.clone()));

    settle().await;

    a.set_input("hey @B");
    settle().await;
    a.select_mention(bob.id);
    settle().await;
    a.set_input(format!("{}want to grab lunch?", a.composer().text));
    let question = a.submit(None).await?;
    settle().await;

    b.set_reply_target(Some(question.id));
    b.set_input("sure, noon?");
    settle().await;
    info!("Alice sees typing: {:?}", typing_names(&a.snapshot()));
    let answer = b.submit(None).await?;

    a.react(answer.id, "👍", ReactionAction::Add);
    b.pin(question.id, PinAction::Pin);
    settle().await;

    hub.drop_connections(room_id).await;
    tokio::time::sleep(config.reconnect_backoff + Duration::from_millis(500)).await;

    for (name, handle) in [("Alice", &a), ("Bob", &b)] {
        describe(name, &handle.snapshot(), &config);
    }

    alice_session.shutdown().await;
    bob_session.shutdown().await;
    Ok(())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn log_notices(name: &'static str, handle: RoomHandle) {
    let mut notices = handle.notices();
    while let Ok(notice) = notices.recv().await {
        match notice {
            RoomNotice::Disconnected { reason } => warn!("{}: disconnected ({})", name, reason),
            other => info!("{}: {:?}", name, other),
        }
    }
}

fn typing_names(snapshot: &RoomSnapshot) -> Vec<String> {
    snapshot
        .typing
        .active(tokio::time::Instant::now())
        .map(|(_, entry)| entry.display_name.clone())
        .collect()
}

fn describe(name: &str, snapshot: &RoomSnapshot, config: &RoomConfig) {
    info!(
        "{}: {} messages, {} online, {} pinned, streak {}",
        name,
        snapshot.messages.len(),
        snapshot.presence.len(),
        snapshot.pinned.len(),
        snapshot.streak(Utc::now(), &config.streak),
    );
    for message in snapshot.messages() {
        let reactions = snapshot.reaction_groups(&message.id);
        let readers = snapshot.readers(&message.id).map_or(0, |r| r.len());
        info!(
            "  [{}] {}: {} (reactions: {}, read by {})",
            message.created_at.format("%H:%M:%S"),
            message.sender_id,
            message.content,
            serde_json::to_string(&reactions).unwrap_or_default(),
            readers,
        );
    }
}
