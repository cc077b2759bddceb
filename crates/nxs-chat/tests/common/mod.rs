#![allow(dead_code)]

use nxs_backend::{row, Backend, MemoryBackend};
use nxs_chat::{schema, ChatService, EventBus, Profiles, SystemSettings};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(2);

pub struct Harness {
    pub memory: Arc<MemoryBackend>,
    pub backend: Arc<dyn Backend>,
    pub settings: Arc<RwLock<SystemSettings>>,
    pub events: EventBus,
    pub profiles: Arc<Profiles>,
    pub chats: ChatService,
}

pub fn harness() -> Harness {
    let memory = Arc::new(schema::memory_backend());
    let backend: Arc<dyn Backend> = memory.clone();
    let settings = Arc::new(RwLock::new(SystemSettings::default()));
    let events = EventBus::default();
    let profiles = Arc::new(Profiles::new(backend.clone()));
    let chats = ChatService::new(
        backend.clone(),
        profiles.clone(),
        settings.clone(),
        events.clone(),
    );
    Harness {
        memory,
        backend,
        settings,
        events,
        profiles,
        chats,
    }
}

impl Harness {
    pub async fn user(&self, id: &str, username: &str) {
        self.backend
            .insert(
                schema::USERS,
                vec![row([
                    ("id", json!(id)),
                    ("username", json!(username)),
                    ("full_name", json!(username.to_uppercase())),
                    ("email", json!(format!("{}@example.com", username))),
                ])],
            )
            .await
            .unwrap();
    }
}
