//! Random pairing: a shared waiting queue and the per-user search state.

use crate::error::{ChatError, Result};
use crate::messaging::ChatService;
use crate::models::{Chat, ChatParticipant, ChatType, RandomQueueEntry, User};
use crate::schema::{self, CHATS, CHAT_PARTICIPANTS, RANDOM_CHAT_QUEUE};
use crate::settings::SystemSettings;
use chrono::Utc;
use nxs_backend::{row, Backend, ChangeFilter, ChangeKind, Query};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Attempts at claiming a waiting entry before queueing.
const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RandomMatch {
    pub chat: Chat,
    pub peer_id: String,
    pub peer: Option<User>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Matched(RandomMatch),
    Waiting(RandomQueueEntry),
}

#[derive(Clone)]
pub struct RandomPairing {
    chats: ChatService,
    settings: Arc<RwLock<SystemSettings>>,
}

impl RandomPairing {
    pub fn new(chats: ChatService, settings: Arc<RwLock<SystemSettings>>) -> Self {
        Self { chats, settings }
    }

    fn backend(&self) -> &Arc<dyn Backend> {
        self.chats.backend()
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.settings.read().allow_random_chat {
            Ok(())
        } else {
            Err(ChatError::Disabled("Random chat".to_string()))
        }
    }

    /// Join the queue, pairing with the longest-waiting user if there is
    /// one.
    pub async fn start(&self, user_id: &str) -> Result<StartOutcome> {
        self.ensure_enabled()?;

        // Leftover entries from an earlier search must not be matched.
        self.backend()
            .update(
                RANDOM_CHAT_QUEUE,
                &Query::new().eq("user_id", user_id).eq("is_waiting", true),
                row([("is_waiting", json!(false))]),
            )
            .await?;

        let entry: RandomQueueEntry = schema::first_row(
            RANDOM_CHAT_QUEUE,
            self.backend()
                .insert(RANDOM_CHAT_QUEUE, vec![row([("user_id", json!(user_id))])])
                .await?,
        )?;

        // Only the newer of two entries claims. The older one waits, so
        // simultaneous searchers cannot pair into two different chats.
        for _ in 0..CLAIM_ATTEMPTS {
            let Some(other) = self.oldest_waiting_before(&entry).await? else {
                break;
            };
            if !self.claim(&entry).await? {
                // A newer searcher took us and is creating the chat.
                tracing::debug!("[Random] {} claimed while searching", user_id);
                return Ok(StartOutcome::Waiting(entry));
            }
            if !self.claim(&other).await? {
                self.release(&entry).await?;
                continue;
            }

            let chat = match self
                .chats
                .create_chat_of_type(ChatType::Random, &[user_id, &other.user_id])
                .await
            {
                Ok(chat) => chat,
                Err(e) => {
                    self.release(&other).await?;
                    return Err(e);
                }
            };
            self.backend()
                .update(
                    RANDOM_CHAT_QUEUE,
                    &Query::new().is_in("id", [entry.id.as_str(), other.id.as_str()]),
                    row([("matched_at", json!(Utc::now()))]),
                )
                .await?;
            tracing::info!("[Random] paired {} with {} in {}", user_id, other.user_id, chat.id);
            let peer = self.chats.profiles().get(&other.user_id).await?;
            return Ok(StartOutcome::Matched(RandomMatch {
                chat,
                peer_id: other.user_id,
                peer,
            }));
        }

        tracing::debug!("[Random] {} waiting as {}", user_id, entry.id);
        Ok(StartOutcome::Waiting(entry))
    }

    /// Longest-waiting entry of another user queued before `entry`.
    async fn oldest_waiting_before(
        &self,
        entry: &RandomQueueEntry,
    ) -> Result<Option<RandomQueueEntry>> {
        let rows = self
            .backend()
            .select(
                RANDOM_CHAT_QUEUE,
                &Query::new()
                    .eq("is_waiting", true)
                    .neq("user_id", entry.user_id.as_str())
                    .lte("created_at", entry.created_at.to_rfc3339())
                    .order("created_at", true)
                    .order("id", true)
                    .limit(CLAIM_ATTEMPTS + 1),
            )
            .await?;
        let older = schema::decode_rows::<RandomQueueEntry>(RANDOM_CHAT_QUEUE, rows)?
            .into_iter()
            .find(|other| queued_before(other, entry));
        Ok(older)
    }

    /// Take `entry` off the queue. `false` when another searcher got it
    /// first.
    async fn claim(&self, entry: &RandomQueueEntry) -> Result<bool> {
        let claimed = self
            .backend()
            .update(
                RANDOM_CHAT_QUEUE,
                &Query::new()
                    .eq("id", entry.id.as_str())
                    .eq("is_waiting", true),
                row([("is_waiting", json!(false))]),
            )
            .await?;
        Ok(!claimed.is_empty())
    }

    /// Put a claimed, unmatched entry back on the queue.
    async fn release(&self, entry: &RandomQueueEntry) -> Result<()> {
        self.backend()
            .update(
                RANDOM_CHAT_QUEUE,
                &Query::new()
                    .eq("id", entry.id.as_str())
                    .is_null("matched_at"),
                row([("is_waiting", json!(true))]),
            )
            .await?;
        Ok(())
    }

    /// Wait until another user pairs with `entry`. `None` on timeout.
    pub async fn wait_for_match(
        &self,
        entry: &RandomQueueEntry,
        timeout: Duration,
    ) -> Result<Option<RandomMatch>> {
        let mut stream = self
            .backend()
            .subscribe(
                ChangeFilter::table(RANDOM_CHAT_QUEUE)
                    .on(ChangeKind::Update)
                    .eq("id", entry.id.as_str()),
            )
            .await?;

        // The match may have landed before the subscription did.
        let current: Option<RandomQueueEntry> = schema::decode_rows(
            RANDOM_CHAT_QUEUE,
            self.backend()
                .select(RANDOM_CHAT_QUEUE, &Query::new().eq("id", entry.id.as_str()))
                .await?,
        )?
        .into_iter()
        .next();
        if current.as_ref().is_some_and(|e| e.matched_at.is_some()) {
            return self.resolve_match(&entry.user_id).await;
        }

        let matched = tokio::time::timeout(timeout, async {
            while let Some(event) = stream.recv().await {
                let matched_at = event
                    .new
                    .as_ref()
                    .and_then(|r| r.get("matched_at"))
                    .is_some_and(|v| !v.is_null());
                if matched_at {
                    return true;
                }
            }
            false
        })
        .await;

        match matched {
            Ok(true) => self.resolve_match(&entry.user_id).await,
            Ok(false) => Err(nxs_backend::BackendError::SubscriptionClosed.into()),
            Err(_) => {
                tracing::debug!("[Random] no match for {} within {:?}", entry.user_id, timeout);
                Ok(None)
            }
        }
    }

    /// The newest random chat of `user_id` and its other participant.
    async fn resolve_match(&self, user_id: &str) -> Result<Option<RandomMatch>> {
        let mine: Vec<ChatParticipant> = schema::decode_rows(
            CHAT_PARTICIPANTS,
            self.backend()
                .select(
                    CHAT_PARTICIPANTS,
                    &Query::new().eq("user_id", user_id).eq("is_active", true),
                )
                .await?,
        )?;
        if mine.is_empty() {
            return Ok(None);
        }
        let chat_ids: Vec<String> = mine.into_iter().map(|p| p.chat_id).collect();
        let chat: Option<Chat> = schema::decode_rows(
            CHATS,
            self.backend()
                .select(
                    CHATS,
                    &Query::new()
                        .is_in("id", chat_ids)
                        .eq("type", "random")
                        .order("created_at", false)
                        .limit(1),
                )
                .await?,
        )?
        .into_iter()
        .next();
        let Some(chat) = chat else {
            return Ok(None);
        };

        let others: Vec<ChatParticipant> = schema::decode_rows(
            CHAT_PARTICIPANTS,
            self.backend()
                .select(
                    CHAT_PARTICIPANTS,
                    &Query::new()
                        .eq("chat_id", chat.id.as_str())
                        .neq("user_id", user_id)
                        .limit(1),
                )
                .await?,
        )?;
        let Some(peer_id) = others.into_iter().next().map(|p| p.user_id) else {
            return Ok(None);
        };
        let peer = self.chats.profiles().get(&peer_id).await?;
        Ok(Some(RandomMatch {
            chat,
            peer_id,
            peer,
        }))
    }

    /// Leave the queue.
    pub async fn cancel(&self, entry: &RandomQueueEntry) -> Result<()> {
        self.backend()
            .update(
                RANDOM_CHAT_QUEUE,
                &Query::new()
                    .eq("id", entry.id.as_str())
                    .eq("is_waiting", true),
                row([("is_waiting", json!(false))]),
            )
            .await?;
        Ok(())
    }

    /// End participation in a chat.
    pub async fn leave(&self, chat_id: &str, user_id: &str) -> Result<()> {
        self.backend()
            .update(
                CHAT_PARTICIPANTS,
                &Query::new().eq("chat_id", chat_id).eq("user_id", user_id),
                row([
                    ("is_active", json!(false)),
                    ("left_at", json!(Utc::now())),
                ]),
            )
            .await?;
        tracing::info!("[Random] {} left {}", user_id, chat_id);
        Ok(())
    }
}

/// Queue order: creation time, then id.
fn queued_before(a: &RandomQueueEntry, b: &RandomQueueEntry) -> bool {
    (a.created_at, a.id.as_str()) < (b.created_at, b.id.as_str())
}

#[derive(Debug, Clone, PartialEq)]
pub enum RandomState {
    Idle,
    Searching(RandomQueueEntry),
    Connected(RandomMatch),
    Disconnected(RandomMatch),
}

/// One user's way through a random chat.
pub struct RandomChat {
    pairing: RandomPairing,
    user_id: String,
    state: RandomState,
}

impl RandomChat {
    pub fn new(pairing: RandomPairing, user_id: impl Into<String>) -> Self {
        Self {
            pairing,
            user_id: user_id.into(),
            state: RandomState::Idle,
        }
    }

    pub fn state(&self) -> &RandomState {
        &self.state
    }

    pub fn peer(&self) -> Option<&RandomMatch> {
        match &self.state {
            RandomState::Connected(m) | RandomState::Disconnected(m) => Some(m),
            _ => None,
        }
    }

    /// Search for a partner. Back to `Idle` when nobody shows up in time.
    pub async fn search(&mut self, timeout: Duration) -> Result<&RandomState> {
        if matches!(self.state, RandomState::Searching(_) | RandomState::Connected(_)) {
            return Err(ChatError::validation("Already searching or connected"));
        }
        match self.pairing.start(&self.user_id).await? {
            StartOutcome::Matched(m) => self.state = RandomState::Connected(m),
            StartOutcome::Waiting(entry) => {
                self.state = RandomState::Searching(entry.clone());
                match self.pairing.wait_for_match(&entry, timeout).await {
                    Ok(Some(m)) => self.state = RandomState::Connected(m),
                    Ok(None) => {
                        self.pairing.cancel(&entry).await?;
                        self.state = RandomState::Idle;
                    }
                    Err(e) => {
                        self.state = RandomState::Idle;
                        self.pairing.cancel(&entry).await?;
                        return Err(e);
                    }
                }
            }
        }
        Ok(&self.state)
    }

    pub async fn cancel(&mut self) -> Result<()> {
        if let RandomState::Searching(entry) = &self.state {
            self.pairing.cancel(entry).await?;
            self.state = RandomState::Idle;
        }
        Ok(())
    }

    /// Leave the current chat.
    pub async fn leave(&mut self) -> Result<()> {
        let RandomState::Connected(m) = &self.state else {
            return Err(ChatError::validation("Not connected"));
        };
        self.pairing.leave(&m.chat.id, &self.user_id).await?;
        let m = m.clone();
        self.state = RandomState::Disconnected(m);
        Ok(())
    }

    /// Forget a finished chat.
    pub fn reset(&mut self) {
        if matches!(self.state, RandomState::Disconnected(_)) {
            self.state = RandomState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::profiles::Profiles;
    use crate::schema::{memory_backend, USERS};
    use async_trait::async_trait;
    use bytes::Bytes;
    use nxs_backend::{ChangeStream, MemoryBackend, Row};

    /// Suspends before every call, like a backend behind a network.
    struct Yielding(Arc<MemoryBackend>);

    #[async_trait]
    impl Backend for Yielding {
        async fn select(&self, table: &str, query: &Query) -> nxs_backend::Result<Vec<Row>> {
            tokio::task::yield_now().await;
            self.0.select(table, query).await
        }

        async fn insert(&self, table: &str, rows: Vec<Row>) -> nxs_backend::Result<Vec<Row>> {
            tokio::task::yield_now().await;
            self.0.insert(table, rows).await
        }

        async fn update(
            &self,
            table: &str,
            query: &Query,
            patch: Row,
        ) -> nxs_backend::Result<Vec<Row>> {
            tokio::task::yield_now().await;
            self.0.update(table, query, patch).await
        }

        async fn delete(&self, table: &str, query: &Query) -> nxs_backend::Result<Vec<Row>> {
            tokio::task::yield_now().await;
            self.0.delete(table, query).await
        }

        async fn count(&self, table: &str, query: &Query) -> nxs_backend::Result<u64> {
            tokio::task::yield_now().await;
            self.0.count(table, query).await
        }

        async fn subscribe(&self, filter: ChangeFilter) -> nxs_backend::Result<ChangeStream> {
            self.0.subscribe(filter).await
        }

        async fn upload(
            &self,
            bucket: &str,
            path: &str,
            data: Bytes,
            content_type: &str,
        ) -> nxs_backend::Result<String> {
            self.0.upload(bucket, path, data, content_type).await
        }

        async fn download(&self, bucket: &str, path: &str) -> nxs_backend::Result<Bytes> {
            self.0.download(bucket, path).await
        }

        fn public_url(&self, bucket: &str, path: &str) -> String {
            self.0.public_url(bucket, path)
        }
    }

    async fn pairing(allow: bool) -> RandomPairing {
        pairing_on(Arc::new(memory_backend()), allow).await
    }

    async fn pairing_on(backend: Arc<dyn Backend>, allow: bool) -> RandomPairing {
        for (id, name) in [("u1", "alice"), ("u2", "bob"), ("u3", "carol")] {
            backend
                .insert(USERS, vec![row([("id", json!(id)), ("username", json!(name))])])
                .await
                .unwrap();
        }
        let settings = Arc::new(RwLock::new(SystemSettings {
            allow_random_chat: allow,
            ..SystemSettings::default()
        }));
        let chats = ChatService::new(
            backend.clone(),
            Arc::new(Profiles::new(backend)),
            settings.clone(),
            EventBus::default(),
        );
        RandomPairing::new(chats, settings)
    }

    #[tokio::test]
    async fn test_disabled() {
        let pairing = pairing(false).await;
        assert!(matches!(pairing.start("u1").await, Err(ChatError::Disabled(_))));
    }

    #[tokio::test]
    async fn test_second_searcher_pairs_with_first() {
        let pairing = pairing(true).await;
        let StartOutcome::Waiting(entry) = pairing.start("u1").await.unwrap() else {
            panic!("first searcher should wait");
        };
        let StartOutcome::Matched(m) = pairing.start("u2").await.unwrap() else {
            panic!("second searcher should match");
        };
        assert_eq!(m.peer_id, "u1");
        assert_eq!(m.chat.chat_type, ChatType::Random);

        let found = pairing
            .wait_for_match(&entry, Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.chat.id, m.chat.id);
        assert_eq!(found.peer.unwrap().username, "bob");

        // Both are off the queue now.
        let StartOutcome::Waiting(_) = pairing.start("u3").await.unwrap() else {
            panic!("nobody should be waiting");
        };
    }

    #[tokio::test]
    async fn test_waiter_is_notified_live() {
        let pairing = pairing(true).await;
        let StartOutcome::Waiting(entry) = pairing.start("u1").await.unwrap() else {
            panic!("first searcher should wait");
        };
        let waiter = {
            let pairing = pairing.clone();
            tokio::spawn(async move { pairing.wait_for_match(&entry, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pairing.start("u2").await.unwrap();
        let found = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(found.peer_id, "u2");
    }

    #[tokio::test]
    async fn test_search_times_out_back_to_idle() {
        let pairing = pairing(true).await;
        let mut chat = RandomChat::new(pairing.clone(), "u1");
        let state = chat.search(Duration::from_millis(30)).await.unwrap();
        assert_eq!(state, &RandomState::Idle);

        // The cancelled entry is not matched later.
        assert!(matches!(pairing.start("u2").await.unwrap(), StartOutcome::Waiting(_)));
    }

    #[tokio::test]
    async fn test_state_machine_connect_and_leave() {
        let pairing = pairing(true).await;
        pairing.start("u2").await.unwrap();

        let mut chat = RandomChat::new(pairing, "u1");
        assert!(matches!(
            chat.search(Duration::from_millis(50)).await.unwrap(),
            RandomState::Connected(_)
        ));
        assert!(chat.search(Duration::from_millis(50)).await.is_err());
        assert_eq!(chat.peer().unwrap().peer_id, "u2");

        chat.leave().await.unwrap();
        assert!(matches!(chat.state(), RandomState::Disconnected(_)));
        chat.reset();
        assert_eq!(chat.state(), &RandomState::Idle);
        assert!(chat.leave().await.is_err());
    }

    #[tokio::test]
    async fn test_simultaneous_searchers_share_one_chat() {
        let memory = Arc::new(memory_backend());
        let pairing = pairing_on(Arc::new(Yielding(memory.clone())), true).await;

        let (first, second) = tokio::join!(pairing.start("u1"), pairing.start("u2"));
        let mut chat_ids = Vec::new();
        for outcome in [first.unwrap(), second.unwrap()] {
            let found = match outcome {
                StartOutcome::Matched(m) => m,
                StartOutcome::Waiting(entry) => pairing
                    .wait_for_match(&entry, Duration::from_secs(1))
                    .await
                    .unwrap()
                    .expect("waiting searcher should be paired"),
            };
            chat_ids.push(found.chat.id);
        }
        assert_eq!(chat_ids[0], chat_ids[1]);

        let random_chats = memory
            .count(CHATS, &Query::new().eq("type", "random"))
            .await
            .unwrap();
        assert_eq!(random_chats, 1);
        let waiting = memory
            .count(RANDOM_CHAT_QUEUE, &Query::new().eq("is_waiting", true))
            .await
            .unwrap();
        assert_eq!(waiting, 0);
    }
}
