//! Ephemeral status updates and the story-style viewer.

use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, EventBus};
use crate::models::{Status, StatusWithUser, Visibility};
use crate::profiles::Profiles;
use crate::schema::{self, STATUS, STATUS_VIEWS};
use crate::settings::SystemSettings;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nxs_backend::{row, Backend, ChangeFilter, ChangeStream, Query};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Time each status stays on screen in the viewer.
pub const STATUS_DISPLAY_DURATION: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct StatusService {
    backend: Arc<dyn Backend>,
    profiles: Arc<Profiles>,
    settings: Arc<RwLock<SystemSettings>>,
    events: EventBus,
}

impl StatusService {
    pub fn new(
        backend: Arc<dyn Backend>,
        profiles: Arc<Profiles>,
        settings: Arc<RwLock<SystemSettings>>,
        events: EventBus,
    ) -> Self {
        Self {
            backend,
            profiles,
            settings,
            events,
        }
    }

    pub async fn post_status(
        &self,
        user_id: &str,
        content: &str,
        visibility: Visibility,
    ) -> Result<Status> {
        let (max_len, expiry_hours) = {
            let s = self.settings.read();
            (s.max_status_length, s.status_expiry_hours)
        };
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::validation("Status cannot be empty"));
        }
        if content.chars().count() > max_len {
            return Err(ChatError::validation(format!(
                "Status is too long (max {} characters)",
                max_len
            )));
        }

        let expires_at = Utc::now() + ChronoDuration::hours(i64::from(expiry_hours));
        let rows = self
            .backend
            .insert(
                STATUS,
                vec![row([
                    ("user_id", json!(user_id)),
                    ("content", json!(content)),
                    ("visibility", json!(visibility)),
                    ("expires_at", json!(expires_at)),
                ])],
            )
            .await?;
        let status: Status = schema::first_row(STATUS, rows)?;
        tracing::info!("[Status] {} posted {}", user_id, status.id);
        Ok(status)
    }

    /// Unexpired statuses, newest first, with their authors.
    pub async fn active_statuses(&self, now: DateTime<Utc>) -> Result<Vec<StatusWithUser>> {
        let rows = self
            .backend
            .select(
                STATUS,
                &Query::new()
                    .gte("expires_at", json!(now))
                    .order("created_at", false),
            )
            .await?;
        let statuses: Vec<Status> = schema::decode_rows(STATUS, rows)?;
        let author_ids: Vec<String> = statuses.iter().map(|s| s.user_id.clone()).collect();
        let authors = self.profiles.get_many(&author_ids).await?;
        Ok(statuses
            .into_iter()
            .map(|status| StatusWithUser {
                user: authors.get(&status.user_id).cloned(),
                status,
            })
            .collect())
    }

    /// Record that `viewer_id` saw `status`. Returns `false` when nothing
    /// was recorded: own status, or already viewed.
    pub async fn record_view(&self, status: &Status, viewer_id: &str) -> Result<bool> {
        if status.user_id == viewer_id {
            return Ok(false);
        }
        let inserted = self
            .backend
            .insert(
                STATUS_VIEWS,
                vec![row([
                    ("status_id", json!(status.id)),
                    ("viewer_id", json!(viewer_id)),
                ])],
            )
            .await;
        match inserted {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let views = self
            .backend
            .count(STATUS_VIEWS, &Query::new().eq("status_id", status.id.as_str()))
            .await?;
        self.backend
            .update(
                STATUS,
                &Query::new().eq("id", status.id.as_str()),
                row([("views_count", json!(views))]),
            )
            .await?;
        Ok(true)
    }

    pub async fn delete_status(&self, status_id: &str, user_id: &str) -> Result<()> {
        let rows = self
            .backend
            .select(STATUS, &Query::new().eq("id", status_id).limit(1))
            .await?;
        let status: Status = schema::first_row(STATUS, rows)
            .map_err(|_| ChatError::not_found(format!("status {}", status_id)))?;
        if status.user_id != user_id {
            return Err(ChatError::forbidden("only the author can delete a status"));
        }
        self.backend
            .delete(STATUS, &Query::new().eq("id", status_id))
            .await?;
        Ok(())
    }

    /// Keep the active feed current. Any change to the status table
    /// reloads it.
    pub async fn watch(&self) -> Result<StatusFeed> {
        let stream = self.backend.subscribe(ChangeFilter::table(STATUS)).await?;
        let statuses = self.active_statuses(Utc::now()).await?;
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(FeedState {
            statuses: Mutex::new(statuses),
            revision,
        });
        let task = tokio::spawn(run_status_feed(self.clone(), Arc::clone(&shared), stream));
        Ok(StatusFeed { shared, task })
    }
}

struct FeedState {
    statuses: Mutex<Vec<StatusWithUser>>,
    revision: watch::Sender<u64>,
}

pub struct StatusFeed {
    shared: Arc<FeedState>,
    task: JoinHandle<()>,
}

impl StatusFeed {
    pub fn statuses(&self) -> Vec<StatusWithUser> {
        self.shared.statuses.lock().clone()
    }

    /// Wait for the next reload. Returns `false` on timeout.
    pub async fn changed(&self, timeout: Duration) -> bool {
        let mut revision = self.shared.revision.subscribe();
        matches!(
            tokio::time::timeout(timeout, revision.changed()).await,
            Ok(Ok(()))
        )
    }
}

impl Drop for StatusFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_status_feed(service: StatusService, shared: Arc<FeedState>, mut stream: ChangeStream) {
    while let Some(event) = stream.recv().await {
        tracing::debug!("[Status] {} on {:?}, reloading feed", event.kind, event.id());
        match service.active_statuses(Utc::now()).await {
            Ok(statuses) => {
                *shared.statuses.lock() = statuses;
                shared.revision.send_modify(|r| *r += 1);
                service.events.emit(ChatEvent::StatusFeedChanged);
            }
            Err(e) => tracing::warn!("[Status] feed reload failed: {}", e),
        }
    }
}

/// What a tick of the viewer did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerStep {
    /// Still on the same status.
    Showing,
    /// Moved on to the next status.
    Advanced,
    /// Ran past the last status.
    Finished,
}

/// Cursor over a status feed, advancing on a fixed timer.
#[derive(Debug, Clone)]
pub struct StatusViewer {
    statuses: Vec<StatusWithUser>,
    index: usize,
    elapsed: Duration,
    duration: Duration,
}

impl StatusViewer {
    /// Start at `start_id`, or the first status when it is `None` or
    /// missing. `None` for an empty feed.
    pub fn new(statuses: Vec<StatusWithUser>, start_id: Option<&str>) -> Option<Self> {
        if statuses.is_empty() {
            return None;
        }
        let index = start_id
            .and_then(|id| statuses.iter().position(|s| s.status.id == id))
            .unwrap_or(0);
        Some(Self {
            statuses,
            index,
            elapsed: Duration::ZERO,
            duration: STATUS_DISPLAY_DURATION,
        })
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration.max(Duration::from_millis(1));
        self
    }

    pub fn current(&self) -> &StatusWithUser {
        &self.statuses[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Fraction of the current status shown so far, `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        (self.elapsed.as_secs_f32() / self.duration.as_secs_f32()).min(1.0)
    }

    pub fn next(&mut self) -> bool {
        if self.index + 1 < self.statuses.len() {
            self.index += 1;
            self.elapsed = Duration::ZERO;
            true
        } else {
            false
        }
    }

    pub fn prev(&mut self) -> bool {
        self.elapsed = Duration::ZERO;
        if self.index > 0 {
            self.index -= 1;
            true
        } else {
            false
        }
    }

    /// Let `dt` pass. At 100% the viewer moves to the next status.
    pub fn tick(&mut self, dt: Duration) -> ViewerStep {
        self.elapsed += dt;
        if self.elapsed < self.duration {
            return ViewerStep::Showing;
        }
        if self.next() {
            ViewerStep::Advanced
        } else {
            self.elapsed = self.duration;
            ViewerStep::Finished
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{memory_backend, USERS};

    async fn service() -> StatusService {
        let backend: Arc<dyn Backend> = Arc::new(memory_backend());
        for (id, name) in [("u1", "alice"), ("u2", "bob")] {
            backend
                .insert(USERS, vec![row([("id", json!(id)), ("username", json!(name))])])
                .await
                .unwrap();
        }
        StatusService::new(
            backend.clone(),
            Arc::new(Profiles::new(backend)),
            Arc::new(RwLock::new(SystemSettings::default())),
            EventBus::default(),
        )
    }

    fn feed(ids: &[&str]) -> Vec<StatusWithUser> {
        ids.iter()
            .map(|id| StatusWithUser {
                status: Status {
                    id: id.to_string(),
                    user_id: "u1".into(),
                    content: "hi".into(),
                    visibility: Visibility::Anyone,
                    created_at: Utc::now(),
                    expires_at: Utc::now(),
                    views_count: 0,
                },
                user: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_post_validates_and_sets_expiry() {
        let service = service().await;
        assert!(service.post_status("u1", "   ", Visibility::Anyone).await.is_err());
        assert!(service
            .post_status("u1", &"x".repeat(501), Visibility::Anyone)
            .await
            .is_err());

        let status = service
            .post_status("u1", " at the beach ", Visibility::Contacts)
            .await
            .unwrap();
        assert_eq!(status.content, "at the beach");
        assert_eq!(status.visibility, Visibility::Contacts);
        let hours = (status.expires_at - status.created_at).num_minutes();
        assert!((24 * 60 - 1..=24 * 60).contains(&hours));
    }

    #[tokio::test]
    async fn test_active_feed_excludes_expired() {
        let service = service().await;
        service.post_status("u1", "first", Visibility::Anyone).await.unwrap();
        service.post_status("u2", "second", Visibility::Anyone).await.unwrap();

        let feed = service.active_statuses(Utc::now()).await.unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].status.content, "second");
        assert_eq!(feed[0].user.as_ref().unwrap().username, "bob");

        let later = Utc::now() + ChronoDuration::hours(25);
        assert!(service.active_statuses(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_views_are_counted_once_per_viewer() {
        let service = service().await;
        let status = service.post_status("u1", "hello", Visibility::Anyone).await.unwrap();

        assert!(!service.record_view(&status, "u1").await.unwrap());
        assert!(service.record_view(&status, "u2").await.unwrap());
        assert!(!service.record_view(&status, "u2").await.unwrap());

        let feed = service.active_statuses(Utc::now()).await.unwrap();
        assert_eq!(feed[0].status.views_count, 1);
    }

    #[tokio::test]
    async fn test_delete_is_author_only() {
        let service = service().await;
        let status = service.post_status("u1", "bye", Visibility::Anyone).await.unwrap();
        assert!(matches!(
            service.delete_status(&status.id, "u2").await,
            Err(ChatError::Forbidden(_))
        ));
        service.delete_status(&status.id, "u1").await.unwrap();
        assert!(matches!(
            service.delete_status(&status.id, "u1").await,
            Err(ChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_reloads_on_change() {
        let service = service().await;
        let feed = service.watch().await.unwrap();
        assert!(feed.statuses().is_empty());

        let waiter = feed.changed(Duration::from_secs(2));
        let post = service.post_status("u2", "new", Visibility::Anyone);
        let (changed, posted) = tokio::join!(waiter, post);
        posted.unwrap();
        assert!(changed);
        assert_eq!(feed.statuses().len(), 1);
    }

    #[test]
    fn test_viewer_navigation_and_auto_advance() {
        assert!(StatusViewer::new(Vec::new(), None).is_none());

        let mut viewer = StatusViewer::new(feed(&["a", "b", "c"]), Some("b")).unwrap();
        assert_eq!(viewer.current().status.id, "b");
        assert!(viewer.prev());
        assert!(!viewer.prev());

        assert_eq!(viewer.tick(Duration::from_millis(2500)), ViewerStep::Showing);
        assert!((viewer.progress() - 0.5).abs() < 1e-6);
        assert_eq!(viewer.tick(Duration::from_millis(2500)), ViewerStep::Advanced);
        assert_eq!(viewer.current().status.id, "b");
        assert_eq!(viewer.progress(), 0.0);

        assert!(viewer.next());
        assert!(!viewer.next());
        assert_eq!(viewer.tick(STATUS_DISPLAY_DURATION), ViewerStep::Finished);
        assert_eq!(viewer.progress(), 1.0);

        let unknown = StatusViewer::new(feed(&["a"]), Some("zz")).unwrap();
        assert_eq!(unknown.index(), 0);
    }
}
