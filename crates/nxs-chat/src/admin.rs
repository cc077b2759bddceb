//! Administrative console: login, user management, moderation, analytics
//! and system settings.

use crate::error::{ChatError, Result};
use crate::models::{Admin, Analytics, Message, MessageWithSender, Status, StatusWithUser, User};
use crate::profiles::Profiles;
use crate::schema::{
    self, ADMINS, ANALYTICS, CHATS, CHAT_PARTICIPANTS, MESSAGES, STATUS, USERS,
};
use crate::settings::SystemSettings;
use chrono::{Days, Utc};
use nxs_backend::{row, Backend, Filter, Query};
use parking_lot::RwLock;
use serde_json::json;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub const MODERATION_LIMIT: usize = 50;
pub const RECENT_USERS_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSession {
    pub id: String,
    pub username: String,
    pub role: Option<String>,
    pub is_super_admin: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardStats {
    pub total_users: u64,
    pub online_users: u64,
    pub total_chats: u64,
    pub total_messages: u64,
    pub active_statuses: u64,
    pub recent_users: Vec<User>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserDetails {
    pub user: User,
    pub chat_count: u64,
    pub message_count: u64,
    pub status_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Message,
    Status,
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "message" | "messages" => Ok(ContentKind::Message),
            "status" | "statuses" => Ok(ContentKind::Status),
            other => Err(format!("unknown content kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Period {
    #[default]
    Week,
    Month,
    All,
}

impl Period {
    fn days(self) -> Option<u64> {
        match self {
            Period::Week => Some(7),
            Period::Month => Some(30),
            Period::All => None,
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "7d" => Ok(Period::Week),
            "30d" => Ok(Period::Month),
            "all" => Ok(Period::All),
            other => Err(format!("unknown period: {} (use 7d, 30d or all)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Totals {
    pub users: u64,
    pub messages: u64,
    pub statuses: u64,
    pub chats: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsReport {
    pub period: Period,
    pub rows: Vec<Analytics>,
    pub totals: Totals,
}

pub struct AdminService {
    backend: Arc<dyn Backend>,
    profiles: Arc<Profiles>,
    settings: Arc<RwLock<SystemSettings>>,
    settings_file: PathBuf,
    session: RwLock<Option<AdminSession>>,
    hash_cost: u32,
}

impl AdminService {
    pub fn new(
        backend: Arc<dyn Backend>,
        profiles: Arc<Profiles>,
        settings: Arc<RwLock<SystemSettings>>,
        settings_file: PathBuf,
    ) -> Self {
        Self {
            backend,
            profiles,
            settings,
            settings_file,
            session: RwLock::new(None),
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// bcrypt cost for passwords created through [`Self::create_admin`].
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    pub fn session(&self) -> Option<AdminSession> {
        self.session.read().clone()
    }

    fn require(&self) -> Result<AdminSession> {
        self.session()
            .ok_or_else(|| ChatError::forbidden("admin login required"))
    }

    /// Add an admin account with a bcrypt-hashed password.
    pub async fn create_admin(
        &self,
        username: &str,
        email: &str,
        password: &str,
        is_super_admin: bool,
    ) -> Result<Admin> {
        let hash = bcrypt::hash(password, self.hash_cost)
            .map_err(|e| ChatError::Local(anyhow::anyhow!("password hashing failed: {}", e)))?;
        let rows = self
            .backend
            .insert(
                ADMINS,
                vec![row([
                    ("username", json!(username)),
                    ("email", json!(email)),
                    ("password_hash", json!(hash)),
                    ("role", json!(if is_super_admin { "super_admin" } else { "admin" })),
                    ("is_super_admin", json!(is_super_admin)),
                ])],
            )
            .await?;
        schema::first_row(ADMINS, rows)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AdminSession> {
        let invalid = || ChatError::forbidden("invalid username or password");
        let rows = self
            .backend
            .select(
                ADMINS,
                &Query::new()
                    .eq("username", username.trim())
                    .eq("is_active", true)
                    .limit(1),
            )
            .await?;
        let Some(admin) = schema::decode_rows::<Admin>(ADMINS, rows)?.into_iter().next() else {
            return Err(invalid());
        };
        match bcrypt::verify(password, &admin.password_hash) {
            Ok(true) => {}
            Ok(false) => return Err(invalid()),
            Err(e) => {
                tracing::warn!("[Admin] unusable password hash for {}: {}", admin.username, e);
                return Err(invalid());
            }
        }

        self.backend
            .update(
                ADMINS,
                &Query::new().eq("id", admin.id.as_str()),
                row([("last_login", json!(Utc::now()))]),
            )
            .await?;
        let session = AdminSession {
            id: admin.id,
            username: admin.username,
            role: admin.role,
            is_super_admin: admin.is_super_admin,
        };
        *self.session.write() = Some(session.clone());
        tracing::info!("[Admin] {} logged in", session.username);
        Ok(session)
    }

    pub fn logout(&self) {
        *self.session.write() = None;
    }

    pub async fn dashboard(&self) -> Result<DashboardStats> {
        self.require()?;
        let everything = Query::new();
        let total_users = self.backend.count(USERS, &everything).await?;
        let online_users = self
            .backend
            .count(USERS, &Query::new().eq("is_online", true))
            .await?;
        let total_chats = self.backend.count(CHATS, &everything).await?;
        let total_messages = self.backend.count(MESSAGES, &everything).await?;
        let active_statuses = self
            .backend
            .count(STATUS, &Query::new().gte("expires_at", json!(Utc::now())))
            .await?;
        let recent_users = schema::decode_rows(
            USERS,
            self.backend
                .select(
                    USERS,
                    &Query::new()
                        .order("created_at", false)
                        .limit(RECENT_USERS_LIMIT),
                )
                .await?,
        )?;
        Ok(DashboardStats {
            total_users,
            online_users,
            total_chats,
            total_messages,
            active_statuses,
            recent_users,
        })
    }

    pub async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<User>> {
        self.require()?;
        let rows = self
            .backend
            .select(
                USERS,
                &Query::new()
                    .order("created_at", false)
                    .limit(limit)
                    .offset(offset),
            )
            .await?;
        schema::decode_rows(USERS, rows)
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<User>> {
        self.require()?;
        let query = query.trim();
        if query.is_empty() {
            return self.list_users(50, 0).await;
        }
        let pattern = format!("%{}%", query);
        let rows = self
            .backend
            .select(
                USERS,
                &Query::new()
                    .or(vec![
                        Filter::ilike("username", pattern.clone()),
                        Filter::ilike("full_name", pattern.clone()),
                        Filter::ilike("email", pattern),
                    ])
                    .order("created_at", false),
            )
            .await?;
        schema::decode_rows(USERS, rows)
    }

    pub async fn set_banned(&self, user_id: &str, banned: bool) -> Result<User> {
        let admin = self.require()?;
        let rows = self
            .backend
            .update(
                USERS,
                &Query::new().eq("id", user_id),
                row([("is_banned", json!(banned))]),
            )
            .await?;
        let user: User = schema::first_row(USERS, rows)
            .map_err(|_| ChatError::not_found(format!("user {}", user_id)))?;
        self.profiles.remember(user.clone());
        tracing::info!("[Admin] {} set banned={} on {}", admin.username, banned, user_id);
        Ok(user)
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let admin = self.require()?;
        let removed = self
            .backend
            .delete(USERS, &Query::new().eq("id", user_id))
            .await?;
        if removed.is_empty() {
            return Err(ChatError::not_found(format!("user {}", user_id)));
        }
        self.profiles.forget(user_id);
        tracing::info!("[Admin] {} deleted user {}", admin.username, user_id);
        Ok(())
    }

    pub async fn user_details(&self, user_id: &str) -> Result<UserDetails> {
        self.require()?;
        let user = self
            .profiles
            .fetch(user_id)
            .await?
            .ok_or_else(|| ChatError::not_found(format!("user {}", user_id)))?;
        let chat_count = self
            .backend
            .count(CHAT_PARTICIPANTS, &Query::new().eq("user_id", user_id))
            .await?;
        let message_count = self
            .backend
            .count(MESSAGES, &Query::new().eq("sender_id", user_id))
            .await?;
        let status_count = self
            .backend
            .count(STATUS, &Query::new().eq("user_id", user_id))
            .await?;
        Ok(UserDetails {
            user,
            chat_count,
            message_count,
            status_count,
        })
    }

    /// Newest messages across all chats, for review.
    pub async fn recent_messages(&self) -> Result<Vec<MessageWithSender>> {
        self.require()?;
        let rows = self
            .backend
            .select(
                MESSAGES,
                &Query::new()
                    .order("created_at", false)
                    .limit(MODERATION_LIMIT),
            )
            .await?;
        let messages: Vec<Message> = schema::decode_rows(MESSAGES, rows)?;
        let ids: Vec<String> = messages.iter().map(|m| m.sender_id.clone()).collect();
        let senders = self.profiles.get_many(&ids).await?;
        Ok(messages
            .into_iter()
            .map(|m| {
                let sender = senders.get(&m.sender_id).cloned();
                MessageWithSender::new(m, sender)
            })
            .collect())
    }

    pub async fn recent_statuses(&self) -> Result<Vec<StatusWithUser>> {
        self.require()?;
        let rows = self
            .backend
            .select(
                STATUS,
                &Query::new()
                    .order("created_at", false)
                    .limit(MODERATION_LIMIT),
            )
            .await?;
        let statuses: Vec<Status> = schema::decode_rows(STATUS, rows)?;
        let ids: Vec<String> = statuses.iter().map(|s| s.user_id.clone()).collect();
        let authors = self.profiles.get_many(&ids).await?;
        Ok(statuses
            .into_iter()
            .map(|status| StatusWithUser {
                user: authors.get(&status.user_id).cloned(),
                status,
            })
            .collect())
    }

    /// Remove a message or status outright.
    pub async fn delete_content(&self, kind: ContentKind, id: &str) -> Result<()> {
        let admin = self.require()?;
        let table = match kind {
            ContentKind::Message => MESSAGES,
            ContentKind::Status => STATUS,
        };
        let removed = self.backend.delete(table, &Query::new().eq("id", id)).await?;
        if removed.is_empty() {
            return Err(ChatError::not_found(format!("{} {}", table, id)));
        }
        tracing::info!("[Admin] {} removed {} {}", admin.username, table, id);
        Ok(())
    }

    pub async fn analytics(&self, period: Period) -> Result<AnalyticsReport> {
        self.require()?;
        let mut query = Query::new().order("date", true);
        if let Some(days) = period.days() {
            let start = Utc::now()
                .date_naive()
                .checked_sub_days(Days::new(days))
                .unwrap_or_default();
            query = query.gte("date", start.to_string());
        }
        let rows = schema::decode_rows(ANALYTICS, self.backend.select(ANALYTICS, &query).await?)?;

        let everything = Query::new();
        let totals = Totals {
            users: self.backend.count(USERS, &everything).await?,
            messages: self.backend.count(MESSAGES, &everything).await?,
            statuses: self.backend.count(STATUS, &everything).await?,
            chats: self.backend.count(CHATS, &everything).await?,
        };
        Ok(AnalyticsReport {
            period,
            rows,
            totals,
        })
    }

    pub fn settings(&self) -> SystemSettings {
        self.settings.read().clone()
    }

    /// Validate, persist and apply new settings.
    pub fn update_settings(&self, settings: SystemSettings) -> Result<()> {
        let admin = self.require()?;
        settings.save(&self.settings_file)?;
        *self.settings.write() = settings;
        tracing::info!("[Admin] {} updated system settings", admin.username);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::memory_backend;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    async fn admin_service(dir: &std::path::Path) -> (Arc<dyn Backend>, AdminService) {
        let backend: Arc<dyn Backend> = Arc::new(memory_backend());
        let service = AdminService::new(
            backend.clone(),
            Arc::new(Profiles::new(backend.clone())),
            Arc::new(RwLock::new(SystemSettings::default())),
            dir.join("settings.json"),
        )
        .with_hash_cost(4);
        service
            .create_admin("root", "root@nxs.chat", "S3cret!pass", true)
            .await
            .unwrap();
        (backend, service)
    }

    async fn seed_user(backend: &Arc<dyn Backend>, id: &str, username: &str) {
        backend
            .insert(
                USERS,
                vec![row([
                    ("id", json!(id)),
                    ("username", json!(username)),
                    ("email", json!(format!("{}@example.com", username))),
                ])],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_login_checks_bcrypt_hash() {
        let dir = tempdir().unwrap();
        let (backend, service) = admin_service(dir.path()).await;
        assert!(matches!(service.dashboard().await, Err(ChatError::Forbidden(_))));
        assert!(service.login("root", "wrong").await.is_err());
        assert!(service.login("nobody", "S3cret!pass").await.is_err());

        let session = service.login("root", "S3cret!pass").await.unwrap();
        assert!(session.is_super_admin);
        assert_eq!(session.role.as_deref(), Some("super_admin"));

        let admins: Vec<Admin> =
            schema::decode_rows(ADMINS, backend.select(ADMINS, &Query::new()).await.unwrap()).unwrap();
        assert!(admins[0].last_login.is_some());
        assert_ne!(admins[0].password_hash, "S3cret!pass");
    }

    #[tokio::test]
    async fn test_inactive_admin_cannot_login() {
        let dir = tempdir().unwrap();
        let (backend, service) = admin_service(dir.path()).await;
        backend
            .update(
                ADMINS,
                &Query::new().eq("username", "root"),
                row([("is_active", json!(false))]),
            )
            .await
            .unwrap();
        assert!(service.login("root", "S3cret!pass").await.is_err());
    }

    #[tokio::test]
    async fn test_dashboard_and_user_management() {
        let dir = tempdir().unwrap();
        let (backend, service) = admin_service(dir.path()).await;
        for i in 0..7 {
            seed_user(&backend, &format!("u{}", i), &format!("user{}", i)).await;
        }
        service.login("root", "S3cret!pass").await.unwrap();

        let stats = service.dashboard().await.unwrap();
        assert_eq!(stats.total_users, 7);
        assert_eq!(stats.recent_users.len(), RECENT_USERS_LIMIT);
        assert_eq!(stats.recent_users[0].username, "user6");

        assert_eq!(service.search_users("USER3").await.unwrap().len(), 1);
        assert_eq!(service.search_users("example.com").await.unwrap().len(), 7);
        assert_eq!(service.list_users(3, 5).await.unwrap().len(), 2);

        assert!(service.set_banned("u1", true).await.unwrap().is_banned);
        service.delete_user("u2").await.unwrap();
        assert!(service.delete_user("u2").await.is_err());
        assert_eq!(service.dashboard().await.unwrap().total_users, 6);

        let details = service.user_details("u1").await.unwrap();
        assert_eq!(details.message_count, 0);
    }

    #[tokio::test]
    async fn test_moderation_and_analytics() {
        let dir = tempdir().unwrap();
        let (backend, service) = admin_service(dir.path()).await;
        service.login("root", "S3cret!pass").await.unwrap();
        seed_user(&backend, "u1", "alice").await;
        let rows = backend
            .insert(
                MESSAGES,
                vec![row([
                    ("chat_id", json!("c1")),
                    ("sender_id", json!("u1")),
                    ("content", json!("spam")),
                ])],
            )
            .await
            .unwrap();
        let message_id = rows[0]["id"].as_str().unwrap().to_string();

        let recent = service.recent_messages().await.unwrap();
        assert_eq!(recent[0].sender.as_ref().unwrap().username, "alice");
        service
            .delete_content(ContentKind::Message, &message_id)
            .await
            .unwrap();
        assert!(service.recent_messages().await.unwrap().is_empty());

        let today = Utc::now().date_naive();
        let old = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        for date in [old, today] {
            backend
                .insert(
                    ANALYTICS,
                    vec![row([("date", json!(date)), ("new_users", json!(1))])],
                )
                .await
                .unwrap();
        }
        let week = service.analytics("7d".parse().unwrap()).await.unwrap();
        assert_eq!(week.rows.len(), 1);
        assert_eq!(week.totals.users, 1);
        let all = service.analytics(Period::All).await.unwrap();
        assert_eq!(all.rows[0].date, old);
        assert!("1y".parse::<Period>().is_err());
    }

    #[tokio::test]
    async fn test_settings_update_persists() {
        let dir = tempdir().unwrap();
        let (_backend, service) = admin_service(dir.path()).await;
        let mut s = service.settings();
        s.allow_random_chat = false;
        assert!(service.update_settings(s.clone()).is_err());

        service.login("root", "S3cret!pass").await.unwrap();
        service.update_settings(s).unwrap();
        assert!(!service.settings().allow_random_chat);
        assert!(!SystemSettings::load(&dir.path().join("settings.json"))
            .unwrap()
            .allow_random_chat);

        let mut bad = service.settings();
        bad.status_expiry_hours = 500;
        assert!(service.update_settings(bad).is_err());
    }
}
