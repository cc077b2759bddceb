//! Sign-up, sign-in, persisted sessions and profile edits.

use crate::error::{ChatError, Result};
use crate::models::{Gender, ThemeSettings, User};
use crate::profiles::Profiles;
use crate::schema::{self, PROFILE_PICTURES_BUCKET, USERS};
use crate::validation::{normalize_username, SignUpForm};
use bytes::Bytes;
use chrono::{Duration, NaiveDate, Utc};
use nxs_backend::{row, AuthBackend, Backend, Query, Row, Session};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Refresh sessions this close to expiry.
const EXPIRY_LEEWAY_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub enum SignUpOutcome {
    SignedIn(User),
    /// The account exists but the email address must be confirmed before
    /// signing in.
    ConfirmationRequired { email: String },
}

/// Fields a user may change on their profile. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfilePatch {
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub bio: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
    pub is_profile_public: Option<bool>,
    pub theme_settings: Option<ThemeSettings>,
}

pub struct AccountService {
    backend: Arc<dyn Backend>,
    auth: Arc<dyn AuthBackend>,
    profiles: Arc<Profiles>,
    session_file: PathBuf,
    session: RwLock<Option<Session>>,
}

impl std::fmt::Debug for AccountService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountService")
            .field("session_file", &self.session_file)
            .field("signed_in", &self.session.read().is_some())
            .finish()
    }
}

impl AccountService {
    pub fn new(
        backend: Arc<dyn Backend>,
        auth: Arc<dyn AuthBackend>,
        profiles: Arc<Profiles>,
        session_file: PathBuf,
    ) -> Self {
        Self {
            backend,
            auth,
            profiles,
            session_file,
            session: RwLock::new(None),
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.user.id.clone())
    }

    /// The signed-in user's id, or an auth error.
    pub fn require_user_id(&self) -> Result<String> {
        self.current_user_id()
            .ok_or(ChatError::Backend(nxs_backend::BackendError::NotAuthenticated))
    }

    fn store_session(&self, session: Session) -> Result<()> {
        self.auth.set_access_token(Some(session.access_token.clone()));
        nxs_common::write_json(&self.session_file, &session)?;
        *self.session.write() = Some(session);
        Ok(())
    }

    fn clear_session(&self) -> Result<()> {
        self.auth.set_access_token(None);
        *self.session.write() = None;
        nxs_common::remove_file(&self.session_file)?;
        Ok(())
    }

    pub async fn is_username_available(&self, username: &str) -> Result<bool> {
        let username = normalize_username(username)?;
        self.profiles.is_username_available(&username).await
    }

    pub async fn sign_up(&self, form: &SignUpForm, username: &str) -> Result<SignUpOutcome> {
        let valid = form
            .validate()
            .map_err(|errors| ChatError::Validation(errors.to_string()))?;
        let username = normalize_username(username)?;
        if !self.profiles.is_username_available(&username).await? {
            return Err(ChatError::validation("Username is already taken"));
        }

        let response = self.auth.sign_up(&valid.email, &valid.password).await?;
        let signed_in = response.session.is_some();
        if let Some(session) = response.session {
            self.store_session(session)?;
        }

        let profile = row([
            ("id", json!(response.user.id)),
            ("email", json!(valid.email)),
            ("full_name", json!(valid.full_name)),
            ("username", json!(username)),
            ("date_of_birth", json!(valid.date_of_birth)),
            ("gender", json!(valid.gender)),
        ]);
        let user: User = schema::first_row(USERS, self.backend.insert(USERS, vec![profile]).await?)?;
        self.profiles.remember(user.clone());
        tracing::info!("[Account] signed up {} ({})", user.username, user.id);

        if signed_in {
            Ok(SignUpOutcome::SignedIn(user))
        } else {
            Ok(SignUpOutcome::ConfirmationRequired { email: valid.email })
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || password.is_empty() {
            return Err(ChatError::validation("Email and password are required"));
        }
        let session = self.auth.sign_in_with_password(&email, password).await?;
        let user_id = session.user.id.clone();
        self.store_session(session)?;

        let user = match self.profiles.fetch(&user_id).await? {
            Some(user) => user,
            None => {
                self.sign_out().await?;
                return Err(ChatError::not_found("profile for this account"));
            }
        };
        if user.is_banned {
            self.sign_out().await?;
            return Err(ChatError::forbidden("this account is banned"));
        }
        self.mark_online(&user_id, true).await;
        tracing::info!("[Account] signed in {}", user.username);
        Ok(user)
    }

    /// Resume the saved session, refreshing it when it is about to expire.
    pub async fn restore(&self) -> Result<Option<User>> {
        let saved: Option<Session> = match nxs_common::read_json(&self.session_file) {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!("[Account] discarding unreadable session: {}", e);
                self.clear_session()?;
                None
            }
        };
        let Some(mut session) = saved else {
            tracing::info!("[Account] no saved session");
            return Ok(None);
        };

        if session.is_expired(Utc::now(), Duration::seconds(EXPIRY_LEEWAY_SECS)) {
            match self.auth.refresh(&session.refresh_token).await {
                Ok(fresh) => session = fresh,
                Err(e) => {
                    tracing::warn!("[Account] session refresh failed: {}", e);
                    self.clear_session()?;
                    return Ok(None);
                }
            }
        }
        let user_id = session.user.id.clone();
        self.store_session(session)?;
        let user = self.profiles.fetch(&user_id).await?;
        tracing::info!("[Account] restored session for {}", user_id);
        Ok(user)
    }

    /// Sign out. Local state is cleared even when the platform call fails.
    pub async fn sign_out(&self) -> Result<()> {
        let Some(session) = self.session() else {
            return self.clear_session();
        };
        self.mark_online(&session.user.id, false).await;
        if let Err(e) = self.auth.sign_out(&session.access_token).await {
            tracing::warn!("[Account] remote sign-out failed: {}", e);
        }
        self.clear_session()?;
        tracing::info!("[Account] signed out {}", session.user.id);
        Ok(())
    }

    async fn mark_online(&self, user_id: &str, online: bool) {
        if let Err(e) = self.profiles.set_online(user_id, online).await {
            tracing::warn!("[Account] presence update failed: {}", e);
        }
    }

    pub async fn fetch_user(&self, user_id: &str) -> Result<User> {
        self.profiles
            .fetch(user_id)
            .await?
            .ok_or_else(|| ChatError::not_found(format!("user {}", user_id)))
    }

    pub async fn update_profile(&self, user_id: &str, patch: ProfilePatch) -> Result<User> {
        let now = Utc::now();
        let mut changes = Row::new();
        if let Some(full_name) = patch.full_name {
            let full_name = full_name.trim().to_string();
            if full_name.is_empty() {
                return Err(ChatError::validation("Full name is required"));
            }
            changes.insert("full_name".into(), json!(full_name));
        }
        if let Some(username) = patch.username {
            let username = normalize_username(&username)?;
            let current = self.fetch_user(user_id).await?;
            if current.username != username {
                if !self.profiles.is_username_available(&username).await? {
                    return Err(ChatError::validation("Username is already taken"));
                }
                changes.insert("username".into(), json!(username));
                changes.insert("username_last_changed".into(), json!(now));
            }
        }
        if let Some(bio) = patch.bio {
            let bio = bio.trim();
            let value = if bio.is_empty() { Value::Null } else { json!(bio) };
            changes.insert("bio".into(), value);
        }
        if let Some(date_of_birth) = patch.date_of_birth {
            changes.insert("date_of_birth".into(), json!(date_of_birth));
        }
        if let Some(gender) = patch.gender {
            changes.insert("gender".into(), json!(gender));
        }
        if let Some(public) = patch.is_profile_public {
            changes.insert("is_profile_public".into(), json!(public));
        }
        if let Some(theme) = patch.theme_settings {
            changes.insert("theme_settings".into(), json!(theme));
        }
        if changes.is_empty() {
            return self.fetch_user(user_id).await;
        }
        changes.insert("updated_at".into(), json!(now));
        self.write_profile(user_id, changes).await
    }

    async fn write_profile(&self, user_id: &str, changes: Row) -> Result<User> {
        let rows = self
            .backend
            .update(USERS, &Query::new().eq("id", user_id), changes)
            .await?;
        let user: User = schema::first_row(USERS, rows)?;
        self.profiles.remember(user.clone());
        Ok(user)
    }

    /// Store a new avatar and point the profile at its public URL.
    pub async fn upload_profile_picture(
        &self,
        user_id: &str,
        file_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<User> {
        let file_name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
        if file_name.is_empty() {
            return Err(ChatError::validation("File name is required"));
        }
        let path = format!(
            "{}/{}_{}",
            user_id,
            Utc::now().timestamp_millis(),
            file_name
        );
        self.backend
            .upload(PROFILE_PICTURES_BUCKET, &path, data, content_type)
            .await?;
        let url = self.backend.public_url(PROFILE_PICTURES_BUCKET, &path);
        tracing::info!("[Account] uploaded profile picture {}", path);
        self.write_profile(
            user_id,
            row([
                ("profile_picture", json!(url)),
                ("updated_at", json!(Utc::now())),
            ]),
        )
        .await
    }

    pub async fn search_users(&self, query: &str, exclude_id: &str) -> Result<Vec<User>> {
        self.profiles.search(query, exclude_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::memory_backend;
    use nxs_backend::MemoryBackend;
    use tempfile::tempdir;

    fn form(email: &str) -> SignUpForm {
        SignUpForm {
            full_name: "Ada Lovelace".into(),
            email: email.into(),
            date_of_birth: "1990-12-10".into(),
            gender: "female".into(),
            password: "Engine123".into(),
            confirm_password: "Engine123".into(),
        }
    }

    fn service(backend: MemoryBackend, dir: &std::path::Path) -> (Arc<MemoryBackend>, AccountService) {
        let backend = Arc::new(backend);
        let service = AccountService::new(
            backend.clone(),
            backend.clone(),
            Arc::new(Profiles::new(backend.clone())),
            dir.join("session.json"),
        );
        (backend, service)
    }

    #[tokio::test]
    async fn test_sign_up_signs_in_and_persists() {
        let dir = tempdir().unwrap();
        let (backend, service) = service(memory_backend(), dir.path());
        let outcome = service.sign_up(&form("ada@example.com"), "Ada").await.unwrap();
        let SignUpOutcome::SignedIn(user) = outcome else {
            panic!("expected a session");
        };
        assert_eq!(user.username, "ada");
        assert_eq!(user.gender, Some(Gender::Female));
        assert!(dir.path().join("session.json").exists());
        assert!(backend.access_token().is_some());

        assert!(matches!(
            service.sign_up(&form("other@example.com"), "ada").await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_confirmation_required() {
        let dir = tempdir().unwrap();
        let (backend, service) = service(memory_backend().with_email_confirmation(), dir.path());
        let outcome = service.sign_up(&form("ada@example.com"), "ada").await.unwrap();
        assert_eq!(
            outcome,
            SignUpOutcome::ConfirmationRequired {
                email: "ada@example.com".into()
            }
        );
        assert!(service.sign_in("ada@example.com", "Engine123").await.is_err());
        assert!(backend.confirm_email("ada@example.com"));
        let user = service.sign_in("ada@example.com", "Engine123").await.unwrap();
        assert!(service.fetch_user(&user.id).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_restore_refreshes_expired_session() {
        let dir = tempdir().unwrap();
        let (backend, service) = service(memory_backend(), dir.path());
        service.sign_up(&form("ada@example.com"), "ada").await.unwrap();
        let original = service.session().unwrap();

        let mut stale = original.clone();
        stale.expires_at = Utc::now().timestamp() - 10;
        nxs_common::write_json(&dir.path().join("session.json"), &stale).unwrap();

        let restarted = AccountService::new(
            backend.clone(),
            backend.clone(),
            Arc::new(Profiles::new(backend.clone())),
            dir.path().join("session.json"),
        );
        let user = restarted.restore().await.unwrap().unwrap();
        assert_eq!(user.username, "ada");
        let fresh = restarted.session().unwrap();
        assert_ne!(fresh.access_token, original.access_token);
        assert_eq!(backend.access_token(), Some(fresh.access_token));
    }

    #[tokio::test]
    async fn test_restore_without_file_and_sign_out() {
        let dir = tempdir().unwrap();
        let (backend, service) = service(memory_backend(), dir.path());
        assert!(service.restore().await.unwrap().is_none());

        service.sign_up(&form("ada@example.com"), "ada").await.unwrap();
        service.sign_out().await.unwrap();
        assert!(service.session().is_none());
        assert!(backend.access_token().is_none());
        assert!(!dir.path().join("session.json").exists());
        service.sign_out().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_profile_tracks_username_change() {
        let dir = tempdir().unwrap();
        let (_backend, service) = service(memory_backend(), dir.path());
        let SignUpOutcome::SignedIn(user) =
            service.sign_up(&form("ada@example.com"), "ada").await.unwrap()
        else {
            panic!("expected a session");
        };
        assert!(user.username_last_changed.is_none());

        let same = service
            .update_profile(
                &user.id,
                ProfilePatch {
                    username: Some("ADA".into()),
                    bio: Some("  first programmer ".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(same.username_last_changed.is_none());
        assert_eq!(same.bio.as_deref(), Some("first programmer"));

        let renamed = service
            .update_profile(
                &user.id,
                ProfilePatch {
                    username: Some("countess".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.username, "countess");
        assert!(renamed.username_last_changed.is_some());
    }

    #[tokio::test]
    async fn test_profile_picture_upload() {
        let dir = tempdir().unwrap();
        let (backend, service) = service(memory_backend(), dir.path());
        let SignUpOutcome::SignedIn(user) =
            service.sign_up(&form("ada@example.com"), "ada").await.unwrap()
        else {
            panic!("expected a session");
        };
        let updated = service
            .upload_profile_picture(&user.id, "C:\\pics\\me.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        let url = updated.profile_picture.unwrap();
        assert!(url.contains(PROFILE_PICTURES_BUCKET));
        assert!(url.ends_with("_me.png"));

        let path = url
            .split(&format!("{}/", PROFILE_PICTURES_BUCKET))
            .nth(1)
            .unwrap()
            .to_string();
        assert!(path.starts_with(&format!("{}/", user.id)));
        let stored = backend.download(PROFILE_PICTURES_BUCKET, &path).await.unwrap();
        assert_eq!(&stored[..], b"png");
    }
}
