//! Auth sessions and the `/auth/v1` client.

use crate::error::{BackendError, Result};
use crate::rest::HttpTransport;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// The authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// An access/refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry as unix seconds.
    pub expires_at: i64,
    pub user: AuthUser,
}

impl Session {
    pub fn expires_at_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.expires_at, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// True when the token expires within `leeway` of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        now + leeway >= self.expires_at_time()
    }
}

/// Result of a sign-up. `session` is `None` while the email address awaits
/// confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub user: AuthUser,
    pub session: Option<Session>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| now.timestamp() + self.expires_in.unwrap_or(3600));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Interpret a sign-up body: a token response when the account is
/// confirmed immediately, otherwise the bare (or wrapped) user.
pub(crate) fn parse_signup(body: Value, now: DateTime<Utc>) -> Result<AuthResponse> {
    if body.get("access_token").is_some() {
        let token: TokenResponse = serde_json::from_value(body)?;
        let session = token.into_session(now);
        return Ok(AuthResponse {
            user: session.user.clone(),
            session: Some(session),
        });
    }
    let user_value = body.get("user").cloned().unwrap_or(body);
    let user: AuthUser = serde_json::from_value(user_value)
        .map_err(|e| BackendError::Auth(format!("unexpected sign-up response: {}", e)))?;
    Ok(AuthResponse { user, session: None })
}

/// Client for the platform's auth endpoints.
#[derive(Debug, Clone)]
pub struct AuthClient {
    transport: Arc<HttpTransport>,
}

impl AuthClient {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }

    fn url(&self, path: &str) -> String {
        self.transport.config().auth_url(path)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let url = self.url("signup");
        let body = json!({ "email": email, "password": password });
        tracing::info!("[Auth] sign up {}", email);
        let response = self
            .transport
            .send(None, |c| c.post(&url).json(&body))
            .await
            .map_err(auth_error)?;
        parse_signup(response.json::<Value>().await?, Utc::now())
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let url = self.url("token?grant_type=password");
        let body = json!({ "email": email, "password": password });
        tracing::info!("[Auth] sign in {}", email);
        let response = self
            .transport
            .send(None, |c| c.post(&url).json(&body))
            .await
            .map_err(auth_error)?;
        let token = response.json::<TokenResponse>().await?;
        Ok(token.into_session(Utc::now()))
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let url = self.url("token?grant_type=refresh_token");
        let body = json!({ "refresh_token": refresh_token });
        tracing::debug!("[Auth] refreshing session");
        let response = self
            .transport
            .send(None, |c| c.post(&url).json(&body))
            .await
            .map_err(auth_error)?;
        let token = response.json::<TokenResponse>().await?;
        Ok(token.into_session(Utc::now()))
    }

    pub async fn sign_out(&self, access_token: &str) -> Result<()> {
        let url = self.url("logout");
        tracing::info!("[Auth] sign out");
        self.transport
            .send(Some(access_token), |c| c.post(&url))
            .await?;
        Ok(())
    }

    pub async fn get_user(&self, access_token: &str) -> Result<AuthUser> {
        let url = self.url("user");
        let response = self
            .transport
            .send(Some(access_token), |c| c.get(&url))
            .await?;
        Ok(response.json::<AuthUser>().await?)
    }
}

/// Credential problems surface as `Auth` errors; everything else is kept.
fn auth_error(err: BackendError) -> BackendError {
    match err {
        BackendError::Api {
            status: 400 | 401 | 422,
            message,
            ..
        } => BackendError::Auth(message),
        other => other,
    }
}
