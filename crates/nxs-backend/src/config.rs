//! Configuration for the hosted backend client.

use crate::error::{BackendError, Result};
use crate::retry::RetryConfig;
use std::time::Duration;
use url::Url;

pub const URL_ENV: &str = "NXS_BACKEND_URL";
pub const ANON_KEY_ENV: &str = "NXS_ANON_KEY";
pub const TIMEOUT_ENV: &str = "NXS_REQUEST_TIMEOUT_MS";

/// Configuration for the hosted backend client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub url: String,
    /// Public anonymous API key
    pub anon_key: String,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Retry policy for REST, auth and storage requests.
    pub retry: RetryConfig,
    /// Realtime heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Reconnect policy for the realtime socket.
    pub reconnect: RetryConfig,
    /// Schema that row changes are subscribed on.
    pub schema: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            url: "http://localhost:54321".to_string(),
            anon_key: String::new(),
            request_timeout_ms: 30000,
            retry: RetryConfig::default(),
            heartbeat_interval_secs: 25,
            reconnect: RetryConfig::reconnect(),
            schema: "public".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            ..Default::default()
        }
    }

    /// Build from `NXS_BACKEND_URL`, `NXS_ANON_KEY` and
    /// `NXS_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var(URL_ENV)
            .map_err(|_| BackendError::Config(format!("{} is not set", URL_ENV)))?;
        let anon_key = std::env::var(ANON_KEY_ENV)
            .map_err(|_| BackendError::Config(format!("{} is not set", ANON_KEY_ENV)))?;
        let mut config = Self::new(url, anon_key);
        if let Some(ms) = std::env::var(TIMEOUT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.request_timeout_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| BackendError::Config(format!("invalid backend url {}: {}", self.url, e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(BackendError::Config(format!(
                "backend url must be http(s), got {}",
                parsed.scheme()
            )));
        }
        if self.anon_key.is_empty() {
            return Err(BackendError::Config("anon key is empty".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(BackendError::Config("heartbeat interval must be > 0".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.url, table)
    }

    pub fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.url, path.trim_start_matches('/'))
    }

    pub fn storage_url(&self, path: &str) -> String {
        format!("{}/storage/v1/{}", self.url, path.trim_start_matches('/'))
    }

    /// WebSocket endpoint for realtime change feeds.
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.url.clone()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base, self.anon_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout_ms, 30000);
        assert_eq!(config.heartbeat_interval_secs, 25);
        assert_eq!(config.schema, "public");
        assert_eq!(config.reconnect.max_retries, None);
    }

    #[test]
    fn test_urls() {
        let config = ClientConfig::new("https://demo.supabase.co/", "anon");
        assert_eq!(
            config.rest_url("messages"),
            "https://demo.supabase.co/rest/v1/messages"
        );
        assert_eq!(
            config.auth_url("/token?grant_type=password"),
            "https://demo.supabase.co/auth/v1/token?grant_type=password"
        );
        assert_eq!(
            config.realtime_url(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn test_plain_http_realtime_url() {
        let config = ClientConfig::new("http://localhost:54321", "k");
        assert!(config.realtime_url().starts_with("ws://localhost:54321/"));
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::new("https://demo.supabase.co", "anon")
            .validate()
            .is_ok());
        assert!(ClientConfig::new("ftp://demo", "anon").validate().is_err());
        assert!(ClientConfig::new("https://demo.supabase.co", "")
            .validate()
            .is_err());
        assert!(ClientConfig::new("not a url", "anon").validate().is_err());
    }

    #[test]
    fn test_partial_override() {
        let config = ClientConfig {
            request_timeout_ms: 10,
            ..Default::default()
        };
        assert_eq!(config.request_timeout(), Duration::from_millis(10));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
    }
}
