//! HTTP transport and the row (REST) client.

use crate::config::ClientConfig;
use crate::error::{BackendError, Result};
use crate::query::{Query, Row};
use crate::retry::{parse_retry_after, RetryDecision, RetryState};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::sync::Arc;

/// Shared HTTP plumbing: one `reqwest::Client`, the platform headers and
/// the retry loop.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    config: ClientConfig,
    access_token: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            config,
            access_token: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    /// Bearer used when the caller does not supply one.
    fn default_bearer(&self) -> String {
        self.access_token()
            .unwrap_or_else(|| self.config.anon_key.clone())
    }

    /// Send a request built by `build`, retrying per the configured policy.
    ///
    /// `build` is invoked once per attempt. Non-success responses that are
    /// not retried are decoded into [`BackendError::Api`].
    pub async fn send<F>(&self, bearer: Option<&str>, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let bearer = bearer
            .map(str::to_string)
            .unwrap_or_else(|| self.default_bearer());
        let mut retry = RetryState::new(self.config.retry.clone());

        loop {
            let request = build(&self.client)
                .header("apikey", &self.config.anon_key)
                .header("Authorization", format!("Bearer {}", bearer));

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    match retry.should_retry_status(status, retry_after) {
                        RetryDecision::Retry(wait) => {
                            tracing::warn!(
                                "[HTTP] status {} (attempt {}), retrying in {:?}",
                                status,
                                retry.attempts,
                                wait
                            );
                            tokio::time::sleep(wait).await;
                        }
                        RetryDecision::DontRetry => {
                            return Err(decode_error(status, response).await);
                        }
                    }
                }
                Err(e) => {
                    let err = BackendError::from(e);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    match retry.should_retry_error() {
                        RetryDecision::Retry(wait) => {
                            tracing::warn!(
                                "[HTTP] {} (attempt {}), retrying in {:?}",
                                err,
                                retry.attempts,
                                wait
                            );
                            tokio::time::sleep(wait).await;
                        }
                        RetryDecision::DontRetry => return Err(err),
                    }
                }
            }
        }
    }
}

/// Decode a platform error body (`{message, code}`, `{msg}` or
/// `{error, error_description}`).
async fn decode_error(status: u16, response: Response) -> BackendError {
    let text = response.text().await.unwrap_or_default();
    let (message, code) = parse_error_body(&text);
    let message = message.unwrap_or_else(|| {
        if text.is_empty() {
            format!("request failed with status {}", status)
        } else {
            text.clone()
        }
    });
    tracing::debug!("[HTTP] error {}: {}", status, message);
    BackendError::Api {
        status,
        message,
        code,
    }
}

pub(crate) fn parse_error_body(text: &str) -> (Option<String>, Option<String>) {
    let Ok(Value::Object(body)) = serde_json::from_str::<Value>(text) else {
        return (None, None);
    };
    let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_string);
    let message = field("message")
        .or_else(|| field("msg"))
        .or_else(|| field("error_description"))
        .or_else(|| field("error"));
    let code = field("code").or_else(|| {
        body.get("code")
            .and_then(Value::as_i64)
            .map(|c| c.to_string())
    });
    (message, code)
}

/// Parse the total out of a `Content-Range` header (`0-9/42`, `*/42`).
pub(crate) fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Table reads and writes over `/rest/v1`.
#[derive(Debug, Clone)]
pub struct RestClient {
    transport: Arc<HttpTransport>,
}

impl RestClient {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self { transport }
    }

    fn url(&self, table: &str, query: &Query) -> String {
        let base = self.transport.config().rest_url(table);
        let qs = query.to_query_string();
        if qs.is_empty() {
            base
        } else {
            format!("{}?{}", base, qs)
        }
    }

    pub async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        let url = self.url(table, query);
        tracing::debug!("[REST] GET {}", url);
        let response = self.transport.send(None, |c| c.get(&url)).await?;
        Ok(response.json::<Vec<Row>>().await?)
    }

    pub async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.transport.config().rest_url(table);
        tracing::debug!("[REST] POST {} ({} rows)", url, rows.len());
        let response = self
            .transport
            .send(None, |c| {
                c.post(&url)
                    .header("Prefer", "return=representation")
                    .json(&rows)
            })
            .await?;
        Ok(response.json::<Vec<Row>>().await?)
    }

    pub async fn update(&self, table: &str, query: &Query, patch: Row) -> Result<Vec<Row>> {
        if query.filters().is_empty() {
            return Err(BackendError::Query(format!(
                "refusing unfiltered update on {}",
                table
            )));
        }
        let url = self.url(table, query);
        tracing::debug!("[REST] PATCH {}", url);
        let response = self
            .transport
            .send(None, |c| {
                c.patch(&url)
                    .header("Prefer", "return=representation")
                    .json(&patch)
            })
            .await?;
        Ok(response.json::<Vec<Row>>().await?)
    }

    pub async fn delete(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        if query.filters().is_empty() {
            return Err(BackendError::Query(format!(
                "refusing unfiltered delete on {}",
                table
            )));
        }
        let url = self.url(table, query);
        tracing::debug!("[REST] DELETE {}", url);
        let response = self
            .transport
            .send(None, |c| {
                c.delete(&url).header("Prefer", "return=representation")
            })
            .await?;
        Ok(response.json::<Vec<Row>>().await?)
    }

    pub async fn count(&self, table: &str, query: &Query) -> Result<u64> {
        let url = self.url(table, &query.clone().select("*"));
        tracing::debug!("[REST] HEAD {}", url);
        let response = self
            .transport
            .send(None, |c| {
                c.head(&url)
                    .header("Prefer", "count=exact")
                    .header("Range-Unit", "items")
                    .header("Range", "0-0")
            })
            .await?;
        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| BackendError::Http("count response without Content-Range".into()))
    }
}
