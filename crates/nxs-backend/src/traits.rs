use crate::auth::{AuthResponse, AuthUser, Session};
use crate::error::{BackendError, Result};
use crate::query::{Query, Row};
use crate::realtime::{ChangeFilter, ChangeStream};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Rows, change feeds and blobs of the hosted platform.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>>;
    /// Insert rows and return their stored representation.
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>>;
    async fn update(&self, table: &str, query: &Query, patch: Row) -> Result<Vec<Row>>;
    async fn delete(&self, table: &str, query: &Query) -> Result<Vec<Row>>;
    /// Exact number of rows matching `query`.
    async fn count(&self, table: &str, query: &Query) -> Result<u64>;

    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeStream>;

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String>;
    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes>;
    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Account operations of the hosted platform.
#[async_trait]
pub trait AuthBackend: Send + Sync + 'static {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthResponse>;
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;
    async fn refresh(&self, refresh_token: &str) -> Result<Session>;
    async fn sign_out(&self, access_token: &str) -> Result<()>;
    async fn get_user(&self, access_token: &str) -> Result<AuthUser>;

    /// Token used for subsequent row, storage and realtime requests.
    fn set_access_token(&self, token: Option<String>);
}

/// Decode a list of rows into typed records.
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(decode_row).collect()
}

pub fn decode_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// Encode a record as a row. Fails for values that are not JSON objects.
pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(BackendError::Query(format!(
            "expected an object row, got {}",
            other
        ))),
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
