//! The platform client: REST, auth, storage and realtime behind one handle.

use crate::auth::{AuthClient, AuthResponse, AuthUser, Session};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::query::{Query, Row};
use crate::realtime::{ChangeFilter, ChangeStream, RealtimeClient};
use crate::rest::{HttpTransport, RestClient};
use crate::storage::StorageClient;
use crate::traits::{AuthBackend, Backend};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

#[derive(Debug)]
pub struct HostedBackend {
    transport: Arc<HttpTransport>,
    rest: RestClient,
    auth: AuthClient,
    storage: StorageClient,
    realtime: RealtimeClient,
}

impl HostedBackend {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(config.clone())?);
        tracing::info!("[Backend] using {}", config.url);
        Ok(Self {
            rest: RestClient::new(transport.clone()),
            auth: AuthClient::new(transport.clone()),
            storage: StorageClient::new(transport.clone()),
            realtime: RealtimeClient::new(config),
            transport,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        self.transport.config()
    }
}

#[async_trait]
impl Backend for HostedBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        self.rest.select(table, query).await
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>> {
        self.rest.insert(table, rows).await
    }

    async fn update(&self, table: &str, query: &Query, patch: Row) -> Result<Vec<Row>> {
        self.rest.update(table, query, patch).await
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        self.rest.delete(table, query).await
    }

    async fn count(&self, table: &str, query: &Query) -> Result<u64> {
        self.rest.count(table, query).await
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeStream> {
        self.realtime.subscribe(filter).await
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String> {
        self.storage.upload(bucket, path, data, content_type).await
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes> {
        self.storage.download(bucket, path).await
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.storage.public_url(bucket, path)
    }
}

#[async_trait]
impl AuthBackend for HostedBackend {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let response = self.auth.sign_up(email, password).await?;
        if let Some(session) = &response.session {
            self.set_access_token(Some(session.access_token.clone()));
        }
        Ok(response)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.auth.sign_in_with_password(email, password).await?;
        self.set_access_token(Some(session.access_token.clone()));
        Ok(session)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let session = self.auth.refresh(refresh_token).await?;
        self.set_access_token(Some(session.access_token.clone()));
        Ok(session)
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        let result = self.auth.sign_out(access_token).await;
        self.set_access_token(None);
        result
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser> {
        self.auth.get_user(access_token).await
    }

    fn set_access_token(&self, token: Option<String>) {
        self.transport.set_access_token(token.clone());
        self.realtime.set_access_token(token);
    }
}
