//! In-memory implementation of the platform, for tests and offline demos.
//!
//! Tables are plain row vectors. Inserts fill configured column defaults,
//! unique constraints answer like the platform (`409`, code `23505`) and
//! every write is broadcast to matching subscriptions after the state lock
//! is released.

use crate::auth::{AuthResponse, AuthUser, Session};
use crate::error::{BackendError, Result};
use crate::query::{Query, Row};
use crate::realtime::{ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, SubscriptionStatus};
use crate::storage;
use crate::traits::{AuthBackend, Backend};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

const SESSION_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    Uuid,
    Now,
    Value(Value),
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Row>,
    defaults: Vec<(String, ColumnDefault)>,
    unique: Vec<Vec<String>>,
    touch_updated_at: bool,
}

impl Table {
    fn violates_unique(&self, candidate: &Row, skip: Option<usize>) -> Option<String> {
        for columns in &self.unique {
            let key: Vec<&Value> = columns
                .iter()
                .map(|c| candidate.get(c).unwrap_or(&Value::Null))
                .collect();
            if key.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = self.rows.iter().enumerate().any(|(i, row)| {
                Some(i) != skip
                    && columns
                        .iter()
                        .zip(&key)
                        .all(|(c, v)| row.get(c) == Some(*v))
            });
            if clash {
                return Some(columns.join(", "));
            }
        }
        None
    }
}

fn conflict(columns: &str) -> BackendError {
    BackendError::Api {
        status: 409,
        message: format!("duplicate key value violates unique constraint ({})", columns),
        code: Some("23505".to_string()),
    }
}

struct Subscriber {
    id: u64,
    filter: ChangeFilter,
    events: mpsc::UnboundedSender<ChangeEvent>,
    status: watch::Sender<SubscriptionStatus>,
}

#[derive(Debug)]
struct Account {
    user: AuthUser,
    password_hash: String,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct AuthState {
    accounts: HashMap<String, Account>,
    access: HashMap<String, String>,
    refresh: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    blobs: HashMap<(String, String), (Bytes, String)>,
    auth: AuthState,
    last_timestamp: Option<DateTime<Utc>>,
}

impl State {
    /// Strictly increasing timestamps so rows created back to back keep
    /// their insertion order.
    fn now(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

pub struct MemoryBackend {
    state: Mutex<State>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_subscriber: AtomicU64,
    connected: AtomicBool,
    require_confirmation: bool,
    base_url: String,
    access_token: Mutex<Option<String>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("tables", &self.state.lock().tables.len())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            require_confirmation: false,
            base_url: "http://localhost:54321".to_string(),
            access_token: Mutex::new(None),
        }
    }

    /// Fill `column` with `default` when an inserted row omits it.
    #[must_use]
    pub fn with_default(self, table: &str, column: &str, default: ColumnDefault) -> Self {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .defaults
            .push((column.to_string(), default));
        self
    }

    #[must_use]
    pub fn with_unique(self, table: &str, columns: &[&str]) -> Self {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .unique
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Set `updated_at` on every update that does not set it explicitly.
    #[must_use]
    pub fn with_updated_at(self, table: &str) -> Self {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .touch_updated_at = true;
        self
    }

    /// New sign-ups must be confirmed before they can sign in.
    #[must_use]
    pub fn with_email_confirmation(mut self) -> Self {
        self.require_confirmation = true;
        self
    }

    /// Snapshot of a table, for assertions.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.lock().clone()
    }

    /// Mark an account's email as confirmed.
    pub fn confirm_email(&self, email: &str) -> bool {
        let mut state = self.state.lock();
        match state.auth.accounts.get_mut(&email.to_lowercase()) {
            Some(account) => {
                account.confirmed = true;
                true
            }
            None => false,
        }
    }

    /// Simulate the realtime socket dropping: subscriptions report
    /// `Reconnecting` and writes are not delivered until [`reconnect`].
    ///
    /// [`reconnect`]: MemoryBackend::reconnect
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for sub in self.subscribers.lock().iter() {
            sub.status.send_replace(SubscriptionStatus::Reconnecting);
        }
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        for sub in self.subscribers.lock().iter() {
            sub.status.send_replace(SubscriptionStatus::Joined);
        }
    }

    fn broadcast(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() || !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| !sub.events.is_closed());
        for event in events {
            for sub in subscribers.iter().filter(|s| s.filter.matches(&event)) {
                let _ = sub.events.send(event.clone());
            }
        }
    }

    fn issue_session(state: &mut State, user: AuthUser) -> Session {
        let access_token = Uuid::new_v4().to_string();
        let refresh_token = Uuid::new_v4().to_string();
        state
            .auth
            .access
            .insert(access_token.clone(), user.id.clone());
        state
            .auth
            .refresh
            .insert(refresh_token.clone(), user.id.clone());
        Session {
            access_token,
            refresh_token,
            expires_at: Utc::now().timestamp() + SESSION_TTL_SECS,
            user,
        }
    }

    fn user_by_id(state: &State, id: &str) -> Option<AuthUser> {
        state
            .auth
            .accounts
            .values()
            .find(|a| a.user.id == id)
            .map(|a| a.user.clone())
    }
}

fn hash_password(email: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        let state = self.state.lock();
        Ok(state
            .tables
            .get(table)
            .map(|t| query.apply(&t.rows))
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>> {
        let inserted = {
            let mut state = self.state.lock();
            let now = state.now();
            let t = state.tables.entry(table.to_string()).or_default();

            let base = t.rows.len();
            let mut inserted = Vec::with_capacity(rows.len());
            for mut row in rows {
                for (column, default) in &t.defaults {
                    if row.contains_key(column) {
                        continue;
                    }
                    let value = match default {
                        ColumnDefault::Uuid => Value::String(Uuid::new_v4().to_string()),
                        ColumnDefault::Now => Value::String(now.clone()),
                        ColumnDefault::Value(v) => v.clone(),
                    };
                    row.insert(column.clone(), value);
                }
                // Earlier rows of the same batch are already in the table.
                if let Some(columns) = t.violates_unique(&row, None) {
                    t.rows.truncate(base);
                    return Err(conflict(&columns));
                }
                t.rows.push(row.clone());
                inserted.push(row);
            }
            inserted
        };

        tracing::debug!("[Memory] insert {} row(s) into {}", inserted.len(), table);
        self.broadcast(
            inserted
                .iter()
                .map(|r| ChangeEvent::new(ChangeKind::Insert, table, Some(r.clone()), None))
                .collect(),
        );
        Ok(inserted)
    }

    async fn update(&self, table: &str, query: &Query, patch: Row) -> Result<Vec<Row>> {
        let changes = {
            let mut state = self.state.lock();
            let now = state.now();
            let Some(t) = state.tables.get_mut(table) else {
                return Ok(Vec::new());
            };

            let mut planned = Vec::new();
            for (i, row) in t.rows.iter().enumerate() {
                if !query.matches(row) {
                    continue;
                }
                let mut updated = row.clone();
                for (k, v) in &patch {
                    updated.insert(k.clone(), v.clone());
                }
                if t.touch_updated_at && !patch.contains_key("updated_at") {
                    updated.insert("updated_at".to_string(), Value::String(now.clone()));
                }
                if let Some(columns) = t.violates_unique(&updated, Some(i)) {
                    return Err(conflict(&columns));
                }
                planned.push((i, updated));
            }

            let mut changes = Vec::with_capacity(planned.len());
            for (i, updated) in planned {
                let old = std::mem::replace(&mut t.rows[i], updated.clone());
                changes.push((old, updated));
            }
            changes
        };

        self.broadcast(
            changes
                .iter()
                .map(|(old, new)| {
                    ChangeEvent::new(ChangeKind::Update, table, Some(new.clone()), Some(old.clone()))
                })
                .collect(),
        );
        Ok(changes.into_iter().map(|(_, new)| new).collect())
    }

    async fn delete(&self, table: &str, query: &Query) -> Result<Vec<Row>> {
        let removed = {
            let mut state = self.state.lock();
            let Some(t) = state.tables.get_mut(table) else {
                return Ok(Vec::new());
            };
            let (removed, kept): (Vec<Row>, Vec<Row>) =
                t.rows.drain(..).partition(|r| query.matches(r));
            t.rows = kept;
            removed
        };

        self.broadcast(
            removed
                .iter()
                .map(|r| ChangeEvent::new(ChangeKind::Delete, table, None, Some(r.clone())))
                .collect(),
        );
        Ok(removed)
    }

    async fn count(&self, table: &str, query: &Query) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .tables
            .get(table)
            .map(|t| t.rows.iter().filter(|r| query.matches(r)).count() as u64)
            .unwrap_or(0))
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeStream> {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let initial = if self.connected.load(Ordering::SeqCst) {
            SubscriptionStatus::Joined
        } else {
            SubscriptionStatus::Reconnecting
        };
        let (status_tx, status_rx) = watch::channel(initial);
        tracing::debug!("[Memory] subscribe #{} to {}", id, filter.table);
        self.subscribers.lock().push(Subscriber {
            id,
            filter,
            events: events_tx,
            status: status_tx,
        });

        let subscribers = Arc::clone(&self.subscribers);
        Ok(ChangeStream::new(events_rx, status_rx, move || {
            let mut subs = subscribers.lock();
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                let sub = subs.remove(pos);
                sub.status.send_replace(SubscriptionStatus::Closed);
            }
        }))
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String> {
        let mut state = self.state.lock();
        let key = (bucket.to_string(), path.to_string());
        if state.blobs.contains_key(&key) {
            return Err(BackendError::api(409, "The resource already exists"));
        }
        state.blobs.insert(key, (data, content_type.to_string()));
        Ok(format!("{}/{}", bucket, path))
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes> {
        self.state
            .lock()
            .blobs
            .get(&(bucket.to_string(), path.to_string()))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| BackendError::NotFound(format!("{}/{}", bucket, path)))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        storage::public_url(&self.base_url, bucket, path)
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let email = email.trim().to_lowercase();
        let mut state = self.state.lock();
        if state.auth.accounts.contains_key(&email) {
            return Err(BackendError::Auth("User already registered".into()));
        }
        let user = AuthUser {
            id: Uuid::new_v4().to_string(),
            email: Some(email.clone()),
        };
        state.auth.accounts.insert(
            email.clone(),
            Account {
                user: user.clone(),
                password_hash: hash_password(&email, password),
                confirmed: !self.require_confirmation,
            },
        );
        let session = if self.require_confirmation {
            None
        } else {
            let session = Self::issue_session(&mut state, user.clone());
            *self.access_token.lock() = Some(session.access_token.clone());
            Some(session)
        };
        Ok(AuthResponse { user, session })
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim().to_lowercase();
        let mut state = self.state.lock();
        let account = state
            .auth
            .accounts
            .get(&email)
            .filter(|a| a.password_hash == hash_password(&email, password))
            .ok_or_else(|| BackendError::Auth("Invalid login credentials".into()))?;
        if !account.confirmed {
            return Err(BackendError::Auth("Email not confirmed".into()));
        }
        let user = account.user.clone();
        let session = Self::issue_session(&mut state, user);
        *self.access_token.lock() = Some(session.access_token.clone());
        Ok(session)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let mut state = self.state.lock();
        let user_id = state
            .auth
            .refresh
            .remove(refresh_token)
            .ok_or_else(|| BackendError::Auth("Invalid Refresh Token".into()))?;
        let user = Self::user_by_id(&state, &user_id)
            .ok_or_else(|| BackendError::Auth("User not found".into()))?;
        let session = Self::issue_session(&mut state, user);
        *self.access_token.lock() = Some(session.access_token.clone());
        Ok(session)
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        self.state.lock().auth.access.remove(access_token);
        *self.access_token.lock() = None;
        Ok(())
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser> {
        let state = self.state.lock();
        state
            .auth
            .access
            .get(access_token)
            .and_then(|id| Self::user_by_id(&state, id))
            .ok_or_else(|| BackendError::api(401, "invalid JWT"))
    }

    fn set_access_token(&self, token: Option<String>) {
        *self.access_token.lock() = token;
    }
}
