//! User profiles: cached lookups, search and presence.

use crate::error::Result;
use crate::models::User;
use crate::schema::{self, USERS};
use chrono::Utc;
use nxs_backend::{row, Backend, Filter, Query};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const SEARCH_LIMIT: usize = 20;

pub struct Profiles {
    backend: Arc<dyn Backend>,
    cache: RwLock<HashMap<String, User>>,
}

impl std::fmt::Debug for Profiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiles")
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

impl Profiles {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached(&self, user_id: &str) -> Option<User> {
        self.cache.read().get(user_id).cloned()
    }

    pub fn remember(&self, user: User) {
        self.cache.write().insert(user.id.clone(), user);
    }

    pub fn forget(&self, user_id: &str) {
        self.cache.write().remove(user_id);
    }

    /// Load a profile, from cache when possible.
    pub async fn get(&self, user_id: &str) -> Result<Option<User>> {
        if let Some(user) = self.cached(user_id) {
            return Ok(Some(user));
        }
        self.fetch(user_id).await
    }

    /// Load a profile from the backend, refreshing the cache.
    pub async fn fetch(&self, user_id: &str) -> Result<Option<User>> {
        let rows = self
            .backend
            .select(USERS, &Query::new().eq("id", user_id).limit(1))
            .await?;
        let user = schema::decode_rows::<User>(USERS, rows)?.into_iter().next();
        if let Some(user) = &user {
            self.remember(user.clone());
        }
        Ok(user)
    }

    /// Load several profiles with one `in` query for the uncached ones.
    pub async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, User>> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        {
            let cache = self.cache.read();
            for id in ids {
                match cache.get(id) {
                    Some(user) => {
                        found.insert(id.clone(), user.clone());
                    }
                    None if !missing.contains(id) => missing.push(id.clone()),
                    None => {}
                }
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let rows = self
            .backend
            .select(USERS, &Query::new().is_in("id", missing))
            .await?;
        for user in schema::decode_rows::<User>(USERS, rows)? {
            self.remember(user.clone());
            found.insert(user.id.clone(), user);
        }
        Ok(found)
    }

    /// Case-insensitive match on username or full name, excluding the
    /// caller.
    pub async fn search(&self, query: &str, exclude_id: &str) -> Result<Vec<User>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("%{}%", query);
        let q = Query::new()
            .or(vec![
                Filter::ilike("username", pattern.clone()),
                Filter::ilike("full_name", pattern),
            ])
            .neq("id", exclude_id)
            .limit(SEARCH_LIMIT);
        let rows = self.backend.select(USERS, &q).await?;
        schema::decode_rows(USERS, rows)
    }

    pub async fn is_username_available(&self, username: &str) -> Result<bool> {
        let taken = self
            .backend
            .count(USERS, &Query::new().eq("username", username))
            .await?;
        Ok(taken == 0)
    }

    /// Flip the presence flag and stamp `last_seen`.
    pub async fn set_online(&self, user_id: &str, online: bool) -> Result<()> {
        let now = Utc::now();
        let patch = row([
            ("is_online", Value::Bool(online)),
            ("last_seen", json!(now)),
        ]);
        self.backend
            .update(USERS, &Query::new().eq("id", user_id), patch)
            .await?;
        if let Some(user) = self.cache.write().get_mut(user_id) {
            user.is_online = online;
            user.last_seen = Some(now);
        }
        tracing::debug!("[Presence] {} online={}", user_id, online);
        Ok(())
    }
}
