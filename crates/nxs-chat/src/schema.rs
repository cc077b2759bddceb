//! Table names, row decoding and the in-memory schema.

use crate::error::{ChatError, Result};
use nxs_backend::{ColumnDefault, MemoryBackend, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

pub const USERS: &str = "users";
pub const CHATS: &str = "chats";
pub const CHAT_PARTICIPANTS: &str = "chat_participants";
pub const MESSAGES: &str = "messages";
pub const STATUS: &str = "status";
pub const STATUS_VIEWS: &str = "status_views";
pub const RANDOM_CHAT_QUEUE: &str = "random_chat_queue";
pub const USER_BLOCKS: &str = "user_blocks";
pub const ADMINS: &str = "admins";
pub const ANALYTICS: &str = "analytics";

pub const PROFILE_PICTURES_BUCKET: &str = "profile-pictures";

pub fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(|r| decode_row(table, r)).collect()
}

pub fn decode_row<T: DeserializeOwned>(table: &str, row: Row) -> Result<T> {
    serde_json::from_value(Value::Object(row)).map_err(|e| ChatError::Decode {
        table: table.to_string(),
        message: e.to_string(),
    })
}

/// First row of a write response, or `NotFound`.
pub fn first_row<T: DeserializeOwned>(table: &str, rows: Vec<Row>) -> Result<T> {
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| ChatError::not_found(format!("{} row", table)))?;
    decode_row(table, row)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Row> {
    Ok(nxs_backend::to_row(value)?)
}

/// A [`MemoryBackend`] with the column defaults and constraints of the
/// hosted schema.
pub fn memory_backend() -> MemoryBackend {
    let mut backend = MemoryBackend::new();
    for table in [
        USERS,
        CHATS,
        CHAT_PARTICIPANTS,
        MESSAGES,
        STATUS,
        STATUS_VIEWS,
        RANDOM_CHAT_QUEUE,
        USER_BLOCKS,
        ADMINS,
        ANALYTICS,
    ] {
        backend = backend.with_default(table, "id", ColumnDefault::Uuid);
    }

    let value = |v: Value| ColumnDefault::Value(v);
    backend
        .with_default(USERS, "created_at", ColumnDefault::Now)
        .with_default(USERS, "updated_at", ColumnDefault::Now)
        .with_default(USERS, "is_online", value(json!(false)))
        .with_default(USERS, "is_banned", value(json!(false)))
        .with_default(USERS, "is_profile_public", value(json!(true)))
        .with_default(
            USERS,
            "theme_settings",
            value(json!({"mode": "auto", "primaryColor": "#6366f1"})),
        )
        .with_unique(USERS, &["username"])
        .with_updated_at(USERS)
        .with_default(CHATS, "type", value(json!("private")))
        .with_default(CHATS, "created_at", ColumnDefault::Now)
        .with_default(CHATS, "updated_at", ColumnDefault::Now)
        .with_updated_at(CHATS)
        .with_default(CHAT_PARTICIPANTS, "joined_at", ColumnDefault::Now)
        .with_default(CHAT_PARTICIPANTS, "left_at", value(Value::Null))
        .with_default(CHAT_PARTICIPANTS, "is_active", value(json!(true)))
        .with_default(MESSAGES, "message_type", value(json!("text")))
        .with_default(MESSAGES, "parent_id", value(Value::Null))
        .with_default(MESSAGES, "is_read", value(json!(false)))
        .with_default(MESSAGES, "is_deleted", value(json!(false)))
        .with_default(MESSAGES, "created_at", ColumnDefault::Now)
        .with_default(MESSAGES, "updated_at", ColumnDefault::Now)
        .with_default(STATUS, "visibility", value(json!("anyone")))
        .with_default(STATUS, "views_count", value(json!(0)))
        .with_default(STATUS, "created_at", ColumnDefault::Now)
        .with_default(STATUS_VIEWS, "viewed_at", ColumnDefault::Now)
        .with_unique(STATUS_VIEWS, &["status_id", "viewer_id"])
        .with_default(RANDOM_CHAT_QUEUE, "is_waiting", value(json!(true)))
        .with_default(RANDOM_CHAT_QUEUE, "matched_at", value(Value::Null))
        .with_default(RANDOM_CHAT_QUEUE, "created_at", ColumnDefault::Now)
        .with_default(USER_BLOCKS, "created_at", ColumnDefault::Now)
        .with_unique(USER_BLOCKS, &["blocker_id", "blocked_id"])
        .with_default(ADMINS, "is_active", value(json!(true)))
        .with_default(ADMINS, "is_super_admin", value(json!(false)))
        .with_default(ADMINS, "created_at", ColumnDefault::Now)
        .with_unique(ADMINS, &["username"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use nxs_backend::{row, Backend, Query};

    #[tokio::test]
    async fn test_memory_schema_produces_decodable_messages() {
        let backend = memory_backend();
        let rows = backend
            .insert(
                MESSAGES,
                vec![row([
                    ("chat_id", json!("c1")),
                    ("sender_id", json!("u1")),
                    ("content", json!("hello")),
                ])],
            )
            .await
            .unwrap();
        let message: Message = first_row(MESSAGES, rows).unwrap();
        assert!(!message.is_read);
        assert!(!message.is_deleted);

        let none = backend
            .select(MESSAGES, &Query::new().eq("chat_id", "nope"))
            .await
            .unwrap();
        assert!(first_row::<Message>(MESSAGES, none).is_err());
    }

    #[test]
    fn test_decode_error_names_table() {
        let err = decode_row::<Message>(MESSAGES, Row::new()).unwrap_err();
        assert!(err.to_string().contains("messages"));
    }
}
