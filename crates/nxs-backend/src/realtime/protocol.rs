//! Phoenix channel framing used by the realtime socket.

use crate::error::{BackendError, Result};
use crate::query::Row;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT: &str = "heartbeat";
pub const ACCESS_TOKEN: &str = "access_token";
pub const POSTGRES_CHANGES: &str = "postgres_changes";
pub const SYSTEM: &str = "system";
pub const PHOENIX_TOPIC: &str = "phoenix";

/// One frame on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn join(topic: &str, msg_ref: String, config: Value, access_token: Option<&str>) -> Self {
        let mut payload = json!({ "config": config });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        Self {
            topic: topic.to_string(),
            event: PHX_JOIN.to_string(),
            payload,
            join_ref: Some(msg_ref.clone()),
            msg_ref: Some(msg_ref),
        }
    }

    pub fn leave(topic: &str, msg_ref: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: PHX_LEAVE.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref),
            join_ref: None,
        }
    }

    pub fn heartbeat(msg_ref: String) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: HEARTBEAT.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref),
            join_ref: None,
        }
    }

    pub fn access_token(topic: &str, msg_ref: String, token: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: ACCESS_TOKEN.to_string(),
            payload: json!({ "access_token": token }),
            msg_ref: Some(msg_ref),
            join_ref: None,
        }
    }

    /// `(ok, response)` for a `phx_reply` frame.
    pub fn reply_status(&self) -> Option<(bool, &Value)> {
        if self.event != PHX_REPLY {
            return None;
        }
        let ok = self.payload.get("status").and_then(Value::as_str) == Some("ok");
        Some((ok, self.payload.get("response").unwrap_or(&Value::Null)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A row-level change pushed by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    /// Row after the change. Empty for deletes.
    pub new: Option<Row>,
    /// Row before the change (primary key only unless the table has full
    /// replica identity).
    pub old: Option<Row>,
    pub commit_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    schema: String,
    table: String,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, table: &str, new: Option<Row>, old: Option<Row>) -> Self {
        Self {
            kind,
            schema: "public".to_string(),
            table: table.to_string(),
            new,
            old,
            commit_timestamp: None,
        }
    }

    /// Decode the payload of a `postgres_changes` frame.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let data = payload
            .get("data")
            .ok_or_else(|| BackendError::Realtime("postgres_changes without data".into()))?;
        let data: ChangeData = serde_json::from_value(data.clone())?;
        Ok(Self {
            kind: data.kind,
            schema: data.schema,
            table: data.table,
            new: data.record.filter(|r| !r.is_empty()),
            old: data.old_record.filter(|r| !r.is_empty()),
            commit_timestamp: data.commit_timestamp,
        })
    }

    /// The most complete row available: the new row, else the old one.
    pub fn record(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }

    pub fn id(&self) -> Option<&str> {
        self.record()?.get("id")?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_shape() {
        let msg = PhoenixMessage::join(
            "realtime:messages-1",
            "1".into(),
            json!({"postgres_changes": [{"event": "*", "schema": "public", "table": "messages"}]}),
            Some("jwt"),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["ref"], "1");
        assert_eq!(value["join_ref"], "1");
        assert_eq!(value["payload"]["access_token"], "jwt");
        assert_eq!(
            value["payload"]["config"]["postgres_changes"][0]["table"],
            "messages"
        );
    }

    #[test]
    fn test_reply_status() {
        let ok: PhoenixMessage = serde_json::from_str(
            r#"{"topic":"realtime:x","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"3"}"#,
        )
        .unwrap();
        assert_eq!(ok.reply_status().map(|(ok, _)| ok), Some(true));

        let err: PhoenixMessage = serde_json::from_str(
            r#"{"topic":"realtime:x","event":"phx_reply","payload":{"status":"error","response":{"reason":"bad filter"}},"ref":"4"}"#,
        )
        .unwrap();
        let (ok, response) = err.reply_status().unwrap();
        assert!(!ok);
        assert_eq!(response["reason"], "bad filter");
    }

    #[test]
    fn test_decode_insert_change() {
        let payload = json!({
            "ids": [1],
            "data": {
                "type": "INSERT",
                "schema": "public",
                "table": "messages",
                "commit_timestamp": "2026-03-01T10:00:00Z",
                "record": {"id": "m1", "chat_id": "c1", "content": "hi"},
                "old_record": {},
                "columns": [],
                "errors": null
            }
        });
        let event = ChangeEvent::from_payload(&payload).unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.table, "messages");
        assert_eq!(event.id(), Some("m1"));
        assert!(event.old.is_none());
    }

    #[test]
    fn test_decode_delete_change_uses_old_record() {
        let payload = json!({
            "data": {
                "type": "DELETE",
                "schema": "public",
                "table": "messages",
                "old_record": {"id": "m2"}
            }
        });
        let event = ChangeEvent::from_payload(&payload).unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(event.new.is_none());
        assert_eq!(event.id(), Some("m2"));
    }

    #[test]
    fn test_missing_data_is_error() {
        assert!(ChangeEvent::from_payload(&json!({"ids": []})).is_err());
    }
}
