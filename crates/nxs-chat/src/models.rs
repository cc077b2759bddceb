use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    Light,
    Dark,
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeSettings {
    #[serde(default)]
    pub mode: ThemeMode,
    #[serde(default = "default_primary_color")]
    pub primary_color: String,
}

fn default_primary_color() -> String {
    "#6366f1".to_string()
}

impl Default for ThemeSettings {
    fn default() -> Self {
        Self {
            mode: ThemeMode::Auto,
            primary_color: default_primary_color(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A user profile row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    pub username: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default = "default_true")]
    pub is_profile_public: bool,
    #[serde(default)]
    pub theme_settings: ThemeSettings,
    #[serde(default)]
    pub username_last_changed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub is_banned: bool,
}

impl User {
    pub fn display_name(&self) -> &str {
        if self.full_name.is_empty() {
            &self.username
        } else {
            &self.full_name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Private,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(rename = "type", default)]
    pub chat_type: ChatType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatParticipant {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub left_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Emoji,
    File,
    Video,
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "emoji" => Ok(MessageType::Emoji),
            "file" => Ok(MessageType::File),
            "video" => Ok(MessageType::Video),
            other => Err(format!("unknown message type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    /// Message this one replies to.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    /// Soft delete.
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    /// Edit timestamp.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Newest modification time known for this row.
    pub fn modified_at(&self) -> DateTime<Utc> {
        self.updated_at
            .map(|u| u.max(self.created_at))
            .unwrap_or(self.created_at)
    }

    pub fn display_content(&self) -> &str {
        if self.is_deleted {
            DELETED_PLACEHOLDER
        } else {
            &self.content
        }
    }

    pub fn is_edited(&self) -> bool {
        !self.is_deleted && self.updated_at.is_some_and(|u| u > self.created_at)
    }
}

/// Short form of a replied-to message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyPreview {
    pub id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content: String,
}

impl ReplyPreview {
    pub fn of(message: &MessageWithSender) -> Self {
        Self {
            id: message.message.id.clone(),
            sender_id: message.message.sender_id.clone(),
            sender_name: message.sender.as_ref().map(|u| u.display_name().to_string()),
            content: message.message.display_content().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageWithSender {
    pub message: Message,
    pub sender: Option<User>,
    /// Resolved from `parent_id` when the parent is loaded.
    pub reply_to: Option<ReplyPreview>,
}

impl MessageWithSender {
    pub fn new(message: Message, sender: Option<User>) -> Self {
        Self {
            message,
            sender,
            reply_to: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantWithUser {
    pub participant: ChatParticipant,
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatWithParticipants {
    pub chat: Chat,
    pub participants: Vec<ParticipantWithUser>,
    pub last_message: Option<Message>,
    pub unread_count: usize,
}

impl ChatWithParticipants {
    pub fn id(&self) -> &str {
        &self.chat.id
    }

    /// Time used to order the conversation list.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.chat.created_at)
    }

    /// The first participant that is not `user_id`.
    pub fn other_participant(&self, user_id: &str) -> Option<&ParticipantWithUser> {
        self.participants
            .iter()
            .find(|p| p.participant.user_id != user_id)
    }

    pub fn title(&self, user_id: &str) -> String {
        self.other_participant(user_id)
            .and_then(|p| p.user.as_ref())
            .map(|u| u.display_name().to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Contacts,
    #[default]
    Anyone,
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "contacts" => Ok(Visibility::Contacts),
            "anyone" => Ok(Visibility::Anyone),
            other => Err(format!("unknown visibility: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub views_count: i64,
}

impl Status {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusWithUser {
    pub status: Status,
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub id: String,
    pub status_id: String,
    pub viewer_id: String,
    pub viewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomQueueEntry {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub is_waiting: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub matched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBlock {
    pub id: String,
    pub blocker_id: String,
    pub blocked_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admin {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_super_admin: bool,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    pub id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub total_users: i64,
    #[serde(default)]
    pub active_users: i64,
    #[serde(default)]
    pub total_messages: i64,
    #[serde(default)]
    pub total_chats: i64,
    #[serde(default)]
    pub new_users: i64,
    #[serde(default)]
    pub random_chats_created: i64,
    #[serde(default)]
    pub status_posted: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_platform_message_row() {
        let message: Message = serde_json::from_value(json!({
            "id": "m1",
            "chat_id": "c1",
            "sender_id": "u1",
            "message_type": "emoji",
            "content": "🎉",
            "image_url": null,
            "parent_id": null,
            "is_read": false,
            "is_deleted": false,
            "created_at": "2026-02-01T10:00:00.123456+00:00",
            "updated_at": "2026-02-01T10:00:00.123456+00:00"
        }))
        .unwrap();
        assert_eq!(message.message_type, MessageType::Emoji);
        assert!(!message.is_edited());
        assert_eq!(message.display_content(), "🎉");
    }

    #[test]
    fn test_soft_deleted_content_is_hidden() {
        let mut message: Message = serde_json::from_value(json!({
            "id": "m1", "chat_id": "c1", "sender_id": "u1",
            "content": "secret", "created_at": "2026-02-01T10:00:00Z"
        }))
        .unwrap();
        message.is_deleted = true;
        assert_eq!(message.display_content(), DELETED_PLACEHOLDER);
    }

    #[test]
    fn test_user_defaults_and_theme_field_names() {
        let user: User = serde_json::from_value(json!({
            "id": "u1",
            "username": "neo",
            "created_at": "2026-01-01T00:00:00Z",
            "theme_settings": {"mode": "dark", "primaryColor": "#000000"}
        }))
        .unwrap();
        assert!(user.is_profile_public);
        assert_eq!(user.theme_settings.mode, ThemeMode::Dark);
        assert_eq!(user.display_name(), "neo");

        let value = serde_json::to_value(&user.theme_settings).unwrap();
        assert_eq!(value["primaryColor"], "#000000");
    }

    #[test]
    fn test_chat_type_field_is_renamed() {
        let chat: Chat = serde_json::from_value(json!({
            "id": "c1", "type": "random", "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(chat.chat_type, ChatType::Random);
    }
}
