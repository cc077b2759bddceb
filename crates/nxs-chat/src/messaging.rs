//! Direct messaging: conversation list queries, sends, edits and chat
//! creation.

use crate::blocks::Blocks;
use crate::conversations::ConversationList;
use crate::error::{ChatError, Result};
use crate::events::EventBus;
use crate::models::{
    Chat, ChatParticipant, ChatType, ChatWithParticipants, Message, MessageType,
    MessageWithSender, ParticipantWithUser,
};
use crate::profiles::Profiles;
use crate::schema::{self, CHATS, CHAT_PARTICIPANTS, MESSAGES};
use crate::session::{ChatSession, ConversationFeed};
use crate::settings::SystemSettings;
use crate::timeline::MessageTimeline;
use chrono::{DateTime, Utc};
use nxs_backend::{row, Backend, Query, Row};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Content of a message about to be sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewMessage {
    pub content: String,
    pub message_type: MessageType,
    pub parent_id: Option<String>,
    pub image_url: Option<String>,
    pub file_url: Option<String>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn reply_to(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self.message_type = MessageType::Image;
        self
    }

    pub fn with_file(mut self, url: impl Into<String>) -> Self {
        self.file_url = Some(url.into());
        self.message_type = MessageType::File;
        self
    }

    fn has_attachment(&self) -> bool {
        self.image_url.is_some() || self.file_url.is_some()
    }
}

/// Trim and length-check message text.
pub fn validate_content(content: &str, max_len: usize, allow_empty: bool) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() && !allow_empty {
        return Err(ChatError::validation("Message cannot be empty"));
    }
    if trimmed.chars().count() > max_len {
        return Err(ChatError::validation(format!(
            "Message is too long (max {} characters)",
            max_len
        )));
    }
    Ok(trimmed.to_string())
}

/// Timestamp for a change to `message`. Never at or before its last change.
fn edit_time(message: &Message) -> DateTime<Utc> {
    Utc::now().max(message.modified_at() + chrono::Duration::microseconds(1))
}

#[derive(Deserialize)]
struct UnreadRow {
    id: String,
    chat_id: String,
}

#[derive(Clone)]
pub struct ChatService {
    backend: Arc<dyn Backend>,
    profiles: Arc<Profiles>,
    blocks: Blocks,
    settings: Arc<RwLock<SystemSettings>>,
    events: EventBus,
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService").finish_non_exhaustive()
    }
}

impl ChatService {
    pub fn new(
        backend: Arc<dyn Backend>,
        profiles: Arc<Profiles>,
        settings: Arc<RwLock<SystemSettings>>,
        events: EventBus,
    ) -> Self {
        Self {
            blocks: Blocks::new(backend.clone()),
            backend,
            profiles,
            settings,
            events,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn profiles(&self) -> &Arc<Profiles> {
        &self.profiles
    }

    pub fn blocks(&self) -> &Blocks {
        &self.blocks
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The user's conversations, newest activity first.
    pub async fn fetch_chats(&self, user_id: &str) -> Result<Vec<ChatWithParticipants>> {
        Ok(self.load_conversations(user_id).await?.chats().to_vec())
    }

    /// Fetch everything the conversation list shows for `user_id`.
    pub async fn load_conversations(&self, user_id: &str) -> Result<ConversationList> {
        let mut list = ConversationList::new(user_id);

        let mine: Vec<ChatParticipant> = schema::decode_rows(
            CHAT_PARTICIPANTS,
            self.backend
                .select(
                    CHAT_PARTICIPANTS,
                    &Query::new().eq("user_id", user_id).eq("is_active", true),
                )
                .await?,
        )?;
        if mine.is_empty() {
            return Ok(list);
        }
        let chat_ids: Vec<String> = mine.into_iter().map(|p| p.chat_id).collect();

        let chats: Vec<Chat> = schema::decode_rows(
            CHATS,
            self.backend
                .select(CHATS, &Query::new().is_in("id", chat_ids.clone()))
                .await?,
        )?;

        let participants: Vec<ChatParticipant> = schema::decode_rows(
            CHAT_PARTICIPANTS,
            self.backend
                .select(
                    CHAT_PARTICIPANTS,
                    &Query::new()
                        .is_in("chat_id", chat_ids.clone())
                        .eq("is_active", true),
                )
                .await?,
        )?;
        let user_ids: Vec<String> = participants.iter().map(|p| p.user_id.clone()).collect();
        let users = self.profiles.get_many(&user_ids).await?;

        let mut by_chat: HashMap<String, Vec<ParticipantWithUser>> = HashMap::new();
        for participant in participants {
            let user = users.get(&participant.user_id).cloned();
            by_chat
                .entry(participant.chat_id.clone())
                .or_default()
                .push(ParticipantWithUser { participant, user });
        }

        let mut result = Vec::with_capacity(chats.len());
        for chat in chats {
            let last_message = self.latest_message(&chat.id).await?;
            result.push(ChatWithParticipants {
                participants: by_chat.remove(&chat.id).unwrap_or_default(),
                chat,
                last_message,
                unread_count: 0,
            });
        }

        let unread_rows: Vec<UnreadRow> = schema::decode_rows(
            MESSAGES,
            self.backend
                .select(
                    MESSAGES,
                    &Query::new()
                        .select("id,chat_id")
                        .is_in("chat_id", chat_ids)
                        .neq("sender_id", user_id)
                        .eq("is_read", false)
                        .eq("is_deleted", false),
                )
                .await?,
        )?;
        let mut unread: HashMap<String, HashSet<String>> = HashMap::new();
        for r in unread_rows {
            unread.entry(r.chat_id).or_default().insert(r.id);
        }

        list.replace(result, unread);
        tracing::debug!("[Chat] {} conversation(s) for {}", list.len(), user_id);
        Ok(list)
    }

    async fn latest_message(&self, chat_id: &str) -> Result<Option<Message>> {
        let rows = self
            .backend
            .select(
                MESSAGES,
                &Query::new()
                    .eq("chat_id", chat_id)
                    .order("created_at", false)
                    .order("id", false)
                    .limit(1),
            )
            .await?;
        Ok(schema::decode_rows(MESSAGES, rows)?.into_iter().next())
    }

    /// Full history of a chat, oldest first, with senders and replies
    /// resolved.
    pub async fn fetch_messages(&self, chat_id: &str) -> Result<Vec<MessageWithSender>> {
        let rows = self
            .backend
            .select(
                MESSAGES,
                &Query::new()
                    .eq("chat_id", chat_id)
                    .order("created_at", true)
                    .order("id", true),
            )
            .await?;
        let messages: Vec<Message> = schema::decode_rows(MESSAGES, rows)?;

        let sender_ids: Vec<String> = messages.iter().map(|m| m.sender_id.clone()).collect();
        let senders = self.profiles.get_many(&sender_ids).await?;
        let items = messages
            .into_iter()
            .map(|m| {
                let sender = senders.get(&m.sender_id).cloned();
                MessageWithSender::new(m, sender)
            })
            .collect();

        let mut timeline = MessageTimeline::new(chat_id);
        let ticket = timeline.begin_fetch();
        timeline.apply_snapshot(ticket, items);
        Ok(timeline.messages().to_vec())
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Message> {
        let rows = self
            .backend
            .select(MESSAGES, &Query::new().eq("id", message_id).limit(1))
            .await?;
        schema::first_row(MESSAGES, rows)
            .map_err(|_| ChatError::not_found(format!("message {}", message_id)))
    }

    /// Active participants of a chat other than `user_id`.
    async fn other_participants(&self, chat_id: &str, user_id: &str) -> Result<Vec<String>> {
        let rows: Vec<ChatParticipant> = schema::decode_rows(
            CHAT_PARTICIPANTS,
            self.backend
                .select(
                    CHAT_PARTICIPANTS,
                    &Query::new()
                        .eq("chat_id", chat_id)
                        .neq("user_id", user_id)
                        .eq("is_active", true),
                )
                .await?,
        )?;
        Ok(rows.into_iter().map(|p| p.user_id).collect())
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        message: NewMessage,
    ) -> Result<MessageWithSender> {
        let max_len = self.settings.read().max_message_length;
        let content = validate_content(&message.content, max_len, message.has_attachment())?;

        for other in self.other_participants(chat_id, sender_id).await? {
            if self.blocks.is_blocked(sender_id, &other).await? {
                return Err(ChatError::Blocked);
            }
        }

        let mut new_row = row([
            ("chat_id", json!(chat_id)),
            ("sender_id", json!(sender_id)),
            ("content", json!(content)),
            ("message_type", serde_json::to_value(message.message_type).unwrap_or(Value::Null)),
        ]);
        if let Some(parent_id) = message.parent_id {
            new_row.insert("parent_id".into(), json!(parent_id));
        }
        if let Some(url) = message.image_url {
            new_row.insert("image_url".into(), json!(url));
        }
        if let Some(url) = message.file_url {
            new_row.insert("file_url".into(), json!(url));
        }

        let stored: Message = schema::first_row(
            MESSAGES,
            self.backend.insert(MESSAGES, vec![new_row]).await?,
        )?;
        tracing::debug!("[Chat] sent {} in {}", stored.id, chat_id);
        let sender = self.profiles.get(sender_id).await?;
        Ok(MessageWithSender::new(stored, sender))
    }

    async fn own_message(&self, message_id: &str, user_id: &str) -> Result<Message> {
        let message = self.get_message(message_id).await?;
        if message.sender_id != user_id {
            return Err(ChatError::forbidden("only the sender can change a message"));
        }
        Ok(message)
    }

    async fn patch_message(&self, message_id: &str, patch: Row) -> Result<Message> {
        let rows = self
            .backend
            .update(MESSAGES, &Query::new().eq("id", message_id), patch)
            .await?;
        schema::first_row(MESSAGES, rows)
    }

    pub async fn edit_message(
        &self,
        message_id: &str,
        editor_id: &str,
        new_content: &str,
    ) -> Result<Message> {
        let message = self.own_message(message_id, editor_id).await?;
        if message.is_deleted {
            return Err(ChatError::validation("Cannot edit a deleted message"));
        }
        let max_len = self.settings.read().max_message_length;
        let content = validate_content(new_content, max_len, false)?;
        self.patch_message(
            message_id,
            row([
                ("content", json!(content)),
                ("updated_at", json!(edit_time(&message))),
            ]),
        )
        .await
    }

    /// Soft delete: the row stays with `is_deleted` set.
    pub async fn delete_message(&self, message_id: &str, user_id: &str) -> Result<Message> {
        let message = self.own_message(message_id, user_id).await?;
        if message.is_deleted {
            return Ok(message);
        }
        self.patch_message(
            message_id,
            row([
                ("is_deleted", json!(true)),
                ("updated_at", json!(edit_time(&message))),
            ]),
        )
        .await
    }

    /// Reuse the active private chat of the two users, or create one.
    pub async fn create_chat(&self, user_id: &str, participant_id: &str) -> Result<Chat> {
        if user_id == participant_id {
            return Err(ChatError::validation("You cannot start a chat with yourself"));
        }
        if self.blocks.is_blocked(user_id, participant_id).await? {
            return Err(ChatError::Blocked);
        }

        if let Some(chat) = self.find_private_chat(user_id, participant_id).await? {
            tracing::debug!("[Chat] reusing {} for {} and {}", chat.id, user_id, participant_id);
            return Ok(chat);
        }
        let chat = self.create_chat_of_type(ChatType::Private, &[user_id, participant_id]).await?;
        tracing::info!("[Chat] created {} for {} and {}", chat.id, user_id, participant_id);
        Ok(chat)
    }

    async fn find_private_chat(&self, a: &str, b: &str) -> Result<Option<Chat>> {
        let participations: Vec<ChatParticipant> = schema::decode_rows(
            CHAT_PARTICIPANTS,
            self.backend
                .select(
                    CHAT_PARTICIPANTS,
                    &Query::new().is_in("user_id", [a, b]).eq("is_active", true),
                )
                .await?,
        )?;
        let of = |user: &str| -> HashSet<String> {
            participations
                .iter()
                .filter(|p| p.user_id == user)
                .map(|p| p.chat_id.clone())
                .collect()
        };
        let shared: Vec<String> = of(a).intersection(&of(b)).cloned().collect();
        if shared.is_empty() {
            return Ok(None);
        }
        let chats: Vec<Chat> = schema::decode_rows(
            CHATS,
            self.backend
                .select(
                    CHATS,
                    &Query::new()
                        .is_in("id", shared)
                        .eq("type", "private")
                        .order("created_at", true)
                        .limit(1),
                )
                .await?,
        )?;
        Ok(chats.into_iter().next())
    }

    pub(crate) async fn create_chat_of_type(
        &self,
        chat_type: ChatType,
        user_ids: &[&str],
    ) -> Result<Chat> {
        let chat: Chat = schema::first_row(
            CHATS,
            self.backend
                .insert(
                    CHATS,
                    vec![row([(
                        "type",
                        serde_json::to_value(chat_type).unwrap_or(Value::Null),
                    )])],
                )
                .await?,
        )?;
        let participants = user_ids
            .iter()
            .map(|uid| row([("chat_id", json!(chat.id)), ("user_id", json!(uid))]))
            .collect();
        self.backend.insert(CHAT_PARTICIPANTS, participants).await?;
        Ok(chat)
    }

    /// Mark messages from others in `chat_id` as read. Returns how many
    /// changed.
    pub async fn mark_messages_as_read(&self, chat_id: &str, user_id: &str) -> Result<usize> {
        let updated = self
            .backend
            .update(
                MESSAGES,
                &Query::new()
                    .eq("chat_id", chat_id)
                    .neq("sender_id", user_id)
                    .eq("is_read", false),
                row([("is_read", json!(true))]),
            )
            .await?;
        Ok(updated.len())
    }

    /// Open a live view of one chat.
    pub async fn open_chat(&self, chat_id: &str, user_id: &str) -> Result<ChatSession> {
        ChatSession::open(self.clone(), chat_id, user_id).await
    }

    /// Keep the conversation list of `user_id` current.
    pub async fn watch_chats(&self, user_id: &str) -> Result<ConversationFeed> {
        ConversationFeed::open(self.clone(), user_id).await
    }
}
