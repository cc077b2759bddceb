//! The signed-in user's conversation list, kept current from change events.

use crate::models::{ChatParticipant, ChatWithParticipants, Message};
use std::collections::{HashMap, HashSet};

/// What a change did to the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChange {
    Changed,
    Unchanged,
    /// The change refers to data the list does not hold.
    RefetchNeeded,
}

#[derive(Debug, Clone)]
pub struct ConversationList {
    user_id: String,
    chats: Vec<ChatWithParticipants>,
    /// Unread message ids per chat.
    unread: HashMap<String, HashSet<String>>,
}

impl ConversationList {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            chats: Vec::new(),
            unread: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn chats(&self) -> &[ChatWithParticipants] {
        &self.chats
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn get(&self, chat_id: &str) -> Option<&ChatWithParticipants> {
        self.chats.iter().find(|c| c.id() == chat_id)
    }

    pub fn total_unread(&self) -> usize {
        self.chats.iter().map(|c| c.unread_count).sum()
    }

    /// Replace the list from a fetch. `unread_ids` lists the unread
    /// message ids of each chat.
    pub fn replace(
        &mut self,
        chats: Vec<ChatWithParticipants>,
        unread_ids: HashMap<String, HashSet<String>>,
    ) {
        self.chats = chats;
        self.unread = unread_ids;
        for chat in &mut self.chats {
            chat.unread_count = self.unread.get(&chat.chat.id).map_or(0, |s| s.len());
        }
        self.sort();
    }

    fn sort(&mut self) {
        self.chats.sort_by(|a, b| {
            b.activity_at()
                .cmp(&a.activity_at())
                .then_with(|| a.id().cmp(b.id()))
        });
    }

    fn index_of(&self, chat_id: &str) -> Option<usize> {
        self.chats.iter().position(|c| c.id() == chat_id)
    }

    fn counts_as_unread(&self, message: &Message) -> bool {
        message.sender_id != self.user_id && !message.is_read && !message.is_deleted
    }

    fn track_unread(&mut self, message: &Message) -> bool {
        let counts = self.counts_as_unread(message);
        let set = self.unread.entry(message.chat_id.clone()).or_default();
        let changed = if counts {
            set.insert(message.id.clone())
        } else {
            set.remove(&message.id)
        };
        let count = set.len();
        if let Some(idx) = self.index_of(&message.chat_id) {
            self.chats[idx].unread_count = count;
        }
        changed
    }

    pub fn apply_message_insert(&mut self, message: &Message) -> ListChange {
        let Some(idx) = self.index_of(&message.chat_id) else {
            return ListChange::RefetchNeeded;
        };
        let newer = self.chats[idx]
            .last_message
            .as_ref()
            .map_or(true, |last| (message.created_at, &message.id) > (last.created_at, &last.id));
        if newer {
            self.chats[idx].last_message = Some(message.clone());
        }
        let unread_changed = self.track_unread(message);
        if newer {
            self.sort();
        }
        if newer || unread_changed {
            ListChange::Changed
        } else {
            ListChange::Unchanged
        }
    }

    pub fn apply_message_update(&mut self, message: &Message) -> ListChange {
        let Some(idx) = self.index_of(&message.chat_id) else {
            return ListChange::RefetchNeeded;
        };
        let mut changed = false;
        if let Some(last) = &self.chats[idx].last_message {
            if last.id == message.id && last != message {
                self.chats[idx].last_message = Some(message.clone());
                changed = true;
            }
        }
        if self.track_unread(message) {
            changed = true;
        }
        if changed {
            ListChange::Changed
        } else {
            ListChange::Unchanged
        }
    }

    /// Hard delete of a message row. Losing the last message leaves no
    /// local way to find the previous one.
    pub fn apply_message_delete(&mut self, chat_id: Option<&str>, message_id: &str) -> ListChange {
        let mut changed = false;
        for (cid, set) in self.unread.iter_mut() {
            if chat_id.is_some_and(|c| c != cid) {
                continue;
            }
            if set.remove(message_id) {
                changed = true;
                if let Some(chat) = self.chats.iter_mut().find(|c| c.chat.id == *cid) {
                    chat.unread_count = set.len();
                }
            }
        }
        let was_last = self.chats.iter().any(|c| {
            c.last_message.as_ref().is_some_and(|m| m.id == message_id)
        });
        if was_last {
            return ListChange::RefetchNeeded;
        }
        if changed {
            ListChange::Changed
        } else {
            ListChange::Unchanged
        }
    }

    pub fn apply_participation(&mut self, participant: &ChatParticipant) -> ListChange {
        let known = self.index_of(&participant.chat_id);
        let mine = participant.user_id == self.user_id;
        match (mine, participant.is_active, known) {
            (true, false, Some(idx)) => {
                self.chats.remove(idx);
                self.unread.remove(&participant.chat_id);
                ListChange::Changed
            }
            (true, false, None) => ListChange::Unchanged,
            (true, true, None) => ListChange::RefetchNeeded,
            (true, true, Some(_)) => ListChange::Unchanged,
            (false, _, Some(_)) => ListChange::RefetchNeeded,
            (false, _, None) => ListChange::Unchanged,
        }
    }

    /// Drop a chat whose participation row was deleted outright.
    pub fn remove_chat(&mut self, chat_id: &str) -> ListChange {
        match self.index_of(chat_id) {
            Some(idx) => {
                self.chats.remove(idx);
                self.unread.remove(chat_id);
                ListChange::Changed
            }
            None => ListChange::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chat, ChatType};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn chat(id: &str, created: i64) -> ChatWithParticipants {
        ChatWithParticipants {
            chat: Chat {
                id: id.to_string(),
                chat_type: ChatType::Private,
                created_at: at(created),
                updated_at: None,
            },
            participants: Vec::new(),
            last_message: None,
            unread_count: 0,
        }
    }

    fn message(id: &str, chat_id: &str, sender: &str, created: i64) -> Message {
        Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender.to_string(),
            message_type: Default::default(),
            content: "hi".to_string(),
            image_url: None,
            file_url: None,
            parent_id: None,
            is_read: false,
            is_deleted: false,
            created_at: at(created),
            updated_at: None,
        }
    }

    fn participation(chat_id: &str, user_id: &str, active: bool) -> ChatParticipant {
        ChatParticipant {
            id: format!("{}-{}", chat_id, user_id),
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            joined_at: at(0),
            left_at: None,
            is_active: active,
        }
    }

    fn list() -> ConversationList {
        let mut list = ConversationList::new("me");
        list.replace(vec![chat("a", 10), chat("b", 20)], HashMap::new());
        list
    }

    fn order(list: &ConversationList) -> Vec<&str> {
        list.chats().iter().map(|c| c.id()).collect()
    }

    #[test]
    fn test_sorted_by_activity() {
        assert_eq!(order(&list()), vec!["b", "a"]);
    }

    #[test]
    fn test_insert_moves_chat_to_top_and_counts_unread() {
        let mut list = list();
        assert_eq!(
            list.apply_message_insert(&message("m1", "a", "them", 30)),
            ListChange::Changed
        );
        assert_eq!(order(&list), vec!["a", "b"]);
        assert_eq!(list.get("a").unwrap().unread_count, 1);

        // Echo of the same row is a no-op.
        assert_eq!(
            list.apply_message_insert(&message("m1", "a", "them", 30)),
            ListChange::Unchanged
        );
        assert_eq!(list.total_unread(), 1);

        // Own messages never count.
        list.apply_message_insert(&message("m2", "b", "me", 40));
        assert_eq!(order(&list), vec!["b", "a"]);
        assert_eq!(list.get("b").unwrap().unread_count, 0);
    }

    #[test]
    fn test_older_insert_keeps_pointer() {
        let mut list = list();
        list.apply_message_insert(&message("m2", "a", "them", 50));
        list.apply_message_insert(&message("m1", "a", "them", 40));
        assert_eq!(list.get("a").unwrap().last_message.as_ref().unwrap().id, "m2");
        assert_eq!(list.get("a").unwrap().unread_count, 2);
    }

    #[test]
    fn test_unknown_chat_needs_refetch() {
        let mut list = list();
        assert_eq!(
            list.apply_message_insert(&message("m1", "zz", "them", 30)),
            ListChange::RefetchNeeded
        );
    }

    #[test]
    fn test_read_update_clears_unread() {
        let mut list = list();
        let mut m = message("m1", "a", "them", 30);
        list.apply_message_insert(&m);
        m.is_read = true;
        assert_eq!(list.apply_message_update(&m), ListChange::Changed);
        assert_eq!(list.get("a").unwrap().unread_count, 0);
        assert!(list.get("a").unwrap().last_message.as_ref().unwrap().is_read);
        assert_eq!(list.apply_message_update(&m), ListChange::Unchanged);
    }

    #[test]
    fn test_deleting_last_message_needs_refetch() {
        let mut list = list();
        list.apply_message_insert(&message("m1", "a", "them", 30));
        list.apply_message_insert(&message("m2", "a", "them", 31));
        assert_eq!(list.apply_message_delete(None, "m1"), ListChange::Changed);
        assert_eq!(list.get("a").unwrap().unread_count, 1);
        assert_eq!(list.apply_message_delete(Some("a"), "m2"), ListChange::RefetchNeeded);
    }

    #[test]
    fn test_participation_changes() {
        let mut list = list();
        assert_eq!(
            list.apply_participation(&participation("a", "me", false)),
            ListChange::Changed
        );
        assert_eq!(order(&list), vec!["b"]);
        assert_eq!(
            list.apply_participation(&participation("new", "me", true)),
            ListChange::RefetchNeeded
        );
        assert_eq!(
            list.apply_participation(&participation("b", "them", false)),
            ListChange::RefetchNeeded
        );
        assert_eq!(
            list.apply_participation(&participation("other", "them", true)),
            ListChange::Unchanged
        );
        assert_eq!(list.remove_chat("b"), ListChange::Changed);
        assert!(list.is_empty());
    }
}
