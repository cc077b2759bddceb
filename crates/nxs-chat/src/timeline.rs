//! Ordered message list of one chat, patched by realtime changes.
//!
//! Entries are kept sorted by `(created_at, id)`. Inserts are idempotent by
//! id, updates are last-writer-wins on the edit timestamp and deletes leave
//! a tombstone so late or replayed rows cannot bring a message back.
//!
//! Snapshots race realtime delivery: a fetch may start before an event is
//! applied and finish after it. Every fetch takes a [`FetchTicket`]; when
//! its snapshot lands, entries touched by realtime after the ticket was
//! issued win over the snapshot, and a snapshot older than one already
//! applied is dropped.

use crate::models::{Message, MessageWithSender, ReplyPreview, User};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Marks the point a fetch started at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    seq: u64,
}

/// Outcome of applying one change.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Inserted(MessageWithSender),
    Updated(MessageWithSender),
    Removed(String),
    Ignored,
}

impl Applied {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Applied::Ignored)
    }
}

#[derive(Debug)]
pub struct MessageTimeline {
    chat_id: String,
    entries: Vec<MessageWithSender>,
    /// Change counter value at each id's last realtime touch.
    touched: HashMap<String, u64>,
    /// Ids removed by realtime deletes, with the counter at removal.
    tombstones: HashMap<String, u64>,
    seq: u64,
    issued_generation: u64,
    applied_generation: u64,
}

fn sort_key(a: &MessageWithSender, b: &MessageWithSender) -> Ordering {
    a.message
        .created_at
        .cmp(&b.message.created_at)
        .then_with(|| a.message.id.cmp(&b.message.id))
}

impl MessageTimeline {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            entries: Vec::new(),
            touched: HashMap::new(),
            tombstones: HashMap::new(),
            seq: 0,
            issued_generation: 0,
            applied_generation: 0,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn messages(&self) -> &[MessageWithSender] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MessageWithSender> {
        self.entries.iter().find(|e| e.message.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains_key(id)
    }

    pub fn last(&self) -> Option<&MessageWithSender> {
        self.entries.last()
    }

    /// Messages from others that `user_id` has not read.
    pub fn unread_for(&self, user_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.message.sender_id != user_id && !e.message.is_read && !e.message.is_deleted)
            .count()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn touch(&mut self, id: &str) {
        self.seq += 1;
        self.touched.insert(id.to_string(), self.seq);
    }

    fn reply_preview(&self, parent_id: Option<&str>) -> Option<ReplyPreview> {
        parent_id
            .and_then(|pid| self.get(pid))
            .map(ReplyPreview::of)
    }

    fn insert_sorted(&mut self, item: MessageWithSender) -> usize {
        let idx = self
            .entries
            .partition_point(|e| sort_key(e, &item) == Ordering::Less);
        self.entries.insert(idx, item);
        idx
    }

    /// Refresh the reply preview of every direct child of `parent_id`.
    fn refresh_children(&mut self, parent_id: &str) {
        let preview = self.reply_preview(Some(parent_id));
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.message.parent_id.as_deref() == Some(parent_id))
        {
            entry.reply_to = preview.clone();
        }
    }

    fn resolve_all_replies(&mut self) {
        let previews: Vec<Option<ReplyPreview>> = self
            .entries
            .iter()
            .map(|e| self.reply_preview(e.message.parent_id.as_deref()))
            .collect();
        for (entry, preview) in self.entries.iter_mut().zip(previews) {
            entry.reply_to = preview;
        }
    }

    /// Start a fetch. The snapshot must be applied with this ticket.
    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.issued_generation += 1;
        FetchTicket {
            generation: self.issued_generation,
            seq: self.seq,
        }
    }

    /// Replace the list with a fetched snapshot.
    ///
    /// Returns `false` when the snapshot is older than one already applied
    /// and was dropped.
    pub fn apply_snapshot(&mut self, ticket: FetchTicket, snapshot: Vec<MessageWithSender>) -> bool {
        if ticket.generation <= self.applied_generation {
            tracing::debug!(
                "[Timeline] {} dropping stale snapshot (generation {} <= {})",
                self.chat_id,
                ticket.generation,
                self.applied_generation
            );
            return false;
        }

        let touched_after = |touched: &HashMap<String, u64>, id: &str| {
            touched.get(id).is_some_and(|s| *s > ticket.seq)
        };

        let mut current: HashMap<String, MessageWithSender> = self
            .entries
            .drain(..)
            .map(|e| (e.message.id.clone(), e))
            .collect();

        let mut merged = Vec::with_capacity(snapshot.len() + current.len());
        for mut incoming in snapshot {
            if incoming.message.chat_id != self.chat_id {
                continue;
            }
            let id = incoming.message.id.clone();
            if self.tombstones.get(&id).is_some_and(|s| *s > ticket.seq) {
                continue;
            }
            match current.remove(&id) {
                Some(existing) => {
                    let keep_existing = match existing
                        .message
                        .modified_at()
                        .cmp(&incoming.message.modified_at())
                    {
                        Ordering::Greater => true,
                        Ordering::Equal => touched_after(&self.touched, &id),
                        Ordering::Less => false,
                    };
                    if keep_existing {
                        merged.push(existing);
                    } else {
                        if incoming.sender.is_none() {
                            incoming.sender = existing.sender;
                        }
                        merged.push(incoming);
                    }
                }
                None => merged.push(incoming),
            }
        }

        // Rows only known locally survive when realtime delivered them after
        // the fetch began.
        for (id, existing) in current {
            if touched_after(&self.touched, &id) {
                merged.push(existing);
            }
        }

        merged.sort_by(sort_key);
        merged.dedup_by(|a, b| a.message.id == b.message.id);
        self.entries = merged;
        self.resolve_all_replies();

        self.applied_generation = ticket.generation;
        self.touched.retain(|_, s| *s > ticket.seq);
        // The snapshot already reflects deletes seen before the fetch began.
        self.tombstones.retain(|_, s| *s > ticket.seq);
        tracing::debug!(
            "[Timeline] {} snapshot applied, {} message(s)",
            self.chat_id,
            self.entries.len()
        );
        true
    }

    pub fn apply_insert(&mut self, mut item: MessageWithSender) -> Applied {
        if item.message.chat_id != self.chat_id || self.is_tombstoned(item.id()) {
            return Applied::Ignored;
        }
        if let Some(existing) = self.get(item.id()) {
            if item.message.modified_at() > existing.message.modified_at() {
                return self.apply_update(item);
            }
            return Applied::Ignored;
        }

        let id = item.message.id.clone();
        item.reply_to = self.reply_preview(item.message.parent_id.as_deref());
        let idx = self.insert_sorted(item);
        self.touch(&id);
        // A parent that arrives after its replies resolves them now.
        self.refresh_children(&id);
        Applied::Inserted(self.entries[idx].clone())
    }

    /// Apply an updated row. Unknown ids are inserted.
    pub fn apply_update(&mut self, mut item: MessageWithSender) -> Applied {
        if item.message.chat_id != self.chat_id || self.is_tombstoned(item.id()) {
            return Applied::Ignored;
        }
        let Some(idx) = self.position(item.id()) else {
            return self.apply_insert(item);
        };

        let existing = self.entries.remove(idx);
        if item.message.modified_at() < existing.message.modified_at() {
            self.entries.insert(idx, existing);
            return Applied::Ignored;
        }
        if item.sender.is_none() {
            item.sender = existing.sender;
        }
        let id = item.message.id.clone();
        item.reply_to = self.reply_preview(item.message.parent_id.as_deref());
        let idx = self.insert_sorted(item);
        self.touch(&id);
        self.refresh_children(&id);
        Applied::Updated(self.entries[idx].clone())
    }

    pub fn apply_delete(&mut self, id: &str) -> Applied {
        self.seq += 1;
        self.tombstones.insert(id.to_string(), self.seq);
        self.touched.remove(id);
        let Some(idx) = self.position(id) else {
            return Applied::Ignored;
        };
        self.entries.remove(idx);
        self.refresh_children(id);
        Applied::Removed(id.to_string())
    }

    /// Apply a row from a change event, keeping the sender already known
    /// for that id.
    pub fn apply_row(&mut self, message: Message, sender: Option<User>) -> Applied {
        let item = MessageWithSender::new(message, sender);
        if self.contains(item.id()) {
            self.apply_update(item)
        } else {
            self.apply_insert(item)
        }
    }
}
