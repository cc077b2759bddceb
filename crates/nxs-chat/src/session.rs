//! Live views driven by change streams: one chat's timeline and the
//! conversation list.
//!
//! Each view subscribes before fetching so nothing committed between the two
//! is missed, then a background task applies events under the view's lock.
//! When a subscription comes back from `Reconnecting` the view refetches,
//! since events sent while the socket was down are not replayed.

use crate::conversations::{ConversationList, ListChange};
use crate::error::Result;
use crate::events::{ChatEvent, EventBus};
use crate::messaging::{ChatService, NewMessage};
use crate::models::{ChatParticipant, ChatWithParticipants, Message, MessageWithSender, User};
use crate::schema::{self, CHAT_PARTICIPANTS, MESSAGES};
use crate::timeline::{Applied, MessageTimeline};
use nxs_backend::{
    Backend, ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, SubscriptionGuard,
    SubscriptionStatus,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Decides when a status change calls for a refetch.
///
/// Status updates coalesce, so a `Reconnecting` in between may never be
/// observed; any `Joined` notification after the first join counts as a
/// rejoin.
#[derive(Debug)]
struct Reconnects {
    armed: bool,
}

impl Reconnects {
    fn new(initial: SubscriptionStatus) -> Self {
        Self {
            armed: initial != SubscriptionStatus::Joining,
        }
    }

    /// Take the current status as the starting point. The join that
    /// completed inside `subscribe` is then not reported as a change.
    fn start(status: &mut watch::Receiver<SubscriptionStatus>) -> Self {
        Self::new(*status.borrow_and_update())
    }

    fn observe(&mut self, status: SubscriptionStatus) -> bool {
        if status != SubscriptionStatus::Joined {
            return false;
        }
        std::mem::replace(&mut self.armed, true)
    }
}

struct TimelineShared {
    timeline: Mutex<MessageTimeline>,
    revision: watch::Sender<u64>,
}

impl TimelineShared {
    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

/// An open chat. Dropping it stops the background task and unsubscribes.
pub struct ChatSession {
    chat_id: String,
    user_id: String,
    service: ChatService,
    shared: Arc<TimelineShared>,
    status: watch::Receiver<SubscriptionStatus>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("chat_id", &self.chat_id)
            .field("user_id", &self.user_id)
            .field("messages", &self.shared.timeline.lock().len())
            .finish()
    }
}

impl ChatSession {
    pub(crate) async fn open(service: ChatService, chat_id: &str, user_id: &str) -> Result<Self> {
        let stream = service
            .backend()
            .subscribe(ChangeFilter::table(MESSAGES).eq("chat_id", chat_id))
            .await?;
        let (events, status, guard) = stream.into_parts();

        let (revision, _) = watch::channel(0);
        let shared = Arc::new(TimelineShared {
            timeline: Mutex::new(MessageTimeline::new(chat_id)),
            revision,
        });

        let task = tokio::spawn(run_timeline(
            service.clone(),
            Arc::clone(&shared),
            chat_id.to_string(),
            events,
            status.clone(),
            guard,
        ));

        let session = Self {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            service,
            shared,
            status,
            task,
        };
        session.refresh().await?;
        tracing::info!("[Session] opened {} for {}", session.chat_id, session.user_id);
        Ok(session)
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn messages(&self) -> Vec<MessageWithSender> {
        self.shared.timeline.lock().messages().to_vec()
    }

    pub fn len(&self) -> usize {
        self.shared.timeline.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unread_count(&self) -> usize {
        self.shared.timeline.lock().unread_for(&self.user_id)
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    /// Run `f` against the current timeline.
    pub fn with_timeline<R>(&self, f: impl FnOnce(&MessageTimeline) -> R) -> R {
        f(&self.shared.timeline.lock())
    }

    /// Wait until `pred` holds for the timeline. Returns `false` on timeout.
    pub async fn wait_until<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&MessageTimeline) -> bool,
    {
        let mut revision = self.shared.revision.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let done = pred(&self.shared.timeline.lock());
                if done || revision.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        waited.is_ok() && pred(&self.shared.timeline.lock())
    }

    /// Fetch the history again and merge it with what realtime delivered.
    pub async fn refresh(&self) -> Result<()> {
        refetch(&self.service, &self.shared, &self.chat_id).await
    }

    /// Send a message and show it without waiting for the realtime echo.
    pub async fn send(&self, message: NewMessage) -> Result<MessageWithSender> {
        let sent = self
            .service
            .send_message(&self.chat_id, &self.user_id, message)
            .await?;
        self.apply_local(sent.message.clone(), sent.sender.clone());
        Ok(sent)
    }

    pub async fn edit(&self, message_id: &str, content: &str) -> Result<Message> {
        let message = self
            .service
            .edit_message(message_id, &self.user_id, content)
            .await?;
        self.apply_local(message.clone(), None);
        Ok(message)
    }

    pub async fn delete(&self, message_id: &str) -> Result<Message> {
        let message = self
            .service
            .delete_message(message_id, &self.user_id)
            .await?;
        self.apply_local(message.clone(), None);
        Ok(message)
    }

    pub async fn mark_read(&self) -> Result<usize> {
        self.service
            .mark_messages_as_read(&self.chat_id, &self.user_id)
            .await
    }

    fn apply_local(&self, message: Message, sender: Option<User>) {
        let applied = self.shared.timeline.lock().apply_row(message, sender);
        publish(self.service.events(), &self.chat_id, applied);
        self.shared.bump();
    }

    /// Stop listening.
    pub fn close(self) {}
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!("[Session] closed {}", self.chat_id);
    }
}

fn publish(events: &EventBus, chat_id: &str, applied: Applied) {
    let chat_id = chat_id.to_string();
    match applied {
        Applied::Inserted(message) => events.emit(ChatEvent::MessageAdded { chat_id, message }),
        Applied::Updated(message) => events.emit(ChatEvent::MessageUpdated { chat_id, message }),
        Applied::Removed(message_id) => {
            events.emit(ChatEvent::MessageRemoved { chat_id, message_id })
        }
        Applied::Ignored => {}
    }
}

async fn refetch(service: &ChatService, shared: &TimelineShared, chat_id: &str) -> Result<()> {
    let ticket = shared.timeline.lock().begin_fetch();
    let snapshot = service.fetch_messages(chat_id).await?;
    let applied = {
        let mut timeline = shared.timeline.lock();
        timeline
            .apply_snapshot(ticket, snapshot)
            .then(|| timeline.len())
    };
    if let Some(len) = applied {
        service.events().emit(ChatEvent::TimelineLoaded {
            chat_id: chat_id.to_string(),
            len,
        });
        shared.bump();
    }
    Ok(())
}

async fn run_timeline(
    service: ChatService,
    shared: Arc<TimelineShared>,
    chat_id: String,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    mut status: watch::Receiver<SubscriptionStatus>,
    _guard: SubscriptionGuard,
) {
    let mut reconnects = Reconnects::start(&mut status);
    let mut status_open = true;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                apply_message_event(&service, &shared, &chat_id, event).await;
            }
            changed = status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                let current = *status.borrow_and_update();
                service.events().emit(ChatEvent::ConnectionChanged { status: current });
                if reconnects.observe(current) {
                    tracing::info!("[Session] {} rejoined, refetching", chat_id);
                    if let Err(e) = refetch(&service, &shared, &chat_id).await {
                        tracing::warn!("[Session] refetch of {} failed: {}", chat_id, e);
                        service.events().emit(ChatEvent::RefetchNeeded {
                            chat_id: Some(chat_id.clone()),
                        });
                    }
                }
                if current == SubscriptionStatus::Closed {
                    break;
                }
            }
        }
    }
    tracing::debug!("[Session] event loop for {} ended", chat_id);
}

async fn apply_message_event(
    service: &ChatService,
    shared: &TimelineShared,
    chat_id: &str,
    event: ChangeEvent,
) {
    let applied = match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let Some(row) = event.new else { return };
            let message: Message = match schema::decode_row(MESSAGES, row) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("[Session] skipping undecodable message: {}", e);
                    return;
                }
            };
            // Senders of rows already on screen are kept by the timeline.
            let known = shared.timeline.lock().contains(&message.id);
            let sender = if known {
                None
            } else {
                match service.profiles().get(&message.sender_id).await {
                    Ok(user) => user,
                    Err(e) => {
                        tracing::warn!("[Session] sender lookup failed: {}", e);
                        None
                    }
                }
            };
            shared.timeline.lock().apply_row(message, sender)
        }
        ChangeKind::Delete => {
            let Some(id) = event.id().map(str::to_string) else {
                return;
            };
            shared.timeline.lock().apply_delete(&id)
        }
    };
    if !applied.is_ignored() {
        publish(service.events(), chat_id, applied);
        shared.bump();
    }
}

struct FeedShared {
    list: Mutex<ConversationList>,
    revision: watch::Sender<u64>,
}

/// The conversation list of one user, patched by message and participation
/// changes. Dropping it stops the background task.
pub struct ConversationFeed {
    user_id: String,
    shared: Arc<FeedShared>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ConversationFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationFeed")
            .field("user_id", &self.user_id)
            .field("chats", &self.shared.list.lock().len())
            .finish()
    }
}

impl ConversationFeed {
    pub(crate) async fn open(service: ChatService, user_id: &str) -> Result<Self> {
        let messages = service
            .backend()
            .subscribe(ChangeFilter::table(MESSAGES))
            .await?;
        let participants = service
            .backend()
            .subscribe(ChangeFilter::table(CHAT_PARTICIPANTS))
            .await?;

        let list = service.load_conversations(user_id).await?;
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(FeedShared {
            list: Mutex::new(list),
            revision,
        });
        let task = tokio::spawn(run_feed(
            service,
            Arc::clone(&shared),
            user_id.to_string(),
            messages,
            participants,
        ));
        Ok(Self {
            user_id: user_id.to_string(),
            shared,
            task,
        })
    }

    pub fn chats(&self) -> Vec<ChatWithParticipants> {
        self.shared.list.lock().chats().to_vec()
    }

    pub fn total_unread(&self) -> usize {
        self.shared.list.lock().total_unread()
    }

    /// Wait until `pred` holds for the list. Returns `false` on timeout.
    pub async fn wait_until<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&ConversationList) -> bool,
    {
        let mut revision = self.shared.revision.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let done = pred(&self.shared.list.lock());
                if done || revision.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        waited.is_ok() && pred(&self.shared.list.lock())
    }
}

impl Drop for ConversationFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_feed(
    service: ChatService,
    shared: Arc<FeedShared>,
    user_id: String,
    mut messages: ChangeStream,
    mut participants: ChangeStream,
) {
    let mut status = messages.status_watch();
    let mut reconnects = Reconnects::start(&mut status);
    let mut status_open = true;
    loop {
        let change = tokio::select! {
            event = messages.recv() => match event {
                Some(event) => apply_feed_message(&shared, &event),
                None => break,
            },
            event = participants.recv() => match event {
                Some(event) => apply_feed_participant(&shared, &event),
                None => break,
            },
            changed = status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                let current = *status.borrow_and_update();
                if reconnects.observe(current) {
                    ListChange::RefetchNeeded
                } else {
                    ListChange::Unchanged
                }
            }
        };

        match change {
            ListChange::Unchanged => continue,
            ListChange::Changed => {}
            ListChange::RefetchNeeded => match service.load_conversations(&user_id).await {
                Ok(fresh) => *shared.list.lock() = fresh,
                Err(e) => {
                    tracing::warn!("[Feed] reload for {} failed: {}", user_id, e);
                    service.events().emit(ChatEvent::RefetchNeeded { chat_id: None });
                    continue;
                }
            },
        }
        shared.revision.send_modify(|r| *r += 1);
        service.events().emit(ChatEvent::ConversationsChanged);
    }
    tracing::debug!("[Feed] event loop for {} ended", user_id);
}

fn apply_feed_message(shared: &FeedShared, event: &ChangeEvent) -> ListChange {
    let mut list = shared.list.lock();
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let Some(message) = event
                .new
                .clone()
                .and_then(|r| schema::decode_row::<Message>(MESSAGES, r).ok())
            else {
                return ListChange::Unchanged;
            };
            if event.kind == ChangeKind::Insert {
                list.apply_message_insert(&message)
            } else {
                list.apply_message_update(&message)
            }
        }
        ChangeKind::Delete => {
            let chat_id = event
                .old
                .as_ref()
                .and_then(|r| r.get("chat_id"))
                .and_then(|v| v.as_str());
            match event.id() {
                Some(id) => list.apply_message_delete(chat_id, id),
                None => ListChange::Unchanged,
            }
        }
    }
}

fn apply_feed_participant(shared: &FeedShared, event: &ChangeEvent) -> ListChange {
    let mut list = shared.list.lock();
    match (&event.kind, &event.new) {
        (ChangeKind::Delete, _) | (_, None) => {
            let old = event.old.as_ref();
            let field = |name: &str| {
                old.and_then(|r| r.get(name))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            };
            match (field("chat_id"), field("user_id")) {
                (Some(chat_id), Some(user_id)) if user_id == list.user_id() => {
                    list.remove_chat(&chat_id)
                }
                (Some(chat_id), Some(_)) if list.get(&chat_id).is_none() => ListChange::Unchanged,
                _ => ListChange::RefetchNeeded,
            }
        }
        (_, Some(row)) => match schema::decode_row::<ChatParticipant>(CHAT_PARTICIPANTS, row.clone())
        {
            Ok(participant) => list.apply_participation(&participant),
            Err(_) => ListChange::Unchanged,
        },
    }
}
