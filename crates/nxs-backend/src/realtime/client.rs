//! Realtime socket client.
//!
//! One background task owns the websocket. Subscriptions are channels on
//! that socket; the task joins them, fans `postgres_changes` frames out to
//! their streams, sends heartbeats and, when the socket drops, reconnects
//! with backoff and re-joins every live channel. Nothing emitted while the
//! socket was down is replayed.

use super::filter::ChangeFilter;
use super::protocol::{self, ChangeEvent, PhoenixMessage};
use super::subscription::{ChangeStream, SubscriptionStatus};
use crate::config::ClientConfig;
use crate::error::{BackendError, Result};
use crate::retry::{RetryDecision, RetryState};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWrite = SplitSink<Socket, Message>;
type SocketRead = SplitStream<Socket>;

enum Command {
    Join {
        topic: String,
        filter: ChangeFilter,
        events: mpsc::UnboundedSender<ChangeEvent>,
        status: watch::Sender<SubscriptionStatus>,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        topic: String,
    },
    SetToken(Option<String>),
    Shutdown,
}

struct Channel {
    filter: ChangeFilter,
    events: mpsc::UnboundedSender<ChangeEvent>,
    status: watch::Sender<SubscriptionStatus>,
    /// Pending answer to the `subscribe` call that created the channel.
    reply: Option<oneshot::Sender<Result<()>>>,
}

impl Channel {
    fn set_status(&self, status: SubscriptionStatus) {
        self.status.send_replace(status);
    }
}

/// Handle to the realtime socket. The socket task starts on first use.
pub struct RealtimeClient {
    config: ClientConfig,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    access_token: Mutex<Option<String>>,
    topic_counter: AtomicU64,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.config.url)
            .finish()
    }
}

impl RealtimeClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            commands: Mutex::new(None),
            access_token: Mutex::new(None),
            topic_counter: AtomicU64::new(0),
        }
    }

    fn sender(&self) -> mpsc::UnboundedSender<Command> {
        let mut guard = self.commands.lock();
        if let Some(tx) = guard.as_ref().filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = SocketTask::new(self.config.clone(), self.access_token.lock().clone());
        tokio::spawn(task.run(rx));
        *guard = Some(tx.clone());
        tx
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.lock() = token.clone();
        if let Some(tx) = self.commands.lock().as_ref() {
            let _ = tx.send(Command::SetToken(token));
        }
    }

    /// Join a channel for `filter` and wait for the platform to accept it.
    pub async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeStream> {
        let n = self.topic_counter.fetch_add(1, Ordering::Relaxed);
        let topic = format!("realtime:{}-{}", filter.table, n);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Joining);
        let (reply_tx, reply_rx) = oneshot::channel();

        let commands = self.sender();
        commands
            .send(Command::Join {
                topic: topic.clone(),
                filter,
                events: events_tx,
                status: status_tx,
                reply: reply_tx,
            })
            .map_err(|_| BackendError::SubscriptionClosed)?;

        match tokio::time::timeout(self.config.request_timeout(), reply_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(BackendError::SubscriptionClosed),
            Err(_) => {
                let _ = commands.send(Command::Leave { topic });
                return Err(BackendError::Timeout);
            }
        }

        tracing::info!("[Realtime] joined {}", topic);
        Ok(ChangeStream::new(events_rx, status_rx, move || {
            let _ = commands.send(Command::Leave { topic });
        }))
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.send(Command::Shutdown);
        }
    }
}

enum Exit {
    Disconnected,
    Shutdown,
}

struct SocketTask {
    config: ClientConfig,
    access_token: Option<String>,
    channels: HashMap<String, Channel>,
    /// Outstanding join refs mapped to their topic.
    pending: HashMap<String, String>,
    next_ref: u64,
}

impl SocketTask {
    fn new(config: ClientConfig, access_token: Option<String>) -> Self {
        Self {
            config,
            access_token,
            channels: HashMap::new(),
            pending: HashMap::new(),
            next_ref: 0,
        }
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut backoff = RetryState::new(self.config.reconnect.clone());

        loop {
            // Idle until someone wants a channel.
            while self.channels.is_empty() {
                match commands.recv().await {
                    Some(cmd) => {
                        if !self.handle_offline(cmd) {
                            return;
                        }
                    }
                    None => return,
                }
            }

            let url = self.config.realtime_url();
            tracing::debug!("[Realtime] connecting");
            match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    backoff.reset();
                    tracing::info!("[Realtime] connected");
                    let (write, read) = socket.split();
                    match self.connected(write, read, &mut commands).await {
                        Exit::Shutdown => {
                            self.close_all();
                            return;
                        }
                        Exit::Disconnected => {
                            tracing::warn!(
                                "[Realtime] socket dropped, {} channel(s) waiting to rejoin",
                                self.channels.len()
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("[Realtime] connect failed: {}", e);
                }
            }

            self.pending.clear();
            for channel in self.channels.values() {
                channel.set_status(SubscriptionStatus::Reconnecting);
            }

            let wait = match backoff.should_retry_error() {
                RetryDecision::Retry(wait) => wait,
                RetryDecision::DontRetry => {
                    tracing::error!("[Realtime] giving up after {} attempts", backoff.attempts);
                    self.fail_all("realtime reconnect attempts exhausted");
                    backoff.reset();
                    continue;
                }
            };
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => {
                            if !self.handle_offline(cmd) {
                                self.close_all();
                                return;
                            }
                        }
                        None => {
                            self.close_all();
                            return;
                        }
                    },
                }
            }
        }
    }

    /// Apply a command while no socket is open. Returns false on shutdown.
    fn handle_offline(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Join {
                topic,
                filter,
                events,
                status,
                reply,
            } => {
                self.channels.insert(
                    topic,
                    Channel {
                        filter,
                        events,
                        status,
                        reply: Some(reply),
                    },
                );
            }
            Command::Leave { topic } => {
                if let Some(channel) = self.channels.remove(&topic) {
                    channel.set_status(SubscriptionStatus::Closed);
                }
            }
            Command::SetToken(token) => self.access_token = token,
            Command::Shutdown => return false,
        }
        true
    }

    async fn connected(
        &mut self,
        mut write: SocketWrite,
        mut read: SocketRead,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Exit {
        let topics: Vec<String> = self.channels.keys().cloned().collect();
        for topic in topics {
            if self.send_join(&mut write, &topic).await.is_err() {
                return Exit::Disconnected;
            }
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = write.close().await;
                        return Exit::Shutdown;
                    };
                    match self.handle_online(cmd, &mut write).await {
                        Ok(true) => {}
                        Ok(false) => {
                            let _ = write.close().await;
                            return Exit::Shutdown;
                        }
                        Err(e) => {
                            tracing::warn!("[Realtime] send failed: {}", e);
                            return Exit::Disconnected;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let msg = PhoenixMessage::heartbeat(self.make_ref());
                    if let Err(e) = send_frame(&mut write, &msg).await {
                        tracing::warn!("[Realtime] heartbeat failed: {}", e);
                        return Exit::Disconnected;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.to_string();
                        if let Err(e) = self.handle_frame(&text, &mut write).await {
                            tracing::warn!("[Realtime] {}", e);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("[Realtime] server closed the socket: {:?}", frame);
                        return Exit::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("[Realtime] read error: {}", e);
                        return Exit::Disconnected;
                    }
                    None => return Exit::Disconnected,
                },
            }
        }
    }

    async fn handle_online(&mut self, cmd: Command, write: &mut SocketWrite) -> Result<bool> {
        match cmd {
            Command::Join {
                topic,
                filter,
                events,
                status,
                reply,
            } => {
                self.channels.insert(
                    topic.clone(),
                    Channel {
                        filter,
                        events,
                        status,
                        reply: Some(reply),
                    },
                );
                self.send_join(write, &topic).await?;
            }
            Command::Leave { topic } => {
                if let Some(channel) = self.channels.remove(&topic) {
                    channel.set_status(SubscriptionStatus::Closed);
                    tracing::info!("[Realtime] leaving {}", topic);
                    let msg = PhoenixMessage::leave(&topic, self.make_ref());
                    send_frame(write, &msg).await?;
                }
            }
            Command::SetToken(token) => {
                self.access_token = token;
                if let Some(token) = self.access_token.clone() {
                    let topics: Vec<String> = self.channels.keys().cloned().collect();
                    for topic in topics {
                        let msg = PhoenixMessage::access_token(&topic, self.make_ref(), &token);
                        send_frame(write, &msg).await?;
                    }
                }
            }
            Command::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    async fn send_join(&mut self, write: &mut SocketWrite, topic: &str) -> Result<()> {
        let config = match self.channels.get(topic) {
            Some(channel) => {
                channel.set_status(SubscriptionStatus::Joining);
                json!({ "postgres_changes": [channel.filter.to_config()] })
            }
            None => return Ok(()),
        };
        let msg_ref = self.make_ref();
        let msg = PhoenixMessage::join(topic, msg_ref.clone(), config, self.access_token.as_deref());
        self.pending.insert(msg_ref, topic.to_string());
        tracing::debug!("[Realtime] joining {}", topic);
        send_frame(write, &msg).await
    }

    async fn handle_frame(&mut self, text: &str, write: &mut SocketWrite) -> Result<()> {
        let msg: PhoenixMessage = serde_json::from_str(text)?;

        if let Some((ok, response)) = msg.reply_status() {
            let Some(topic) = msg.msg_ref.as_ref().and_then(|r| self.pending.remove(r)) else {
                return Ok(());
            };
            self.on_join_reply(&topic, ok, response);
            return Ok(());
        }

        match msg.event.as_str() {
            protocol::POSTGRES_CHANGES => {
                let event = ChangeEvent::from_payload(&msg.payload)?;
                let closed = match self.channels.get(&msg.topic) {
                    Some(channel) if channel.filter.matches(&event) => {
                        tracing::debug!(
                            "[Realtime] {} {} on {}",
                            event.kind,
                            event.table,
                            msg.topic
                        );
                        channel.events.send(event).is_err()
                    }
                    _ => false,
                };
                if closed {
                    // Stream dropped without its guard running; clean up.
                    self.handle_online(
                        Command::Leave {
                            topic: msg.topic.clone(),
                        },
                        write,
                    )
                    .await?;
                }
            }
            protocol::PHX_ERROR => {
                if self.channels.contains_key(&msg.topic) {
                    tracing::warn!("[Realtime] channel {} errored, rejoining", msg.topic);
                    if let Some(channel) = self.channels.get(&msg.topic) {
                        channel.set_status(SubscriptionStatus::Reconnecting);
                    }
                    self.send_join(write, &msg.topic).await?;
                }
            }
            protocol::PHX_CLOSE => {
                tracing::debug!("[Realtime] channel {} closed", msg.topic);
            }
            protocol::SYSTEM => {
                tracing::debug!("[Realtime] system message on {}: {}", msg.topic, msg.payload);
            }
            other => {
                tracing::debug!("[Realtime] ignoring {} on {}", other, msg.topic);
            }
        }
        Ok(())
    }

    fn on_join_reply(&mut self, topic: &str, ok: bool, response: &Value) {
        if ok {
            if let Some(channel) = self.channels.get_mut(topic) {
                channel.set_status(SubscriptionStatus::Joined);
                if let Some(reply) = channel.reply.take() {
                    let _ = reply.send(Ok(()));
                } else {
                    tracing::info!("[Realtime] rejoined {}", topic);
                }
            }
            return;
        }

        let reason = response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| response.to_string());
        tracing::warn!("[Realtime] join {} rejected: {}", topic, reason);
        if let Some(mut channel) = self.channels.remove(topic) {
            channel.set_status(SubscriptionStatus::Closed);
            if let Some(reply) = channel.reply.take() {
                let _ = reply.send(Err(BackendError::Realtime(reason)));
            }
        }
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, mut channel) in self.channels.drain() {
            channel.set_status(SubscriptionStatus::Closed);
            if let Some(reply) = channel.reply.take() {
                let _ = reply.send(Err(BackendError::Realtime(reason.to_string())));
            }
        }
    }

    fn close_all(&mut self) {
        self.fail_all("realtime client shut down");
    }
}

async fn send_frame(write: &mut SocketWrite, msg: &PhoenixMessage) -> Result<()> {
    let text = serde_json::to_string(msg)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    type Parts = (
        Channel,
        mpsc::UnboundedReceiver<ChangeEvent>,
        watch::Receiver<SubscriptionStatus>,
        oneshot::Receiver<Result<()>>,
    );

    fn channel(filter: ChangeFilter) -> Parts {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SubscriptionStatus::Joining);
        let (reply, reply_rx) = oneshot::channel();
        (
            Channel {
                filter,
                events,
                status,
                reply: Some(reply),
            },
            events_rx,
            status_rx,
            reply_rx,
        )
    }

    #[tokio::test]
    async fn test_join_reply_ok_completes_subscribe() {
        let mut task = SocketTask::new(ClientConfig::default(), None);
        let (ch, _events, status, mut reply) = channel(ChangeFilter::table("messages"));
        task.channels.insert("realtime:messages-0".into(), ch);

        task.on_join_reply("realtime:messages-0", true, &Value::Null);
        assert_eq!(*status.borrow(), SubscriptionStatus::Joined);
        assert!(matches!(reply.try_recv(), Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_join_reply_error_fails_subscribe() {
        let mut task = SocketTask::new(ClientConfig::default(), None);
        let (ch, _events, status, mut reply) = channel(ChangeFilter::table("messages"));
        task.channels.insert("t".into(), ch);

        task.on_join_reply("t", false, &json!({"reason": "invalid filter"}));
        assert!(task.channels.is_empty());
        assert_eq!(*status.borrow(), SubscriptionStatus::Closed);
        match reply.try_recv() {
            Ok(Err(BackendError::Realtime(reason))) => assert_eq!(reason, "invalid filter"),
            other => panic!("unexpected reply: {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[tokio::test]
    async fn test_offline_join_then_leave() {
        let mut task = SocketTask::new(ClientConfig::default(), None);
        let (events, _rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SubscriptionStatus::Joining);
        let (reply, _reply_rx) = oneshot::channel();
        assert!(task.handle_offline(Command::Join {
            topic: "t".into(),
            filter: ChangeFilter::table("status"),
            events,
            status,
            reply,
        }));
        assert_eq!(task.channels.len(), 1);
        assert!(task.handle_offline(Command::Leave { topic: "t".into() }));
        assert!(task.channels.is_empty());
        assert_eq!(*status_rx.borrow(), SubscriptionStatus::Closed);
        assert!(!task.handle_offline(Command::Shutdown));
    }

    #[tokio::test]
    async fn test_close_all_notifies_pending() {
        let mut task = SocketTask::new(ClientConfig::default(), None);
        let (ch, _events, status, mut reply) = channel(ChangeFilter::table("messages"));
        task.channels.insert("t".into(), ch);
        task.close_all();
        assert_eq!(*status.borrow(), SubscriptionStatus::Closed);
        assert!(matches!(reply.try_recv(), Ok(Err(_))));
    }
}
