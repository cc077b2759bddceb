mod common;

use common::{harness, WAIT};
use nxs_backend::SubscriptionStatus;
use nxs_chat::{ChatEvent, MessageTimeline, NewMessage};
use tokio_test::assert_ok;

#[tokio::test]
async fn test_own_send_is_not_duplicated_by_echo() {
    let h = harness();
    h.user("alice", "alice").await;
    h.user("bob", "bob").await;
    let chat = assert_ok!(h.chats.create_chat("alice", "bob").await);

    let session = assert_ok!(h.chats.open_chat(&chat.id, "alice").await);
    let sent = assert_ok!(session.send(NewMessage::text("hello")).await);
    assert_eq!(session.len(), 1);

    // Another send forces the echo of the first through the event loop.
    assert_ok!(session.send(NewMessage::text("again")).await);
    assert!(session.wait_until(WAIT, |t| t.len() == 2).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(session.len(), 2);
    let messages = session.messages();
    assert_eq!(messages[0].id(), sent.id());
    assert_eq!(messages[0].sender.as_ref().map(|u| u.username.as_str()), Some("alice"));
    assert_eq!(messages[1].message.content, "again");
}

#[tokio::test]
async fn test_history_fetched_on_open_then_realtime_appends() {
    let h = harness();
    h.user("alice", "alice").await;
    h.user("bob", "bob").await;
    let chat = assert_ok!(h.chats.create_chat("alice", "bob").await);
    for text in ["one", "two"] {
        assert_ok!(
            h.chats
                .send_message(&chat.id, "bob", NewMessage::text(text))
                .await
        );
    }

    let session = assert_ok!(h.chats.open_chat(&chat.id, "alice").await);
    assert_eq!(session.len(), 2);
    assert_eq!(session.unread_count(), 2);

    assert_ok!(
        h.chats
            .send_message(&chat.id, "bob", NewMessage::text("three"))
            .await
    );
    assert!(session.wait_until(WAIT, |t| t.len() == 3).await);
    let last = session.with_timeline(|t| t.last().cloned()).unwrap();
    assert_eq!(last.message.content, "three");
    assert_eq!(last.sender.unwrap().username, "bob");

    assert_eq!(assert_ok!(session.mark_read().await), 3);
    assert_ok!(session.refresh().await);
    assert_eq!(session.unread_count(), 0);
}

#[tokio::test]
async fn test_snapshot_started_before_realtime_keeps_realtime_rows() {
    let h = harness();
    h.user("alice", "alice").await;
    h.user("bob", "bob").await;
    let chat = assert_ok!(h.chats.create_chat("alice", "bob").await);
    assert_ok!(
        h.chats
            .send_message(&chat.id, "alice", NewMessage::text("before"))
            .await
    );

    let mut timeline = MessageTimeline::new(&chat.id);
    let ticket = timeline.begin_fetch();
    let snapshot = assert_ok!(h.chats.fetch_messages(&chat.id).await);

    // Committed after the fetch read, delivered before the snapshot lands.
    let late = assert_ok!(
        h.chats
            .send_message(&chat.id, "bob", NewMessage::text("during"))
            .await
    );
    timeline.apply_row(late.message.clone(), late.sender.clone());

    assert!(timeline.apply_snapshot(ticket, snapshot));
    let contents: Vec<&str> = timeline
        .messages()
        .iter()
        .map(|m| m.message.content.as_str())
        .collect();
    assert_eq!(contents, ["before", "during"]);
}

#[tokio::test]
async fn test_realtime_delete_beats_older_snapshot() {
    let h = harness();
    h.user("alice", "alice").await;
    h.user("bob", "bob").await;
    let chat = assert_ok!(h.chats.create_chat("alice", "bob").await);
    let sent = assert_ok!(
        h.chats
            .send_message(&chat.id, "alice", NewMessage::text("oops"))
            .await
    );

    let mut timeline = MessageTimeline::new(&chat.id);
    let ticket = timeline.begin_fetch();
    let snapshot = assert_ok!(h.chats.fetch_messages(&chat.id).await);
    timeline.apply_delete(sent.id());

    assert!(timeline.apply_snapshot(ticket, snapshot));
    assert!(timeline.is_empty());
    assert!(timeline.is_tombstoned(sent.id()));
}

#[tokio::test]
async fn test_rejoin_refetches_missed_messages() {
    let h = harness();
    h.user("alice", "alice").await;
    h.user("bob", "bob").await;
    let chat = assert_ok!(h.chats.create_chat("alice", "bob").await);
    let mut bus = h.events.subscribe();

    let session = assert_ok!(h.chats.open_chat(&chat.id, "alice").await);
    assert_eq!(session.status(), SubscriptionStatus::Joined);

    h.memory.disconnect();
    assert_ok!(
        h.chats
            .send_message(&chat.id, "bob", NewMessage::text("while you were away"))
            .await
    );
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(session.is_empty());
    assert_eq!(session.status(), SubscriptionStatus::Reconnecting);

    h.memory.reconnect();
    assert!(session.wait_until(WAIT, |t| t.len() == 1).await);
    assert_eq!(session.messages()[0].message.content, "while you were away");

    let mut saw_reconnecting = false;
    while let Ok(event) = bus.try_recv() {
        if let ChatEvent::ConnectionChanged {
            status: SubscriptionStatus::Reconnecting,
        } = event
        {
            saw_reconnecting = true;
        }
    }
    assert!(saw_reconnecting);
}

#[tokio::test]
async fn test_dropping_session_unsubscribes() {
    let h = harness();
    h.user("alice", "alice").await;
    h.user("bob", "bob").await;
    let chat = assert_ok!(h.chats.create_chat("alice", "bob").await);

    let session = assert_ok!(h.chats.open_chat(&chat.id, "alice").await);
    assert_eq!(h.memory.subscriber_count(), 1);
    session.close();

    // The aborted task drops its guard.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.memory.subscriber_count(), 0);
}
