//! Exercises the in-memory backend through the trait objects domain code
//! uses.

use nxs_backend::{
    row, AuthBackend, Backend, ChangeFilter, ChangeKind, ColumnDefault, Filter, MemoryBackend,
    Query, SubscriptionStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn backend() -> Arc<MemoryBackend> {
    Arc::new(
        MemoryBackend::new()
            .with_default("users", "created_at", ColumnDefault::Now)
            .with_default("messages", "id", ColumnDefault::Uuid)
            .with_default("messages", "created_at", ColumnDefault::Now)
            .with_updated_at("messages"),
    )
}

#[tokio::test]
async fn test_search_style_query_through_trait_object() {
    let memory = backend();
    let rows: Arc<dyn Backend> = memory.clone();

    assert_ok!(
        rows.insert(
            "users",
            vec![
                row([("id", json!("u1")), ("username", json!("alice")), ("full_name", json!("Alice Liddell"))]),
                row([("id", json!("u2")), ("username", json!("bob")), ("full_name", json!("Bob Alison"))]),
                row([("id", json!("u3")), ("username", json!("carol")), ("full_name", json!("Carol Danvers"))]),
            ],
        )
        .await
    );

    let q = Query::new()
        .select("id,username")
        .or(vec![
            Filter::ilike("username", "%ali%"),
            Filter::ilike("full_name", "%ali%"),
        ])
        .neq("id", "u1")
        .limit(20);
    let found = rows.select("users", &q).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["username"], "bob");
    assert!(found[0].get("full_name").is_none());
}

#[tokio::test]
async fn test_change_stream_sees_insert_update_delete_in_order() {
    let memory = backend();
    let rows: Arc<dyn Backend> = memory.clone();
    let mut stream = rows
        .subscribe(ChangeFilter::table("messages").eq("chat_id", "c1"))
        .await
        .unwrap();
    assert_eq!(stream.status(), SubscriptionStatus::Joined);

    let inserted = rows
        .insert("messages", vec![row([("chat_id", json!("c1")), ("content", json!("hi"))])])
        .await
        .unwrap();
    let id = inserted[0]["id"].as_str().unwrap().to_string();
    rows.update(
        "messages",
        &Query::new().eq("id", id.as_str()),
        row([("content", json!("hi there"))]),
    )
    .await
    .unwrap();
    rows.delete("messages", &Query::new().eq("id", id.as_str()))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id(), Some(id.as_str()));
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
    );
}

#[tokio::test]
async fn test_sign_in_sets_shared_token() {
    let memory = backend();
    let auth: Arc<dyn AuthBackend> = memory.clone();
    let signed_up = auth.sign_up("trinity@matrix.io", "Passw0rd").await.unwrap();
    assert!(signed_up.session.is_some());

    auth.set_access_token(None);
    let session = auth
        .sign_in_with_password("trinity@matrix.io", "Passw0rd")
        .await
        .unwrap();
    assert_eq!(memory.access_token(), Some(session.access_token));
}
