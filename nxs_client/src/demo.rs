//! Scripted two-user conversation on the in-memory backend.

use crate::commands::print_message;
use anyhow::{bail, Result};
use nxs_backend::{AuthBackend, Backend, MemoryBackend};
use nxs_chat::{schema, AppContext, NewMessage, SignUpForm, SignUpOutcome};
use nxs_common::DataLayout;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const WAIT: Duration = Duration::from_secs(2);

fn context(memory: &Arc<MemoryBackend>, layout: DataLayout) -> Result<AppContext> {
    let backend: Arc<dyn Backend> = memory.clone();
    let auth: Arc<dyn AuthBackend> = memory.clone();
    Ok(AppContext::new(backend, auth, layout)?)
}

async fn sign_up(context: &AppContext, full_name: &str, username: &str) -> Result<String> {
    let form = SignUpForm {
        full_name: full_name.to_string(),
        email: format!("{}@demo.nxs", username),
        date_of_birth: "1995-06-01".to_string(),
        gender: "other".to_string(),
        password: "DemoPass1".to_string(),
        confirm_password: "DemoPass1".to_string(),
    };
    match context.account().sign_up(&form, username).await? {
        SignUpOutcome::SignedIn(user) => Ok(user.id),
        SignUpOutcome::ConfirmationRequired { email } => {
            bail!("{} needs confirmation on the demo backend", email)
        }
    }
}

pub async fn run(layout: &DataLayout) -> Result<()> {
    let memory = Arc::new(schema::memory_backend());
    let demo_root = layout.root().join("demo");
    let alice_ctx = context(&memory, DataLayout::new(demo_root.join("alice")))?;
    let bob_ctx = context(&memory, DataLayout::new(demo_root.join("bob")))?;

    let alice = sign_up(&alice_ctx, "Alice Moreau", "alice").await?;
    let bob = sign_up(&bob_ctx, "Bob Okafor", "bob").await?;
    let chat = alice_ctx.chats().create_chat(&alice, &bob).await?;
    info!("[Demo] chat {} between alice and bob", chat.id);

    let alice_view = alice_ctx.chats().open_chat(&chat.id, &alice).await?;
    let bob_view = bob_ctx.chats().open_chat(&chat.id, &bob).await?;

    let hello = bob_view.send(NewMessage::text("Hey Alice! Free tonight?")).await?;
    alice_view
        .wait_until(WAIT, |t| t.contains(hello.id()))
        .await;

    let reply = alice_view
        .send(NewMessage::text("Yes! Dinner at 8?").reply_to(hello.id()))
        .await?;
    bob_view.wait_until(WAIT, |t| t.contains(reply.id())).await;

    bob_view.edit(hello.id(), "Hey Alice! Free tonight or tomorrow?").await?;
    let typo = bob_view.send(NewMessage::text("8 works, see yuo")).await?;
    bob_view.delete(typo.id()).await?;
    bob_view.send(NewMessage::text("8 works, see you there")).await?;

    // Drop the socket: this message is only seen through the refetch on rejoin.
    memory.disconnect();
    bob_ctx
        .chats()
        .send_message(&chat.id, &bob, NewMessage::text("(sent while you were offline)"))
        .await?;
    memory.reconnect();

    let settled = alice_view
        .wait_until(WAIT, |t| {
            t.len() == 5
                && t.get(hello.id())
                    .is_some_and(|m| m.message.is_edited())
                && t.get(typo.id()).is_some_and(|m| m.message.is_deleted)
        })
        .await;
    if !settled {
        bail!("alice's timeline did not converge");
    }

    println!("Alice's view of the chat with Bob:");
    for message in alice_view.messages() {
        print_message(&message, &alice);
    }
    println!("Unread for Alice: {}", alice_view.unread_count());
    alice_view.mark_read().await?;

    let list = alice_ctx.chats().load_conversations(&alice).await?;
    for chat in list.chats() {
        println!(
            "Conversation with {}: {} unread",
            chat.title(&alice),
            chat.unread_count
        );
    }
    Ok(())
}
