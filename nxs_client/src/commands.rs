use crate::cli::{AdminArgs, AdminCommand, Command, ProfileArgs, StatusCommand};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use chrono::Utc;
use nxs_chat::{
    AppContext, ChatEvent, ContentKind, MessageWithSender, NewMessage, Period, ProfilePatch,
    RandomState, SignUpForm, SignUpOutcome, StatusViewer, User, Visibility,
};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub async fn run(context: &AppContext, command: Command) -> Result<()> {
    match command {
        Command::Signup {
            full_name,
            email,
            username,
            date_of_birth,
            gender,
            password,
        } => {
            let form = SignUpForm {
                full_name,
                email,
                date_of_birth,
                gender,
                confirm_password: password.clone(),
                password,
            };
            match context.account().sign_up(&form, &username).await? {
                SignUpOutcome::SignedIn(user) => println!("Welcome, {}!", user.display_name()),
                SignUpOutcome::ConfirmationRequired { email } => {
                    println!("Check {} for a confirmation link, then log in.", email)
                }
            }
        }
        Command::Login { email, password } => {
            let user = context.account().sign_in(&email, &password).await?;
            println!("Signed in as @{}", user.username);
        }
        Command::Logout => {
            context.account().restore().await?;
            context.account().sign_out().await?;
            println!("Signed out");
        }
        Command::Whoami => {
            let user = signed_in(context).await?;
            print_user(&user);
        }
        Command::Profile(args) => update_profile(context, args).await?,
        Command::Avatar { file } => {
            let user = signed_in(context).await?;
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {:?}", file))?;
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("{:?} has no file name", file))?;
            let updated = context
                .account()
                .upload_profile_picture(&user.id, name, Bytes::from(data), content_type(&file))
                .await?;
            println!("Profile picture: {}", updated.profile_picture.unwrap_or_default());
        }
        Command::Chats => {
            let user = signed_in(context).await?;
            let list = context.chats().load_conversations(&user.id).await?;
            if list.is_empty() {
                println!("No conversations yet");
            }
            for chat in list.chats() {
                let preview = chat
                    .last_message
                    .as_ref()
                    .map(|m| m.display_content().to_string())
                    .unwrap_or_default();
                let unread = if chat.unread_count > 0 {
                    format!(" ({} unread)", chat.unread_count)
                } else {
                    String::new()
                };
                println!("{}  {}{}  {}", chat.id(), chat.title(&user.id), unread, preview);
            }
        }
        Command::Start { username } => {
            let user = signed_in(context).await?;
            let wanted = username.trim_start_matches('@').to_lowercase();
            let peer = context
                .account()
                .search_users(&wanted, &user.id)
                .await?
                .into_iter()
                .find(|u| u.username == wanted)
                .ok_or_else(|| anyhow!("no user @{}", wanted))?;
            let chat = context.chats().create_chat(&user.id, &peer.id).await?;
            println!("{}", chat.id);
        }
        Command::Open { chat_id } => {
            let user = signed_in(context).await?;
            follow(context, &chat_id, &user.id).await?;
        }
        Command::Send {
            chat_id,
            text,
            reply_to,
        } => {
            let user = signed_in(context).await?;
            let mut message = NewMessage::text(text);
            if let Some(parent) = reply_to {
                message = message.reply_to(parent);
            }
            let sent = context
                .chats()
                .send_message(&chat_id, &user.id, message)
                .await?;
            println!("{}", sent.id());
        }
        Command::Edit { message_id, text } => {
            let user = signed_in(context).await?;
            context
                .chats()
                .edit_message(&message_id, &user.id, &text)
                .await?;
        }
        Command::Delete { message_id } => {
            let user = signed_in(context).await?;
            context.chats().delete_message(&message_id, &user.id).await?;
        }
        Command::Read { chat_id } => {
            let user = signed_in(context).await?;
            let n = context
                .chats()
                .mark_messages_as_read(&chat_id, &user.id)
                .await?;
            println!("{} message(s) marked read", n);
        }
        Command::Search { query } => {
            let user = signed_in(context).await?;
            for found in context.account().search_users(&query, &user.id).await? {
                println!("{}  @{}  {}", found.id, found.username, found.display_name());
            }
        }
        Command::Block { user_id } => {
            let user = signed_in(context).await?;
            context.chats().blocks().block(&user.id, &user_id).await?;
        }
        Command::Unblock { user_id } => {
            let user = signed_in(context).await?;
            context.chats().blocks().unblock(&user.id, &user_id).await?;
        }
        Command::Status(command) => status(context, command).await?,
        Command::Random { timeout } => random(context, Duration::from_secs(timeout)).await?,
        Command::Admin(args) => admin(context, args).await?,
        Command::Demo => bail!("demo runs on its own backend"),
        Command::SetRoot { .. } => bail!("set-root runs before a backend is built"),
    }
    Ok(())
}

async fn signed_in(context: &AppContext) -> Result<User> {
    context
        .account()
        .restore()
        .await?
        .ok_or_else(|| anyhow!("not signed in, run `nxs login` first"))
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn print_user(user: &User) {
    println!("{} (@{})", user.display_name(), user.username);
    println!("  id:     {}", user.id);
    println!("  email:  {}", user.email);
    if let Some(bio) = &user.bio {
        println!("  bio:    {}", bio);
    }
    println!(
        "  online: {}  public: {}",
        user.is_online, user.is_profile_public
    );
}

pub fn print_message(m: &MessageWithSender, me: &str) {
    let who = match &m.sender {
        _ if m.message.sender_id == me => "you".to_string(),
        Some(sender) => sender.display_name().to_string(),
        None => m.message.sender_id.clone(),
    };
    if let Some(reply) = &m.reply_to {
        let name = reply.sender_name.as_deref().unwrap_or("someone");
        println!("    > {}: {}", name, reply.content);
    }
    let edited = if m.message.is_edited() { " (edited)" } else { "" };
    println!(
        "[{}] {}: {}{}",
        m.message.created_at.format("%H:%M"),
        who,
        m.message.display_content(),
        edited
    );
}

async fn update_profile(context: &AppContext, args: ProfileArgs) -> Result<()> {
    let user = signed_in(context).await?;
    let patch = ProfilePatch {
        full_name: args.full_name,
        username: args.username,
        bio: args.bio,
        is_profile_public: args.public,
        ..Default::default()
    };
    let updated = context.account().update_profile(&user.id, patch).await?;
    print_user(&updated);
    Ok(())
}

/// Print the history of `chat_id`, then follow it until EOF or `/quit`.
/// Typed lines are sent.
async fn follow(context: &AppContext, chat_id: &str, user_id: &str) -> Result<()> {
    let session = context.chats().open_chat(chat_id, user_id).await?;
    for message in session.messages() {
        print_message(&message, user_id);
    }
    let mut events = context.events().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = session.send(NewMessage::text(line)).await {
                    eprintln!("not sent: {}", e);
                }
            }
            event = events.recv() => match event {
                Ok(ChatEvent::MessageAdded { chat_id: c, message }) if c == chat_id => {
                    print_message(&message, user_id);
                }
                Ok(ChatEvent::MessageUpdated { chat_id: c, message }) if c == chat_id => {
                    print!("(changed) ");
                    print_message(&message, user_id);
                }
                Ok(ChatEvent::MessageRemoved { chat_id: c, message_id }) if c == chat_id => {
                    println!("(removed {})", message_id);
                }
                Ok(ChatEvent::ConnectionChanged { status }) => println!("-- {:?}", status),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("[Client] skipped {} events, refreshing", n);
                    session.refresh().await?;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    session.mark_read().await?;
    Ok(())
}

async fn status(context: &AppContext, command: StatusCommand) -> Result<()> {
    let user = signed_in(context).await?;
    let statuses = context.statuses();
    match command {
        StatusCommand::Post { text, visibility } => {
            let visibility: Visibility = visibility.parse().map_err(|e: String| anyhow!(e))?;
            let posted = statuses.post_status(&user.id, &text, visibility).await?;
            println!("{} (expires {})", posted.id, posted.expires_at.format("%Y-%m-%d %H:%M"));
        }
        StatusCommand::List => {
            for item in statuses.active_statuses(Utc::now()).await? {
                let author = item
                    .user
                    .as_ref()
                    .map(|u| u.display_name().to_string())
                    .unwrap_or_else(|| item.status.user_id.clone());
                println!(
                    "{}  {}: {}  ({} views)",
                    item.status.id, author, item.status.content, item.status.views_count
                );
            }
        }
        StatusCommand::View { status_id } => {
            let active = statuses.active_statuses(Utc::now()).await?;
            let mut viewer = StatusViewer::new(active, Some(status_id.as_str()))
                .ok_or_else(|| anyhow!("status {} is not active", status_id))?;
            let current = viewer.current().clone();
            println!(
                "{}/{}  {}",
                viewer.index() + 1,
                viewer.len(),
                current.status.content
            );
            if statuses.record_view(&current.status, &user.id).await? {
                info!("[Client] recorded view of {}", current.status.id);
            }
            if viewer.next() {
                println!("next: {}", viewer.current().status.id);
            }
        }
        StatusCommand::Delete { status_id } => {
            statuses.delete_status(&status_id, &user.id).await?;
        }
    }
    Ok(())
}

async fn random(context: &AppContext, timeout: Duration) -> Result<()> {
    let user = signed_in(context).await?;
    let mut random = context.random_chat()?;
    println!("Looking for someone to talk to...");
    let chat_id = match random.search(timeout).await? {
        RandomState::Connected(m) => {
            let name = m
                .peer
                .as_ref()
                .map(|p| p.display_name().to_string())
                .unwrap_or_else(|| "a stranger".to_string());
            println!("Connected with {}. Type to chat, /quit to leave.", name);
            m.chat.id.clone()
        }
        _ => {
            println!("Nobody showed up, try again later.");
            return Ok(());
        }
    };
    let followed = follow(context, &chat_id, &user.id).await;
    random.leave().await?;
    println!("Left the chat.");
    followed
}

async fn admin(context: &AppContext, args: AdminArgs) -> Result<()> {
    let admin = context.admin();
    let session = admin.login(&args.username, &args.password).await?;
    match args.command {
        AdminCommand::Login => {
            println!(
                "Logged in as {} ({})",
                session.username,
                session.role.as_deref().unwrap_or("admin")
            );
        }
        AdminCommand::Dashboard => {
            let stats = admin.dashboard().await?;
            println!("users:    {} ({} online)", stats.total_users, stats.online_users);
            println!("chats:    {}", stats.total_chats);
            println!("messages: {}", stats.total_messages);
            println!("statuses: {} active", stats.active_statuses);
            println!("newest users:");
            for user in stats.recent_users {
                println!("  @{}  {}", user.username, user.created_at.format("%Y-%m-%d"));
            }
        }
        AdminCommand::Users {
            search,
            limit,
            offset,
        } => {
            let users = match search {
                Some(q) => admin.search_users(&q).await?,
                None => admin.list_users(limit, offset).await?,
            };
            for user in users {
                let banned = if user.is_banned { "  [banned]" } else { "" };
                println!("{}  @{}  {}{}", user.id, user.username, user.email, banned);
            }
        }
        AdminCommand::User { user_id } => {
            let details = admin.user_details(&user_id).await?;
            print_user(&details.user);
            println!(
                "  chats: {}  messages: {}  statuses: {}",
                details.chat_count, details.message_count, details.status_count
            );
        }
        AdminCommand::Ban { user_id } => {
            admin.set_banned(&user_id, true).await?;
        }
        AdminCommand::Unban { user_id } => {
            admin.set_banned(&user_id, false).await?;
        }
        AdminCommand::DeleteUser { user_id } => admin.delete_user(&user_id).await?,
        AdminCommand::Moderate { kind } => {
            let kind: ContentKind = kind.parse().map_err(|e: String| anyhow!(e))?;
            match kind {
                ContentKind::Message => {
                    for m in admin.recent_messages().await? {
                        let who = m.sender.as_ref().map(|u| u.username.as_str()).unwrap_or("?");
                        println!("{}  @{}: {}", m.id(), who, m.message.content);
                    }
                }
                ContentKind::Status => {
                    for s in admin.recent_statuses().await? {
                        let who = s.user.as_ref().map(|u| u.username.as_str()).unwrap_or("?");
                        println!("{}  @{}: {}", s.status.id, who, s.status.content);
                    }
                }
            }
        }
        AdminCommand::Remove { kind, id } => {
            let kind: ContentKind = kind.parse().map_err(|e: String| anyhow!(e))?;
            admin.delete_content(kind, &id).await?;
        }
        AdminCommand::Analytics { period } => {
            let period: Period = period.parse().map_err(|e: String| anyhow!(e))?;
            let report = admin.analytics(period).await?;
            for row in &report.rows {
                println!(
                    "{}  users {}  new {}  messages {}  chats {}",
                    row.date, row.total_users, row.new_users, row.total_messages, row.total_chats
                );
            }
            let t = report.totals;
            println!(
                "totals: {} users, {} messages, {} statuses, {} chats",
                t.users, t.messages, t.statuses, t.chats
            );
        }
        AdminCommand::Settings => {
            println!("{}", serde_json::to_string_pretty(&admin.settings())?);
        }
        AdminCommand::Set { key, value } => {
            let mut settings = serde_json::to_value(admin.settings())?;
            let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value));
            match settings.as_object_mut() {
                Some(map) if map.contains_key(&key) => {
                    map.insert(key, parsed);
                }
                _ => bail!("unknown setting: {}", key),
            }
            admin.update_settings(serde_json::from_value(settings)?)?;
            println!("{}", serde_json::to_string_pretty(&admin.settings())?);
        }
    }
    Ok(())
}
