use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_client_settings, ConnectionState, ConversationSession, DeliveryState, MessageEntry,
    MessagingApi, MessagingClient, RealtimeChannel, SessionUpdate,
};
use shared::{
    domain::{
        CommentId, ConversationId, ConversationKind, DeleteScope, MessageId, PostId, ReelId,
        StoryId, UserId,
    },
    protocol::CreateConversationRequest,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for SocialVibe messaging")]
struct Args {
    /// TOML file with client settings.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `server_url` from the config file.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the conversation list, most recent first.
    Conversations,
    /// Start a direct conversation, or a group when `--name` is given.
    Start {
        #[arg(required = true)]
        participants: Vec<i64>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Open a conversation and chat from stdin.
    Chat { conversation_id: i64 },
    /// Print notifications and presence changes until interrupted.
    Listen,
    /// Emit a social activity event to its owner.
    Notify {
        #[command(subcommand)]
        activity: Activity,
    },
}

#[derive(Subcommand, Debug)]
enum Activity {
    LikePost { post_id: i64, owner: i64 },
    LikeReel { reel_id: i64, owner: i64 },
    Comment { post_id: i64, owner: i64, comment_id: i64 },
    Follow { user: i64 },
    ViewStory { story_id: i64, owner: i64 },
}

/// A line typed inside `chat`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatInput {
    Send(String),
    Edit(MessageId, String),
    Delete(MessageId, DeleteScope),
    React(MessageId, String),
    Unreact(MessageId),
    Older,
    Refresh,
    Quit,
}

fn parse_chat_input(line: &str) -> Result<Option<ChatInput>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(ChatInput::Send(line.to_string())));
    };
    let mut parts = rest.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let input = match command {
        "edit" => {
            let id = next_message_id(&mut parts)?;
            let text = parts.next().map(str::trim).unwrap_or_default();
            if text.is_empty() {
                bail!("usage: /edit <id> <text>");
            }
            ChatInput::Edit(id, text.to_string())
        }
        "delete" => {
            let id = next_message_id(&mut parts)?;
            let scope = match parts.next().map(str::trim) {
                None | Some("everyone") => DeleteScope::Everyone,
                Some("me") => DeleteScope::Me,
                Some(other) => bail!("unknown delete scope `{other}`"),
            };
            ChatInput::Delete(id, scope)
        }
        "react" => {
            let id = next_message_id(&mut parts)?;
            let emoji = parts.next().map(str::trim).unwrap_or("👍");
            ChatInput::React(id, emoji.to_string())
        }
        "unreact" => ChatInput::Unreact(next_message_id(&mut parts)?),
        "older" => ChatInput::Older,
        "refresh" => ChatInput::Refresh,
        "quit" | "q" => ChatInput::Quit,
        other => bail!("unknown command `/{other}`"),
    };
    Ok(Some(input))
}

fn next_message_id<'a>(parts: &mut impl Iterator<Item = &'a str>) -> Result<MessageId> {
    let raw = parts.next().context("missing message id")?;
    let id = raw
        .parse()
        .with_context(|| format!("bad message id `{raw}`"))?;
    Ok(MessageId(id))
}

fn render_entry(entry: &MessageEntry) -> String {
    let message = &entry.message;
    let mut line = format!(
        "[{}] #{} user {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.message_id,
        message.sender_id,
        message.display_text()
    );
    if message.edited && !message.deleted {
        line.push_str(" (edited)");
    }
    if !message.reactions.is_empty() {
        let emojis: Vec<&str> = message.reactions.iter().map(|r| r.emoji.as_str()).collect();
        line.push_str(&format!(" [{}]", emojis.join(" ")));
    }
    match &entry.delivery {
        DeliveryState::Sent => {}
        DeliveryState::Pending => line.push_str(" (sending)"),
        DeliveryState::Failed { reason } => line.push_str(&format!(" (failed: {reason})")),
    }
    line
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_client_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let client = MessagingClient::new(settings)?;
    let identity = client.login(&args.username).await?;
    println!("logged in as {} (user {})", identity.username, identity.user_id);

    match args.command {
        Command::Conversations => list_conversations(&client).await?,
        Command::Start { participants, name } => {
            let kind = if name.is_some() || participants.len() > 1 {
                ConversationKind::Group
            } else {
                ConversationKind::Direct
            };
            let conversation = client
                .api()
                .create_conversation(CreateConversationRequest {
                    kind,
                    participant_ids: participants.into_iter().map(UserId).collect(),
                    name,
                    avatar_url: None,
                })
                .await?;
            println!(
                "conversation {} ({})",
                conversation.conversation_id,
                conversation.kind.as_str()
            );
        }
        Command::Chat { conversation_id } => {
            let session = client.conversation(ConversationId(conversation_id))?;
            chat(&session).await?;
        }
        Command::Listen => listen(&client).await,
        Command::Notify { activity } => {
            wait_connected(client.transport().as_ref()).await?;
            let channel = client.transport().as_ref();
            match activity {
                Activity::LikePost { post_id, owner } => {
                    channel.notify_like_post(PostId(post_id), UserId(owner))
                }
                Activity::LikeReel { reel_id, owner } => {
                    channel.notify_like_reel(ReelId(reel_id), UserId(owner))
                }
                Activity::Comment {
                    post_id,
                    owner,
                    comment_id,
                } => channel.notify_comment(PostId(post_id), UserId(owner), CommentId(comment_id)),
                Activity::Follow { user } => channel.notify_follow(UserId(user)),
                Activity::ViewStory { story_id, owner } => {
                    channel.notify_story_view(StoryId(story_id), UserId(owner))
                }
            }
            // Give the writer task a moment to flush before the client drops.
            tokio::time::sleep(Duration::from_millis(200)).await;
            println!("sent");
        }
    }

    client.logout();
    Ok(())
}

async fn wait_connected(channel: &dyn RealtimeChannel) -> Result<()> {
    let mut state = channel.watch_state();
    loop {
        match *state.borrow_and_update() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Unavailable => bail!("realtime server unavailable"),
            _ => {}
        }
        state.changed().await.context("transport dropped")?;
    }
}

async fn list_conversations(client: &MessagingClient) -> Result<()> {
    let list = client.conversation_list()?;
    list.open().await;
    if let Some(err) = list.last_error() {
        bail!(err);
    }
    for conversation in list.conversations() {
        let label = conversation
            .name
            .clone()
            .unwrap_or_else(|| format!("{} chat", conversation.kind.as_str()));
        let preview = conversation
            .last_message
            .as_ref()
            .map(|preview| {
                if preview.deleted {
                    "message deleted".to_string()
                } else {
                    preview.content.clone()
                }
            })
            .unwrap_or_default();
        println!("{:>6}  {label:<24} {preview}", conversation.conversation_id);
    }
    list.close();
    Ok(())
}

async fn chat(session: &ConversationSession) -> Result<()> {
    let mut updates = session.subscribe_updates();
    session.open().await;
    for entry in session.messages() {
        println!("{}", render_entry(&entry));
    }
    println!("type to send; /edit /delete /react /unreact /older /refresh /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = match parse_chat_input(&line) {
                    Ok(Some(input)) => input,
                    Ok(None) => continue,
                    Err(err) => {
                        eprintln!("{err}");
                        continue;
                    }
                };
                if input == ChatInput::Quit {
                    break;
                }
                session.set_composing(false);
                if let Err(err) = apply_input(session, input).await {
                    eprintln!("{err}");
                }
            }
            update = updates.recv() => match update {
                Ok(SessionUpdate::Messages) => {
                    if let Some(entry) = session.messages().last() {
                        println!("{}", render_entry(entry));
                    }
                }
                Ok(SessionUpdate::Typing(users)) if !users.is_empty() => {
                    let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
                    println!("… {} typing", names.join(", "));
                }
                Ok(SessionUpdate::ReadReceipt(receipt)) => {
                    println!("user {} read up to {:?}", receipt.reader_id, receipt.up_to);
                }
                Ok(SessionUpdate::Error(err)) => eprintln!("{err}"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "chat: update stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    session.close();
    Ok(())
}

async fn apply_input(session: &ConversationSession, input: ChatInput) -> Result<()> {
    match input {
        ChatInput::Send(text) => {
            session.send_message(&text, None, None).await?;
        }
        ChatInput::Edit(id, text) => {
            session.edit_message(id, &text).await?;
        }
        ChatInput::Delete(id, scope) => session.delete_message(id, scope).await?,
        ChatInput::React(id, emoji) => {
            session.react(id, &emoji).await?;
        }
        ChatInput::Unreact(id) => {
            session.unreact(id).await?;
        }
        ChatInput::Older => {
            let added = session.load_older().await?;
            println!("loaded {added} older messages");
            for entry in session.messages() {
                println!("{}", render_entry(&entry));
            }
        }
        ChatInput::Refresh => {
            let added = session.refresh().await?;
            println!("refreshed, {added} new");
        }
        ChatInput::Quit => {}
    }
    Ok(())
}

async fn listen(client: &MessagingClient) {
    let presence = client.presence();
    let feed = client.notifications();
    let mut notifications = feed.subscribe_updates();
    let mut state = client.transport().watch_state();
    println!("listening; ctrl-c to stop");
    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(notification) => println!("{}", notification.summary()),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "listen: notification stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("connection: {current:?}; online: {:?}", presence.online_users());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
