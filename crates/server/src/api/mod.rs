//! Request validation and authorization on top of the store. Handlers in
//! `main.rs` turn the results into responses and fan-out events.

use shared::{
    domain::{ConversationId, ConversationKind, DeleteScope, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        Conversation, CreateConversationRequest, Message, Page, PageQuery, Reaction, ReadReceipt,
        SendMessageRequest,
    },
};
use storage::{NewMessage, Storage};

pub const MAX_USERNAME_CHARS: usize = 32;
pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_EMOJI_CHARS: usize = 16;
pub const MAX_GROUP_PARTICIPANTS: usize = 256;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Creates the user on first login.
pub async fn login(ctx: &ApiContext, username: &str) -> Result<(UserId, String), ApiError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ApiError::validation("username cannot be empty"));
    }
    if username.chars().count() > MAX_USERNAME_CHARS {
        return Err(ApiError::validation(format!(
            "username exceeds {MAX_USERNAME_CHARS} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(ApiError::validation(
            "username may only contain letters, digits, '_', '.' and '-'",
        ));
    }
    let user_id = ctx.storage.create_user(username).await.map_err(internal)?;
    Ok((user_id, username.to_string()))
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
    query: &PageQuery,
) -> Result<Page<Conversation>, ApiError> {
    let (page, limit) = query.clamped();
    let (items, has_next) = ctx
        .storage
        .list_conversations_for_user(user_id, page, limit)
        .await
        .map_err(internal)?;
    Ok(Page { items, has_next })
}

/// Direct conversations are find-or-create; groups always create.
pub async fn create_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    request: CreateConversationRequest,
) -> Result<Conversation, ApiError> {
    let mut others: Vec<UserId> = request
        .participant_ids
        .iter()
        .copied()
        .filter(|id| *id != user_id)
        .collect();
    others.sort_unstable();
    others.dedup();

    for other in &others {
        ensure_user_exists(ctx, *other).await?;
    }

    let conversation_id = match request.kind {
        ConversationKind::Direct => {
            let [other] = others.as_slice() else {
                return Err(ApiError::validation(
                    "a direct conversation needs exactly one other participant",
                ));
            };
            ctx.storage
                .find_or_create_direct_conversation(user_id, *other)
                .await
                .map_err(internal)?
        }
        ConversationKind::Group => {
            if others.is_empty() {
                return Err(ApiError::validation(
                    "a group conversation needs at least one other participant",
                ));
            }
            if others.len() + 1 > MAX_GROUP_PARTICIPANTS {
                return Err(ApiError::validation(format!(
                    "a group conversation holds at most {MAX_GROUP_PARTICIPANTS} participants"
                )));
            }
            let name = request
                .name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty());
            let mut participants = vec![user_id];
            participants.extend(others);
            ctx.storage
                .create_group_conversation(name, request.avatar_url.as_deref(), &participants)
                .await
                .map_err(internal)?
        }
    };

    ctx.storage
        .conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "conversation vanished after create"))
}

/// Newest first, without messages the caller deleted for themselves.
pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    query: &PageQuery,
) -> Result<Page<Message>, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let (page, limit) = query.clamped();
    let (items, has_next) = ctx
        .storage
        .list_messages(conversation_id, user_id, page, limit)
        .await
        .map_err(internal)?;
    Ok(Page { items, has_next })
}

pub async fn send_message(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    request: SendMessageRequest,
) -> Result<Message, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;

    let content = request.content.trim().to_string();
    if content.is_empty() && request.media.is_none() {
        return Err(ApiError::validation("message needs content or media"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::validation(format!(
            "message exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    if let Some(reply_to) = request.reply_to {
        let original = load_message(ctx, reply_to).await?;
        if original.conversation_id != conversation_id {
            return Err(ApiError::validation(
                "reply target belongs to another conversation",
            ));
        }
    }

    ctx.storage
        .insert_message(NewMessage {
            conversation_id,
            sender_id: user_id,
            content,
            media: request.media,
            reply_to: request.reply_to,
            client_nonce: request.client_nonce,
        })
        .await
        .map_err(internal)
}

/// Only the sender may edit, and never a deleted message.
pub async fn edit_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    content: &str,
) -> Result<Message, ApiError> {
    let message = load_message(ctx, message_id).await?;
    if message.sender_id != user_id {
        return Err(ApiError::forbidden("only the sender can edit a message"));
    }
    if message.deleted {
        return Err(ApiError::validation("message was deleted"));
    }
    let content = content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("edited content cannot be empty"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::validation(format!(
            "message exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    ctx.storage
        .edit_message(message_id, content)
        .await
        .map_err(internal)
}

/// Returns the message as it was before the delete.
pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    scope: DeleteScope,
) -> Result<Message, ApiError> {
    let message = load_message(ctx, message_id).await?;
    ensure_participant(ctx, message.conversation_id, user_id).await?;
    match scope {
        DeleteScope::Everyone => {
            if message.sender_id != user_id {
                return Err(ApiError::forbidden(
                    "only the sender can delete a message for everyone",
                ));
            }
            ctx.storage
                .tombstone_message(message_id)
                .await
                .map_err(internal)?;
        }
        DeleteScope::Me => {
            ctx.storage
                .hide_message_for_user(message_id, user_id)
                .await
                .map_err(internal)?;
        }
    }
    Ok(message)
}

pub async fn add_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<(Message, Reaction), ApiError> {
    let message = load_message(ctx, message_id).await?;
    ensure_participant(ctx, message.conversation_id, user_id).await?;
    if message.deleted {
        return Err(ApiError::validation("cannot react to a deleted message"));
    }
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
        return Err(ApiError::validation("invalid reaction"));
    }
    let reaction = ctx
        .storage
        .upsert_reaction(message_id, user_id, emoji)
        .await
        .map_err(internal)?;
    let message = load_message(ctx, message_id).await?;
    Ok((message, reaction))
}

/// The flag is false when the caller had no reaction to remove.
pub async fn remove_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<(Message, bool), ApiError> {
    let message = load_message(ctx, message_id).await?;
    ensure_participant(ctx, message.conversation_id, user_id).await?;
    let removed = ctx
        .storage
        .remove_reaction(message_id, user_id)
        .await
        .map_err(internal)?;
    let message = load_message(ctx, message_id).await?;
    Ok((message, removed))
}

/// Marks up to `up_to`, or everything currently in the conversation when absent.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    up_to: Option<MessageId>,
) -> Result<ReadReceipt, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let receipt = match up_to {
        Some(message_id) => {
            let message = load_message(ctx, message_id).await?;
            if message.conversation_id != conversation_id {
                return Err(ApiError::validation(
                    "message belongs to another conversation",
                ));
            }
            ctx.storage
                .record_read_marker(conversation_id, user_id, Some(message_id))
                .await
        }
        None => ctx.storage.mark_read(conversation_id, user_id).await,
    };
    receipt.map_err(internal)
}

pub async fn participants(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<Vec<UserId>, ApiError> {
    ctx.storage
        .participants(conversation_id)
        .await
        .map_err(internal)
}

pub async fn ensure_participant(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ApiError> {
    if ctx
        .storage
        .is_participant(conversation_id, user_id)
        .await
        .map_err(internal)?
    {
        return Ok(());
    }
    let exists = ctx
        .storage
        .conversation(conversation_id)
        .await
        .map_err(internal)?
        .is_some();
    if exists {
        Err(ApiError::forbidden("user is not a participant"))
    } else {
        Err(ApiError::not_found("conversation not found"))
    }
}

pub async fn load_message(ctx: &ApiContext, message_id: MessageId) -> Result<Message, ApiError> {
    ctx.storage
        .message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))
}

async fn ensure_user_exists(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    ctx.storage
        .username_for_user(user_id)
        .await
        .map_err(internal)?
        .map(|_| ())
        .ok_or_else(|| ApiError::not_found(format!("user {} not found", user_id.0)))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
