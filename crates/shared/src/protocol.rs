use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        ClientNonce, CommentId, ConversationId, ConversationKind, DeleteScope, MediaRef, MessageId,
        PostId, ReelId, StoryId, UserId,
    },
    error::{ApiError, DecodeError},
};

/// Text shown in place of the content of a message deleted for everyone.
pub const TOMBSTONE_TEXT: &str = "This message was deleted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<ClientNonce>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Display order within a conversation: creation time, ties broken by id.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.message_id)
    }

    /// Replaces the content with a tombstone while keeping identity and position.
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.content.clear();
        self.media = None;
        self.reactions.clear();
    }

    /// Adds or overwrites the reaction of `reaction.user_id`. Returns true when
    /// an existing reaction was replaced.
    pub fn upsert_reaction(&mut self, reaction: Reaction) -> bool {
        if let Some(existing) = self
            .reactions
            .iter_mut()
            .find(|existing| existing.user_id == reaction.user_id)
        {
            *existing = reaction;
            return true;
        }
        self.reactions.push(reaction);
        false
    }

    pub fn remove_reaction(&mut self, user_id: UserId) -> bool {
        let before = self.reactions.len();
        self.reactions.retain(|reaction| reaction.user_id != user_id);
        before != self.reactions.len()
    }

    pub fn display_text(&self) -> &str {
        if self.deleted {
            TOMBSTONE_TEXT
        } else {
            &self.content
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for MessagePreview {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.message_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            deleted: message.deleted,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub reader_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to: Option<MessageId>,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub has_next: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            has_next: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl PageQuery {
    pub fn clamped(&self) -> (u32, u32) {
        (self.page.max(1), self.limit.clamp(1, 100))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub username: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub kind: ConversationKind,
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<ClientNonce>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessageQuery {
    pub scope: DeleteScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Events a client emits over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        message_id: MessageId,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    MarkMessageRead {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    LikePost {
        post_id: PostId,
        post_owner_id: UserId,
    },
    LikeReel {
        reel_id: ReelId,
        reel_owner_id: UserId,
    },
    NewComment {
        post_id: PostId,
        post_owner_id: UserId,
        comment_id: CommentId,
    },
    NewFollow {
        followed_user_id: UserId,
    },
    ViewStory {
        story_id: StoryId,
        story_owner_id: UserId,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::MarkMessageRead { .. } => "mark_message_read",
            Self::LikePost { .. } => "like_post",
            Self::LikeReel { .. } => "like_reel",
            Self::NewComment { .. } => "new_comment",
            Self::NewFollow { .. } => "new_follow",
            Self::ViewStory { .. } => "view_story",
        }
    }
}

/// Events the server pushes to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: Message,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    MessageReactionAdded {
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: Reaction,
    },
    MessageReactionRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
    },
    MessagesRead {
        receipt: ReadReceipt,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
    },
    UserStoppedTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    NewLike {
        post_id: PostId,
        actor: Actor,
    },
    NewReelLike {
        reel_id: ReelId,
        actor: Actor,
    },
    NewCommentNotification {
        post_id: PostId,
        comment_id: CommentId,
        actor: Actor,
    },
    NewFollower {
        actor: Actor,
    },
    StoryViewed {
        story_id: StoryId,
        actor: Actor,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::NewMessage { message } | Self::MessageEdited { message } => {
                Some(message.conversation_id)
            }
            Self::MessageDeleted {
                conversation_id, ..
            }
            | Self::MessageReactionAdded {
                conversation_id, ..
            }
            | Self::MessageReactionRemoved {
                conversation_id, ..
            }
            | Self::UserTyping {
                conversation_id, ..
            }
            | Self::UserStoppedTyping {
                conversation_id, ..
            } => Some(*conversation_id),
            Self::MessagesRead { receipt } => Some(receipt.conversation_id),
            _ => None,
        }
    }
}

/// A decoded socket frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<T> {
    pub event: T,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Encodes `{"event": .., "data": .., "timestamp": ..}`.
pub fn encode_frame<T: Serialize>(
    event: &T,
    timestamp: Option<DateTime<Utc>>,
) -> Result<String, DecodeError> {
    let mut value = serde_json::to_value(event)?;
    if let Some(timestamp) = timestamp {
        let Value::Object(map) = &mut value else {
            return Err(DecodeError::Shape("event did not serialize to an object".into()));
        };
        map.insert("timestamp".to_string(), serde_json::to_value(timestamp)?);
    }
    Ok(serde_json::to_string(&value)?)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<Frame<T>, DecodeError> {
    let mut value: Value = serde_json::from_str(text)?;
    let Value::Object(map) = &mut value else {
        return Err(DecodeError::Shape("frame is not a JSON object".into()));
    };
    // A malformed timestamp falls back to receive time rather than rejecting the frame.
    let timestamp = map
        .remove("timestamp")
        .and_then(|raw| serde_json::from_value::<DateTime<Utc>>(raw).ok());
    let event = serde_json::from_value(value)?;
    Ok(Frame { event, timestamp })
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
