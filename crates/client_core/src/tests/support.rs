//! In-process fakes for the channel and REST seams.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use reqwest::StatusCode;
use shared::{
    domain::{ConversationId, ConversationKind, DeleteScope, MessageId, UserId},
    error::{ApiError, DecodeError},
    protocol::{
        Conversation, CreateConversationRequest, Message, MessagePreview, OutboundEvent, Page,
        Reaction, SendMessageRequest, ServerEvent,
    },
};
use tokio::sync::{watch, Notify};

use crate::{
    api::MessagingApi,
    error::{ClientError, ClientResult},
    events::{ChannelEvent, EventKind, Listener, ListenerRegistry, Subscription},
    lock,
    transport::{ConnectionState, RealtimeChannel},
};

pub(crate) const SELF_USER: UserId = UserId(1);

pub(crate) struct FakeChannel {
    connected: AtomicBool,
    state: watch::Sender<ConnectionState>,
    registry: Arc<ListenerRegistry>,
    emitted: Mutex<Vec<OutboundEvent>>,
}

impl FakeChannel {
    pub(crate) fn new(connected: bool) -> Arc<Self> {
        let (state, _) = watch::channel(if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        });
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            state,
            registry: ListenerRegistry::new(),
            emitted: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.state.send_replace(if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        });
    }

    pub(crate) fn push(&self, event: ServerEvent) -> usize {
        self.registry.dispatch(&ChannelEvent::new(event))
    }

    pub(crate) fn emitted(&self) -> Vec<OutboundEvent> {
        lock(&self.emitted).clone()
    }

    pub(crate) fn listener_count(&self, kind: EventKind) -> usize {
        self.registry.listener_count(kind)
    }
}

impl RealtimeChannel for FakeChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn emit(&self, event: OutboundEvent) {
        lock(&self.emitted).push(event);
    }

    fn subscribe(&self, kind: EventKind, listener: Listener) -> Subscription {
        self.registry.subscribe(kind, listener)
    }
}

#[derive(Default)]
struct FakeApiState {
    /// Chronological.
    messages: Vec<Message>,
    conversations: Vec<Conversation>,
    next_id: i64,
    message_fetches: Vec<(ConversationId, u32, u32)>,
    conversation_fetches: usize,
    fail_sends: bool,
    malformed: bool,
    read_marks: usize,
    read_gate: Option<Arc<Notify>>,
}

#[derive(Default)]
pub(crate) struct FakeApi {
    state: Mutex<FakeApiState>,
}

impl FakeApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn seed_messages(&self, messages: impl IntoIterator<Item = Message>) {
        lock(&self.state).messages.extend(messages);
    }

    pub(crate) fn seed_conversations(&self, conversations: impl IntoIterator<Item = Conversation>) {
        lock(&self.state).conversations.extend(conversations);
    }

    pub(crate) fn set_fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }

    pub(crate) fn set_malformed(&self, malformed: bool) {
        lock(&self.state).malformed = malformed;
    }

    pub(crate) fn message_fetches(&self) -> Vec<(ConversationId, u32, u32)> {
        lock(&self.state).message_fetches.clone()
    }

    pub(crate) fn conversation_fetches(&self) -> usize {
        lock(&self.state).conversation_fetches
    }

    pub(crate) fn read_marks(&self) -> usize {
        lock(&self.state).read_marks
    }

    /// Makes every later `mark_read` wait for a permit on the returned gate.
    pub(crate) fn hold_read_marks(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.state).read_gate = Some(Arc::clone(&gate));
        gate
    }

    fn not_found() -> ClientError {
        ClientError::Api {
            status: StatusCode::NOT_FOUND,
            error: ApiError::not_found("message not found"),
        }
    }

    fn with_message<T>(
        &self,
        message_id: MessageId,
        apply: impl FnOnce(&mut Message) -> T,
    ) -> ClientResult<T> {
        let mut state = lock(&self.state);
        let message = state
            .messages
            .iter_mut()
            .find(|message| message.message_id == message_id)
            .ok_or_else(Self::not_found)?;
        Ok(apply(message))
    }
}

fn paginate<T: Clone>(newest_first: Vec<T>, page: u32, page_size: u32) -> Page<T> {
    let start = ((page.max(1) - 1) * page_size) as usize;
    let items: Vec<T> = newest_first
        .iter()
        .skip(start)
        .take(page_size as usize)
        .cloned()
        .collect();
    let has_next = newest_first.len() > start + items.len();
    Page { items, has_next }
}

#[async_trait]
impl MessagingApi for FakeApi {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> ClientResult<Page<Message>> {
        let mut state = lock(&self.state);
        state.message_fetches.push((conversation_id, page, page_size));
        if state.malformed {
            return Err(DecodeError::Shape("items is not an array".into()).into());
        }
        let newest_first: Vec<Message> = state
            .messages
            .iter()
            .rev()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect();
        let mut page = paginate(newest_first, page, page_size);
        page.items.reverse();
        Ok(page)
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: SendMessageRequest,
    ) -> ClientResult<Message> {
        let mut state = lock(&self.state);
        if state.fail_sends {
            return Err(ClientError::Api {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: ApiError::new(shared::error::ErrorCode::Internal, "try again later"),
            });
        }
        state.next_id += 1;
        let message = Message {
            message_id: MessageId(100 + state.next_id),
            conversation_id,
            sender_id: SELF_USER,
            sender_username: Some("me".into()),
            content: request.content,
            media: request.media,
            reply_to: request.reply_to,
            reactions: Vec::new(),
            edited: false,
            deleted: false,
            client_nonce: request.client_nonce,
            created_at: Utc::now().trunc_subsecs(3),
            edited_at: None,
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn edit_message(&self, message_id: MessageId, content: &str) -> ClientResult<Message> {
        self.with_message(message_id, |message| {
            message.content = content.to_string();
            message.edited = true;
            message.edited_at = Some(Utc::now());
            message.clone()
        })
    }

    async fn delete_message(&self, message_id: MessageId, scope: DeleteScope) -> ClientResult<()> {
        self.with_message(message_id, |message| {
            if scope == DeleteScope::Everyone {
                message.tombstone();
            }
        })
    }

    async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> ClientResult<Message> {
        self.with_message(message_id, |message| {
            message.upsert_reaction(Reaction {
                user_id: SELF_USER,
                emoji: emoji.to_string(),
                created_at: Utc::now(),
            });
            message.clone()
        })
    }

    async fn remove_reaction(&self, message_id: MessageId) -> ClientResult<Message> {
        self.with_message(message_id, |message| {
            message.remove_reaction(SELF_USER);
            message.clone()
        })
    }

    async fn mark_read(&self, _conversation_id: ConversationId) -> ClientResult<()> {
        let gate = {
            let mut state = lock(&self.state);
            state.read_marks += 1;
            state.read_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn fetch_conversations(
        &self,
        page: u32,
        page_size: u32,
    ) -> ClientResult<Page<Conversation>> {
        let mut state = lock(&self.state);
        state.conversation_fetches += 1;
        if state.malformed {
            return Err(DecodeError::Shape("items is not an array".into()).into());
        }
        let mut sorted = state.conversations.clone();
        sorted.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(paginate(sorted, page, page_size))
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> ClientResult<Conversation> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let conversation = Conversation {
            conversation_id: ConversationId(state.next_id),
            kind: request.kind,
            participant_ids: request.participant_ids,
            name: request.name,
            avatar_url: request.avatar_url,
            last_message: None,
            last_activity_at: Utc::now(),
        };
        state.conversations.push(conversation.clone());
        Ok(conversation)
    }
}

pub(crate) fn text_message(id: i64, conversation_id: ConversationId, sender_id: UserId) -> Message {
    Message {
        message_id: MessageId(id),
        conversation_id,
        sender_id,
        sender_username: Some(format!("user{}", sender_id.0)),
        content: format!("message {id}"),
        media: None,
        reply_to: None,
        reactions: Vec::new(),
        edited: false,
        deleted: false,
        client_nonce: None,
        created_at: Utc::now().trunc_subsecs(3) - chrono::Duration::seconds(1000 - id),
        edited_at: None,
    }
}

pub(crate) fn direct_conversation(id: i64, seconds_ago: i64) -> Conversation {
    let last_activity_at = Utc::now().trunc_subsecs(3) - chrono::Duration::seconds(seconds_ago);
    Conversation {
        conversation_id: ConversationId(id),
        kind: ConversationKind::Direct,
        participant_ids: vec![SELF_USER, UserId(id + 10)],
        name: None,
        avatar_url: None,
        last_message: Some(MessagePreview {
            message_id: MessageId(id * 100),
            sender_id: UserId(id + 10),
            content: "hey".into(),
            deleted: false,
            created_at: last_activity_at,
        }),
        last_activity_at,
    }
}
