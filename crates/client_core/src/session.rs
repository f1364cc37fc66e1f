//! One open conversation: joins its room, merges history, pushes and local
//! sends into a reconciler, and falls back to polling while the channel is down.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{ClientNonce, ConversationId, DeleteScope, MediaRef, MessageId, UserId},
    protocol::{Message, ReadReceipt, SendMessageRequest, ServerEvent},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    api::MessagingApi,
    config::ClientSettings,
    error::{ClientError, ClientResult},
    events::{ChannelEvent, EventKind, Subscription},
    lock,
    poller::{FallbackPoller, PollPolicy, PollTarget},
    reconciler::{MessageEntry, MessageReconciler},
    transport::RealtimeChannel,
    typing::{TypingTracker, TypingUser},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub page_size: u32,
    pub poll: PollPolicy,
    pub typing_window: Duration,
    pub composing_idle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for SessionConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            page_size: settings.page_size,
            poll: settings.message_poll,
            typing_window: settings.typing_window,
            composing_idle: settings.composing_idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Joining,
    Active,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Messages,
    Typing(Vec<TypingUser>),
    ReadReceipt(ReadReceipt),
    State(SessionState),
    Error(String),
}

struct SessionShared {
    conversation_id: ConversationId,
    identity: Identity,
    state: Mutex<SessionState>,
    /// Cleared on close; late responses check it before touching state.
    relevant: AtomicBool,
    reconciler: Mutex<MessageReconciler>,
    typing: TypingTracker,
    last_error: Mutex<Option<String>>,
    refresh_in_flight: AtomicBool,
    /// Idle timer for our own typing indicator; `Some` while composing.
    composing: Mutex<Option<JoinHandle<()>>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionShared {
    fn is_relevant(&self) -> bool {
        self.relevant.load(Ordering::Acquire)
    }

    fn publish(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn record_error(&self, action: &str, err: &ClientError) {
        warn!(
            conversation_id = self.conversation_id.0,
            error = %err,
            "session: {action} failed"
        );
        let message = format!("{action} failed: {err}");
        *lock(&self.last_error) = Some(message.clone());
        self.publish(SessionUpdate::Error(message));
    }

    fn clear_error(&self) {
        lock(&self.last_error).take();
    }

    fn fetch_in_flight(&self) -> bool {
        lock(&self.reconciler).page_in_flight() || self.refresh_in_flight.load(Ordering::Acquire)
    }

    /// Refetches page 1 and merges it.
    async fn refetch_latest(&self, api: &dyn MessagingApi, page_size: u32) -> ClientResult<usize> {
        if self.refresh_in_flight.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let result = api.fetch_messages(self.conversation_id, 1, page_size).await;
        self.refresh_in_flight.store(false, Ordering::Release);
        let page = result?;
        if !self.is_relevant() {
            return Ok(0);
        }
        let added = lock(&self.reconciler).merge_batch(page.items);
        if added > 0 {
            self.publish(SessionUpdate::Messages);
        }
        Ok(added)
    }

    fn handle_event(&self, channel: Option<&dyn RealtimeChannel>, event: &ChannelEvent) {
        if !self.is_relevant() || event.event.conversation_id() != Some(self.conversation_id) {
            return;
        }
        match &event.event {
            ServerEvent::UserTyping {
                user_id, username, ..
            } => {
                if *user_id != self.identity.user_id {
                    self.typing.start(*user_id, username);
                }
            }
            ServerEvent::UserStoppedTyping { user_id, .. } => {
                self.typing.stop(*user_id);
            }
            ServerEvent::MessagesRead { receipt } => {
                if lock(&self.reconciler).apply_read_receipt(receipt.clone()) {
                    self.publish(SessionUpdate::ReadReceipt(receipt.clone()));
                }
            }
            other => {
                let changed = lock(&self.reconciler).apply(other);
                if let ServerEvent::NewMessage { message } = other {
                    if message.sender_id != self.identity.user_id {
                        self.typing.stop(message.sender_id);
                        let active = *lock(&self.state) == SessionState::Active;
                        if changed && active {
                            if let Some(channel) = channel {
                                channel.mark_message_read(
                                    self.conversation_id,
                                    Some(message.message_id),
                                );
                            }
                        }
                    }
                }
                if changed {
                    debug!(
                        conversation_id = self.conversation_id.0,
                        kind = ?event.kind,
                        "session: applied push"
                    );
                    self.publish(SessionUpdate::Messages);
                }
            }
        }
    }

    fn stop_composing(&self, channel: &dyn RealtimeChannel) {
        if let Some(timer) = lock(&self.composing).take() {
            timer.abort();
            channel.typing_stop(self.conversation_id);
        }
    }
}

pub struct ConversationSession {
    shared: Arc<SessionShared>,
    channel: Arc<dyn RealtimeChannel>,
    api: Arc<dyn MessagingApi>,
    config: SessionConfig,
    subscriptions: Mutex<Vec<Subscription>>,
    poller: Mutex<Option<FallbackPoller>>,
}

impl ConversationSession {
    pub fn new(
        conversation_id: ConversationId,
        identity: Identity,
        channel: Arc<dyn RealtimeChannel>,
        api: Arc<dyn MessagingApi>,
        config: SessionConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        let typing_updates = updates.clone();
        let typing = TypingTracker::with_notifier(
            config.typing_window,
            Arc::new(move |users: Vec<TypingUser>| {
                let _ = typing_updates.send(SessionUpdate::Typing(users));
            }),
        );
        Self {
            shared: Arc::new(SessionShared {
                conversation_id,
                identity,
                state: Mutex::new(SessionState::Closed),
                relevant: AtomicBool::new(false),
                reconciler: Mutex::new(MessageReconciler::new(conversation_id)),
                typing,
                last_error: Mutex::new(None),
                refresh_in_flight: AtomicBool::new(false),
                composing: Mutex::new(None),
                updates,
            }),
            channel,
            api,
            config,
            subscriptions: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.shared.conversation_id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn messages(&self) -> Vec<MessageEntry> {
        lock(&self.shared.reconciler).entries().to_vec()
    }

    pub fn typing_users(&self) -> Vec<TypingUser> {
        self.shared.typing.typing_users()
    }

    pub fn read_receipts(&self) -> Vec<ReadReceipt> {
        lock(&self.shared.reconciler)
            .read_receipts()
            .cloned()
            .collect()
    }

    /// False once the oldest page has been loaded.
    pub fn can_load_more(&self) -> bool {
        lock(&self.shared.reconciler).has_more()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    /// Joins the room, loads the newest page, marks the conversation read and
    /// starts the fallback poller. Fetch failures leave an empty view and a
    /// retryable error in `last_error`.
    pub async fn open(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state != SessionState::Closed {
                return;
            }
            *state = SessionState::Joining;
        }
        lock(&self.shared.reconciler).rewind_pages();
        self.shared.relevant.store(true, Ordering::Release);
        self.shared.publish(SessionUpdate::State(SessionState::Joining));
        info!(conversation_id = self.conversation_id().0, "session: opening");

        self.attach_listeners();
        self.channel.join_conversation(self.conversation_id());

        if let Err(err) = self.load_older().await {
            debug!(error = %err, "session: initial fetch failed; view left empty");
        }
        if !self.shared.is_relevant() {
            return;
        }
        self.mark_read().await;
        if !self.shared.is_relevant() {
            return;
        }

        {
            // Poller is installed under the state lock; `close` stops it or it never starts.
            let mut state = lock(&self.shared.state);
            if *state != SessionState::Joining {
                return;
            }
            let target = Arc::new(SessionPollTarget {
                shared: Arc::downgrade(&self.shared),
                api: Arc::clone(&self.api),
                page_size: self.config.page_size,
            });
            *lock(&self.poller) = Some(FallbackPoller::start(
                Arc::clone(&self.channel),
                self.config.poll,
                target,
            ));
            *state = SessionState::Active;
        }
        self.shared.publish(SessionUpdate::State(SessionState::Active));
    }

    /// Leaves the room and cancels listeners, timers and polling. Idempotent.
    pub fn close(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.shared.relevant.store(false, Ordering::Release);
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        if let Some(mut poller) = lock(&self.poller).take() {
            poller.stop();
        }
        self.shared.typing.clear();
        self.shared.stop_composing(self.channel.as_ref());
        self.channel.leave_conversation(self.conversation_id());
        self.shared.publish(SessionUpdate::State(SessionState::Closed));
        info!(conversation_id = self.conversation_id().0, "session: closed");
    }

    pub async fn send_message(
        &self,
        content: &str,
        media: Option<MediaRef>,
        reply_to: Option<MessageId>,
    ) -> ClientResult<Message> {
        self.ensure_open()?;
        let content = content.trim().to_string();
        if content.is_empty() && media.is_none() {
            return Err(ClientError::InvalidState("message is empty".into()));
        }
        let nonce = lock(&self.shared.reconciler).insert_pending(
            self.shared.identity.user_id,
            Some(self.shared.identity.username.clone()),
            content.clone(),
            media.clone(),
            reply_to,
        );
        self.shared.publish(SessionUpdate::Messages);
        self.shared.stop_composing(self.channel.as_ref());
        self.deliver(
            nonce,
            SendMessageRequest {
                content,
                media,
                reply_to,
                client_nonce: Some(nonce),
            },
        )
        .await
    }

    /// Resends a failed entry under its original nonce.
    pub async fn retry_failed(&self, nonce: ClientNonce) -> ClientResult<Message> {
        self.ensure_open()?;
        let message = lock(&self.shared.reconciler)
            .retry_pending(nonce)
            .ok_or_else(|| ClientError::InvalidState(format!("no failed message {nonce}")))?;
        self.shared.publish(SessionUpdate::Messages);
        self.deliver(
            nonce,
            SendMessageRequest {
                content: message.content,
                media: message.media,
                reply_to: message.reply_to,
                client_nonce: Some(nonce),
            },
        )
        .await
    }

    pub fn discard_failed(&self, nonce: ClientNonce) -> bool {
        let removed = lock(&self.shared.reconciler).discard_pending(nonce);
        if removed {
            self.shared.publish(SessionUpdate::Messages);
        }
        removed
    }

    pub async fn edit_message(&self, message_id: MessageId, content: &str) -> ClientResult<Message> {
        self.ensure_open()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::InvalidState("edited message is empty".into()));
        }
        match self.api.edit_message(message_id, content).await {
            Ok(message) => {
                if self.shared.is_relevant() && lock(&self.shared.reconciler).apply_edit(&message) {
                    self.shared.publish(SessionUpdate::Messages);
                }
                Ok(message)
            }
            Err(err) => {
                self.shared.record_error("edit message", &err);
                Err(err)
            }
        }
    }

    pub async fn delete_message(&self, message_id: MessageId, scope: DeleteScope) -> ClientResult<()> {
        self.ensure_open()?;
        if let Err(err) = self.api.delete_message(message_id, scope).await {
            self.shared.record_error("delete message", &err);
            return Err(err);
        }
        if !self.shared.is_relevant() {
            return Ok(());
        }
        let changed = {
            let mut reconciler = lock(&self.shared.reconciler);
            match scope {
                DeleteScope::Everyone => reconciler.apply_delete(message_id),
                DeleteScope::Me => reconciler.delete_for_me(message_id),
            }
        };
        if changed {
            self.shared.publish(SessionUpdate::Messages);
        }
        Ok(())
    }

    pub async fn react(&self, message_id: MessageId, emoji: &str) -> ClientResult<Message> {
        self.ensure_open()?;
        let result = self.api.add_reaction(message_id, emoji).await;
        self.apply_reaction_result("react", result)
    }

    pub async fn unreact(&self, message_id: MessageId) -> ClientResult<Message> {
        self.ensure_open()?;
        let result = self.api.remove_reaction(message_id).await;
        self.apply_reaction_result("remove reaction", result)
    }

    /// Fetches the next older page. No-op while another page fetch is in
    /// flight or after the oldest page was reached.
    pub async fn load_older(&self) -> ClientResult<usize> {
        let Some(page_number) = lock(&self.shared.reconciler).begin_page_fetch() else {
            return Ok(0);
        };
        let result = self
            .api
            .fetch_messages(self.conversation_id(), page_number, self.config.page_size)
            .await;
        if !self.shared.is_relevant() {
            lock(&self.shared.reconciler).abort_page_fetch();
            return Ok(0);
        }
        match result {
            Ok(page) => {
                let added = lock(&self.shared.reconciler).complete_page_fetch(page_number, page);
                self.shared.clear_error();
                debug!(
                    conversation_id = self.conversation_id().0,
                    page_number, added, "session: page merged"
                );
                self.shared.publish(SessionUpdate::Messages);
                Ok(added)
            }
            Err(err) if err.is_decode() => {
                lock(&self.shared.reconciler).abort_page_fetch();
                warn!(
                    conversation_id = self.conversation_id().0,
                    error = %err,
                    "session: malformed page treated as empty"
                );
                Ok(0)
            }
            Err(err) => {
                lock(&self.shared.reconciler).abort_page_fetch();
                self.shared.record_error("load messages", &err);
                Err(err)
            }
        }
    }

    /// Scroll hook: loads older history once the viewport reaches the top.
    pub async fn on_scrolled(&self, at_top: bool) -> ClientResult<usize> {
        if !lock(&self.shared.reconciler).should_load_older(at_top) {
            return Ok(0);
        }
        self.load_older().await
    }

    /// Manual retry: loads the first page if it never arrived, otherwise
    /// refetches the newest page.
    pub async fn refresh(&self) -> ClientResult<usize> {
        if lock(&self.shared.reconciler).next_page() == 1 {
            return self.load_older().await;
        }
        match self
            .shared
            .refetch_latest(self.api.as_ref(), self.config.page_size)
            .await
        {
            Ok(added) => {
                self.shared.clear_error();
                Ok(added)
            }
            Err(err) if err.is_decode() => {
                warn!(error = %err, "session: malformed refresh treated as empty");
                Ok(0)
            }
            Err(err) => {
                self.shared.record_error("refresh", &err);
                Err(err)
            }
        }
    }

    /// Drives our own typing indicator: `typing_start` on the first keystroke,
    /// `typing_stop` after the idle window or when composing ends.
    pub fn set_composing(&self, composing: bool) {
        if !composing || self.state() == SessionState::Closed {
            self.shared.stop_composing(self.channel.as_ref());
            return;
        }
        let conversation_id = self.conversation_id();
        let mut timer = lock(&self.shared.composing);
        match timer.take() {
            Some(previous) => previous.abort(),
            None => self.channel.typing_start(conversation_id),
        }
        let shared = Arc::downgrade(&self.shared);
        let channel = Arc::downgrade(&self.channel);
        let idle = self.config.composing_idle;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let (Some(shared), Some(channel)) = (shared.upgrade(), channel.upgrade()) else {
                return;
            };
            if lock(&shared.composing).take().is_some() {
                channel.typing_stop(conversation_id);
            }
        }));
    }

    async fn deliver(&self, nonce: ClientNonce, request: SendMessageRequest) -> ClientResult<Message> {
        match self.api.send_message(self.conversation_id(), request).await {
            Ok(message) => {
                if self.shared.is_relevant() {
                    lock(&self.shared.reconciler).confirm_pending(nonce, message.clone());
                    self.shared.publish(SessionUpdate::Messages);
                }
                self.channel
                    .send_message(self.conversation_id(), &message.content, message.message_id);
                self.shared.clear_error();
                Ok(message)
            }
            Err(err) => {
                if self.shared.is_relevant() {
                    lock(&self.shared.reconciler).fail_pending(nonce, err.to_string());
                    self.shared.publish(SessionUpdate::Messages);
                }
                self.shared.record_error("send message", &err);
                Err(err)
            }
        }
    }

    fn apply_reaction_result(
        &self,
        action: &str,
        result: ClientResult<Message>,
    ) -> ClientResult<Message> {
        match result {
            Ok(message) => {
                let changed = self.shared.is_relevant()
                    && lock(&self.shared.reconciler)
                        .replace_reactions(message.message_id, message.reactions.clone());
                if changed {
                    self.shared.publish(SessionUpdate::Messages);
                }
                Ok(message)
            }
            Err(err) => {
                self.shared.record_error(action, &err);
                Err(err)
            }
        }
    }

    async fn mark_read(&self) {
        if let Err(err) = self.api.mark_read(self.conversation_id()).await {
            warn!(conversation_id = self.conversation_id().0, error = %err, "session: mark read failed");
        }
        let last = lock(&self.shared.reconciler).last_confirmed_id();
        self.channel.mark_message_read(self.conversation_id(), last);
    }

    fn attach_listeners(&self) {
        let mut subscriptions = lock(&self.subscriptions);
        for kind in EventKind::CONVERSATION {
            let shared = Arc::downgrade(&self.shared);
            let channel: Weak<dyn RealtimeChannel> = Arc::downgrade(&self.channel);
            subscriptions.push(self.channel.subscribe(
                kind,
                Arc::new(move |event: &ChannelEvent| {
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    let channel = channel.upgrade();
                    shared.handle_event(channel.as_deref(), event);
                }),
            ));
        }
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.state() == SessionState::Closed {
            return Err(ClientError::InvalidState(format!(
                "conversation {} is not open",
                self.conversation_id()
            )));
        }
        Ok(())
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionPollTarget {
    shared: Weak<SessionShared>,
    api: Arc<dyn MessagingApi>,
    page_size: u32,
}

#[async_trait]
impl PollTarget for SessionPollTarget {
    fn label(&self) -> &'static str {
        "messages"
    }

    fn fetch_in_flight(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.fetch_in_flight())
    }

    async fn poll_once(&self) -> ClientResult<usize> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(0);
        };
        shared.refetch_latest(self.api.as_ref(), self.page_size).await
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
