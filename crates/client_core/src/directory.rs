//! Conversation list ordered by latest activity, kept fresh by pushes and a
//! slower fallback poll.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Weak,
};

use async_trait::async_trait;
use shared::{
    domain::ConversationId,
    protocol::{Conversation, Message, MessagePreview, ServerEvent},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    api::MessagingApi,
    config::ClientSettings,
    error::ClientResult,
    events::{ChannelEvent, EventKind, Subscription},
    lock,
    poller::{FallbackPoller, PollPolicy, PollTarget},
    transport::RealtimeChannel,
};

#[derive(Debug, Default)]
pub struct ConversationDirectory {
    conversations: Vec<Conversation>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest activity first; ties broken by id, newest first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| conversation.conversation_id == conversation_id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Inserts or replaces. A replacement older than the activity already
    /// held keeps the newer `last_activity_at` and `last_message`. Returns
    /// true when the conversation was new.
    pub fn upsert(&mut self, mut conversation: Conversation) -> bool {
        let existing = self
            .conversations
            .iter()
            .position(|current| current.conversation_id == conversation.conversation_id);
        let is_new = match existing {
            Some(index) => {
                let current = &mut self.conversations[index];
                if current.last_activity_at > conversation.last_activity_at {
                    conversation.last_activity_at = current.last_activity_at;
                    conversation.last_message = current.last_message.take();
                }
                *current = conversation;
                false
            }
            None => {
                self.conversations.push(conversation);
                true
            }
        };
        self.sort();
        is_new
    }

    pub fn merge_batch(&mut self, conversations: impl IntoIterator<Item = Conversation>) -> usize {
        conversations
            .into_iter()
            .map(|conversation| self.upsert(conversation))
            .filter(|is_new| *is_new)
            .count()
    }

    /// Moves the conversation to the top when `message` is newer than its
    /// last activity. Returns false for unknown conversations.
    pub fn bump(&mut self, message: &Message) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.conversation_id == message.conversation_id)
        else {
            return false;
        };
        if message.created_at < conversation.last_activity_at {
            return true;
        }
        conversation.last_activity_at = message.created_at;
        conversation.last_message = Some(MessagePreview::from(message));
        self.sort();
        true
    }

    fn sort(&mut self) {
        self.conversations.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then(b.conversation_id.cmp(&a.conversation_id))
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListUpdate {
    Conversations,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListConfig {
    pub page_size: u32,
    pub poll: PollPolicy,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ListConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            page_size: settings.page_size,
            poll: settings.list_poll,
        }
    }
}

struct ListShared {
    directory: Mutex<ConversationDirectory>,
    relevant: AtomicBool,
    fetch_in_flight: AtomicBool,
    last_error: Mutex<Option<String>>,
    updates: broadcast::Sender<ListUpdate>,
}

impl ListShared {
    async fn refetch(&self, api: &dyn MessagingApi, page_size: u32) -> ClientResult<usize> {
        if self.fetch_in_flight.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let result = api.fetch_conversations(1, page_size).await;
        self.fetch_in_flight.store(false, Ordering::Release);
        let page = result?;
        if !self.relevant.load(Ordering::Acquire) {
            return Ok(0);
        }
        let added = lock(&self.directory).merge_batch(page.items);
        let _ = self.updates.send(ListUpdate::Conversations);
        Ok(added)
    }

    /// Returns false when the push names a conversation the list has not
    /// fetched yet.
    fn handle_event(&self, event: &ChannelEvent) -> bool {
        if !self.relevant.load(Ordering::Acquire) {
            return true;
        }
        let ServerEvent::NewMessage { message } = &event.event else {
            return true;
        };
        if lock(&self.directory).bump(message) {
            let _ = self.updates.send(ListUpdate::Conversations);
            return true;
        }
        debug!(
            conversation_id = message.conversation_id.0,
            "directory: push for unlisted conversation"
        );
        false
    }
}

/// The conversation list surface.
pub struct ConversationListView {
    shared: Arc<ListShared>,
    channel: Arc<dyn RealtimeChannel>,
    api: Arc<dyn MessagingApi>,
    config: ListConfig,
    subscription: Mutex<Option<Subscription>>,
    poller: Mutex<Option<FallbackPoller>>,
}

impl ConversationListView {
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        api: Arc<dyn MessagingApi>,
        config: ListConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(ListShared {
                directory: Mutex::new(ConversationDirectory::new()),
                relevant: AtomicBool::new(false),
                fetch_in_flight: AtomicBool::new(false),
                last_error: Mutex::new(None),
                updates,
            }),
            channel,
            api,
            config,
            subscription: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub async fn open(&self) {
        if self.shared.relevant.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("directory: opening conversation list");
        let shared = Arc::downgrade(&self.shared);
        let api = Arc::clone(&self.api);
        let page_size = self.config.page_size;
        *lock(&self.subscription) = Some(self.channel.subscribe(
            EventKind::NewMessage,
            Arc::new(move |event: &ChannelEvent| {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                if shared.handle_event(event) {
                    return;
                }
                let api = Arc::clone(&api);
                tokio::spawn(async move {
                    if let Err(err) = shared.refetch(api.as_ref(), page_size).await {
                        warn!(error = %err, "directory: refetch after push failed");
                    }
                });
            }),
        ));

        let _ = self.refresh().await;
        if !self.shared.relevant.load(Ordering::Acquire) {
            return;
        }
        *lock(&self.poller) = Some(FallbackPoller::start(
            Arc::clone(&self.channel),
            self.config.poll,
            Arc::new(ListPollTarget {
                shared: Arc::downgrade(&self.shared),
                api: Arc::clone(&self.api),
                page_size: self.config.page_size,
            }),
        ));
    }

    pub fn close(&self) {
        if !self.shared.relevant.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.unsubscribe();
        }
        if let Some(mut poller) = lock(&self.poller).take() {
            poller.stop();
        }
        info!("directory: conversation list closed");
    }

    pub async fn refresh(&self) -> ClientResult<usize> {
        match self
            .shared
            .refetch(self.api.as_ref(), self.config.page_size)
            .await
        {
            Ok(added) => {
                lock(&self.shared.last_error).take();
                Ok(added)
            }
            Err(err) if err.is_decode() => {
                warn!(error = %err, "directory: malformed list treated as empty");
                Ok(0)
            }
            Err(err) => {
                warn!(error = %err, "directory: refresh failed");
                let message = format!("load conversations failed: {err}");
                *lock(&self.shared.last_error) = Some(message.clone());
                let _ = self.shared.updates.send(ListUpdate::Error(message));
                Err(err)
            }
        }
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        lock(&self.shared.directory).conversations().to_vec()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ListUpdate> {
        self.shared.updates.subscribe()
    }
}

impl Drop for ConversationListView {
    fn drop(&mut self) {
        self.close();
    }
}

struct ListPollTarget {
    shared: Weak<ListShared>,
    api: Arc<dyn MessagingApi>,
    page_size: u32,
}

#[async_trait]
impl PollTarget for ListPollTarget {
    fn label(&self) -> &'static str {
        "conversations"
    }

    fn fetch_in_flight(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.fetch_in_flight.load(Ordering::Acquire))
    }

    async fn poll_once(&self) -> ClientResult<usize> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(0);
        };
        shared.refetch(self.api.as_ref(), self.page_size).await
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
