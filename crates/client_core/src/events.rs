//! Typed inbound events and the per-kind listener registry the transport fans out to.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use chrono::{DateTime, Utc};
use shared::protocol::{Frame, ServerEvent};

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    MessageEdited,
    MessageDeleted,
    ReactionAdded,
    ReactionRemoved,
    MessagesRead,
    TypingStart,
    TypingStop,
    UserOnline,
    UserOffline,
    Notification,
    Error,
}

impl EventKind {
    /// Kinds scoped to a single conversation.
    pub const CONVERSATION: [EventKind; 8] = [
        EventKind::NewMessage,
        EventKind::MessageEdited,
        EventKind::MessageDeleted,
        EventKind::ReactionAdded,
        EventKind::ReactionRemoved,
        EventKind::MessagesRead,
        EventKind::TypingStart,
        EventKind::TypingStop,
    ];

    pub fn of(event: &ServerEvent) -> Self {
        match event {
            ServerEvent::NewMessage { .. } => Self::NewMessage,
            ServerEvent::MessageEdited { .. } => Self::MessageEdited,
            ServerEvent::MessageDeleted { .. } => Self::MessageDeleted,
            ServerEvent::MessageReactionAdded { .. } => Self::ReactionAdded,
            ServerEvent::MessageReactionRemoved { .. } => Self::ReactionRemoved,
            ServerEvent::MessagesRead { .. } => Self::MessagesRead,
            ServerEvent::UserTyping { .. } => Self::TypingStart,
            ServerEvent::UserStoppedTyping { .. } => Self::TypingStop,
            ServerEvent::UserOnline { .. } => Self::UserOnline,
            ServerEvent::UserOffline { .. } => Self::UserOffline,
            ServerEvent::NewLike { .. }
            | ServerEvent::NewReelLike { .. }
            | ServerEvent::NewCommentNotification { .. }
            | ServerEvent::NewFollower { .. }
            | ServerEvent::StoryViewed { .. } => Self::Notification,
            ServerEvent::Error(_) => Self::Error,
        }
    }
}

/// An inbound event after normalization by the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub event: ServerEvent,
}

impl ChannelEvent {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            kind: EventKind::of(&event),
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn from_frame(frame: Frame<ServerEvent>) -> Self {
        Self {
            kind: EventKind::of(&frame.event),
            timestamp: frame.timestamp.unwrap_or_else(Utc::now),
            event: frame.event,
        }
    }
}

pub type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(u64, Listener)>>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, kind: EventKind, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners)
            .entry(kind)
            .or_default()
            .push((id, listener));
        Subscription {
            registry: Arc::downgrade(self),
            kind,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Calls every listener registered for the event's kind, in registration order.
    pub fn dispatch(&self, event: &ChannelEvent) -> usize {
        // Snapshot so listeners may (un)subscribe from inside a callback.
        let listeners: Vec<Listener> = lock(&self.listeners)
            .get(&event.kind)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.listeners).get(&kind).map_or(0, Vec::len)
    }

    fn remove(&self, kind: EventKind, id: u64) {
        let mut guard = lock(&self.listeners);
        if let Some(entries) = guard.get_mut(&kind) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                guard.remove(&kind);
            }
        }
    }
}

/// Handle returned by a registration. Unsubscribes on drop.
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    kind: EventKind,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.kind, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
