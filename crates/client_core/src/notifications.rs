//! Bounded feed of inbound social notifications, newest first.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{CommentId, PostId, ReelId, StoryId},
    protocol::{Actor, ServerEvent},
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    events::{ChannelEvent, EventKind, Subscription},
    lock,
    transport::RealtimeChannel,
};

pub const FEED_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    PostLiked { post_id: PostId },
    ReelLiked { reel_id: ReelId },
    Commented { post_id: PostId, comment_id: CommentId },
    Followed,
    StoryViewed { story_id: StoryId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub actor: Actor,
    pub received_at: DateTime<Utc>,
}

impl Notification {
    /// None for events that are not social notifications.
    pub fn from_event(event: &ChannelEvent) -> Option<Self> {
        let (kind, actor) = match &event.event {
            ServerEvent::NewLike { post_id, actor } => {
                (NotificationKind::PostLiked { post_id: *post_id }, actor)
            }
            ServerEvent::NewReelLike { reel_id, actor } => {
                (NotificationKind::ReelLiked { reel_id: *reel_id }, actor)
            }
            ServerEvent::NewCommentNotification {
                post_id,
                comment_id,
                actor,
            } => (
                NotificationKind::Commented {
                    post_id: *post_id,
                    comment_id: *comment_id,
                },
                actor,
            ),
            ServerEvent::NewFollower { actor } => (NotificationKind::Followed, actor),
            ServerEvent::StoryViewed { story_id, actor } => {
                (NotificationKind::StoryViewed { story_id: *story_id }, actor)
            }
            _ => return None,
        };
        Some(Self {
            kind,
            actor: actor.clone(),
            received_at: event.timestamp,
        })
    }

    pub fn summary(&self) -> String {
        let who = self
            .actor
            .username
            .clone()
            .unwrap_or_else(|| format!("user {}", self.actor.user_id));
        match &self.kind {
            NotificationKind::PostLiked { post_id } => format!("{who} liked your post {post_id}"),
            NotificationKind::ReelLiked { reel_id } => format!("{who} liked your reel {reel_id}"),
            NotificationKind::Commented { post_id, .. } => {
                format!("{who} commented on your post {post_id}")
            }
            NotificationKind::Followed => format!("{who} started following you"),
            NotificationKind::StoryViewed { story_id } => {
                format!("{who} viewed your story {story_id}")
            }
        }
    }
}

pub struct NotificationFeed {
    items: Arc<Mutex<VecDeque<Notification>>>,
    updates: broadcast::Sender<Notification>,
    subscription: Subscription,
}

impl NotificationFeed {
    pub fn attach(channel: &dyn RealtimeChannel) -> Self {
        let items: Arc<Mutex<VecDeque<Notification>>> = Arc::default();
        let (updates, _) = broadcast::channel(FEED_CAPACITY);
        let sink = Arc::clone(&items);
        let sender = updates.clone();
        let subscription = channel.subscribe(
            EventKind::Notification,
            Arc::new(move |event: &ChannelEvent| {
                let Some(notification) = Notification::from_event(event) else {
                    return;
                };
                debug!(
                    actor_id = notification.actor.user_id.0,
                    "notifications: {}",
                    notification.summary()
                );
                {
                    let mut items = lock(&sink);
                    items.push_front(notification.clone());
                    items.truncate(FEED_CAPACITY);
                }
                let _ = sender.send(notification);
            }),
        );
        Self {
            items,
            updates,
            subscription,
        }
    }

    pub fn items(&self) -> Vec<Notification> {
        lock(&self.items).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.items).clear();
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<Notification> {
        self.updates.subscribe()
    }

    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
