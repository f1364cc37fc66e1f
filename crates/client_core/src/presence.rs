//! Online users as last reported by the channel.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use shared::{domain::UserId, protocol::ServerEvent};
use tracing::debug;

use crate::{
    events::{ChannelEvent, EventKind, Subscription},
    lock,
    transport::RealtimeChannel,
};

#[derive(Default)]
pub struct PresenceBook {
    online: Arc<Mutex<BTreeSet<UserId>>>,
    subscriptions: Vec<Subscription>,
}

impl PresenceBook {
    /// Starts tracking `user_online`/`user_offline` on `channel`.
    pub fn attach(channel: &dyn RealtimeChannel) -> Self {
        let online: Arc<Mutex<BTreeSet<UserId>>> = Arc::default();
        let subscriptions = [EventKind::UserOnline, EventKind::UserOffline]
            .into_iter()
            .map(|kind| {
                let online = Arc::clone(&online);
                channel.subscribe(
                    kind,
                    Arc::new(move |event: &ChannelEvent| {
                        apply(&online, &event.event);
                    }),
                )
            })
            .collect();
        Self {
            online,
            subscriptions,
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        lock(&self.online).contains(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        lock(&self.online).iter().copied().collect()
    }

    /// Stops tracking and forgets everyone.
    pub fn detach(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        lock(&self.online).clear();
    }
}

fn apply(online: &Mutex<BTreeSet<UserId>>, event: &ServerEvent) {
    match event {
        ServerEvent::UserOnline { user_id } => {
            if lock(online).insert(*user_id) {
                debug!(user_id = user_id.0, "presence: online");
            }
        }
        ServerEvent::UserOffline { user_id } => {
            if lock(online).remove(user_id) {
                debug!(user_id = user_id.0, "presence: offline");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
