use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use shared::domain::UserId;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: UserId,
    pub username: String,
}

pub type TypingNotifier = Arc<dyn Fn(Vec<TypingUser>) + Send + Sync>;

struct TypingEntry {
    username: String,
    generation: u64,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    next_generation: u64,
    entries: HashMap<UserId, TypingEntry>,
}

/// Remote typing indicators. Each sender has a single expiry timer that is
/// renewed, never stacked, when another `start` arrives.
pub struct TypingTracker {
    window: Duration,
    state: Arc<Mutex<TypingState>>,
    notifier: Option<TypingNotifier>,
}

impl TypingTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(TypingState::default())),
            notifier: None,
        }
    }

    pub fn with_notifier(window: Duration, notifier: TypingNotifier) -> Self {
        let mut tracker = Self::new(window);
        tracker.notifier = Some(notifier);
        tracker
    }

    pub fn start(&self, user_id: UserId, username: &str) {
        let changed = {
            let mut state = lock(&self.state);
            state.next_generation += 1;
            let generation = state.next_generation;
            let expiry = self.spawn_expiry(user_id, generation);
            let previous = state.entries.insert(
                user_id,
                TypingEntry {
                    username: username.to_string(),
                    generation,
                    expiry,
                },
            );
            match previous {
                Some(previous) => {
                    previous.expiry.abort();
                    previous.username != username
                }
                None => true,
            }
        };
        trace!(user_id = user_id.0, "typing: indicator renewed");
        if changed {
            self.notify();
        }
    }

    pub fn stop(&self, user_id: UserId) -> bool {
        let removed = lock(&self.state).entries.remove(&user_id);
        match removed {
            Some(entry) => {
                entry.expiry.abort();
                self.notify();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let drained: Vec<TypingEntry> = lock(&self.state)
            .entries
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if drained.is_empty() {
            return;
        }
        for entry in drained {
            entry.expiry.abort();
        }
        self.notify();
    }

    pub fn is_typing(&self, user_id: UserId) -> bool {
        lock(&self.state).entries.contains_key(&user_id)
    }

    /// Sorted by username.
    pub fn typing_users(&self) -> Vec<TypingUser> {
        snapshot(&lock(&self.state))
    }

    fn notify(&self) {
        if let Some(notifier) = &self.notifier {
            notifier(self.typing_users());
        }
    }

    fn spawn_expiry(&self, user_id: UserId, generation: u64) -> JoinHandle<()> {
        let state = Arc::downgrade(&self.state);
        let notifier = self.notifier.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let remaining = {
                let mut guard = lock(&state);
                let current = guard
                    .entries
                    .get(&user_id)
                    .is_some_and(|entry| entry.generation == generation);
                if !current {
                    return;
                }
                guard.entries.remove(&user_id);
                snapshot(&guard)
            };
            trace!(user_id = user_id.0, "typing: indicator expired");
            if let Some(notifier) = notifier {
                notifier(remaining);
            }
        })
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.state).entries.drain() {
            entry.expiry.abort();
        }
    }
}

fn snapshot(state: &TypingState) -> Vec<TypingUser> {
    let mut users: Vec<TypingUser> = state
        .entries
        .iter()
        .map(|(user_id, entry)| TypingUser {
            user_id: *user_id,
            username: entry.username.clone(),
        })
        .collect();
    users.sort_by(|a, b| a.username.cmp(&b.username).then(a.user_id.cmp(&b.user_id)));
    users
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
