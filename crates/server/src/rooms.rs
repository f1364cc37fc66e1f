//! Socket connections, the conversation rooms they joined, and fan-out.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{encode_frame, ServerEvent},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type ConnectionId = u64;

struct Connection {
    user_id: UserId,
    outbox: mpsc::UnboundedSender<String>,
    rooms: HashSet<ConversationId>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<ConversationId, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct RoomRegistry {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

/// Result of registering or dropping a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    /// First connection of the user came up, or their last one went away.
    pub changed: bool,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        user_id: UserId,
        outbox: mpsc::UnboundedSender<String>,
    ) -> (ConnectionId, PresenceChange) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner();
        let first = !inner
            .connections
            .values()
            .any(|connection| connection.user_id == user_id);
        inner.connections.insert(
            id,
            Connection {
                user_id,
                outbox,
                rooms: HashSet::new(),
            },
        );
        debug!(connection_id = id, user_id = user_id.0, "rooms: connection registered");
        (
            id,
            PresenceChange {
                user_id,
                changed: first,
            },
        )
    }

    pub fn unregister(&self, connection_id: ConnectionId) -> Option<PresenceChange> {
        let mut inner = self.inner();
        let connection = inner.connections.remove(&connection_id)?;
        for room in &connection.rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }
        let last = !inner
            .connections
            .values()
            .any(|other| other.user_id == connection.user_id);
        debug!(
            connection_id,
            user_id = connection.user_id.0,
            "rooms: connection dropped"
        );
        Some(PresenceChange {
            user_id: connection.user_id,
            changed: last,
        })
    }

    /// Returns false when the connection is unknown or already in the room.
    pub fn join(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> bool {
        let mut inner = self.inner();
        let Some(connection) = inner.connections.get_mut(&connection_id) else {
            return false;
        };
        if !connection.rooms.insert(conversation_id) {
            return false;
        }
        inner
            .rooms
            .entry(conversation_id)
            .or_default()
            .insert(connection_id);
        true
    }

    pub fn leave(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> bool {
        let mut inner = self.inner();
        let Some(connection) = inner.connections.get_mut(&connection_id) else {
            return false;
        };
        if !connection.rooms.remove(&conversation_id) {
            return false;
        }
        if let Some(members) = inner.rooms.get_mut(&conversation_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                inner.rooms.remove(&conversation_id);
            }
        }
        true
    }

    pub fn room_members(&self, conversation_id: ConversationId) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .inner()
            .rooms
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.inner()
            .connections
            .values()
            .any(|connection| connection.user_id == user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.inner()
            .connections
            .values()
            .map(|connection| connection.user_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Room members only.
    pub fn send_to_room(
        &self,
        conversation_id: ConversationId,
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let inner = self.inner();
        let targets: Vec<ConnectionId> = inner
            .rooms
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        deliver(&inner, targets, event, except)
    }

    /// Room members plus every connection of `participants`, each once.
    pub fn send_to_conversation(
        &self,
        conversation_id: ConversationId,
        participants: &[UserId],
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let inner = self.inner();
        let mut targets: BTreeSet<ConnectionId> = inner
            .rooms
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        targets.extend(
            inner
                .connections
                .iter()
                .filter(|(_, connection)| participants.contains(&connection.user_id))
                .map(|(id, _)| *id),
        );
        deliver(&inner, targets, event, except)
    }

    pub fn send_to(&self, connection_id: ConnectionId, event: &ServerEvent) -> bool {
        let inner = self.inner();
        deliver(&inner, [connection_id], event, None) == 1
    }

    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        let inner = self.inner();
        let targets: Vec<ConnectionId> = inner
            .connections
            .iter()
            .filter(|(_, connection)| connection.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        deliver(&inner, targets, event, None)
    }

    pub fn broadcast(&self, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        let inner = self.inner();
        let targets: Vec<ConnectionId> = inner.connections.keys().copied().collect();
        deliver(&inner, targets, event, except)
    }
}

fn deliver(
    inner: &Inner,
    targets: impl IntoIterator<Item = ConnectionId>,
    event: &ServerEvent,
    except: Option<ConnectionId>,
) -> usize {
    let text = match encode_frame(event, Some(storage::now())) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "rooms: failed to encode event");
            return 0;
        }
    };
    targets
        .into_iter()
        .filter(|id| Some(*id) != except)
        .filter_map(|id| inner.connections.get(&id))
        .filter(|connection| connection.outbox.send(text.clone()).is_ok())
        .count()
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
