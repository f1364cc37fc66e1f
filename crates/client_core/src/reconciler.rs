//! Ordered, deduplicated message state for one open conversation.
//!
//! Three sources feed it: paginated fetches, real-time pushes and locally
//! originated sends. Confirmed messages are keyed by server id; unconfirmed
//! sends are keyed by their client nonce until the server echoes it back.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SubsecRound, Utc};
use shared::{
    domain::{ClientNonce, ConversationId, MediaRef, MessageId, UserId},
    protocol::{Message, Page, Reaction, ReadReceipt, ServerEvent},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Sent,
    Pending,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub message: Message,
    pub delivery: DeliveryState,
    /// Set for entries created locally; survives confirmation.
    pub nonce: Option<ClientNonce>,
}

impl MessageEntry {
    pub fn is_confirmed(&self) -> bool {
        self.delivery == DeliveryState::Sent
    }

    /// Unconfirmed entries sort after confirmed ones sharing a timestamp.
    fn order_key(&self) -> (DateTime<Utc>, bool, MessageId) {
        (
            self.message.created_at,
            !self.is_confirmed(),
            self.message.message_id,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Replaced the local pending entry carrying the same nonce.
    Confirmed,
    Duplicate,
    /// Wrong conversation or hidden from this user.
    Ignored,
}

#[derive(Debug)]
pub struct MessageReconciler {
    conversation_id: ConversationId,
    entries: Vec<MessageEntry>,
    ids: HashSet<MessageId>,
    hidden: HashSet<MessageId>,
    receipts: HashMap<UserId, ReadReceipt>,
    next_page: u32,
    has_more: bool,
    page_in_flight: bool,
}

impl MessageReconciler {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            ids: HashSet::new(),
            hidden: HashSet::new(),
            receipts: HashMap::new(),
            next_page: 1,
            has_more: true,
            page_in_flight: false,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.ids.contains(&message_id)
    }

    pub fn get(&self, message_id: MessageId) -> Option<&MessageEntry> {
        self.position_of(message_id).map(|index| &self.entries[index])
    }

    pub fn last_confirmed_id(&self) -> Option<MessageId> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.is_confirmed())
            .map(|entry| entry.message.message_id)
    }

    pub fn insert(&mut self, message: Message) -> InsertOutcome {
        if message.conversation_id != self.conversation_id {
            warn!(
                expected = self.conversation_id.0,
                actual = message.conversation_id.0,
                "reconciler: message for another conversation ignored"
            );
            return InsertOutcome::Ignored;
        }
        if self.hidden.contains(&message.message_id) {
            return InsertOutcome::Ignored;
        }
        if self.ids.contains(&message.message_id) {
            return InsertOutcome::Duplicate;
        }

        let pending = message.client_nonce.and_then(|nonce| self.pending_index(nonce));
        let outcome = match pending {
            Some(index) => {
                self.entries.remove(index);
                InsertOutcome::Confirmed
            }
            None => InsertOutcome::Inserted,
        };
        let nonce = message.client_nonce;
        self.ids.insert(message.message_id);
        self.place(MessageEntry {
            message,
            delivery: DeliveryState::Sent,
            nonce,
        });
        outcome
    }

    /// Merges a batch; returns how many entries were added or confirmed.
    pub fn merge_batch(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        messages
            .into_iter()
            .map(|message| self.insert(message))
            .filter(|outcome| matches!(outcome, InsertOutcome::Inserted | InsertOutcome::Confirmed))
            .count()
    }

    /// Returns the page number to request next, marking a fetch in flight.
    pub fn begin_page_fetch(&mut self) -> Option<u32> {
        if self.page_in_flight || !self.has_more {
            return None;
        }
        self.page_in_flight = true;
        Some(self.next_page)
    }

    pub fn complete_page_fetch(&mut self, page_number: u32, page: Page<Message>) -> usize {
        self.page_in_flight = false;
        if page_number != self.next_page {
            debug!(
                page_number,
                expected = self.next_page,
                "reconciler: stale page merged without moving the cursor"
            );
            return self.merge_batch(page.items);
        }
        self.next_page = page_number + 1;
        self.has_more = page.has_next;
        self.prepend_page(page)
    }

    pub fn abort_page_fetch(&mut self) {
        self.page_in_flight = false;
    }

    /// Points the cursor back at the newest page. Entries and messages
    /// deleted for this user are kept.
    pub fn rewind_pages(&mut self) {
        self.next_page = 1;
        self.has_more = true;
        self.page_in_flight = false;
    }

    /// Older messages are merged by sort order, so a page lands before the
    /// entries already shown.
    pub fn prepend_page(&mut self, page: Page<Message>) -> usize {
        self.merge_batch(page.items)
    }

    pub fn should_load_older(&self, at_top: bool) -> bool {
        at_top && self.has_more && !self.page_in_flight
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn page_in_flight(&self) -> bool {
        self.page_in_flight
    }

    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    pub fn insert_pending(
        &mut self,
        sender_id: UserId,
        sender_username: Option<String>,
        content: String,
        media: Option<MediaRef>,
        reply_to: Option<MessageId>,
    ) -> ClientNonce {
        let nonce = ClientNonce::new();
        let message = Message {
            message_id: MessageId(0),
            conversation_id: self.conversation_id,
            sender_id,
            sender_username,
            content,
            media,
            reply_to,
            reactions: Vec::new(),
            edited: false,
            deleted: false,
            client_nonce: Some(nonce),
            created_at: Utc::now().trunc_subsecs(3),
            edited_at: None,
        };
        self.place(MessageEntry {
            message,
            delivery: DeliveryState::Pending,
            nonce: Some(nonce),
        });
        nonce
    }

    pub fn confirm_pending(&mut self, nonce: ClientNonce, mut message: Message) -> InsertOutcome {
        message.client_nonce = Some(nonce);
        let outcome = self.insert(message);
        if matches!(outcome, InsertOutcome::Duplicate | InsertOutcome::Ignored) {
            // Already delivered by a push that did not carry the nonce.
            self.discard_pending(nonce);
        }
        outcome
    }

    pub fn fail_pending(&mut self, nonce: ClientNonce, reason: impl Into<String>) -> bool {
        let Some(index) = self.pending_index(nonce) else {
            return false;
        };
        self.entries[index].delivery = DeliveryState::Failed {
            reason: reason.into(),
        };
        true
    }

    /// Moves a failed entry back to pending and returns its message for resending.
    pub fn retry_pending(&mut self, nonce: ClientNonce) -> Option<Message> {
        let index = self.pending_index(nonce)?;
        let entry = &mut self.entries[index];
        if !matches!(entry.delivery, DeliveryState::Failed { .. }) {
            return None;
        }
        entry.delivery = DeliveryState::Pending;
        Some(entry.message.clone())
    }

    pub fn discard_pending(&mut self, nonce: ClientNonce) -> bool {
        match self.pending_index(nonce) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Applies an edit in place; sequence order is untouched.
    pub fn apply_edit(&mut self, edited: &Message) -> bool {
        let Some(index) = self.position_of(edited.message_id) else {
            return false;
        };
        let current = &mut self.entries[index].message;
        current.content = edited.content.clone();
        current.media = edited.media.clone();
        current.edited = true;
        current.edited_at = edited.edited_at.or(current.edited_at);
        true
    }

    pub fn apply_delete(&mut self, message_id: MessageId) -> bool {
        let Some(index) = self.position_of(message_id) else {
            return false;
        };
        self.entries[index].message.tombstone();
        true
    }

    /// Removes the message from this view and keeps it out of later merges.
    pub fn delete_for_me(&mut self, message_id: MessageId) -> bool {
        self.hidden.insert(message_id);
        let Some(index) = self.position_of(message_id) else {
            return false;
        };
        self.entries.remove(index);
        self.ids.remove(&message_id);
        true
    }

    /// At most one reaction per user: a new emoji overwrites the old one.
    pub fn apply_reaction_added(&mut self, message_id: MessageId, reaction: Reaction) -> bool {
        let Some(index) = self.position_of(message_id) else {
            return false;
        };
        self.entries[index].message.upsert_reaction(reaction);
        true
    }

    pub fn apply_reaction_removed(&mut self, message_id: MessageId, user_id: UserId) -> bool {
        let Some(index) = self.position_of(message_id) else {
            return false;
        };
        self.entries[index].message.remove_reaction(user_id)
    }

    /// Replaces the reaction set with the server's authoritative copy.
    pub fn replace_reactions(&mut self, message_id: MessageId, reactions: Vec<Reaction>) -> bool {
        let Some(index) = self.position_of(message_id) else {
            return false;
        };
        self.entries[index].message.reactions = reactions;
        true
    }

    /// Keeps the furthest receipt per reader. Returns true when it advanced.
    pub fn apply_read_receipt(&mut self, receipt: ReadReceipt) -> bool {
        if receipt.conversation_id != self.conversation_id {
            return false;
        }
        match self.receipts.get(&receipt.reader_id) {
            Some(existing) if existing.up_to >= receipt.up_to => false,
            _ => {
                self.receipts.insert(receipt.reader_id, receipt);
                true
            }
        }
    }

    pub fn read_receipts(&self) -> impl Iterator<Item = &ReadReceipt> {
        self.receipts.values()
    }

    pub fn is_read_by(&self, message_id: MessageId, reader_id: UserId) -> bool {
        self.receipts
            .get(&reader_id)
            .and_then(|receipt| receipt.up_to)
            .is_some_and(|up_to| up_to >= message_id)
    }

    /// Routes a server event scoped to this conversation. Returns true when
    /// the visible message state changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        if event.conversation_id() != Some(self.conversation_id) {
            return false;
        }
        match event {
            ServerEvent::NewMessage { message } => matches!(
                self.insert(message.clone()),
                InsertOutcome::Inserted | InsertOutcome::Confirmed
            ),
            ServerEvent::MessageEdited { message } => self.apply_edit(message),
            ServerEvent::MessageDeleted { message_id, .. } => self.apply_delete(*message_id),
            ServerEvent::MessageReactionAdded {
                message_id,
                reaction,
                ..
            } => self.apply_reaction_added(*message_id, reaction.clone()),
            ServerEvent::MessageReactionRemoved {
                message_id,
                user_id,
                ..
            } => self.apply_reaction_removed(*message_id, *user_id),
            ServerEvent::MessagesRead { receipt } => self.apply_read_receipt(receipt.clone()),
            _ => false,
        }
    }

    fn place(&mut self, entry: MessageEntry) {
        let key = entry.order_key();
        let index = self
            .entries
            .partition_point(|existing| existing.order_key() <= key);
        self.entries.insert(index, entry);
    }

    fn position_of(&self, message_id: MessageId) -> Option<usize> {
        if !self.ids.contains(&message_id) {
            return None;
        }
        self.entries
            .iter()
            .position(|entry| entry.is_confirmed() && entry.message.message_id == message_id)
    }

    fn pending_index(&self, nonce: ClientNonce) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.is_confirmed() && entry.nonce == Some(nonce))
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
