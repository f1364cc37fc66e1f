use std::time::Duration;

use super::*;
use crate::test_support::{direct_conversation, text_message, FakeApi, FakeChannel};

fn view(channel: &Arc<FakeChannel>, api: &Arc<FakeApi>) -> ConversationListView {
    ConversationListView::new(channel.clone(), api.clone(), ListConfig::default())
}

fn order(conversations: &[Conversation]) -> Vec<i64> {
    conversations.iter().map(|c| c.conversation_id.0).collect()
}

#[test]
fn directory_orders_by_activity_and_bumps_on_new_message() {
    let mut directory = ConversationDirectory::new();
    assert_eq!(
        directory.merge_batch(vec![direct_conversation(1, 30), direct_conversation(2, 10)]),
        2
    );
    assert_eq!(order(directory.conversations()), vec![2, 1]);

    let message = text_message(999, ConversationId(1), shared::domain::UserId(11));
    assert!(directory.bump(&message));
    assert_eq!(order(directory.conversations()), vec![1, 2]);
    assert_eq!(
        directory
            .get(ConversationId(1))
            .and_then(|c| c.last_message.as_ref())
            .map(|preview| preview.message_id),
        Some(message.message_id)
    );

    let unknown = text_message(999, ConversationId(42), shared::domain::UserId(11));
    assert!(!directory.bump(&unknown));
}

#[test]
fn upsert_replaces_without_duplicating() {
    let mut directory = ConversationDirectory::new();
    assert!(directory.upsert(direct_conversation(1, 30)));
    let mut renamed = direct_conversation(1, 30);
    renamed.name = Some("renamed".into());
    assert!(!directory.upsert(renamed));
    assert_eq!(directory.len(), 1);
    assert_eq!(
        directory.get(ConversationId(1)).and_then(|c| c.name.clone()),
        Some("renamed".to_string())
    );
}

#[test]
fn stale_refetch_keeps_the_pushed_activity() {
    let mut directory = ConversationDirectory::new();
    directory.merge_batch(vec![direct_conversation(1, 30), direct_conversation(2, 10)]);
    let message = text_message(999, ConversationId(1), shared::domain::UserId(11));
    assert!(directory.bump(&message));

    let mut refetched = direct_conversation(1, 30);
    refetched.name = Some("renamed".into());
    assert!(!directory.upsert(refetched));

    assert_eq!(order(directory.conversations()), vec![1, 2]);
    let conversation = directory.get(ConversationId(1)).expect("listed");
    assert_eq!(conversation.name.as_deref(), Some("renamed"));
    assert_eq!(conversation.last_activity_at, message.created_at);
    assert_eq!(
        conversation.last_message.as_ref().map(|preview| preview.message_id),
        Some(message.message_id)
    );

    let mut newer = direct_conversation(1, 0);
    newer.last_message = None;
    directory.upsert(newer.clone());
    let conversation = directory.get(ConversationId(1)).expect("listed");
    assert_eq!(conversation.last_activity_at, newer.last_activity_at);
    assert!(conversation.last_message.is_none());
}

#[tokio::test]
async fn open_fetches_and_push_reorders() {
    let channel = FakeChannel::new(true);
    let api = FakeApi::new();
    api.seed_conversations(vec![direct_conversation(1, 30), direct_conversation(2, 10)]);
    let view = view(&channel, &api);

    view.open().await;
    assert_eq!(order(&view.conversations()), vec![2, 1]);

    channel.push(ServerEvent::NewMessage {
        message: text_message(999, ConversationId(1), shared::domain::UserId(11)),
    });
    assert_eq!(order(&view.conversations()), vec![1, 2]);

    view.close();
    assert_eq!(channel.listener_count(EventKind::NewMessage), 0);
}

#[tokio::test]
async fn push_for_unlisted_conversation_triggers_refetch() {
    let channel = FakeChannel::new(true);
    let api = FakeApi::new();
    let view = view(&channel, &api);
    view.open().await;
    assert!(view.conversations().is_empty());
    assert_eq!(api.conversation_fetches(), 1);

    api.seed_conversations(vec![direct_conversation(3, 1)]);
    channel.push(ServerEvent::NewMessage {
        message: text_message(999, ConversationId(3), shared::domain::UserId(13)),
    });

    tokio::time::timeout(Duration::from_secs(2), async {
        while view.conversations().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("refetch");
    assert_eq!(api.conversation_fetches(), 2);
}

#[tokio::test]
async fn malformed_list_is_treated_as_empty() {
    let channel = FakeChannel::new(true);
    let api = FakeApi::new();
    api.set_malformed(true);
    let view = view(&channel, &api);
    view.open().await;
    assert!(view.conversations().is_empty());
    assert!(view.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn list_polls_every_ten_seconds_while_disconnected() {
    let channel = FakeChannel::new(false);
    let api = FakeApi::new();
    let view = view(&channel, &api);
    view.open().await;
    assert_eq!(api.conversation_fetches(), 1);

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(api.conversation_fetches(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(api.conversation_fetches(), 2);

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(api.conversation_fetches(), 3);

    drop(view);
    tokio::time::sleep(Duration::from_millis(30_000)).await;
    assert_eq!(api.conversation_fetches(), 3);
}
