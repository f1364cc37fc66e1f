use std::sync::atomic::AtomicUsize;

use shared::{
    domain::{ConversationId, UserId},
    error::ApiError,
};

use super::*;

fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
    let counter = Arc::clone(counter);
    Arc::new(move |_event: &ChannelEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn kinds_follow_server_events() {
    assert_eq!(
        EventKind::of(&ServerEvent::UserStoppedTyping {
            conversation_id: ConversationId(1),
            user_id: UserId(2),
        }),
        EventKind::TypingStop
    );
    assert_eq!(
        EventKind::of(&ServerEvent::Error(ApiError::forbidden("no"))),
        EventKind::Error
    );
    assert!(!EventKind::CONVERSATION.contains(&EventKind::UserOnline));
}

#[test]
fn dispatch_reaches_only_matching_kind() {
    let registry = ListenerRegistry::new();
    let online = Arc::new(AtomicUsize::new(0));
    let offline = Arc::new(AtomicUsize::new(0));
    let _a = registry.subscribe(EventKind::UserOnline, counting_listener(&online));
    let _b = registry.subscribe(EventKind::UserOffline, counting_listener(&offline));

    let delivered = registry.dispatch(&ChannelEvent::new(ServerEvent::UserOnline {
        user_id: UserId(4),
    }));

    assert_eq!(delivered, 1);
    assert_eq!(online.load(Ordering::SeqCst), 1);
    assert_eq!(offline.load(Ordering::SeqCst), 0);
}

#[test]
fn unsubscribe_is_idempotent_and_drop_unsubscribes() {
    let registry = ListenerRegistry::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let first = registry.subscribe(EventKind::UserOnline, counting_listener(&hits));
    let second = registry.subscribe(EventKind::UserOnline, counting_listener(&hits));
    assert_eq!(registry.listener_count(EventKind::UserOnline), 2);

    first.unsubscribe();
    first.unsubscribe();
    assert!(!first.is_active());
    assert_eq!(registry.listener_count(EventKind::UserOnline), 1);

    drop(second);
    assert_eq!(registry.listener_count(EventKind::UserOnline), 0);

    registry.dispatch(&ChannelEvent::new(ServerEvent::UserOnline {
        user_id: UserId(1),
    }));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn listener_may_unsubscribe_itself_during_dispatch() {
    let registry = ListenerRegistry::new();
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let hits = Arc::new(AtomicUsize::new(0));

    let listener_slot = Arc::clone(&slot);
    let listener_hits = Arc::clone(&hits);
    let subscription = registry.subscribe(
        EventKind::UserOffline,
        Arc::new(move |_event: &ChannelEvent| {
            listener_hits.fetch_add(1, Ordering::SeqCst);
            if let Some(subscription) = lock(&listener_slot).take() {
                subscription.unsubscribe();
            }
        }),
    );
    *lock(&slot) = Some(subscription);

    let offline = ChannelEvent::new(ServerEvent::UserOffline { user_id: UserId(3) });
    registry.dispatch(&offline);
    registry.dispatch(&offline);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn subscription_outliving_registry_is_harmless() {
    let registry = ListenerRegistry::new();
    let subscription = registry.subscribe(
        EventKind::Notification,
        Arc::new(|_event: &ChannelEvent| {}),
    );
    drop(registry);
    subscription.unsubscribe();
    assert!(!subscription.is_active());
}
