use shared::protocol::{decode_frame, ServerEvent};

use super::*;

fn connect(
    registry: &RoomRegistry,
    user: i64,
) -> (ConnectionId, bool, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (id, presence) = registry.register(UserId(user), tx);
    (id, presence.changed, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(text) = rx.try_recv() {
        events.push(decode_frame::<ServerEvent>(&text).expect("frame").event);
    }
    events
}

fn typing(conversation: i64, user: i64) -> ServerEvent {
    ServerEvent::UserTyping {
        conversation_id: ConversationId(conversation),
        user_id: UserId(user),
        username: format!("user{user}"),
    }
}

#[test]
fn presence_changes_only_on_first_and_last_connection() {
    let registry = RoomRegistry::new();
    let (a, first, _rx_a) = connect(&registry, 1);
    let (b, second, _rx_b) = connect(&registry, 1);
    assert!(first);
    assert!(!second);
    assert!(registry.is_online(UserId(1)));

    assert!(!registry.unregister(a).expect("known").changed);
    assert!(registry.unregister(b).expect("known").changed);
    assert!(registry.unregister(b).is_none());
    assert!(!registry.is_online(UserId(1)));
}

#[test]
fn room_fanout_skips_sender_and_non_members() {
    let registry = RoomRegistry::new();
    let (a, _, mut rx_a) = connect(&registry, 1);
    let (b, _, mut rx_b) = connect(&registry, 2);
    let (_c, _, mut rx_c) = connect(&registry, 3);

    assert!(registry.join(a, ConversationId(5)));
    assert!(!registry.join(a, ConversationId(5)));
    assert!(registry.join(b, ConversationId(5)));
    assert_eq!(registry.room_members(ConversationId(5)), vec![a, b]);

    let delivered = registry.send_to_room(ConversationId(5), &typing(5, 1), Some(a));
    assert_eq!(delivered, 1);
    assert!(drain(&mut rx_a).is_empty());
    assert_eq!(drain(&mut rx_b), vec![typing(5, 1)]);
    assert!(drain(&mut rx_c).is_empty());

    assert!(registry.leave(b, ConversationId(5)));
    assert_eq!(registry.send_to_room(ConversationId(5), &typing(5, 1), Some(a)), 0);
}

#[test]
fn conversation_fanout_reaches_participants_once() {
    let registry = RoomRegistry::new();
    let (a, _, mut rx_a) = connect(&registry, 1);
    let (_b, _, mut rx_b) = connect(&registry, 2);
    let (_c, _, mut rx_c) = connect(&registry, 3);
    registry.join(a, ConversationId(9));

    let event = ServerEvent::UserOnline { user_id: UserId(4) };
    let delivered = registry.send_to_conversation(
        ConversationId(9),
        &[UserId(1), UserId(2)],
        &event,
        None,
    );
    assert_eq!(delivered, 2);
    assert_eq!(drain(&mut rx_a).len(), 1);
    assert_eq!(drain(&mut rx_b).len(), 1);
    assert!(drain(&mut rx_c).is_empty());
}

#[test]
fn unregister_clears_room_membership() {
    let registry = RoomRegistry::new();
    let (a, _, _rx) = connect(&registry, 1);
    registry.join(a, ConversationId(2));
    registry.unregister(a);
    assert!(registry.room_members(ConversationId(2)).is_empty());
    assert!(registry.online_users().is_empty());
}

#[test]
fn direct_send_reaches_one_connection() {
    let registry = RoomRegistry::new();
    let (a, _, mut rx_a) = connect(&registry, 1);
    let (_b, _, mut rx_b) = connect(&registry, 1);

    assert!(registry.send_to(a, &typing(1, 2)));
    assert_eq!(drain(&mut rx_a), vec![typing(1, 2)]);
    assert!(drain(&mut rx_b).is_empty());
    assert!(!registry.send_to(99, &typing(1, 2)));
}
