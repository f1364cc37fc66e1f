use super::*;

async fn ctx_with_pair() -> (ApiContext, UserId, UserId, ConversationId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ctx = ApiContext { storage };
    let (alice, _) = login(&ctx, "alice").await.expect("alice");
    let (bob, _) = login(&ctx, "bob").await.expect("bob");
    let conversation = create_conversation(
        &ctx,
        alice,
        CreateConversationRequest {
            kind: ConversationKind::Direct,
            participant_ids: vec![bob],
            name: None,
            avatar_url: None,
        },
    )
    .await
    .expect("conversation");
    (ctx, alice, bob, conversation.conversation_id)
}

fn text(content: &str) -> SendMessageRequest {
    SendMessageRequest {
        content: content.to_string(),
        media: None,
        reply_to: None,
        client_nonce: None,
    }
}

#[tokio::test]
async fn login_validates_and_is_idempotent() {
    let ctx = ApiContext {
        storage: Storage::new("sqlite::memory:").await.expect("db"),
    };
    let (first, name) = login(&ctx, "  carol ").await.expect("login");
    assert_eq!(name, "carol");
    let (again, _) = login(&ctx, "carol").await.expect("login again");
    assert_eq!(first, again);

    assert_eq!(
        login(&ctx, "").await.expect_err("empty").code,
        ErrorCode::Validation
    );
    assert_eq!(
        login(&ctx, "no spaces please").await.expect_err("spaces").code,
        ErrorCode::Validation
    );
}

#[tokio::test]
async fn direct_conversation_is_find_or_create() {
    let (ctx, alice, bob, conversation) = ctx_with_pair().await;
    let again = create_conversation(
        &ctx,
        bob,
        CreateConversationRequest {
            kind: ConversationKind::Direct,
            participant_ids: vec![alice, bob],
            name: None,
            avatar_url: None,
        },
    )
    .await
    .expect("again");
    assert_eq!(again.conversation_id, conversation);

    let err = create_conversation(
        &ctx,
        alice,
        CreateConversationRequest {
            kind: ConversationKind::Direct,
            participant_ids: vec![UserId(999)],
            name: None,
            avatar_url: None,
        },
    )
    .await
    .expect_err("unknown user");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn group_needs_another_participant() {
    let (ctx, alice, bob, _) = ctx_with_pair().await;
    let err = create_conversation(
        &ctx,
        alice,
        CreateConversationRequest {
            kind: ConversationKind::Group,
            participant_ids: vec![alice],
            name: Some("solo".into()),
            avatar_url: None,
        },
    )
    .await
    .expect_err("alone");
    assert_eq!(err.code, ErrorCode::Validation);

    let group = create_conversation(
        &ctx,
        alice,
        CreateConversationRequest {
            kind: ConversationKind::Group,
            participant_ids: vec![bob],
            name: Some("  crew ".into()),
            avatar_url: None,
        },
    )
    .await
    .expect("group");
    assert_eq!(group.name.as_deref(), Some("crew"));
    assert_eq!(group.participant_ids, vec![alice, bob]);
}

#[tokio::test]
async fn outsiders_cannot_read_or_write() {
    let (ctx, _alice, _bob, conversation) = ctx_with_pair().await;
    let (eve, _) = login(&ctx, "eve").await.expect("eve");

    let err = list_messages(&ctx, eve, conversation, &PageQuery::default())
        .await
        .expect_err("outsider");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = send_message(&ctx, eve, ConversationId(404), text("hi"))
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn send_trims_and_rejects_empty() {
    let (ctx, alice, _bob, conversation) = ctx_with_pair().await;
    let message = send_message(&ctx, alice, conversation, text("  hello  "))
        .await
        .expect("send");
    assert_eq!(message.content, "hello");

    let err = send_message(&ctx, alice, conversation, text("   "))
        .await
        .expect_err("empty");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn only_the_sender_edits_or_deletes_for_everyone() {
    let (ctx, alice, bob, conversation) = ctx_with_pair().await;
    let message = send_message(&ctx, alice, conversation, text("draft"))
        .await
        .expect("send");

    assert_eq!(
        edit_message(&ctx, bob, message.message_id, "hijack")
            .await
            .expect_err("not sender")
            .code,
        ErrorCode::Forbidden
    );
    let edited = edit_message(&ctx, alice, message.message_id, "final")
        .await
        .expect("edit");
    assert!(edited.edited);

    assert_eq!(
        delete_message(&ctx, bob, message.message_id, DeleteScope::Everyone)
            .await
            .expect_err("not sender")
            .code,
        ErrorCode::Forbidden
    );

    delete_message(&ctx, bob, message.message_id, DeleteScope::Me)
        .await
        .expect("hide for bob");
    let bob_view = list_messages(&ctx, bob, conversation, &PageQuery::default())
        .await
        .expect("bob history");
    assert!(bob_view.items.is_empty());
    let alice_view = list_messages(&ctx, alice, conversation, &PageQuery::default())
        .await
        .expect("alice history");
    assert_eq!(alice_view.items.len(), 1);

    delete_message(&ctx, alice, message.message_id, DeleteScope::Everyone)
        .await
        .expect("tombstone");
    let stored = load_message(&ctx, message.message_id).await.expect("stored");
    assert!(stored.deleted);
    assert!(edit_message(&ctx, alice, message.message_id, "again")
        .await
        .is_err());
}

#[tokio::test]
async fn second_reaction_replaces_the_first() {
    let (ctx, alice, bob, conversation) = ctx_with_pair().await;
    let message = send_message(&ctx, alice, conversation, text("react to me"))
        .await
        .expect("send");

    add_reaction(&ctx, bob, message.message_id, "👍")
        .await
        .expect("first");
    let (updated, reaction) = add_reaction(&ctx, bob, message.message_id, "❤️")
        .await
        .expect("second");
    assert_eq!(reaction.emoji, "❤️");
    assert_eq!(updated.reactions.len(), 1);
    assert_eq!(updated.reactions[0].emoji, "❤️");

    let (cleared, removed) = remove_reaction(&ctx, bob, message.message_id)
        .await
        .expect("remove");
    assert!(removed);
    assert!(cleared.reactions.is_empty());
    let (_, removed_again) = remove_reaction(&ctx, bob, message.message_id)
        .await
        .expect("remove again");
    assert!(!removed_again);
}

#[tokio::test]
async fn mark_read_defaults_to_latest_message() {
    let (ctx, alice, bob, conversation) = ctx_with_pair().await;
    send_message(&ctx, alice, conversation, text("one"))
        .await
        .expect("one");
    let latest = send_message(&ctx, alice, conversation, text("two"))
        .await
        .expect("two");

    let receipt = mark_read(&ctx, bob, conversation, None)
        .await
        .expect("mark read");
    assert_eq!(receipt.reader_id, bob);
    assert_eq!(receipt.up_to, Some(latest.message_id));
}

#[tokio::test]
async fn pages_are_clamped() {
    let (ctx, alice, _bob, conversation) = ctx_with_pair().await;
    for n in 0..3 {
        send_message(&ctx, alice, conversation, text(&format!("m{n}")))
            .await
            .expect("send");
    }
    let page = list_messages(
        &ctx,
        alice,
        conversation,
        &PageQuery { page: 0, limit: 2 },
    )
    .await
    .expect("page");
    assert_eq!(page.items.len(), 2);
    assert!(page.has_next);
    assert_eq!(page.items[0].content, "m2");
}
