use super::*;

async fn advance_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn indicator_expires_after_window() {
    let tracker = TypingTracker::new(Duration::from_secs(3));
    tracker.start(UserId(2), "bo");
    assert!(tracker.is_typing(UserId(2)));

    advance_ms(2_900).await;
    assert!(tracker.is_typing(UserId(2)));

    advance_ms(200).await;
    assert!(!tracker.is_typing(UserId(2)));
}

#[tokio::test(start_paused = true)]
async fn repeated_start_renews_instead_of_stacking() {
    let tracker = TypingTracker::new(Duration::from_secs(3));
    tracker.start(UserId(2), "bo");
    advance_ms(2_000).await;
    tracker.start(UserId(2), "bo");

    // The first timer would have fired at 3s.
    advance_ms(1_500).await;
    assert!(tracker.is_typing(UserId(2)));

    advance_ms(1_600).await;
    assert!(!tracker.is_typing(UserId(2)));
}

#[tokio::test(start_paused = true)]
async fn stop_removes_immediately_and_notifies() {
    let seen: Arc<Mutex<Vec<Vec<TypingUser>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let tracker = TypingTracker::with_notifier(
        Duration::from_secs(3),
        Arc::new(move |users: Vec<TypingUser>| lock(&sink).push(users)),
    );

    tracker.start(UserId(3), "cy");
    tracker.start(UserId(2), "ab");
    assert_eq!(
        tracker
            .typing_users()
            .iter()
            .map(|u| u.username.as_str())
            .collect::<Vec<_>>(),
        vec!["ab", "cy"]
    );

    assert!(tracker.stop(UserId(3)));
    assert!(!tracker.stop(UserId(3)));

    advance_ms(3_100).await;
    let notifications = lock(&seen).clone();
    assert_eq!(notifications.len(), 4);
    assert!(notifications.last().expect("expiry").is_empty());
}

#[tokio::test(start_paused = true)]
async fn clear_drops_everyone() {
    let tracker = TypingTracker::new(Duration::from_secs(3));
    tracker.start(UserId(2), "bo");
    tracker.start(UserId(4), "di");
    tracker.clear();
    assert!(tracker.typing_users().is_empty());
}
