use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::broadcast;

use super::*;
use crate::credentials::TokenStore;

const TOKEN: &str = "test-token";

#[derive(Clone)]
struct TestServer {
    pushes: broadcast::Sender<String>,
    received: mpsc::UnboundedSender<(usize, String)>,
    connections: Arc<AtomicUsize>,
    drop_first_connection: bool,
}

async fn ws_handler(
    State(server): State<TestServer>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let expected = format!("Bearer {TOKEN}");
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str());
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, server))
}

async fn serve_socket(mut socket: WebSocket, server: TestServer) {
    let index = server.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let mut pushes = server.pushes.subscribe();
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = server.received.send((index, text));
                    if server.drop_first_connection && index == 1 {
                        return;
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            },
            push = pushes.recv() => match push {
                Ok(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            },
        }
    }
}

struct Harness {
    server_url: String,
    pushes: broadcast::Sender<String>,
    received: mpsc::UnboundedReceiver<(usize, String)>,
}

async fn spawn_server(drop_first_connection: bool) -> Harness {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (pushes, _) = broadcast::channel(16);
    let (received_tx, received) = mpsc::unbounded_channel();
    let state = TestServer {
        pushes: pushes.clone(),
        received: received_tx,
        connections: Arc::new(AtomicUsize::new(0)),
        drop_first_connection,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    Harness {
        server_url: format!("http://{addr}"),
        pushes,
        received,
    }
}

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_attempts,
        connect_timeout: Duration::from_secs(2),
    }
}

async fn wait_for_state(channel: &TransportChannel, expected: ConnectionState) {
    let mut states = channel.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == expected),
    )
    .await
    .expect("timed out waiting for state")
    .expect("state channel closed");
}

async fn next_frame(received: &mut mpsc::UnboundedReceiver<(usize, String)>) -> (usize, OutboundEvent) {
    let (index, text) = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("server gone");
    let frame = decode_frame::<OutboundEvent>(&text).expect("client frame");
    (index, frame.event)
}

#[test]
fn socket_url_maps_http_schemes() {
    assert_eq!(
        socket_url("http://127.0.0.1:8443").expect("http").as_str(),
        "ws://127.0.0.1:8443/ws"
    );
    assert_eq!(
        socket_url("https://vibe.example/api/").expect("https").as_str(),
        "wss://vibe.example/api/ws"
    );
    assert!(socket_url("ftp://vibe.example").is_err());
}

#[test]
fn backoff_is_linear_and_capped() {
    let policy = ReconnectPolicy::default();
    assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
    assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(10));
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.connect_timeout, Duration::from_secs(20));
}

#[tokio::test]
async fn emit_while_disconnected_is_dropped_but_rooms_are_remembered() {
    let channel = TransportChannel::new(
        "http://127.0.0.1:9",
        fast_policy(1),
        Arc::new(TokenStore::new(Some(TOKEN.into()))),
    )
    .expect("channel");

    channel.join_conversation(ConversationId(7));
    channel.typing_start(ConversationId(7));
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
    assert_eq!(channel.joined_rooms(), vec![ConversationId(7)]);

    channel.leave_conversation(ConversationId(7));
    assert!(channel.joined_rooms().is_empty());
}

#[tokio::test]
async fn connect_without_credential_is_a_no_op() {
    let harness = spawn_server(false).await;
    let channel = TransportChannel::new(
        &harness.server_url,
        fast_policy(3),
        Arc::new(TokenStore::new(None)),
    )
    .expect("channel");

    channel.connect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connected_channel_sends_frames_and_dispatches_pushes() {
    let mut harness = spawn_server(false).await;
    let channel = TransportChannel::new(
        &harness.server_url,
        fast_policy(3),
        Arc::new(TokenStore::new(Some(TOKEN.into()))),
    )
    .expect("channel");

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _subscription = channel.subscribe(
        EventKind::UserOnline,
        Arc::new(move |event: &ChannelEvent| {
            let _ = seen_tx.send(event.clone());
        }),
    );

    channel.connect();
    wait_for_state(&channel, ConnectionState::Connected).await;
    assert!(channel.is_connected());

    channel.join_conversation(ConversationId(3));
    let (_, frame) = next_frame(&mut harness.received).await;
    assert_eq!(
        frame,
        OutboundEvent::JoinConversation {
            conversation_id: ConversationId(3)
        }
    );

    harness
        .pushes
        .send("not json at all".to_string())
        .expect("push garbage");
    let online = encode_frame(&ServerEvent::UserOnline { user_id: UserId(9) }, None)
        .expect("encode");
    harness.pushes.send(online).expect("push");

    let event = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("timed out")
        .expect("listener dropped");
    assert_eq!(event.kind, EventKind::UserOnline);
    assert_eq!(event.event, ServerEvent::UserOnline { user_id: UserId(9) });
    assert!(channel.is_connected());

    channel.disconnect();
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn rejected_handshakes_exhaust_retries_until_manual_retry() {
    let harness = spawn_server(false).await;
    let credentials = Arc::new(TokenStore::new(Some("wrong".into())));
    let channel = TransportChannel::new(&harness.server_url, fast_policy(3), credentials.clone())
        .expect("channel");

    channel.connect();
    wait_for_state(&channel, ConnectionState::Unavailable).await;
    assert!(!channel.is_server_available());

    channel.connect();
    assert_eq!(channel.connection_state(), ConnectionState::Unavailable);

    credentials.set(TOKEN);
    channel.retry_connection();
    wait_for_state(&channel, ConnectionState::Connected).await;
    assert!(channel.is_server_available());
}

#[tokio::test]
async fn dropped_handshakes_stop_after_the_attempt_cap() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = accepts.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    let policy = fast_policy(ReconnectPolicy::default().max_attempts);
    assert_eq!(policy.max_attempts, 5);
    let credentials = Arc::new(TokenStore::new(Some(TOKEN.into())));
    let channel =
        TransportChannel::new(&format!("http://{addr}"), policy, credentials).expect("channel");

    channel.connect();
    wait_for_state(&channel, ConnectionState::Unavailable).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 5);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 5);
    assert!(!channel.is_server_available());
    assert_eq!(channel.connection_state(), ConnectionState::Unavailable);
}

#[tokio::test]
async fn reconnect_replays_joined_rooms() {
    let mut harness = spawn_server(true).await;
    let channel = TransportChannel::new(
        &harness.server_url,
        fast_policy(5),
        Arc::new(TokenStore::new(Some(TOKEN.into()))),
    )
    .expect("channel");

    channel.connect();
    wait_for_state(&channel, ConnectionState::Connected).await;
    channel.join_conversation(ConversationId(5));

    let (first_connection, frame) = next_frame(&mut harness.received).await;
    assert_eq!(first_connection, 1);
    assert_eq!(
        frame,
        OutboundEvent::JoinConversation {
            conversation_id: ConversationId(5)
        }
    );

    let (second_connection, frame) = next_frame(&mut harness.received).await;
    assert_eq!(second_connection, 2);
    assert_eq!(
        frame,
        OutboundEvent::JoinConversation {
            conversation_id: ConversationId(5)
        }
    );
}
