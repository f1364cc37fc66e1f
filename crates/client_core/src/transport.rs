//! Persistent bidirectional socket shared by every conversation surface.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::{CommentId, ConversationId, MessageId, PostId, ReelId, StoryId, UserId},
    protocol::{decode_frame, encode_frame, OutboundEvent, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    credentials::CredentialProvider,
    error::{ClientError, ClientResult},
    events::{ChannelEvent, EventKind, Listener, ListenerRegistry, Subscription},
    lock,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted; only `retry_connection` leaves this state.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            connect_timeout: Duration::from_secs(20),
        }
    }
}

impl ReconnectPolicy {
    /// Linear backoff: `min(base × attempt, max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

/// What a conversation surface needs from the real-time channel.
pub trait RealtimeChannel: Send + Sync {
    fn is_connected(&self) -> bool;
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;
    /// Fire-and-forget. Dropped without error while disconnected.
    fn emit(&self, event: OutboundEvent);
    fn subscribe(&self, kind: EventKind, listener: Listener) -> Subscription;

    fn join_conversation(&self, conversation_id: ConversationId) {
        self.emit(OutboundEvent::JoinConversation { conversation_id });
    }

    fn leave_conversation(&self, conversation_id: ConversationId) {
        self.emit(OutboundEvent::LeaveConversation { conversation_id });
    }

    fn send_message(&self, conversation_id: ConversationId, content: &str, message_id: MessageId) {
        self.emit(OutboundEvent::SendMessage {
            conversation_id,
            content: content.to_string(),
            message_id,
        });
    }

    fn typing_start(&self, conversation_id: ConversationId) {
        self.emit(OutboundEvent::TypingStart { conversation_id });
    }

    fn typing_stop(&self, conversation_id: ConversationId) {
        self.emit(OutboundEvent::TypingStop { conversation_id });
    }

    fn mark_message_read(&self, conversation_id: ConversationId, message_id: Option<MessageId>) {
        self.emit(OutboundEvent::MarkMessageRead {
            conversation_id,
            message_id,
        });
    }

    fn notify_like_post(&self, post_id: PostId, post_owner_id: UserId) {
        self.emit(OutboundEvent::LikePost {
            post_id,
            post_owner_id,
        });
    }

    fn notify_like_reel(&self, reel_id: ReelId, reel_owner_id: UserId) {
        self.emit(OutboundEvent::LikeReel {
            reel_id,
            reel_owner_id,
        });
    }

    fn notify_comment(&self, post_id: PostId, post_owner_id: UserId, comment_id: CommentId) {
        self.emit(OutboundEvent::NewComment {
            post_id,
            post_owner_id,
            comment_id,
        });
    }

    fn notify_follow(&self, followed_user_id: UserId) {
        self.emit(OutboundEvent::NewFollow { followed_user_id });
    }

    fn notify_story_view(&self, story_id: StoryId, story_owner_id: UserId) {
        self.emit(OutboundEvent::ViewStory {
            story_id,
            story_owner_id,
        });
    }
}

pub struct TransportChannel {
    ws_url: Url,
    policy: ReconnectPolicy,
    credentials: Arc<dyn CredentialProvider>,
    registry: Arc<ListenerRegistry>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<TransportState>,
}

#[derive(Default)]
struct TransportState {
    attempts: u32,
    server_unavailable: bool,
    outbound: Option<mpsc::UnboundedSender<OutboundEvent>>,
    task: Option<JoinHandle<()>>,
    /// Rooms joined through this channel; replayed after every reconnect.
    rooms: BTreeSet<ConversationId>,
}

enum PumpExit {
    Dropped,
    Shutdown,
}

impl TransportChannel {
    pub fn new(
        server_url: &str,
        policy: ReconnectPolicy,
        credentials: Arc<dyn CredentialProvider>,
    ) -> ClientResult<Arc<Self>> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Arc::new(Self {
            ws_url: socket_url(server_url)?,
            policy,
            credentials,
            registry: ListenerRegistry::new(),
            state,
            inner: Mutex::new(TransportState::default()),
        }))
    }

    pub fn ws_url(&self) -> &Url {
        &self.ws_url
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_server_available(&self) -> bool {
        !lock(&self.inner).server_unavailable
    }

    pub fn joined_rooms(&self) -> Vec<ConversationId> {
        lock(&self.inner).rooms.iter().copied().collect()
    }

    /// Starts the connection loop. No-op when already running, when no
    /// credential is available, or after the server was marked unavailable.
    pub fn connect(self: &Arc<Self>) {
        let mut inner = lock(&self.inner);
        if inner.server_unavailable {
            debug!("transport: server marked unavailable; connect ignored");
            return;
        }
        if inner.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if self.credentials.bearer_token().is_none() {
            warn!("transport: no bearer credential; not connecting");
            return;
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        inner.outbound = Some(outbound_tx);
        inner.attempts = 0;
        inner.task = Some(tokio::spawn(Arc::clone(self).run(outbound_rx)));
    }

    /// Tears the socket down. Joined rooms are kept for the next `connect`.
    pub fn disconnect(&self) {
        let task = {
            let mut inner = lock(&self.inner);
            inner.outbound = None;
            inner.attempts = 0;
            inner.task.take()
        };
        if let Some(task) = task {
            task.abort();
            info!(url = %self.ws_url, "transport: disconnected");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Clears the exhausted flag and attempt counter, then reconnects.
    pub fn retry_connection(self: &Arc<Self>) {
        let task = {
            let mut inner = lock(&self.inner);
            inner.attempts = 0;
            inner.server_unavailable = false;
            inner.outbound = None;
            inner.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!(url = %self.ws_url, "transport: manual retry requested");
        self.connect();
    }

    async fn run(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<OutboundEvent>) {
        loop {
            let attempt = lock(&self.inner).attempts;
            self.state.send_replace(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            match self.open_socket().await {
                Ok(stream) => {
                    lock(&self.inner).attempts = 0;
                    // Anything queued against the previous socket is stale.
                    while outbound.try_recv().is_ok() {}
                    self.state.send_replace(ConnectionState::Connected);
                    info!(url = %self.ws_url, "transport: connected");
                    if let PumpExit::Shutdown = self.pump(stream, &mut outbound).await {
                        return;
                    }
                    warn!(url = %self.ws_url, "transport: connection lost");
                }
                Err(err) => {
                    warn!(url = %self.ws_url, attempt, error = %err, "transport: connect failed");
                }
            }

            let (attempt, exhausted) = {
                let mut inner = lock(&self.inner);
                inner.attempts += 1;
                let exhausted = inner.attempts >= self.policy.max_attempts;
                if exhausted {
                    inner.server_unavailable = true;
                    inner.outbound = None;
                }
                (inner.attempts, exhausted)
            };
            if exhausted {
                self.state.send_replace(ConnectionState::Unavailable);
                warn!(
                    url = %self.ws_url,
                    attempts = attempt,
                    "transport: server unavailable; real-time updates disabled"
                );
                return;
            }

            let delay = self.policy.delay_for_attempt(attempt);
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transport: reconnect scheduled"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn open_socket(&self) -> ClientResult<WsStream> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or(ClientError::MissingCredential)?;
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| ClientError::Socket(err.to_string()))?;
        let header = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ClientError::Socket(format!("invalid credential header: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (stream, _) = tokio::time::timeout(self.policy.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                ClientError::Socket(format!(
                    "connect timed out after {}ms",
                    self.policy.connect_timeout.as_millis()
                ))
            })?
            .map_err(|err| ClientError::Socket(err.to_string()))?;
        Ok(stream)
    }

    async fn pump(
        &self,
        stream: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<OutboundEvent>,
    ) -> PumpExit {
        let (mut writer, mut reader) = stream.split();

        let rooms = self.joined_rooms();
        for conversation_id in rooms {
            let rejoin = OutboundEvent::JoinConversation { conversation_id };
            if let Err(err) = send_frame(&mut writer, &rejoin).await {
                warn!(conversation_id = conversation_id.0, error = %err, "transport: rejoin failed");
                return PumpExit::Dropped;
            }
            debug!(conversation_id = conversation_id.0, "transport: rejoined room");
        }

        loop {
            tokio::select! {
                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => return PumpExit::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "transport: read failed");
                        return PumpExit::Dropped;
                    }
                },
                queued = outbound.recv() => match queued {
                    Some(event) => {
                        if let Err(err) = send_frame(&mut writer, &event).await {
                            warn!(event = event.name(), error = %err, "transport: write failed");
                            return PumpExit::Dropped;
                        }
                    }
                    None => {
                        let _ = writer.close().await;
                        return PumpExit::Shutdown;
                    }
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match decode_frame::<ServerEvent>(text) {
            Ok(frame) => {
                if let ServerEvent::Error(error) = &frame.event {
                    warn!(code = ?error.code, message = %error.message, "transport: server reported error");
                }
                let event = ChannelEvent::from_frame(frame);
                let delivered = self.registry.dispatch(&event);
                trace!(kind = ?event.kind, delivered, "transport: event dispatched");
            }
            Err(err) => warn!(error = %err, "transport: dropping malformed frame"),
        }
    }
}

impl RealtimeChannel for TransportChannel {
    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn emit(&self, event: OutboundEvent) {
        let mut inner = lock(&self.inner);
        match &event {
            OutboundEvent::JoinConversation { conversation_id } => {
                inner.rooms.insert(*conversation_id);
            }
            OutboundEvent::LeaveConversation { conversation_id } => {
                inner.rooms.remove(conversation_id);
            }
            _ => {}
        }
        if !self.is_connected() {
            debug!(event = event.name(), "transport: not connected; event dropped");
            return;
        }
        let name = event.name();
        let queued = inner
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(event).is_ok());
        if !queued {
            debug!(event = name, "transport: writer gone; event dropped");
        }
    }

    fn subscribe(&self, kind: EventKind, listener: Listener) -> Subscription {
        self.registry.subscribe(kind, listener)
    }
}

async fn send_frame<S>(writer: &mut S, event: &OutboundEvent) -> ClientResult<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = encode_frame(event, None)?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|err| ClientError::Socket(err.to_string()))
}

/// `http(s)://host[/base]` to `ws(s)://host[/base]/ws`.
pub fn socket_url(server_url: &str) -> ClientResult<Url> {
    let mut url = Url::parse(server_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ClientError::InvalidState(format!(
                "unsupported server url scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidState(format!("cannot use scheme {scheme}")))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
