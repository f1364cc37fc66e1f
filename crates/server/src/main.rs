use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{ConversationId, DeleteScope, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{
        decode_frame, Actor, Conversation, CreateConversationRequest, DeleteMessageQuery,
        EditMessageRequest, LoginRequest, LoginResponse, Message, OutboundEvent, Page, PageQuery,
        ReactionRequest, SendMessageRequest, ServerEvent,
    },
};
use storage::Storage;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod auth;
mod config;
mod rooms;

use api::ApiContext;
use app_state::AppState;
use auth::{AuthUser, TokenIssuer};
use config::{load_settings, prepare_database_url};
use rooms::{ConnectionId, RoomRegistry};

const MAX_BODY_BYTES: usize = 64 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    if settings.uses_dev_secret() {
        warn!("server: using the development JWT secret; set APP__JWT_SECRET in production");
    }
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext { storage },
        tokens: TokenIssuer::new(&settings.jwt_secret, settings.token_ttl_seconds),
        rooms: Arc::new(RoomRegistry::new()),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route(
            "/conversations",
            get(http_list_conversations).post(http_create_conversation),
        )
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages).post(http_send_message),
        )
        .route("/conversations/:conversation_id/read", post(http_mark_read))
        .route(
            "/messages/:message_id",
            axum::routing::patch(http_edit_message).delete(http_delete_message),
        )
        .route(
            "/messages/:message_id/reactions",
            post(http_add_reaction).delete(http_remove_reaction),
        )
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.api.storage.health_check().await {
        Ok(()) => "ok".into_response(),
        Err(err) => {
            error!(error = %err, "healthz: storage unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response()
        }
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let (user_id, username) = api::login(&state.api, &req.username)
        .await
        .map_err(reject)?;
    let token = state.tokens.mint(user_id, &username).map_err(|e| {
        reject(ApiError::new(
            ErrorCode::Internal,
            format!("token mint failed: {e}"),
        ))
    })?;
    info!(user_id = user_id.0, %username, "login");
    Ok(Json(LoginResponse {
        user_id,
        username,
        token,
    }))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Page<Conversation>>> {
    let page = api::list_conversations(&state.api, user.user_id, &q)
        .await
        .map_err(reject)?;
    Ok(Json(page))
}

async fn http_create_conversation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = api::create_conversation(&state.api, user.user_id, req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(conversation_id): Path<i64>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Page<Message>>> {
    let page = api::list_messages(&state.api, user.user_id, ConversationId(conversation_id), &q)
        .await
        .map_err(reject)?;
    Ok(Json(page))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(conversation_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<Message>> {
    let conversation_id = ConversationId(conversation_id);
    let message = api::send_message(&state.api, user.user_id, conversation_id, req)
        .await
        .map_err(reject)?;
    publish(
        &state,
        conversation_id,
        ServerEvent::NewMessage {
            message: message.clone(),
        },
        None,
    )
    .await;
    Ok(Json(message))
}

async fn http_edit_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<i64>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<Message>> {
    let message = api::edit_message(&state.api, user.user_id, MessageId(message_id), &req.content)
        .await
        .map_err(reject)?;
    publish(
        &state,
        message.conversation_id,
        ServerEvent::MessageEdited {
            message: message.clone(),
        },
        None,
    )
    .await;
    Ok(Json(message))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<i64>,
    Query(q): Query<DeleteMessageQuery>,
) -> ApiResult<StatusCode> {
    let message = api::delete_message(&state.api, user.user_id, MessageId(message_id), q.scope)
        .await
        .map_err(reject)?;
    if q.scope == DeleteScope::Everyone {
        publish(
            &state,
            message.conversation_id,
            ServerEvent::MessageDeleted {
                conversation_id: message.conversation_id,
                message_id: message.message_id,
            },
            None,
        )
        .await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_add_reaction(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<i64>,
    Json(req): Json<ReactionRequest>,
) -> ApiResult<Json<Message>> {
    let (message, reaction) =
        api::add_reaction(&state.api, user.user_id, MessageId(message_id), &req.emoji)
            .await
            .map_err(reject)?;
    publish(
        &state,
        message.conversation_id,
        ServerEvent::MessageReactionAdded {
            conversation_id: message.conversation_id,
            message_id: message.message_id,
            reaction,
        },
        None,
    )
    .await;
    Ok(Json(message))
}

async fn http_remove_reaction(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(message_id): Path<i64>,
) -> ApiResult<Json<Message>> {
    let (message, removed) = api::remove_reaction(&state.api, user.user_id, MessageId(message_id))
        .await
        .map_err(reject)?;
    if removed {
        publish(
            &state,
            message.conversation_id,
            ServerEvent::MessageReactionRemoved {
                conversation_id: message.conversation_id,
                message_id: message.message_id,
                user_id: user.user_id,
            },
            None,
        )
        .await;
    }
    Ok(Json(message))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(conversation_id): Path<i64>,
) -> ApiResult<StatusCode> {
    let conversation_id = ConversationId(conversation_id);
    let receipt = api::mark_read(&state.api, user.user_id, conversation_id, None)
        .await
        .map_err(reject)?;
    publish(&state, conversation_id, ServerEvent::MessagesRead { receipt }, None).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Conversation events reach the room and every participant's sockets, so
/// conversation lists stay current for users who are not viewing the room.
async fn publish(
    state: &AppState,
    conversation_id: ConversationId,
    event: ServerEvent,
    except: Option<ConnectionId>,
) {
    let delivered = match api::participants(&state.api, conversation_id).await {
        Ok(participants) => {
            state
                .rooms
                .send_to_conversation(conversation_id, &participants, &event, except)
        }
        Err(err) => {
            warn!(conversation_id = conversation_id.0, error = %err, "rooms: participant lookup failed; room only");
            state.rooms.send_to_room(conversation_id, &event, except)
        }
    };
    debug!(conversation_id = conversation_id.0, delivered, "rooms: event published");
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<WsQuery>,
) -> Response {
    match state.tokens.authenticate(&headers, q.token.as_deref()) {
        Ok(user) => ws
            .on_upgrade(move |socket| ws_connection(state, socket, user))
            .into_response(),
        Err(err) => reject(err).into_response(),
    }
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user: AuthUser) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<String>();
    let (connection_id, presence) = state.rooms.register(user.user_id, outbox_tx);
    info!(connection_id, user_id = user.user_id.0, "ws: connected");
    if presence.changed {
        state.rooms.broadcast(
            &ServerEvent::UserOnline {
                user_id: user.user_id,
            },
            Some(connection_id),
        );
    }

    let send_task = tokio::spawn(async move {
        while let Some(text) = outbox_rx.recv().await {
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => handle_client_frame(&state, connection_id, &user, &text).await,
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    if let Some(change) = state.rooms.unregister(connection_id) {
        if change.changed {
            state.rooms.broadcast(
                &ServerEvent::UserOffline {
                    user_id: change.user_id,
                },
                None,
            );
        }
    }
    info!(connection_id, user_id = user.user_id.0, "ws: disconnected");
}

async fn handle_client_frame(
    state: &AppState,
    connection_id: ConnectionId,
    user: &AuthUser,
    text: &str,
) {
    let event = match decode_frame::<OutboundEvent>(text) {
        Ok(frame) => frame.event,
        Err(err) => {
            warn!(connection_id, error = %err, "ws: dropping malformed frame");
            return;
        }
    };
    debug!(connection_id, event = event.name(), "ws: client event");
    if let Err(err) = relay(state, connection_id, user, event).await {
        warn!(connection_id, error = %err, "ws: client event rejected");
        state.rooms.send_to(connection_id, &ServerEvent::Error(err));
    }
}

async fn relay(
    state: &AppState,
    connection_id: ConnectionId,
    user: &AuthUser,
    event: OutboundEvent,
) -> Result<(), ApiError> {
    let actor = Actor {
        user_id: user.user_id,
        username: Some(user.username.clone()),
    };
    match event {
        OutboundEvent::JoinConversation { conversation_id } => {
            api::ensure_participant(&state.api, conversation_id, user.user_id).await?;
            if state.rooms.join(connection_id, conversation_id) {
                debug!(connection_id, conversation_id = conversation_id.0, "rooms: joined");
            }
        }
        OutboundEvent::LeaveConversation { conversation_id } => {
            state.rooms.leave(connection_id, conversation_id);
        }
        OutboundEvent::SendMessage {
            conversation_id,
            message_id,
            ..
        } => {
            // The REST call stored the message; this only fans it out.
            let message = api::load_message(&state.api, message_id).await?;
            if message.conversation_id != conversation_id || message.sender_id != user.user_id {
                return Err(ApiError::forbidden("message does not belong to the sender"));
            }
            state.rooms.send_to_room(
                conversation_id,
                &ServerEvent::NewMessage { message },
                Some(connection_id),
            );
        }
        OutboundEvent::TypingStart { conversation_id } => {
            api::ensure_participant(&state.api, conversation_id, user.user_id).await?;
            state.rooms.send_to_room(
                conversation_id,
                &ServerEvent::UserTyping {
                    conversation_id,
                    user_id: user.user_id,
                    username: user.username.clone(),
                },
                Some(connection_id),
            );
        }
        OutboundEvent::TypingStop { conversation_id } => {
            api::ensure_participant(&state.api, conversation_id, user.user_id).await?;
            state.rooms.send_to_room(
                conversation_id,
                &ServerEvent::UserStoppedTyping {
                    conversation_id,
                    user_id: user.user_id,
                },
                Some(connection_id),
            );
        }
        OutboundEvent::MarkMessageRead {
            conversation_id,
            message_id,
        } => {
            let receipt = api::mark_read(&state.api, user.user_id, conversation_id, message_id).await?;
            publish(
                state,
                conversation_id,
                ServerEvent::MessagesRead { receipt },
                Some(connection_id),
            )
            .await;
        }
        OutboundEvent::LikePost {
            post_id,
            post_owner_id,
        } => {
            if post_owner_id != user.user_id {
                state
                    .rooms
                    .send_to_user(post_owner_id, &ServerEvent::NewLike { post_id, actor });
            }
        }
        OutboundEvent::LikeReel {
            reel_id,
            reel_owner_id,
        } => {
            if reel_owner_id != user.user_id {
                state
                    .rooms
                    .send_to_user(reel_owner_id, &ServerEvent::NewReelLike { reel_id, actor });
            }
        }
        OutboundEvent::NewComment {
            post_id,
            post_owner_id,
            comment_id,
        } => {
            if post_owner_id != user.user_id {
                state.rooms.send_to_user(
                    post_owner_id,
                    &ServerEvent::NewCommentNotification {
                        post_id,
                        comment_id,
                        actor,
                    },
                );
            }
        }
        OutboundEvent::NewFollow { followed_user_id } => {
            if followed_user_id != user.user_id {
                state
                    .rooms
                    .send_to_user(followed_user_id, &ServerEvent::NewFollower { actor });
            }
        }
        OutboundEvent::ViewStory {
            story_id,
            story_owner_id,
        } => {
            if story_owner_id != user.user_id {
                state
                    .rooms
                    .send_to_user(story_owner_id, &ServerEvent::StoryViewed { story_id, actor });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
