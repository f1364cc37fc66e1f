use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

pub mod api;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod events;
pub mod notifications;
pub mod poller;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod transport;
pub mod typing;

pub use api::{HttpMessagingApi, MessagingApi};
pub use config::{load_client_settings, ClientSettings};
pub use credentials::{CredentialProvider, TokenStore};
pub use directory::{ConversationListView, ListConfig, ListUpdate};
pub use error::{ClientError, ClientResult};
pub use events::{ChannelEvent, EventKind, Listener, Subscription};
pub use notifications::{Notification, NotificationFeed};
pub use poller::{FallbackPoller, PollPolicy, PollTarget};
pub use presence::PresenceBook;
pub use reconciler::{DeliveryState, MessageEntry, MessageReconciler};
pub use session::{ConversationSession, Identity, SessionConfig, SessionState, SessionUpdate};
pub use transport::{ConnectionState, RealtimeChannel, ReconnectPolicy, TransportChannel};
pub use typing::{TypingTracker, TypingUser};

use shared::domain::ConversationId;

/// Locks a std mutex, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wires one transport channel and one REST client to the logged-in user.
pub struct MessagingClient {
    settings: ClientSettings,
    credentials: Arc<TokenStore>,
    transport: Arc<TransportChannel>,
    api: Arc<HttpMessagingApi>,
    identity: Mutex<Option<Identity>>,
}

impl MessagingClient {
    pub fn new(settings: ClientSettings) -> ClientResult<Self> {
        let credentials = Arc::new(TokenStore::default());
        let transport = TransportChannel::new(
            &settings.server_url,
            settings.reconnect.clone(),
            credentials.clone(),
        )?;
        let api = Arc::new(HttpMessagingApi::new(
            &settings.server_url,
            credentials.clone(),
        ));
        Ok(Self {
            settings,
            credentials,
            transport,
            api,
            identity: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Logs in, stores the bearer token and opens the real-time channel.
    pub async fn login(&self, username: &str) -> ClientResult<Identity> {
        let response = self.api.login(username).await?;
        let identity = Identity {
            user_id: response.user_id,
            username: response.username,
        };
        self.resume(identity.clone(), response.token);
        Ok(identity)
    }

    /// Reuses a token obtained elsewhere (e.g. minted by the operator tool).
    pub fn resume(&self, identity: Identity, token: impl Into<String>) {
        info!(
            user_id = identity.user_id.0,
            username = %identity.username,
            "client: session started"
        );
        self.credentials.set(token);
        *lock(&self.identity) = Some(identity);
        self.transport.retry_connection();
    }

    pub fn logout(&self) {
        self.transport.disconnect();
        self.credentials.clear();
        if let Some(identity) = lock(&self.identity).take() {
            info!(user_id = identity.user_id.0, "client: logged out");
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.identity).clone()
    }

    pub fn transport(&self) -> &Arc<TransportChannel> {
        &self.transport
    }

    pub fn api(&self) -> &Arc<HttpMessagingApi> {
        &self.api
    }

    /// A closed session; call [`ConversationSession::open`] to start it.
    pub fn conversation(&self, conversation_id: ConversationId) -> ClientResult<ConversationSession> {
        let identity = self.identity().ok_or(ClientError::MissingCredential)?;
        Ok(ConversationSession::new(
            conversation_id,
            identity,
            self.transport.clone(),
            self.api.clone(),
            SessionConfig::from(&self.settings),
        ))
    }

    pub fn conversation_list(&self) -> ClientResult<ConversationListView> {
        if self.identity().is_none() {
            return Err(ClientError::MissingCredential);
        }
        Ok(ConversationListView::new(
            self.transport.clone(),
            self.api.clone(),
            ListConfig::from(&self.settings),
        ))
    }

    pub fn presence(&self) -> PresenceBook {
        PresenceBook::attach(self.transport.as_ref())
    }

    pub fn notifications(&self) -> NotificationFeed {
        NotificationFeed::attach(self.transport.as_ref())
    }
}

impl Drop for MessagingClient {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
