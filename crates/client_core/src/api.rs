//! Request/response access to the messaging REST surface.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{ConversationId, DeleteScope, MessageId},
    error::{ApiError, DecodeError, ErrorCode},
    protocol::{
        Conversation, CreateConversationRequest, EditMessageRequest, LoginRequest,
        LoginResponse, Message, Page, ReactionRequest, SendMessageRequest,
    },
};
use tracing::{debug, warn};

use crate::{
    credentials::CredentialProvider,
    error::{ClientError, ClientResult},
};

#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// One page of a conversation, oldest message first.
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> ClientResult<Page<Message>>;
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: SendMessageRequest,
    ) -> ClientResult<Message>;
    async fn edit_message(&self, message_id: MessageId, content: &str) -> ClientResult<Message>;
    async fn delete_message(&self, message_id: MessageId, scope: DeleteScope) -> ClientResult<()>;
    async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> ClientResult<Message>;
    async fn remove_reaction(&self, message_id: MessageId) -> ClientResult<Message>;
    async fn mark_read(&self, conversation_id: ConversationId) -> ClientResult<()>;
    async fn fetch_conversations(&self, page: u32, page_size: u32)
        -> ClientResult<Page<Conversation>>;
    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> ClientResult<Conversation>;
}

pub struct HttpMessagingApi {
    http: Client,
    server_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpMessagingApi {
    pub fn new(server_url: &str, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_client(Client::new(), server_url, credentials)
    }

    pub fn with_client(
        http: Client,
        server_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn login(&self, username: &str) -> ClientResult<LoginResponse> {
        let response = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&LoginRequest {
                username: username.to_string(),
            })
            .send()
            .await?;
        read_json(response).await
    }

    fn authorized(&self, request: RequestBuilder) -> ClientResult<RequestBuilder> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or(ClientError::MissingCredential)?;
        Ok(request.bearer_auth(token))
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> ClientResult<Page<Message>> {
        let request = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation_id.0
            ))
            .query(&[("page", page), ("limit", page_size)]);
        let response = self.authorized(request)?.send().await?;
        let mut page = read_page::<Message>(response, "messages").await?;
        // The server pages newest first.
        page.items.reverse();
        debug!(
            conversation_id = conversation_id.0,
            count = page.items.len(),
            has_next = page.has_next,
            "api: fetched messages"
        );
        Ok(page)
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: SendMessageRequest,
    ) -> ClientResult<Message> {
        let http = self
            .http
            .post(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation_id.0
            ))
            .json(&request);
        let response = self.authorized(http)?.send().await?;
        read_json(response).await
    }

    async fn edit_message(&self, message_id: MessageId, content: &str) -> ClientResult<Message> {
        let request = self
            .http
            .patch(format!("{}/messages/{}", self.server_url, message_id.0))
            .json(&EditMessageRequest {
                content: content.to_string(),
            });
        let response = self.authorized(request)?.send().await?;
        read_json(response).await
    }

    async fn delete_message(&self, message_id: MessageId, scope: DeleteScope) -> ClientResult<()> {
        let request = self
            .http
            .delete(format!("{}/messages/{}", self.server_url, message_id.0))
            .query(&[("scope", scope.as_str())]);
        let response = self.authorized(request)?.send().await?;
        read_empty(response).await
    }

    async fn add_reaction(&self, message_id: MessageId, emoji: &str) -> ClientResult<Message> {
        let request = self
            .http
            .post(format!(
                "{}/messages/{}/reactions",
                self.server_url, message_id.0
            ))
            .json(&ReactionRequest {
                emoji: emoji.to_string(),
            });
        let response = self.authorized(request)?.send().await?;
        read_json(response).await
    }

    async fn remove_reaction(&self, message_id: MessageId) -> ClientResult<Message> {
        let request = self.http.delete(format!(
            "{}/messages/{}/reactions",
            self.server_url, message_id.0
        ));
        let response = self.authorized(request)?.send().await?;
        read_json(response).await
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> ClientResult<()> {
        let request = self.http.post(format!(
            "{}/conversations/{}/read",
            self.server_url, conversation_id.0
        ));
        let response = self.authorized(request)?.send().await?;
        read_empty(response).await
    }

    async fn fetch_conversations(
        &self,
        page: u32,
        page_size: u32,
    ) -> ClientResult<Page<Conversation>> {
        let request = self
            .http
            .get(format!("{}/conversations", self.server_url))
            .query(&[("page", page), ("limit", page_size)]);
        let response = self.authorized(request)?.send().await?;
        read_page(response, "conversations").await
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> ClientResult<Conversation> {
        let http = self
            .http
            .post(format!("{}/conversations", self.server_url))
            .json(&request);
        let response = self.authorized(http)?.send().await?;
        read_json(response).await
    }
}

async fn checked_body(response: Response) -> ClientResult<Vec<u8>> {
    let status = response.status();
    let body = response.bytes().await?.to_vec();
    if status.is_success() {
        return Ok(body);
    }
    let error = serde_json::from_slice::<ApiError>(&body).unwrap_or_else(|_| {
        ApiError::new(
            ErrorCode::Internal,
            String::from_utf8_lossy(&body).trim().to_string(),
        )
    });
    Err(ClientError::Api { status, error })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let body = checked_body(response).await?;
    Ok(serde_json::from_slice(&body).map_err(DecodeError::from)?)
}

async fn read_empty(response: Response) -> ClientResult<()> {
    checked_body(response).await.map(|_| ())
}

/// Decodes `{"items": [..], "has_next": ..}`. A missing or non-array `items`
/// is a decode error; individual items that fail to decode are skipped.
async fn read_page<T: DeserializeOwned>(
    response: Response,
    what: &'static str,
) -> ClientResult<Page<T>> {
    let body = checked_body(response).await?;
    let value: Value = serde_json::from_slice(&body).map_err(DecodeError::from)?;
    Ok(decode_page(value, what)?)
}

pub(crate) fn decode_page<T: DeserializeOwned>(
    mut value: Value,
    what: &'static str,
) -> Result<Page<T>, DecodeError> {
    let Some(object) = value.as_object_mut() else {
        return Err(DecodeError::Shape(format!("{what} response is not an object")));
    };
    let has_next = object
        .get("has_next")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let Some(Value::Array(raw_items)) = object.remove("items") else {
        return Err(DecodeError::Shape(format!("{what} response has no item array")));
    };
    let mut items = Vec::with_capacity(raw_items.len());
    for raw in raw_items {
        match serde_json::from_value::<T>(raw) {
            Ok(item) => items.push(item),
            Err(err) => warn!(what, error = %err, "api: skipping malformed item"),
        }
    }
    Ok(Page { items, has_next })
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
