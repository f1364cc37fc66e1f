use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use shared::error::ApiError;

use crate::{
    api::ApiContext,
    auth::{AuthUser, TokenIssuer},
    rooms::RoomRegistry,
};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) tokens: TokenIssuer,
    pub(crate) rooms: Arc<RoomRegistry>,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        state
            .tokens
            .authenticate(&parts.headers, None)
            .map_err(|err| (StatusCode::UNAUTHORIZED, Json(err)))
    }
}
