use reqwest::StatusCode;
use shared::error::{ApiError, DecodeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no bearer credential available")]
    MissingCredential,
    #[error("real-time channel is not connected")]
    NotConnected,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request ({status}): {error}")]
    Api { status: StatusCode, error: ApiError },
    #[error("malformed server payload: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("websocket failure: {0}")]
    Socket(String),
    #[error("{0}")]
    InvalidState(String),
}

impl ClientError {
    /// Decode failures are absorbed as empty results by background refreshes.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
