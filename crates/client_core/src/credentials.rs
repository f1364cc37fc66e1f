use std::sync::RwLock;

/// Synchronous accessor for the current bearer credential.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}

/// Credential slot written after login and cleared on logout.
#[derive(Debug, Default)]
pub struct TokenStore {
    token: RwLock<Option<String>>,
}

impl TokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self
            .token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self
            .token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

impl CredentialProvider for TokenStore {
    fn bearer_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .filter(|token| !token.is_empty())
    }
}
