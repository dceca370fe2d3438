//! Bearer-token authentication.

use std::collections::HashMap;

use thiserror::Error;

use crate::config::ServerConfig;

/// User id assigned to every request when authentication is disabled.
pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingHeader,
    #[error("Invalid or expired token")]
    InvalidToken,
}

/// Resolves a bearer token to a user id.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Option<String>;

    /// True when requests need no token at all.
    fn is_open(&self) -> bool {
        false
    }
}

/// Fixed token table from the server config. An empty table disables
/// authentication.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.tokens.clone())
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }

    fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Token part of an `Authorization` header value. The scheme word is
/// optional; the last whitespace-separated word is the token.
pub fn bearer_token(header: &str) -> Option<&str> {
    header.split_whitespace().last()
}

pub fn authenticate(
    validator: &dyn TokenValidator,
    header: Option<&str>,
) -> Result<CurrentUser, AuthError> {
    if validator.is_open() {
        return Ok(CurrentUser(ANONYMOUS_USER.to_string()));
    }
    let token = header
        .and_then(bearer_token)
        .ok_or(AuthError::MissingHeader)?;
    validator
        .validate(token)
        .map(CurrentUser)
        .ok_or(AuthError::InvalidToken)
}
