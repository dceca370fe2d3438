//! Error types for the adapters, the orchestrator and the stream consumer.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Longest provider body excerpt carried in an error.
const BODY_EXCERPT_LIMIT: usize = 512;

/// Failure of a single provider call.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Connection, DNS, TLS or timeout failure before a usable response.
    #[error("{provider} transport error: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The provider answered with a non-success status.
    #[error("{provider} API error ({status}): {body}")]
    ProviderRejected {
        provider: &'static str,
        status: u16,
        body: String,
    },

    /// The transport worked but the body did not have the expected shape.
    #[error("{provider} returned a malformed response: {detail}")]
    MalformedResponse {
        provider: &'static str,
        detail: String,
    },

    /// No key in the config file and none in `env`, if one is configured.
    #[error("{provider} API key not found: {}", credential_hint(.env.as_deref()))]
    MissingCredential {
        provider: &'static str,
        env: Option<String>,
    },
}

fn credential_hint(env: Option<&str>) -> String {
    match env {
        Some(var) => format!("set api_key in the config file or export {var}"),
        None => "set api_key in the config file".to_string(),
    }
}

impl AdapterError {
    pub fn transport(provider: &'static str, source: reqwest::Error) -> Self {
        Self::Transport { provider, source }
    }

    pub fn rejected(provider: &'static str, status: u16, body: &str) -> Self {
        Self::ProviderRejected {
            provider,
            status,
            body: excerpt(body),
        }
    }

    pub fn malformed(provider: &'static str, detail: impl Into<String>) -> Self {
        Self::MalformedResponse {
            provider,
            detail: detail.into(),
        }
    }
}

/// Truncate a response body on a char boundary for error reporting.
pub fn excerpt(body: &str) -> String {
    let body = body.trim();
    if body.len() <= BODY_EXCERPT_LIMIT {
        return body.to_string();
    }
    let mut end = BODY_EXCERPT_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Failure of an orchestrator run.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Failed to read persona file {}: {source}", path.display())]
    Persona {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The event consumer went away while the run was still producing.
    #[error("event stream consumer disconnected")]
    Disconnected,

    #[error("request cancelled")]
    Cancelled,
}

/// Failure observed by the stream consumer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection lost. Please check your network and try again.")]
    Transport(#[source] reqwest::Error),

    #[error("HTTP error! status: {0}")]
    Rejected(u16),

    #[error("Stream timeout - response took too long")]
    Timeout(Duration),

    /// User-initiated abort; never shown as an error.
    #[error("stream cancelled")]
    Cancelled,

    /// An `error` frame sent by the server.
    #[error("{0}")]
    Server(String),

    #[error("stream closed before completion")]
    Closed,

    #[error("no previous message to retry")]
    NothingToRetry,
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }
}
