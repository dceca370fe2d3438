//! LLM adapter module.
//!
//! Each provider speaks its own wire format. The adapters translate the
//! provider-neutral message list into that format and translate blocking
//! or streamed responses back into neutral output.
//!
//! The provider set is fixed, so adapters form a closed enum chosen once
//! per call by [`select_adapter`] rather than an open trait hierarchy.

pub mod decode;
pub mod gemini;
pub mod llama;
pub mod openai_compatible;

use tracing::error;

use crate::config::ProvidersConfig;
use crate::error::AdapterError;
use crate::types::{ChatMessage, TokenUsage};

pub use decode::FragmentStream;
use gemini::GeminiAdapter;
use llama::LlamaAdapter;
use openai_compatible::OpenAiCompatibleAdapter;

/// Which wire format a model identifier maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    OpenAi,
    Gemini,
    Llama,
}

/// Map a model identifier to its adapter. Never fails: anything that is
/// not recognisably Gemini or a local Llama server is OpenAI-compatible.
pub fn select_adapter(model_id: &str) -> AdapterKind {
    let model = model_id.to_lowercase();
    if model.starts_with("gemini") {
        AdapterKind::Gemini
    } else if model.contains("llama") || model.contains("local") {
        AdapterKind::Llama
    } else {
        AdapterKind::OpenAi
    }
}

/// Neutral output of a blocking provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

pub enum Adapter {
    OpenAi(OpenAiCompatibleAdapter),
    Gemini(GeminiAdapter),
    Llama(LlamaAdapter),
}

impl Adapter {
    pub fn new(kind: AdapterKind, providers: &ProvidersConfig, client: reqwest::Client) -> Self {
        match kind {
            AdapterKind::OpenAi => Adapter::OpenAi(OpenAiCompatibleAdapter::new(
                "OpenAI",
                providers.openai.clone(),
                client,
            )),
            AdapterKind::Gemini => {
                Adapter::Gemini(GeminiAdapter::new(providers.gemini.clone(), client))
            }
            AdapterKind::Llama => Adapter::Llama(LlamaAdapter::new(providers.llama.clone(), client)),
        }
    }

    pub fn for_model(model_id: &str, providers: &ProvidersConfig, client: reqwest::Client) -> Self {
        Self::new(select_adapter(model_id), providers, client)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Adapter::OpenAi(a) => a.name(),
            Adapter::Gemini(_) => gemini::PROVIDER,
            Adapter::Llama(_) => llama::PROVIDER,
        }
    }

    /// Send the whole conversation and wait for the full reply.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion, AdapterError> {
        match self {
            Adapter::OpenAi(a) => a.complete(model, messages).await,
            Adapter::Gemini(a) => a.complete(model, messages).await,
            Adapter::Llama(a) => a.complete(model, messages).await,
        }
    }

    /// Open a streaming call. The request has been accepted by the
    /// provider once this returns; fragments follow lazily.
    pub async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, AdapterError> {
        match self {
            Adapter::OpenAi(a) => a.stream(model, messages).await,
            Adapter::Gemini(a) => a.stream(model, messages).await,
            Adapter::Llama(a) => a.stream(model, messages).await,
        }
    }
}

/// Send a prepared request and turn transport failures and non-success
/// statuses into adapter errors.
pub(crate) async fn send_checked(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, AdapterError> {
    let response = request
        .send()
        .await
        .map_err(|e| AdapterError::transport(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        error!(provider, status = status.as_u16(), "{provider} API error: {error_body}");
        return Err(AdapterError::rejected(provider, status.as_u16(), &error_body));
    }
    Ok(response)
}

/// Read a success body as text and decode it as JSON.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<T, AdapterError> {
    let body = response
        .text()
        .await
        .map_err(|e| AdapterError::transport(provider, e))?;
    serde_json::from_str(&body).map_err(|e| {
        AdapterError::malformed(
            provider,
            format!("{e}: {}", crate::error::excerpt(&body)),
        )
    })
}
