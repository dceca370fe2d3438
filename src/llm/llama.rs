//! Local Llama-style server adapter (llama.cpp, LM Studio, ...).
//!
//! Same wire format as the OpenAI adapter; only the transport defaults
//! differ: a local base URL, a placeholder bearer token and a long
//! blocking timeout because local models can be slow.

use super::decode::FragmentStream;
use super::openai_compatible::OpenAiCompatibleAdapter;
use super::Completion;
use crate::config::ProviderConfig;
use crate::error::AdapterError;
use crate::types::ChatMessage;

pub const PROVIDER: &str = "Llama";

pub struct LlamaAdapter {
    inner: OpenAiCompatibleAdapter,
}

impl LlamaAdapter {
    pub fn new(mut config: ProviderConfig, client: reqwest::Client) -> Self {
        if config.api_key.as_deref().map_or(true, str::is_empty) && config.api_key_env.is_none() {
            config.api_key = Some("unused".to_string());
        }
        Self {
            inner: OpenAiCompatibleAdapter::new(PROVIDER, config, client),
        }
    }

    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion, AdapterError> {
        self.inner.complete(model, messages).await
    }

    pub async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, AdapterError> {
        self.inner.stream(model, messages).await
    }
}
