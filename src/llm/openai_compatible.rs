//! OpenAI-compatible adapter.
//!
//! Request: `POST {api_base}/chat/completions` with
//! `{model, messages:[{role,content}], stream}`.
//! Blocking replies live at `choices[0].message.content` with usage under
//! `usage`; streamed replies are `data: <json>` lines carrying
//! `choices[0].delta.content`, terminated by `data: [DONE]`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::decode::{decode_stream, FragmentStream, SseLineDecoder};
use super::{read_json, send_checked, Completion};
use crate::config::ProviderConfig;
use crate::error::AdapterError;
use crate::types::{ChatMessage, TokenUsage};

// --- API Request Types ---

#[derive(Serialize)]
pub(crate) struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// --- API Response Types ---

#[derive(Deserialize, Debug)]
pub(crate) struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize, Debug)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ApiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

/// Speaks the OpenAI chat completions format. Also used underneath the
/// Llama adapter, which differs only in transport defaults.
pub struct OpenAiCompatibleAdapter {
    name: &'static str,
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new(name: &'static str, config: ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name,
            config,
            client,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'))
    }

    pub(crate) fn build_api_request<'a>(
        &self,
        model: &'a str,
        messages: &'a [ChatMessage],
        stream: bool,
    ) -> ApiRequest<'a> {
        ApiRequest {
            model,
            messages: messages
                .iter()
                .map(|m| ApiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream,
            temperature: self.config.temperature,
        }
    }

    fn post(&self, body: &ApiRequest<'_>) -> Result<reqwest::RequestBuilder, AdapterError> {
        let api_key = self.config.api_key(self.name)?;
        Ok(self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(body))
    }

    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion, AdapterError> {
        let body = self.build_api_request(model, messages, false);
        let mut request = self.post(&body)?;
        if let Some(timeout) = self.config.timeout() {
            request = request.timeout(timeout);
        }
        debug!(provider = self.name, model, "Sending blocking request to {}", self.endpoint());

        let response = send_checked(self.name, request).await?;
        let api_response: ApiResponse = read_json(self.name, response).await?;
        parse_response(self.name, api_response)
    }

    pub async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, AdapterError> {
        let body = self.build_api_request(model, messages, true);
        let request = self.post(&body)?;
        debug!(provider = self.name, model, "Opening stream to {}", self.endpoint());

        let response = send_checked(self.name, request).await?;
        Ok(decode_stream(
            self.name,
            response.bytes_stream(),
            SseLineDecoder::new(self.name),
        ))
    }
}

pub(crate) fn parse_response(
    provider: &'static str,
    api_response: ApiResponse,
) -> Result<Completion, AdapterError> {
    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AdapterError::malformed(provider, "no choices returned"))?;

    let usage = api_response
        .usage
        .map(|u| TokenUsage::from_counts(u.prompt_tokens, u.completion_tokens, u.total_tokens))
        .unwrap_or_default();

    Ok(Completion {
        content: choice.message.content.unwrap_or_default(),
        usage,
    })
}
