//! Google Gemini adapter.
//!
//! Gemini differs from the OpenAI format in three ways:
//! - system messages move into a top-level `systemInstruction`
//! - assistant turns are called `model` and content is a list of `parts`
//! - `streamGenerateContent` streams one top-level JSON array of response
//!   objects instead of newline-delimited records

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::decode::{decode_stream, FragmentStream, JsonArrayDecoder};
use super::{read_json, send_checked, Completion};
use crate::config::ProviderConfig;
use crate::error::AdapterError;
use crate::types::{ChatMessage, Role, TokenUsage};

pub const PROVIDER: &str = "Gemini";

// --- API Request Types ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest<'a> {
    contents: Vec<ApiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct ApiContent<'a> {
    role: &'static str,
    parts: Vec<ApiPart<'a>>,
}

#[derive(Serialize)]
struct ApiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct ApiInstruction {
    parts: Vec<OwnedPart>,
}

#[derive(Serialize)]
struct OwnedPart {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

// --- API Response Types ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

impl ApiResponse {
    /// Concatenated text of the first candidate's parts.
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let texts: Vec<&str> = content.parts.iter().filter_map(|p| p.text.as_deref()).collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.concat())
        }
    }
}

/// Text extraction for one streamed response object.
fn stream_object_text(value: &serde_json::Value) -> Option<String> {
    serde_json::from_value::<ApiResponse>(value.clone())
        .ok()
        .and_then(|r| r.text())
}

pub struct GeminiAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(config: ProviderConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!("{}/{}:{}", self.config.api_base.trim_end_matches('/'), model, method)
    }

    fn build_api_request<'a>(&self, messages: &'a [ChatMessage]) -> ApiRequest<'a> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| ApiContent {
                role: if m.role == Role::User { "user" } else { "model" },
                parts: vec![ApiPart { text: &m.content }],
            })
            .collect();

        ApiRequest {
            contents,
            system_instruction: (!system.is_empty()).then(|| ApiInstruction {
                parts: vec![OwnedPart {
                    text: system.join("\n\n"),
                }],
            }),
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
            },
        }
    }

    fn post(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::RequestBuilder, AdapterError> {
        let api_key = self.config.api_key(PROVIDER)?;
        let body = self.build_api_request(messages);
        Ok(self
            .client
            .post(self.endpoint(model, stream))
            .query(&[("key", api_key.as_str())])
            .header("Content-Type", "application/json")
            .json(&body))
    }

    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion, AdapterError> {
        let mut request = self.post(model, messages, false)?;
        if let Some(timeout) = self.config.timeout() {
            request = request.timeout(timeout);
        }
        debug!(provider = PROVIDER, model, "Sending blocking request");

        let response = send_checked(PROVIDER, request).await?;
        let api_response: ApiResponse = read_json(PROVIDER, response).await?;
        Ok(parse_response(api_response))
    }

    pub async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, AdapterError> {
        let request = self.post(model, messages, true)?;
        debug!(provider = PROVIDER, model, "Opening stream");

        let response = send_checked(PROVIDER, request).await?;
        Ok(decode_stream(
            PROVIDER,
            response.bytes_stream(),
            JsonArrayDecoder::new(PROVIDER, stream_object_text),
        ))
    }
}

fn parse_response(api_response: ApiResponse) -> Completion {
    let usage = api_response
        .usage_metadata
        .as_ref()
        .map(|u| {
            TokenUsage::from_counts(
                u.prompt_token_count,
                u.candidates_token_count,
                u.total_token_count,
            )
        })
        .unwrap_or_default();

    Completion {
        content: api_response.text().unwrap_or_default(),
        usage,
    }
}
