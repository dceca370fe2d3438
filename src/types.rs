//! Core data types used throughout aiui.
//!
//! This module defines the provider-neutral message, request, result and
//! stream event types that flow between the adapters, the orchestrator,
//! the event framer and the stream consumer.

use serde::{Deserialize, Serialize};

// --- Message Roles ---

/// The role of a message in the conversation.
///
/// - `System`: instructions to the model (invisible to the user)
/// - `User`: the human's input
/// - `Assistant`: the model's response
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

// --- Messages ---

/// A single message in the conversation.
///
/// Position in the conversation encodes the dialogue turn, so callers
/// always pass messages as an ordered slice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Create a system message (sets the model's behavior/instructions).
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// --- Chat Request ---

/// Per-call switches that shape how a request is orchestrated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatOptions {
    #[serde(default)]
    pub use_persona: bool,
    #[serde(default)]
    pub use_scaffolding: bool,
    #[serde(default)]
    pub stream: bool,
}

/// A request handed to the orchestrator.
///
/// Built fresh for every call and never shared between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Model identifier; `None` selects the configured fallback model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub use_persona: bool,
    #[serde(default)]
    pub use_scaffolding: bool,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, model: Option<String>, options: ChatOptions) -> Self {
        Self {
            messages,
            model,
            use_persona: options.use_persona,
            use_scaffolding: options.use_scaffolding,
            stream: options.stream,
        }
    }

    pub fn options(&self) -> ChatOptions {
        ChatOptions {
            use_persona: self.use_persona,
            use_scaffolding: self.use_scaffolding,
            stream: self.stream,
        }
    }
}

// --- Token Usage ---

/// Token counters reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build usage from provider counters, deriving the total when the
    /// provider leaves it out.
    pub fn from_counts(prompt: Option<u64>, completion: Option<u64>, total: Option<u64>) -> Self {
        let prompt_tokens = prompt.unwrap_or(0);
        let completion_tokens = completion.unwrap_or(0);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total.unwrap_or(prompt_tokens + completion_tokens),
        }
    }
}

/// Usage for a planning + execution run. `total` is always the sum of
/// both passes' `total_tokens`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TwoPassTokenUsage {
    pub planning: TokenUsage,
    pub execution: TokenUsage,
    pub total: u64,
}

impl TwoPassTokenUsage {
    pub fn new(planning: TokenUsage, execution: TokenUsage) -> Self {
        Self {
            planning,
            execution,
            total: planning.total_tokens + execution.total_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Tokens {
    TwoPass(TwoPassTokenUsage),
    Single(TokenUsage),
}

impl Tokens {
    pub fn total(&self) -> u64 {
        match self {
            Tokens::Single(usage) => usage.total_tokens,
            Tokens::TwoPass(usage) => usage.total,
        }
    }

    /// Flatten to one set of counters, summing both passes if needed.
    pub fn flatten(&self) -> TokenUsage {
        match self {
            Tokens::Single(usage) => *usage,
            Tokens::TwoPass(usage) => TokenUsage {
                prompt_tokens: usage.planning.prompt_tokens + usage.execution.prompt_tokens,
                completion_tokens: usage.planning.completion_tokens
                    + usage.execution.completion_tokens,
                total_tokens: usage.total,
            },
        }
    }
}

// --- Results ---

/// Result of a blocking orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResult {
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub tokens: Tokens,
}

/// Text accumulated over a streaming run, handed back to the caller so
/// the reply can be persisted once the stream has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub reply: String,
    pub thinking: Option<String>,
}

// --- Stream Events ---

/// Which part of a two-pass run a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Thinking,
    Response,
}

/// One step of orchestrator progress in streaming mode.
///
/// Every `Thinking` event precedes every `Response` event, and exactly one
/// terminal event (`Done` or `Error`) ends the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Thinking(String),
    Response(String),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn fragment(phase: Phase, content: impl Into<String>) -> Self {
        match phase {
            Phase::Thinking => StreamEvent::Thinking(content.into()),
            Phase::Response => StreamEvent::Response(content.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_pass_total_is_sum_of_passes() {
        let planning = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
        };
        let execution = TokenUsage {
            prompt_tokens: 15,
            completion_tokens: 25,
            total_tokens: 40,
        };
        let tokens = Tokens::TwoPass(TwoPassTokenUsage::new(planning, execution));
        assert_eq!(tokens.total(), 70);
        let flat = tokens.flatten();
        assert_eq!(flat.prompt_tokens, 25);
        assert_eq!(flat.completion_tokens, 45);
    }

    #[test]
    fn test_usage_derives_missing_total() {
        let usage = TokenUsage::from_counts(Some(4), Some(6), None);
        assert_eq!(usage.total_tokens, 10);
        let usage = TokenUsage::from_counts(None, None, Some(3));
        assert_eq!(usage.total_tokens, 3);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert_eq!(request.messages, vec![ChatMessage::user("hi")]);
        assert!(request.model.is_none());
        assert_eq!(request.options(), ChatOptions::default());
    }

    #[test]
    fn test_tokens_serialize_shapes() {
        let single = Tokens::Single(TokenUsage::from_counts(Some(1), Some(2), None));
        let json = serde_json::to_value(single).unwrap();
        assert_eq!(json["total_tokens"], 3);

        let two = Tokens::TwoPass(TwoPassTokenUsage::new(
            TokenUsage::from_counts(Some(1), Some(1), None),
            TokenUsage::from_counts(Some(2), Some(2), None),
        ));
        let json = serde_json::to_value(two).unwrap();
        assert_eq!(json["total"], 6);
        assert_eq!(json["planning"]["total_tokens"], 2);
    }
}
