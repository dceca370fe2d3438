//! Chat orchestrator - drives one or two adapter calls per request.
//!
//! ```text
//!                 single pass
//! ChatRequest ---------------------------> adapter --> reply
//!      |
//!      |  two pass (scaffolding)
//!      +--> planning call --> thinking --+
//!                                        v
//!           execution call (persona + thinking as context) --> reply
//! ```
//!
//! The passes are strictly sequential: execution depends on the planning
//! output. The orchestrator keeps no state between calls, so one instance
//! can serve any number of concurrent requests.

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AppConfig, ChatConfig, ProvidersConfig};
use crate::error::ChatError;
use crate::llm::Adapter;
use crate::persona::{prepend_persona, PersonaSource};
use crate::sse::EventSink;
use crate::types::{
    ChatMessage, ChatRequest, ChatResult, Phase, StreamEvent, TokenUsage, Tokens, Transcript,
    TwoPassTokenUsage,
};

pub const PLANNING_PROMPT: &str = "\
Analyze the user's request and create a structured plan:

1. Core Intent: What is the user actually asking?
2. Ambiguities: What details are unclear or missing?
3. Context Check: What relevant information from conversation history applies?
4. Assumptions: What assumptions need validation?
5. Clarifications Needed: What questions should be asked (if any)?
6. Response Strategy: If answerable, how should the response be structured?

If clarification is needed, state that clearly. Otherwise, provide a detailed plan.";

const ECHO_PREFIX: &str = "[DEV MODE] Echo: ";

/// System message for the execution pass. The persona, when enabled, is
/// merged here as context instead of leading the conversation so the
/// planning text does not dilute it.
pub fn execution_prompt(persona: Option<&str>, thinking: &str) -> String {
    match persona {
        Some(persona) => format!(
            "{persona}\n\n---\n\n# Your Planning Analysis\n\n{thinking}\n\n---\n\n\
             Now provide your final response based on this analysis."
        ),
        None => format!(
            "Here is your planning analysis:\n\n{thinking}\n\n\
             Now provide your final response based on this analysis."
        ),
    }
}

fn with_system(system: String, messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatMessage::system(system));
    out.extend_from_slice(messages);
    out
}

pub struct ChatOrchestrator {
    chat: ChatConfig,
    providers: ProvidersConfig,
    persona: PersonaSource,
    client: reqwest::Client,
}

impl ChatOrchestrator {
    pub fn new(chat: ChatConfig, providers: ProvidersConfig) -> Self {
        let persona = PersonaSource::from_path(chat.persona_path.clone());
        Self {
            chat,
            providers,
            persona,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.chat.clone(), config.providers.clone())
    }

    pub fn with_persona(mut self, persona: PersonaSource) -> Self {
        self.persona = persona;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.chat.enabled
    }

    /// The model a request will run against.
    pub fn model_for<'a>(&'a self, request: &'a ChatRequest) -> &'a str {
        request
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.chat.fallback_model)
    }

    fn adapter_for(&self, model: &str) -> Adapter {
        let adapter = Adapter::for_model(model, &self.providers, self.client.clone());
        info!("Using {} adapter for model {}", adapter.name(), model);
        adapter
    }

    /// Run a request the way its `stream` flag asks: blocking requests
    /// return their result, streaming requests report through `sink` and
    /// return `None`.
    pub async fn run<S: EventSink + ?Sized>(
        &self,
        request: &ChatRequest,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Option<ChatResult>, ChatError> {
        if request.stream {
            self.stream(request, sink, cancel).await?;
            Ok(None)
        } else {
            self.complete(request).await.map(Some)
        }
    }

    // --- Blocking ---

    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResult, ChatError> {
        if !self.chat.enabled {
            return Ok(ChatResult {
                reply: echo_text(&request.messages),
                thinking: None,
                tokens: Tokens::Single(TokenUsage::default()),
            });
        }

        let model = self.model_for(request);
        let adapter = self.adapter_for(model);

        if !request.use_scaffolding {
            let messages = self.single_pass_messages(request).await?;
            let completion = adapter.complete(model, &messages).await?;
            return Ok(ChatResult {
                reply: completion.content,
                thinking: None,
                tokens: Tokens::Single(completion.usage),
            });
        }

        info!("Starting planning pass...");
        let planning = adapter
            .complete(model, &with_system(PLANNING_PROMPT.to_string(), &request.messages))
            .await?;

        info!("Starting execution pass...");
        let execution_messages = self
            .execution_messages(request, &planning.content)
            .await?;
        let execution = adapter.complete(model, &execution_messages).await?;

        Ok(ChatResult {
            reply: execution.content,
            thinking: Some(planning.content),
            tokens: Tokens::TwoPass(TwoPassTokenUsage::new(planning.usage, execution.usage)),
        })
    }

    // --- Streaming ---

    /// Stream a request into `sink`. Exactly one terminal event is
    /// emitted: `Done` on success, `Error` on any failure.
    pub async fn stream<S: EventSink + ?Sized>(
        &self,
        request: &ChatRequest,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Transcript, ChatError> {
        match self.stream_fragments(request, sink, cancel).await {
            Ok(transcript) => {
                sink.emit(StreamEvent::Done)?;
                Ok(transcript)
            }
            Err(e) => {
                warn!("Streaming chat failed: {e}");
                let _ = sink.emit(StreamEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn stream_fragments<S: EventSink + ?Sized>(
        &self,
        request: &ChatRequest,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Transcript, ChatError> {
        if !self.chat.enabled {
            return self.stream_echo(request, sink, cancel).await;
        }

        let model = self.model_for(request);
        let adapter = self.adapter_for(model);

        if !request.use_scaffolding {
            let messages = self.single_pass_messages(request).await?;
            let reply = stream_pass(&adapter, model, &messages, Phase::Response, sink, cancel).await?;
            return Ok(Transcript {
                reply,
                thinking: None,
            });
        }

        info!("Starting planning pass...");
        let planning_messages = with_system(PLANNING_PROMPT.to_string(), &request.messages);
        let thinking =
            stream_pass(&adapter, model, &planning_messages, Phase::Thinking, sink, cancel).await?;

        info!("Starting execution pass...");
        let execution_messages = self.execution_messages(request, &thinking).await?;
        let reply =
            stream_pass(&adapter, model, &execution_messages, Phase::Response, sink, cancel).await?;

        Ok(Transcript {
            reply,
            thinking: Some(thinking),
        })
    }

    async fn stream_echo<S: EventSink + ?Sized>(
        &self,
        request: &ChatRequest,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Transcript, ChatError> {
        let text = echo_text(&request.messages);
        let delay = self.chat.echo_delay();
        for ch in text.chars() {
            sink.emit(StreamEvent::Response(ch.to_string()))?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(Transcript {
            reply: text,
            thinking: None,
        })
    }

    // --- Message assembly ---

    async fn single_pass_messages(
        &self,
        request: &ChatRequest,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let opens_with_system = request
            .messages
            .first()
            .is_some_and(|m| m.role == crate::types::Role::System);
        if !request.use_persona || opens_with_system {
            return Ok(request.messages.clone());
        }
        let persona = self.persona.load().await?;
        Ok(prepend_persona(persona, &request.messages))
    }

    async fn execution_messages(
        &self,
        request: &ChatRequest,
        thinking: &str,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let persona = if request.use_persona {
            Some(self.persona.load().await?)
        } else {
            None
        };
        Ok(with_system(
            execution_prompt(persona.as_deref(), thinking),
            &request.messages,
        ))
    }
}

fn echo_text(messages: &[ChatMessage]) -> String {
    let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
    format!("{ECHO_PREFIX}{last}")
}

/// Run one streamed adapter call, tagging each fragment with `phase` and
/// folding the fragments into the pass output.
async fn stream_pass<S: EventSink + ?Sized>(
    adapter: &Adapter,
    model: &str,
    messages: &[ChatMessage],
    phase: Phase,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<String, ChatError> {
    let mut fragments = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ChatError::Cancelled),
        opened = adapter.stream(model, messages) => opened?,
    };

    let mut output = String::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            next = fragments.next() => next,
        };
        match next {
            Some(Ok(text)) => {
                output.push_str(&text);
                sink.emit(StreamEvent::fragment(phase, text))?;
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(output),
        }
    }
}
