//! Client side of the event stream.
//!
//! [`StreamConsumer`] posts a message to the server, reads the framed
//! event stream as it arrives and folds each frame into a
//! [`ClientStreamState`]:
//!
//! ```text
//! idle --send--> connecting --thinking--> thinking --response--> responding --done--> done
//!                    |                                                ^
//!                    +------------------- response -------------------+
//! error frame / timeout / transport failure: back to idle with the error
//! recorded and partial text kept
//! ```
//!
//! One stream is active at a time. Starting a new send cancels the
//! previous one; a fixed deadline bounds how long a stream may stay open.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use memchr::memmem;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::sse::{Frame, FrameKind};

// --- Frame decoding ---

/// Splits the incoming byte stream on the blank-line frame terminator.
/// An incomplete trailing frame stays buffered until the next read.
/// Lines may end in `\n` or `\r\n`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        // JSON payloads escape CR, so a raw one is always part of a line ending
        self.buffer
            .extend(chunk.iter().copied().filter(|&b| b != b'\r'));
        let mut frames = Vec::new();
        while let Some(pos) = memmem::find(&self.buffer, b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(frame) = parse_frame(&raw[..pos]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes received but not yet terminated.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_frame(raw: &[u8]) -> Option<Frame> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to decode SSE frame as UTF-8: {e}");
            return None;
        }
    };

    let mut data = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(payload) = line.strip_prefix("data:") {
            data.push(payload.strip_prefix(' ').unwrap_or(payload));
        }
    }
    if data.is_empty() {
        return None;
    }

    let payload = data.join("\n");
    match serde_json::from_str::<Frame>(&payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Failed to parse SSE event: {payload} ({e})");
            None
        }
    }
}

// --- State ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamPhase {
    #[default]
    Idle,
    Connecting,
    Thinking,
    Responding,
    Done,
}

/// A message to post to a conversation's stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(skip)]
    pub conversation_id: u64,
    pub content: String,
    #[serde(rename = "model_code", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub use_persona: bool,
    #[serde(default)]
    pub use_scaffolding: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStreamState {
    pub thinking_text: String,
    pub response_text: String,
    pub phase: StreamPhase,
    /// User-visible error. Cancellation never sets it.
    pub error: Option<String>,
    pub last_request: Option<OutgoingMessage>,
}

impl ClientStreamState {
    pub fn is_streaming(&self) -> bool {
        matches!(
            self.phase,
            StreamPhase::Connecting | StreamPhase::Thinking | StreamPhase::Responding
        )
    }

    fn reset_for(&mut self, message: OutgoingMessage) {
        self.thinking_text.clear();
        self.response_text.clear();
        self.error = None;
        self.phase = StreamPhase::Connecting;
        self.last_request = Some(message);
    }
}

enum Step {
    Continue,
    Finished,
    Failed(String),
}

/// Fold one frame into the state.
fn apply_frame(state: &mut ClientStreamState, frame: Frame) -> Step {
    match frame.kind {
        FrameKind::Thinking => {
            if state.phase == StreamPhase::Connecting {
                state.phase = StreamPhase::Thinking;
            }
            state.thinking_text.push_str(&frame.content);
            Step::Continue
        }
        FrameKind::Response => {
            state.phase = StreamPhase::Responding;
            state.response_text.push_str(&frame.content);
            Step::Continue
        }
        FrameKind::Done => {
            state.phase = StreamPhase::Done;
            Step::Finished
        }
        FrameKind::Error => Step::Failed(frame.content),
    }
}

// --- Consumer ---

/// Cancels whichever stream is active on the consumer it came from.
#[derive(Clone)]
pub struct CancelHandle {
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl CancelHandle {
    /// Idempotent; does nothing when no stream is active.
    pub fn cancel(&self) {
        let token = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

pub struct StreamConsumer {
    http: reqwest::Client,
    server_url: String,
    token: Option<String>,
    timeout: Duration,
    state: ClientStreamState,
    updates: watch::Sender<ClientStreamState>,
    handle: CancelHandle,
}

impl StreamConsumer {
    pub fn new(server_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        let (updates, _) = watch::channel(ClientStreamState::default());
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into(),
            token,
            timeout,
            state: ClientStreamState::default(),
            updates,
            handle: CancelHandle {
                active: Arc::default(),
            },
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.server_url.clone(), config.token.clone(), config.timeout())
    }

    pub fn state(&self) -> &ClientStreamState {
        &self.state
    }

    /// Observe state changes as frames are applied.
    pub fn subscribe(&self) -> watch::Receiver<ClientStreamState> {
        self.updates.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// Cancel the active stream, if any. Safe to call repeatedly.
    pub fn cleanup(&self) {
        self.handle.cancel();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn publish(&self) {
        self.updates.send_replace(self.state.clone());
    }

    /// Create a conversation on the server and return its id.
    pub async fn create_conversation(&self) -> Result<u64, ClientError> {
        #[derive(Deserialize)]
        struct Created {
            id: u64,
        }

        let response = self
            .authorized(self.http.post(self.url("/api/conversations")))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(ClientError::Transport)?;
        if !response.status().is_success() {
            return Err(ClientError::Rejected(response.status().as_u16()));
        }
        let created: Created = response.json().await.map_err(ClientError::Transport)?;
        Ok(created.id)
    }

    /// Send a message and consume its event stream until a terminal
    /// frame, an error, the deadline, or cancellation.
    pub async fn send_message(&mut self, message: OutgoingMessage) -> Result<(), ClientError> {
        self.cleanup();
        self.state.reset_for(message.clone());
        self.publish();

        let cancel = CancellationToken::new();
        *self
            .handle
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        let request = self
            .authorized(self.http.post(self.url(&format!(
                "/api/conversations/{}/messages/stream",
                message.conversation_id
            ))))
            .header("Accept", "text/event-stream")
            .json(&message);

        let timeout = self.timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(ClientError::Timeout(timeout)),
            r = drive(request, &mut self.state, &self.updates) => r,
        };

        // Release the abort signal; a cancel has already taken it.
        self.handle
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match &result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                debug!("Stream cancelled");
                self.state.phase = StreamPhase::Idle;
            }
            Err(e) => {
                warn!("Streaming error: {e}");
                self.state.error = Some(e.to_string());
                self.state.phase = StreamPhase::Idle;
            }
        }
        self.publish();
        result
    }

    /// Replay the most recently sent message.
    pub async fn retry_last_message(&mut self) -> Result<(), ClientError> {
        let message = self
            .state
            .last_request
            .clone()
            .ok_or(ClientError::NothingToRetry)?;
        self.send_message(message).await
    }
}

async fn drive(
    request: reqwest::RequestBuilder,
    state: &mut ClientStreamState,
    updates: &watch::Sender<ClientStreamState>,
) -> Result<(), ClientError> {
    let response = request.send().await.map_err(ClientError::Transport)?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Rejected(status.as_u16()));
    }

    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::default();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ClientError::Transport)?;
        for frame in decoder.push(&chunk) {
            match apply_frame(state, frame) {
                Step::Continue => {}
                Step::Finished => {
                    updates.send_replace(state.clone());
                    return Ok(());
                }
                Step::Failed(message) => return Err(ClientError::Server(message)),
            }
        }
        updates.send_replace(state.clone());
    }
    Err(ClientError::Closed)
}
