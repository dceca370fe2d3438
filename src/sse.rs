//! Server-to-client event framing.
//!
//! Each [`StreamEvent`] becomes one frame:
//! `data: {"type":"thinking"|"response"|"done"|"error","content":"..."}\n\n`.
//! Lines starting with `:` are heartbeats and carry no event.

use std::convert::Infallible;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::types::StreamEvent;

pub const HEARTBEAT: &str = ": keep-alive\n\n";

/// Message used when an emitter is dropped before any terminal event.
const UNTERMINATED: &str = "stream ended unexpectedly";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Thinking,
    Response,
    Done,
    Error,
}

/// Wire form of one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default)]
    pub content: String,
}

impl From<&StreamEvent> for Frame {
    fn from(event: &StreamEvent) -> Self {
        let (kind, content) = match event {
            StreamEvent::Thinking(text) => (FrameKind::Thinking, text.clone()),
            StreamEvent::Response(text) => (FrameKind::Response, text.clone()),
            StreamEvent::Done => (FrameKind::Done, String::new()),
            StreamEvent::Error(message) => (FrameKind::Error, message.clone()),
        };
        Frame { kind, content }
    }
}

impl From<Frame> for StreamEvent {
    fn from(frame: Frame) -> Self {
        match frame.kind {
            FrameKind::Thinking => StreamEvent::Thinking(frame.content),
            FrameKind::Response => StreamEvent::Response(frame.content),
            FrameKind::Done => StreamEvent::Done,
            FrameKind::Error => StreamEvent::Error(frame.content),
        }
    }
}

/// Serialize one event as a complete frame including its blank-line
/// terminator.
pub fn encode(event: &StreamEvent) -> String {
    let json = serde_json::to_string(&Frame::from(event))
        .unwrap_or_else(|_| r#"{"type":"error","content":"unserializable event"}"#.to_string());
    format!("data: {json}\n\n")
}

/// Receiver of orchestrator progress in streaming mode.
pub trait EventSink: Send {
    /// Deliver one event. Fails once nobody is listening any more.
    fn emit(&mut self, event: StreamEvent) -> Result<(), ChatError>;
}

impl EventSink for Vec<StreamEvent> {
    fn emit(&mut self, event: StreamEvent) -> Result<(), ChatError> {
        self.push(event);
        Ok(())
    }
}

impl EventSink for mpsc::UnboundedSender<StreamEvent> {
    fn emit(&mut self, event: StreamEvent) -> Result<(), ChatError> {
        self.send(event).map_err(|_| ChatError::Disconnected)
    }
}

/// Frames events onto a channel drained by the transport.
///
/// Enforces the terminal rule: after `done` or `error` nothing else is
/// sent, and an emitter dropped without a terminal event sends an
/// `error` frame so the stream never closes silently.
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<String>,
    terminated: bool,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                terminated: false,
            },
            rx,
        )
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Emit a terminal error unless the stream already ended.
    pub fn fail(&mut self, message: impl Into<String>) {
        if !self.terminated {
            let _ = self.emit(StreamEvent::Error(message.into()));
        }
    }
}

impl EventSink for EventEmitter {
    fn emit(&mut self, event: StreamEvent) -> Result<(), ChatError> {
        if self.terminated {
            debug!("Dropping event after terminal frame: {:?}", event);
            return Ok(());
        }
        self.terminated = event.is_terminal();
        self.tx.send(encode(&event)).map_err(|_| ChatError::Disconnected)
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        if !self.terminated {
            warn!("Event stream closed without a terminal event");
            let _ = self.tx.send(encode(&StreamEvent::Error(UNTERMINATED.to_string())));
        }
    }
}

/// Turn the emitter's channel into a body stream, interleaving heartbeat
/// comments while the producer is quiet. Ends when the emitter is gone.
pub fn frame_stream(
    rx: mpsc::UnboundedReceiver<String>,
    heartbeat: Duration,
) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
    let ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    stream::unfold((rx, ticker), |(mut rx, mut ticker)| async move {
        tokio::select! {
            biased;
            frame = rx.recv() => frame.map(|f| (Ok(f), (rx, ticker))),
            _ = ticker.tick() => Some((Ok(HEARTBEAT.to_string()), (rx, ticker))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_encode_frames() {
        assert_eq!(
            encode(&StreamEvent::Thinking("plan".to_string())),
            "data: {\"type\":\"thinking\",\"content\":\"plan\"}\n\n"
        );
        assert_eq!(
            encode(&StreamEvent::Done),
            "data: {\"type\":\"done\",\"content\":\"\"}\n\n"
        );
    }

    #[test]
    fn test_encode_escapes_newlines() {
        let frame = encode(&StreamEvent::Response("a\n\nb".to_string()));
        // the only blank line is the terminator
        assert_eq!(frame.matches("\n\n").count(), 1);
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn test_frame_round_trip() {
        let frame: Frame =
            serde_json::from_str(r#"{"type":"error","content":"boom"}"#).unwrap();
        assert_eq!(StreamEvent::from(frame), StreamEvent::Error("boom".to_string()));
        let frame: Frame = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(StreamEvent::from(frame), StreamEvent::Done);
    }

    #[test]
    fn test_emitter_stops_after_terminal() {
        let (mut emitter, mut rx) = EventEmitter::channel();
        emitter.emit(StreamEvent::Response("hi".to_string())).unwrap();
        emitter.emit(StreamEvent::Done).unwrap();
        emitter.emit(StreamEvent::Response("late".to_string())).unwrap();
        emitter.fail("also late");
        drop(emitter);

        let frames: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].contains("\"done\""));
    }

    #[test]
    fn test_dropped_emitter_sends_error() {
        let (mut emitter, mut rx) = EventEmitter::channel();
        emitter.emit(StreamEvent::Thinking("x".to_string())).unwrap();
        drop(emitter);
        let frames: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].contains("\"error\""));
        assert!(frames[1].contains(UNTERMINATED));
    }

    #[test]
    fn test_emit_to_closed_channel_reports_disconnect() {
        let (mut emitter, rx) = EventEmitter::channel();
        drop(rx);
        assert!(matches!(
            emitter.emit(StreamEvent::Response("x".to_string())),
            Err(ChatError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_frame_stream_ends_with_emitter() {
        let (mut emitter, rx) = EventEmitter::channel();
        emitter.emit(StreamEvent::Response("a".to_string())).unwrap();
        emitter.emit(StreamEvent::Done).unwrap();
        drop(emitter);
        let frames: Vec<String> = frame_stream(rx, Duration::from_secs(60))
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn test_frame_stream_emits_heartbeat_when_idle() {
        let (emitter, rx) = EventEmitter::channel();
        let mut frames = Box::pin(frame_stream(rx, Duration::from_millis(20)));
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(first, HEARTBEAT);
        drop(emitter);
    }
}
