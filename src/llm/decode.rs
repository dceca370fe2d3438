//! Incremental decoders for streamed provider bodies.
//!
//! Network reads arrive in arbitrary pieces. A decoder buffers bytes,
//! emits every text fragment that has become decodable, and keeps the
//! undecodable tail for the next read. Splitting a body at any byte
//! offset yields the same fragments as feeding it whole.

use std::collections::VecDeque;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use memchr::memchr;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AdapterError;

/// A lazily decoded sequence of text fragments from one provider call.
pub type FragmentStream = BoxStream<'static, Result<String, AdapterError>>;

pub trait FragmentDecoder: Send + 'static {
    /// Feed one network read and return the fragments it completed.
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, AdapterError>;

    /// Flush at end of body. Leftover bytes that cannot be decoded are a
    /// malformed response.
    fn finish(&mut self) -> Result<Vec<String>, AdapterError>;

    /// True once the body announced its own end.
    fn is_done(&self) -> bool {
        false
    }
}

// --- Line-delimited `data: <json>` records (OpenAI / Llama) ---

#[derive(Deserialize)]
struct DeltaChunk {
    #[serde(default)]
    choices: Vec<DeltaChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

pub struct SseLineDecoder {
    provider: &'static str,
    buffer: Vec<u8>,
    done: bool,
}

impl SseLineDecoder {
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            buffer: Vec::new(),
            done: false,
        }
    }

    fn decode_line(&mut self, raw: &[u8], out: &mut Vec<String>) -> Result<(), AdapterError> {
        if self.done {
            return Ok(());
        }
        let line = match std::str::from_utf8(raw) {
            Ok(s) => s.trim(),
            Err(e) => {
                warn!(provider = self.provider, "Invalid UTF-8 in stream line: {e}");
                return Ok(());
            }
        };
        let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
            return Ok(());
        };
        if payload == "[DONE]" {
            self.done = true;
            return Ok(());
        }
        if payload.is_empty() {
            return Ok(());
        }

        match serde_json::from_str::<DeltaChunk>(payload) {
            Ok(chunk) => {
                if let Some(error) = chunk.error {
                    return Err(AdapterError::rejected(self.provider, 200, &error.to_string()));
                }
                let text = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta)
                    .and_then(|d| d.content);
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    out.push(text);
                }
            }
            Err(e) => debug!(provider = self.provider, "Skipping undecodable stream line: {e}"),
        }
        Ok(())
    }
}

impl FragmentDecoder for SseLineDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, AdapterError> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            self.decode_line(&line, &mut out)?;
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<String>, AdapterError> {
        let rest = std::mem::take(&mut self.buffer);
        let mut out = Vec::new();
        if self.done || rest.iter().all(u8::is_ascii_whitespace) {
            return Ok(out);
        }
        // A final record without a trailing newline must still be whole.
        let text = String::from_utf8_lossy(&rest);
        let payload = text.trim().strip_prefix("data:").map(str::trim_start);
        if let Some(payload) = payload.filter(|p| *p != "[DONE]") {
            if serde_json::from_str::<serde_json::Value>(payload).is_err() {
                return Err(AdapterError::malformed(
                    self.provider,
                    format!("stream ended inside a record: {}", crate::error::excerpt(payload)),
                ));
            }
        }
        self.decode_line(&rest, &mut out)?;
        Ok(out)
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// --- Streamed top-level JSON array of objects (Gemini) ---

/// Splits a streamed `[{...},{...}]` body into complete top-level objects.
///
/// Braces are matched outside string literals only, so text containing
/// `{` or `}` does not move object boundaries.
pub struct JsonArrayDecoder {
    provider: &'static str,
    buffer: Vec<u8>,
    /// Next byte to scan.
    cursor: usize,
    /// Start of the object currently open at depth 1.
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    extract: fn(&serde_json::Value) -> Option<String>,
}

impl JsonArrayDecoder {
    pub fn new(provider: &'static str, extract: fn(&serde_json::Value) -> Option<String>) -> Self {
        Self {
            provider,
            buffer: Vec::new(),
            cursor: 0,
            start: None,
            depth: 0,
            in_string: false,
            escaped: false,
            extract,
        }
    }

    fn scan(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while self.cursor < self.buffer.len() {
            let byte = self.buffer[self.cursor];
            self.cursor += 1;

            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }

            match byte {
                b'"' if self.depth > 0 => self.in_string = true,
                b'{' => {
                    if self.depth == 0 {
                        self.start = Some(self.cursor - 1);
                    }
                    self.depth += 1;
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Some(start) = self.start.take() {
                            self.emit(start, self.cursor, &mut out);
                        }
                    }
                }
                _ => {}
            }
        }
        self.compact();
        out
    }

    fn emit(&self, start: usize, end: usize, out: &mut Vec<String>) {
        match serde_json::from_slice::<serde_json::Value>(&self.buffer[start..end]) {
            Ok(value) => {
                if let Some(text) = (self.extract)(&value).filter(|t| !t.is_empty()) {
                    out.push(text);
                }
            }
            Err(e) => warn!(provider = self.provider, "Skipping undecodable stream object: {e}"),
        }
    }

    /// Drop bytes that belong to already-consumed objects.
    fn compact(&mut self) {
        let keep_from = self.start.unwrap_or(self.cursor);
        if keep_from > 0 {
            self.buffer.drain(..keep_from);
            self.cursor -= keep_from;
            if let Some(start) = self.start.as_mut() {
                *start -= keep_from;
            }
        }
    }
}

impl FragmentDecoder for JsonArrayDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, AdapterError> {
        self.buffer.extend_from_slice(chunk);
        Ok(self.scan())
    }

    fn finish(&mut self) -> Result<Vec<String>, AdapterError> {
        if self.start.is_some() {
            return Err(AdapterError::malformed(
                self.provider,
                "stream ended inside an unterminated object",
            ));
        }
        Ok(Vec::new())
    }
}

// --- Byte stream to fragment stream ---

struct DecodeState<S, D> {
    body: S,
    decoder: D,
    pending: VecDeque<String>,
    finished: bool,
}

/// Wrap a response body in a decoder, yielding fragments as soon as they
/// become decodable. Dropping the returned stream drops the body and
/// releases the connection.
pub fn decode_stream<S, B, D>(provider: &'static str, body: S, decoder: D) -> FragmentStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    D: FragmentDecoder,
{
    let state = DecodeState {
        body,
        decoder,
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            if state.finished {
                return None;
            }

            let step = match state.body.next().await {
                Some(Ok(bytes)) => state.decoder.push(bytes.as_ref()).map(|fragments| {
                    if state.decoder.is_done() {
                        state.finished = true;
                    }
                    fragments
                }),
                Some(Err(e)) => Err(AdapterError::transport(provider, e)),
                None => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };

            match step {
                Ok(fragments) => state.pending.extend(fragments),
                Err(e) => {
                    state.finished = true;
                    state.pending.clear();
                    return Some((Err(e), state));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENAI_BODY: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo, \"}}]}\r\n\r\n",
        ": keep-alive\n",
        "data:{\"choices\":[{\"delta\":{\"content\":\"w\u{00f6}rld\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    const GEMINI_BODY: &str = concat!(
        "[{\"candidates\": [{\"content\": {\"parts\": [{\"text\": \"The {brace}\"}],\"role\": \"model\"}}]}\n",
        ",\r\n{\"candidates\": [{\"content\": {\"parts\": [{\"text\": \" and \\\"quote\\\" }\"}]}}]}\n",
        ",\r\n{\"candidates\": [{\"content\": {\"parts\": [{\"text\": \" caf\u{00e9}\"}]}}],",
        "\"usageMetadata\": {\"promptTokenCount\": 3}}\n]",
    );

    fn gemini_text(value: &serde_json::Value) -> Option<String> {
        value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn feed<D: FragmentDecoder>(mut decoder: D, chunks: &[&[u8]]) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.push(chunk).unwrap());
        }
        out.extend(decoder.finish().unwrap());
        out
    }

    #[test]
    fn test_sse_whole_body() {
        let out = feed(SseLineDecoder::new("OpenAI"), &[OPENAI_BODY.as_bytes()]);
        assert_eq!(out, vec!["Hel", "lo, ", "wörld"]);
    }

    #[test]
    fn test_sse_every_split_point_matches_whole() {
        let body = OPENAI_BODY.as_bytes();
        let expected = feed(SseLineDecoder::new("OpenAI"), &[body]);
        for split in 0..=body.len() {
            let (a, b) = body.split_at(split);
            assert_eq!(feed(SseLineDecoder::new("OpenAI"), &[a, b]), expected, "split at {split}");
        }
    }

    #[test]
    fn test_sse_byte_at_a_time() {
        let chunks: Vec<&[u8]> = OPENAI_BODY.as_bytes().chunks(1).collect();
        assert_eq!(
            feed(SseLineDecoder::new("OpenAI"), &chunks),
            vec!["Hel", "lo, ", "wörld"]
        );
    }

    #[test]
    fn test_sse_done_is_not_decoded_and_stops() {
        let mut decoder = SseLineDecoder::new("Llama");
        let out = decoder
            .push(b"data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n")
            .unwrap();
        assert!(out.is_empty());
        assert!(decoder.is_done());
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn test_sse_malformed_line_is_skipped() {
        let out = feed(
            SseLineDecoder::new("OpenAI"),
            &[b"data: {not json}\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n"],
        );
        assert_eq!(out, vec!["ok"]);
    }

    #[test]
    fn test_sse_error_object_is_rejected() {
        let mut decoder = SseLineDecoder::new("OpenAI");
        let err = decoder
            .push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n")
            .unwrap_err();
        assert!(matches!(err, AdapterError::ProviderRejected { .. }));
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn test_sse_final_line_without_newline() {
        let out = feed(
            SseLineDecoder::new("OpenAI"),
            &[b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}"],
        );
        assert_eq!(out, vec!["tail"]);
    }

    #[test]
    fn test_sse_truncated_record_is_malformed() {
        let mut decoder = SseLineDecoder::new("OpenAI");
        decoder.push(b"data: {\"choices\":[{\"del").unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(AdapterError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn test_gemini_object_split_across_reads() {
        let mut decoder = JsonArrayDecoder::new("Gemini", gemini_text);
        let first = decoder
            .push(br#"[{"candidates":[{"content":{"parts":[{"text":"Hel"#)
            .unwrap();
        assert!(first.is_empty());
        let second = decoder.push(br#"lo"}]}}]}]"#).unwrap();
        assert_eq!(second, vec!["Hello"]);
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn test_gemini_braces_inside_strings() {
        let out = feed(JsonArrayDecoder::new("Gemini", gemini_text), &[GEMINI_BODY.as_bytes()]);
        assert_eq!(out, vec!["The {brace}", " and \"quote\" }", " café"]);
    }

    #[test]
    fn test_gemini_every_split_point_matches_whole() {
        let body = GEMINI_BODY.as_bytes();
        let expected = feed(JsonArrayDecoder::new("Gemini", gemini_text), &[body]);
        assert_eq!(expected.len(), 3);
        for split in 0..=body.len() {
            let (a, b) = body.split_at(split);
            assert_eq!(
                feed(JsonArrayDecoder::new("Gemini", gemini_text), &[a, b]),
                expected,
                "split at {split}"
            );
        }
        let chunks: Vec<&[u8]> = body.chunks(7).collect();
        assert_eq!(feed(JsonArrayDecoder::new("Gemini", gemini_text), &chunks), expected);
    }

    #[test]
    fn test_gemini_buffer_is_compacted() {
        let mut decoder = JsonArrayDecoder::new("Gemini", gemini_text);
        decoder.push(GEMINI_BODY.as_bytes()).unwrap();
        assert!(decoder.buffer.is_empty());
        assert_eq!(decoder.cursor, 0);
    }

    #[test]
    fn test_gemini_unterminated_object_is_malformed() {
        let mut decoder = JsonArrayDecoder::new("Gemini", gemini_text);
        decoder.push(br#"[{"candidates":[{"#).unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(AdapterError::MalformedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_decode_stream_yields_fragments_across_chunks() {
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> = OPENAI_BODY
            .as_bytes()
            .chunks(5)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let fragments: Vec<String> = decode_stream(
            "OpenAI",
            stream::iter(chunks),
            SseLineDecoder::new("OpenAI"),
        )
        .map(|r| r.unwrap())
        .collect()
        .await;
        assert_eq!(fragments, vec!["Hel", "lo, ", "wörld"]);
    }

    #[tokio::test]
    async fn test_decode_stream_surfaces_terminal_error_once() {
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> =
            vec![Ok(br#"[{"candidates":[{"content":{"parts":[{"text":"x"#.to_vec())];
        let items: Vec<_> = decode_stream(
            "Gemini",
            stream::iter(chunks),
            JsonArrayDecoder::new("Gemini", gemini_text),
        )
        .collect()
        .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AdapterError::MalformedResponse { .. })));
    }
}
