//! Incremental decoder for `data:`-framed completion event streams.
//!
//! Bytes are pushed as they arrive; complete lines are decoded into
//! [`ChunkFrame`]s carrying a per-connection sequence number. A partial line is
//! kept until the next push, so decoding is independent of how the transport
//! splits the body.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::event::{StreamEvent, Usage};
use crate::value::Value;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Error object sent inside the event stream instead of a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamError {
    pub message: String,
    pub error_type: Option<String>,
    pub code: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FramePayload {
    Event(StreamEvent),
    UpstreamError(UpstreamError),
}

/// One decoded unit with its sequence number on the current connection.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkFrame {
    pub seq: u64,
    pub payload: FramePayload,
}

/// Counters exposed for metrics and degradation checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Chunks that decoded successfully.
    pub frames: u64,
    /// Lines skipped because they were not valid chunk JSON or were oversized.
    pub malformed: u64,
    pub bytes: u64,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default)]
    tool_result: Option<WireToolResult>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunction>,
}

#[derive(Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireToolResult {
    tool_call_id: String,
    #[serde(default)]
    content: serde_json::Value,
    #[serde(default)]
    is_error: bool,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn into_event(self) -> StreamEvent {
        let arguments = if self.arguments.trim().is_empty() {
            Value::Object(BTreeMap::new())
        } else {
            Value::parse_lenient(&self.arguments)
        };
        StreamEvent::ToolInvocation {
            id: self.id,
            name: self.name,
            arguments,
        }
    }
}

/// Stateful frame decoder for a single physical connection.
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding_line: bool,
    next_seq: u64,
    finished: bool,
    finish_reason: Option<String>,
    response_id: Option<String>,
    model: Option<String>,
    pending_tools: BTreeMap<(u32, u32), PendingToolCall>,
    stats: DecoderStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl FrameDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding_line: false,
            next_seq: 0,
            finished: false,
            finish_reason: None,
            response_id: None,
            model: None,
            pending_tools: BTreeMap::new(),
            stats: DecoderStats::default(),
        }
    }

    /// Feeds raw bytes and returns every frame completed by them.
    ///
    /// Only the unterminated tail of the input is buffered; a line longer
    /// than `max_line_bytes` is dropped wherever the chunk boundaries fall.
    /// Input after the terminal sentinel is ignored.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ChunkFrame> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        self.stats.bytes += chunk.len() as u64;

        let mut rest = chunk;
        while let Some(newline) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(newline);
            rest = &tail[1..];
            if self.discarding_line {
                self.discarding_line = false;
                continue;
            }
            let length = self.buf.len() + line.len();
            if length > self.max_line_bytes {
                self.drop_oversized(length);
                continue;
            }
            self.buf.extend_from_slice(line);
            let mut line = std::mem::take(&mut self.buf);
            self.decode_line(&line, &mut frames);
            line.clear();
            self.buf = line;
            if self.finished {
                return frames;
            }
        }

        if !self.discarding_line && !rest.is_empty() {
            let length = self.buf.len() + rest.len();
            if length > self.max_line_bytes {
                self.drop_oversized(length);
                self.discarding_line = true;
            } else {
                self.buf.extend_from_slice(rest);
            }
        }
        frames
    }

    fn drop_oversized(&mut self, length: usize) {
        warn!(
            length,
            limit = self.max_line_bytes,
            "dropping oversized stream line"
        );
        self.buf.clear();
        self.stats.malformed += 1;
    }

    /// Decodes a trailing line left without a terminator when the body ends.
    pub fn finish_eof(&mut self) -> Vec<ChunkFrame> {
        let mut frames = Vec::new();
        if self.finished || self.buf.is_empty() {
            return frames;
        }
        let line = std::mem::take(&mut self.buf);
        if !self.discarding_line {
            self.decode_line(&line, &mut frames);
        }
        frames
    }

    /// True once the terminal sentinel has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn decode_line(&mut self, raw: &[u8], frames: &mut Vec<ChunkFrame>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if line.trim().is_empty() || line.starts_with(':') {
            return;
        }
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            // event:, id:, retry: fields carry nothing this protocol needs.
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }
        if payload == DONE_SENTINEL {
            self.flush_tools(None, frames);
            let finish_reason = self.finish_reason.clone();
            self.emit(frames, FramePayload::Event(StreamEvent::Terminal { finish_reason }));
            self.finished = true;
            return;
        }

        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                self.skip_malformed(&err.to_string());
                return;
            }
        };
        if let Some(error) = value.get("error").filter(|e| e.is_object()) {
            let field = |key: &str| error.get(key).and_then(|v| v.as_str()).map(ToOwned::to_owned);
            let upstream = UpstreamError {
                message: field("message").unwrap_or_else(|| "upstream stream error".into()),
                error_type: field("type"),
                code: field("code"),
            };
            self.emit(frames, FramePayload::UpstreamError(upstream));
            return;
        }
        match serde_json::from_value::<WireChunk>(value) {
            Ok(chunk) => self.decode_chunk(chunk, frames),
            Err(err) => self.skip_malformed(&err.to_string()),
        }
    }

    fn decode_chunk(&mut self, chunk: WireChunk, frames: &mut Vec<ChunkFrame>) {
        self.stats.frames += 1;
        if self.response_id.is_none() {
            self.response_id = chunk.id;
        }
        if self.model.is_none() {
            self.model = chunk.model;
        }

        for choice in chunk.choices {
            let delta = choice.delta.unwrap_or_default();
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                self.emit(
                    frames,
                    FramePayload::Event(StreamEvent::ContentDelta {
                        text,
                        index: choice.index,
                    }),
                );
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let pending = self.pending_tools.entry((choice.index, call.index)).or_default();
                if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                    pending.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                        pending.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        pending.arguments.push_str(&arguments);
                    }
                }
            }
            if let Some(result) = delta.tool_result {
                self.emit(
                    frames,
                    FramePayload::Event(StreamEvent::ToolResult {
                        id: result.tool_call_id,
                        payload: Value::from(result.content),
                        is_error: result.is_error,
                    }),
                );
            }
            if let Some(reason) = choice.finish_reason {
                self.flush_tools(Some(choice.index), frames);
                self.finish_reason = Some(reason);
            }
        }

        if let Some(usage) = chunk.usage {
            self.emit(frames, FramePayload::Event(StreamEvent::UsageSummary(usage)));
        }
    }

    fn flush_tools(&mut self, choice: Option<u32>, frames: &mut Vec<ChunkFrame>) {
        let keys: Vec<(u32, u32)> = self
            .pending_tools
            .keys()
            .copied()
            .filter(|(index, _)| choice.is_none_or(|c| c == *index))
            .collect();
        for key in keys {
            if let Some(call) = self.pending_tools.remove(&key) {
                self.emit(frames, FramePayload::Event(call.into_event()));
            }
        }
    }

    fn emit(&mut self, frames: &mut Vec<ChunkFrame>, payload: FramePayload) {
        debug!(seq = self.next_seq, "decoded frame");
        frames.push(ChunkFrame {
            seq: self.next_seq,
            payload,
        });
        self.next_seq += 1;
    }

    fn skip_malformed(&mut self, reason: &str) {
        self.stats.malformed += 1;
        warn!(reason, malformed = self.stats.malformed, "skipping malformed stream frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_STREAM: &str = concat!(
        ": heartbeat\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo \\u00e9\"},\"finish_reason\":null}]}\r\n\r\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"read\",\"arguments\":\"{\\\"pa\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"th\\\":\\\"a\\\"}\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":4,\"total_tokens\":7}}\n\n",
        "data: [DONE]\n\n",
    );

    fn events(frames: Vec<ChunkFrame>) -> Vec<FramePayload> {
        frames.into_iter().map(|f| f.payload).collect()
    }

    #[test]
    fn content_then_done_yields_delta_and_terminal() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.push(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\ndata: [DONE]\n",
        );
        assert_eq!(
            events(frames),
            vec![
                FramePayload::Event(StreamEvent::ContentDelta {
                    text: "Hi".into(),
                    index: 0
                }),
                FramePayload::Event(StreamEvent::Terminal {
                    finish_reason: None
                }),
            ]
        );
        assert!(decoder.is_finished());
        assert_eq!(decoder.stats().malformed, 0);
    }

    #[test]
    fn every_split_point_decodes_identically() {
        let bytes = VALID_STREAM.as_bytes();
        let whole = FrameDecoder::default().push(bytes);
        assert_eq!(whole.len(), 5);

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::default();
            let mut frames = decoder.push(&bytes[..split]);
            frames.extend(decoder.push(&bytes[split..]));
            assert_eq!(frames, whole, "split at byte {split}");
        }
    }

    #[test]
    fn many_small_pushes_match_single_push() {
        let bytes = VALID_STREAM.as_bytes();
        let whole = FrameDecoder::default().push(bytes);
        for step in [1, 2, 3, 7, 13] {
            let mut decoder = FrameDecoder::default();
            let frames: Vec<ChunkFrame> =
                bytes.chunks(step).flat_map(|piece| decoder.push(piece)).collect();
            assert_eq!(frames, whole, "chunk size {step}");
        }
    }

    #[test]
    fn tool_call_fragments_are_assembled_on_finish() {
        let frames = events(FrameDecoder::default().push(VALID_STREAM.as_bytes()));
        let mut args = BTreeMap::new();
        args.insert("path".to_string(), Value::String("a".into()));
        assert_eq!(
            frames[2],
            FramePayload::Event(StreamEvent::ToolInvocation {
                id: "call_1".into(),
                name: "read".into(),
                arguments: Value::Object(args),
            })
        );
        assert_eq!(
            frames[3],
            FramePayload::Event(StreamEvent::UsageSummary(Usage {
                prompt_tokens: 3,
                completion_tokens: 4,
                total_tokens: 7
            }))
        );
        assert_eq!(
            frames[4],
            FramePayload::Event(StreamEvent::Terminal {
                finish_reason: Some("tool_calls".into())
            })
        );
    }

    #[test]
    fn corrupted_line_between_valid_lines_is_skipped() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.push(concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"b\"}}]}\n",
        ).as_bytes());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].seq, 0);
        assert_eq!(frames[1].seq, 1);
        assert!(matches!(
            &frames[1].payload,
            FramePayload::Event(StreamEvent::ContentDelta { text, .. }) if text == "b"
        ));
        assert_eq!(decoder.stats().malformed, 1);
        assert_eq!(decoder.stats().frames, 2);
    }

    #[test]
    fn input_after_done_is_ignored() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.push(b"data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n");
        assert_eq!(frames.len(), 1);
        assert!(decoder.push(b"data: {\"choices\":[]}\n").is_empty());
    }

    #[test]
    fn upstream_error_object_is_reported() {
        let frames = events(FrameDecoder::default().push(
            b"data: {\"error\":{\"message\":\"Stream error: boom\",\"type\":\"error\",\"code\":\"stream_error\"}}\n\n",
        ));
        assert_eq!(
            frames,
            vec![FramePayload::UpstreamError(UpstreamError {
                message: "Stream error: boom".into(),
                error_type: Some("error".into()),
                code: Some("stream_error".into()),
            })]
        );
    }

    #[test]
    fn tool_result_delta_emits_immediately() {
        let frames = events(FrameDecoder::default().push(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_result\":{\"tool_call_id\":\"call_1\",\"content\":{\"ok\":true},\"is_error\":false}}}]}\n",
        ));
        assert!(matches!(
            &frames[0],
            FramePayload::Event(StreamEvent::ToolResult { id, is_error: false, payload })
                if id == "call_1" && payload.get("ok") == Some(&Value::Bool(true))
        ));
    }

    #[test]
    fn oversized_line_is_dropped_and_decoding_resumes() {
        let mut decoder = FrameDecoder::new(64);
        let long = format!("data: {}", "x".repeat(200));
        assert!(decoder.push(long.as_bytes()).is_empty());
        assert_eq!(decoder.stats().malformed, 1);
        let frames = decoder.push(b"tail\ndata: [DONE]\n");
        assert_eq!(frames.len(), 1);
        assert!(decoder.is_finished());
    }

    #[test]
    fn oversized_line_is_dropped_at_every_split_point() {
        let long = format!(
            "data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{}\"}}}}]}}\n",
            "y".repeat(100)
        );
        let input = format!("{long}data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"ok\"}}}}]}}\ndata: [DONE]\n");
        let bytes = input.as_bytes();

        let mut whole = FrameDecoder::new(96);
        let expected = whole.push(bytes);
        assert_eq!(whole.stats().malformed, 1);
        assert_eq!(
            events(expected.clone()),
            vec![
                FramePayload::Event(StreamEvent::ContentDelta {
                    text: "ok".into(),
                    index: 0
                }),
                FramePayload::Event(StreamEvent::Terminal {
                    finish_reason: None
                }),
            ]
        );

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new(96);
            let mut frames = decoder.push(&bytes[..split]);
            frames.extend(decoder.push(&bytes[split..]));
            assert_eq!(frames, expected, "split at byte {split}");
            assert_eq!(decoder.stats().malformed, 1, "split at byte {split}");
        }
    }

    #[test]
    fn trailing_line_without_newline_decodes_at_eof() {
        let mut decoder = FrameDecoder::default();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        let frames = decoder.finish_eof();
        assert_eq!(frames.len(), 1);
        assert!(decoder.is_finished());
    }
}
