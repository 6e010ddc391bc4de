use serde::{Deserialize, Serialize};

use crate::errors::StreamFailure;
use crate::value::Value;

/// Token accounting reported by the upstream `usage` object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Caller-facing event yielded by an `EventStream`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text for choice `index`.
    ContentDelta { text: String, index: u32 },
    /// A complete tool call assembled from streamed fragments.
    ToolInvocation {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Output of a tool executed upstream.
    ToolResult {
        id: String,
        payload: Value,
        is_error: bool,
    },
    UsageSummary(Usage),
    /// Frame sequence numbering restarted because a new connection was opened.
    Discontinuity { connection: u32 },
    /// The terminal sentinel was received; nothing follows.
    Terminal { finish_reason: Option<String> },
    /// Terminal failure; nothing follows.
    Failed(StreamFailure),
}

impl StreamEvent {
    /// True for the two variants that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Terminal { .. } | StreamEvent::Failed(_))
    }
}
