use std::fmt;

use serde::{Deserialize, Serialize};

/// Low-level reason a transport call or body read failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// TCP connect refused or unreachable.
    Connect,
    /// Name resolution failed.
    Dns,
    /// TLS or protocol handshake failed.
    Tls,
    /// Connection reset or closed mid-body.
    Reset,
    /// Connect, response-head, or read deadline elapsed.
    Timeout,
    /// The OS reports no usable network path.
    PathUnsatisfied,
    /// Any other I/O failure.
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connect => "connect",
            Self::Dns => "dns",
            Self::Tls => "tls",
            Self::Reset => "reset",
            Self::Timeout => "timeout",
            Self::PathUnsatisfied => "path_unsatisfied",
            Self::Io => "io",
        };
        f.write_str(label)
    }
}

/// Error returned by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} transport error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn reset(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Reset, message)
    }
}

/// Classification of a failed attempt, used for retry decisions and for the
/// terminal failure handed to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection reset, timeout, DNS failure and friends.
    Transport { kind: TransportErrorKind },
    /// 5xx, 429 or 408.
    ServerStatus { status: u16 },
    /// Any other 4xx; never retried.
    ClientStatus { status: u16 },
    /// 1xx, 3xx (including 304) or an out-of-range code: nothing a stream can
    /// be read from. Never retried.
    UnexpectedStatus { status: u16 },
    /// The body closed before the terminal sentinel arrived.
    ProtocolViolation,
    /// The upstream sent an error object inside the event stream.
    Upstream,
    /// The network is unusable and recovery chose offline mode.
    Offline,
    /// An interceptor rejected the outbound request.
    Rejected,
    /// The caller cancelled the stream.
    Cancelled,
}

impl FailureKind {
    /// Classifies a non-2xx HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 429 | 500..=599 => Self::ServerStatus { status },
            400..=499 => Self::ClientStatus { status },
            _ => Self::UnexpectedStatus { status },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServerStatus { status }
            | Self::ClientStatus { status }
            | Self::UnexpectedStatus { status } => Some(*status),
            _ => None,
        }
    }

    /// Short stable label, used in logs and error records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::ServerStatus { .. } => "server_status",
            Self::ClientStatus { .. } => "client_status",
            Self::UnexpectedStatus { .. } => "unexpected_status",
            Self::ProtocolViolation => "protocol_violation",
            Self::Upstream => "upstream",
            Self::Offline => "offline",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<TransportErrorKind> for FailureKind {
    fn from(kind: TransportErrorKind) -> Self {
        FailureKind::Transport { kind }
    }
}

/// Terminal, caller-visible failure.
///
/// Delivered once as the final `StreamEvent::Failed` item and returned from
/// `EventStream::finish`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("stream failed ({}) after {attempts} attempt(s): {message}", .kind.label())]
pub struct StreamFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Last HTTP status observed across attempts, if any.
    pub last_status: Option<u16>,
    pub attempts: u32,
}

impl StreamFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            last_status: kind.status(),
            attempts,
        }
    }

    pub fn with_last_status(mut self, status: Option<u16>) -> Self {
        if self.last_status.is_none() {
            self.last_status = status;
        }
        self
    }

    pub fn cancelled(attempts: u32) -> Self {
        Self::new(FailureKind::Cancelled, "stream cancelled by caller", attempts)
    }

    /// Whether re-issuing the whole operation later could reasonably succeed.
    pub fn is_retryable_by_caller(&self) -> bool {
        !matches!(
            self.kind,
            FailureKind::ClientStatus { .. }
                | FailureKind::UnexpectedStatus { .. }
                | FailureKind::Rejected
                | FailureKind::Cancelled
        )
    }
}

/// Errors raised before a stream is established (builder, config, services).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid request input.
    #[error("validation error: {0}")]
    Validation(String),
    /// A background service task has already shut down.
    #[error("service stopped: {0}")]
    ServiceStopped(&'static str),
    /// Terminal failure of a started stream.
    #[error(transparent)]
    Stream(StreamFailure),
}

impl From<StreamFailure> for ClientError {
    fn from(value: StreamFailure) -> Self {
        ClientError::Stream(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_splits_server_and_client() {
        assert_eq!(
            FailureKind::from_status(503),
            FailureKind::ServerStatus { status: 503 }
        );
        assert_eq!(
            FailureKind::from_status(429),
            FailureKind::ServerStatus { status: 429 }
        );
        assert_eq!(
            FailureKind::from_status(408),
            FailureKind::ServerStatus { status: 408 }
        );
        assert_eq!(
            FailureKind::from_status(401),
            FailureKind::ClientStatus { status: 401 }
        );
    }

    #[test]
    fn non_error_statuses_are_unexpected() {
        for status in [100, 204, 301, 304, 600] {
            let kind = FailureKind::from_status(status);
            assert_eq!(kind, FailureKind::UnexpectedStatus { status });
            assert_eq!(kind.status(), Some(status));
        }
        let failure = StreamFailure::new(FailureKind::from_status(304), "HTTP 304", 1);
        assert_eq!(failure.last_status, Some(304));
        assert!(!failure.is_retryable_by_caller());
    }

    #[test]
    fn failure_carries_status_and_caller_hint() {
        let failure = StreamFailure::new(FailureKind::from_status(404), "not found", 1);
        assert_eq!(failure.last_status, Some(404));
        assert!(!failure.is_retryable_by_caller());

        let failure = StreamFailure::new(
            FailureKind::Transport {
                kind: TransportErrorKind::Reset,
            },
            "reset",
            4,
        )
        .with_last_status(Some(503));
        assert_eq!(failure.last_status, Some(503));
        assert!(failure.is_retryable_by_caller());
        assert!(failure.to_string().contains("after 4 attempt(s)"));
    }
}
