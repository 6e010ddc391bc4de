//! Reconnection state machine and recovery strategy selection.
//!
//! The functions here are pure; [`RecoveryManager`] owns the single mutable
//! copy of the state and applies them inside its task.

mod manager;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use manager::{ConnectionReport, RecoveryHandle, RecoveryManager, RecoverySnapshot};

use crate::errors::{FailureKind, TransportErrorKind};
use crate::quality::{NetworkStrategy, QualityBucket};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    /// No frame has been received yet.
    #[default]
    Idle,
    Connected,
    Degraded,
    Disconnected,
    Recovering,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecoveryState::Idle => "idle",
            RecoveryState::Connected => "connected",
            RecoveryState::Degraded => "degraded",
            RecoveryState::Disconnected => "disconnected",
            RecoveryState::Recovering => "recovering",
        };
        f.write_str(label)
    }
}

/// Inputs that may move the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// A connection delivered its first decoded frame.
    FirstFrame,
    /// Degradation condition recomputed (bucket at or below poor, or a recent
    /// malformed frame).
    Quality { degraded: bool },
    /// Path unsatisfied, or the stream ended with an error before Terminal.
    TransportLost,
    RecoveryTriggered,
    /// A reconnect attempt failed while recovering.
    AttemptFailed,
    RetriesExhausted,
    /// The stream ended without a terminal event and will not be retried:
    /// cancelled, dropped by the caller, or failed fatally.
    Abandoned,
}

/// Applies `signal` to `state`. Signals that do not apply leave the state
/// unchanged.
pub fn transition(state: RecoveryState, signal: Signal) -> RecoveryState {
    use RecoveryState::*;
    match (state, signal) {
        (Idle | Disconnected | Recovering | Connected, Signal::FirstFrame) => Connected,
        (Degraded, Signal::FirstFrame) => Degraded,
        (Connected, Signal::Quality { degraded: true }) => Degraded,
        (Degraded, Signal::Quality { degraded: false }) => Connected,
        (Idle | Connected | Degraded, Signal::TransportLost) => Disconnected,
        (Recovering, Signal::TransportLost | Signal::AttemptFailed) => Recovering,
        (Disconnected, Signal::RecoveryTriggered) => Recovering,
        (Recovering | Disconnected, Signal::RetriesExhausted) => Disconnected,
        (_, Signal::Abandoned) => Disconnected,
        (state, _) => state,
    }
}

/// How the next reconnect attempt is made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ImmediateRetry,
    ExponentialBackoff,
    /// Block until the published bucket reaches `min`.
    WaitForQuality { min: QualityBucket },
    /// Prefer an alternate interface for the next attempt.
    SwitchNetwork,
    /// Stop retrying; the caller works from local data.
    OfflineMode,
}

/// Inputs to [`select_strategy`].
#[derive(Clone, Copy, Debug)]
pub struct StrategyInputs {
    pub network: NetworkStrategy,
    pub bucket: Option<QualityBucket>,
    pub failure: FailureKind,
    pub alternate_available: bool,
    /// Zero-based attempt that just failed.
    pub attempt: u32,
    pub has_retry_hint: bool,
}

pub fn select_strategy(inputs: &StrategyInputs) -> RecoveryStrategy {
    if inputs.network == NetworkStrategy::Offline {
        return RecoveryStrategy::OfflineMode;
    }
    match inputs.failure {
        FailureKind::Transport {
            kind: TransportErrorKind::Tls,
        } => {
            return if inputs.alternate_available {
                RecoveryStrategy::SwitchNetwork
            } else {
                RecoveryStrategy::ExponentialBackoff
            };
        }
        FailureKind::Transport {
            kind: TransportErrorKind::PathUnsatisfied,
        } => {
            return if inputs.alternate_available {
                RecoveryStrategy::SwitchNetwork
            } else {
                RecoveryStrategy::WaitForQuality {
                    min: QualityBucket::Fair,
                }
            };
        }
        _ => {}
    }
    let poor = inputs
        .bucket
        .is_some_and(|bucket| bucket <= QualityBucket::Poor);
    match inputs.network {
        NetworkStrategy::Conservative if poor => RecoveryStrategy::WaitForQuality {
            min: QualityBucket::Fair,
        },
        NetworkStrategy::Aggressive if inputs.attempt == 0 && !inputs.has_retry_hint => {
            RecoveryStrategy::ImmediateRetry
        }
        _ => RecoveryStrategy::ExponentialBackoff,
    }
}

/// What the stream client should do after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry { delay: Duration },
    /// Wait for the bucket to reach `min` (at most `timeout`), then retry.
    WaitForQuality {
        min: QualityBucket,
        timeout: Duration,
    },
    /// Ask the transport for its alternate path, then retry after `delay`.
    SwitchNetwork { delay: Duration },
    /// Non-retryable failure or attempts exhausted.
    GiveUp,
    /// Network unusable; end the stream with an offline failure.
    Offline,
}

impl RecoveryAction {
    pub fn is_retry(&self) -> bool {
        !matches!(self, RecoveryAction::GiveUp | RecoveryAction::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::RecoveryState::*;

    fn run(signals: &[Signal]) -> RecoveryState {
        signals.iter().fold(Idle, |state, signal| transition(state, *signal))
    }

    #[test]
    fn reconnect_sequence_ends_connected() {
        let end = run(&[
            Signal::FirstFrame,
            Signal::TransportLost,
            Signal::RecoveryTriggered,
            Signal::FirstFrame,
        ]);
        assert_eq!(end, Connected);
    }

    #[test]
    fn exhausted_recovery_ends_disconnected() {
        let end = run(&[
            Signal::FirstFrame,
            Signal::TransportLost,
            Signal::RecoveryTriggered,
            Signal::AttemptFailed,
            Signal::AttemptFailed,
            Signal::RetriesExhausted,
        ]);
        assert_eq!(end, Disconnected);
    }

    #[test]
    fn quality_moves_between_connected_and_degraded_only() {
        assert_eq!(transition(Connected, Signal::Quality { degraded: true }), Degraded);
        assert_eq!(transition(Degraded, Signal::Quality { degraded: false }), Connected);
        assert_eq!(transition(Idle, Signal::Quality { degraded: true }), Idle);
        assert_eq!(
            transition(Recovering, Signal::Quality { degraded: false }),
            Recovering
        );
        assert_eq!(transition(Degraded, Signal::TransportLost), Disconnected);
    }

    #[test]
    fn abandoning_a_stream_always_disconnects() {
        for state in [Idle, Connected, Degraded, Disconnected, Recovering] {
            assert_eq!(transition(state, Signal::Abandoned), Disconnected);
        }
    }

    #[test]
    fn idle_failure_disconnects_and_recovery_needs_a_trigger() {
        assert_eq!(transition(Idle, Signal::TransportLost), Disconnected);
        assert_eq!(transition(Connected, Signal::RecoveryTriggered), Connected);
    }

    fn inputs(network: NetworkStrategy, failure: FailureKind) -> StrategyInputs {
        StrategyInputs {
            network,
            bucket: Some(QualityBucket::Good),
            failure,
            alternate_available: false,
            attempt: 0,
            has_retry_hint: false,
        }
    }

    #[test]
    fn tls_failures_prefer_switching_networks() {
        let tls = FailureKind::Transport {
            kind: TransportErrorKind::Tls,
        };
        let mut with_alternate = inputs(NetworkStrategy::Aggressive, tls);
        with_alternate.alternate_available = true;
        assert_eq!(select_strategy(&with_alternate), RecoveryStrategy::SwitchNetwork);
        assert_eq!(
            select_strategy(&inputs(NetworkStrategy::Aggressive, tls)),
            RecoveryStrategy::ExponentialBackoff
        );
    }

    #[test]
    fn strategy_follows_network_conditions() {
        let reset = FailureKind::Transport {
            kind: TransportErrorKind::Reset,
        };
        assert_eq!(
            select_strategy(&inputs(NetworkStrategy::Offline, reset)),
            RecoveryStrategy::OfflineMode
        );
        assert_eq!(
            select_strategy(&inputs(NetworkStrategy::Aggressive, reset)),
            RecoveryStrategy::ImmediateRetry
        );
        assert_eq!(
            select_strategy(&inputs(NetworkStrategy::Standard, reset)),
            RecoveryStrategy::ExponentialBackoff
        );

        let mut poor = inputs(NetworkStrategy::Conservative, reset);
        poor.bucket = Some(QualityBucket::Poor);
        assert_eq!(
            select_strategy(&poor),
            RecoveryStrategy::WaitForQuality {
                min: QualityBucket::Fair
            }
        );

        let mut hinted = inputs(NetworkStrategy::Aggressive, FailureKind::ServerStatus { status: 429 });
        hinted.has_retry_hint = true;
        assert_eq!(select_strategy(&hinted), RecoveryStrategy::ExponentialBackoff);
    }
}
