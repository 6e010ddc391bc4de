use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{FailureKind, TransportErrorKind};
use crate::quality::NetworkStrategy;

/// What happened on an attempt, as far as retrying is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Connect, DNS, reset, timeout or any other transport-level failure.
    Transport(TransportErrorKind),
    /// An HTTP status, with the server's retry hint if it sent one.
    Status {
        code: u16,
        retry_after: Option<Duration>,
    },
    /// Body ended without the terminal sentinel.
    ProtocolViolation,
}

impl Outcome {
    pub fn status(code: u16) -> Self {
        Outcome::Status {
            code,
            retry_after: None,
        }
    }

    /// Maps a failure classification onto a retry outcome. Failures that are
    /// never worth retrying (cancel, rejection, upstream error, offline) map to
    /// `None`.
    pub fn from_failure(kind: FailureKind, retry_after: Option<Duration>) -> Option<Self> {
        match kind {
            FailureKind::Transport { kind } => Some(Outcome::Transport(kind)),
            FailureKind::ServerStatus { status }
            | FailureKind::ClientStatus { status }
            | FailureKind::UnexpectedStatus { status } => {
                Some(Outcome::Status {
                    code: status,
                    retry_after,
                })
            }
            FailureKind::ProtocolViolation => Some(Outcome::ProtocolViolation),
            FailureKind::Upstream
            | FailureKind::Offline
            | FailureKind::Rejected
            | FailureKind::Cancelled => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub const fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    pub const fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        let base_delay_ms = (base_delay.as_millis() as u64).max(1);
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms: (max_delay.as_millis() as u64).max(base_delay_ms),
        }
    }

    pub fn from_config(config: &crate::config::ResilienceConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    /// Adjusts aggressiveness to the current network strategy.
    pub fn for_strategy(&self, strategy: NetworkStrategy) -> Self {
        match strategy {
            NetworkStrategy::Aggressive => Self {
                max_attempts: self.max_attempts.saturating_add(1),
                base_delay_ms: (self.base_delay_ms / 2).max(1),
                max_delay_ms: self.max_delay_ms,
            },
            NetworkStrategy::Standard => self.clone(),
            NetworkStrategy::Conservative => Self {
                max_attempts: self.max_attempts,
                base_delay_ms: self.base_delay_ms.saturating_mul(2).min(self.max_delay_ms),
                max_delay_ms: self.max_delay_ms,
            },
            NetworkStrategy::Offline => Self {
                max_attempts: 0,
                ..self.clone()
            },
        }
    }

    /// Upper bound of the jitter window for `attempt`: `min(max, base * 2^attempt)`.
    pub fn backoff_cap(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let cap = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(cap.max(1))
    }

    /// Decides whether attempt `attempt` (zero-based, the one that just
    /// failed) should be followed by another, and after how long.
    pub fn decide(&self, attempt: u32, outcome: &Outcome) -> RetryDecision {
        self.decide_with(attempt, outcome, &mut rand::rng())
    }

    /// `decide` with a caller-supplied RNG, for deterministic tests.
    pub fn decide_with<R: Rng>(
        &self,
        attempt: u32,
        outcome: &Outcome,
        rng: &mut R,
    ) -> RetryDecision {
        if !is_retryable(outcome) {
            return RetryDecision::give_up();
        }
        if attempt.saturating_add(1) >= self.max_attempts {
            return RetryDecision::give_up();
        }
        if let Outcome::Status {
            code: 429,
            retry_after: Some(hint),
        } = outcome
        {
            return RetryDecision::after(*hint);
        }
        let cap = self.backoff_cap(attempt).as_millis() as u64;
        RetryDecision::after(Duration::from_millis(rng.random_range(1..=cap)))
    }
}

/// Retryable family: transport failures, protocol violations, 5xx, 429, 408.
pub fn is_retryable(outcome: &Outcome) -> bool {
    match outcome {
        Outcome::Transport(_) | Outcome::ProtocolViolation => true,
        Outcome::Status { code, .. } => matches!(code, 408 | 429 | 500..=599),
    }
}

/// Longest server retry hint that is honoured; larger hints are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Parses a `Retry-After` value given either as delta-seconds or HTTP-date.
///
/// The result never exceeds [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    let hint = if let Ok(seconds) = value.parse::<u64>() {
        Duration::from_secs(seconds)
    } else if let Ok(seconds) = value.parse::<f64>() {
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(MAX_RETRY_AFTER)
    } else {
        let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
        let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
        delta.to_std().unwrap_or(Duration::ZERO)
    };
    Some(hint.min(MAX_RETRY_AFTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_secs(2))
    }

    #[test]
    fn server_error_on_first_attempt_retries_within_cap() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let decision = policy().decide_with(0, &Outcome::status(503), &mut rng);
            assert!(decision.retry);
            assert!(decision.delay > Duration::ZERO);
            assert!(decision.delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn exhausted_attempts_stop_retrying() {
        let p = policy();
        assert!(!p.decide(p.max_attempts, &Outcome::status(503)).retry);
        assert!(!p.decide(p.max_attempts - 1, &Outcome::status(503)).retry);
        assert!(p.decide(p.max_attempts - 2, &Outcome::status(503)).retry);
    }

    #[test]
    fn client_errors_never_retry() {
        let p = policy();
        for attempt in 0..4 {
            assert_eq!(p.decide(attempt, &Outcome::status(404)), RetryDecision::give_up());
            assert!(!p.decide(attempt, &Outcome::status(401)).retry);
        }
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let decision = policy().decide(
            0,
            &Outcome::Status {
                code: 429,
                retry_after: Some(Duration::from_secs(2)),
            },
        );
        assert_eq!(decision, RetryDecision::after(Duration::from_secs(2)));
    }

    #[test]
    fn timeouts_and_request_timeout_status_are_retryable() {
        assert!(is_retryable(&Outcome::Transport(TransportErrorKind::Timeout)));
        assert!(is_retryable(&Outcome::status(408)));
        assert!(is_retryable(&Outcome::ProtocolViolation));
        assert!(!is_retryable(&Outcome::status(200)));
    }

    #[test]
    fn backoff_cap_grows_then_clamps() {
        let p = policy();
        assert_eq!(p.backoff_cap(0), Duration::from_millis(100));
        assert_eq!(p.backoff_cap(3), Duration::from_millis(800));
        assert_eq!(p.backoff_cap(10), Duration::from_secs(2));
        assert_eq!(p.backoff_cap(60), Duration::from_secs(2));
    }

    #[test]
    fn strategy_scaling() {
        let p = policy();
        assert_eq!(p.for_strategy(NetworkStrategy::Aggressive).max_attempts, 5);
        assert_eq!(p.for_strategy(NetworkStrategy::Aggressive).base_delay_ms, 50);
        assert_eq!(p.for_strategy(NetworkStrategy::Conservative).base_delay_ms, 200);
        assert!(!p
            .for_strategy(NetworkStrategy::Offline)
            .decide(0, &Outcome::status(503))
            .retry);
    }

    #[test]
    fn retry_after_parses_seconds_and_dates() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn oversized_retry_after_is_clamped() {
        assert_eq!(parse_retry_after("1e30"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("18446744073709551615"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("-3"), None);
        assert_eq!(parse_retry_after("NaN"), None);
    }
}
