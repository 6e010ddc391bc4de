use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ClientError;

const ENV_PREFIX: &str = "RESILIENT_STREAM_";

/// Tunables shared by the stream client and its background services.
///
/// Every field has a serde default so partial config files deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Total attempts per stream (first attempt included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff base before jitter.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a computed backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Deadline for connect plus response head.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Maximum silence between two body chunks.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,
    #[serde(default = "default_quality_history_cap")]
    pub quality_history_cap: usize,
    /// Number of most recent samples averaged into a quality score.
    #[serde(default = "default_score_window")]
    pub score_window: usize,
    #[serde(default = "default_metrics_window")]
    pub metrics_window: usize,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
    #[serde(default = "default_error_history_cap")]
    pub error_history_cap: usize,
    /// Longest line the frame decoder buffers before dropping it.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_quality_wait_timeout_ms")]
    pub quality_wait_timeout_ms: u64,
    /// How long a malformed frame keeps the connection marked degraded.
    #[serde(default = "default_degraded_window_ms")]
    pub degraded_window_ms: u64,
    /// Endpoints probed for latency and loss.
    #[serde(default = "default_reference_endpoints")]
    pub reference_endpoints: Vec<String>,
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_attempt_timeout_ms() -> u64 {
    30_000
}

const fn default_read_timeout_ms() -> u64 {
    60_000
}

const fn default_sampling_interval_ms() -> u64 {
    5_000
}

const fn default_quality_history_cap() -> usize {
    1_000
}

const fn default_score_window() -> usize {
    5
}

const fn default_metrics_window() -> usize {
    1_000
}

const fn default_metrics_interval_ms() -> u64 {
    60_000
}

const fn default_error_history_cap() -> usize {
    200
}

const fn default_max_line_bytes() -> usize {
    1024 * 1024
}

const fn default_quality_wait_timeout_ms() -> u64 {
    30_000
}

const fn default_degraded_window_ms() -> u64 {
    30_000
}

fn default_reference_endpoints() -> Vec<String> {
    vec![
        "https://www.gstatic.com/generate_204".to_string(),
        "https://cloudflare.com/cdn-cgi/trace".to_string(),
    ]
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            sampling_interval_ms: default_sampling_interval_ms(),
            quality_history_cap: default_quality_history_cap(),
            score_window: default_score_window(),
            metrics_window: default_metrics_window(),
            metrics_interval_ms: default_metrics_interval_ms(),
            error_history_cap: default_error_history_cap(),
            max_line_bytes: default_max_line_bytes(),
            quality_wait_timeout_ms: default_quality_wait_timeout_ms(),
            degraded_window_ms: default_degraded_window_ms(),
            reference_endpoints: default_reference_endpoints(),
        }
    }
}

impl ResilienceConfig {
    /// Builds a config from defaults overridden by `RESILIENT_STREAM_*`
    /// variables (for example `RESILIENT_STREAM_MAX_ATTEMPTS=5`).
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ClientError> {
        let mut config = Self::default();
        let read = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(raw) = read("MAX_ATTEMPTS") {
            config.max_attempts = parse_number(&raw, "MAX_ATTEMPTS")?;
        }
        if let Some(raw) = read("BASE_DELAY_MS") {
            config.base_delay_ms = parse_number(&raw, "BASE_DELAY_MS")?;
        }
        if let Some(raw) = read("MAX_DELAY_MS") {
            config.max_delay_ms = parse_number(&raw, "MAX_DELAY_MS")?;
        }
        if let Some(raw) = read("ATTEMPT_TIMEOUT_MS") {
            config.attempt_timeout_ms = parse_number(&raw, "ATTEMPT_TIMEOUT_MS")?;
        }
        if let Some(raw) = read("READ_TIMEOUT_MS") {
            config.read_timeout_ms = parse_number(&raw, "READ_TIMEOUT_MS")?;
        }
        if let Some(raw) = read("SAMPLING_INTERVAL_MS") {
            config.sampling_interval_ms = parse_number(&raw, "SAMPLING_INTERVAL_MS")?;
        }
        if let Some(raw) = read("METRICS_WINDOW") {
            config.metrics_window = parse_number(&raw, "METRICS_WINDOW")?;
        }
        if let Some(raw) = read("METRICS_INTERVAL_MS") {
            config.metrics_interval_ms = parse_number(&raw, "METRICS_INTERVAL_MS")?;
        }
        if let Some(raw) = read("REFERENCE_ENDPOINTS") {
            config.reference_endpoints = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the services cannot run with.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.max_attempts == 0 {
            return Err(ClientError::Config("max_attempts must be at least 1".into()));
        }
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(ClientError::Config(
                "backoff requires 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }
        if self.sampling_interval_ms == 0 || self.metrics_interval_ms == 0 {
            return Err(ClientError::Config(
                "sampling and metrics intervals must be greater than 0".into(),
            ));
        }
        if self.quality_history_cap == 0 || self.metrics_window == 0 || self.score_window == 0 {
            return Err(ClientError::Config(
                "history caps and windows must be greater than 0".into(),
            ));
        }
        if self.max_line_bytes < 64 {
            return Err(ClientError::Config("max_line_bytes must be at least 64".into()));
        }
        Ok(())
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = duration_ms(base);
        self.max_delay_ms = duration_ms(max);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval_ms = duration_ms(interval);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval_ms = duration_ms(interval);
        self
    }

    pub fn metrics_window(mut self, window: usize) -> Self {
        self.metrics_window = window;
        self
    }

    pub fn quality_wait_timeout(mut self, timeout: Duration) -> Self {
        self.quality_wait_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn read_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn sampling_interval_duration(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn metrics_interval_duration(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn quality_wait_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.quality_wait_timeout_ms)
    }

    pub fn degraded_window(&self) -> Duration {
        Duration::from_millis(self.degraded_window_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T, ClientError> {
    raw.trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("{ENV_PREFIX}{name} is not a valid number: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = ResilienceConfig::default();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.sampling_interval_ms, 5_000);
        assert_eq!(config.metrics_window, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_field_defaults() {
        let config: ResilienceConfig =
            serde_json::from_str(r#"{"max_attempts": 2, "base_delay_ms": 10}"#).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.base_delay_ms, 10);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn env_lookup_overrides_and_validates() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("RESILIENT_STREAM_MAX_ATTEMPTS", "6"),
            ("RESILIENT_STREAM_REFERENCE_ENDPOINTS", "https://a.test, https://b.test,"),
        ]);
        let config =
            ResilienceConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.max_attempts, 6);
        assert_eq!(config.reference_endpoints, vec!["https://a.test", "https://b.test"]);

        let err = ResilienceConfig::from_lookup(|key| {
            (key == "RESILIENT_STREAM_MAX_ATTEMPTS").then(|| "zero".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ClientError::Config(msg) if msg.contains("MAX_ATTEMPTS")));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let config = ResilienceConfig::default()
            .backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert!(config.validate().is_err());
    }
}
