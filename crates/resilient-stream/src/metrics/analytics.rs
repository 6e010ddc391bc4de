//! Pure aggregation helpers used by the collector task.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::quality::{ConnectionQualitySample, QualityBucket};

use super::{Anomaly, AnomalyKind, AnomalySeverity, ErrorRecord};

/// Samples compared against the latest one for anomaly detection.
pub const SHORT_TERM_WINDOW: usize = 10;
/// Samples used for the bandwidth trend.
pub const TREND_WINDOW: usize = 20;
/// Packet loss above this percentage is anomalous on its own.
pub const LOSS_THRESHOLD_PCT: f64 = 5.0;

/// Least-squares slope of `values` against their index. Zero for fewer than
/// two points.
pub fn linear_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Compares `latest` against the average of `baseline`.
pub fn detect_anomalies(
    latest: &ConnectionQualitySample,
    baseline: &[ConnectionQualitySample],
) -> Vec<Anomaly> {
    let mut found = Vec::new();

    if latest.packet_loss_pct > LOSS_THRESHOLD_PCT {
        let severity = match latest.packet_loss_pct {
            p if p > 20.0 => AnomalySeverity::Critical,
            p if p > 10.0 => AnomalySeverity::High,
            _ => AnomalySeverity::Medium,
        };
        found.push(Anomaly::new(
            AnomalyKind::PacketLoss,
            severity,
            latest.packet_loss_pct,
            LOSS_THRESHOLD_PCT,
        ));
    }

    if baseline.is_empty() {
        return found;
    }
    let n = baseline.len() as f64;
    let avg_bandwidth = baseline.iter().map(|s| s.bandwidth_mbps).sum::<f64>() / n;
    let avg_latency = baseline.iter().map(|s| s.latency_ms).sum::<f64>() / n;

    if avg_bandwidth > 0.0 && latest.bandwidth_mbps < avg_bandwidth * 0.5 {
        let ratio = latest.bandwidth_mbps / avg_bandwidth;
        let severity = if ratio < 0.1 {
            AnomalySeverity::Critical
        } else if ratio < 0.25 {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Medium
        };
        found.push(Anomaly::new(
            AnomalyKind::BandwidthDrop,
            severity,
            latest.bandwidth_mbps,
            avg_bandwidth,
        ));
    }

    if avg_latency > 0.0 && latest.latency_ms >= avg_latency * 2.0 {
        let severity = if latest.latency_ms >= avg_latency * 4.0 {
            AnomalySeverity::High
        } else {
            AnomalySeverity::Medium
        };
        found.push(Anomaly::new(
            AnomalyKind::LatencySpike,
            severity,
            latest.latency_ms,
            avg_latency,
        ));
    }

    found
}

/// Share of samples whose bucket is better than unusable, as a percentage.
pub fn uptime_pct(buckets: impl Iterator<Item = Option<QualityBucket>>) -> f64 {
    let (mut up, mut total) = (0usize, 0usize);
    for bucket in buckets {
        total += 1;
        if bucket != Some(QualityBucket::Unusable) {
            up += 1;
        }
    }
    if total == 0 {
        100.0
    } else {
        up as f64 / total as f64 * 100.0
    }
}

/// Errors recorded within `window` before `now`.
pub fn errors_within(errors: &[&ErrorRecord], now: DateTime<Utc>, window: ChronoDuration) -> usize {
    errors
        .iter()
        .filter(|e| e.timestamp <= now && now - e.timestamp <= window)
        .count()
}

/// Error counts per five-minute bucket over the last hour, oldest first.
pub fn error_series(errors: &[&ErrorRecord], now: DateTime<Utc>) -> Vec<f64> {
    const BUCKETS: i64 = 12;
    let width = ChronoDuration::minutes(5);
    let mut series = vec![0.0; BUCKETS as usize];
    for error in errors {
        let age = now - error.timestamp;
        if age < ChronoDuration::zero() {
            continue;
        }
        let slot = age.num_seconds() / width.num_seconds();
        if slot < BUCKETS {
            series[(BUCKETS - 1 - slot) as usize] += 1.0;
        }
    }
    series
}
