//! Connection quality sampling, scoring and strategy derivation.

mod monitor;
mod probe;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use monitor::{QualityMonitor, QualityMonitorHandle, QualitySnapshot};
pub use probe::{HttpProbe, NetworkProbe, PathAttributes};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellularGeneration {
    G2,
    G3,
    G4,
    G5,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "generation", rename_all = "snake_case")]
pub enum ConnectionKind {
    Wifi,
    Cellular(CellularGeneration),
    Ethernet,
    Other,
    /// No interface is up.
    None,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Wifi => f.write_str("wifi"),
            ConnectionKind::Cellular(CellularGeneration::G2) => f.write_str("cellular-2g"),
            ConnectionKind::Cellular(CellularGeneration::G3) => f.write_str("cellular-3g"),
            ConnectionKind::Cellular(CellularGeneration::G4) => f.write_str("cellular-4g"),
            ConnectionKind::Cellular(CellularGeneration::G5) => f.write_str("cellular-5g"),
            ConnectionKind::Cellular(CellularGeneration::Unknown) => f.write_str("cellular"),
            ConnectionKind::Ethernet => f.write_str("ethernet"),
            ConnectionKind::Other => f.write_str("other"),
            ConnectionKind::None => f.write_str("none"),
        }
    }
}

/// Current network path as classified from transport attributes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSnapshot {
    pub satisfied: bool,
    pub kind: ConnectionKind,
    /// Cost-sensitive (metered) connection.
    pub metered: bool,
    /// Low-data mode or similar user constraint.
    pub constrained: bool,
    /// Another interface could carry traffic if the current one fails.
    pub alternate_available: bool,
}

impl Default for PathSnapshot {
    fn default() -> Self {
        Self {
            satisfied: true,
            kind: ConnectionKind::Other,
            metered: false,
            constrained: false,
            alternate_available: false,
        }
    }
}

/// One measurement of the connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQualitySample {
    pub timestamp: DateTime<Utc>,
    pub kind: ConnectionKind,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    /// Percent, so `0.05` means 0.05 %.
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
}

impl ConnectionQualitySample {
    pub fn new(
        kind: ConnectionKind,
        bandwidth_mbps: f64,
        latency_ms: f64,
        packet_loss_pct: f64,
        jitter_ms: f64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            bandwidth_mbps,
            latency_ms,
            packet_loss_pct,
            jitter_ms,
        }
    }
}

/// Five-level quality classification, ordered worst to best.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBucket {
    Unusable,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityBucket {
    pub fn from_score(overall: u8) -> Self {
        match overall {
            80..=u8::MAX => QualityBucket::Excellent,
            60..=79 => QualityBucket::Good,
            40..=59 => QualityBucket::Fair,
            20..=39 => QualityBucket::Poor,
            _ => QualityBucket::Unusable,
        }
    }
}

impl fmt::Display for QualityBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QualityBucket::Unusable => "unusable",
            QualityBucket::Poor => "poor",
            QualityBucket::Fair => "fair",
            QualityBucket::Good => "good",
            QualityBucket::Excellent => "excellent",
        };
        f.write_str(label)
    }
}

/// Derived score; never stored as authoritative state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityScore {
    pub overall: u8,
    /// Loss and jitter points (max 30).
    pub stability: u8,
    /// Bandwidth and latency points (max 70).
    pub performance: u8,
    pub bucket: QualityBucket,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStrategy {
    Aggressive,
    Standard,
    Conservative,
    Offline,
}

impl NetworkStrategy {
    pub fn derive(bucket: Option<QualityBucket>, path: &PathSnapshot) -> Self {
        match bucket {
            Some(QualityBucket::Unusable) if !path.satisfied => NetworkStrategy::Offline,
            None if !path.satisfied => NetworkStrategy::Offline,
            Some(QualityBucket::Excellent) if !path.metered => NetworkStrategy::Aggressive,
            Some(QualityBucket::Poor | QualityBucket::Unusable) => NetworkStrategy::Conservative,
            _ => NetworkStrategy::Standard,
        }
    }

    /// Event channel capacity used by the stream client.
    pub fn buffer_capacity(self) -> usize {
        match self {
            NetworkStrategy::Aggressive => 256,
            NetworkStrategy::Standard => 128,
            NetworkStrategy::Conservative => 32,
            NetworkStrategy::Offline => 16,
        }
    }
}

impl fmt::Display for NetworkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NetworkStrategy::Aggressive => "aggressive",
            NetworkStrategy::Standard => "standard",
            NetworkStrategy::Conservative => "conservative",
            NetworkStrategy::Offline => "offline",
        };
        f.write_str(label)
    }
}

fn bandwidth_points(mbps: f64) -> u8 {
    match mbps {
        m if m >= 100.0 => 40,
        m if m >= 50.0 => 35,
        m if m >= 25.0 => 30,
        m if m >= 10.0 => 20,
        m if m >= 5.0 => 10,
        _ => 5,
    }
}

fn latency_points(ms: f64) -> u8 {
    match ms {
        l if l <= 20.0 => 30,
        l if l <= 50.0 => 25,
        l if l <= 100.0 => 20,
        l if l <= 150.0 => 15,
        l if l <= 200.0 => 10,
        _ => 5,
    }
}

fn loss_points(pct: f64) -> u8 {
    match pct {
        p if p <= 0.1 => 20,
        p if p <= 0.5 => 15,
        p if p <= 1.0 => 10,
        p if p <= 2.0 => 5,
        _ => 0,
    }
}

fn jitter_points(ms: f64) -> u8 {
    match ms {
        j if j <= 5.0 => 10,
        j if j <= 10.0 => 7,
        j if j <= 20.0 => 5,
        _ => 2,
    }
}

/// Weighted score for one set of metrics.
pub fn score_metrics(bandwidth_mbps: f64, latency_ms: f64, loss_pct: f64, jitter_ms: f64) -> QualityScore {
    let performance = bandwidth_points(bandwidth_mbps) + latency_points(latency_ms);
    let stability = loss_points(loss_pct) + jitter_points(jitter_ms);
    let overall = performance + stability;
    QualityScore {
        overall,
        stability,
        performance,
        bucket: QualityBucket::from_score(overall),
    }
}

/// Scores the average of the given samples; `None` when empty.
pub fn score_samples(samples: &[ConnectionQualitySample]) -> Option<QualityScore> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let avg = |f: fn(&ConnectionQualitySample) -> f64| samples.iter().map(f).sum::<f64>() / n;
    Some(score_metrics(
        avg(|s| s.bandwidth_mbps),
        avg(|s| s.latency_ms),
        avg(|s| s.packet_loss_pct),
        avg(|s| s.jitter_ms),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excellent_reference_sample() {
        let sample = ConnectionQualitySample::new(ConnectionKind::Wifi, 120.0, 15.0, 0.05, 3.0);
        let score = score_samples(&[sample]).unwrap();
        assert!(score.overall >= 80);
        assert_eq!(score.overall, 100);
        assert_eq!(score.bucket, QualityBucket::Excellent);
    }

    #[test]
    fn score_is_monotonic_in_each_input() {
        let bandwidths = [0.0, 1.0, 5.0, 9.9, 10.0, 25.0, 49.0, 50.0, 99.0, 100.0, 500.0];
        let latencies = [1.0, 20.0, 21.0, 50.0, 99.0, 100.0, 150.0, 200.0, 201.0, 2000.0];
        let losses = [0.0, 0.1, 0.2, 0.5, 1.0, 1.5, 2.0, 3.0, 50.0];
        let jitters = [0.0, 5.0, 6.0, 10.0, 20.0, 21.0, 300.0];

        for lat in latencies {
            for loss in losses {
                for jit in jitters {
                    let scores: Vec<u8> = bandwidths
                        .iter()
                        .map(|bw| score_metrics(*bw, lat, loss, jit).overall)
                        .collect();
                    assert!(scores.windows(2).all(|w| w[0] <= w[1]));
                }
            }
        }
        for bw in bandwidths {
            let by_latency: Vec<u8> = latencies
                .iter()
                .map(|lat| score_metrics(bw, *lat, 0.0, 0.0).overall)
                .collect();
            assert!(by_latency.windows(2).all(|w| w[0] >= w[1]));
            let by_loss: Vec<u8> = losses
                .iter()
                .map(|loss| score_metrics(bw, 10.0, *loss, 0.0).overall)
                .collect();
            assert!(by_loss.windows(2).all(|w| w[0] >= w[1]));
            let by_jitter: Vec<u8> = jitters
                .iter()
                .map(|jit| score_metrics(bw, 10.0, 0.0, *jit).overall)
                .collect();
            assert!(by_jitter.windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn buckets_follow_thresholds() {
        assert_eq!(QualityBucket::from_score(80), QualityBucket::Excellent);
        assert_eq!(QualityBucket::from_score(79), QualityBucket::Good);
        assert_eq!(QualityBucket::from_score(40), QualityBucket::Fair);
        assert_eq!(QualityBucket::from_score(20), QualityBucket::Poor);
        assert_eq!(QualityBucket::from_score(19), QualityBucket::Unusable);
        assert!(QualityBucket::Poor < QualityBucket::Fair);
    }

    #[test]
    fn strategy_derivation() {
        let mut path = PathSnapshot::default();
        assert_eq!(
            NetworkStrategy::derive(Some(QualityBucket::Excellent), &path),
            NetworkStrategy::Aggressive
        );
        path.metered = true;
        assert_eq!(
            NetworkStrategy::derive(Some(QualityBucket::Excellent), &path),
            NetworkStrategy::Standard
        );
        assert_eq!(
            NetworkStrategy::derive(Some(QualityBucket::Poor), &path),
            NetworkStrategy::Conservative
        );
        assert_eq!(
            NetworkStrategy::derive(Some(QualityBucket::Unusable), &path),
            NetworkStrategy::Conservative
        );
        path.satisfied = false;
        assert_eq!(
            NetworkStrategy::derive(Some(QualityBucket::Unusable), &path),
            NetworkStrategy::Offline
        );
        assert_eq!(NetworkStrategy::derive(None, &PathSnapshot::default()), NetworkStrategy::Standard);
    }

    #[test]
    fn score_samples_averages_window() {
        let good = ConnectionQualitySample::new(ConnectionKind::Wifi, 120.0, 15.0, 0.0, 1.0);
        let bad = ConnectionQualitySample::new(ConnectionKind::Wifi, 0.0, 400.0, 10.0, 50.0);
        let mixed = score_samples(&[good.clone(), bad]).unwrap();
        assert!(mixed.overall < score_samples(&[good]).unwrap().overall);
        assert!(score_samples(&[]).is_none());
    }
}
