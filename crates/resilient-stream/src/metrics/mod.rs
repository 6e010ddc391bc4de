//! Rolling metrics, periodic analytics and anomaly broadcast.
//!
//! The collector is a single task that owns every window. Producers hand it
//! events through a bounded channel with `try_send`, so a slow collector drops
//! metrics instead of stalling event delivery.

pub mod analytics;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::errors::{ClientError, FailureKind};
use crate::interceptor::{RequestMetricsSink, RequestSample};
use crate::quality::{ConnectionQualitySample, QualityBucket};

use analytics::{SHORT_TERM_WINDOW, TREND_WINDOW};

/// Samples and errors copied into each report for the detailed view.
const REPORT_HISTORY: usize = 60;
const ANOMALY_HISTORY: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    BandwidthDrop,
    LatencySpike,
    PacketLoss,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub observed: f64,
    /// Short-term average (or fixed threshold) the observation was compared to.
    pub baseline: f64,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, severity: AnomalySeverity, observed: f64, baseline: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity,
            observed,
            baseline,
        }
    }
}

/// Immutable diagnostic record of a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: FailureKind,
    pub message: String,
    pub recoverable: bool,
}

impl ErrorRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            recoverable,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trends {
    /// Mbps per sample over the trend window.
    pub bandwidth_slope: f64,
    /// Errors per five-minute bucket, per bucket, over the last hour.
    pub error_rate_slope: f64,
    /// Next-sample bandwidth estimate: recent average plus slope, floored at 0.
    pub bandwidth_prediction: f64,
}

/// Published by the collector on its interval and on demand.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub generated_at: Option<DateTime<Utc>>,
    pub sample_count: usize,
    pub avg_bandwidth_mbps: f64,
    pub avg_latency_ms: f64,
    pub uptime_pct: f64,
    /// Errors in the last hour.
    pub hourly_error_rate: f64,
    /// Errors in the last 24 hours.
    pub daily_error_rate: f64,
    pub trends: Trends,
    pub frames_decoded: u64,
    pub malformed_frames: u64,
    pub requests: usize,
    pub avg_request_ms: f64,
    pub request_bytes: u64,
    pub recent_samples: Vec<ConnectionQualitySample>,
    pub recent_errors: Vec<ErrorRecord>,
    pub anomalies: Vec<Anomaly>,
}

enum MetricsEvent {
    Quality {
        sample: ConnectionQualitySample,
        bucket: Option<QualityBucket>,
    },
    Frames {
        decoded: u64,
        malformed: u64,
    },
    Error(ErrorRecord),
    Request(RequestSample),
    ComputeNow(oneshot::Sender<Arc<AnalyticsReport>>),
    Shutdown,
}

/// Handle to the collector task. Cheap to clone.
#[derive(Clone)]
pub struct MetricsHandle {
    events: mpsc::Sender<MetricsEvent>,
    report: watch::Receiver<Arc<AnalyticsReport>>,
    anomalies: broadcast::Sender<Anomaly>,
}

impl MetricsHandle {
    pub fn record_quality(&self, sample: ConnectionQualitySample, bucket: Option<QualityBucket>) {
        self.offer(MetricsEvent::Quality { sample, bucket });
    }

    pub fn record_frames(&self, decoded: u64, malformed: u64) {
        if decoded > 0 || malformed > 0 {
            self.offer(MetricsEvent::Frames { decoded, malformed });
        }
    }

    pub fn record_error(&self, record: ErrorRecord) {
        self.offer(MetricsEvent::Error(record));
    }

    /// Latest published report.
    pub fn report(&self) -> Arc<AnalyticsReport> {
        self.report.borrow().clone()
    }

    pub fn subscribe_reports(&self) -> watch::Receiver<Arc<AnalyticsReport>> {
        self.report.clone()
    }

    pub fn subscribe_anomalies(&self) -> broadcast::Receiver<Anomaly> {
        self.anomalies.subscribe()
    }

    /// Recomputes and publishes a report immediately.
    pub async fn compute_now(&self) -> Result<Arc<AnalyticsReport>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(MetricsEvent::ComputeNow(tx))
            .await
            .map_err(|_| ClientError::ServiceStopped("metrics collector"))?;
        rx.await
            .map_err(|_| ClientError::ServiceStopped("metrics collector"))
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(MetricsEvent::Shutdown).await;
    }

    fn offer(&self, event: MetricsEvent) {
        if let Err(err) = self.events.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(_) => warn!("metrics channel full, dropping event"),
                mpsc::error::TrySendError::Closed(_) => debug!("metrics collector stopped"),
            }
        }
    }
}

impl RequestMetricsSink for MetricsHandle {
    fn record_request(&self, sample: RequestSample) {
        self.offer(MetricsEvent::Request(sample));
    }
}

struct SampleEntry {
    sample: ConnectionQualitySample,
    bucket: Option<QualityBucket>,
}

/// Collector task state.
pub struct MetricsCollector {
    window: usize,
    error_cap: usize,
    interval: std::time::Duration,
    samples: VecDeque<SampleEntry>,
    errors: VecDeque<ErrorRecord>,
    requests: VecDeque<RequestSample>,
    anomalies: VecDeque<Anomaly>,
    frames_decoded: u64,
    malformed_frames: u64,
    events: mpsc::Receiver<MetricsEvent>,
    publisher: watch::Sender<Arc<AnalyticsReport>>,
    anomaly_tx: broadcast::Sender<Anomaly>,
}

impl MetricsCollector {
    pub fn spawn(config: &ResilienceConfig) -> MetricsHandle {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (publisher, report) = watch::channel(Arc::new(AnalyticsReport::default()));
        let (anomaly_tx, _) = broadcast::channel(64);
        let collector = MetricsCollector {
            window: config.metrics_window.max(1),
            error_cap: config.error_history_cap.max(1),
            interval: config
                .metrics_interval_duration()
                .max(std::time::Duration::from_millis(1)),
            samples: VecDeque::new(),
            errors: VecDeque::new(),
            requests: VecDeque::new(),
            anomalies: VecDeque::new(),
            frames_decoded: 0,
            malformed_frames: 0,
            events: event_rx,
            publisher,
            anomaly_tx: anomaly_tx.clone(),
        };
        tokio::spawn(collector.run());
        MetricsHandle {
            events: event_tx,
            report,
            anomalies: anomaly_tx,
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.compute(Utc::now());
                    info!(
                        samples = report.sample_count,
                        uptime_pct = report.uptime_pct,
                        hourly_errors = report.hourly_error_rate,
                        "metrics report"
                    );
                }
                event = self.events.recv() => match event {
                    Some(MetricsEvent::Quality { sample, bucket }) => self.ingest_sample(sample, bucket),
                    Some(MetricsEvent::Frames { decoded, malformed }) => {
                        self.frames_decoded += decoded;
                        self.malformed_frames += malformed;
                    }
                    Some(MetricsEvent::Error(record)) => {
                        push_capped(&mut self.errors, record, self.error_cap);
                    }
                    Some(MetricsEvent::Request(sample)) => {
                        push_capped(&mut self.requests, sample, self.window);
                    }
                    Some(MetricsEvent::ComputeNow(reply)) => {
                        let _ = reply.send(self.compute(Utc::now()));
                    }
                    Some(MetricsEvent::Shutdown) | None => break,
                },
            }
        }
        debug!("metrics collector stopped");
    }

    fn ingest_sample(&mut self, sample: ConnectionQualitySample, bucket: Option<QualityBucket>) {
        let skip = self.samples.len().saturating_sub(SHORT_TERM_WINDOW);
        let baseline: Vec<_> = self
            .samples
            .iter()
            .skip(skip)
            .map(|entry| entry.sample.clone())
            .collect();
        for anomaly in analytics::detect_anomalies(&sample, &baseline) {
            warn!(
                kind = ?anomaly.kind,
                severity = ?anomaly.severity,
                observed = anomaly.observed,
                baseline = anomaly.baseline,
                "network anomaly"
            );
            // No subscribers is fine.
            let _ = self.anomaly_tx.send(anomaly.clone());
            push_capped(&mut self.anomalies, anomaly, ANOMALY_HISTORY);
        }
        push_capped(&mut self.samples, SampleEntry { sample, bucket }, self.window);
    }

    fn compute(&self, now: DateTime<Utc>) -> Arc<AnalyticsReport> {
        let count = self.samples.len();
        let avg = |f: fn(&ConnectionQualitySample) -> f64| {
            if count == 0 {
                0.0
            } else {
                self.samples.iter().map(|e| f(&e.sample)).sum::<f64>() / count as f64
            }
        };

        let trend_skip = count.saturating_sub(TREND_WINDOW);
        let trend: Vec<f64> = self
            .samples
            .iter()
            .skip(trend_skip)
            .map(|e| e.sample.bandwidth_mbps)
            .collect();
        let bandwidth_slope = analytics::linear_slope(&trend);
        let trend_avg = if trend.is_empty() {
            0.0
        } else {
            trend.iter().sum::<f64>() / trend.len() as f64
        };

        let errors: Vec<&ErrorRecord> = self.errors.iter().collect();
        let requests = self.requests.len();
        let avg_request_ms = if requests == 0 {
            0.0
        } else {
            self.requests
                .iter()
                .map(|r| r.duration.as_secs_f64() * 1_000.0)
                .sum::<f64>()
                / requests as f64
        };

        let report = Arc::new(AnalyticsReport {
            generated_at: Some(now),
            sample_count: count,
            avg_bandwidth_mbps: avg(|s| s.bandwidth_mbps),
            avg_latency_ms: avg(|s| s.latency_ms),
            uptime_pct: analytics::uptime_pct(self.samples.iter().map(|e| e.bucket)),
            hourly_error_rate: analytics::errors_within(&errors, now, ChronoDuration::hours(1))
                as f64,
            daily_error_rate: analytics::errors_within(&errors, now, ChronoDuration::hours(24))
                as f64,
            trends: Trends {
                bandwidth_slope,
                error_rate_slope: analytics::linear_slope(&analytics::error_series(&errors, now)),
                bandwidth_prediction: (trend_avg + bandwidth_slope).max(0.0),
            },
            frames_decoded: self.frames_decoded,
            malformed_frames: self.malformed_frames,
            requests,
            avg_request_ms,
            request_bytes: self.requests.iter().map(|r| r.bytes).sum(),
            recent_samples: tail(&self.samples, REPORT_HISTORY)
                .map(|e| e.sample.clone())
                .collect(),
            recent_errors: tail(&self.errors, REPORT_HISTORY).cloned().collect(),
            anomalies: self.anomalies.iter().cloned().collect(),
        });
        self.publisher.send_replace(report.clone());
        report
    }
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    if queue.len() >= cap {
        queue.pop_front();
    }
    queue.push_back(item);
}

fn tail<T>(queue: &VecDeque<T>, n: usize) -> impl Iterator<Item = &T> {
    queue.iter().skip(queue.len().saturating_sub(n))
}
