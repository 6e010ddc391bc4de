use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::errors::ClientError;
use crate::metrics::MetricsHandle;

use super::{
    ConnectionQualitySample, NetworkProbe, NetworkStrategy, PathSnapshot, QualityBucket,
    QualityScore, score_samples,
};

/// Latency readings kept for the jitter estimate.
const JITTER_WINDOW: usize = 20;
/// Latency recorded for a sample in which no reference endpoint answered.
const UNREACHABLE_LATENCY_MS: f64 = 5_000.0;

/// Immutable view published after every recomputation.
#[derive(Clone, Debug, PartialEq)]
pub struct QualitySnapshot {
    pub latest: Option<ConnectionQualitySample>,
    pub score: Option<QualityScore>,
    /// Effective bucket: `Unusable` whenever the path is unsatisfied,
    /// otherwise the score's bucket.
    pub bucket: Option<QualityBucket>,
    pub path: PathSnapshot,
    pub strategy: NetworkStrategy,
    /// Samples ingested since the monitor started.
    pub sample_count: u64,
    /// The samples the current score was computed from, oldest first.
    pub recent: Vec<ConnectionQualitySample>,
}

impl Default for QualitySnapshot {
    fn default() -> Self {
        Self {
            latest: None,
            score: None,
            bucket: None,
            path: PathSnapshot::default(),
            strategy: NetworkStrategy::Standard,
            sample_count: 0,
            recent: Vec::new(),
        }
    }
}

enum Command {
    SampleNow(oneshot::Sender<Arc<QualitySnapshot>>),
    Record {
        sample: ConnectionQualitySample,
        path: Option<PathSnapshot>,
    },
    Path(PathSnapshot),
    Shutdown,
}

/// Handle to a running quality monitor. Cheap to clone.
#[derive(Clone)]
pub struct QualityMonitorHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<QualitySnapshot>>,
}

impl QualityMonitorHandle {
    /// Latest published snapshot; never blocks.
    pub fn snapshot(&self) -> Arc<QualitySnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<QualitySnapshot>> {
        self.snapshot.clone()
    }

    /// Takes a measurement immediately and returns the resulting snapshot.
    pub async fn sample_now(&self) -> Result<Arc<QualitySnapshot>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::SampleNow(tx))
            .await
            .map_err(|_| ClientError::ServiceStopped("quality monitor"))?;
        rx.await
            .map_err(|_| ClientError::ServiceStopped("quality monitor"))
    }

    /// Injects an externally measured sample, optionally with a new path.
    pub async fn record_sample(
        &self,
        sample: ConnectionQualitySample,
        path: Option<PathSnapshot>,
    ) -> Result<(), ClientError> {
        self.commands
            .send(Command::Record { sample, path })
            .await
            .map_err(|_| ClientError::ServiceStopped("quality monitor"))
    }

    /// Replaces the current path without adding a sample.
    pub async fn report_path(&self, path: PathSnapshot) -> Result<(), ClientError> {
        self.commands
            .send(Command::Path(path))
            .await
            .map_err(|_| ClientError::ServiceStopped("quality monitor"))
    }

    /// Resolves with the first snapshot whose bucket is at least `min`, or
    /// `None` when `timeout` elapses or the monitor stops first.
    pub async fn wait_for_bucket(
        &self,
        min: QualityBucket,
        timeout: Duration,
    ) -> Option<Arc<QualitySnapshot>> {
        let mut rx = self.snapshot.clone();
        let wait = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if current.bucket.is_some_and(|bucket| bucket >= min) {
                    return Some(current);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Background sampler owning the quality history.
pub struct QualityMonitor {
    probe: Arc<dyn NetworkProbe>,
    endpoints: Vec<String>,
    interval: Duration,
    history: VecDeque<ConnectionQualitySample>,
    history_cap: usize,
    score_window: usize,
    latencies: VecDeque<f64>,
    path: PathSnapshot,
    sample_count: u64,
    metrics: Option<MetricsHandle>,
    commands: mpsc::Receiver<Command>,
    publisher: watch::Sender<Arc<QualitySnapshot>>,
}

impl QualityMonitor {
    /// Starts the sampling loop on the current tokio runtime.
    ///
    /// The first periodic measurement happens one interval after start; call
    /// [`QualityMonitorHandle::sample_now`] for an immediate one.
    pub fn spawn(
        probe: Arc<dyn NetworkProbe>,
        config: &ResilienceConfig,
        metrics: Option<MetricsHandle>,
    ) -> QualityMonitorHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (publisher, snapshot) = watch::channel(Arc::new(QualitySnapshot::default()));
        let monitor = QualityMonitor {
            probe,
            endpoints: config.reference_endpoints.clone(),
            interval: config.sampling_interval_duration().max(Duration::from_millis(1)),
            history: VecDeque::new(),
            history_cap: config.quality_history_cap.max(1),
            score_window: config.score_window.max(1),
            latencies: VecDeque::new(),
            path: PathSnapshot::default(),
            sample_count: 0,
            metrics,
            commands: command_rx,
            publisher,
        };
        tokio::spawn(monitor.run());
        QualityMonitorHandle {
            commands: command_tx,
            snapshot,
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            endpoints = self.endpoints.len(),
            "quality monitor started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.measure().await,
                command = self.commands.recv() => match command {
                    Some(Command::SampleNow(reply)) => {
                        self.measure().await;
                        let _ = reply.send(self.publisher.borrow().clone());
                    }
                    Some(Command::Record { sample, path }) => {
                        if let Some(path) = path {
                            self.path = path;
                        }
                        self.ingest(sample);
                    }
                    Some(Command::Path(path)) => {
                        self.path = path;
                        self.publish();
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }
        debug!("quality monitor stopped");
    }

    async fn measure(&mut self) {
        self.path = self.probe.path().await;
        if !self.path.satisfied {
            debug!(kind = %self.path.kind, "path unsatisfied, skipping round trips");
            self.publish();
            return;
        }

        let mut round_trips = Vec::with_capacity(self.endpoints.len());
        let mut failures = 0usize;
        for endpoint in &self.endpoints {
            match self.probe.round_trip(endpoint).await {
                Ok(elapsed) => round_trips.push(elapsed.as_secs_f64() * 1_000.0),
                Err(err) => {
                    failures += 1;
                    debug!(endpoint = %endpoint, error = %err, "reference round trip failed");
                }
            }
        }

        let latency_ms = if round_trips.is_empty() {
            UNREACHABLE_LATENCY_MS
        } else {
            round_trips.iter().sum::<f64>() / round_trips.len() as f64
        };
        let loss_pct = if self.endpoints.is_empty() {
            0.0
        } else {
            failures as f64 / self.endpoints.len() as f64 * 100.0
        };
        for latency in round_trips {
            if self.latencies.len() == JITTER_WINDOW {
                self.latencies.pop_front();
            }
            self.latencies.push_back(latency);
        }
        let jitter_ms = standard_deviation(self.latencies.iter().copied());

        let bandwidth_mbps = match self.probe.bandwidth_mbps().await {
            Some(mbps) => mbps,
            None => self.history.back().map_or(0.0, |s| s.bandwidth_mbps),
        };

        self.ingest(ConnectionQualitySample::new(
            self.path.kind,
            bandwidth_mbps,
            latency_ms,
            loss_pct,
            jitter_ms,
        ));
    }

    fn ingest(&mut self, sample: ConnectionQualitySample) {
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(sample);
        self.sample_count += 1;
        let snapshot = self.publish();

        if let (Some(metrics), Some(latest)) = (&self.metrics, &snapshot.latest) {
            metrics.record_quality(latest.clone(), snapshot.bucket);
        }
    }

    fn publish(&self) -> Arc<QualitySnapshot> {
        let skip = self.history.len().saturating_sub(self.score_window);
        let recent: Vec<_> = self.history.iter().skip(skip).cloned().collect();
        let score = score_samples(&recent);
        let bucket = if self.path.satisfied {
            score.map(|s| s.bucket)
        } else {
            Some(QualityBucket::Unusable)
        };
        let strategy = NetworkStrategy::derive(bucket, &self.path);

        let previous = self.publisher.borrow().clone();
        if previous.strategy != strategy {
            info!(from = %previous.strategy, to = %strategy, "network strategy changed");
        }
        if previous.bucket.is_some() && bucket < previous.bucket {
            warn!(
                bucket = ?bucket,
                overall = score.map(|s| s.overall),
                "connection quality dropped"
            );
        }

        let snapshot = Arc::new(QualitySnapshot {
            latest: self.history.back().cloned(),
            score,
            bucket,
            path: self.path.clone(),
            strategy,
            sample_count: self.sample_count,
            recent,
        });
        self.publisher.send_replace(snapshot.clone());
        snapshot
    }
}

fn standard_deviation(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let n = values.clone().count();
    if n < 2 {
        return 0.0;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{TransportError, TransportErrorKind};
    use crate::quality::ConnectionKind;
    use std::sync::Mutex;

    struct FakeProbe {
        path: Mutex<PathSnapshot>,
        latency: Duration,
        failing_endpoint: Option<&'static str>,
        bandwidth: Option<f64>,
    }

    impl FakeProbe {
        fn healthy() -> Self {
            Self {
                path: Mutex::new(PathSnapshot {
                    kind: ConnectionKind::Wifi,
                    ..PathSnapshot::default()
                }),
                latency: Duration::from_millis(15),
                failing_endpoint: None,
                bandwidth: Some(120.0),
            }
        }
    }

    #[async_trait::async_trait]
    impl NetworkProbe for FakeProbe {
        async fn path(&self) -> PathSnapshot {
            self.path.lock().unwrap().clone()
        }

        async fn round_trip(&self, endpoint: &str) -> Result<Duration, TransportError> {
            if self.failing_endpoint == Some(endpoint) {
                return Err(TransportError::new(TransportErrorKind::Timeout, "no answer"));
            }
            Ok(self.latency)
        }

        async fn bandwidth_mbps(&self) -> Option<f64> {
            self.bandwidth
        }
    }

    fn config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default().sampling_interval(Duration::from_secs(3600));
        config.reference_endpoints = vec!["https://a.test".into(), "https://b.test".into()];
        config.score_window = 3;
        config
    }

    fn sample(bandwidth: f64, latency: f64) -> ConnectionQualitySample {
        ConnectionQualitySample::new(ConnectionKind::Wifi, bandwidth, latency, 0.05, 3.0)
    }

    #[tokio::test]
    async fn excellent_samples_derive_aggressive_strategy() {
        let handle = QualityMonitor::spawn(Arc::new(FakeProbe::healthy()), &config(), None);
        let snapshot = handle.sample_now().await.expect("sample");
        assert_eq!(snapshot.bucket, Some(QualityBucket::Excellent));
        assert_eq!(snapshot.strategy, NetworkStrategy::Aggressive);
        assert_eq!(snapshot.sample_count, 1);
        let latest = snapshot.latest.as_ref().expect("latest");
        assert_eq!(latest.kind, ConnectionKind::Wifi);
        assert!((latest.latency_ms - 15.0).abs() < 1.0);
        assert_eq!(latest.packet_loss_pct, 0.0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_reference_round_trip_counts_as_loss() {
        let probe = FakeProbe {
            failing_endpoint: Some("https://b.test"),
            ..FakeProbe::healthy()
        };
        let handle = QualityMonitor::spawn(Arc::new(probe), &config(), None);
        let snapshot = handle.sample_now().await.expect("sample");
        let latest = snapshot.latest.as_ref().expect("latest");
        assert_eq!(latest.packet_loss_pct, 50.0);
        assert_eq!(snapshot.score.expect("score").stability, 10);
    }

    #[tokio::test]
    async fn unsatisfied_path_goes_offline() {
        let probe = FakeProbe::healthy();
        *probe.path.lock().unwrap() = PathSnapshot {
            satisfied: false,
            kind: ConnectionKind::None,
            ..PathSnapshot::default()
        };
        let handle = QualityMonitor::spawn(Arc::new(probe), &config(), None);
        let snapshot = handle.sample_now().await.expect("sample");
        assert_eq!(snapshot.bucket, Some(QualityBucket::Unusable));
        assert_eq!(snapshot.strategy, NetworkStrategy::Offline);
        assert_eq!(snapshot.sample_count, 0);
    }

    #[tokio::test]
    async fn score_uses_only_the_recent_window() {
        let handle = QualityMonitor::spawn(Arc::new(FakeProbe::healthy()), &config(), None);
        for _ in 0..4 {
            handle.record_sample(sample(1.0, 400.0), None).await.unwrap();
        }
        for _ in 0..3 {
            handle.record_sample(sample(120.0, 15.0), None).await.unwrap();
        }
        let snapshot = handle.sample_now().await.expect("sample");
        assert_eq!(snapshot.recent.len(), 3);
        assert_eq!(snapshot.sample_count, 8);
        assert_eq!(snapshot.bucket, Some(QualityBucket::Excellent));
    }

    #[tokio::test]
    async fn metered_path_stays_standard() {
        let handle = QualityMonitor::spawn(Arc::new(FakeProbe::healthy()), &config(), None);
        let metered = PathSnapshot {
            kind: ConnectionKind::Wifi,
            metered: true,
            ..PathSnapshot::default()
        };
        handle
            .record_sample(sample(120.0, 15.0), Some(metered))
            .await
            .unwrap();
        let snapshot = handle
            .wait_for_bucket(QualityBucket::Excellent, Duration::from_secs(1))
            .await
            .expect("excellent");
        assert_eq!(snapshot.strategy, NetworkStrategy::Standard);
    }

    #[tokio::test]
    async fn wait_for_bucket_resolves_on_upgrade_and_times_out_otherwise() {
        let handle = QualityMonitor::spawn(Arc::new(FakeProbe::healthy()), &config(), None);
        assert!(
            handle
                .wait_for_bucket(QualityBucket::Fair, Duration::from_millis(50))
                .await
                .is_none()
        );

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .wait_for_bucket(QualityBucket::Good, Duration::from_secs(2))
                    .await
            })
        };
        handle.record_sample(sample(120.0, 15.0), None).await.unwrap();
        let reached = waiter.await.unwrap().expect("bucket reached");
        assert!(reached.bucket >= Some(QualityBucket::Good));
    }

    #[test]
    fn jitter_is_population_standard_deviation() {
        let values = [10.0, 20.0, 10.0, 20.0];
        assert!((standard_deviation(values.iter().copied()) - 5.0).abs() < 1e-9);
        assert_eq!(standard_deviation([42.0].iter().copied()), 0.0);
    }
}
