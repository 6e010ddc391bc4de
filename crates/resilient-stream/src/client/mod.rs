//! Stream client: orchestrates interceptors, transport, decoder and recovery.

mod stream;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use stream::{CancelHandle, EventStream, StreamOutput, ToolCall};

use crate::config::ResilienceConfig;
use crate::errors::ClientError;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::metrics::{AnalyticsReport, MetricsCollector, MetricsHandle};
use crate::quality::{
    ConnectionKind, NetworkProbe, NetworkStrategy, QualityBucket, QualityMonitor,
    QualityMonitorHandle, QualityScore,
};
use crate::recovery::{RecoveryHandle, RecoveryManager, RecoverySnapshot, RecoveryState};
use crate::transport::{OutboundRequest, Transport};

pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) chain: InterceptorChain,
    pub(crate) quality: QualityMonitorHandle,
    pub(crate) recovery: RecoveryHandle,
    pub(crate) metrics: MetricsHandle,
    pub(crate) config: ResilienceConfig,
}

/// Current network summary, read from the latest published snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub connected: bool,
    pub connection_kind: ConnectionKind,
    pub quality_bucket: Option<QualityBucket>,
    pub bandwidth_mbps: Option<f64>,
    pub latency_ms: Option<f64>,
    /// Errors recorded in the last hour.
    pub error_rate: f64,
    pub strategy: NetworkStrategy,
    pub recovery_state: RecoveryState,
}

/// Summary plus rolling history, anomalies and trends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetailedMetrics {
    pub summary: NetworkSummary,
    pub score: Option<QualityScore>,
    pub recovery: RecoverySnapshot,
    pub analytics: AnalyticsReport,
}

/// Entry point for opening resilient event streams.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

impl StreamClient {
    pub fn builder() -> StreamClientBuilder {
        StreamClientBuilder::default()
    }

    /// Opens a stream for `request`.
    ///
    /// Each call is an independent sequence; streams are never resumed from
    /// the middle. All streams of one client report to the same recovery
    /// manager, so `recovery()` and `network_summary()` describe the client's
    /// connection as a whole: the most recent report from any stream sets the
    /// state.
    pub fn stream(&self, request: OutboundRequest) -> Result<EventStream, ClientError> {
        validate_request(&request)?;
        let capacity = self.inner.quality.snapshot().strategy.buffer_capacity();
        Ok(stream::start(self.inner.clone(), request, capacity))
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    pub fn quality(&self) -> &QualityMonitorHandle {
        &self.inner.quality
    }

    pub fn recovery(&self) -> &RecoveryHandle {
        &self.inner.recovery
    }

    pub fn metrics(&self) -> &MetricsHandle {
        &self.inner.metrics
    }

    /// Synchronous, side-effect free view of the network.
    pub fn network_summary(&self) -> NetworkSummary {
        let quality = self.inner.quality.snapshot();
        let recovery = self.inner.recovery.snapshot();
        let report = self.inner.metrics.report();
        NetworkSummary {
            connected: quality.path.satisfied && recovery.state != RecoveryState::Disconnected,
            connection_kind: quality.path.kind,
            quality_bucket: quality.bucket,
            bandwidth_mbps: quality.latest.as_ref().map(|s| s.bandwidth_mbps),
            latency_ms: quality.latest.as_ref().map(|s| s.latency_ms),
            error_rate: report.hourly_error_rate,
            strategy: quality.strategy,
            recovery_state: recovery.state,
        }
    }

    /// The summary plus history, anomaly and trend data from the last report.
    pub fn detailed_metrics(&self) -> DetailedMetrics {
        DetailedMetrics {
            summary: self.network_summary(),
            score: self.inner.quality.snapshot().score,
            recovery: (*self.inner.recovery.snapshot()).clone(),
            analytics: (*self.inner.metrics.report()).clone(),
        }
    }

    /// Stops the background services this client was built with.
    pub async fn shutdown(&self) {
        self.inner.recovery.shutdown().await;
        self.inner.quality.shutdown().await;
        self.inner.metrics.shutdown().await;
    }
}

fn validate_request(request: &OutboundRequest) -> Result<(), ClientError> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(ClientError::Validation("url must not be empty".into()));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ClientError::Validation(format!(
            "url must use http or https: {url}"
        )));
    }
    if request.method.trim().is_empty() {
        return Err(ClientError::Validation("method must not be empty".into()));
    }
    Ok(())
}

/// Builder for [`StreamClient`]. Must be built inside a tokio runtime when
/// it has to spawn any of the background services.
#[derive(Default)]
pub struct StreamClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    chain: InterceptorChain,
    config: Option<ResilienceConfig>,
    probe: Option<Arc<dyn NetworkProbe>>,
    quality: Option<QualityMonitorHandle>,
    recovery: Option<RecoveryHandle>,
    metrics: Option<MetricsHandle>,
}

impl StreamClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Appends an interceptor; registration order is execution order.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.chain.push(interceptor);
        self
    }

    pub fn interceptors(mut self, chain: InterceptorChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Probe used to spawn a quality monitor when none is supplied.
    pub fn probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn quality_monitor(mut self, quality: QualityMonitorHandle) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Uses an existing recovery manager instead of spawning one. Every
    /// stream opened by the built client reports into it.
    pub fn recovery_manager(mut self, recovery: RecoveryHandle) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<StreamClient, ClientError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| ClientError::Config("a transport is required".into()))?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => MetricsCollector::spawn(&config),
        };
        let quality = match (self.quality, self.probe) {
            (Some(quality), _) => quality,
            (None, Some(probe)) => QualityMonitor::spawn(probe, &config, Some(metrics.clone())),
            (None, None) => {
                return Err(ClientError::Config(
                    "a quality monitor or network probe is required".into(),
                ));
            }
        };
        let recovery = match self.recovery {
            Some(recovery) => recovery,
            None => RecoveryManager::spawn(&config, &quality, Some(metrics.clone())),
        };

        Ok(StreamClient {
            inner: Arc::new(ClientInner {
                transport,
                chain: self.chain,
                quality,
                recovery,
                metrics,
                config,
            }),
        })
    }
}
