use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::errors::{ClientError, FailureKind, StreamFailure};
use crate::metrics::{Anomaly, AnomalySeverity, ErrorRecord, MetricsHandle};
use crate::quality::{NetworkStrategy, QualityBucket, QualityMonitorHandle, QualitySnapshot};
use crate::retry::{Outcome, RetryPolicy};

use super::{
    RecoveryAction, RecoveryState, RecoveryStrategy, Signal, StrategyInputs, select_strategy,
    transition,
};

/// Published after every state change or plan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub state: RecoveryState,
    /// Number of state changes since the manager started.
    pub transitions: u64,
    pub last_failure: Option<StreamFailure>,
    pub last_strategy: Option<RecoveryStrategy>,
    /// A recent high-severity anomaly biases plans toward conservative.
    pub preemptive_bias: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Connection lifecycle reports from the stream client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionReport {
    FirstFrame,
    MalformedFrames(u64),
    /// The stream ended without being planned for another attempt
    /// (cancelled, receiver dropped, fatal failure).
    Abandoned(StreamFailure),
}

enum Command {
    Report(ConnectionReport),
    Plan {
        attempt: u32,
        failure: StreamFailure,
        retry_after: Option<Duration>,
        reply: oneshot::Sender<RecoveryAction>,
    },
    Current(oneshot::Sender<Arc<RecoverySnapshot>>),
    Shutdown,
}

/// Handle to a running recovery manager. Cheap to clone.
#[derive(Clone)]
pub struct RecoveryHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<RecoverySnapshot>>,
}

impl RecoveryHandle {
    /// Latest published snapshot; never blocks.
    pub fn snapshot(&self) -> Arc<RecoverySnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RecoverySnapshot>> {
        self.snapshot.clone()
    }

    pub async fn report(&self, report: ConnectionReport) -> Result<(), ClientError> {
        self.commands
            .send(Command::Report(report))
            .await
            .map_err(|_| ClientError::ServiceStopped("recovery manager"))
    }

    /// Records a failed attempt and returns what to do next.
    pub async fn plan(
        &self,
        attempt: u32,
        failure: StreamFailure,
        retry_after: Option<Duration>,
    ) -> Result<RecoveryAction, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Plan {
                attempt,
                failure,
                retry_after,
                reply,
            })
            .await
            .map_err(|_| ClientError::ServiceStopped("recovery manager"))?;
        rx.await
            .map_err(|_| ClientError::ServiceStopped("recovery manager"))
    }

    /// Snapshot taken after every previously sent command was handled.
    pub async fn current(&self) -> Result<Arc<RecoverySnapshot>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Current(reply))
            .await
            .map_err(|_| ClientError::ServiceStopped("recovery manager"))?;
        rx.await
            .map_err(|_| ClientError::ServiceStopped("recovery manager"))
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Owner of the connection state machine.
pub struct RecoveryManager {
    state: RecoveryState,
    transitions: u64,
    last_failure: Option<StreamFailure>,
    last_strategy: Option<RecoveryStrategy>,
    policy: RetryPolicy,
    degraded_window: Duration,
    quality_wait_timeout: Duration,
    last_malformed: Option<Instant>,
    bias_until: Option<Instant>,
    path_satisfied: bool,
    quality: watch::Receiver<Arc<QualitySnapshot>>,
    anomalies: Option<broadcast::Receiver<Anomaly>>,
    metrics: Option<MetricsHandle>,
    commands: mpsc::Receiver<Command>,
    publisher: watch::Sender<Arc<RecoverySnapshot>>,
}

impl RecoveryManager {
    pub fn spawn(
        config: &ResilienceConfig,
        quality: &QualityMonitorHandle,
        metrics: Option<MetricsHandle>,
    ) -> RecoveryHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (publisher, snapshot) = watch::channel(Arc::new(RecoverySnapshot::default()));
        let manager = RecoveryManager {
            state: RecoveryState::Idle,
            transitions: 0,
            last_failure: None,
            last_strategy: None,
            policy: RetryPolicy::from_config(config),
            degraded_window: config.degraded_window(),
            quality_wait_timeout: config.quality_wait_timeout_duration(),
            last_malformed: None,
            bias_until: None,
            path_satisfied: quality.snapshot().path.satisfied,
            quality: quality.subscribe(),
            anomalies: metrics.as_ref().map(MetricsHandle::subscribe_anomalies),
            metrics,
            commands: command_rx,
            publisher,
        };
        tokio::spawn(manager.run());
        RecoveryHandle {
            commands: command_tx,
            snapshot,
        }
    }

    async fn run(mut self) {
        let mut quality_open = true;
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Report(report)) => self.handle_report(report),
                    Some(Command::Plan { attempt, failure, retry_after, reply }) => {
                        let action = self.plan(attempt, failure, retry_after);
                        let _ = reply.send(action);
                    }
                    Some(Command::Current(reply)) => {
                        let _ = reply.send(self.publisher.borrow().clone());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                changed = self.quality.changed(), if quality_open => {
                    if changed.is_err() {
                        quality_open = false;
                    } else {
                        self.handle_quality_change();
                    }
                }
                anomaly = recv_anomaly(&mut self.anomalies) => self.handle_anomaly(anomaly),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_windows();
                }
            }
        }
        debug!("recovery manager stopped");
    }

    fn handle_report(&mut self, report: ConnectionReport) {
        match report {
            ConnectionReport::FirstFrame => {
                self.apply(Signal::FirstFrame);
                self.reevaluate_degraded();
            }
            ConnectionReport::MalformedFrames(0) => {}
            ConnectionReport::MalformedFrames(count) => {
                debug!(count, "malformed frames reported");
                self.last_malformed = Some(Instant::now());
                self.reevaluate_degraded();
            }
            ConnectionReport::Abandoned(failure) => {
                info!(failure = failure.kind.label(), attempts = failure.attempts, "stream abandoned");
                self.apply(Signal::Abandoned);
                if failure.kind != FailureKind::Cancelled
                    && let Some(metrics) = &self.metrics
                {
                    metrics.record_error(ErrorRecord::new(
                        failure.kind,
                        failure.message.clone(),
                        false,
                    ));
                }
                self.last_failure = Some(failure);
            }
        }
        self.publish();
    }

    /// A lost path disconnects a live connection; otherwise only the
    /// degradation condition is recomputed.
    fn handle_quality_change(&mut self) {
        let satisfied = self.quality.borrow().path.satisfied;
        if self.path_satisfied && !satisfied {
            warn!("network path unsatisfied");
            self.apply(Signal::TransportLost);
            self.publish();
        }
        self.path_satisfied = satisfied;
        self.reevaluate_degraded();
    }

    fn handle_anomaly(&mut self, anomaly: Option<Anomaly>) {
        let Some(anomaly) = anomaly else {
            return;
        };
        if anomaly.severity >= AnomalySeverity::High {
            info!(kind = ?anomaly.kind, severity = ?anomaly.severity, "preemptive conservative bias");
            self.bias_until = Some(Instant::now() + self.degraded_window);
            self.publish();
        }
    }

    fn plan(
        &mut self,
        attempt: u32,
        failure: StreamFailure,
        retry_after: Option<Duration>,
    ) -> RecoveryAction {
        let quality = self.quality.borrow().clone();
        let network = self.effective_strategy(quality.strategy);
        let kind = failure.kind;

        self.apply(if self.state == RecoveryState::Recovering {
            Signal::AttemptFailed
        } else {
            Signal::TransportLost
        });
        self.last_failure = Some(failure.clone());

        let action = match Outcome::from_failure(kind, retry_after) {
            None => RecoveryAction::GiveUp,
            Some(outcome) => {
                let strategy = select_strategy(&StrategyInputs {
                    network,
                    bucket: quality.bucket,
                    failure: kind,
                    alternate_available: quality.path.alternate_available,
                    attempt,
                    has_retry_hint: retry_after.is_some(),
                });
                self.last_strategy = Some(strategy);
                if strategy == RecoveryStrategy::OfflineMode {
                    RecoveryAction::Offline
                } else {
                    let decision = self.policy.for_strategy(network).decide(attempt, &outcome);
                    if !decision.retry {
                        RecoveryAction::GiveUp
                    } else {
                        match strategy {
                            RecoveryStrategy::ImmediateRetry => RecoveryAction::Retry {
                                delay: Duration::ZERO,
                            },
                            RecoveryStrategy::WaitForQuality { min } => {
                                RecoveryAction::WaitForQuality {
                                    min,
                                    timeout: self.quality_wait_timeout,
                                }
                            }
                            RecoveryStrategy::SwitchNetwork => RecoveryAction::SwitchNetwork {
                                delay: decision.delay,
                            },
                            RecoveryStrategy::ExponentialBackoff
                            | RecoveryStrategy::OfflineMode => RecoveryAction::Retry {
                                delay: decision.delay,
                            },
                        }
                    }
                }
            }
        };

        if action.is_retry() {
            self.apply(Signal::RecoveryTriggered);
        } else {
            self.apply(Signal::RetriesExhausted);
        }
        info!(
            attempt,
            failure = kind.label(),
            network = %network,
            action = ?action,
            state = %self.state,
            "recovery plan"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_error(ErrorRecord::new(kind, failure.message, action.is_retry()));
        }
        self.publish();
        action
    }

    fn effective_strategy(&self, strategy: NetworkStrategy) -> NetworkStrategy {
        let biased = self.bias_until.is_some_and(|until| Instant::now() < until);
        match strategy {
            NetworkStrategy::Aggressive | NetworkStrategy::Standard if biased => {
                NetworkStrategy::Conservative
            }
            other => other,
        }
    }

    fn reevaluate_degraded(&mut self) {
        let poor = self
            .quality
            .borrow()
            .bucket
            .is_some_and(|bucket| bucket <= QualityBucket::Poor);
        let malformed_recently = self
            .last_malformed
            .is_some_and(|at| at.elapsed() < self.degraded_window);
        let before = self.state;
        self.apply(Signal::Quality {
            degraded: poor || malformed_recently,
        });
        if before != self.state {
            self.publish();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let malformed = self.last_malformed.map(|at| at + self.degraded_window);
        match (malformed, self.bias_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn expire_windows(&mut self) {
        let now = Instant::now();
        if self
            .last_malformed
            .is_some_and(|at| at + self.degraded_window <= now)
        {
            self.last_malformed = None;
        }
        if self.bias_until.is_some_and(|until| until <= now) {
            self.bias_until = None;
        }
        self.reevaluate_degraded();
        self.publish();
    }

    fn apply(&mut self, signal: Signal) {
        let next = transition(self.state, signal);
        if next != self.state {
            let level_up = matches!(next, RecoveryState::Connected);
            if level_up {
                info!(from = %self.state, to = %next, "recovery state");
            } else {
                warn!(from = %self.state, to = %next, signal = ?signal, "recovery state");
            }
            self.state = next;
            self.transitions += 1;
        }
    }

    fn publish(&self) {
        let snapshot = RecoverySnapshot {
            state: self.state,
            transitions: self.transitions,
            last_failure: self.last_failure.clone(),
            last_strategy: self.last_strategy,
            preemptive_bias: self
                .bias_until
                .is_some_and(|until| Instant::now() < until),
            updated_at: Some(Utc::now()),
        };
        self.publisher.send_replace(Arc::new(snapshot));
    }
}

/// Next anomaly, skipping lag notices; pends forever once the channel is gone.
async fn recv_anomaly(rx: &mut Option<broadcast::Receiver<Anomaly>>) -> Option<Anomaly> {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(anomaly) => return Some(anomaly),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "anomaly receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                *rx = None;
                return None;
            }
        }
    }
}
