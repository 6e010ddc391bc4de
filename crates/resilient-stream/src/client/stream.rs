use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::decoder::{ChunkFrame, FrameDecoder, FramePayload};
use crate::errors::{ClientError, FailureKind, StreamFailure, TransportError, TransportErrorKind};
use crate::event::{StreamEvent, Usage};
use crate::interceptor::{ATTR_RETRY_AFTER_MS, InterceptorContext};
use crate::recovery::{ConnectionReport, RecoveryAction};
use crate::retry::parse_retry_after;
use crate::transport::{ByteStream, HEADER_RETRY_AFTER, OutboundRequest};
use crate::value::Value;

use super::ClientInner;

/// Cap on how much of a non-2xx body is read for error normalization.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Cancels a running stream. Cheap to clone.
#[derive(Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Requests cancellation.
    ///
    /// The in-flight transport call and any pending retry sleep are dropped;
    /// the stream ends with `StreamEvent::Failed` of kind `Cancelled`.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Aggregated result of a finished stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    /// Connections opened, the successful one included.
    pub attempts: u32,
    pub discontinuities: u32,
}

/// Caller side of a running stream.
///
/// Use `next_event()` to consume events as they arrive and `finish()` to
/// obtain the aggregated output once the stream ends.
pub struct EventStream {
    request_id: uuid::Uuid,
    rx: mpsc::Receiver<StreamEvent>,
    final_rx: oneshot::Receiver<Result<StreamOutput, StreamFailure>>,
    cancel: CancelHandle,
    saw_terminal: bool,
}

impl EventStream {
    pub fn request_id(&self) -> uuid::Uuid {
        self.request_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Waits for the next event. Returns `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(StreamEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events and returns the final result.
    ///
    /// Safe to call after consuming events with `next_event()`.
    pub async fn finish(mut self) -> Result<StreamOutput, ClientError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }
        match self.final_rx.await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(ClientError::ServiceStopped("stream task")),
        }
    }

    /// Runs to completion and returns the concatenated text.
    pub async fn collect_text(self) -> Result<String, ClientError> {
        Ok(self.finish().await?.text)
    }
}

impl futures::Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<StreamEvent>> {
        let poll = self.rx.poll_recv(cx);
        if let std::task::Poll::Ready(Some(event)) = &poll
            && event.is_terminal()
        {
            self.saw_terminal = true;
        }
        poll
    }
}

pub(super) fn start(
    inner: Arc<ClientInner>,
    request: OutboundRequest,
    capacity: usize,
) -> EventStream {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (final_tx, final_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let request_id = request.request_id;

    let task = StreamTask {
        inner,
        request,
        tx,
        cancel_rx,
        output: StreamOutput::default(),
        delivered_any: false,
        last_status: None,
    };
    tokio::spawn(task.run(final_tx));

    EventStream {
        request_id,
        rx,
        final_rx,
        cancel: CancelHandle { tx: cancel_tx },
        saw_terminal: false,
    }
}

/// How one connection attempt ended.
enum AttemptEnd {
    Completed,
    Cancelled,
    ReceiverGone,
    /// Ends the stream without consulting recovery.
    Fatal(StreamFailure),
    Failed {
        failure: StreamFailure,
        retry_after: Option<Duration>,
    },
}

struct StreamTask {
    inner: Arc<ClientInner>,
    request: OutboundRequest,
    tx: mpsc::Sender<StreamEvent>,
    cancel_rx: watch::Receiver<bool>,
    output: StreamOutput,
    delivered_any: bool,
    last_status: Option<u16>,
}

impl StreamTask {
    async fn run(mut self, final_tx: oneshot::Sender<Result<StreamOutput, StreamFailure>>) {
        let request_id = self.request.request_id;
        let mut attempt: u32 = 0;
        loop {
            self.output.attempts = attempt + 1;
            // Failures the recovery manager did not plan are reported as abandoned.
            let (failure, planned) = match self.attempt(attempt).await {
                AttemptEnd::Completed => {
                    info!(%request_id, attempts = attempt + 1, "stream completed");
                    let _ = final_tx.send(Ok(std::mem::take(&mut self.output)));
                    return;
                }
                AttemptEnd::ReceiverGone => {
                    debug!(%request_id, "stream receiver dropped");
                    self.abandon(StreamFailure::cancelled(attempt + 1)).await;
                    return;
                }
                AttemptEnd::Cancelled => (StreamFailure::cancelled(attempt + 1), false),
                AttemptEnd::Fatal(failure) => (failure, false),
                AttemptEnd::Failed {
                    failure,
                    retry_after,
                } => {
                    let failure = failure.with_last_status(self.last_status);
                    let action = match self
                        .inner
                        .recovery
                        .plan(attempt, failure.clone(), retry_after)
                        .await
                    {
                        Ok(action) => action,
                        Err(err) => {
                            warn!(%request_id, error = %err, "recovery unavailable, giving up");
                            RecoveryAction::GiveUp
                        }
                    };
                    match self.execute(action).await {
                        Some(true) => {
                            attempt += 1;
                            continue;
                        }
                        Some(false) if action == RecoveryAction::Offline => (
                            StreamFailure::new(
                                FailureKind::Offline,
                                format!("network unusable, last error: {}", failure.message),
                                attempt + 1,
                            )
                            .with_last_status(self.last_status),
                            true,
                        ),
                        Some(false) => (failure, true),
                        None => (StreamFailure::cancelled(attempt + 1), false),
                    }
                }
            };

            if !planned {
                self.abandon(failure.clone()).await;
            }
            warn!(%request_id, kind = failure.kind.label(), attempts = failure.attempts, "stream failed");
            let _ = self.tx.send(StreamEvent::Failed(failure.clone())).await;
            let _ = final_tx.send(Err(failure));
            return;
        }
    }

    async fn abandon(&self, failure: StreamFailure) {
        if let Err(err) = self
            .inner
            .recovery
            .report(ConnectionReport::Abandoned(failure))
            .await
        {
            debug!(error = %err, "recovery unavailable");
        }
    }

    /// Carries out a recovery action. `Some(true)` means retry, `Some(false)`
    /// means stop, `None` means the caller cancelled while waiting.
    async fn execute(&mut self, action: RecoveryAction) -> Option<bool> {
        let delay = match action {
            RecoveryAction::GiveUp | RecoveryAction::Offline => return Some(false),
            RecoveryAction::Retry { delay } => delay,
            RecoveryAction::SwitchNetwork { delay } => {
                let switched = self.inner.transport.prefer_alternate_path().await;
                info!(switched, "switching network path");
                delay
            }
            RecoveryAction::WaitForQuality { min, timeout } => {
                info!(min = %min, timeout_ms = timeout.as_millis() as u64, "waiting for quality");
                let quality = self.inner.quality.clone();
                tokio::select! {
                    _ = cancelled(&mut self.cancel_rx) => return None,
                    reached = quality.wait_for_bucket(min, timeout) => {
                        if reached.is_none() {
                            debug!(min = %min, "quality wait timed out, retrying anyway");
                        }
                    }
                }
                Duration::ZERO
            }
        };
        if delay.is_zero() {
            return if *self.cancel_rx.borrow() { None } else { Some(true) };
        }
        debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = cancelled(&mut self.cancel_rx) => None,
            _ = tokio::time::sleep(delay) => Some(true),
        }
    }

    async fn attempt(&mut self, attempt: u32) -> AttemptEnd {
        if *self.cancel_rx.borrow() {
            return AttemptEnd::Cancelled;
        }
        let attempts = attempt + 1;
        let ctx = InterceptorContext::new(self.request.clone(), attempt);
        let mut ctx = match self.inner.chain.run_before(ctx) {
            Ok(ctx) => ctx,
            Err(rejection) => {
                return AttemptEnd::Fatal(StreamFailure::new(
                    FailureKind::Rejected,
                    rejection.to_string(),
                    attempts,
                ));
            }
        };

        let transport = self.inner.transport.clone();
        let outbound = ctx.request.clone();
        let attempt_timeout = self.inner.config.attempt_timeout_duration();
        let sent = tokio::select! {
            _ = cancelled(&mut self.cancel_rx) => return AttemptEnd::Cancelled,
            sent = tokio::time::timeout(attempt_timeout, transport.send(outbound)) => sent,
        };
        let sent = sent.unwrap_or_else(|_| {
            Err(TransportError::timeout(format!(
                "no response head within {} ms",
                attempt_timeout.as_millis()
            )))
        });

        let mut response = match sent {
            Ok(response) => response,
            Err(err) => {
                ctx.error = Some(err.clone());
                let ctx = self.inner.chain.run_after(ctx);
                let message = ctx
                    .normalized_error
                    .map(|e| e.message)
                    .unwrap_or(err.message);
                return AttemptEnd::Failed {
                    failure: StreamFailure::new(err.kind.into(), message, attempts),
                    retry_after: None,
                };
            }
        };

        let status = response.head.status;
        if !response.head.is_success() {
            self.last_status = Some(status);
            if response.head.error_body.is_none() {
                response.head.error_body = self.read_error_body(&mut response.body).await;
            }
        }
        ctx.response = Some(response.head.clone());
        let ctx = self.inner.chain.run_after(ctx);

        if !response.head.is_success() {
            let retry_after = ctx
                .attribute(ATTR_RETRY_AFTER_MS)
                .and_then(Value::as_f64)
                .map(|ms| Duration::from_millis(ms as u64))
                .or_else(|| {
                    response
                        .head
                        .header(HEADER_RETRY_AFTER)
                        .and_then(parse_retry_after)
                });
            let message = ctx
                .normalized_error
                .map(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return AttemptEnd::Failed {
                failure: StreamFailure::new(FailureKind::from_status(status), message, attempts),
                retry_after,
            };
        }

        self.read_body(response.body, attempt).await
    }

    async fn read_error_body(&mut self, body: &mut ByteStream) -> Option<String> {
        let read_timeout = self.inner.config.read_timeout_duration();
        let mut collected = Vec::new();
        while collected.len() < ERROR_BODY_LIMIT {
            match tokio::time::timeout(read_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => collected.extend_from_slice(&chunk),
                _ => break,
            }
        }
        collected.truncate(ERROR_BODY_LIMIT);
        (!collected.is_empty()).then(|| String::from_utf8_lossy(&collected).into_owned())
    }

    async fn read_body(&mut self, mut body: ByteStream, attempt: u32) -> AttemptEnd {
        let attempts = attempt + 1;
        let read_timeout = self.inner.config.read_timeout_duration();
        let mut decoder = FrameDecoder::new(self.inner.config.max_line_bytes);
        let mut first_frame = true;
        let mut reported_malformed = 0u64;

        let end = loop {
            let next = tokio::select! {
                _ = cancelled(&mut self.cancel_rx) => break AttemptEnd::Cancelled,
                next = tokio::time::timeout(read_timeout, body.next()) => next,
            };
            let (frames, eof) = match next {
                Err(_) => {
                    break AttemptEnd::Failed {
                        failure: StreamFailure::new(
                            FailureKind::from(TransportErrorKind::Timeout),
                            format!("no data within {} ms", read_timeout.as_millis()),
                            attempts,
                        ),
                        retry_after: None,
                    };
                }
                Ok(Some(Err(err))) => {
                    break AttemptEnd::Failed {
                        failure: StreamFailure::new(err.kind.into(), err.message, attempts),
                        retry_after: None,
                    };
                }
                Ok(Some(Ok(chunk))) => (decoder.push(&chunk), false),
                Ok(None) => (decoder.finish_eof(), true),
            };

            if let Some(end) = self
                .deliver(frames, attempt, &mut first_frame)
                .await
            {
                break end;
            }

            let malformed = decoder.stats().malformed;
            if malformed > reported_malformed {
                let _ = self
                    .inner
                    .recovery
                    .report(ConnectionReport::MalformedFrames(malformed - reported_malformed))
                    .await;
                reported_malformed = malformed;
            }

            if decoder.is_finished() {
                break AttemptEnd::Completed;
            }
            if eof {
                break AttemptEnd::Failed {
                    failure: StreamFailure::new(
                        FailureKind::ProtocolViolation,
                        "stream closed before the terminal sentinel",
                        attempts,
                    ),
                    retry_after: None,
                };
            }
        };

        let stats = decoder.stats();
        debug!(
            request_id = %self.request.request_id,
            attempt,
            frames = stats.frames,
            malformed = stats.malformed,
            bytes = stats.bytes,
            response_id = decoder.response_id().unwrap_or(""),
            model = decoder.model().unwrap_or(""),
            "connection closed"
        );
        self.inner.metrics.record_frames(stats.frames, stats.malformed);
        end
    }

    /// Forwards decoded frames; returns `Some` when the attempt must end.
    async fn deliver(
        &mut self,
        frames: Vec<ChunkFrame>,
        attempt: u32,
        first_frame: &mut bool,
    ) -> Option<AttemptEnd> {
        for frame in frames {
            if *first_frame {
                *first_frame = false;
                let _ = self
                    .inner
                    .recovery
                    .report(ConnectionReport::FirstFrame)
                    .await;
                if attempt > 0 && self.delivered_any {
                    self.output.discontinuities += 1;
                    info!(connection = attempt, "resuming on a new connection");
                    if !self.send(StreamEvent::Discontinuity { connection: attempt }).await {
                        return Some(AttemptEnd::ReceiverGone);
                    }
                }
            }

            let event = match frame.payload {
                FramePayload::UpstreamError(err) => {
                    let mut message = err.message;
                    if let Some(code) = err.code.or(err.error_type) {
                        message = format!("{message} ({code})");
                    }
                    return Some(AttemptEnd::Fatal(StreamFailure::new(
                        FailureKind::Upstream,
                        message,
                        attempt + 1,
                    )));
                }
                FramePayload::Event(event) => event,
            };
            debug!(seq = frame.seq, attempt, "frame");
            self.aggregate(&event);
            if !self.send(event).await {
                return Some(AttemptEnd::ReceiverGone);
            }
        }
        None
    }

    fn aggregate(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ContentDelta { text, .. } => self.output.text.push_str(text),
            StreamEvent::ToolInvocation {
                id,
                name,
                arguments,
            } => self.output.tool_calls.push(ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            StreamEvent::UsageSummary(usage) => self.output.usage = Some(*usage),
            StreamEvent::Terminal { finish_reason } => {
                self.output.finish_reason = finish_reason.clone();
            }
            StreamEvent::ToolResult { .. }
            | StreamEvent::Discontinuity { .. }
            | StreamEvent::Failed(_) => {}
        }
    }

    async fn send(&mut self, event: StreamEvent) -> bool {
        let sent = self.tx.send(event).await.is_ok();
        self.delivered_any |= sent;
        sent
    }
}

/// Resolves once cancellation is requested; pends forever if every handle
/// is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
