//! Resilient client for event-streamed completion APIs.
//!
//! A [`StreamClient`] opens a server-sent event stream, decodes it into
//! [`StreamEvent`]s and survives connection loss: failed attempts are planned
//! by the recovery manager, which weighs the current network quality before
//! retrying, switching paths or giving up.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use resilient_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let client = StreamClient::builder()
//!     .transport(Arc::new(ReqwestTransport::new(Duration::from_secs(10))?))
//!     .probe(Arc::new(HttpProbe::new(Duration::from_secs(3))?))
//!     .interceptor(Arc::new(AuthenticationInterceptor::new(Arc::new(
//!         EnvCredentials::new("OPENAI_API_KEY"),
//!     ))))
//!     .interceptor(Arc::new(RetryMarkingInterceptor))
//!     .interceptor(Arc::new(ErrorNormalizationInterceptor))
//!     .config(ResilienceConfig::from_env()?)
//!     .build()?;
//!
//! let request = OutboundRequest::post_stream(
//!     "https://api.openai.com/v1/chat/completions",
//!     serde_json::json!({
//!         "model": "gpt-4o-mini",
//!         "stream": true,
//!         "messages": [{"role": "user", "content": "Say hello"}],
//!     }),
//! );
//! let mut stream = client.stream(request)?;
//! while let Some(event) = stream.next_event().await {
//!     if let StreamEvent::ContentDelta { text, .. } = event {
//!         print!("{text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Stream client, event stream handle and cancellation.
pub mod client;
/// Tunables with environment overrides.
pub mod config;
/// Incremental server-sent event decoder.
pub mod decoder;
/// Error and failure classification.
pub mod errors;
/// Normalized stream events.
pub mod event;
/// Request/response middleware.
pub mod interceptor;
/// Rolling analytics, anomalies and trends.
pub mod metrics;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Connection quality sampling and scoring.
pub mod quality;
/// Connection state machine and recovery planning.
pub mod recovery;
/// Backoff and retry classification.
pub mod retry;
/// Byte transport abstraction and the reqwest implementation.
pub mod transport;
/// Dynamic attribute and argument values.
pub mod value;

pub use client::{
    CancelHandle, DetailedMetrics, EventStream, NetworkSummary, StreamClient,
    StreamClientBuilder, StreamOutput, ToolCall,
};
pub use config::ResilienceConfig;
pub use errors::{ClientError, FailureKind, StreamFailure, TransportError, TransportErrorKind};
pub use event::{StreamEvent, Usage};
pub use observability::init_observability;
pub use quality::{NetworkStrategy, QualityBucket};
pub use recovery::{RecoveryAction, RecoveryState, RecoveryStrategy};
pub use transport::{OutboundRequest, ReqwestTransport, Transport};
pub use value::Value;
