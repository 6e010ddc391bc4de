//! Request/response middleware run around every transport attempt.
//!
//! The chain owns nothing per request: each attempt builds a fresh
//! [`InterceptorContext`], moves it through `run_before`, hands the request to
//! the transport, then moves it through `run_after`. Both phases walk the
//! interceptors in registration order.

mod builtin;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

pub use builtin::{
    AuthenticationInterceptor, CacheStore, CachingInterceptor, CompressionInterceptor,
    CredentialProvider, EnvCredentials, ErrorNormalizationInterceptor, HeaderInterceptor,
    LoggingInterceptor, MemoryCache, MetricsInterceptor, RequestMetricsSink, RequestSample,
    RetryMarkingInterceptor, StaticCredentials,
};

use crate::errors::TransportError;
use crate::transport::{OutboundRequest, ResponseHead};
use crate::value::Value;

/// Attribute set by the retry-marking interceptor on retryable outcomes.
pub const ATTR_RETRYABLE: &str = "retry.retryable";
/// Server-provided retry hint in milliseconds.
pub const ATTR_RETRY_AFTER_MS: &str = "retry.after_ms";
pub const ATTR_STARTED_AT_MS: &str = "metrics.started_at_ms";
pub const ATTR_DURATION_MS: &str = "metrics.duration_ms";
pub const ATTR_CACHE_VALIDATOR: &str = "cache.validator";

/// Structured shape of a non-2xx body or transport failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

/// Returned by a `before` hook to stop the request from being sent.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("request rejected by {interceptor}: {reason}")]
pub struct InterceptorRejection {
    pub interceptor: &'static str,
    pub reason: String,
}

/// Per-attempt state threaded through the chain.
#[derive(Debug)]
pub struct InterceptorContext {
    pub request: OutboundRequest,
    /// Zero-based attempt number this context belongs to.
    pub attempt: u32,
    pub response: Option<ResponseHead>,
    pub error: Option<TransportError>,
    pub normalized_error: Option<NormalizedError>,
    pub attributes: BTreeMap<String, Value>,
}

impl InterceptorContext {
    pub fn new(request: OutboundRequest, attempt: u32) -> Self {
        Self {
            request,
            attempt,
            response: None,
            error: None,
            normalized_error: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        self.attributes.insert(key.to_owned(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    pub fn is_marked_retryable(&self) -> bool {
        self.attribute(ATTR_RETRYABLE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Middleware hooks. Both default to no-ops.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn before(&self, _ctx: &mut InterceptorContext) -> Result<(), InterceptorRejection> {
        Ok(())
    }

    fn after(&self, _ctx: &mut InterceptorContext) {}
}

/// Ordered interceptor pipeline.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor; registration order is execution order.
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn run_before(
        &self,
        mut ctx: InterceptorContext,
    ) -> Result<InterceptorContext, InterceptorRejection> {
        for interceptor in &self.interceptors {
            interceptor.before(&mut ctx)?;
            debug!(interceptor = interceptor.name(), attempt = ctx.attempt, "before hook");
        }
        Ok(ctx)
    }

    pub fn run_after(&self, mut ctx: InterceptorContext) -> InterceptorContext {
        for interceptor in &self.interceptors {
            interceptor.after(&mut ctx);
            debug!(interceptor = interceptor.name(), attempt = ctx.attempt, "after hook");
        }
        ctx
    }
}
