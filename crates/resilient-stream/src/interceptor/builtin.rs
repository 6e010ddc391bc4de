use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::retry::parse_retry_after;
use crate::transport::{
    HEADER_ACCEPT_ENCODING, HEADER_AUTHORIZATION, HEADER_ETAG, HEADER_IF_NONE_MATCH,
    HEADER_RETRY_AFTER, OutboundRequest,
};
use crate::value::Value;

use super::{
    ATTR_CACHE_VALIDATOR, ATTR_DURATION_MS, ATTR_RETRY_AFTER_MS, ATTR_RETRYABLE,
    ATTR_STARTED_AT_MS, Interceptor, InterceptorContext, InterceptorRejection, NormalizedError,
};

/// Source of bearer credentials. Token acquisition happens elsewhere.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token, mostly for tests and scripts.
pub struct StaticCredentials(pub String);

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone()).filter(|t| !t.trim().is_empty())
    }
}

/// Reads the token from an environment variable on every request.
pub struct EnvCredentials {
    pub variable: String,
}

impl EnvCredentials {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }
}

impl CredentialProvider for EnvCredentials {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.variable)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

/// Opaque key/value store used only by [`CachingInterceptor`].
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String);
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_owned(), value);
        }
    }
}

/// One finished request as seen by the metrics interceptor.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestSample {
    pub status: Option<u16>,
    pub duration: Duration,
    pub bytes: u64,
    pub attempt: u32,
}

pub trait RequestMetricsSink: Send + Sync {
    fn record_request(&self, sample: RequestSample);
}

/// Injects `Authorization: Bearer <token>`; rejects the request without one.
pub struct AuthenticationInterceptor {
    credentials: Arc<dyn CredentialProvider>,
}

impl AuthenticationInterceptor {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { credentials }
    }
}

impl Interceptor for AuthenticationInterceptor {
    fn name(&self) -> &'static str {
        "authentication"
    }

    fn before(&self, ctx: &mut InterceptorContext) -> Result<(), InterceptorRejection> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or_else(|| InterceptorRejection {
                interceptor: self.name(),
                reason: "no credential available".into(),
            })?;
        ctx.request
            .set_header(HEADER_AUTHORIZATION, format!("Bearer {}", token.trim()));
        Ok(())
    }
}

pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn before(&self, ctx: &mut InterceptorContext) -> Result<(), InterceptorRejection> {
        info!(
            request_id = %ctx.request.request_id,
            attempt = ctx.attempt,
            method = %ctx.request.method,
            url = %ctx.request.url,
            "outbound request"
        );
        Ok(())
    }

    fn after(&self, ctx: &mut InterceptorContext) {
        match (&ctx.response, &ctx.error) {
            (Some(head), _) if head.is_success() => info!(
                request_id = %ctx.request.request_id,
                attempt = ctx.attempt,
                status = head.status,
                "response head received"
            ),
            (Some(head), _) => warn!(
                request_id = %ctx.request.request_id,
                attempt = ctx.attempt,
                status = head.status,
                "non-success response"
            ),
            (None, Some(err)) => warn!(
                request_id = %ctx.request.request_id,
                attempt = ctx.attempt,
                error = %err,
                "transport failure"
            ),
            (None, None) => {}
        }
    }
}

/// Tags retryable outcomes and lifts `Retry-After` into an attribute.
pub struct RetryMarkingInterceptor;

impl Interceptor for RetryMarkingInterceptor {
    fn name(&self) -> &'static str {
        "retry_marking"
    }

    fn after(&self, ctx: &mut InterceptorContext) {
        let retryable = match (&ctx.response, &ctx.error) {
            (Some(head), _) => matches!(head.status, 408 | 429 | 500..=599),
            (None, Some(_)) => true,
            (None, None) => false,
        };
        ctx.set_attribute(ATTR_RETRYABLE, retryable);
        let hint = ctx
            .response
            .as_ref()
            .and_then(|head| head.header(HEADER_RETRY_AFTER))
            .and_then(parse_retry_after);
        if let Some(hint) = hint {
            ctx.set_attribute(ATTR_RETRY_AFTER_MS, hint.as_millis() as u64);
        }
    }
}

/// HTTP validator cache: remembers `ETag`s and revalidates with
/// `If-None-Match`.
///
/// Only `GET` requests are touched. A `304` on a streaming POST would leave
/// nothing to decode.
pub struct CachingInterceptor {
    store: Arc<dyn CacheStore>,
}

impl CachingInterceptor {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }
}

impl Interceptor for CachingInterceptor {
    fn name(&self) -> &'static str {
        "caching"
    }

    fn before(&self, ctx: &mut InterceptorContext) -> Result<(), InterceptorRejection> {
        if !is_cacheable(&ctx.request) {
            return Ok(());
        }
        if let Some(etag) = self.store.get(&ctx.request.cache_key()) {
            ctx.request.set_header(HEADER_IF_NONE_MATCH, etag.clone());
            ctx.set_attribute(ATTR_CACHE_VALIDATOR, etag);
        }
        Ok(())
    }

    fn after(&self, ctx: &mut InterceptorContext) {
        if !is_cacheable(&ctx.request) {
            return;
        }
        let Some(head) = ctx.response.as_ref().filter(|h| h.is_success()) else {
            return;
        };
        if let Some(etag) = head.header(HEADER_ETAG) {
            self.store.put(&ctx.request.cache_key(), etag.to_owned());
        }
    }
}

fn is_cacheable(request: &OutboundRequest) -> bool {
    request.method.eq_ignore_ascii_case("GET")
}

/// Advertises accepted content encodings.
pub struct CompressionInterceptor {
    encodings: Vec<String>,
}

impl CompressionInterceptor {
    pub fn new(encodings: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            encodings: encodings.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for CompressionInterceptor {
    fn default() -> Self {
        Self::new(["gzip", "identity"])
    }
}

impl Interceptor for CompressionInterceptor {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn before(&self, ctx: &mut InterceptorContext) -> Result<(), InterceptorRejection> {
        if !self.encodings.is_empty() {
            ctx.request
                .set_header(HEADER_ACCEPT_ENCODING, self.encodings.join(", "));
        }
        Ok(())
    }
}

/// Measures time to response head and the advertised response size.
pub struct MetricsInterceptor {
    sink: Option<Arc<dyn RequestMetricsSink>>,
}

impl MetricsInterceptor {
    pub fn new(sink: Option<Arc<dyn RequestMetricsSink>>) -> Self {
        Self { sink }
    }
}

impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn before(&self, ctx: &mut InterceptorContext) -> Result<(), InterceptorRejection> {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        ctx.set_attribute(ATTR_STARTED_AT_MS, now);
        Ok(())
    }

    fn after(&self, ctx: &mut InterceptorContext) {
        let Some(started) = ctx.attribute(ATTR_STARTED_AT_MS).and_then(Value::as_f64) else {
            return;
        };
        let now = chrono::Utc::now().timestamp_millis().max(0) as f64;
        let duration_ms = (now - started).max(0.0) as u64;
        ctx.set_attribute(ATTR_DURATION_MS, duration_ms);

        let bytes = ctx
            .response
            .as_ref()
            .map(|head| {
                head.header("content-length")
                    .and_then(|v| v.parse::<u64>().ok())
                    .or_else(|| head.error_body.as_ref().map(|b| b.len() as u64))
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        if let Some(sink) = &self.sink {
            sink.record_request(RequestSample {
                status: ctx.status(),
                duration: Duration::from_millis(duration_ms),
                bytes,
                attempt: ctx.attempt,
            });
        }
    }
}

/// Sets and removes fixed headers.
#[derive(Default)]
pub struct HeaderInterceptor {
    set: Vec<(String, String)>,
    remove: Vec<String>,
}

impl HeaderInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set.push((name.into(), value.into()));
        self
    }

    pub fn remove(mut self, name: impl Into<String>) -> Self {
        self.remove.push(name.into());
        self
    }
}

impl Interceptor for HeaderInterceptor {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn before(&self, ctx: &mut InterceptorContext) -> Result<(), InterceptorRejection> {
        for name in &self.remove {
            ctx.request.remove_header(name);
        }
        for (name, value) in &self.set {
            ctx.request.set_header(name, value.clone());
        }
        Ok(())
    }
}

/// Maps non-2xx bodies and transport errors into [`NormalizedError`].
pub struct ErrorNormalizationInterceptor;

impl Interceptor for ErrorNormalizationInterceptor {
    fn name(&self) -> &'static str {
        "error_normalization"
    }

    fn after(&self, ctx: &mut InterceptorContext) {
        if let Some(head) = ctx.response.as_ref().filter(|h| !h.is_success()) {
            let body = head.error_body.as_deref().unwrap_or("");
            ctx.normalized_error = Some(normalize_body(head.status, body));
        } else if let Some(err) = &ctx.error {
            ctx.normalized_error = Some(NormalizedError {
                status: None,
                code: Some(err.kind.to_string()),
                message: err.message.clone(),
            });
        }
    }
}

fn normalize_body(status: u16, body: &str) -> NormalizedError {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let error = parsed
        .as_ref()
        .map(|v| v.get("error").unwrap_or(v))
        .filter(|v| v.is_object());
    let text = |key: &str| {
        error
            .and_then(|e| e.get(key))
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned)
    };
    let message = text("message")
        .or_else(|| error.and_then(|e| e.get("detail")).and_then(|v| v.as_str()).map(ToOwned::to_owned))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {status}")
            } else {
                trimmed.chars().take(512).collect()
            }
        });
    NormalizedError {
        status: Some(status),
        code: text("code").or_else(|| text("type")),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{TransportError, TransportErrorKind};
    use crate::interceptor::InterceptorChain;
    use crate::transport::{Headers, OutboundRequest, ResponseHead};

    fn ctx() -> InterceptorContext {
        InterceptorContext::new(
            OutboundRequest::post_stream("https://api.test/v1/chat/completions", serde_json::json!({})),
            0,
        )
    }

    fn head(status: u16, headers: &[(&str, &str)]) -> ResponseHead {
        let headers: Headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ResponseHead::new(status, headers)
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<RequestSample>>);

    impl RequestMetricsSink for CollectingSink {
        fn record_request(&self, sample: RequestSample) {
            self.0.lock().unwrap().push(sample);
        }
    }

    #[test]
    fn authentication_injects_bearer_or_rejects() {
        let auth = AuthenticationInterceptor::new(Arc::new(StaticCredentials("sk-1".into())));
        let mut c = ctx();
        auth.before(&mut c).unwrap();
        assert_eq!(c.request.header("Authorization"), Some("Bearer sk-1"));
        assert_eq!(c.request.header("accept"), Some("text/event-stream"));

        let missing = AuthenticationInterceptor::new(Arc::new(StaticCredentials("  ".into())));
        assert!(missing.before(&mut ctx()).is_err());
    }

    #[test]
    fn retry_marking_tags_server_errors_and_hint() {
        let mut c = ctx();
        c.response = Some(head(429, &[("retry-after", "2")]));
        RetryMarkingInterceptor.after(&mut c);
        assert!(c.is_marked_retryable());
        assert_eq!(c.attribute(ATTR_RETRY_AFTER_MS), Some(&Value::Number(2000.0)));

        let mut c = ctx();
        c.response = Some(head(404, &[]));
        RetryMarkingInterceptor.after(&mut c);
        assert!(!c.is_marked_retryable());

        let mut c = ctx();
        c.error = Some(TransportError::reset("peer reset"));
        RetryMarkingInterceptor.after(&mut c);
        assert!(c.is_marked_retryable());
    }

    fn get_ctx() -> InterceptorContext {
        let mut c = ctx();
        c.request.method = "GET".into();
        c.request.body = None;
        c
    }

    #[test]
    fn caching_round_trips_etag_validator() {
        let cache = Arc::new(MemoryCache::default());
        let caching = CachingInterceptor::new(cache.clone());

        let mut first = get_ctx();
        caching.before(&mut first).unwrap();
        assert_eq!(first.request.header(HEADER_IF_NONE_MATCH), None);
        first.response = Some(head(200, &[("etag", "\"v1\"")]));
        caching.after(&mut first);

        let mut second = get_ctx();
        caching.before(&mut second).unwrap();
        assert_eq!(second.request.header(HEADER_IF_NONE_MATCH), Some("\"v1\""));
    }

    #[test]
    fn caching_leaves_streaming_posts_alone() {
        let cache = Arc::new(MemoryCache::default());
        let caching = CachingInterceptor::new(cache.clone());

        let mut first = ctx();
        first.response = Some(head(200, &[("etag", "\"v1\"")]));
        caching.after(&mut first);
        assert_eq!(cache.get(&first.request.cache_key()), None);

        cache.put(&first.request.cache_key(), "\"v0\"".into());
        let mut second = ctx();
        caching.before(&mut second).unwrap();
        assert_eq!(second.request.header(HEADER_IF_NONE_MATCH), None);
        assert!(second.attribute(ATTR_CACHE_VALIDATOR).is_none());
    }

    #[test]
    fn headers_and_compression_edit_request() {
        let chain = InterceptorChain::new()
            .with(Arc::new(CompressionInterceptor::default()))
            .with(Arc::new(
                HeaderInterceptor::new()
                    .set("X-Client", "mobile")
                    .remove("content-type"),
            ));
        let c = chain.run_before(ctx()).unwrap();
        assert_eq!(c.request.header("accept-encoding"), Some("gzip, identity"));
        assert_eq!(c.request.header("x-client"), Some("mobile"));
        assert_eq!(c.request.header("content-type"), None);
    }

    #[test]
    fn metrics_records_duration_and_size() {
        let sink = Arc::new(CollectingSink::default());
        let metrics = MetricsInterceptor::new(Some(sink.clone()));
        let mut c = ctx();
        metrics.before(&mut c).unwrap();
        c.response = Some(head(200, &[("content-length", "42")]));
        metrics.after(&mut c);

        assert!(c.attribute(ATTR_DURATION_MS).is_some());
        let samples = sink.0.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].bytes, 42);
        assert_eq!(samples[0].status, Some(200));
    }

    #[test]
    fn error_normalization_reads_openai_error_shape() {
        let mut c = ctx();
        let mut h = head(401, &[]);
        h.error_body = Some(
            r#"{"error":{"message":"Invalid API key","type":"invalid_request_error","code":"invalid_api_key"}}"#
                .into(),
        );
        c.response = Some(h);
        ErrorNormalizationInterceptor.after(&mut c);
        assert_eq!(
            c.normalized_error,
            Some(NormalizedError {
                status: Some(401),
                code: Some("invalid_api_key".into()),
                message: "Invalid API key".into(),
            })
        );
    }

    #[test]
    fn error_normalization_handles_plain_text_and_transport() {
        let mut c = ctx();
        let mut h = head(502, &[]);
        h.error_body = Some("Bad Gateway".into());
        c.response = Some(h);
        ErrorNormalizationInterceptor.after(&mut c);
        assert_eq!(c.normalized_error.as_ref().map(|e| e.message.as_str()), Some("Bad Gateway"));

        let mut c = ctx();
        c.error = Some(TransportError::new(TransportErrorKind::Dns, "no such host"));
        ErrorNormalizationInterceptor.after(&mut c);
        assert_eq!(
            c.normalized_error.as_ref().and_then(|e| e.code.as_deref()),
            Some("dns")
        );
    }
}
