//! Byte transport abstraction consumed by the stream client.

mod http;

use std::collections::BTreeMap;
use std::pin::Pin;

pub use http::ReqwestTransport;

use crate::errors::TransportError;

/// Body chunks as they arrive from the network.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, TransportError>> + Send + 'static>>;

/// Lower-cased header names mapped to values.
pub type Headers = BTreeMap<String, String>;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_ACCEPT_ENCODING: &str = "accept-encoding";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_ETAG: &str = "etag";
pub const HEADER_IF_NONE_MATCH: &str = "if-none-match";
pub const HEADER_RETRY_AFTER: &str = "retry-after";
pub const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Request handed to the transport after the interceptor chain ran.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundRequest {
    pub request_id: uuid::Uuid,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<serde_json::Value>,
}

impl OutboundRequest {
    /// A streaming POST with `Accept: text/event-stream` already set.
    pub fn post_stream(url: impl Into<String>, body: serde_json::Value) -> Self {
        let mut headers = Headers::new();
        headers.insert(HEADER_ACCEPT.to_owned(), EVENT_STREAM_MIME.to_owned());
        headers.insert(HEADER_CONTENT_TYPE.to_owned(), "application/json".to_owned());
        Self {
            request_id: uuid::Uuid::new_v4(),
            method: "POST".to_owned(),
            url: url.into(),
            headers,
            body: Some(body),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .insert(name.trim().to_ascii_lowercase(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&name.trim().to_ascii_lowercase())
    }

    /// Key used by caches: method plus URL.
    pub fn cache_key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Status line and headers of a response, without the body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
    /// Body text of a non-2xx response, read eagerly so interceptors can
    /// normalize it.
    pub error_body: Option<String>,
}

impl ResponseHead {
    pub fn new(status: u16, headers: Headers) -> Self {
        Self {
            status,
            headers,
            error_body: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

pub struct TransportResponse {
    pub head: ResponseHead,
    pub body: ByteStream,
}

/// Opaque network capability: send one request, get a head plus a byte stream.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;

    /// Asks the transport to prefer an alternate network interface for the
    /// next request. Returns `false` when no alternate path exists.
    async fn prefer_alternate_path(&self) -> bool {
        false
    }
}
