use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt as _;
use tracing::{debug, info};

use crate::errors::{ClientError, TransportError, TransportErrorKind};

use super::{ByteStream, Headers, OutboundRequest, ResponseHead, Transport, TransportResponse};

/// `reqwest`-backed transport.
///
/// An optional alternate local address gives recovery a second interface to
/// switch to (for example Wi-Fi vs. cellular on a device with both up).
pub struct ReqwestTransport {
    clients: Vec<reqwest::Client>,
    active: AtomicUsize,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, ClientError> {
        Self::build(connect_timeout, None)
    }

    /// Adds a second client bound to `local_address`.
    pub fn with_alternate_local_address(
        connect_timeout: Duration,
        local_address: IpAddr,
    ) -> Result<Self, ClientError> {
        Self::build(connect_timeout, Some(local_address))
    }

    fn build(connect_timeout: Duration, alternate: Option<IpAddr>) -> Result<Self, ClientError> {
        let mut clients = vec![build_client(connect_timeout, None)?];
        if let Some(address) = alternate {
            clients.push(build_client(connect_timeout, Some(address))?);
        }
        Ok(Self {
            clients,
            active: AtomicUsize::new(0),
        })
    }

    fn client(&self) -> &reqwest::Client {
        let index = self.active.load(Ordering::SeqCst) % self.clients.len();
        &self.clients[index]
    }
}

fn build_client(
    connect_timeout: Duration,
    local_address: Option<IpAddr>,
) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
    if let Some(address) = local_address {
        builder = builder.local_address(address);
    }
    builder
        .build()
        .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            TransportError::new(TransportErrorKind::Io, format!("invalid method: {e}"))
        })?;
        let mut http_req = self.client().request(method, &request.url);
        for (name, value) in &request.headers {
            http_req = http_req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            http_req = http_req.json(body);
        }
        debug!(request_id = %request.request_id, url = %request.url, "sending request");

        let response = http_req.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_owned()))
            })
            .collect();
        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(classify_reqwest_error)),
        );
        Ok(TransportResponse {
            head: ResponseHead::new(status, headers),
            body,
        })
    }

    async fn prefer_alternate_path(&self) -> bool {
        if self.clients.len() < 2 {
            return false;
        }
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        info!(
            from = previous % self.clients.len(),
            to = (previous + 1) % self.clients.len(),
            "switching network interface"
        );
        true
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    let text = err.to_string();
    let detail = format!("{err:?}").to_ascii_lowercase();
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if detail.contains("dns") || detail.contains("failed to lookup") {
        TransportErrorKind::Dns
    } else if detail.contains("tls") || detail.contains("certificate") || detail.contains("handshake")
    {
        TransportErrorKind::Tls
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Reset
    } else {
        TransportErrorKind::Io
    };
    TransportError::new(kind, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_client_has_no_alternate_path() {
        let transport = ReqwestTransport::new(Duration::from_secs(1)).expect("client");
        assert!(!transport.prefer_alternate_path().await);
    }

    #[tokio::test]
    async fn alternate_client_rotates() {
        let transport = ReqwestTransport::with_alternate_local_address(
            Duration::from_secs(1),
            IpAddr::from([127, 0, 0, 1]),
        )
        .expect("client");
        assert!(transport.prefer_alternate_path().await);
        assert_eq!(transport.active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_host_is_classified_as_transport_error() {
        let transport = ReqwestTransport::new(Duration::from_millis(200)).expect("client");
        let request = OutboundRequest::post_stream("http://127.0.0.1:9/v1", serde_json::json!({}));
        let err = match transport.send(request).await {
            Ok(_) => panic!("port 9 should refuse"),
            Err(err) => err,
        };
        assert!(matches!(
            err.kind,
            TransportErrorKind::Connect | TransportErrorKind::Timeout | TransportErrorKind::Io
        ));
    }
}
