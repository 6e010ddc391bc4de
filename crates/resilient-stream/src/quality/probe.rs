use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ClientError, TransportError, TransportErrorKind};

use super::{CellularGeneration, ConnectionKind, PathSnapshot};

/// Raw path attributes as reported by the platform networking layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathAttributes {
    pub satisfied: bool,
    pub uses_wifi: bool,
    pub uses_cellular: bool,
    pub uses_wired: bool,
    /// Radio access technology name, e.g. `LTE`, `NR`, `WCDMA`, `Edge`.
    pub radio_technology: Option<String>,
    pub expensive: bool,
    pub constrained: bool,
    /// Number of interfaces currently able to carry traffic.
    pub available_interfaces: u32,
}

impl PathAttributes {
    pub fn classify(&self) -> PathSnapshot {
        let kind = if !self.satisfied && self.available_interfaces == 0 {
            ConnectionKind::None
        } else if self.uses_wired {
            ConnectionKind::Ethernet
        } else if self.uses_wifi {
            ConnectionKind::Wifi
        } else if self.uses_cellular {
            ConnectionKind::Cellular(cellular_generation(self.radio_technology.as_deref()))
        } else {
            ConnectionKind::Other
        };
        PathSnapshot {
            satisfied: self.satisfied,
            kind,
            // Cellular is metered unless the platform says otherwise explicitly.
            metered: self.expensive || self.uses_cellular && !self.uses_wifi,
            constrained: self.constrained,
            alternate_available: self.available_interfaces > 1,
        }
    }
}

fn cellular_generation(radio: Option<&str>) -> CellularGeneration {
    let Some(radio) = radio else {
        return CellularGeneration::Unknown;
    };
    let radio = radio.to_ascii_uppercase();
    let radio = radio
        .strip_prefix("CTRADIOACCESSTECHNOLOGY")
        .unwrap_or(&radio);
    if radio.starts_with("NR") {
        CellularGeneration::G5
    } else if radio.contains("LTE") {
        CellularGeneration::G4
    } else if ["WCDMA", "HSDPA", "HSUPA", "EVDO", "EHRPD", "UMTS"]
        .iter()
        .any(|tech| radio.contains(tech))
    {
        CellularGeneration::G3
    } else if ["GPRS", "EDGE", "CDMA1X", "GSM"]
        .iter()
        .any(|tech| radio.contains(tech))
    {
        CellularGeneration::G2
    } else {
        CellularGeneration::Unknown
    }
}

/// Measurement capability used by the quality monitor.
#[async_trait::async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn path(&self) -> PathSnapshot;

    /// One round trip to `endpoint`.
    async fn round_trip(&self, endpoint: &str) -> Result<Duration, TransportError>;

    /// Downstream bandwidth estimate in Mbps, if one can be taken.
    async fn bandwidth_mbps(&self) -> Option<f64>;
}

/// Probe that times HTTP round trips with `reqwest`.
///
/// Path attributes cannot be read portably, so the embedding application
/// pushes them in with [`HttpProbe::update_path`].
pub struct HttpProbe {
    client: reqwest::Client,
    bandwidth_url: Option<String>,
    attributes: Mutex<PathAttributes>,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build probe client: {e}")))?;
        Ok(Self {
            client,
            bandwidth_url: None,
            attributes: Mutex::new(PathAttributes {
                satisfied: true,
                available_interfaces: 1,
                ..PathAttributes::default()
            }),
        })
    }

    /// URL of a payload downloaded to estimate bandwidth.
    pub fn with_bandwidth_url(mut self, url: impl Into<String>) -> Self {
        self.bandwidth_url = Some(url.into());
        self
    }

    pub fn update_path(&self, attributes: PathAttributes) {
        if let Ok(mut current) = self.attributes.lock() {
            *current = attributes;
        }
    }
}

#[async_trait::async_trait]
impl NetworkProbe for HttpProbe {
    async fn path(&self) -> PathSnapshot {
        self.attributes
            .lock()
            .map(|attrs| attrs.classify())
            .unwrap_or_default()
    }

    async fn round_trip(&self, endpoint: &str) -> Result<Duration, TransportError> {
        let started = Instant::now();
        self.client.head(endpoint).send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                TransportErrorKind::Timeout
            } else if e.is_connect() {
                TransportErrorKind::Connect
            } else {
                TransportErrorKind::Io
            };
            TransportError::new(kind, e.to_string())
        })?;
        Ok(started.elapsed())
    }

    async fn bandwidth_mbps(&self) -> Option<f64> {
        let url = self.bandwidth_url.as_ref()?;
        let started = Instant::now();
        let response = self.client.get(url).send().await.ok()?;
        let mut body = response.bytes_stream();
        let mut bytes = 0u64;
        while let Some(chunk) = body.next().await {
            bytes += chunk.ok()?.len() as u64;
        }
        let seconds = started.elapsed().as_secs_f64();
        if seconds <= 0.0 || bytes == 0 {
            return None;
        }
        let mbps = bytes as f64 * 8.0 / seconds / 1_000_000.0;
        debug!(bytes, seconds, mbps, "bandwidth probe finished");
        Some(mbps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_cellular_generations() {
        let attrs = |radio: &str| PathAttributes {
            satisfied: true,
            uses_cellular: true,
            radio_technology: Some(radio.to_string()),
            available_interfaces: 1,
            ..PathAttributes::default()
        };
        assert_eq!(
            attrs("CTRadioAccessTechnologyNRNSA").classify().kind,
            ConnectionKind::Cellular(CellularGeneration::G5)
        );
        assert_eq!(
            attrs("NR").classify().kind,
            ConnectionKind::Cellular(CellularGeneration::G5)
        );
        assert_eq!(
            attrs("carrier-pigeon").classify().kind,
            ConnectionKind::Cellular(CellularGeneration::Unknown)
        );
        assert_eq!(
            attrs("LTE").classify().kind,
            ConnectionKind::Cellular(CellularGeneration::G4)
        );
        assert_eq!(
            attrs("HSDPA").classify().kind,
            ConnectionKind::Cellular(CellularGeneration::G3)
        );
        assert_eq!(
            attrs("Edge").classify().kind,
            ConnectionKind::Cellular(CellularGeneration::G2)
        );
        assert!(attrs("LTE").classify().metered);
    }

    #[test]
    fn wired_beats_wifi_and_alternates_are_detected() {
        let snapshot = PathAttributes {
            satisfied: true,
            uses_wifi: true,
            uses_wired: true,
            available_interfaces: 2,
            ..PathAttributes::default()
        }
        .classify();
        assert_eq!(snapshot.kind, ConnectionKind::Ethernet);
        assert!(snapshot.alternate_available);
        assert!(!snapshot.metered);
    }

    #[test]
    fn unsatisfied_without_interfaces_is_none() {
        let snapshot = PathAttributes::default().classify();
        assert_eq!(snapshot.kind, ConnectionKind::None);
        assert!(!snapshot.satisfied);
    }

    #[tokio::test]
    async fn http_probe_reports_pushed_path() {
        let probe = HttpProbe::new(Duration::from_millis(200)).expect("probe");
        assert!(probe.path().await.satisfied);
        probe.update_path(PathAttributes {
            satisfied: true,
            uses_wifi: true,
            expensive: true,
            available_interfaces: 1,
            ..PathAttributes::default()
        });
        let path = probe.path().await;
        assert_eq!(path.kind, ConnectionKind::Wifi);
        assert!(path.metered);
        assert!(probe.bandwidth_mbps().await.is_none());
    }
}
