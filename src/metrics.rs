use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::{self, Duration};
use url::Url;

use crate::http_load::{ProbeError, api_endpoint};

pub const BYTES_PER_MB: f64 = 1_024.0 * 1_024.0;

/// Process memory as reported by the target server, in bytes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    #[serde(default)]
    pub rss: f64,
    #[serde(default)]
    pub heap_used: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MemoryStats {
    #[must_use]
    pub fn rss_mb(&self) -> f64 {
        self.rss / BYTES_PER_MB
    }

    #[must_use]
    pub fn heap_used_mb(&self) -> f64 {
        self.heap_used / BYTES_PER_MB
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SocketStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One server-side health sample. Snapshots are kept in chronological order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub memory: MemoryStats,
    #[serde(default)]
    pub sockets: SocketStats,
    #[serde(default)]
    pub mongo: Value,
}

#[derive(Debug, Deserialize)]
struct MetricsEnvelope {
    data: MetricsBody,
}

#[derive(Debug, Deserialize)]
struct MetricsBody {
    #[serde(default)]
    memory: MemoryStats,
    #[serde(default)]
    sockets: SocketStats,
    #[serde(default)]
    mongo: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metrics endpoint returned HTTP {status}")]
    Status { status: u16 },
    #[error("metrics request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u128 },
    #[error("malformed metrics payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Fetches `GET {base}/api/metrics` snapshots from the target server.
#[derive(Clone, Debug)]
pub struct MetricsPoller {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl MetricsPoller {
    /// Builds a poller against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when the client cannot be built or the endpoint URL is
    /// invalid.
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .build()
            .map_err(|source| ProbeError::Client { source })?;
        Ok(Self {
            client,
            endpoint: api_endpoint(base_url, "api/metrics")?,
            timeout,
        })
    }

    /// Fetches and normalizes one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] on transport failure, non-2xx status, timeout, or an
    /// unparseable body. Callers skip the sample.
    pub async fn sample(&self) -> Result<MetricsSnapshot, MetricsError> {
        match time::timeout(self.timeout, self.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(MetricsError::Timeout {
                timeout_ms: self.timeout.as_millis(),
            }),
        }
    }

    async fn fetch(&self) -> Result<MetricsSnapshot, MetricsError> {
        let response = self.client.get(self.endpoint.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::Status {
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        parse_snapshot(&body, Utc::now())
    }
}

/// Normalizes a `{ data: { memory, sockets, mongo } }` payload into a snapshot.
///
/// # Errors
///
/// Returns [`MetricsError::Payload`] when the body is not a metrics envelope.
pub fn parse_snapshot(body: &[u8], timestamp: DateTime<Utc>) -> Result<MetricsSnapshot, MetricsError> {
    let envelope: MetricsEnvelope = serde_json::from_slice(body)?;
    Ok(MetricsSnapshot {
        timestamp,
        memory: envelope.data.memory,
        sockets: envelope.data.sockets,
        mongo: envelope.data.mongo,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{BYTES_PER_MB, MetricsError, parse_snapshot};

    #[test]
    fn parses_server_envelope_and_keeps_unknown_fields() -> Result<(), MetricsError> {
        let body = json!({
            "success": true,
            "data": {
                "memory": {"rss": 104_857_600, "heapUsed": 52_428_800, "heapTotal": 70_000_000, "arrayBuffers": 12},
                "sockets": {"clients": 3, "rooms": 2},
                "mongo": {"poolSize": 10, "inUse": 1}
            }
        });
        let snapshot = parse_snapshot(body.to_string().as_bytes(), Utc::now())?;

        assert!((snapshot.memory.rss_mb() - 100.0).abs() < f64::EPSILON);
        assert!((snapshot.memory.heap_used_mb() - 50.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.memory.heap_total, Some(70_000_000.0));
        assert_eq!(snapshot.memory.extra.get("arrayBuffers"), Some(&json!(12)));
        assert_eq!(snapshot.sockets.clients, Some(3));
        assert_eq!(snapshot.sockets.extra.get("rooms"), Some(&json!(2)));
        assert_eq!(snapshot.mongo["poolSize"], 10);
        Ok(())
    }

    #[test]
    fn missing_sections_default_to_empty() -> Result<(), MetricsError> {
        let snapshot = parse_snapshot(br#"{"data":{}}"#, Utc::now())?;
        assert!(snapshot.memory.rss.abs() < f64::EPSILON);
        assert_eq!(snapshot.sockets.clients, None);
        assert!(snapshot.mongo.is_null());
        Ok(())
    }

    #[test]
    fn body_without_data_envelope_is_rejected() {
        assert!(matches!(
            parse_snapshot(br#"{"memory":{}}"#, Utc::now()),
            Err(MetricsError::Payload(_))
        ));
    }

    #[test]
    fn mb_conversion_uses_binary_megabytes() {
        assert!((BYTES_PER_MB - 1_048_576.0).abs() < f64::EPSILON);
    }
}
