use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::analysis::{Analysis, Verdict};
use crate::config::TestConfig;
use crate::http_load::{AttemptOutcome, HttpAttempt};
use crate::metrics::MetricsSnapshot;

pub const SLOW_REQUEST_MS: u64 = 1_000;
pub const VERY_SLOW_REQUEST_MS: u64 = 2_000;
pub const LIVE_WARNING_MS: u64 = 500;

/// Run parameters as recorded in the report. The auth token itself is never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    pub base_url: String,
    pub order_id: String,
    pub authenticated: bool,
    pub duration_sec: u64,
    pub socket_rate_hz: u32,
    pub http_rate_hz: u32,
    pub metrics_interval_sec: u64,
}

impl From<&TestConfig> for ReportConfig {
    fn from(config: &TestConfig) -> Self {
        Self {
            base_url: config.base_url.to_string(),
            order_id: config.order_id.to_string(),
            authenticated: config.token.is_some(),
            duration_sec: config.duration_sec,
            socket_rate_hz: config.socket_rate_hz,
            http_rate_hz: config.http_rate_hz,
            metrics_interval_sec: config.metrics_interval_sec,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub avg: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

impl LatencyStats {
    #[must_use]
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        Self {
            min: samples.iter().copied().min().unwrap_or(0),
            max: samples.iter().copied().max().unwrap_or(0),
            avg: mean(samples),
            p50: percentile(samples, 0.50),
            p95: percentile(samples, 0.95),
            p99: percentile(samples, 0.99),
        }
    }
}

/// HTTP channel counters.
///
/// `success + errors + timeouts <= sent` always holds, and every recorded attempt
/// contributes exactly one latency sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpCounters {
    pub sent: u64,
    pub success: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub slow_requests: u64,
    pub very_slow_requests: u64,
    pub latencies: Vec<u64>,
    #[serde(default)]
    pub stats: LatencyStats,
}

impl HttpCounters {
    pub const fn note_dispatch(&mut self) {
        self.sent = self.sent.saturating_add(1);
    }

    pub fn record(&mut self, attempt: &HttpAttempt) {
        let latency_ms = attempt.latency_ms;
        match &attempt.outcome {
            AttemptOutcome::Success { .. } => {
                self.success = self.success.saturating_add(1);
            }
            AttemptOutcome::Error { status, detail } => {
                self.errors = self.errors.saturating_add(1);
                warn!(latency_ms, status = ?status, body = %detail, "location POST failed");
            }
            AttemptOutcome::Timeout => {
                self.timeouts = self.timeouts.saturating_add(1);
                warn!(latency_ms, "location POST timed out; server may be hanging");
            }
        }

        if latency_ms > SLOW_REQUEST_MS {
            self.slow_requests = self.slow_requests.saturating_add(1);
        }
        if latency_ms > VERY_SLOW_REQUEST_MS {
            self.very_slow_requests = self.very_slow_requests.saturating_add(1);
        }
        if latency_ms > LIVE_WARNING_MS && !matches!(attempt.outcome, AttemptOutcome::Timeout) {
            warn!(latency_ms, "slow location POST");
        }

        self.latencies.push(latency_ms);
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.success
            .saturating_add(self.errors)
            .saturating_add(self.timeouts)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketCounters {
    pub connected: bool,
    pub sent: u64,
    pub disconnects: u64,
    pub errors: u64,
}

/// The persisted artifact shared by the driver and the analyzer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub config: ReportConfig,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub http: HttpCounters,
    pub socket: SocketCounters,
    #[serde(default)]
    pub metrics: Vec<MetricsSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
}

impl Report {
    #[must_use]
    pub fn new(config: ReportConfig, start_time: DateTime<Utc>) -> Self {
        Self {
            config,
            start_time,
            end_time: None,
            http: HttpCounters::default(),
            socket: SocketCounters::default(),
            metrics: Vec::new(),
            verdict: None,
            analysis: None,
        }
    }

    /// Stamps the end time and derives latency statistics from the raw samples.
    pub fn finalize(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.http.stats = LatencyStats::from_samples(&self.http.latencies);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to create report parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write report at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no report at {path}; run the load test first")]
    Missing { path: PathBuf },
    #[error("failed to read report at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse report at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Writes a pretty-printed report JSON file to disk.
///
/// # Errors
///
/// Returns [`ReportError`] if parent directory creation, serialization, or file
/// writing fails.
pub fn write_report(path: &Path, report: &Report) -> Result<(), ReportError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ReportError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let payload = serde_json::to_string_pretty(report)?;
    fs::write(path, payload).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a report previously written by [`write_report`].
///
/// # Errors
///
/// Returns [`ReportError::Missing`] when no file exists at `path`, and
/// [`ReportError::Read`] or [`ReportError::Parse`] on other failures.
pub fn read_report(path: &Path) -> Result<Report, ReportError> {
    let raw = fs::read_to_string(path).map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            ReportError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            ReportError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    serde_json::from_str(&raw).map_err(|source| ReportError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Nearest-rank percentile: `sorted[floor(len * q)]`, clamped to the last element.
#[must_use]
pub fn percentile(samples: &[u64], q: f64) -> u64 {
    if samples.is_empty() {
        return 0;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    let last_idx = sorted.len() - 1;
    let bounded = q.clamp(0.0, 1.0);
    let len = u32::try_from(sorted.len()).map_or(u32::MAX, |value| value);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rank = (f64::from(len) * bounded).floor() as usize;

    sorted[rank.min(last_idx)]
}

/// Arithmetic mean; zero for an empty slice.
#[must_use]
pub fn mean(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total = samples
        .iter()
        .fold(0.0, |acc, value| acc + u64_to_f64_lossless(*value));
    total / usize_to_f64(samples.len())
}

pub(crate) fn u64_to_f64_lossless(value: u64) -> f64 {
    let hi = u32::try_from(value >> 32).unwrap_or(u32::MAX);
    let lo = u32::try_from(value & u64::from(u32::MAX)).unwrap_or(u32::MAX);
    f64::from(hi) * 4_294_967_296.0 + f64::from(lo)
}

pub(crate) fn usize_to_f64(value: usize) -> f64 {
    u64_to_f64_lossless(u64::try_from(value).map_or(u64::MAX, |value| value))
}
