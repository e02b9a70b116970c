use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::metrics::MetricsSnapshot;
use crate::report::{
    HttpCounters, LatencyStats, ReportError, SocketCounters, mean, read_report, u64_to_f64_lossless,
    write_report,
};

pub const MIN_SUCCESS_RATE_PCT: f64 = 95.0;
pub const MIN_SENT_FOR_SUCCESS_RATE: u64 = 10;
pub const P95_ISSUE_MS: u64 = 2_000;
pub const P95_WARNING_MS: u64 = 1_000;
pub const VERY_SLOW_WARNING_PCT: f64 = 5.0;
/// Below this many latency samples a p95 breach is only a warning.
pub const MIN_PERCENTILE_SAMPLES: usize = 20;
pub const MIN_DEGRADATION_SAMPLES: usize = 20;
pub const DEGRADATION_ISSUE_PCT: f64 = 50.0;
pub const DEGRADATION_WARNING_PCT: f64 = 20.0;
pub const RSS_LEAK_PCT: f64 = 50.0;
pub const RSS_LEAK_MB: f64 = 100.0;
pub const RSS_WARNING_PCT: f64 = 30.0;
pub const RSS_WARNING_MB: f64 = 50.0;
pub const RSS_STABLE_MB: f64 = 50.0;
pub const RSS_STABLE_PCT: f64 = 20.0;
pub const CONTINUOUS_GROWTH_MIN_SAMPLES: usize = 5;
pub const CONTINUOUS_GROWTH_HALF_MB: f64 = 20.0;
pub const CONTINUOUS_GROWTH_RATIO: f64 = 0.7;
pub const MAX_SOCKET_DISCONNECTS: u64 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    PassedWithWarnings,
    Failed,
}

impl Verdict {
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Passed | Self::PassedWithWarnings => 0,
            Self::Failed => 1,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "PASSED",
            Self::PassedWithWarnings => "PASSED_WITH_WARNINGS",
            Self::Failed => "FAILED",
        })
    }
}

/// Category of a verdict-failing finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ServerHanging,
    LowSuccessRate,
    HighLatency,
    PerformanceDegrading,
    MemoryLeak,
    SocketInstability,
}

impl IssueKind {
    #[must_use]
    pub const fn headline(self) -> &'static str {
        match self {
            Self::ServerHanging => "SERVER HANGING DETECTED",
            Self::LowSuccessRate => "LOW SUCCESS RATE",
            Self::HighLatency => "HIGH LATENCY",
            Self::PerformanceDegrading => "PERFORMANCE DEGRADING",
            Self::MemoryLeak => "MEMORY LEAK SUSPECTED",
            Self::SocketInstability => "SOCKET INSTABILITY",
        }
    }

    #[must_use]
    pub const fn remediation(self) -> &'static [&'static str] {
        match self {
            Self::ServerHanging => &[
                "Check the location route for code paths that never send a response",
                "Look for unawaited or never-settling async work in the handler",
                "Inspect the database connection pool for exhaustion under concurrent writes",
                "Add a server-side request timeout so hung requests fail fast",
            ],
            Self::LowSuccessRate => &[
                "Group the logged error bodies by status to find the dominant failure",
                "Verify the order id exists and the token is authorized for it",
                "Check whether server-side rate limiting rejects the configured HTTP rate",
            ],
            Self::HighLatency => &[
                "Profile the location update handler for slow queries",
                "Verify the orders collection is indexed on the fields the update filters on",
                "Check event-loop lag on the server while socket traffic is active",
            ],
            Self::PerformanceDegrading => &[
                "Look for in-memory collections that grow with every update and are scanned per request",
                "Watch database pool wait times as the run progresses",
                "Check whether socket rooms or listeners accumulate over the run",
            ],
            Self::MemoryLeak => &[
                "Remove socket event listeners and leave rooms on disconnect",
                "Bound or expire any per-order in-memory caches",
                "Diff heap snapshots taken before and after a run",
            ],
            Self::SocketInstability => &[
                "Compare the server ping interval and timeout with proxy idle timeouts",
                "Check server logs for errors thrown inside socket handlers",
                "Verify the load balancer supports sticky websocket connections",
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryGrowth {
    pub samples: usize,
    pub first_rss_mb: f64,
    pub last_rss_mb: f64,
    pub rss_growth_mb: f64,
    pub rss_growth_pct: f64,
    pub heap_growth_mb: f64,
}

/// Derived figures the verdict was computed from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub success_rate: f64,
    pub latency: LatencyStats,
    pub latency_samples: usize,
    pub very_slow_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degradation_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryGrowth>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub issues: Vec<Issue>,
    pub warnings: Vec<String>,
    pub passed: Vec<String>,
    pub verdict: Verdict,
    #[serde(default)]
    pub summary: AnalysisSummary,
}

impl Analysis {
    /// Distinct issue kinds in first-seen order.
    #[must_use]
    pub fn issue_kinds(&self) -> Vec<IssueKind> {
        let mut seen = BTreeSet::new();
        self.issues
            .iter()
            .filter(|issue| seen.insert(issue.kind))
            .map(|issue| issue.kind)
            .collect()
    }

    #[must_use]
    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|issue| issue.kind == kind)
    }
}

#[derive(Debug, Default)]
struct Findings {
    issues: Vec<Issue>,
    warnings: Vec<String>,
    passed: Vec<String>,
}

impl Findings {
    fn issue(&mut self, kind: IssueKind, detail: impl fmt::Display) {
        self.issues.push(Issue {
            kind,
            message: format!("{}: {detail}", kind.headline()),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn pass(&mut self, message: impl Into<String>) {
        self.passed.push(message.into());
    }

    fn verdict(&self) -> Verdict {
        if !self.issues.is_empty() {
            Verdict::Failed
        } else if !self.warnings.is_empty() {
            Verdict::PassedWithWarnings
        } else {
            Verdict::Passed
        }
    }
}

/// Applies every rule group to a report and rolls the findings into a verdict.
#[must_use]
pub fn analyze(report: &crate::report::Report) -> Analysis {
    let mut findings = Findings::default();

    let success_rate = check_success_rate(&report.http, &mut findings);
    let latency = LatencyStats::from_samples(&report.http.latencies);
    let very_slow_pct = check_latency(&report.http, &latency, &mut findings);
    let degradation_pct = check_degradation(&report.http.latencies, &mut findings);
    let memory = check_memory(&report.metrics, &mut findings);
    check_socket(&report.socket, &mut findings);

    let verdict = findings.verdict();
    Analysis {
        issues: findings.issues,
        warnings: findings.warnings,
        passed: findings.passed,
        verdict,
        summary: AnalysisSummary {
            success_rate,
            latency,
            latency_samples: report.http.latencies.len(),
            very_slow_pct,
            degradation_pct,
            memory,
        },
    }
}

/// Loads the report at `path`, analyzes it, and rewrites the same file with the
/// `analysis` and top-level `verdict` fields set.
///
/// # Errors
///
/// Returns [`ReportError::Missing`] when no report exists yet, or any other
/// [`ReportError`] raised while reading or rewriting the file.
pub fn analyze_report_file(path: &Path) -> Result<Analysis, ReportError> {
    let mut report = read_report(path)?;
    let analysis = analyze(&report);
    report.verdict = Some(analysis.verdict);
    report.analysis = Some(analysis.clone());
    write_report(path, &report)?;
    Ok(analysis)
}

/// Logs findings, verdict, and remediation hints for every failing issue kind.
pub fn log_analysis(analysis: &Analysis) {
    let summary = &analysis.summary;
    info!(
        success_rate = format_args!("{:.1}", summary.success_rate),
        samples = summary.latency_samples,
        min_ms = summary.latency.min,
        avg_ms = format_args!("{:.1}", summary.latency.avg),
        p50_ms = summary.latency.p50,
        p95_ms = summary.latency.p95,
        p99_ms = summary.latency.p99,
        max_ms = summary.latency.max,
        "latency summary"
    );
    if let Some(memory) = &summary.memory {
        info!(
            samples = memory.samples,
            rss_growth_mb = format_args!("{:.1}", memory.rss_growth_mb),
            rss_growth_pct = format_args!("{:.1}", memory.rss_growth_pct),
            heap_growth_mb = format_args!("{:.1}", memory.heap_growth_mb),
            "memory summary"
        );
    }

    for entry in &analysis.passed {
        info!("passed: {entry}");
    }
    for entry in &analysis.warnings {
        warn!("warning: {entry}");
    }
    for issue in &analysis.issues {
        error!(kind = ?issue.kind, "issue: {}", issue.message);
    }

    match analysis.verdict {
        Verdict::Failed => {
            error!(verdict = %analysis.verdict, issues = analysis.issues.len(), "load test failed");
            for kind in analysis.issue_kinds() {
                for hint in kind.remediation() {
                    warn!(kind = ?kind, "suggestion: {hint}");
                }
            }
        }
        Verdict::PassedWithWarnings => {
            warn!(verdict = %analysis.verdict, warnings = analysis.warnings.len(), "load test passed with warnings");
        }
        Verdict::Passed => info!(verdict = %analysis.verdict, "load test passed"),
    }
}

fn check_success_rate(http: &HttpCounters, findings: &mut Findings) -> f64 {
    let success_rate = ratio_pct(http.success, http.sent);

    if http.timeouts > 0 {
        findings.issue(
            IssueKind::ServerHanging,
            format!(
                "{} request(s) hit the client timeout without any response",
                http.timeouts
            ),
        );
    }

    if success_rate < MIN_SUCCESS_RATE_PCT && http.sent > MIN_SENT_FOR_SUCCESS_RATE {
        findings.issue(
            IssueKind::LowSuccessRate,
            format!(
                "{success_rate:.1}% ({}/{}) below {MIN_SUCCESS_RATE_PCT}%",
                http.success, http.sent
            ),
        );
    } else if success_rate >= MIN_SUCCESS_RATE_PCT {
        findings.pass(format!(
            "Good success rate: {success_rate:.1}% ({}/{})",
            http.success, http.sent
        ));
    }

    success_rate
}

fn check_latency(http: &HttpCounters, latency: &LatencyStats, findings: &mut Findings) -> f64 {
    let very_slow_pct = ratio_pct(http.very_slow_requests, http.sent);
    if http.latencies.is_empty() {
        return very_slow_pct;
    }

    let samples = http.latencies.len();
    if latency.p95 > P95_ISSUE_MS {
        if samples < MIN_PERCENTILE_SAMPLES {
            findings.warn(format!(
                "p95 latency {}ms exceeds {P95_ISSUE_MS}ms, but only {samples} samples were collected",
                latency.p95
            ));
        } else {
            findings.issue(
                IssueKind::HighLatency,
                format!("p95 latency {}ms exceeds {P95_ISSUE_MS}ms", latency.p95),
            );
        }
    } else if latency.p95 > P95_WARNING_MS {
        findings.warn(format!(
            "Elevated p95 latency: {}ms exceeds {P95_WARNING_MS}ms",
            latency.p95
        ));
    } else {
        findings.pass(format!("Good p95 latency: {}ms", latency.p95));
    }

    if very_slow_pct > VERY_SLOW_WARNING_PCT {
        findings.warn(format!(
            "{very_slow_pct:.1}% of requests ({}) took longer than 2000ms",
            http.very_slow_requests
        ));
    }

    very_slow_pct
}

fn check_degradation(latencies: &[u64], findings: &mut Findings) -> Option<f64> {
    if latencies.len() <= MIN_DEGRADATION_SAMPLES {
        return None;
    }

    let quarter = latencies.len() / 4;
    let first_avg = mean(&latencies[..quarter]);
    let last_avg = mean(&latencies[latencies.len() - quarter..]);
    if first_avg <= 0.0 {
        findings.warn(format!(
            "Degradation not computable: first-quarter mean latency is 0ms (last quarter {last_avg:.0}ms)"
        ));
        return None;
    }

    let degradation_pct = (last_avg - first_avg) / first_avg * 100.0;
    if degradation_pct > DEGRADATION_ISSUE_PCT {
        findings.issue(
            IssueKind::PerformanceDegrading,
            format!(
                "latency grew {degradation_pct:.1}% from the first to the last quarter ({first_avg:.0}ms -> {last_avg:.0}ms)"
            ),
        );
    } else if degradation_pct > DEGRADATION_WARNING_PCT {
        findings.warn(format!(
            "Latency rose {degradation_pct:.1}% from the first to the last quarter ({first_avg:.0}ms -> {last_avg:.0}ms)"
        ));
    } else {
        findings.pass(format!(
            "Latency stable over the run ({degradation_pct:+.1}% first to last quarter)"
        ));
    }

    Some(degradation_pct)
}

fn check_memory(metrics: &[MetricsSnapshot], findings: &mut Findings) -> Option<MemoryGrowth> {
    let (Some(first), Some(last)) = (metrics.first(), metrics.last()) else {
        return None;
    };

    let first_rss_mb = first.memory.rss_mb();
    let last_rss_mb = last.memory.rss_mb();
    let rss_growth_mb = last_rss_mb - first_rss_mb;
    let rss_growth_pct = if first_rss_mb > 0.0 {
        rss_growth_mb / first_rss_mb * 100.0
    } else {
        0.0
    };
    let growth = MemoryGrowth {
        samples: metrics.len(),
        first_rss_mb,
        last_rss_mb,
        rss_growth_mb,
        rss_growth_pct,
        heap_growth_mb: last.memory.heap_used_mb() - first.memory.heap_used_mb(),
    };

    if rss_growth_pct > RSS_LEAK_PCT && rss_growth_mb > RSS_LEAK_MB {
        findings.issue(
            IssueKind::MemoryLeak,
            format!(
                "RSS grew {rss_growth_mb:.1}MB ({rss_growth_pct:.1}%), {first_rss_mb:.1}MB -> {last_rss_mb:.1}MB"
            ),
        );
    } else if rss_growth_pct > RSS_WARNING_PCT && rss_growth_mb > RSS_WARNING_MB {
        findings.warn(format!(
            "Notable RSS growth: {rss_growth_mb:.1}MB ({rss_growth_pct:.1}%)"
        ));
    } else if rss_growth_mb < RSS_STABLE_MB || rss_growth_pct < RSS_STABLE_PCT {
        findings.pass(format!(
            "Memory stable: RSS grew {rss_growth_mb:.1}MB ({rss_growth_pct:.1}%)"
        ));
    }

    if metrics.len() >= CONTINUOUS_GROWTH_MIN_SAMPLES {
        let mid = metrics.len() / 2;
        let mid_rss_mb = metrics[mid].memory.rss_mb();
        let first_half_mb = mid_rss_mb - first_rss_mb;
        let second_half_mb = last_rss_mb - mid_rss_mb;
        if first_half_mb > CONTINUOUS_GROWTH_HALF_MB
            && second_half_mb > CONTINUOUS_GROWTH_HALF_MB
            && second_half_mb > first_half_mb * CONTINUOUS_GROWTH_RATIO
        {
            findings.warn(format!(
                "RSS shows a continuous growth pattern (first half +{first_half_mb:.1}MB, second half +{second_half_mb:.1}MB); memory is not plateauing"
            ));
        }
    }

    Some(growth)
}

fn check_socket(socket: &SocketCounters, findings: &mut Findings) {
    if socket.disconnects > MAX_SOCKET_DISCONNECTS {
        findings.issue(
            IssueKind::SocketInstability,
            format!("{} disconnects during the run", socket.disconnects),
        );
    } else if socket.disconnects == 0 {
        findings.pass("Socket connection stable (no disconnects)");
    }

    if socket.errors > 0 {
        findings.warn(format!("{} socket connect error(s)", socket.errors));
    }
}

fn ratio_pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    u64_to_f64_lossless(part) / u64_to_f64_lossless(whole) * 100.0
}
