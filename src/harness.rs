use std::future;
use std::sync::Arc;

use chrono::Utc;
use tokio::select;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{RunVariant, TestConfig};
use crate::http_load::{HttpAttempt, LocationPoster, ProbeError};
use crate::metrics::{MetricsError, MetricsPoller, MetricsSnapshot};
use crate::report::{Report, ReportConfig, ReportError, write_report};
use crate::schedule::{Deadline, Metronome, Tick};
use crate::socket::{SocketEvent, SocketSession};
use crate::types::LocationUpdate;
use crate::walk::{CourierWalk, DEFAULT_ORIGIN};

/// Drives socket and HTTP traffic for the configured duration and returns the
/// finalized report. The `Reporting` variant also polls server metrics and writes
/// the report to `config.report_path`.
///
/// # Errors
///
/// Returns [`HarnessError`] when the HTTP clients cannot be built or the report
/// cannot be written. Individual request failures are counted, never returned.
pub async fn run_load_test(
    config: &TestConfig,
    variant: RunVariant,
) -> Result<Report, HarnessError> {
    let poster = Arc::new(LocationPoster::new(
        &config.base_url,
        &config.order_id,
        config.token.clone(),
        config.http_timeout(),
    )?);
    let poller = match variant {
        RunVariant::Reporting => Some(Arc::new(MetricsPoller::new(
            &config.base_url,
            config.metrics_timeout(),
        )?)),
        RunVariant::Basic => None,
    };

    info!(
        endpoint = %poster.endpoint(),
        socket_url = %config.socket_url,
        order_id = %config.order_id,
        authenticated = config.token.is_some(),
        duration_sec = config.duration_sec,
        socket_rate_hz = config.socket_rate_hz,
        http_rate_hz = config.http_rate_hz,
        metrics = poller.is_some(),
        "starting load test"
    );

    let mut report = Report::new(ReportConfig::from(config), Utc::now());
    if let Some(poller) = &poller {
        sample_into(poller, &mut report.metrics).await;
    }

    let deadline = Deadline::after(config.duration());
    let socket = (config.socket_rate_hz > 0).then(|| {
        SocketSession::spawn(
            config.socket_url.clone(),
            config.order_id.clone(),
            config.http_timeout(),
        )
    });
    let metrics_period = poller.as_ref().map(|_| config.metrics_interval());

    let mut driver = Driver {
        config,
        report,
        walk: CourierWalk::from_entropy(DEFAULT_ORIGIN),
        poster,
        poller,
        socket,
        deadline,
        socket_beat: Metronome::new(config.socket_rate_hz, deadline),
        http_beat: Metronome::new(config.http_rate_hz, deadline),
        metrics_beat: Metronome::with_period(metrics_period, deadline),
        http_in_flight: JoinSet::new(),
        metrics_in_flight: JoinSet::new(),
    };
    debug!(
        socket_period = ?driver.socket_beat.period(),
        http_period = ?driver.http_beat.period(),
        metrics_period = ?driver.metrics_beat.period(),
        socket_enabled = driver.socket_beat.is_enabled(),
        http_enabled = driver.http_beat.is_enabled(),
        "metronomes armed"
    );
    driver.run().await;
    let report = driver.finish().await;

    log_run_summary(&report);
    if variant == RunVariant::Reporting {
        write_report(&config.report_path, &report)?;
        info!(path = %config.report_path.display(), "report written");
    }
    Ok(report)
}

/// Single owner of the run state: the walk, the counters and the metrics list are
/// only touched from the event loop, so nothing is shared across tasks.
struct Driver<'a> {
    config: &'a TestConfig,
    report: Report,
    walk: CourierWalk,
    poster: Arc<LocationPoster>,
    poller: Option<Arc<MetricsPoller>>,
    socket: Option<SocketSession>,
    deadline: Deadline,
    socket_beat: Metronome,
    http_beat: Metronome,
    metrics_beat: Metronome,
    http_in_flight: JoinSet<HttpAttempt>,
    metrics_in_flight: JoinSet<Result<MetricsSnapshot, MetricsError>>,
}

impl Driver<'_> {
    async fn run(&mut self) {
        loop {
            select! {
                () = self.deadline.elapsed() => break,
                tick = self.socket_beat.tick() => {
                    if tick == Tick::Fire {
                        self.emit_socket_update();
                    }
                }
                tick = self.http_beat.tick() => {
                    if tick == Tick::Fire {
                        self.dispatch_http_update();
                    }
                }
                tick = self.metrics_beat.tick() => {
                    if tick == Tick::Fire {
                        self.dispatch_metrics_sample();
                    }
                }
                Some(joined) = self.http_in_flight.join_next() => self.record_http(joined),
                Some(joined) = self.metrics_in_flight.join_next() => self.record_metrics(joined),
                event = next_socket_event(self.socket.as_mut()) => self.observe_socket(event),
            }
        }
    }

    fn emit_socket_update(&mut self) {
        let Some(socket) = &self.socket else {
            return;
        };
        let location = self.walk.step();
        socket.emit(LocationUpdate::new(self.config.order_id.clone(), location));
        self.report.socket.sent = self.report.socket.sent.saturating_add(1);
    }

    fn dispatch_http_update(&mut self) {
        let location = self.walk.step();
        let poster = Arc::clone(&self.poster);
        self.report.http.note_dispatch();
        self.http_in_flight
            .spawn(async move { poster.post(location).await });
    }

    fn dispatch_metrics_sample(&mut self) {
        let Some(poller) = &self.poller else {
            return;
        };
        if !self.metrics_in_flight.is_empty() {
            debug!("previous metrics sample still in flight; skipping tick");
            return;
        }
        let poller = Arc::clone(poller);
        self.metrics_in_flight
            .spawn(async move { poller.sample().await });
    }

    fn record_http(&mut self, joined: Result<HttpAttempt, JoinError>) {
        match joined {
            Ok(attempt) => self.report.http.record(&attempt),
            Err(error) if error.is_cancelled() => {}
            Err(error) => warn!(%error, "location POST task failed"),
        }
    }

    fn record_metrics(&mut self, joined: Result<Result<MetricsSnapshot, MetricsError>, JoinError>) {
        match joined {
            Ok(sample) => push_sample(sample, &mut self.report.metrics),
            Err(error) if error.is_cancelled() => {}
            Err(error) => warn!(%error, "metrics task failed"),
        }
    }

    fn observe_socket(&mut self, event: SocketEvent) {
        apply_socket_event(&mut self.report, event);
    }

    async fn finish(mut self) -> Report {
        self.socket_beat.stop();
        self.http_beat.stop();
        self.metrics_beat.stop();

        if let Some(socket) = self.socket.take() {
            for event in socket.close().await {
                apply_socket_event(&mut self.report, event);
            }
        }

        self.metrics_in_flight.abort_all();
        if let Some(poller) = &self.poller {
            sample_into(poller, &mut self.report.metrics).await;
        }

        while let Some(joined) = self.http_in_flight.try_join_next() {
            self.record_http(joined);
        }
        let lost = self.http_in_flight.len();
        if lost > 0 {
            warn!(lost, "aborting location POSTs still in flight at the deadline");
        }
        self.http_in_flight.abort_all();

        self.report.finalize(Utc::now());
        self.report
    }
}

fn apply_socket_event(report: &mut Report, event: SocketEvent) {
    let socket = &mut report.socket;
    match event {
        SocketEvent::Connected => socket.connected = true,
        SocketEvent::Disconnected { reason } => {
            socket.connected = false;
            socket.disconnects = socket.disconnects.saturating_add(1);
            warn!(%reason, disconnects = socket.disconnects, "socket disconnected");
        }
        SocketEvent::ConnectError { reason } => {
            socket.errors = socket.errors.saturating_add(1);
            warn!(%reason, errors = socket.errors, "socket connect error");
        }
    }
}

async fn next_socket_event(socket: Option<&mut SocketSession>) -> SocketEvent {
    match socket {
        Some(socket) => socket.next_event().await,
        None => future::pending().await,
    }
}

async fn sample_into(poller: &MetricsPoller, metrics: &mut Vec<MetricsSnapshot>) {
    push_sample(poller.sample().await, metrics);
}

fn push_sample(sample: Result<MetricsSnapshot, MetricsError>, metrics: &mut Vec<MetricsSnapshot>) {
    match sample {
        Ok(snapshot) => {
            debug!(
                rss_mb = format_args!("{:.1}", snapshot.memory.rss_mb()),
                heap_used_mb = format_args!("{:.1}", snapshot.memory.heap_used_mb()),
                clients = ?snapshot.sockets.clients,
                "metrics sample"
            );
            metrics.push(snapshot);
        }
        Err(error) => warn!(%error, "metrics sample skipped"),
    }
}

fn log_run_summary(report: &Report) {
    let http = &report.http;
    let socket = &report.socket;
    info!(
        http_sent = http.sent,
        http_success = http.success,
        http_errors = http.errors,
        http_timeouts = http.timeouts,
        slow_requests = http.slow_requests,
        very_slow_requests = http.very_slow_requests,
        p50_ms = http.stats.p50,
        p95_ms = http.stats.p95,
        p99_ms = http.stats.p99,
        socket_connected = socket.connected,
        socket_sent = socket.sent,
        socket_disconnects = socket.disconnects,
        socket_errors = socket.errors,
        metrics_samples = report.metrics.len(),
        "load test complete"
    );
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to prepare HTTP traffic: {0}")]
    Probe(#[from] ProbeError),
    #[error("report error: {0}")]
    Report(#[from] ReportError),
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::path::PathBuf;

    use chrono::Utc;
    use tokio::net::TcpListener;
    use url::Url;

    use super::{HarnessError, apply_socket_event, run_load_test};
    use crate::config::{RunVariant, TestConfig};
    use crate::report::{Report, ReportConfig};
    use crate::socket::SocketEvent;
    use crate::types::OrderId;

    async fn refused_base() -> Result<Url, Box<dyn Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(Url::parse(&format!("http://{addr}"))?)
    }

    fn config(base_url: Url, socket_rate_hz: u32, http_rate_hz: u32) -> Result<TestConfig, Box<dyn Error>> {
        let mut socket_url = base_url.clone();
        socket_url
            .set_scheme("ws")
            .map_err(|()| "cannot switch test url to ws")?;
        socket_url.set_path("/socket.io/");
        socket_url.set_query(Some("EIO=4&transport=websocket"));
        Ok(TestConfig {
            base_url,
            socket_url,
            order_id: OrderId::from("order-1"),
            token: None,
            duration_sec: 1,
            socket_rate_hz,
            http_rate_hz,
            metrics_interval_sec: 10,
            http_timeout_ms: 500,
            metrics_timeout_ms: 500,
            report_path: PathBuf::from("unused.json"),
        })
    }

    #[tokio::test]
    async fn zero_rates_send_nothing() -> Result<(), Box<dyn Error>> {
        let config = config(refused_base().await?, 0, 0)?;
        let report = run_load_test(&config, RunVariant::Basic).await?;

        assert_eq!(report.http.sent, 0);
        assert_eq!(report.socket.sent, 0);
        assert_eq!(report.socket.errors, 0);
        assert!(report.metrics.is_empty());
        assert!(report.end_time.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_target_is_counted_not_fatal() -> Result<(), Box<dyn Error>> {
        let config = config(refused_base().await?, 10, 10)?;
        let report: Result<_, HarnessError> = run_load_test(&config, RunVariant::Basic).await;
        let report = report?;

        assert!(report.http.sent > 0);
        assert_eq!(report.http.success, 0);
        assert!(report.http.completed() <= report.http.sent);
        assert_eq!(report.http.errors, report.http.completed());
        assert_eq!(report.http.latencies.len(), usize::try_from(report.http.completed())?);
        assert!(report.socket.sent > 0);
        assert!(!report.socket.connected);
        assert_eq!(report.socket.errors, 1);
        assert_eq!(report.socket.disconnects, 0);
        Ok(())
    }

    #[test]
    fn socket_events_update_counters() {
        let mut report = Report::new(
            ReportConfig {
                base_url: "http://localhost:5000/".to_owned(),
                order_id: "order-1".to_owned(),
                authenticated: false,
                duration_sec: 1,
                socket_rate_hz: 10,
                http_rate_hz: 5,
                metrics_interval_sec: 10,
            },
            Utc::now(),
        );

        apply_socket_event(&mut report, SocketEvent::Connected);
        assert!(report.socket.connected);

        apply_socket_event(
            &mut report,
            SocketEvent::Disconnected {
                reason: "transport close".to_owned(),
            },
        );
        apply_socket_event(
            &mut report,
            SocketEvent::ConnectError {
                reason: "refused".to_owned(),
            },
        );

        assert!(!report.socket.connected);
        assert_eq!(report.socket.disconnects, 1);
        assert_eq!(report.socket.errors, 1);
    }
}
