pub mod analysis;
pub mod config;
pub mod harness;
pub mod http_load;
pub mod metrics;
pub mod report;
pub mod schedule;
pub mod socket;
pub mod socketio;
pub mod types;
pub mod walk;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("failed to initialize tracing")]
    TracingInit,
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("load test error: {0}")]
    Harness(#[from] harness::HarnessError),
    #[error("report error: {0}")]
    Report(#[from] report::ReportError),
}
