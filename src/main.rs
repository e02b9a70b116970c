use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};
use courier_loadtest::AppError;
use courier_loadtest::analysis::{analyze_report_file, log_analysis};
use courier_loadtest::config::{
    ConfigError, ConfigLayer, DEFAULT_REPORT_PATH, RunVariant, TestConfig, load_config_file,
};
use courier_loadtest::harness::run_load_test;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "usage: ORDER_ID=<id> [TOKEN=<jwt>] [BASE_URL=http://localhost:5000] courier-loadtest run|basic";

#[derive(Debug, Parser)]
#[command(name = "courier-loadtest")]
#[command(about = "Socket.IO + HTTP load harness and report analyzer for live order tracking")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Drive traffic, poll server metrics, and write the report file.
    Run(TrafficArgs),
    /// Drive traffic only and log a summary (60 s by default).
    Basic(TrafficArgs),
    /// Analyze a previously written report and record the verdict in it.
    Analyze {
        #[arg(long, env = "REPORT_PATH", default_value = DEFAULT_REPORT_PATH)]
        report: PathBuf,
    },
}

#[derive(Debug, Args)]
struct TrafficArgs {
    /// Optional TOML file; environment variables and flags override it.
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,
    #[arg(long, env = "SOCKET_URL")]
    socket_url: Option<String>,
    #[arg(long, env = "ORDER_ID")]
    order_id: Option<String>,
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long, env = "DURATION_SEC")]
    duration_sec: Option<u64>,
    #[arg(long, env = "SOCKET_RATE_HZ")]
    socket_rate_hz: Option<u32>,
    #[arg(long, env = "HTTP_RATE_HZ")]
    http_rate_hz: Option<u32>,
    #[arg(long, env = "METRICS_INTERVAL_SEC")]
    metrics_interval_sec: Option<u64>,
    #[arg(long, env = "HTTP_TIMEOUT_MS")]
    http_timeout_ms: Option<u64>,
    #[arg(long, env = "METRICS_TIMEOUT_MS")]
    metrics_timeout_ms: Option<u64>,
    #[arg(long, env = "REPORT_PATH")]
    report_path: Option<PathBuf>,
}

impl TrafficArgs {
    fn resolve(self, variant: RunVariant) -> Result<TestConfig, ConfigError> {
        let file_layer = match &self.config {
            Some(path) => load_config_file(path)?,
            None => ConfigLayer::default(),
        };
        let overrides = ConfigLayer {
            base_url: self.base_url,
            socket_url: self.socket_url,
            order_id: self.order_id,
            token: self.token,
            duration_sec: self.duration_sec,
            socket_rate_hz: self.socket_rate_hz,
            http_rate_hz: self.http_rate_hz,
            metrics_interval_sec: self.metrics_interval_sec,
            http_timeout_ms: self.http_timeout_ms,
            metrics_timeout_ms: self.metrics_timeout_ms,
            report_path: self.report_path,
        };
        file_layer.merge(overrides).resolve(variant)
    }
}

/// Malformed flag or env values exit like any other configuration error; help and
/// version output keep clap's own handling.
fn is_config_error(error: &clap::Error) -> bool {
    !matches!(
        error.kind(),
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
    )
}

fn init_tracing() -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|_| AppError::TracingInit)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) if !is_config_error(&error) => error.exit(),
        Err(error) => {
            let _ = error.print();
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = init_tracing() {
        eprintln!("{error}");
        return ExitCode::FAILURE;
    }

    match execute(cli.mode).await {
        Ok(code) => code,
        Err(AppError::Config(error)) => {
            error!(%error, "invalid configuration");
            eprintln!("{USAGE}");
            ExitCode::FAILURE
        }
        Err(error) => {
            error!(%error, "load test aborted");
            ExitCode::FAILURE
        }
    }
}

async fn execute(mode: Mode) -> Result<ExitCode, AppError> {
    match mode {
        Mode::Run(args) => {
            let config = args.resolve(RunVariant::Reporting)?;
            run_load_test(&config, RunVariant::Reporting).await?;
            info!(
                path = %config.report_path.display(),
                "run `courier-loadtest analyze` to evaluate the report"
            );
            Ok(ExitCode::SUCCESS)
        }
        Mode::Basic(args) => {
            let config = args.resolve(RunVariant::Basic)?;
            run_load_test(&config, RunVariant::Basic).await?;
            Ok(ExitCode::SUCCESS)
        }
        Mode::Analyze { report } => {
            let analysis = analyze_report_file(&report)?;
            log_analysis(&analysis);
            Ok(ExitCode::from(analysis.verdict.exit_code()))
        }
    }
}
