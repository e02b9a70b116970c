use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use url::Url;

use crate::socketio;
use crate::types::OrderId;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";
pub const DEFAULT_REPORT_PATH: &str = "load-test-report.json";
const DEFAULT_REPORTING_DURATION_SEC: u64 = 120;
const DEFAULT_BASIC_DURATION_SEC: u64 = 60;
const DEFAULT_SOCKET_RATE_HZ: u32 = 10;
const DEFAULT_HTTP_RATE_HZ: u32 = 5;
const DEFAULT_METRICS_INTERVAL_SEC: u64 = 10;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_METRICS_TIMEOUT_MS: u64 = 3_000;

/// Which flavor of driver run the config is resolved for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunVariant {
    /// Full run: metrics polling plus a persisted report.
    Reporting,
    /// Lighter run: traffic only, summary logged, nothing written.
    Basic,
}

impl RunVariant {
    #[must_use]
    pub const fn default_duration_sec(self) -> u64 {
        match self {
            Self::Reporting => DEFAULT_REPORTING_DURATION_SEC,
            Self::Basic => DEFAULT_BASIC_DURATION_SEC,
        }
    }
}

/// Immutable run parameters, resolved once at start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestConfig {
    pub base_url: Url,
    pub socket_url: Url,
    pub order_id: OrderId,
    pub token: Option<String>,
    pub duration_sec: u64,
    pub socket_rate_hz: u32,
    pub http_rate_hz: u32,
    pub metrics_interval_sec: u64,
    pub http_timeout_ms: u64,
    pub metrics_timeout_ms: u64,
    pub report_path: PathBuf,
}

impl TestConfig {
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_sec)
    }

    #[must_use]
    pub const fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_sec)
    }

    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    #[must_use]
    pub const fn metrics_timeout(&self) -> Duration {
        Duration::from_millis(self.metrics_timeout_ms)
    }
}

/// A partially specified config layer: a TOML file, or the environment and CLI flags.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub base_url: Option<String>,
    pub socket_url: Option<String>,
    pub order_id: Option<String>,
    pub token: Option<String>,
    pub duration_sec: Option<u64>,
    pub socket_rate_hz: Option<u32>,
    pub http_rate_hz: Option<u32>,
    pub metrics_interval_sec: Option<u64>,
    pub http_timeout_ms: Option<u64>,
    pub metrics_timeout_ms: Option<u64>,
    pub report_path: Option<PathBuf>,
}

impl ConfigLayer {
    /// Layers `overrides` on top of `self`; any value set in `overrides` wins.
    #[must_use]
    pub fn merge(self, overrides: Self) -> Self {
        Self {
            base_url: overrides.base_url.or(self.base_url),
            socket_url: overrides.socket_url.or(self.socket_url),
            order_id: overrides.order_id.or(self.order_id),
            token: overrides.token.or(self.token),
            duration_sec: overrides.duration_sec.or(self.duration_sec),
            socket_rate_hz: overrides.socket_rate_hz.or(self.socket_rate_hz),
            http_rate_hz: overrides.http_rate_hz.or(self.http_rate_hz),
            metrics_interval_sec: overrides.metrics_interval_sec.or(self.metrics_interval_sec),
            http_timeout_ms: overrides.http_timeout_ms.or(self.http_timeout_ms),
            metrics_timeout_ms: overrides.metrics_timeout_ms.or(self.metrics_timeout_ms),
            report_path: overrides.report_path.or(self.report_path),
        }
    }

    /// Fills defaults for `variant` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingOrderId`] when no order id is set and
    /// [`ConfigError::Invalid`] when any value is out of range.
    pub fn resolve(self, variant: RunVariant) -> Result<TestConfig, ConfigError> {
        let order_id = self
            .order_id
            .map(OrderId::from)
            .filter(|order_id| !order_id.is_blank())
            .ok_or(ConfigError::MissingOrderId)?;

        let raw_base = self.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let base_url = Url::parse(&raw_base)
            .map_err(|_| invalid(format!("`base_url` is not a valid URL: {raw_base}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "`base_url` must use http or https: {raw_base}"
            )));
        }

        let socket_url = match self.socket_url {
            Some(raw) => Url::parse(&raw)
                .map_err(|_| invalid(format!("`socket_url` is not a valid URL: {raw}")))?,
            None => socketio::socket_url(&base_url)
                .map_err(|error| invalid(format!("cannot derive socket url: {error}")))?,
        };
        if !matches!(socket_url.scheme(), "ws" | "wss") {
            return Err(invalid(format!(
                "`socket_url` must use ws or wss: {socket_url}"
            )));
        }

        let config = TestConfig {
            base_url,
            socket_url,
            order_id,
            token: self.token.filter(|token| !token.trim().is_empty()),
            duration_sec: self
                .duration_sec
                .unwrap_or_else(|| variant.default_duration_sec()),
            socket_rate_hz: self.socket_rate_hz.unwrap_or(DEFAULT_SOCKET_RATE_HZ),
            http_rate_hz: self.http_rate_hz.unwrap_or(DEFAULT_HTTP_RATE_HZ),
            metrics_interval_sec: self
                .metrics_interval_sec
                .unwrap_or(DEFAULT_METRICS_INTERVAL_SEC),
            http_timeout_ms: self.http_timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS),
            metrics_timeout_ms: self.metrics_timeout_ms.unwrap_or(DEFAULT_METRICS_TIMEOUT_MS),
            report_path: self
                .report_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_PATH)),
        };

        validate(&config)?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("ORDER_ID is required")]
    MissingOrderId,
    #[error("invalid config: {message}")]
    Invalid { message: String },
}

/// Loads a config layer from a TOML file.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read or parsed.
pub fn load_config_file(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str::<ConfigLayer>(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn validate(config: &TestConfig) -> Result<(), ConfigError> {
    if config.duration_sec == 0 {
        return Err(invalid("`duration_sec` must be > 0"));
    }
    if config.metrics_interval_sec == 0 {
        return Err(invalid("`metrics_interval_sec` must be > 0"));
    }
    if config.http_timeout_ms == 0 {
        return Err(invalid("`http_timeout_ms` must be > 0"));
    }
    if config.metrics_timeout_ms == 0 {
        return Err(invalid("`metrics_timeout_ms` must be > 0"));
    }
    if config.report_path.as_os_str().is_empty() {
        return Err(invalid("`report_path` must not be empty"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{ConfigError, ConfigLayer, RunVariant, load_config_file};

    fn with_order(order_id: &str) -> ConfigLayer {
        ConfigLayer {
            order_id: Some(order_id.to_owned()),
            ..ConfigLayer::default()
        }
    }

    #[test]
    fn missing_order_id_is_rejected() {
        assert!(matches!(
            ConfigLayer::default().resolve(RunVariant::Reporting),
            Err(ConfigError::MissingOrderId)
        ));
        assert!(matches!(
            with_order("   ").resolve(RunVariant::Reporting),
            Err(ConfigError::MissingOrderId)
        ));
    }

    #[test]
    fn defaults_follow_variant() -> Result<(), Box<dyn Error>> {
        let reporting = with_order("o1").resolve(RunVariant::Reporting)?;
        assert_eq!(reporting.base_url.as_str(), "http://localhost:5000/");
        assert_eq!(
            reporting.socket_url.as_str(),
            "ws://localhost:5000/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(reporting.duration_sec, 120);
        assert_eq!(reporting.socket_rate_hz, 10);
        assert_eq!(reporting.http_rate_hz, 5);
        assert_eq!(reporting.metrics_interval_sec, 10);
        assert_eq!(reporting.http_timeout_ms, 5_000);
        assert_eq!(reporting.metrics_timeout_ms, 3_000);
        assert_eq!(reporting.report_path, PathBuf::from("load-test-report.json"));
        assert_eq!(reporting.token, None);

        let basic = with_order("o1").resolve(RunVariant::Basic)?;
        assert_eq!(basic.duration_sec, 60);
        Ok(())
    }

    #[test]
    fn overrides_win_over_file_layer() -> Result<(), Box<dyn Error>> {
        let file = ConfigLayer {
            base_url: Some("http://file.example:8080".to_owned()),
            order_id: Some("from-file".to_owned()),
            http_rate_hz: Some(2),
            ..ConfigLayer::default()
        };
        let env = ConfigLayer {
            order_id: Some("from-env".to_owned()),
            socket_rate_hz: Some(0),
            token: Some("secret".to_owned()),
            ..ConfigLayer::default()
        };

        let config = file.merge(env).resolve(RunVariant::Reporting)?;
        assert_eq!(config.order_id.as_str(), "from-env");
        assert_eq!(config.base_url.as_str(), "http://file.example:8080/");
        assert_eq!(config.http_rate_hz, 2);
        assert_eq!(config.socket_rate_hz, 0);
        assert_eq!(config.token.as_deref(), Some("secret"));
        Ok(())
    }

    #[test]
    fn blank_token_is_treated_as_absent() -> Result<(), Box<dyn Error>> {
        let layer = ConfigLayer {
            token: Some(String::new()),
            ..with_order("o1")
        };
        assert_eq!(layer.resolve(RunVariant::Reporting)?.token, None);
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_duration = ConfigLayer {
            duration_sec: Some(0),
            ..with_order("o1")
        };
        assert!(matches!(
            zero_duration.resolve(RunVariant::Reporting),
            Err(ConfigError::Invalid { message }) if message == "`duration_sec` must be > 0"
        ));

        let zero_interval = ConfigLayer {
            metrics_interval_sec: Some(0),
            ..with_order("o1")
        };
        assert!(matches!(
            zero_interval.resolve(RunVariant::Reporting),
            Err(ConfigError::Invalid { message }) if message == "`metrics_interval_sec` must be > 0"
        ));

        let bad_scheme = ConfigLayer {
            base_url: Some("ftp://localhost".to_owned()),
            ..with_order("o1")
        };
        assert!(matches!(
            bad_scheme.resolve(RunVariant::Reporting),
            Err(ConfigError::Invalid { .. })
        ));

        let bad_socket = ConfigLayer {
            socket_url: Some("http://localhost:5000".to_owned()),
            ..with_order("o1")
        };
        assert!(matches!(
            bad_socket.resolve(RunVariant::Reporting),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn load_config_file_parses_toml_and_rejects_unknown_keys() -> Result<(), Box<dyn Error>> {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0_u128, |duration| duration.as_nanos());
        let good = std::env::temp_dir().join(format!("courier-loadtest-config-{unique}.toml"));
        let bad = std::env::temp_dir().join(format!("courier-loadtest-config-bad-{unique}.toml"));

        fs::write(
            &good,
            r#"
base_url = "http://staging.internal:5000"
order_id = "66b2c1"
duration_sec = 30
socket_rate_hz = 20
"#,
        )?;
        fs::write(&bad, "order_idd = \"typo\"\n")?;

        let layer = load_config_file(&good);
        let rejected = load_config_file(&bad);
        let _ = fs::remove_file(&good);
        let _ = fs::remove_file(&bad);

        let layer = layer?;
        assert_eq!(layer.order_id.as_deref(), Some("66b2c1"));
        assert_eq!(layer.duration_sec, Some(30));
        assert_eq!(layer.socket_rate_hz, Some(20));
        assert!(matches!(rejected, Err(ConfigError::Parse { .. })));
        Ok(())
    }
}
