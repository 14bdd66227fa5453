//! Monitor configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Values can be layered: defaults, then a TOML file, then `PAGEPULSE_*`
//! environment variables.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::alerts::DEFAULT_ALERT_HISTORY;
use crate::metrics::DEFAULT_METRICS_CAPACITY;
use crate::tracker::{DEFAULT_BREADCRUMB_CAPACITY, DEFAULT_ERROR_CAPACITY, DEFAULT_RECENT_ERRORS};
use crate::transport::HttpSinkConfig;
use crate::{Error, Result};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "PAGEPULSE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub metrics_capacity: usize,
    pub error_capacity: usize,
    pub breadcrumb_capacity: usize,
    /// Records in an error summary's recent list.
    pub recent_errors: usize,
    pub alert_history_capacity: usize,
    /// Window the error-rate rule counts over.
    pub error_rate_window_secs: u64,
    pub install_default_alerts: bool,
    /// Fixed session id; generated when unset.
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub page_url: Option<String>,
    /// Periodic flush interval. 0 disables the reporter.
    pub report_interval_secs: u64,
    pub transport: TransportConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics_capacity: DEFAULT_METRICS_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
            breadcrumb_capacity: DEFAULT_BREADCRUMB_CAPACITY,
            recent_errors: DEFAULT_RECENT_ERRORS,
            alert_history_capacity: DEFAULT_ALERT_HISTORY,
            error_rate_window_secs: 60,
            install_default_alerts: true,
            session_id: None,
            user_id: None,
            page_url: None,
            report_interval_secs: 0,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// HTTP request timeout.
    pub timeout_ms: u64,
    /// Bound on a send made outside an async runtime.
    pub fallback_timeout_ms: u64,
    pub vitals_endpoint: Option<String>,
    pub metrics_endpoint: Option<String>,
    pub errors_endpoint: Option<String>,
    /// Receives every fired alert when set.
    pub alerts_endpoint: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            fallback_timeout_ms: 2000,
            vitals_endpoint: None,
            metrics_endpoint: None,
            errors_endpoint: None,
            alerts_endpoint: None,
            headers: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    pub fn sink_config(&self) -> HttpSinkConfig {
        HttpSinkConfig {
            timeout_ms: self.timeout_ms,
            headers: self.headers.clone(),
        }
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    /// True if any endpoint is configured.
    pub fn has_endpoints(&self) -> bool {
        self.endpoints().any(|(_, endpoint)| endpoint.is_some())
    }

    fn endpoints(&self) -> impl Iterator<Item = (&'static str, Option<&str>)> {
        [
            ("vitals_endpoint", self.vitals_endpoint.as_deref()),
            ("metrics_endpoint", self.metrics_endpoint.as_deref()),
            ("errors_endpoint", self.errors_endpoint.as_deref()),
            ("alerts_endpoint", self.alerts_endpoint.as_deref()),
        ]
        .into_iter()
    }
}

impl MonitorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    /// Override fields from `PAGEPULSE_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Override fields from `lookup`, which maps a full variable name to its
    /// value. Unparseable values are ignored with a warning.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        fn parse_into<T: std::str::FromStr>(name: &str, raw: Option<String>, slot: &mut T) {
            if let Some(raw) = raw {
                match raw.parse::<T>() {
                    Ok(value) => *slot = value,
                    Err(_) => {
                        let var = format!("{}{}", ENV_PREFIX, name);
                        warn!(%var, value = %raw, "Ignoring invalid environment value");
                    }
                }
            }
        }

        parse_into("METRICS_CAPACITY", get("METRICS_CAPACITY"), &mut self.metrics_capacity);
        parse_into("ERROR_CAPACITY", get("ERROR_CAPACITY"), &mut self.error_capacity);
        parse_into(
            "BREADCRUMB_CAPACITY",
            get("BREADCRUMB_CAPACITY"),
            &mut self.breadcrumb_capacity,
        );
        parse_into(
            "ERROR_RATE_WINDOW_SECS",
            get("ERROR_RATE_WINDOW_SECS"),
            &mut self.error_rate_window_secs,
        );
        parse_into(
            "INSTALL_DEFAULT_ALERTS",
            get("INSTALL_DEFAULT_ALERTS"),
            &mut self.install_default_alerts,
        );
        parse_into(
            "REPORT_INTERVAL_SECS",
            get("REPORT_INTERVAL_SECS"),
            &mut self.report_interval_secs,
        );
        parse_into("TIMEOUT_MS", get("TIMEOUT_MS"), &mut self.transport.timeout_ms);

        if let Some(v) = get("SESSION_ID") {
            self.session_id = Some(v);
        }
        if let Some(v) = get("USER_ID") {
            self.user_id = Some(v);
        }
        if let Some(v) = get("PAGE_URL") {
            self.page_url = Some(v);
        }
        if let Some(v) = get("VITALS_ENDPOINT") {
            self.transport.vitals_endpoint = Some(v);
        }
        if let Some(v) = get("METRICS_ENDPOINT") {
            self.transport.metrics_endpoint = Some(v);
        }
        if let Some(v) = get("ERRORS_ENDPOINT") {
            self.transport.errors_endpoint = Some(v);
        }
        if let Some(v) = get("ALERTS_ENDPOINT") {
            self.transport.alerts_endpoint = Some(v);
        }
    }

    /// Reject zero capacities and malformed endpoints.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("metrics_capacity", self.metrics_capacity),
            ("error_capacity", self.error_capacity),
            ("breadcrumb_capacity", self.breadcrumb_capacity),
            ("alert_history_capacity", self.alert_history_capacity),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than 0", field)));
            }
        }

        if self.transport.timeout_ms == 0 {
            return Err(Error::config("transport.timeout_ms must be greater than 0"));
        }

        for (field, endpoint) in self.transport.endpoints() {
            if let Some(endpoint) = endpoint {
                let url = Url::parse(endpoint)
                    .map_err(|e| Error::config(format!("transport.{} '{}': {}", field, endpoint, e)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::config(format!(
                        "transport.{} must use http or https, got '{}'",
                        field,
                        url.scheme()
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn error_rate_window(&self) -> Duration {
        Duration::from_secs(self.error_rate_window_secs)
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_toml_is_default() {
        let config = MonitorConfig::from_toml_str("").unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.metrics_capacity, 5000);
        assert_eq!(config.error_capacity, 1000);
        assert_eq!(config.breadcrumb_capacity, 50);
        assert!(config.report_interval().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config = MonitorConfig::from_toml_str(
            r#"
            metrics_capacity = 200
            report_interval_secs = 30

            [transport]
            metrics_endpoint = "https://collector.example/metrics"

            [transport.headers]
            x-api-key = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.metrics_capacity, 200);
        assert_eq!(config.error_capacity, 1000);
        assert_eq!(config.report_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.transport.timeout_ms, 5000);
        assert_eq!(config.transport.sink_config().headers["x-api-key"], "secret");
        assert!(config.transport.has_endpoints());
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = MonitorConfig::from_toml_str("metrics_capacity = \"lots\"").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "error_capacity = 25").unwrap();

        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.error_capacity, 25);

        assert!(matches!(
            MonitorConfig::load("/definitely/not/here.toml"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MonitorConfig {
            breadcrumb_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.breadcrumb_capacity = 10;
        config.transport.errors_endpoint = Some("not a url".to_string());
        assert!(config.validate().is_err());

        config.transport.errors_endpoint = Some("ftp://collector.example/errors".to_string());
        assert!(config.validate().is_err());

        config.transport.errors_endpoint = Some("http://localhost:8080/errors".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let vars = BTreeMap::from([
            ("PAGEPULSE_METRICS_CAPACITY", "64"),
            ("PAGEPULSE_ERROR_CAPACITY", "many"),
            ("PAGEPULSE_USER_ID", "user-7"),
            ("PAGEPULSE_VITALS_ENDPOINT", " https://collector.example/vitals "),
            ("PAGEPULSE_PAGE_URL", "   "),
            ("PAGEPULSE_INSTALL_DEFAULT_ALERTS", "false"),
        ]);

        let mut config = MonitorConfig::default();
        config.apply_env_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.metrics_capacity, 64);
        assert_eq!(config.error_capacity, 1000);
        assert_eq!(config.user_id.as_deref(), Some("user-7"));
        assert_eq!(
            config.transport.vitals_endpoint.as_deref(),
            Some("https://collector.example/vitals")
        );
        assert_eq!(config.page_url, None);
        assert!(!config.install_default_alerts);
    }
}
