//! Link configuration.
//!
//! One [`LinkConfig`] describes one physical endpoint: which protocol family
//! speaks on it, how to open it, and the timing and retry defaults for
//! sessions on it. Files are TOML; any field can be overridden with a
//! `DAQ_LINK_`-prefixed environment variable (nested keys joined by `__`).
//!
//! ```toml
//! family = "hamilton"
//! timeout_ms = 500
//!
//! [transport]
//! type = "serial"
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//!
//! [retry]
//! max_attempts = 5
//! interval_ms = 200
//! ```
//!
//! `DAQ_LINK_TRANSPORT__PORT=/dev/ttyUSB1` would override the port.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::format::{FrameFormat, Hamilton, Harvard, HuberPb, Knauer, Vici};
use crate::registry::{LinkRegistry, OpenFuture};
use crate::retry::RetryPolicy;
use crate::serial::{open_tcp, Parity, SerialSettings};
use crate::transport::{LinkSettings, TransportLink};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DAQ_LINK_";

/// Largest accepted `retry.backoff_multiplier`.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Error loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File not found.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Invalid TOML or wrong field types.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// Parsed but unusable.
    #[error("Config validation failed: {0}")]
    Validation(String),
}

impl From<ConfigError> for LinkError {
    fn from(err: ConfigError) -> Self {
        LinkError::new(ErrorKind::ConfigurationFailure, err.to_string())
    }
}

/// Instrument family speaking on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// Hamilton Protocol 1.
    Hamilton,
    /// Harvard Apparatus Protocol 11.
    Harvard,
    /// Huber PB.
    Huber,
    /// Knauer Azura pump.
    KnauerPump,
    /// Knauer valve drive.
    KnauerValve,
    /// VICI Valco actuator.
    Vici,
}

impl ProtocolFamily {
    /// Frame format for this family.
    pub fn format(self) -> Arc<dyn FrameFormat> {
        match self {
            ProtocolFamily::Hamilton => Arc::new(Hamilton),
            ProtocolFamily::Harvard => Arc::new(Harvard),
            ProtocolFamily::Huber => Arc::new(HuberPb),
            ProtocolFamily::KnauerPump => Arc::new(Knauer::pump()),
            ProtocolFamily::KnauerValve => Arc::new(Knauer::valve()),
            ProtocolFamily::Vici => Arc::new(Vici),
        }
    }
}

/// How to reach the medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Local serial port.
    Serial {
        /// Port path.
        port: String,
        /// Baud rate.
        baud_rate: u32,
        /// Data bits.
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity.
        #[serde(default)]
        parity: Parity,
        /// Stop bits.
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    /// TCP socket (ethernet instruments, serial device servers).
    Tcp {
        /// Host name or IP.
        host: String,
        /// TCP port.
        port: u16,
    },
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Retry defaults, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub interval_ms: u64,
    /// Total time budget.
    pub budget_ms: u64,
    /// Delay growth factor per retry.
    pub backoff_multiplier: f64,
    /// Ceiling for the grown delay.
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            interval_ms: policy.interval.as_millis() as u64,
            budget_ms: policy.budget.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            max_interval_ms: policy.max_interval.as_millis() as u64,
        }
    }
}

/// One endpoint and its defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Label used in logs. Defaults to the endpoint.
    #[serde(default)]
    pub name: Option<String>,
    /// Protocol family.
    pub family: ProtocolFamily,
    /// Medium.
    pub transport: TransportConfig,
    /// Transaction deadline.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Stale-input drain window.
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
    /// TCP connect deadline.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Busy-retry defaults.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_drain_ms() -> u64 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl LinkConfig {
    /// Endpoint identity: port path, or `host:port`.
    pub fn endpoint(&self) -> String {
        match &self.transport {
            TransportConfig::Serial { port, .. } => port.clone(),
            TransportConfig::Tcp { host, port } => format!("{}:{}", host, port),
        }
    }

    /// Label for logs.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.endpoint())
    }

    /// Frame format for the configured family.
    pub fn format(&self) -> Arc<dyn FrameFormat> {
        self.family.format()
    }

    /// Serial line settings, if the transport is serial.
    pub fn serial_settings(&self) -> Option<SerialSettings> {
        match &self.transport {
            TransportConfig::Serial {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => Some(SerialSettings {
                port: port.clone(),
                baud_rate: *baud_rate,
                data_bits: *data_bits,
                parity: *parity,
                stop_bits: *stop_bits,
            }),
            TransportConfig::Tcp { .. } => None,
        }
    }

    /// Link timing defaults.
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            default_timeout: Duration::from_millis(self.timeout_ms),
            drain_window: Duration::from_millis(self.drain_ms),
        }
    }

    /// Retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.interval_ms),
            Duration::from_millis(self.retry.budget_ms),
        )
        .with_backoff(
            self.retry.backoff_multiplier,
            Duration::from_millis(self.retry.max_interval_ms),
        )
    }

    /// Reject values that cannot work.
    ///
    /// # Errors
    ///
    /// `ConfigError::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Validation(msg));
        match &self.transport {
            TransportConfig::Serial { .. } => {
                if let Some(settings) = self.serial_settings() {
                    settings
                        .validate()
                        .map_err(|e| ConfigError::Validation(e.message))?;
                }
            }
            TransportConfig::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return fail("tcp host is empty".into());
                }
                if *port == 0 {
                    return fail("tcp port must be non-zero".into());
                }
            }
        }
        if self.timeout_ms == 0 {
            return fail("timeout_ms must be non-zero".into());
        }
        if self.connect_timeout_ms == 0 {
            return fail("connect_timeout_ms must be non-zero".into());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1".into());
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.retry.backoff_multiplier) {
            return fail(format!(
                "retry.backoff_multiplier must be between 1.0 and {}, got {}",
                MAX_BACKOFF_MULTIPLIER, self.retry.backoff_multiplier
            ));
        }
        Ok(())
    }

    /// Open the medium and wrap it in a link.
    ///
    /// # Errors
    ///
    /// `ConfigurationFailure` when the medium cannot be opened.
    pub async fn open(&self) -> LinkResult<TransportLink> {
        let medium = match &self.transport {
            TransportConfig::Tcp { host, port } => {
                open_tcp(host, *port, Duration::from_millis(self.connect_timeout_ms)).await?
            }
            TransportConfig::Serial { .. } => self.open_serial().await?,
        };
        Ok(TransportLink::new(self.endpoint(), medium, self.link_settings()))
    }

    #[cfg(feature = "serial")]
    async fn open_serial(&self) -> LinkResult<crate::transport::DynMedium> {
        match self.serial_settings() {
            Some(settings) => crate::serial::open_serial(&settings).await,
            None => Err(LinkError::new(
                ErrorKind::ConfigurationFailure,
                "transport is not serial",
            )),
        }
    }

    #[cfg(not(feature = "serial"))]
    async fn open_serial(&self) -> LinkResult<crate::transport::DynMedium> {
        Err(LinkError::new(
            ErrorKind::ConfigurationFailure,
            format!("{}: built without serial support", self.endpoint()),
        ))
    }

    /// Boxed opener for [`LinkRegistry::acquire`].
    pub fn opener(&self) -> impl FnOnce() -> OpenFuture {
        let config = self.clone();
        move || Box::pin(async move { config.open().await })
    }

    /// Shared link for this endpoint, opened on first use.
    ///
    /// # Errors
    ///
    /// `ConfigurationFailure` when the medium cannot be opened.
    pub async fn acquire(&self, registry: &LinkRegistry) -> LinkResult<Arc<TransportLink>> {
        registry.acquire(&self.endpoint(), self.opener()).await
    }
}

/// Load a configuration file, apply `DAQ_LINK_` overrides and validate.
///
/// # Errors
///
/// `NotFound`, `Parse` or `Validation`.
pub fn load_config(path: &Path) -> Result<LinkConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    debug!(path = %path.display(), "Loading link config");

    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));
    let config = extract(figment)?;
    info!(
        endpoint = %config.endpoint(),
        family = config.family.format().name(),
        "Loaded link config"
    );
    Ok(config)
}

/// Parse and validate a configuration from a TOML string, without
/// environment overrides.
///
/// # Errors
///
/// `Parse` or `Validation`.
pub fn load_config_str(toml: &str) -> Result<LinkConfig, ConfigError> {
    extract(Figment::new().merge(Toml::string(toml)))
}

fn extract(figment: Figment) -> Result<LinkConfig, ConfigError> {
    let config: LinkConfig = figment
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SERIAL: &str = r#"
        family = "hamilton"
        timeout_ms = 500

        [transport]
        type = "serial"
        port = "/dev/ttyUSB0"
        baud_rate = 9600

        [retry]
        max_attempts = 5
        interval_ms = 200
    "#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SERIAL.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.family, ProtocolFamily::Hamilton);
        assert_eq!(config.endpoint(), "/dev/ttyUSB0");
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.drain_ms, 10);

        let settings = config.serial_settings().unwrap();
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.parity, Parity::None);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.interval, Duration::from_millis(200));
        assert_eq!(policy.budget, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/daq-link.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
        assert_eq!(LinkError::from(err).kind, ErrorKind::ConfigurationFailure);
    }

    #[test]
    fn test_tcp_transport() {
        let config = load_config_str(
            r#"
            family = "knauer_pump"
            [transport]
            type = "tcp"
            host = "192.168.1.20"
            port = 10001
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoint(), "192.168.1.20:10001");
        assert_eq!(config.format().name(), "knauer_pump");
        assert!(config.serial_settings().is_none());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let err = load_config_str(
            r#"
            family = "vici"
            timeout_ms = 0
            [transport]
            type = "serial"
            port = "COM3"
            baud_rate = 9600
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = load_config_str(
            r#"
            family = "vici"
            [transport]
            type = "serial"
            port = "COM3"
            baud_rate = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_backoff_multiplier_is_bounded() {
        let err = load_config_str(
            r#"
            family = "vici"
            [transport]
            type = "serial"
            port = "COM3"
            baud_rate = 9600
            [retry]
            max_attempts = 3
            backoff_multiplier = 1e300
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let config = load_config_str(
            r#"
            family = "vici"
            [transport]
            type = "serial"
            port = "COM3"
            baud_rate = 9600
            [retry]
            backoff_multiplier = 10.0
            "#,
        )
        .unwrap();
        assert_eq!(config.retry_policy().backoff_multiplier, 10.0);
    }

    #[test]
    fn test_unknown_family_is_parse_error() {
        let err = load_config_str(
            r#"
            family = "teledyne"
            [transport]
            type = "tcp"
            host = "localhost"
            port = 1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_every_family_has_a_format() {
        for (family, name) in [
            (ProtocolFamily::Hamilton, "hamilton"),
            (ProtocolFamily::Harvard, "harvard"),
            (ProtocolFamily::Huber, "huber"),
            (ProtocolFamily::KnauerPump, "knauer_pump"),
            (ProtocolFamily::KnauerValve, "knauer_valve"),
            (ProtocolFamily::Vici, "vici"),
        ] {
            assert_eq!(family.format().name(), name);
        }
    }

    #[tokio::test]
    async fn test_acquire_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let config = load_config_str(&format!(
            r#"
            family = "knauer_valve"
            [transport]
            type = "tcp"
            host = "127.0.0.1"
            port = {}
            "#,
            port
        ))
        .unwrap();

        let registry = LinkRegistry::new();
        let link = config.acquire(&registry).await.unwrap();
        let again = config.acquire(&registry).await.unwrap();
        assert!(Arc::ptr_eq(&link, &again));
        assert_eq!(registry.endpoints(), vec![format!("127.0.0.1:{}", port)]);
        let _socket = accept.await.unwrap();
    }
}
