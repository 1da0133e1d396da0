use config::{Config, Environment, File};
use der_driver_modbus::{ModbusDataSourceConfig, ModbusNetworkConfig};
use der_gateway_sdk::{DriverError, DriverResult};
use der_plugin_modbus_server::ModbusServerConfig;
use serde::Deserialize;
use std::{ops::Deref, sync::Arc, time::Duration};
use tracing::Level;

/// Process settings, loaded once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Load `config_path` (optional, format from its extension) and then `DER__*`
    /// environment overrides, e.g. `DER__LOG__LEVEL=debug`.
    pub fn new(config_path: &str) -> DriverResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix("DER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| DriverError::ConfigurationError(format!("Failed to load settings: {e}")))?;
        Ok(Self(Arc::new(inner)))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub log: LogSettings,
    /// Served register banks; the server is disabled when absent.
    #[serde(default)]
    pub modbus_server: Option<ModbusServerConfig>,
    /// Southward Modbus devices polled by the gateway.
    #[serde(default)]
    pub sources: Vec<SourceSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Directory relative paths (such as the log directory) resolve from.
    ///
    /// Environment override: `DER__GENERAL__RUNTIME_DIR=/var/lib/der-gateway`
    #[serde(default = "General::runtime_dir_default")]
    pub runtime_dir: String,
}

impl Default for General {
    fn default() -> Self {
        General {
            runtime_dir: General::runtime_dir_default(),
        }
    }
}

impl General {
    fn runtime_dir_default() -> String {
        ".".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "LogSettings::level_default")]
    pub level: String,
    /// Directory of the daily rolling log file; console only when unset.
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default = "LogSettings::file_name_default")]
    pub file_name: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: LogSettings::level_default(),
            directory: None,
            file_name: LogSettings::file_name_default(),
        }
    }
}

impl LogSettings {
    fn level_default() -> String {
        "info".into()
    }

    fn file_name_default() -> String {
        "der-gateway.log".into()
    }

    /// Configured level, falling back to INFO when it does not parse.
    pub fn level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }
}

/// One polled southward device.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    pub name: String,
    #[serde(default = "SourceSettings::poll_interval_ms_default")]
    pub poll_interval_ms: u64,
    pub network: ModbusNetworkConfig,
    #[serde(default)]
    pub source: ModbusDataSourceConfig,
}

impl SourceSettings {
    fn poll_interval_ms_default() -> u64 {
        5_000
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
