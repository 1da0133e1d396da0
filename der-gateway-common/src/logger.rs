use crate::settings::LogSettings;
use der_gateway_sdk::{DriverError, DriverResult};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{subscriber::set_global_default, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::DynFilterFn, fmt, layer::SubscriberExt, EnvFilter, Layer, Registry,
};

/// Process-wide tracing setup.
///
/// Console output is always on; a daily rolling file is added when a log directory is
/// configured. The level can be changed at runtime and `RUST_LOG` narrows it further.
pub struct Logger {
    level: Arc<Mutex<Level>>,
    settings: LogSettings,
    _file_guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(settings: &LogSettings) -> Self {
        Logger {
            level: Arc::new(Mutex::new(settings.level())),
            settings: settings.clone(),
            _file_guard: None,
        }
    }

    #[inline]
    pub fn set_level(&self, new_level: Level) {
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        *level = new_level;
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        *self.level.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the global subscriber. Fails if one is already installed.
    pub fn initialize(&mut self) -> DriverResult<()> {
        let console_filter = {
            let level = Arc::clone(&self.level);
            DynFilterFn::new(move |metadata, _| {
                metadata.level() <= &*level.lock().unwrap_or_else(PoisonError::into_inner)
            })
        };
        let console_layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(true)
            .with_filter(console_filter);

        let file_layer = match self.settings.directory.as_deref() {
            Some(dir) => {
                let file_appender = rolling::daily(dir, &self.settings.file_name);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                self._file_guard = Some(guard);
                let file_filter = {
                    let level = Arc::clone(&self.level);
                    DynFilterFn::new(move |metadata, _| {
                        metadata.level() <= &*level.lock().unwrap_or_else(PoisonError::into_inner)
                    })
                };
                Some(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_filter(file_filter),
                )
            }
            None => None,
        };

        // RUST_LOG, when present, applies on top of the configured level
        let env_filter = EnvFilter::try_from_default_env().ok();

        let subscriber = Registry::default()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer);
        set_global_default(subscriber)
            .map_err(|e| DriverError::ConfigurationError(format!("Failed to set logger: {e}")))?;
        Ok(())
    }
}
