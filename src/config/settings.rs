use std::{path::Path, time::Duration};

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{logging::LoggingConfig, transport::http::HttpConfig, BusError, BusResult};

/// Префикс переменных окружения; вложенные ключи разделяются `__`,
/// например `BUSLINE_HTTP__HIJACK_TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "BUSLINE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen_address: String,
    pub http: HttpSettings,
    pub logging: LoggingConfig,
}

/// Параметры HTTP-транспорта в сериализуемом виде.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub hijack_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
    pub write_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
            http: HttpSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            hijack_timeout_ms: 5_000,
            read_buffer_size: 8 * 1024,
            max_frame_size: 8 * 1024 * 1024,
            write_timeout_ms: 10_000,
        }
    }
}

impl Settings {
    /// Значения по умолчанию, перекрытые переменными окружения.
    pub fn load() -> BusResult<Self> {
        Self::load_from(None)
    }

    /// То же, что [`Settings::load`], с необязательным файлом между
    /// значениями по умолчанию и окружением.
    pub fn load_from(file: Option<&Path>) -> BusResult<Self> {
        let mut builder = Config::builder()
            .set_default("listen_address", "127.0.0.1:8080")
            .map_err(config_error)?;
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let settings: Settings = cfg.try_deserialize().map_err(config_error)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.listen_address.trim().is_empty() {
            return Err(BusError::Config {
                reason: "listen_address must not be empty".to_string(),
            });
        }
        if self.http.max_frame_size == 0 || self.http.read_buffer_size == 0 {
            return Err(BusError::Config {
                reason: "http buffer sizes must be positive".to_string(),
            });
        }
        self.logging
            .validate()
            .map_err(|reason| BusError::Config { reason })
    }
}

fn config_error(err: ::config::ConfigError) -> BusError {
    BusError::Config {
        reason: err.to_string(),
    }
}

impl From<&HttpSettings> for HttpConfig {
    fn from(settings: &HttpSettings) -> Self {
        Self {
            hijack_timeout: Duration::from_millis(settings.hijack_timeout_ms),
            read_buffer_size: settings.read_buffer_size,
            max_frame_size: settings.max_frame_size,
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_http_defaults_match_runtime_defaults() {
        assert_eq!(HttpConfig::from(&HttpSettings::default()), HttpConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_defaults() {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.listen_address, "127.0.0.1:8080");
        assert_eq!(settings.http, HttpSettings::default());
    }

    /// Тест проверяет перекрытие вложенных ключей переменными окружения.
    #[test]
    #[serial]
    fn test_env_overrides_nested_keys() {
        std::env::set_var("BUSLINE_LISTEN_ADDRESS", "0.0.0.0:9000");
        std::env::set_var("BUSLINE_HTTP__HIJACK_TIMEOUT_MS", "250");
        let settings = Settings::load();
        std::env::remove_var("BUSLINE_LISTEN_ADDRESS");
        std::env::remove_var("BUSLINE_HTTP__HIJACK_TIMEOUT_MS");

        let settings = settings.unwrap();
        assert_eq!(settings.listen_address, "0.0.0.0:9000");
        assert_eq!(settings.http.hijack_timeout_ms, 250);
        assert_eq!(
            HttpConfig::from(&settings.http).hijack_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_config_errors() {
        std::env::set_var("BUSLINE_HTTP__MAX_FRAME_SIZE", "0");
        let result = Settings::load();
        std::env::remove_var("BUSLINE_HTTP__MAX_FRAME_SIZE");
        assert!(matches!(result, Err(BusError::Config { .. })));
    }
}
