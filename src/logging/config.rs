use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

/// Переменные окружения, перекрывающие конфигурацию.
pub const ENV_LOG_LEVEL: &str = "BUSLINE_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "BUSLINE_LOG_FORMAT";
pub const ENV_LOG_DIR: &str = "BUSLINE_LOG_DIR";

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Формат вывода в консоль.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Настройки консольного вывода.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub format: LogFormat,
    pub with_ansi: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_line_numbers: bool,
}

/// Конфигурация логирования.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Уровень для крейта (`trace` .. `error`).
    pub level: String,
    /// Дополнительные директивы `EnvFilter`, например `tokio=warn`.
    pub directives: Vec<String>,
    pub console_enabled: bool,
    pub console: ConsoleConfig,
    /// Файл с ежедневной ротацией.
    pub file_enabled: bool,
    pub log_dir: PathBuf,
    pub file_prefix: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            with_ansi: true,
            with_target: true,
            with_thread_ids: false,
            with_line_numbers: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directives: Vec::new(),
            console_enabled: true,
            console: ConsoleConfig::default(),
            file_enabled: false,
            log_dir: PathBuf::from("logs"),
            file_prefix: "busline.log".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Применяет `BUSLINE_LOG_*` поверх загруженных значений.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            self.level = level.to_ascii_lowercase();
        }
        if let Ok(format) = std::env::var(ENV_LOG_FORMAT) {
            match format.parse() {
                Ok(format) => self.console.format = format,
                Err(e) => eprintln!("ignoring {ENV_LOG_FORMAT}: {e}"),
            }
        }
        if let Ok(dir) = std::env::var(ENV_LOG_DIR) {
            self.log_dir = PathBuf::from(dir);
            self.file_enabled = true;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !LEVELS.contains(&self.level.as_str()) {
            return Err(format!(
                "unknown log level '{}', expected one of {}",
                self.level,
                LEVELS.join(", ")
            ));
        }
        if self.file_enabled && self.file_prefix.trim().is_empty() {
            return Err("log file prefix must not be empty".to_string());
        }
        Ok(())
    }

    pub fn ensure_log_dir(&self) -> std::io::Result<()> {
        if self.file_enabled {
            std::fs::create_dir_all(&self.log_dir)?;
        }
        Ok(())
    }

    /// Директива фильтра: уровень крейта, затем дополнительные директивы.
    pub fn build_filter_directive(&self) -> String {
        let mut parts = vec![format!("busline={}", self.level), "warn".to_string()];
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        };
        f.write_str(name)
    }
}
