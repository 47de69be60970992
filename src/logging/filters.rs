use tracing_subscriber::EnvFilter;

use crate::logging::config::LoggingConfig;

/// `RUST_LOG`, если задана, иначе директива из конфигурации.
pub fn build_filter_from_config(config: &LoggingConfig) -> EnvFilter {
    let directive = config.build_filter_directive();

    match EnvFilter::try_from_default_env() {
        Ok(env_filter) => env_filter,
        Err(_) => match EnvFilter::try_new(&directive) {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!("invalid log filter directive '{directive}': {e}; falling back to 'info'");
                EnvFilter::new("info")
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_filter_from_config_without_env() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "debug".to_string(),
            directives: vec!["tokio=warn".to_string()],
            ..Default::default()
        };
        let filter = build_filter_from_config(&config);
        let rendered = filter.to_string();
        assert!(rendered.contains("busline=debug"), "got: {rendered}");
        assert!(rendered.contains("tokio=warn"), "got: {rendered}");
    }

    /// Тест проверяет, что некорректная директива не приводит к панике.
    #[test]
    #[serial]
    fn test_invalid_directive_falls_back() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            directives: vec!["=[".to_string()],
            ..Default::default()
        };
        let _filter = build_filter_from_config(&config);
    }

    #[test]
    #[serial]
    fn test_rust_log_wins() {
        std::env::set_var("RUST_LOG", "trace");
        let filter = build_filter_from_config(&LoggingConfig::default());
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "trace");
    }
}
