use std::io::{self, Stdout};

use tracing_subscriber::{fmt, layer::Layer as LayerTrait, registry::LookupSpan};

use crate::logging::config::{ConsoleConfig, LogFormat};

/// Консольный слой в выбранном формате. Конкретный тип формата стирается
/// в boxed trait-объект.
pub fn build_formatter<S>(console: &ConsoleConfig) -> Box<dyn LayerTrait<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let writer: fn() -> Stdout = io::stdout;
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(console.with_ansi)
        .with_target(console.with_target)
        .with_thread_ids(console.with_thread_ids)
        .with_line_number(console.with_line_numbers);

    match console.format {
        LogFormat::Json => Box::new(base.json().with_current_span(true).with_ansi(false)),
        LogFormat::Pretty => Box::new(base.pretty()),
        LogFormat::Compact => Box::new(base.compact()),
    }
}

#[cfg(test)]
mod tests {
    use tracing::info;
    use tracing_subscriber::{prelude::*, registry::Registry};

    use super::*;

    /// Тест проверяет, что слой строится и работает во всех форматах.
    #[test]
    fn test_all_formats_build_and_log() {
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let console = ConsoleConfig {
                format,
                with_ansi: false,
                ..Default::default()
            };
            let subscriber = Registry::default().with(build_formatter::<Registry>(&console));
            tracing::subscriber::with_default(subscriber, || {
                info!(%format, "formatter smoke test");
            });
        }
    }
}
