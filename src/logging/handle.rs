use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tracing_appender::non_blocking::WorkerGuard;

/// Счётчики логирования.
#[derive(Debug, Default)]
pub struct LoggingMetrics {
    /// Кол-во запросов flush
    pub flush_count: AtomicU64,
}

/// Handle для управления lifecycle логирования.
///
/// Держит guard файлового писателя: пока handle жив, записи из фонового
/// потока попадают в файл; при drop буфер сбрасывается.
#[derive(Debug)]
pub struct LoggingHandle {
    file_guard: Option<WorkerGuard>,
    pub metrics: Arc<LoggingMetrics>,
}

impl LoggingHandle {
    pub fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            file_guard,
            metrics: Arc::new(LoggingMetrics::default()),
        }
    }

    pub fn has_file_sink(&self) -> bool {
        self.file_guard.is_some()
    }

    pub fn flush(&self) {
        self.metrics.flush_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            flush_count = self.metrics.flush_count.load(Ordering::Relaxed),
            "logging flush requested"
        );
    }

    /// Завершает логирование, дожидаясь записи буфера файла.
    pub fn shutdown(mut self) {
        tracing::info!(
            flushes = self.metrics.flush_count.load(Ordering::Relaxed),
            "logging shutting down"
        );
        drop(self.file_guard.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_without_file_sink() {
        let handle = LoggingHandle::new(None);
        assert!(!handle.has_file_sink());
        handle.flush();
        handle.flush();
        assert_eq!(handle.metrics.flush_count.load(Ordering::Relaxed), 2);
        handle.shutdown();
    }
}
