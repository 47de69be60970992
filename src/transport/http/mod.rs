//! Дуплексный HTTP-транспорт.
//!
//! Соединение HTTP/1.1 используется как двунаправленный канал: каждая
//! сторона может отправлять запросы и получает ответы на них через свой
//! реестр обработчиков. Исходящее соединение открывает
//! [`HttpProducer`], входящие соединения принимает [`HttpConsumer`] и
//! отдаёт ("перехватывает") их подписчикам канала, указанного в пути
//! первого запроса.

pub mod codec;
pub mod connection;
pub mod consumer;
pub mod producer;

use std::time::Duration;

pub use codec::{HttpCodec, HttpFrame, StartLine};
pub use connection::DuplexConnection;
pub use consumer::HttpConsumer;
pub use producer::{HttpProducer, HttpPublisher};

/// Заголовок типа содержимого.
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Параметры HTTP-соединений.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Сколько входящее соединение ждёт подписчика, прежде чем получить 408.
    pub hijack_timeout: Duration,
    pub read_buffer_size: usize,
    /// Предельный размер заголовка или тела одного кадра.
    pub max_frame_size: usize,
    pub write_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            hijack_timeout: Duration::from_secs(5),
            read_buffer_size: 8192,
            max_frame_size: 8 * 1024 * 1024,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpConfig {
    pub(crate) fn codec(&self) -> HttpCodec {
        HttpCodec::new(self.max_frame_size)
    }
}
