//! Адаптер лог-брокера.
//!
//! Подписчик работает циклом опроса: каждая полученная пачка записей
//! раздаётся обработчикам канала по одной записи, ошибки обработчиков
//! собираются по всей пачке. Смещения фиксируются при чтении, поэтому
//! гарантия доставки at-most-once.

pub mod client;
pub mod consumer;
pub mod memory;
pub mod producer;

use std::sync::Arc;

pub use client::{KafkaClient, KafkaConnector, KafkaRecord, ProduceRecord};
pub use consumer::{KafkaConsumer, KafkaConsumerConfig};
pub use memory::{MemoryLog, MemoryLogClient};
pub use producer::{KafkaProducer, KafkaPublisher};

use crate::BusError;

/// Заголовок, в котором передаётся тип содержимого.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

pub(crate) async fn close_on_error(
    client: Arc<dyn KafkaClient>,
    err: BusError,
) -> BusError {
    match client.close().await {
        Ok(()) => err,
        Err(close_err) => err.and(close_err),
    }
}
