//! Адаптер брокера очередей.
//!
//! Публикатор пишет в exchange, разрешённый привязками канала, подписчик
//! потребляет очередь и раздаёт каждую доставку всем обработчикам канала.
//! Гарантия доставки: at-least-once при обязательном подтверждении,
//! at-most-once при автоподтверждении.

pub mod client;
pub mod consumer;
pub mod memory;
pub mod producer;

use std::sync::Arc;

pub use client::{AmqpChannel, AmqpConnector, AmqpDelivery, AmqpMessage, ConsumeOptions};
pub use consumer::AmqpConsumer;
pub use memory::{MemoryBroker, PublishedMessage, QueueStats};
pub use producer::{AmqpProducer, AmqpPublisher};

use crate::BusError;

/// Закрывает канал после неудачной операции, присоединяя ошибку закрытия
/// к исходной.
pub(crate) async fn close_on_error(
    channel: Arc<dyn AmqpChannel>,
    err: BusError,
) -> BusError {
    match channel.close().await {
        Ok(()) => err,
        Err(close_err) => err.and(close_err),
    }
}
