//! Транспортные адаптеры и общие для них контракты.
//!
//! Вызывающий получает [`Publisher`] или [`Subscriber`] для канала у
//! [`Producer`]/[`Consumer`] конкретного транспорта. Привязки канала
//! разрешаются в адрес ресурса при открытии.

pub mod amqp;
pub mod http;
pub mod kafka;

use std::future::Future;

use async_trait::async_trait;

use crate::{fanout::Callback, BusResult, Cancel, EnvelopeIn, EnvelopeOut, ErrorPool};

/// Публикация сообщений в канал.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Отправляет сообщения. Пачка отправляется конкурентно; вызов
    /// завершается, когда завершились все, и возвращает объединение ошибок.
    async fn send(
        &self,
        envelopes: Vec<EnvelopeOut>,
    ) -> BusResult<()>;

    async fn close(&self) -> BusResult<()>;
}

/// Получение сообщений канала.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Регистрирует обработчик и блокируется до отмены `cancel`, закрытия
    /// подписчика или фатальной ошибки источника. Обработчик снимается с
    /// регистрации при любом выходе.
    async fn receive(
        &self,
        callback: Callback<EnvelopeIn>,
        cancel: &Cancel,
    ) -> BusResult<()>;

    /// Закрывает подписчика. Повторное закрытие ничего не делает.
    async fn close(&self) -> BusResult<()>;
}

/// Фабрика публикаторов транспорта.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Привязки канала, специфичные для транспорта.
    type Bindings: Send + 'static;

    async fn publisher(
        &self,
        channel: &str,
        bindings: Option<Self::Bindings>,
    ) -> BusResult<Box<dyn Publisher>>;

    async fn close(&self) -> BusResult<()>;
}

/// Фабрика подписчиков транспорта.
#[async_trait]
pub trait Consumer: Send + Sync {
    type Bindings: Send + 'static;

    async fn subscriber(
        &self,
        channel: &str,
        bindings: Option<Self::Bindings>,
    ) -> BusResult<Box<dyn Subscriber>>;

    async fn close(&self) -> BusResult<()>;
}

/// Отправляет пачку: одно сообщение напрямую, несколько через
/// [`ErrorPool`].
pub(crate) async fn send_batch<F, Fut>(
    mut envelopes: Vec<EnvelopeOut>,
    send_one: F,
) -> BusResult<()>
where
    F: Fn(EnvelopeOut) -> Fut,
    Fut: Future<Output = BusResult<()>> + Send + 'static,
{
    if envelopes.len() <= 1 {
        return match envelopes.pop() {
            Some(envelope) => send_one(envelope).await,
            None => Ok(()),
        };
    }
    let mut pool = ErrorPool::new();
    for envelope in envelopes {
        pool.go(send_one(envelope));
    }
    pool.wait().await
}
