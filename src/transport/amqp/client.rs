use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    binding::{AmqpMessageBindings, DeclareOptions, ExchangeKind},
    Acknowledger, BusResult, Headers,
};

/// Сообщение в форме, понятной клиенту брокера очередей.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpMessage {
    pub payload: Bytes,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub properties: AmqpMessageBindings,
}

/// Доставка из очереди.
#[derive(Debug)]
pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: AmqpMessage,
    /// `None`, если очередь потребляется с автоподтверждением.
    pub acker: Option<Arc<dyn Acknowledger>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
}

/// Открытый канал к брокеру очередей.
#[async_trait]
pub trait AmqpChannel: Send + Sync + fmt::Debug {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> BusResult<()>;

    async fn queue_declare(
        &self,
        name: &str,
        options: DeclareOptions,
    ) -> BusResult<()>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BusResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: AmqpMessage,
    ) -> BusResult<()>;

    /// Начинает потребление очереди. Поток доставок закрывается, когда
    /// канал или соединение закрыты.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> BusResult<mpsc::UnboundedReceiver<AmqpDelivery>>;

    /// Закрывает канал. Повторное закрытие ничего не делает.
    async fn close(&self) -> BusResult<()>;
}

/// Подключение к брокеру очередей.
#[async_trait]
pub trait AmqpConnector: Send + Sync + fmt::Debug {
    /// Открывает соединение с виртуальным хостом (`None` значит хост по
    /// умолчанию) и канал в нём.
    async fn dial(
        &self,
        vhost: Option<&str>,
    ) -> BusResult<Arc<dyn AmqpChannel>>;
}
