use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{binding::TopicSpec, BusResult};

/// Запись для отправки в лог.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProduceRecord {
    pub topic: String,
    /// `None` значит выбор партиции по ключу или по кругу.
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
}

/// Запись, прочитанная из лога.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
}

/// Клиент лог-брокера.
#[async_trait]
pub trait KafkaClient: Send + Sync + fmt::Debug {
    async fn create_topic(
        &self,
        spec: &TopicSpec,
    ) -> BusResult<()>;

    async fn produce(
        &self,
        record: ProduceRecord,
    ) -> BusResult<()>;

    /// Читает до `max_records` записей от текущих смещений группы и
    /// фиксирует новые смещения. Если записей нет, ждёт не дольше
    /// `max_wait` и возвращает пустую пачку.
    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        max_records: usize,
        max_wait: Duration,
    ) -> BusResult<Vec<KafkaRecord>>;

    async fn close(&self) -> BusResult<()>;
}

/// Подключение к лог-брокеру.
#[async_trait]
pub trait KafkaConnector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> BusResult<Arc<dyn KafkaClient>>;
}
