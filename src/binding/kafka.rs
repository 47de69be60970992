use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{pick_address, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    Delete,
    Compact,
}

/// Конфигурация топика, применяемая при его создании.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicConfiguration {
    pub cleanup_policy: Option<Vec<CleanupPolicy>>,
    #[serde(rename = "retention.ms")]
    pub retention_ms: Option<i64>,
    #[serde(rename = "retention.bytes")]
    pub retention_bytes: Option<i64>,
    #[serde(rename = "max.message.bytes")]
    pub max_message_bytes: Option<u32>,
}

/// Привязки канала лог-брокера.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaChannelBindings {
    pub topic: Option<String>,
    pub partitions: Option<u32>,
    pub replicas: Option<u16>,
    pub topic_configuration: Option<TopicConfiguration>,
}

/// Описание топика для создания.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub replicas: u16,
    pub configuration: TopicConfiguration,
}

/// Свойства отдельной записи лога.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KafkaMessageBindings {
    pub key: Option<Bytes>,
    pub partition: Option<i32>,
    /// Смещение записи; заполняется только у входящих сообщений.
    pub offset: Option<i64>,
}

impl KafkaChannelBindings {
    /// Разрешает топик: явное имя или имя канала. Создание требуется, если
    /// задано число партиций, реплик или конфигурация топика.
    pub fn resolve_topic(
        &self,
        channel: &str,
    ) -> Resolution {
        let address = pick_address(self.topic.as_deref(), Some(channel), channel);
        let declare = self.partitions.is_some()
            || self.replicas.is_some()
            || self.topic_configuration.is_some();
        Resolution::new(address, declare)
    }

    pub fn topic_spec(
        &self,
        channel: &str,
    ) -> TopicSpec {
        TopicSpec {
            name: self.resolve_topic(channel).address,
            partitions: self.partitions.unwrap_or(1).max(1),
            replicas: self.replicas.unwrap_or(1).max(1),
            configuration: self.topic_configuration.clone().unwrap_or_default(),
        }
    }
}
