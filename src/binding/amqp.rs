use serde::{Deserialize, Serialize};

use super::{pick_address, Resolution};

/// Имя exchange по умолчанию (безымянный exchange брокера).
pub const DEFAULT_EXCHANGE: &str = "";

/// Режим адресации канала.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelIs {
    /// Канал это ключ маршрутизации внутри exchange.
    #[default]
    RoutingKey,
    /// Канал это очередь.
    Queue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

/// Параметры exchange. Отсутствие поля означает политику по умолчанию.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeBindings {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ExchangeKind>,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub vhost: Option<String>,
}

/// Параметры очереди. Отсутствие поля означает политику по умолчанию.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueBindings {
    pub name: Option<String>,
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
    pub vhost: Option<String>,
}

/// Привязки канала брокера очередей.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AmqpChannelBindings {
    pub is: Option<ChannelIs>,
    pub exchange: Option<ExchangeBindings>,
    pub queue: Option<QueueBindings>,
    /// Требуется ли явное подтверждение на стороне подписчика
    /// (по умолчанию `true`).
    pub ack: Option<bool>,
}

/// Флаги объявления ресурса.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeclareOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Свойства отдельного AMQP-сообщения.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AmqpMessageBindings {
    pub content_encoding: Option<String>,
    pub message_type: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: Option<u8>,
    /// TTL сообщения в миллисекундах.
    pub expiration_ms: Option<u64>,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Unix-время в секундах.
    pub timestamp: Option<u64>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl ExchangeBindings {
    fn has_declare_fields(&self) -> bool {
        self.durable.is_some() || self.auto_delete.is_some() || self.vhost.is_some()
    }

    pub fn declare_options(&self) -> DeclareOptions {
        DeclareOptions {
            durable: self.durable.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            exclusive: false,
        }
    }
}

impl QueueBindings {
    fn has_declare_fields(&self) -> bool {
        self.durable.is_some()
            || self.exclusive.is_some()
            || self.auto_delete.is_some()
            || self.vhost.is_some()
    }

    pub fn declare_options(&self) -> DeclareOptions {
        DeclareOptions {
            durable: self.durable.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            exclusive: self.exclusive.unwrap_or(false),
        }
    }
}

impl AmqpChannelBindings {
    pub fn with_exchange(
        mut self,
        exchange: ExchangeBindings,
    ) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn with_queue(
        mut self,
        queue: QueueBindings,
    ) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_ack(
        mut self,
        ack: bool,
    ) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Разрешает exchange для канала.
    ///
    /// Имя канала никогда не подразумевает exchange, поэтому без явного
    /// имени используется безымянный exchange по умолчанию, который
    /// объявлять нельзя.
    pub fn resolve_exchange(
        &self,
        _channel: &str,
    ) -> Resolution {
        let exchange = self.exchange.clone().unwrap_or_default();
        let address = pick_address(exchange.name.as_deref(), None, DEFAULT_EXCHANGE);
        let declare = address != DEFAULT_EXCHANGE && exchange.has_declare_fields();
        Resolution::new(address, declare)
    }

    /// Разрешает очередь для канала: явное имя или имя канала.
    pub fn resolve_queue(
        &self,
        channel: &str,
    ) -> Resolution {
        let queue = self.queue.clone().unwrap_or_default();
        let address = pick_address(queue.name.as_deref(), Some(channel), channel);
        Resolution::new(address, queue.has_declare_fields())
    }

    /// Ключ маршрутизации для публикации.
    ///
    /// В exchange по умолчанию ключ совпадает с именем очереди.
    pub fn routing_key(
        &self,
        channel: &str,
    ) -> String {
        let exchange = self.resolve_exchange(channel);
        if exchange.address == DEFAULT_EXCHANGE || self.is == Some(ChannelIs::Queue) {
            self.resolve_queue(channel).address
        } else {
            channel.to_string()
        }
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.exchange
            .as_ref()
            .and_then(|e| e.kind)
            .unwrap_or_default()
    }

    /// Виртуальный хост: из очереди, затем из exchange.
    pub fn vhost(&self) -> Option<&str> {
        self.queue
            .as_ref()
            .and_then(|q| q.vhost.as_deref())
            .or_else(|| self.exchange.as_ref().and_then(|e| e.vhost.as_deref()))
    }

    pub fn ack_required(&self) -> bool {
        self.ack.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn durable_queue(name: Option<&str>) -> AmqpChannelBindings {
        AmqpChannelBindings::default().with_queue(QueueBindings {
            name: name.map(str::to_string),
            durable: Some(true),
            ..Default::default()
        })
    }

    /// Тест проверяет разрешение очереди: пустая конфигурация даёт имя
    /// канала без объявления, поле durable включает объявление независимо от
    /// переопределения имени.
    #[rstest]
    #[case(AmqpChannelBindings::default(), "orders", false)]
    #[case(durable_queue(None), "orders", true)]
    #[case(durable_queue(Some("orders.v2")), "orders.v2", true)]
    #[case(
        AmqpChannelBindings::default().with_queue(QueueBindings {
            name: Some("named".into()),
            ..Default::default()
        }),
        "named",
        false
    )]
    #[case(
        AmqpChannelBindings::default().with_queue(QueueBindings {
            vhost: Some("/staging".into()),
            ..Default::default()
        }),
        "orders",
        true
    )]
    fn test_resolve_queue(
        #[case] bindings: AmqpChannelBindings,
        #[case] address: &str,
        #[case] declare: bool,
    ) {
        assert_eq!(
            bindings.resolve_queue("orders"),
            Resolution::new(address, declare)
        );
    }

    /// Тест проверяет, что без явного имени используется exchange по
    /// умолчанию, который никогда не объявляется.
    #[rstest]
    #[case(AmqpChannelBindings::default(), "", false)]
    #[case(
        AmqpChannelBindings::default().with_exchange(ExchangeBindings {
            durable: Some(true),
            ..Default::default()
        }),
        "",
        false
    )]
    #[case(
        AmqpChannelBindings::default().with_exchange(ExchangeBindings {
            name: Some("events".into()),
            ..Default::default()
        }),
        "events",
        false
    )]
    #[case(
        AmqpChannelBindings::default().with_exchange(ExchangeBindings {
            name: Some("events".into()),
            auto_delete: Some(false),
            ..Default::default()
        }),
        "events",
        true
    )]
    fn test_resolve_exchange(
        #[case] bindings: AmqpChannelBindings,
        #[case] address: &str,
        #[case] declare: bool,
    ) {
        assert_eq!(
            bindings.resolve_exchange("orders"),
            Resolution::new(address, declare)
        );
    }

    #[test]
    fn test_routing_key_follows_exchange() {
        assert_eq!(AmqpChannelBindings::default().routing_key("orders"), "orders");

        let named_queue = AmqpChannelBindings::default().with_queue(QueueBindings {
            name: Some("q1".into()),
            ..Default::default()
        });
        assert_eq!(named_queue.routing_key("orders"), "q1");

        let named_exchange = AmqpChannelBindings::default().with_exchange(ExchangeBindings {
            name: Some("events".into()),
            ..Default::default()
        });
        assert_eq!(named_exchange.routing_key("orders"), "orders");
    }

    #[test]
    fn test_ack_defaults_to_required() {
        assert!(AmqpChannelBindings::default().ack_required());
        assert!(!AmqpChannelBindings::default().with_ack(false).ack_required());
    }

    /// Тест проверяет разбор привязок из JSON в форме, принятой в
    /// описаниях каналов.
    #[test]
    fn test_deserialize_from_json() {
        let bindings: AmqpChannelBindings = serde_json::from_value(serde_json::json!({
            "is": "queue",
            "queue": { "name": "jobs", "durable": true, "autoDelete": false },
            "exchange": { "name": "work", "type": "fanout", "vhost": "/" }
        }))
        .unwrap();
        assert_eq!(bindings.is, Some(ChannelIs::Queue));
        assert_eq!(bindings.exchange_kind(), ExchangeKind::Fanout);
        assert_eq!(bindings.vhost(), Some("/"));
        assert_eq!(bindings.resolve_queue("ignored").address, "jobs");
    }
}
