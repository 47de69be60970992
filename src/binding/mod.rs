//! Привязки (bindings) каналов к ресурсам транспорта.
//!
//! Логический канал (например, `"orders"`) превращается в адрес на проводе:
//! exchange/queue у брокера очередей, topic у лог-брокера, HTTP-маршрут.
//! Правило общее для всех транспортов:
//!
//! 1. имя, явно указанное в конфигурации, выигрывает;
//! 2. иначе, если режим адресации подразумевает, что канал и есть ресурс,
//!    используется имя канала;
//! 3. иначе берётся значение транспорта по умолчанию.
//!
//! Объявление (создание) ресурса требуется, только если в конфигурации явно
//! задано хотя бы одно поле, влияющее на объявление. Пустая конфигурация
//! никогда не вызывает declare: ресурс считается существующим.

pub mod amqp;
pub mod http;
pub mod kafka;

pub use amqp::*;
pub use http::*;
pub use kafka::*;

/// Результат разрешения привязки.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Адрес ресурса на проводе.
    pub address: String,
    /// Нужно ли объявить ресурс перед использованием.
    pub declare: bool,
}

/// Метаданные транспорта, прикреплённые к отдельному сообщению.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MessageBindings {
    #[default]
    None,
    Amqp(AmqpMessageBindings),
    Kafka(KafkaMessageBindings),
    Http(HttpMessageBindings),
}

impl Resolution {
    pub(crate) fn new(
        address: impl Into<String>,
        declare: bool,
    ) -> Self {
        Self {
            address: address.into(),
            declare,
        }
    }
}

impl MessageBindings {
    pub fn as_amqp(&self) -> Option<&AmqpMessageBindings> {
        match self {
            Self::Amqp(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_kafka(&self) -> Option<&KafkaMessageBindings> {
        match self {
            Self::Kafka(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_http(&self) -> Option<&HttpMessageBindings> {
        match self {
            Self::Http(b) => Some(b),
            _ => None,
        }
    }
}

/// Общее правило выбора адреса: явное имя, затем подразумеваемое, затем
/// значение по умолчанию.
pub(crate) fn pick_address(
    explicit: Option<&str>,
    implied: Option<&str>,
    fallback: &str,
) -> String {
    explicit.or(implied).unwrap_or(fallback).to_string()
}
