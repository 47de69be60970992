use std::{any::Any, fmt::Display};

use thiserror::Error;

use crate::{ErrorExt, JoinedError, StatusCode};

/// Ошибки шины сообщений.
///
/// Каждая операция `Producer`/`Consumer`/`Publisher`/`Subscriber`
/// возвращает этот тип. Отмена (`Cancelled`) и использование закрытого
/// ресурса (`Closed`) выделены в отдельные варианты, чтобы вызывающий мог
/// отличить "сдался" от "сломалось".
#[derive(Debug, Error)]
pub enum BusError {
    /// Ошибка подключения к брокеру или открытия канала.
    #[error("connection to {resource} failed: {reason}")]
    Connection { resource: String, reason: String },

    /// Ошибка объявления ресурса (exchange, queue, topic) или конфликт
    /// свойств с уже существующим ресурсом.
    #[error("declaration of {resource} failed: {reason}")]
    Declare { resource: String, reason: String },

    /// Ошибка обработчика при доставке сообщения.
    #[error("delivery failed: {reason}")]
    Delivery { reason: String },

    /// Ошибка вызова ack/nack/reject.
    #[error("acknowledgment failed: {reason}")]
    Ack { reason: String },

    /// Сработал сигнал отмены вызывающего.
    #[error(
        "operation cancelled{}",
        .cause.as_deref().map(|c| format!(": {c}")).unwrap_or_default()
    )]
    Cancelled { cause: Option<String> },

    /// Операция над уже закрытым ресурсом.
    #[error("{what} is closed")]
    Closed { what: String },

    /// Истёк таймаут операции.
    #[error("{what} timed out")]
    Timeout { what: String },

    /// Некорректный кадр на проводе.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// Кадр превышает допустимый размер.
    #[error("frame exceeds limit of {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// Некорректная конфигурация.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// Задача доставки/публикации завершилась паникой.
    #[error("task panicked: {reason}")]
    TaskPanicked { reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Совокупность нескольких ошибок одной пачки операций.
    #[error(transparent)]
    Joined(#[from] JoinedError),
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl BusError {
    pub fn connection(
        resource: impl Into<String>,
        reason: impl Display,
    ) -> Self {
        Self::Connection {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    pub fn declare(
        resource: impl Into<String>,
        reason: impl Display,
    ) -> Self {
        Self::Declare {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    pub fn delivery(reason: impl Display) -> Self {
        Self::Delivery {
            reason: reason.to_string(),
        }
    }

    pub fn ack(reason: impl Display) -> Self {
        Self::Ack {
            reason: reason.to_string(),
        }
    }

    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed { what: what.into() }
    }

    pub fn cancelled(cause: Option<String>) -> Self {
        Self::Cancelled { cause }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout { what: what.into() }
    }

    pub fn protocol(reason: impl Display) -> Self {
        Self::Protocol {
            reason: reason.to_string(),
        }
    }

    /// Объединяет набор ошибок в одну.
    ///
    /// Пустой набор даёт `None`; вложенные `Joined` разворачиваются, так что
    /// ни одна исходная ошибка не теряется и не дублируется.
    pub fn join<I>(errors: I) -> Option<Self>
    where
        I: IntoIterator<Item = BusError>,
    {
        let joined = JoinedError::from_iter(errors);
        if joined.is_empty() {
            None
        } else {
            Some(Self::Joined(joined))
        }
    }

    /// Присоединяет `other` к текущей ошибке (например, ошибку закрытия
    /// соединения к исходной ошибке объявления).
    pub fn and(
        self,
        other: BusError,
    ) -> Self {
        Self::Joined(JoinedError::from_iter([self, other]))
    }

    /// Возвращает `true`, если ошибка означает отмену вызывающим.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Возвращает `true`, если ошибка означает закрытый ресурс.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Отдельные ошибки: для `Joined` это её члены, иначе сама ошибка.
    pub fn errors(&self) -> &[BusError] {
        match self {
            Self::Joined(joined) => joined.errors(),
            other => std::slice::from_ref(other),
        }
    }
}

impl ErrorExt for BusError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Connection { .. } => StatusCode::ConnectionFailed,
            Self::Declare { .. } => StatusCode::DeclareFailed,
            Self::Delivery { .. } => StatusCode::DeliveryFailed,
            Self::Ack { .. } => StatusCode::AckFailed,
            Self::Cancelled { .. } => StatusCode::Cancelled,
            Self::Closed { .. } => StatusCode::ConnectionClosed,
            Self::Timeout { .. } => StatusCode::Timeout,
            Self::Protocol { .. } => StatusCode::InvalidFrame,
            Self::FrameTooLarge { .. } => StatusCode::SizeLimit,
            Self::Config { .. } => StatusCode::InvalidConfig,
            Self::TaskPanicked { .. } => StatusCode::Internal,
            Self::Io(_) => StatusCode::Io,
            Self::Joined(_) => StatusCode::Aggregate,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "bus".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        if let Self::Joined(joined) = self {
            tags.push(("joined", joined.len().to_string()));
        }
        tags
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
