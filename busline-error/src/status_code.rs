use std::fmt;

use num_enum::TryFromPrimitive;
#[cfg(feature = "serde_repr")]
use serde_repr::{Deserialize_repr, Serialize_repr};
#[cfg(feature = "strum")]
use strum_macros::{AsRefStr, EnumIter};

/// Коды статуса для категоризации ошибок шины.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки
/// - 2xxx: Ресурсы (объявление, адресация)
/// - 3xxx: Доставка и подтверждение
/// - 6xxx: Сеть / IO
/// - 8xxx: Протокольные ошибки
///
/// # Реализация:
/// - `num_enum::TryFromPrimitive` даёт нативную реализацию `TryFrom<u32>`.
/// - опционально: `strum` для `AsRefStr`/`EnumIter` (feature = "strum").
/// - опционально: `serde_repr` для сериализации в виде числового значения
///   (feature = "serde_repr").
#[cfg_attr(feature = "strum", derive(AsRefStr, EnumIter))]
#[cfg_attr(feature = "serde_repr", derive(Serialize_repr, Deserialize_repr))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Internal = 1003,
    InvalidArgs = 1004,
    Cancelled = 1006,
    Aggregate = 1007,
    InvalidConfig = 1008,

    // === 2xxx: Ресурсы ===
    NotFound = 2000,
    DeclareFailed = 2001,

    // === 3xxx: Доставка ===
    DeliveryFailed = 3000,
    AckFailed = 3001,

    // === 6xxx: Сеть/IO ===
    Io = 6000,
    ConnectionClosed = 6001,
    Timeout = 6002,
    ConnectionFailed = 6004,

    // === 8xxx: Протокол ===
    InvalidFrame = 8000,
    SizeLimit = 8007,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить вариант `StatusCode` из `u32`.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Возвращает `true`, если операцию с этим кодом имеет смысл повторить.
    ///
    /// Сама шина ничего не повторяет: решение остаётся за вызывающим.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed | Self::DeliveryFailed | Self::Aggregate
        )
    }

    /// Ошибка протокола или разбора кадра (диапазон 8xxx).
    pub fn is_protocol_error(&self) -> bool {
        (8000..=8999).contains(&self.code())
    }

    /// Рекомендуемый уровень логирования для данного кода.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Trace,
            Self::Cancelled | Self::NotFound => LogLevel::Debug,
            Self::ConnectionClosed => LogLevel::Info,
            Self::Internal | Self::ConnectionFailed | Self::DeclareFailed => LogLevel::Error,
            _ => LogLevel::Warn,
        }
    }

    /// HTTP-статус, соответствующий коду статуса.
    ///
    /// Используется HTTP-транспортом при ответе на входящий запрос.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Success => 200,
            Self::NotFound => 404,
            Self::InvalidArgs | Self::InvalidFrame => 400,
            Self::Timeout => 408,
            Self::SizeLimit => 413,
            Self::ConnectionClosed => 503,
            _ => 500,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        #[cfg(feature = "strum")]
        {
            write!(f, "{} ({})", self.as_ref(), self.code())
        }
        #[cfg(not(feature = "strum"))]
        {
            write!(f, "{:?} ({})", self, self.code())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что retryable-коды помечаются корректно.
    #[test]
    fn test_retryable() {
        assert!(StatusCode::Timeout.is_retryable());
        assert!(StatusCode::DeliveryFailed.is_retryable());
        assert!(!StatusCode::Cancelled.is_retryable());
        assert!(!StatusCode::ConnectionClosed.is_retryable());
    }

    /// Тест проверяет соответствие кодов HTTP-статусам.
    #[test]
    fn test_http_mapping() {
        assert_eq!(StatusCode::NotFound.http_status(), 404);
        assert_eq!(StatusCode::Timeout.http_status(), 408);
        assert_eq!(StatusCode::SizeLimit.http_status(), 413);
        assert_eq!(StatusCode::DeliveryFailed.http_status(), 500);
    }

    /// Тест проверяет конвертацию через `TryFrom<u32>`.
    #[test]
    fn test_from_try_from_u32() {
        let n = StatusCode::AckFailed.code();
        assert_eq!(StatusCode::try_from(n).unwrap(), StatusCode::AckFailed);
        assert!(StatusCode::from_u32(99999).is_none());
    }

    /// Тест проверяет определение протокольных ошибок (диапазон 8xxx).
    #[test]
    fn test_is_protocol_error() {
        assert!(StatusCode::InvalidFrame.is_protocol_error());
        assert!(!StatusCode::NotFound.is_protocol_error());
    }

    /// Тест проверяет формат `Display`.
    #[test]
    fn test_display_contains_name_and_code() {
        let s = format!("{}", StatusCode::NotFound);
        assert!(s.contains("2000"), "got: {s}");
        assert!(s.contains("NotFound"), "got: {s}");
    }

    #[test]
    fn test_log_level_mappings() {
        assert_eq!(StatusCode::Success.log_level(), LogLevel::Trace);
        assert_eq!(StatusCode::Cancelled.log_level(), LogLevel::Debug);
        assert_eq!(StatusCode::DeclareFailed.log_level(), LogLevel::Error);
    }
}
