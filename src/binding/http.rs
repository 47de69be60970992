use serde::{Deserialize, Serialize};

use super::Resolution;

/// Метод по умолчанию для публикации по HTTP.
pub const DEFAULT_METHOD: &str = "POST";

/// Привязки канала HTTP-транспорта.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpChannelBindings {
    pub method: Option<String>,
}

/// Свойства отдельного HTTP-сообщения.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpMessageBindings {
    pub method: Option<String>,
    /// Код статуса; заполняется у входящих ответов.
    pub status_code: Option<u16>,
}

impl HttpChannelBindings {
    /// Маршрут канала: `/<channel>`. Маршрут не создаётся заранее, поэтому
    /// объявление никогда не требуется.
    pub fn resolve_route(
        &self,
        channel: &str,
    ) -> Resolution {
        Resolution::new(route_for(channel), false)
    }

    pub fn method(&self) -> String {
        self.method
            .as_deref()
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| DEFAULT_METHOD.to_string())
    }
}

pub(crate) fn route_for(channel: &str) -> String {
    format!("/{}", channel.trim_start_matches('/'))
}

/// Обратное отображение: путь запроса → имя канала (без query-строки).
pub(crate) fn channel_for(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.trim_start_matches('/')
}
