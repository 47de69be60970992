use std::collections::{hash_map, HashMap};

use bytes::Bytes;

/// Значение заголовка сообщения.
///
/// Транспорты, принимающие только байтовые заголовки, получают значения
/// через [`HeaderValue::to_byte_values`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    List(Vec<String>),
    Bytes(Bytes),
    /// Произвольное структурированное значение; сериализуется в JSON.
    Other(serde_json::Value),
}

/// Заголовки сообщения: имя → значение. Порядок вставки не сохраняется.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(HashMap<String, HeaderValue>);

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl HeaderValue {
    /// Приводит значение к байтовой форме.
    ///
    /// Строка даёт одно значение в UTF-8, список даёт по значению на каждый
    /// элемент, `Other` сериализуется в компактный JSON. Преобразование
    /// тотально.
    pub fn to_byte_values(&self) -> Vec<Bytes> {
        match self {
            Self::Str(s) => vec![Bytes::copy_from_slice(s.as_bytes())],
            Self::List(items) => items
                .iter()
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                .collect(),
            Self::Bytes(b) => vec![b.clone()],
            Self::Other(serde_json::Value::String(s)) => {
                vec![Bytes::copy_from_slice(s.as_bytes())]
            }
            Self::Other(value) => vec![Bytes::from(value.to_string())],
        }
    }

    /// Возвращает строку, если значение строковое.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> Option<HeaderValue> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<&HeaderValue> {
        self.0.get(name)
    }

    pub fn remove(
        &mut self,
        name: &str,
    ) -> Option<HeaderValue> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, HeaderValue> {
        self.0.iter()
    }

    /// Нормализует заголовки в пары `(имя, байты)`.
    ///
    /// Список превращается в повторяющиеся пары с одним именем.
    pub fn to_byte_pairs(&self) -> Vec<(String, Bytes)> {
        self.0
            .iter()
            .flat_map(|(name, value)| {
                value
                    .to_byte_values()
                    .into_iter()
                    .map(move |bytes| (name.clone(), bytes))
            })
            .collect()
    }

    /// Собирает заголовки из байтовых пар, полученных с провода.
    ///
    /// Валидный UTF-8 становится `Str`, остальное остаётся `Bytes`;
    /// повторяющиеся имена собираются в `List`.
    pub fn from_byte_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, Bytes)>,
    {
        let mut headers = Headers::new();
        for (name, bytes) in pairs {
            let value = match std::str::from_utf8(&bytes) {
                Ok(s) => HeaderValue::Str(s.to_string()),
                Err(_) => HeaderValue::Bytes(bytes),
            };
            match headers.0.remove(&name) {
                None => {
                    headers.0.insert(name, value);
                }
                Some(previous) => {
                    let merged = merge_repeated(previous, value);
                    headers.0.insert(name, merged);
                }
            }
        }
        headers
    }
}

fn merge_repeated(
    previous: HeaderValue,
    next: HeaderValue,
) -> HeaderValue {
    let as_text = |v: HeaderValue| match v {
        HeaderValue::Str(s) => s,
        HeaderValue::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
        HeaderValue::List(items) => items.join(","),
        HeaderValue::Other(value) => value.to_string(),
    };
    match previous {
        HeaderValue::List(mut items) => {
            items.push(as_text(next));
            HeaderValue::List(items)
        }
        other => HeaderValue::List(vec![as_text(other), as_text(next)]),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Преобразования
////////////////////////////////////////////////////////////////////////////////

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

impl From<Bytes> for HeaderValue {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<serde_json::Value> for HeaderValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Other(value)
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<HeaderValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Headers(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Headers {
    type Item = (String, HeaderValue);
    type IntoIter = hash_map::IntoIter<String, HeaderValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Тест проверяет нормализацию каждого вида значения в байты.
    #[test]
    fn test_to_byte_values_per_variant() {
        assert_eq!(
            HeaderValue::from("1").to_byte_values(),
            vec![Bytes::from_static(b"1")]
        );
        assert_eq!(
            HeaderValue::from(vec!["a".to_string(), "b".to_string()]).to_byte_values(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
        assert_eq!(
            HeaderValue::from(vec![0xffu8, 0x00]).to_byte_values(),
            vec![Bytes::from_static(&[0xff, 0x00])]
        );
        assert_eq!(
            HeaderValue::from(json!({"n": 1})).to_byte_values(),
            vec![Bytes::from_static(br#"{"n":1}"#)]
        );
        assert_eq!(
            HeaderValue::from(json!("plain")).to_byte_values(),
            vec![Bytes::from_static(b"plain")]
        );
    }

    /// Тест проверяет, что список превращается в повторяющиеся пары.
    #[test]
    fn test_list_becomes_repeated_pairs() {
        let headers: Headers = [("X-Tag", vec!["a".to_string(), "b".to_string()])]
            .into_iter()
            .collect();
        let pairs = headers.to_byte_pairs();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|(name, _)| name == "X-Tag"));
    }

    /// Тест проверяет сборку заголовков из байтовых пар с провода.
    #[test]
    fn test_from_byte_pairs_groups_and_keeps_binary() {
        let headers = Headers::from_byte_pairs(vec![
            ("X".to_string(), Bytes::from_static(b"1")),
            ("Tag".to_string(), Bytes::from_static(b"a")),
            ("Tag".to_string(), Bytes::from_static(b"b")),
            ("Raw".to_string(), Bytes::from_static(&[0xff])),
        ]);
        assert_eq!(headers.get("X"), Some(&HeaderValue::Str("1".into())));
        assert_eq!(
            headers.get("Tag"),
            Some(&HeaderValue::List(vec!["a".into(), "b".into()]))
        );
        assert!(matches!(headers.get("Raw"), Some(HeaderValue::Bytes(_))));
    }

    #[test]
    fn test_insert_replaces_value() {
        let mut headers = Headers::new();
        assert!(headers.insert("X", "1").is_none());
        assert_eq!(headers.insert("X", "2"), Some(HeaderValue::from("1")));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X").and_then(HeaderValue::as_str), Some("2"));
    }
}
