use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::{binding::MessageBindings, BusResult, Headers};

/// Возможность подтвердить входящее сообщение.
///
/// Прикрепляется к [`EnvelopeIn`] при его создании. Транспорты без
/// подтверждений просто не прикрепляют её.
#[async_trait]
pub trait Acknowledger: Send + Sync + fmt::Debug {
    async fn ack(&self) -> BusResult<()>;

    async fn nack(
        &self,
        requeue: bool,
    ) -> BusResult<()>;

    async fn reject(
        &self,
        requeue: bool,
    ) -> BusResult<()>;
}

/// Исходящее сообщение.
///
/// Принадлежит публикующему вызову и потребляется ровно одним `send`.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOut {
    payload: BytesMut,
    headers: Headers,
    content_type: Option<String>,
    bindings: MessageBindings,
    address: Option<String>,
}

/// Входящее сообщение.
///
/// Каждый обработчик получает собственную копию; тело читается один раз
/// через [`EnvelopeIn::read`].
#[derive(Clone)]
pub struct EnvelopeIn {
    payload: Option<Bytes>,
    headers: Headers,
    content_type: Option<String>,
    bindings: MessageBindings,
    address: String,
    acknowledger: Option<Arc<dyn Acknowledger>>,
}

////////////////////////////////////////////////////////////////////////////////
// EnvelopeOut
////////////////////////////////////////////////////////////////////////////////

impl EnvelopeOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Дописывает байты в конец тела.
    pub fn write(
        &mut self,
        bytes: &[u8],
    ) {
        self.payload.extend_from_slice(bytes);
    }

    /// Очищает тело, сохраняя выделенную память (для повторных попыток).
    pub fn reset_payload(&mut self) {
        self.payload.clear();
    }

    pub fn set_headers(
        &mut self,
        headers: Headers,
    ) {
        self.headers = headers;
    }

    pub fn set_content_type(
        &mut self,
        content_type: impl Into<String>,
    ) {
        self.content_type = Some(content_type.into());
    }

    pub fn set_bindings(
        &mut self,
        bindings: MessageBindings,
    ) {
        self.bindings = bindings;
    }

    /// Ключ маршрутизации (брокер очередей).
    pub fn set_routing_key(
        &mut self,
        routing_key: impl Into<String>,
    ) {
        self.address = Some(routing_key.into());
    }

    /// Топик (лог-брокер).
    pub fn set_topic(
        &mut self,
        topic: impl Into<String>,
    ) {
        self.address = Some(topic.into());
    }

    /// Ключ записи (лог-брокер). Остальные привязки лог-брокера
    /// сохраняются, привязки другого транспорта заменяются.
    pub fn set_key(
        &mut self,
        key: impl Into<Bytes>,
    ) {
        let mut kafka = self.bindings.as_kafka().cloned().unwrap_or_default();
        kafka.key = Some(key.into());
        self.bindings = MessageBindings::Kafka(kafka);
    }

    /// Путь запроса (HTTP).
    pub fn set_path(
        &mut self,
        path: impl Into<String>,
    ) {
        self.address = Some(path.into());
    }

    /// Метод запроса (HTTP).
    pub fn set_method(
        &mut self,
        method: impl Into<String>,
    ) {
        let mut http = self.bindings.as_http().cloned().unwrap_or_default();
        http.method = Some(method.into().to_ascii_uppercase());
        self.bindings = MessageBindings::Http(http);
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn bindings(&self) -> &MessageBindings {
        &self.bindings
    }

    /// Адрес, заданный одним из транспортных сеттеров.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Заполняет адрес, если он не был задан явно.
    pub(crate) fn default_address(
        &mut self,
        address: &str,
    ) {
        if self.address.is_none() {
            self.address = Some(address.to_string());
        }
    }

    /// Отдаёт тело, не копируя его.
    pub(crate) fn take_payload(&mut self) -> Bytes {
        self.payload.split().freeze()
    }

    pub(crate) fn into_parts(mut self) -> OutParts {
        OutParts {
            payload: self.take_payload(),
            headers: self.headers,
            content_type: self.content_type,
            bindings: self.bindings,
            address: self.address,
        }
    }
}

/// Разобранное исходящее сообщение, готовое к записи транспортом.
#[derive(Debug)]
pub(crate) struct OutParts {
    pub payload: Bytes,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub bindings: MessageBindings,
    pub address: Option<String>,
}

/// Локальная доставка: исходящее сообщение превращается во входящее без
/// провода (используется in-memory транспортами и тестами).
impl From<EnvelopeOut> for EnvelopeIn {
    fn from(mut out: EnvelopeOut) -> Self {
        let payload = out.take_payload();
        EnvelopeIn {
            payload: Some(payload),
            headers: out.headers,
            content_type: out.content_type,
            bindings: out.bindings,
            address: out.address.unwrap_or_default(),
            acknowledger: None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// EnvelopeIn
////////////////////////////////////////////////////////////////////////////////

impl EnvelopeIn {
    pub fn new(
        address: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            payload: Some(payload),
            headers: Headers::new(),
            content_type: None,
            bindings: MessageBindings::None,
            address: address.into(),
            acknowledger: None,
        }
    }

    pub fn with_headers(
        mut self,
        headers: Headers,
    ) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_content_type(
        mut self,
        content_type: Option<String>,
    ) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_bindings(
        mut self,
        bindings: MessageBindings,
    ) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_acknowledger(
        mut self,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    /// Читает тело. Повторное чтение возвращает пустой буфер.
    pub fn read(&mut self) -> Bytes {
        self.payload.take().unwrap_or_default()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn bindings(&self) -> &MessageBindings {
        &self.bindings
    }

    /// Канал, ключ маршрутизации, топик или путь, по которому пришло
    /// сообщение.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn acknowledger(&self) -> Option<&Arc<dyn Acknowledger>> {
        self.acknowledger.as_ref()
    }

    /// Положительное подтверждение; без возможности подтверждения ничего не
    /// делает.
    pub async fn ack(&self) -> BusResult<()> {
        match &self.acknowledger {
            Some(a) => a.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nack(
        &self,
        requeue: bool,
    ) -> BusResult<()> {
        match &self.acknowledger {
            Some(a) => a.nack(requeue).await,
            None => Ok(()),
        }
    }

    pub async fn reject(
        &self,
        requeue: bool,
    ) -> BusResult<()> {
        match &self.acknowledger {
            Some(a) => a.reject(requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for EnvelopeIn {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("EnvelopeIn")
            .field("address", &self.address)
            .field("payload_len", &self.payload.as_ref().map(Bytes::len))
            .field("headers", &self.headers)
            .field("content_type", &self.content_type)
            .field("bindings", &self.bindings)
            .field("ackable", &self.acknowledger.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingAck {
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    #[async_trait]
    impl Acknowledger for CountingAck {
        async fn ack(&self) -> BusResult<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(
            &self,
            _requeue: bool,
        ) -> BusResult<()> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(
            &self,
            requeue: bool,
        ) -> BusResult<()> {
            self.nack(requeue).await
        }
    }

    /// Тест проверяет запись, сброс и повторную запись тела.
    #[test]
    fn test_write_and_reset_payload() {
        let mut env = EnvelopeOut::new();
        env.write(b"hello ");
        env.write(b"world");
        assert_eq!(env.payload(), b"hello world");
        env.reset_payload();
        assert!(env.payload().is_empty());
        env.write(b"retry");
        assert_eq!(env.payload(), b"retry");
    }

    /// Тест проверяет, что тело входящего сообщения читается один раз.
    #[test]
    fn test_read_is_read_once() {
        let mut env = EnvelopeIn::new("orders", Bytes::from_static(b"{}"));
        assert_eq!(env.read(), Bytes::from_static(b"{}"));
        assert!(env.read().is_empty());
    }

    /// Тест проверяет локальное превращение исходящего сообщения во входящее.
    #[test]
    fn test_out_into_in_keeps_metadata() {
        let mut out = EnvelopeOut::new();
        out.write(br#"{"a":1}"#);
        out.set_content_type("application/json");
        out.set_headers([("X", "1")].into_iter().collect());
        out.set_routing_key("orders");

        let mut env = EnvelopeIn::from(out);
        assert_eq!(env.address(), "orders");
        assert_eq!(env.content_type(), Some("application/json"));
        assert_eq!(env.headers().get("X").and_then(|v| v.as_str()), Some("1"));
        assert_eq!(env.read(), Bytes::from_static(br#"{"a":1}"#));
    }

    #[test]
    fn test_default_address_does_not_override() {
        let mut out = EnvelopeOut::new();
        out.default_address("/a");
        assert_eq!(out.address(), Some("/a"));
        out.set_path("/b");
        out.default_address("/c");
        assert_eq!(out.address(), Some("/b"));
    }

    #[test]
    fn test_transport_setters_fill_bindings() {
        let mut out = EnvelopeOut::new();
        out.set_key(Bytes::from_static(b"user-1"));
        assert_eq!(
            out.bindings().as_kafka().and_then(|k| k.key.clone()),
            Some(Bytes::from_static(b"user-1"))
        );

        out.set_method("put");
        assert!(out.bindings().as_kafka().is_none());
        assert_eq!(
            out.bindings().as_http().and_then(|h| h.method.as_deref()),
            Some("PUT")
        );
    }

    /// Тест проверяет делегирование подтверждений и отсутствие эффекта без
    /// прикреплённой возможности.
    #[tokio::test]
    async fn test_ack_capability() {
        let acker = Arc::new(CountingAck::default());
        let env = EnvelopeIn::new("q", Bytes::new()).with_acknowledger(acker.clone());
        env.ack().await.unwrap();
        env.nack(false).await.unwrap();
        env.reject(true).await.unwrap();
        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        assert_eq!(acker.nacks.load(Ordering::SeqCst), 2);

        let plain = EnvelopeIn::new("q", Bytes::new());
        assert!(plain.ack().await.is_ok());
        assert!(plain.acknowledger().is_none());
    }
}
