//! Дуплексное HTTP-соединение.
//!
//! Соединение одновременно публикатор и подписчик. Исходящие сообщения
//! пишутся в сокет как запросы. Фоновый цикл чтения разбирает входящие
//! кадры: запросы раздаются обработчикам реестра и получают ответ
//! (200, код ошибки или 404 без обработчиков), ответы раздаются
//! обработчикам как сообщения с кодом статуса.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HttpCodec, HttpConfig, HttpFrame, StartLine, CONTENT_TYPE_HEADER};
use crate::{
    binding::{http::route_for, HttpMessageBindings, MessageBindings, DEFAULT_METHOD},
    fanout::{Callback, FanOut},
    transport::{send_batch, Publisher, Subscriber},
    BusError, BusResult, Cancel, EnvelopeIn, EnvelopeOut, ErrorExt, Headers,
};

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, HttpCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, HttpCodec>;

/// Состояние, общее для соединения и его цикла чтения.
#[derive(Debug)]
struct Link {
    id: Uuid,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<FrameWriter>,
    inbound: Arc<FanOut<EnvelopeIn>>,
    closed: Cancel,
    /// Запись закрыта (сокет получил FIN).
    shut: AtomicBool,
    config: HttpConfig,
}

/// Дуплексное соединение поверх одного TCP-сокета.
#[derive(Debug)]
pub struct DuplexConnection {
    link: Arc<Link>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl DuplexConnection {
    /// Устанавливает исходящее соединение.
    pub async fn dial(
        address: &str,
        config: HttpConfig,
    ) -> BusResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|err| BusError::connection(address, err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| BusError::connection(address, err))?;
        let _ = stream.set_nodelay(true);

        let (read, write) = stream.into_split();
        let reader = FramedRead::with_capacity(read, config.codec(), config.read_buffer_size);
        let writer = FramedWrite::new(write, config.codec());
        let connection = Self::spawn(
            reader,
            writer,
            peer,
            Arc::new(FanOut::new()),
            None,
            config,
        );
        info!(id = %connection.id(), %peer, "http connection dialed");
        Ok(connection)
    }

    /// Оборачивает перехваченный входящий сокет. `first` это запрос,
    /// прочитанный до перехвата; он обрабатывается первым.
    pub(crate) fn hijack(
        reader: FrameReader,
        writer: FrameWriter,
        peer: SocketAddr,
        inbound: Arc<FanOut<EnvelopeIn>>,
        first: HttpFrame,
        config: HttpConfig,
    ) -> Self {
        Self::spawn(reader, writer, peer, inbound, Some(first), config)
    }

    fn spawn(
        reader: FrameReader,
        writer: FrameWriter,
        peer: SocketAddr,
        inbound: Arc<FanOut<EnvelopeIn>>,
        first: Option<HttpFrame>,
        config: HttpConfig,
    ) -> Self {
        let link = Arc::new(Link {
            id: Uuid::new_v4(),
            peer,
            writer: tokio::sync::Mutex::new(writer),
            inbound,
            closed: Cancel::new(),
            shut: AtomicBool::new(false),
            config,
        });
        let handle = tokio::spawn(read_loop(Arc::clone(&link), reader, first));
        Self {
            link,
            reader: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.link.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.link.peer
    }

    pub fn is_closed(&self) -> bool {
        self.link.closed.is_cancelled()
    }

    /// Завершается, когда соединение закрыто любой из сторон.
    pub async fn closed(&self) {
        self.link.closed.cancelled().await
    }

    /// Отправляет сообщения запросами `method route`; адрес и метод
    /// сообщения имеют приоритет.
    pub(crate) async fn send_routed(
        &self,
        envelopes: Vec<EnvelopeOut>,
        route: &str,
        method: &str,
    ) -> BusResult<()> {
        if self.is_closed() {
            return Err(self.link.closed_error());
        }
        send_batch(envelopes, |envelope| {
            let link = Arc::clone(&self.link);
            let frame = request_from(envelope, route, method);
            async move { link.write(frame).await }
        })
        .await
    }

    /// Закрывает соединение. Заблокированные `receive` получают ошибку
    /// закрытия. Повторное закрытие ничего не делает.
    pub async fn close(&self) -> BusResult<()> {
        let result = self.link.shutdown().await;
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            // Цикл видит отмену и завершается сам.
            let _ = handle.await;
        }
        result
    }
}

impl Drop for DuplexConnection {
    fn drop(&mut self) {
        self.link.closed.cancel();
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Link
////////////////////////////////////////////////////////////////////////////////

impl Link {
    fn closed_error(&self) -> BusError {
        match self.closed.cause() {
            Some(cause) => BusError::connection(self.peer.to_string(), cause),
            None => BusError::closed(format!("http connection to {}", self.peer)),
        }
    }

    async fn write(
        &self,
        frame: HttpFrame,
    ) -> BusResult<()> {
        if self.shut.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.config.write_timeout, writer.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::timeout(format!("http write to {}", self.peer))),
        }
    }

    /// Отменяет цикл чтения и закрывает запись в сокет.
    async fn shutdown(&self) -> BusResult<()> {
        self.closed.cancel();
        if self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        let result = match tokio::time::timeout(self.config.write_timeout, writer.close()).await {
            Ok(result) => result,
            Err(_) => Err(BusError::timeout(format!("http shutdown of {}", self.peer))),
        };
        info!(id = %self.id, peer = %self.peer, "http connection closed");
        result
    }

    async fn dispatch(
        &self,
        frame: HttpFrame,
    ) {
        if !frame.is_request() {
            if self.inbound.is_empty() {
                debug!(id = %self.id, status = ?frame.status(), "response dropped, no receivers");
                return;
            }
            let envelope = envelope_from(frame, &self.peer.to_string());
            if let Err(err) = self.inbound.put(envelope).wait().await {
                warn!(id = %self.id, error = %err, "response delivery failed");
            }
            return;
        }

        let reply = if self.inbound.is_empty() {
            text_response(404, "no subscriber on this connection")
        } else {
            let envelope = envelope_from(frame, "");
            match self.inbound.put(envelope).wait().await {
                Ok(()) => HttpFrame::response(200),
                Err(err) => {
                    warn!(id = %self.id, error = %err, "request delivery failed");
                    text_response(err.status_code().http_status(), &err.to_string())
                }
            }
        };
        if let Err(err) = self.write(reply).await {
            warn!(id = %self.id, error = %err, "failed to write response");
            self.closed.cancel_with(err.to_string());
        }
    }
}

async fn read_loop(
    link: Arc<Link>,
    mut reader: FrameReader,
    mut pending: Option<HttpFrame>,
) {
    debug!(id = %link.id, peer = %link.peer, "read loop started");
    loop {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => {
                let next = tokio::select! {
                    _ = link.closed.cancelled() => break,
                    next = reader.next() => next,
                };
                match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        warn!(id = %link.id, error = %err, "read failed, closing connection");
                        link.closed.cancel_with(err.to_string());
                        break;
                    }
                    None => {
                        debug!(id = %link.id, "peer closed the connection");
                        link.closed.cancel();
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = link.closed.cancelled() => break,
            _ = link.dispatch(frame) => {}
        }
    }

    if let Err(err) = link.shutdown().await {
        debug!(id = %link.id, error = %err, "shutdown after read loop failed");
    }
    debug!(id = %link.id, "read loop stopped");
}

pub(crate) fn text_response(
    status: u16,
    body: &str,
) -> HttpFrame {
    HttpFrame::response(status)
        .with_header(CONTENT_TYPE_HEADER, "text/plain; charset=utf-8")
        .with_body(body.to_string())
}

/// Запрос из исходящего сообщения.
fn request_from(
    envelope: EnvelopeOut,
    route: &str,
    method: &str,
) -> HttpFrame {
    let parts = envelope.into_parts();
    let method = parts
        .bindings
        .as_http()
        .and_then(|http| http.method.clone())
        .unwrap_or_else(|| method.to_string());
    let path = parts
        .address
        .as_deref()
        .map(route_for)
        .unwrap_or_else(|| route.to_string());

    let mut frame = HttpFrame::request(method, path).with_body(parts.payload);
    frame.headers = parts.headers.to_byte_pairs();
    if let Some(content_type) = parts.content_type {
        frame.headers.push((CONTENT_TYPE_HEADER.to_string(), content_type.into()));
    }
    frame
}

/// Входящее сообщение из кадра. Адрес запроса это его путь, адрес ответа
/// задаёт вызывающий.
fn envelope_from(
    frame: HttpFrame,
    response_address: &str,
) -> EnvelopeIn {
    let HttpFrame {
        start,
        headers,
        body,
    } = frame;

    let mut content_type = None;
    let headers = Headers::from_byte_pairs(headers.into_iter().filter_map(|(name, value)| {
        if name.eq_ignore_ascii_case("content-length") {
            return None;
        }
        if name.eq_ignore_ascii_case(CONTENT_TYPE_HEADER) {
            content_type = String::from_utf8(value.to_vec()).ok();
            return None;
        }
        Some((name, value))
    }));

    let (address, bindings) = match start {
        StartLine::Request { method, path } => (
            path,
            HttpMessageBindings {
                method: Some(method),
                status_code: None,
            },
        ),
        StartLine::Response { status, .. } => (
            response_address.to_string(),
            HttpMessageBindings {
                method: None,
                status_code: Some(status),
            },
        ),
    };

    EnvelopeIn::new(address, body)
        .with_headers(headers)
        .with_content_type(content_type)
        .with_bindings(MessageBindings::Http(bindings))
}

////////////////////////////////////////////////////////////////////////////////
// Реализация трейтов
////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl Publisher for DuplexConnection {
    async fn send(
        &self,
        envelopes: Vec<EnvelopeOut>,
    ) -> BusResult<()> {
        self.send_routed(envelopes, "/", DEFAULT_METHOD).await
    }

    async fn close(&self) -> BusResult<()> {
        DuplexConnection::close(self).await
    }
}

#[async_trait]
impl Subscriber for DuplexConnection {
    async fn receive(
        &self,
        callback: Callback<EnvelopeIn>,
        cancel: &Cancel,
    ) -> BusResult<()> {
        if self.is_closed() {
            return Err(self.link.closed_error());
        }
        let _registration = self.link.inbound.register(callback);
        tokio::select! {
            _ = cancel.cancelled() => Err(cancel.error()),
            _ = self.link.closed.cancelled() => Err(self.link.closed_error()),
        }
    }

    async fn close(&self) -> BusResult<()> {
        DuplexConnection::close(self).await
    }
}
