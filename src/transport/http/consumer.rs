//! Приём входящих HTTP-соединений и их перехват подписчиками.
//!
//! Каждое принятое соединение обслуживается отдельной задачей. Задача
//! читает первый запрос и ждёт, пока у канала из его пути появится
//! подписчик. Если за `hijack_timeout` этого не произошло, клиент
//! получает 408 и соединение закрывается. Иначе сокет превращается в
//! [`DuplexConnection`], которая раздаёт запросы обработчикам канала.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    connection::{text_response, FrameWriter},
    DuplexConnection, HttpConfig, StartLine,
};
use crate::{
    binding::{channel_for, HttpChannelBindings},
    hub::{HubSubscriber, SubscriberHub},
    transport::{Consumer, Subscriber},
    BusError, BusResult, Cancel, ErrorExt,
};

/// Пауза после ошибки `accept`, чтобы не крутиться при нехватке
/// дескрипторов.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Принимает входящие соединения и отдаёт их подписчикам каналов.
#[derive(Debug)]
pub struct HttpConsumer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Shared {
    config: HttpConfig,
    hub: Arc<SubscriberHub>,
    shutdown: Cancel,
    /// Соединения, ожидающие перехвата, и перехваченные.
    active: AtomicUsize,
    live: RwLock<HashMap<Uuid, Arc<DuplexConnection>>>,
}

/// Учитывает соединение в `active`, пока жива задача, которая его
/// обслуживает.
struct ActiveGuard(Arc<Shared>);

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl HttpConsumer {
    /// Открывает слушающий сокет и запускает цикл приёма.
    pub async fn bind(
        address: &str,
        config: HttpConfig,
    ) -> BusResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| BusError::connection(address, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| BusError::connection(address, err))?;

        let shared = Arc::new(Shared {
            config,
            hub: Arc::new(SubscriberHub::new()),
            shutdown: Cancel::new(),
            active: AtomicUsize::new(0),
            live: RwLock::new(HashMap::new()),
        });
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        info!(%local_addr, "http consumer listening");

        Ok(Self {
            local_addr,
            shared,
            accept: Mutex::new(Some(accept)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Число соединений, ожидающих перехвата или уже перехваченных.
    pub fn connection_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Подписывается на канал. Каналы `"orders"` и `"/orders"` совпадают.
    pub async fn open(
        &self,
        channel: &str,
        bindings: Option<HttpChannelBindings>,
    ) -> BusResult<HubSubscriber> {
        let route = bindings.unwrap_or_default().resolve_route(channel);
        let channel = channel_for(&route.address);
        if channel.is_empty() {
            return Err(BusError::Config {
                reason: "http channel name must not be empty".to_string(),
            });
        }
        self.shared
            .hub
            .attach(channel, |_topic| async { Ok::<(), BusError>(()) })
            .await
    }

    /// Останавливает приём, закрывает подписки и все соединения.
    pub async fn shutdown(&self) -> BusResult<()> {
        self.shared.shutdown.cancel();
        self.shared.hub.close().await;

        let connections: Vec<_> = self.shared.live.write().drain().map(|(_, c)| c).collect();
        let mut errors = Vec::new();
        for connection in connections {
            if let Err(err) = connection.close().await {
                errors.push(err);
            }
        }

        let accept = self.accept.lock().take();
        if let Some(handle) = accept {
            let _ = handle.await;
        }
        info!(local_addr = %self.local_addr, "http consumer stopped");
        match BusError::join(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl Drop for HttpConsumer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl ActiveGuard {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.active.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(shared))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Обслуживание соединений
////////////////////////////////////////////////////////////////////////////////

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let guard = ActiveGuard::enter(&shared);
                debug!(%peer, "connection accepted");
                tokio::spawn(serve(Arc::clone(&shared), stream, peer, guard));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("accept loop stopped");
}

async fn serve(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    _active: ActiveGuard,
) {
    let config = &shared.config;
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::with_capacity(read, config.codec(), config.read_buffer_size);
    let mut writer = FramedWrite::new(write, config.codec());
    let deadline = Instant::now() + config.hijack_timeout;

    let first = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        first = tokio::time::timeout_at(deadline, reader.next()) => first,
    };
    let frame = match first {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(err))) => {
            let status = err.status_code().http_status();
            return reject(config, &mut writer, peer, status, &err.to_string()).await;
        }
        Ok(None) => return,
        Err(_) => {
            return reject(config, &mut writer, peer, 408, "no request before timeout").await;
        }
    };

    let path = match &frame.start {
        StartLine::Request { path, .. } => path.clone(),
        StartLine::Response { .. } => {
            return reject(config, &mut writer, peer, 400, "expected a request").await;
        }
    };
    let channel = channel_for(&path);
    if channel.is_empty() {
        return reject(config, &mut writer, peer, 404, "request path names no channel").await;
    }

    let claimed = tokio::select! {
        _ = shared.shutdown.cancelled() => {
            return reject(config, &mut writer, peer, 503, "consumer is shutting down").await;
        }
        claimed = tokio::time::timeout_at(deadline, shared.hub.claim(channel)) => claimed,
    };
    let Ok(topic) = claimed else {
        info!(%peer, channel, "no subscriber claimed the connection in time");
        return reject(config, &mut writer, peer, 408, "no subscriber for channel").await;
    };

    let connection = Arc::new(DuplexConnection::hijack(
        reader,
        writer,
        peer,
        Arc::clone(topic.fanout()),
        frame,
        config.clone(),
    ));
    let id = connection.id();
    info!(%id, %peer, channel, "connection hijacked");
    shared.live.write().insert(id, Arc::clone(&connection));

    tokio::select! {
        _ = connection.closed() => {}
        _ = topic.shutdown().cancelled() => {}
        _ = shared.shutdown.cancelled() => {}
    }

    shared.live.write().remove(&id);
    if let Err(err) = connection.close().await {
        debug!(%id, error = %err, "closing hijacked connection failed");
    }
}

/// Отвечает кодом ошибки и закрывает соединение.
async fn reject(
    config: &HttpConfig,
    writer: &mut FrameWriter,
    peer: SocketAddr,
    status: u16,
    reason: &str,
) {
    debug!(%peer, status, reason, "rejecting connection");
    let frame = text_response(status, reason).with_header("Connection", "close");
    let write = async {
        writer.send(frame).await?;
        writer.close().await
    };
    match tokio::time::timeout(config.write_timeout, write).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(%peer, error = %err, "failed to write rejection"),
        Err(_) => debug!(%peer, "rejection write timed out"),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Реализация трейтов
////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl Consumer for HttpConsumer {
    type Bindings = HttpChannelBindings;

    async fn subscriber(
        &self,
        channel: &str,
        bindings: Option<HttpChannelBindings>,
    ) -> BusResult<Box<dyn Subscriber>> {
        Ok(Box::new(self.open(channel, bindings).await?))
    }

    async fn close(&self) -> BusResult<()> {
        self.shutdown().await
    }
}
