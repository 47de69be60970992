use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::{DuplexConnection, HttpConfig};
use crate::{
    binding::HttpChannelBindings,
    transport::{Producer, Publisher},
    BusError, BusResult, EnvelopeOut,
};

/// Открывает по одному исходящему соединению на публикатор.
#[derive(Debug)]
pub struct HttpProducer {
    address: String,
    config: HttpConfig,
    connections: Mutex<Vec<Arc<DuplexConnection>>>,
    closed: AtomicBool,
}

/// Публикатор одного маршрута.
///
/// Ответы на отправленные запросы приходят обработчикам, которые
/// зарегистрированы на [`HttpPublisher::connection`].
#[derive(Debug)]
pub struct HttpPublisher {
    connection: Arc<DuplexConnection>,
    route: String,
    method: String,
}

impl HttpProducer {
    pub fn new(
        address: impl Into<String>,
        config: HttpConfig,
    ) -> Self {
        Self {
            address: address.into(),
            config,
            connections: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn open(
        &self,
        channel: &str,
        bindings: Option<HttpChannelBindings>,
    ) -> BusResult<HttpPublisher> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::closed("http producer"));
        }
        let bindings = bindings.unwrap_or_default();
        let route = bindings.resolve_route(channel).address;
        let method = bindings.method();

        let connection = Arc::new(DuplexConnection::dial(&self.address, self.config.clone()).await?);
        self.connections.lock().push(Arc::clone(&connection));
        info!(channel, %route, %method, address = %self.address, "http publisher opened");
        Ok(HttpPublisher {
            connection,
            route,
            method,
        })
    }
}

#[async_trait]
impl Producer for HttpProducer {
    type Bindings = HttpChannelBindings;

    async fn publisher(
        &self,
        channel: &str,
        bindings: Option<HttpChannelBindings>,
    ) -> BusResult<Box<dyn Publisher>> {
        Ok(Box::new(self.open(channel, bindings).await?))
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let connections: Vec<_> = self.connections.lock().drain(..).collect();
        let mut errors = Vec::new();
        for connection in connections {
            if let Err(err) = connection.close().await {
                errors.push(err);
            }
        }
        match BusError::join(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl HttpPublisher {
    pub fn connection(&self) -> &Arc<DuplexConnection> {
        &self.connection
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn send(
        &self,
        envelopes: Vec<EnvelopeOut>,
    ) -> BusResult<()> {
        self.connection
            .send_routed(envelopes, &self.route, &self.method)
            .await
    }

    async fn close(&self) -> BusResult<()> {
        self.connection.close().await
    }
}
