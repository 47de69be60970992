use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{close_on_error, AmqpChannel, AmqpConnector, AmqpMessage};
use crate::{
    binding::AmqpChannelBindings,
    transport::{send_batch, Producer, Publisher},
    BusError, BusResult, EnvelopeOut,
};

/// Фабрика публикаторов брокера очередей.
#[derive(Debug)]
pub struct AmqpProducer {
    connector: Arc<dyn AmqpConnector>,
    channels: Mutex<Vec<Arc<dyn AmqpChannel>>>,
    closed: AtomicBool,
}

/// Публикатор одного канала.
#[derive(Debug)]
pub struct AmqpPublisher {
    channel: Arc<dyn AmqpChannel>,
    exchange: String,
    routing_key: String,
    closed: AtomicBool,
}

impl AmqpProducer {
    pub fn new(connector: Arc<dyn AmqpConnector>) -> Self {
        Self {
            connector,
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Открывает публикатор с конкретным типом (без упаковки в `Box`).
    pub async fn open(
        &self,
        channel: &str,
        bindings: Option<AmqpChannelBindings>,
    ) -> BusResult<AmqpPublisher> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::closed("amqp producer"));
        }
        let bindings = bindings.unwrap_or_default();
        let conn = self.connector.dial(bindings.vhost()).await?;

        let exchange = bindings.resolve_exchange(channel);
        if exchange.declare {
            let options = bindings
                .exchange
                .as_ref()
                .map(|e| e.declare_options())
                .unwrap_or_default();
            debug!(exchange = %exchange.address, "declaring exchange");
            if let Err(err) = conn
                .exchange_declare(&exchange.address, bindings.exchange_kind(), options)
                .await
            {
                return Err(close_on_error(conn, err).await);
            }
        }

        self.channels.lock().push(Arc::clone(&conn));
        let routing_key = bindings.routing_key(channel);
        info!(channel, exchange = %exchange.address, %routing_key, "amqp publisher opened");
        Ok(AmqpPublisher {
            channel: conn,
            exchange: exchange.address,
            routing_key,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Producer for AmqpProducer {
    type Bindings = AmqpChannelBindings;

    async fn publisher(
        &self,
        channel: &str,
        bindings: Option<AmqpChannelBindings>,
    ) -> BusResult<Box<dyn Publisher>> {
        Ok(Box::new(self.open(channel, bindings).await?))
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        let mut errors = Vec::new();
        for channel in channels {
            if let Err(err) = channel.close().await {
                errors.push(err);
            }
        }
        match BusError::join(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl AmqpPublisher {
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn send(
        &self,
        envelopes: Vec<EnvelopeOut>,
    ) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::closed("amqp publisher"));
        }
        send_batch(envelopes, |envelope| {
            let channel = Arc::clone(&self.channel);
            let exchange = self.exchange.clone();
            let parts = envelope.into_parts();
            let routing_key = parts.address.unwrap_or_else(|| self.routing_key.clone());
            let message = AmqpMessage {
                payload: parts.payload,
                headers: parts.headers,
                content_type: parts.content_type,
                properties: parts.bindings.as_amqp().cloned().unwrap_or_default(),
            };
            async move { channel.publish(&exchange, &routing_key, message).await }
        })
        .await
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.channel.close().await
    }
}
