use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{close_on_error, AmqpChannel, AmqpConnector, AmqpDelivery, ConsumeOptions};
use crate::{
    binding::{AmqpChannelBindings, MessageBindings, DEFAULT_EXCHANGE},
    hub::{HubSubscriber, SubscriberHub, Topic},
    transport::{Consumer, Subscriber},
    Acknowledger, BusResult, EnvelopeIn, ErrorPool,
};

/// Фабрика подписчиков брокера очередей.
///
/// Все подписчики одного канала разделяют одно потребление очереди;
/// каждая доставка рассылается всем их обработчикам.
#[derive(Debug)]
pub struct AmqpConsumer {
    connector: Arc<dyn AmqpConnector>,
    hub: Arc<SubscriberHub>,
}

impl AmqpConsumer {
    pub fn new(connector: Arc<dyn AmqpConnector>) -> Self {
        Self {
            connector,
            hub: Arc::new(SubscriberHub::new()),
        }
    }

    /// Открывает подписчика с конкретным типом.
    ///
    /// Привязки учитываются только первым подписчиком канала: он объявляет
    /// ресурсы и запускает потребление.
    pub async fn open(
        &self,
        channel: &str,
        bindings: Option<AmqpChannelBindings>,
    ) -> BusResult<HubSubscriber> {
        let connector = Arc::clone(&self.connector);
        let bindings = bindings.unwrap_or_default();
        self.hub
            .attach(channel, move |topic| start_feed(connector, bindings, topic))
            .await
    }
}

#[async_trait]
impl Consumer for AmqpConsumer {
    type Bindings = AmqpChannelBindings;

    async fn subscriber(
        &self,
        channel: &str,
        bindings: Option<AmqpChannelBindings>,
    ) -> BusResult<Box<dyn Subscriber>> {
        Ok(Box::new(self.open(channel, bindings).await?))
    }

    async fn close(&self) -> BusResult<()> {
        self.hub.close().await;
        Ok(())
    }
}

async fn start_feed(
    connector: Arc<dyn AmqpConnector>,
    bindings: AmqpChannelBindings,
    topic: Arc<Topic>,
) -> BusResult<()> {
    let conn = connector.dial(bindings.vhost()).await?;
    match declare_and_consume(conn.as_ref(), &bindings, topic.channel()).await {
        Ok(deliveries) => {
            tokio::spawn(feed(conn, deliveries, topic, bindings.ack_required()));
            Ok(())
        }
        Err(err) => Err(close_on_error(conn, err).await),
    }
}

async fn declare_and_consume(
    conn: &dyn AmqpChannel,
    bindings: &AmqpChannelBindings,
    channel: &str,
) -> BusResult<mpsc::UnboundedReceiver<AmqpDelivery>> {
    let queue = bindings.resolve_queue(channel);
    let queue_options = bindings
        .queue
        .as_ref()
        .map(|q| q.declare_options())
        .unwrap_or_default();
    if queue.declare {
        debug!(queue = %queue.address, "declaring queue");
        conn.queue_declare(&queue.address, queue_options).await?;
    }

    let exchange = bindings.resolve_exchange(channel);
    if exchange.address != DEFAULT_EXCHANGE {
        if exchange.declare {
            let options = bindings
                .exchange
                .as_ref()
                .map(|e| e.declare_options())
                .unwrap_or_default();
            debug!(exchange = %exchange.address, "declaring exchange");
            conn.exchange_declare(&exchange.address, bindings.exchange_kind(), options)
                .await?;
        }
        conn.queue_bind(&queue.address, &exchange.address, &bindings.routing_key(channel))
            .await?;
    }

    let tag = format!("busline-{}", Uuid::new_v4());
    let options = ConsumeOptions {
        auto_ack: !bindings.ack_required(),
        exclusive: queue_options.exclusive,
    };
    info!(channel, queue = %queue.address, consumer_tag = %tag, "amqp consume started");
    conn.consume(&queue.address, &tag, options).await
}

/// Раздаёт доставки очереди обработчикам канала до остановки канала.
///
/// При обязательном подтверждении успешная рассылка подтверждается,
/// неудачная отклоняется без возврата в очередь. Доставка, которую некому
/// отдать, возвращается в очередь.
async fn feed(
    conn: Arc<dyn AmqpChannel>,
    mut deliveries: mpsc::UnboundedReceiver<AmqpDelivery>,
    topic: Arc<Topic>,
    ack_required: bool,
) {
    let channel = topic.channel().to_string();
    debug!(%channel, "amqp feed loop started");

    loop {
        let delivery = tokio::select! {
            _ = topic.shutdown().cancelled() => break,
            next = deliveries.recv() => match next {
                Some(delivery) => delivery,
                None => {
                    warn!(%channel, "amqp delivery stream closed");
                    topic.stop_with("amqp delivery stream closed");
                    break;
                }
            },
        };

        let acker = delivery.acker.clone();
        let envelope = envelope_from(delivery);

        tokio::select! {
            _ = topic.shutdown().cancelled() => {
                requeue(&channel, acker.as_deref()).await;
                break;
            }
            _ = topic.fanout().wait_nonempty() => {}
        }

        let pool = topic.fanout().put(envelope);
        if pool.is_empty() {
            requeue(&channel, acker.as_deref()).await;
            continue;
        }
        // Доставка подтверждается в своей задаче, чтобы зависший обработчик
        // не задерживал следующие доставки остальным обработчикам.
        tokio::spawn(settle(channel.clone(), pool, acker, ack_required));
    }

    if let Err(err) = conn.close().await {
        warn!(%channel, error = %err, "failed to close amqp channel");
    }
    debug!(%channel, "amqp feed loop stopped");
}

/// Дожидается рассылки одной доставки и подтверждает её брокеру.
async fn settle(
    channel: String,
    pool: ErrorPool,
    acker: Option<Arc<dyn Acknowledger>>,
    ack_required: bool,
) {
    let delivered = pool.wait().await;
    let outcome = match (ack_required, acker) {
        (true, Some(acker)) => {
            let settled = match &delivered {
                Ok(()) => acker.ack().await,
                Err(_) => acker.nack(false).await,
            };
            match (delivered, settled) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
                (Err(err), Err(ack_err)) => Err(err.and(ack_err)),
            }
        }
        _ => delivered,
    };
    if let Err(err) = outcome {
        warn!(%channel, error = %err, "amqp delivery failed");
    }
}

async fn requeue(
    channel: &str,
    acker: Option<&dyn Acknowledger>,
) {
    if let Some(acker) = acker {
        if let Err(err) = acker.nack(true).await {
            warn!(channel, error = %err, "failed to requeue undelivered message");
        }
    }
}

fn envelope_from(delivery: AmqpDelivery) -> EnvelopeIn {
    let message = delivery.message;
    let envelope = EnvelopeIn::new(delivery.routing_key, message.payload)
        .with_headers(message.headers)
        .with_content_type(message.content_type)
        .with_bindings(MessageBindings::Amqp(message.properties));
    match delivery.acker {
        Some(acker) => envelope.with_acknowledger(acker),
        None => envelope,
    }
}
