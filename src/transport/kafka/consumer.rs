use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{close_on_error, KafkaClient, KafkaConnector, KafkaRecord, CONTENT_TYPE_HEADER};
use crate::{
    binding::{KafkaChannelBindings, KafkaMessageBindings, MessageBindings},
    hub::{HubSubscriber, SubscriberHub, Topic},
    transport::{Consumer, Subscriber},
    BusError, BusResult, EnvelopeIn, ErrorPool, HeaderValue, Headers,
};

/// Параметры цикла опроса.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConsumerConfig {
    pub group_id: String,
    /// Максимальный размер пачки одного опроса.
    pub max_batch: usize,
    /// Максимальное ожидание одного опроса.
    pub poll_interval: Duration,
}

impl Default for KafkaConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "busline".to_string(),
            max_batch: 100,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Фабрика подписчиков лог-брокера.
#[derive(Debug)]
pub struct KafkaConsumer {
    connector: Arc<dyn KafkaConnector>,
    config: KafkaConsumerConfig,
    hub: Arc<SubscriberHub>,
}

impl KafkaConsumer {
    pub fn new(
        connector: Arc<dyn KafkaConnector>,
        config: KafkaConsumerConfig,
    ) -> Self {
        Self {
            connector,
            config,
            hub: Arc::new(SubscriberHub::new()),
        }
    }

    pub async fn open(
        &self,
        channel: &str,
        bindings: Option<KafkaChannelBindings>,
    ) -> BusResult<HubSubscriber> {
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let bindings = bindings.unwrap_or_default();
        self.hub
            .attach(channel, move |topic| {
                start_poll(connector, config, bindings, topic)
            })
            .await
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    type Bindings = KafkaChannelBindings;

    async fn subscriber(
        &self,
        channel: &str,
        bindings: Option<KafkaChannelBindings>,
    ) -> BusResult<Box<dyn Subscriber>> {
        Ok(Box::new(self.open(channel, bindings).await?))
    }

    async fn close(&self) -> BusResult<()> {
        self.hub.close().await;
        Ok(())
    }
}

async fn start_poll(
    connector: Arc<dyn KafkaConnector>,
    config: KafkaConsumerConfig,
    bindings: KafkaChannelBindings,
    topic: Arc<Topic>,
) -> BusResult<()> {
    let client = connector.connect().await?;
    let resolved = bindings.resolve_topic(topic.channel());
    if resolved.declare {
        let spec = bindings.topic_spec(topic.channel());
        if let Err(err) = client.create_topic(&spec).await {
            return Err(close_on_error(client, err).await);
        }
    }
    info!(
        channel = topic.channel(),
        topic = %resolved.address,
        group = %config.group_id,
        "kafka poll loop starting"
    );
    tokio::spawn(poll(client, config, resolved.address, topic));
    Ok(())
}

/// Цикл опроса. Ошибка опроса останавливает канал, и все `receive`
/// получают её.
async fn poll(
    client: Arc<dyn KafkaClient>,
    config: KafkaConsumerConfig,
    log_topic: String,
    topic: Arc<Topic>,
) {
    loop {
        tokio::select! {
            _ = topic.shutdown().cancelled() => break,
            _ = topic.fanout().wait_nonempty() => {}
        }

        let fetched = tokio::select! {
            _ = topic.shutdown().cancelled() => break,
            fetched = client.fetch(
                &log_topic,
                &config.group_id,
                config.max_batch,
                config.poll_interval,
            ) => fetched,
        };

        let records = match fetched {
            Ok(records) => records,
            Err(err) => {
                warn!(topic = %log_topic, error = %err, "kafka fetch failed, stopping");
                topic.stop_with(err.to_string());
                break;
            }
        };
        if records.is_empty() {
            continue;
        }

        debug!(topic = %log_topic, records = records.len(), "kafka batch fetched");
        // Рассылка всей пачки запускается сразу, а итог собирается в
        // отдельной задаче: медленный обработчик не задерживает опрос.
        let pools: Vec<ErrorPool> = records
            .into_iter()
            .map(|record| topic.fanout().put(envelope_from(record)))
            .collect();
        tokio::spawn(settle_batch(log_topic.clone(), pools));
    }

    if let Err(err) = client.close().await {
        warn!(topic = %log_topic, error = %err, "failed to close kafka client");
    }
    debug!(topic = %log_topic, "kafka poll loop stopped");
}

/// Дожидается рассылки пачки и сообщает об ошибках одной записью.
async fn settle_batch(
    log_topic: String,
    pools: Vec<ErrorPool>,
) {
    let mut errors = Vec::new();
    for pool in pools {
        if let Err(err) = pool.wait().await {
            errors.push(err);
        }
    }
    if let Some(err) = BusError::join(errors) {
        warn!(topic = %log_topic, error = %err, "kafka batch delivery failed");
    }
}

fn envelope_from(record: KafkaRecord) -> EnvelopeIn {
    let mut headers = Headers::from_byte_pairs(record.headers);
    let content_type = match headers.remove(CONTENT_TYPE_HEADER) {
        Some(HeaderValue::Str(value)) => Some(value),
        Some(other) => {
            headers.insert(CONTENT_TYPE_HEADER, other);
            None
        }
        None => None,
    };
    EnvelopeIn::new(record.topic, record.value)
        .with_headers(headers)
        .with_content_type(content_type)
        .with_bindings(MessageBindings::Kafka(KafkaMessageBindings {
            key: record.key,
            partition: Some(record.partition),
            offset: Some(record.offset),
        }))
}
