use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{close_on_error, KafkaClient, KafkaConnector, ProduceRecord, CONTENT_TYPE_HEADER};
use crate::{
    binding::KafkaChannelBindings,
    transport::{send_batch, Producer, Publisher},
    BusError, BusResult, EnvelopeOut,
};

/// Фабрика публикаторов лог-брокера.
#[derive(Debug)]
pub struct KafkaProducer {
    connector: Arc<dyn KafkaConnector>,
    clients: Mutex<Vec<Arc<dyn KafkaClient>>>,
    closed: AtomicBool,
}

/// Публикатор одного топика.
#[derive(Debug)]
pub struct KafkaPublisher {
    client: Arc<dyn KafkaClient>,
    topic: String,
    closed: AtomicBool,
}

impl KafkaProducer {
    pub fn new(connector: Arc<dyn KafkaConnector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn open(
        &self,
        channel: &str,
        bindings: Option<KafkaChannelBindings>,
    ) -> BusResult<KafkaPublisher> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::closed("kafka producer"));
        }
        let bindings = bindings.unwrap_or_default();
        let client = self.connector.connect().await?;

        let topic = bindings.resolve_topic(channel);
        if topic.declare {
            let spec = bindings.topic_spec(channel);
            debug!(topic = %spec.name, partitions = spec.partitions, "creating topic");
            if let Err(err) = client.create_topic(&spec).await {
                return Err(close_on_error(client, err).await);
            }
        }

        self.clients.lock().push(Arc::clone(&client));
        info!(channel, topic = %topic.address, "kafka publisher opened");
        Ok(KafkaPublisher {
            client,
            topic: topic.address,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    type Bindings = KafkaChannelBindings;

    async fn publisher(
        &self,
        channel: &str,
        bindings: Option<KafkaChannelBindings>,
    ) -> BusResult<Box<dyn Publisher>> {
        Ok(Box::new(self.open(channel, bindings).await?))
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let clients: Vec<_> = self.clients.lock().drain(..).collect();
        let mut errors = Vec::new();
        for client in clients {
            if let Err(err) = client.close().await {
                errors.push(err);
            }
        }
        match BusError::join(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl KafkaPublisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Превращает исходящее сообщение в запись лога.
fn to_record(
    envelope: EnvelopeOut,
    default_topic: &str,
) -> ProduceRecord {
    let parts = envelope.into_parts();
    let kafka = parts.bindings.as_kafka().cloned().unwrap_or_default();
    let mut headers = parts.headers.to_byte_pairs();
    if let Some(content_type) = parts.content_type {
        headers.push((CONTENT_TYPE_HEADER.to_string(), Bytes::from(content_type)));
    }
    ProduceRecord {
        topic: parts.address.unwrap_or_else(|| default_topic.to_string()),
        partition: kafka.partition,
        key: kafka.key,
        value: parts.payload,
        headers,
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn send(
        &self,
        envelopes: Vec<EnvelopeOut>,
    ) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::closed("kafka publisher"));
        }
        send_batch(envelopes, |envelope| {
            let client = Arc::clone(&self.client);
            let record = to_record(envelope, &self.topic);
            async move { client.produce(record).await }
        })
        .await
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Headers;

    #[test]
    fn test_to_record_carries_metadata() {
        let mut envelope = EnvelopeOut::new();
        envelope.write(b"{}");
        envelope.set_content_type("application/json");
        envelope.set_headers(Headers::from_iter([("trace", "abc")]));
        envelope.set_key(Bytes::from_static(b"k1"));

        let record = to_record(envelope, "orders");
        assert_eq!(record.topic, "orders");
        assert_eq!(record.key, Some(Bytes::from_static(b"k1")));
        assert_eq!(record.value, Bytes::from_static(b"{}"));
        assert!(record
            .headers
            .contains(&("content-type".to_string(), Bytes::from_static(b"application/json"))));
        assert!(record
            .headers
            .contains(&("trace".to_string(), Bytes::from_static(b"abc"))));
    }

    #[test]
    fn test_to_record_topic_override() {
        let mut envelope = EnvelopeOut::new();
        envelope.set_topic("audit");
        assert_eq!(to_record(envelope, "orders").topic, "audit");
    }
}
