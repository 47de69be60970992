//! Лог-брокер в памяти процесса.
//!
//! Топики с партициями, смещения групп потребителей и длинный опрос.
//! Топик создаётся автоматически при первой записи с одной партицией.

use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    fmt,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::client::{KafkaClient, KafkaConnector, KafkaRecord, ProduceRecord};
use crate::{
    binding::{TopicConfiguration, TopicSpec},
    BusError, BusResult,
};

/// Лог в памяти. Клоны разделяют состояние.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

#[derive(Default)]
struct LogInner {
    state: Mutex<LogState>,
    appended: Notify,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, TopicLog>,
    fail_next_fetch: Option<String>,
    fail_next_connect: Option<String>,
    open_clients: usize,
}

struct TopicLog {
    spec: TopicSpec,
    partitions: Vec<Vec<KafkaRecord>>,
    /// (группа, партиция) → следующее смещение.
    offsets: HashMap<(String, i32), i64>,
    next_partition: usize,
}

/// Клиент лога в памяти.
#[derive(Debug)]
pub struct MemoryLogClient {
    log: MemoryLog,
    closed: AtomicBool,
}

////////////////////////////////////////////////////////////////////////////////
// MemoryLog
////////////////////////////////////////////////////////////////////////////////

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_topic(
        &self,
        name: &str,
    ) -> bool {
        self.inner.state.lock().topics.contains_key(name)
    }

    pub fn topic_spec(
        &self,
        name: &str,
    ) -> Option<TopicSpec> {
        self.inner
            .state
            .lock()
            .topics
            .get(name)
            .map(|t| t.spec.clone())
    }

    /// Все записи топика по партициям.
    pub fn records(
        &self,
        topic: &str,
    ) -> Vec<KafkaRecord> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .map(|t| t.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Зафиксированное смещение группы в партиции.
    pub fn committed(
        &self,
        topic: &str,
        group: &str,
        partition: i32,
    ) -> Option<i64> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.offsets.get(&(group.to_string(), partition)).copied())
    }

    pub fn open_clients(&self) -> usize {
        self.inner.state.lock().open_clients
    }

    /// Следующий `fetch` любого клиента завершится ошибкой.
    pub fn fail_next_fetch(
        &self,
        reason: impl Into<String>,
    ) {
        self.inner.state.lock().fail_next_fetch = Some(reason.into());
        self.inner.appended.notify_waiters();
    }

    pub fn fail_next_connect(
        &self,
        reason: impl Into<String>,
    ) {
        self.inner.state.lock().fail_next_connect = Some(reason.into());
    }
}

impl fmt::Debug for MemoryLog {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryLog")
            .field("topics", &state.topics.len())
            .field("open_clients", &state.open_clients)
            .finish()
    }
}

#[async_trait]
impl KafkaConnector for MemoryLog {
    async fn connect(&self) -> BusResult<Arc<dyn KafkaClient>> {
        let mut state = self.inner.state.lock();
        if let Some(reason) = state.fail_next_connect.take() {
            return Err(BusError::connection("memory log", reason));
        }
        state.open_clients += 1;
        Ok(Arc::new(MemoryLogClient {
            log: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

impl TopicLog {
    fn new(spec: TopicSpec) -> Self {
        let partitions = (0..spec.partitions.max(1)).map(|_| Vec::new()).collect();
        Self {
            spec,
            partitions,
            offsets: HashMap::new(),
            next_partition: 0,
        }
    }

    fn pick_partition(
        &mut self,
        record: &ProduceRecord,
    ) -> BusResult<usize> {
        let count = self.partitions.len();
        match (record.partition, &record.key) {
            (Some(p), _) if p >= 0 && (p as usize) < count => Ok(p as usize),
            (Some(p), _) => Err(BusError::delivery(format!(
                "UNKNOWN_TOPIC_OR_PARTITION - partition {p} of '{}'",
                record.topic
            ))),
            (None, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                Ok((hasher.finish() % count as u64) as usize)
            }
            (None, None) => {
                let p = self.next_partition % count;
                self.next_partition = self.next_partition.wrapping_add(1);
                Ok(p)
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// MemoryLogClient
////////////////////////////////////////////////////////////////////////////////

impl MemoryLogClient {
    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::closed("kafka client"));
        }
        Ok(())
    }

    /// Забирает доступные записи группы, сдвигая её смещения.
    fn take_ready(
        &self,
        topic: &str,
        group: &str,
        max_records: usize,
    ) -> BusResult<Vec<KafkaRecord>> {
        let mut state = self.log.inner.state.lock();
        if let Some(reason) = state.fail_next_fetch.take() {
            return Err(BusError::connection(format!("topic {topic}"), reason));
        }
        let Some(log) = state.topics.get_mut(topic) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for (index, partition) in log.partitions.iter().enumerate() {
            let key = (group.to_string(), index as i32);
            let offset = log.offsets.get(&key).copied().unwrap_or(0);
            let available = partition.iter().skip(offset as usize);
            let taken: Vec<KafkaRecord> = available
                .take(max_records.saturating_sub(batch.len()))
                .cloned()
                .collect();
            if !taken.is_empty() {
                log.offsets.insert(key, offset + taken.len() as i64);
                batch.extend(taken);
            }
            if batch.len() >= max_records {
                break;
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl KafkaClient for MemoryLogClient {
    async fn create_topic(
        &self,
        spec: &TopicSpec,
    ) -> BusResult<()> {
        self.ensure_open()?;
        let mut state = self.log.inner.state.lock();
        match state.topics.get(&spec.name) {
            Some(existing) if existing.spec.partitions != spec.partitions => {
                Err(BusError::declare(
                    format!("topic '{}'", spec.name),
                    format!(
                        "TOPIC_ALREADY_EXISTS - with {} partitions",
                        existing.spec.partitions
                    ),
                ))
            }
            Some(_) => Ok(()),
            None => {
                debug!(topic = %spec.name, partitions = spec.partitions, "memory log topic created");
                state
                    .topics
                    .insert(spec.name.clone(), TopicLog::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn produce(
        &self,
        record: ProduceRecord,
    ) -> BusResult<()> {
        self.ensure_open()?;
        {
            let mut state = self.log.inner.state.lock();
            let log = state.topics.entry(record.topic.clone()).or_insert_with(|| {
                TopicLog::new(TopicSpec {
                    name: record.topic.clone(),
                    partitions: 1,
                    replicas: 1,
                    configuration: TopicConfiguration::default(),
                })
            });
            let partition = log.pick_partition(&record)?;
            let records = &mut log.partitions[partition];
            records.push(KafkaRecord {
                topic: record.topic,
                partition: partition as i32,
                offset: records.len() as i64,
                key: record.key,
                value: record.value,
                headers: record.headers,
            });
        }
        self.log.inner.appended.notify_waiters();
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        max_records: usize,
        max_wait: Duration,
    ) -> BusResult<Vec<KafkaRecord>> {
        self.ensure_open()?;
        let appended = self.log.inner.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        let batch = self.take_ready(topic, group, max_records.max(1))?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        if tokio::time::timeout(max_wait, appended).await.is_err() {
            return Ok(Vec::new());
        }
        self.take_ready(topic, group, max_records.max(1))
    }

    async fn close(&self) -> BusResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.log.inner.state.lock().open_clients -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn record(
        topic: &str,
        value: &'static str,
    ) -> ProduceRecord {
        ProduceRecord {
            topic: topic.to_string(),
            value: Bytes::from_static(value.as_bytes()),
            ..Default::default()
        }
    }

    /// Тест проверяет автосоздание топика и независимые смещения групп.
    #[tokio::test]
    async fn test_groups_have_independent_offsets() {
        let log = MemoryLog::new();
        let client = log.connect().await.unwrap();
        client.produce(record("orders", "a")).await.unwrap();
        client.produce(record("orders", "b")).await.unwrap();

        let wait = Duration::from_millis(10);
        let first = client.fetch("orders", "g1", 1, wait).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].value, Bytes::from_static(b"a"));
        let rest = client.fetch("orders", "g1", 10, wait).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(client.fetch("orders", "g1", 10, wait).await.unwrap().is_empty());

        assert_eq!(client.fetch("orders", "g2", 10, wait).await.unwrap().len(), 2);
        assert_eq!(log.committed("orders", "g1", 0), Some(2));
    }

    /// Тест проверяет, что длинный опрос просыпается при записи.
    #[tokio::test]
    async fn test_fetch_wakes_on_produce() {
        let log = MemoryLog::new();
        let reader = log.connect().await.unwrap();
        let writer = log.connect().await.unwrap();

        let fetch = tokio::spawn(async move {
            reader
                .fetch("t", "g", 10, Duration::from_secs(5))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.produce(record("t", "x")).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), fetch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_partition_selection() {
        let log = MemoryLog::new();
        let client = log.connect().await.unwrap();
        let spec = TopicSpec {
            name: "p".into(),
            partitions: 3,
            replicas: 1,
            configuration: TopicConfiguration::default(),
        };
        client.create_topic(&spec).await.unwrap();
        client.create_topic(&spec).await.unwrap();
        let conflicting = TopicSpec {
            partitions: 5,
            ..spec.clone()
        };
        assert!(client.create_topic(&conflicting).await.is_err());

        let mut keyed = record("p", "k");
        keyed.key = Some(Bytes::from_static(b"user-1"));
        client.produce(keyed.clone()).await.unwrap();
        client.produce(keyed).await.unwrap();
        let records = log.records("p");
        assert_eq!(records[0].partition, records[1].partition);

        let mut explicit = record("p", "e");
        explicit.partition = Some(7);
        assert!(client.produce(explicit).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_fetch_failure_and_close() {
        let log = MemoryLog::new();
        let client = log.connect().await.unwrap();
        log.fail_next_fetch("broker down");
        let err = client
            .fetch("t", "g", 1, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Connection { .. }));

        assert_eq!(log.open_clients(), 1);
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(log.open_clients(), 0);
        assert!(client.produce(record("t", "x")).await.unwrap_err().is_closed());
    }
}
