//! Брокер очередей в памяти процесса.
//!
//! Реализует [`AmqpConnector`]/[`AmqpChannel`] с маршрутизацией direct,
//! fanout и topic, очередями с round-robin раздачей потребителям и
//! подтверждениями. Годится для тестов и для работы без внешнего брокера.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::client::{AmqpChannel, AmqpConnector, AmqpDelivery, AmqpMessage, ConsumeOptions};
use crate::{
    binding::{DeclareOptions, ExchangeKind, DEFAULT_EXCHANGE},
    Acknowledger, BusError, BusResult,
};

/// Виртуальный хост, если он не указан.
pub const DEFAULT_VHOST: &str = "/";

type PublishFilter = Arc<dyn Fn(&str, &AmqpMessage) -> bool + Send + Sync>;

/// Счётчики очереди.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Сообщения, ожидающие потребителя.
    pub ready: usize,
    pub delivered: usize,
    pub acked: usize,
    pub nacked: usize,
    pub rejected: usize,
    pub requeued: usize,
}

/// Опубликованное сообщение (журнал для проверок).
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: AmqpMessage,
}

/// Брокер в памяти. Клоны разделяют состояние.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    published: Vec<PublishedMessage>,
    unroutable: usize,
    next_tag: u64,
    next_channel: u64,
    open_channels: HashSet<u64>,
    dials: Vec<String>,
    fail_next_dial: Option<String>,
    publish_filter: Option<PublishFilter>,
}

struct ExchangeState {
    kind: ExchangeKind,
    options: DeclareOptions,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct QueueState {
    options: DeclareOptions,
    ready: VecDeque<Pending>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    stats: QueueStats,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<AmqpDelivery>,
}

struct Pending {
    exchange: String,
    routing_key: String,
    message: AmqpMessage,
    redelivered: bool,
}

/// Канал брокера в памяти.
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    closed: AtomicBool,
}

#[derive(Debug)]
struct MemoryAcker {
    broker: Weak<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
    pending: Mutex<Option<Pending>>,
}

////////////////////////////////////////////////////////////////////////////////
// MemoryBroker
////////////////////////////////////////////////////////////////////////////////

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Создаёт очередь заранее, как это сделал бы администратор брокера.
    pub fn with_queue(
        self,
        name: &str,
    ) -> Self {
        self.state
            .lock()
            .queues
            .entry(name.to_string())
            .or_default();
        self
    }

    /// Создаёт exchange заранее.
    pub fn with_exchange(
        self,
        name: &str,
        kind: ExchangeKind,
    ) -> Self {
        self.state
            .lock()
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                options: DeclareOptions::default(),
                bindings: Vec::new(),
            });
        self
    }

    pub fn has_queue(
        &self,
        name: &str,
    ) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn has_exchange(
        &self,
        name: &str,
    ) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn stats(
        &self,
        queue: &str,
    ) -> Option<QueueStats> {
        self.state.lock().queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            ..q.stats
        })
    }

    /// Число потребителей очереди.
    pub fn consumer_count(
        &self,
        queue: &str,
    ) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Сообщения, не попавшие ни в одну очередь.
    pub fn unroutable(&self) -> usize {
        self.state.lock().unroutable
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().open_channels.len()
    }

    /// Виртуальные хосты всех подключений по порядку.
    pub fn dials(&self) -> Vec<String> {
        self.state.lock().dials.clone()
    }

    /// Следующее подключение завершится ошибкой.
    pub fn fail_next_dial(
        &self,
        reason: impl Into<String>,
    ) {
        self.state.lock().fail_next_dial = Some(reason.into());
    }

    /// Брокер отклоняет публикации, для которых `reject(routing_key, message)`
    /// возвращает `true`.
    pub fn reject_publishes_where<F>(
        &self,
        reject: F,
    ) where
        F: Fn(&str, &AmqpMessage) -> bool + Send + Sync + 'static,
    {
        self.state.lock().publish_filter = Some(Arc::new(reject));
    }

    /// Обрывает всех потребителей, как при потере соединения.
    pub fn drop_consumers(&self) {
        let mut state = self.state.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("open_channels", &state.open_channels.len())
            .finish()
    }
}

#[async_trait]
impl AmqpConnector for MemoryBroker {
    async fn dial(
        &self,
        vhost: Option<&str>,
    ) -> BusResult<Arc<dyn AmqpChannel>> {
        let vhost = vhost.unwrap_or(DEFAULT_VHOST);
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next_dial.take() {
            return Err(BusError::connection(format!("amqp vhost {vhost}"), reason));
        }
        state.next_channel += 1;
        let id = state.next_channel;
        state.open_channels.insert(id);
        state.dials.push(vhost.to_string());
        debug!(channel = id, vhost, "memory broker channel opened");

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

////////////////////////////////////////////////////////////////////////////////
// MemoryChannel
////////////////////////////////////////////////////////////////////////////////

impl MemoryChannel {
    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::closed(format!("amqp channel {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> BusResult<()> {
        self.ensure_open()?;
        if name == DEFAULT_EXCHANGE {
            return Err(BusError::declare(
                "exchange ''",
                "ACCESS_REFUSED - operation not permitted on the default exchange",
            ));
        }
        let mut state = self.broker.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.options != options => {
                Err(BusError::declare(
                    format!("exchange '{name}'"),
                    "PRECONDITION_FAILED - inequivalent arg",
                ))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        options,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: DeclareOptions,
    ) -> BusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        match state.queues.get(name) {
            Some(existing) if existing.options != options => Err(BusError::declare(
                format!("queue '{name}'"),
                "PRECONDITION_FAILED - inequivalent arg",
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BusResult<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BusError::declare(
                format!("queue '{queue}'"),
                "NOT_FOUND - no queue",
            ));
        }
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(BusError::declare(
                format!("exchange '{exchange}'"),
                "NOT_FOUND - no exchange",
            ));
        };
        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: AmqpMessage,
    ) -> BusResult<()> {
        self.ensure_open()?;
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        if let Some(filter) = &state.publish_filter {
            if filter(routing_key, &message) {
                return Err(BusError::delivery(format!(
                    "publish to '{routing_key}' rejected by broker"
                )));
            }
        }

        let targets = route(state, exchange, routing_key)?;
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });
        if targets.is_empty() {
            state.unroutable += 1;
            trace!(exchange, routing_key, "message is unroutable");
            return Ok(());
        }
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(Pending {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message: message.clone(),
                    redelivered: false,
                });
            }
            dispatch(&self.broker.state, state, &queue);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> BusResult<mpsc::UnboundedReceiver<AmqpDelivery>> {
        self.ensure_open()?;
        let mut guard = self.broker.state.lock();
        let state = &mut *guard;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BusError::connection(
                format!("queue '{queue}'"),
                "NOT_FOUND - no queue",
            ));
        };
        if options.exclusive && !q.consumers.is_empty() {
            return Err(BusError::connection(
                format!("queue '{queue}'"),
                "ACCESS_REFUSED - queue is in use, cannot consume exclusively",
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel: self.id,
            auto_ack: options.auto_ack,
            tx,
        });
        debug!(queue, consumer_tag, "memory broker consumer attached");
        dispatch(&self.broker.state, state, queue);
        Ok(rx)
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.broker.state.lock();
        state.open_channels.remove(&self.id);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != self.id);
        }
        debug!(channel = self.id, "memory broker channel closed");
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Маршрутизация и раздача
////////////////////////////////////////////////////////////////////////////////

fn route(
    state: &BrokerState,
    exchange: &str,
    routing_key: &str,
) -> BusResult<Vec<String>> {
    if exchange == DEFAULT_EXCHANGE {
        return Ok(if state.queues.contains_key(routing_key) {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        });
    }
    let Some(ex) = state.exchanges.get(exchange) else {
        return Err(BusError::delivery(format!(
            "NOT_FOUND - no exchange '{exchange}'"
        )));
    };
    let mut targets: Vec<String> = Vec::new();
    for (queue, key) in &ex.bindings {
        let matched = match ex.kind {
            ExchangeKind::Direct => key == routing_key,
            ExchangeKind::Fanout | ExchangeKind::Headers => true,
            ExchangeKind::Topic => topic_matches(key, routing_key),
        };
        if matched && !targets.contains(queue) {
            targets.push(queue.clone());
        }
    }
    Ok(targets)
}

/// Сопоставление ключа с шаблоном topic-exchange: `*` это ровно одно
/// слово, `#` ноль или больше слов.
fn topic_matches(
    pattern: &str,
    key: &str,
) -> bool {
    fn step(
        p: &[&str],
        k: &[&str],
    ) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => step(&p[1..], k) || (!k.is_empty() && step(p, &k[1..])),
            (Some(&"*"), Some(_)) => step(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => step(&p[1..], &k[1..]),
            _ => false,
        }
    }
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    step(&p, &k)
}

/// Раздаёт готовые сообщения очереди потребителям по кругу.
fn dispatch(
    shared: &Arc<Mutex<BrokerState>>,
    state: &mut BrokerState,
    queue: &str,
) {
    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };
    while !q.consumers.is_empty() {
        let Some(pending) = q.ready.pop_front() else {
            break;
        };
        let index = q.cursor % q.consumers.len();
        q.cursor = q.cursor.wrapping_add(1);
        state.next_tag += 1;
        let tag = state.next_tag;

        let consumer = &q.consumers[index];
        let auto_ack = consumer.auto_ack;
        let (acker, message) = if auto_ack {
            (None, pending.message.clone())
        } else {
            let message = pending.message.clone();
            let acker: Arc<dyn Acknowledger> = Arc::new(MemoryAcker {
                broker: Arc::downgrade(shared),
                queue: queue.to_string(),
                tag,
                pending: Mutex::new(Some(Pending {
                    exchange: pending.exchange.clone(),
                    routing_key: pending.routing_key.clone(),
                    message: pending.message.clone(),
                    redelivered: true,
                })),
            });
            (Some(acker), message)
        };
        let delivery = AmqpDelivery {
            delivery_tag: tag,
            exchange: pending.exchange.clone(),
            routing_key: pending.routing_key.clone(),
            redelivered: pending.redelivered,
            message,
            acker,
        };

        if consumer.tx.send(delivery).is_err() {
            trace!(queue, tag = %consumer.tag, "consumer is gone, removing");
            q.consumers.remove(index);
            q.ready.push_front(pending);
            continue;
        }
        q.stats.delivered += 1;
        if auto_ack {
            q.stats.acked += 1;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Подтверждения
////////////////////////////////////////////////////////////////////////////////

enum Settle {
    Ack,
    Nack,
    Reject,
}

impl MemoryAcker {
    fn settle(
        &self,
        how: Settle,
        requeue: bool,
    ) -> BusResult<()> {
        let Some(pending) = self.pending.lock().take() else {
            return Err(BusError::ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.tag
            )));
        };
        let Some(shared) = self.broker.upgrade() else {
            return Err(BusError::closed("memory broker"));
        };
        let mut guard = shared.lock();
        let state = &mut *guard;
        let Some(q) = state.queues.get_mut(&self.queue) else {
            return Err(BusError::ack(format!("queue '{}' is gone", self.queue)));
        };
        match how {
            Settle::Ack => q.stats.acked += 1,
            Settle::Nack => q.stats.nacked += 1,
            Settle::Reject => q.stats.rejected += 1,
        }
        if requeue && !matches!(how, Settle::Ack) {
            q.stats.requeued += 1;
            q.ready.push_front(pending);
            dispatch(&shared, state, &self.queue);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle(Settle::Ack, false)
    }

    async fn nack(
        &self,
        requeue: bool,
    ) -> BusResult<()> {
        self.settle(Settle::Nack, requeue)
    }

    async fn reject(
        &self,
        requeue: bool,
    ) -> BusResult<()> {
        self.settle(Settle::Reject, requeue)
    }
}

impl fmt::Debug for Pending {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Pending")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
