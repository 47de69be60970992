//! Карта "канал → реестр обработчиков" одного экземпляра адаптера.
//!
//! Первый подписчик канала создаёт [`Topic`] и запускает источник
//! сообщений (цикл чтения брокера, ожидание HTTP-соединений), последующие
//! подключаются к уже существующему. Создание и удаление записей
//! сериализованы write-блокировкой; чтение в установившемся режиме идёт
//! параллельно под read-блокировкой.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use crate::{
    fanout::{Callback, FanOut},
    transport::Subscriber,
    BusError, BusResult, Cancel, EnvelopeIn,
};

/// Подписки одного канала.
#[derive(Debug)]
pub struct Topic {
    channel: String,
    fanout: Arc<FanOut<EnvelopeIn>>,
    shutdown: Cancel,
    failure: OnceLock<String>,
    subscribers: AtomicUsize,
}

/// Карта подписок экземпляра адаптера.
#[derive(Debug, Default)]
pub struct SubscriberHub {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    /// Срабатывает при появлении нового канала.
    changed: Notify,
    closed: Cancel,
}

/// Подписчик, зарегистрированный в [`SubscriberHub`].
#[derive(Debug)]
pub struct HubSubscriber {
    hub: Arc<SubscriberHub>,
    topic: Arc<Topic>,
    closed: Cancel,
    detached: AtomicBool,
}

////////////////////////////////////////////////////////////////////////////////
// Topic
////////////////////////////////////////////////////////////////////////////////

impl Topic {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            fanout: Arc::new(FanOut::new()),
            shutdown: Cancel::new(),
            failure: OnceLock::new(),
            subscribers: AtomicUsize::new(0),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn fanout(&self) -> &Arc<FanOut<EnvelopeIn>> {
        &self.fanout
    }

    /// Сигнал остановки источника сообщений канала.
    pub fn shutdown(&self) -> &Cancel {
        &self.shutdown
    }

    /// Останавливает канал из-за фатальной ошибки источника. Все
    /// заблокированные `receive` получат эту ошибку.
    pub fn stop_with(
        &self,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        let _ = self.failure.set(reason.clone());
        self.shutdown.cancel_with(reason);
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Ошибка, с которой завершаются `receive` остановленного канала.
    fn stop_error(&self) -> BusError {
        match self.failure.get() {
            Some(reason) => BusError::connection(&self.channel, reason),
            None => BusError::closed(format!("channel {}", self.channel)),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// SubscriberHub
////////////////////////////////////////////////////////////////////////////////

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Подключает подписчика к каналу.
    ///
    /// Для первого подписчика создаётся [`Topic`] и вызывается `start`;
    /// ошибка `start` возвращается вызывающему, а канал не создаётся.
    pub async fn attach<F, Fut>(
        self: &Arc<Self>,
        channel: &str,
        start: F,
    ) -> BusResult<HubSubscriber>
    where
        F: FnOnce(Arc<Topic>) -> Fut,
        Fut: Future<Output = BusResult<()>>,
    {
        if self.closed.is_cancelled() {
            return Err(BusError::closed("consumer"));
        }

        let mut topics = self.topics.write().await;
        // `close` мог опустошить карту, пока мы ждали блокировку.
        if self.closed.is_cancelled() {
            return Err(BusError::closed("consumer"));
        }
        let topic = match topics.get(channel) {
            Some(topic) if !topic.is_stopped() => Arc::clone(topic),
            _ => {
                let topic = Arc::new(Topic::new(channel));
                start(Arc::clone(&topic)).await?;
                topics.insert(channel.to_string(), Arc::clone(&topic));
                info!(channel, "channel subscription started");
                topic
            }
        };
        topic.subscribers.fetch_add(1, Ordering::AcqRel);
        drop(topics);
        self.changed.notify_waiters();

        Ok(HubSubscriber {
            hub: Arc::clone(self),
            topic,
            closed: Cancel::new(),
            detached: AtomicBool::new(false),
        })
    }

    /// Отключает подписчика; последний подписчик останавливает канал.
    ///
    /// Остановленный канал мог быть уже заменён новым с тем же именем,
    /// поэтому из карты удаляется только сама запись `topic`.
    pub async fn detach(
        &self,
        topic: &Arc<Topic>,
    ) {
        let mut topics = self.topics.write().await;
        if topic.subscribers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if topics
            .get(&topic.channel)
            .is_some_and(|current| Arc::ptr_eq(current, topic))
        {
            topics.remove(&topic.channel);
        }
        topic.shutdown.cancel();
        info!(channel = %topic.channel, "last subscriber left, channel stopped");
    }

    pub async fn get(
        &self,
        channel: &str,
    ) -> Option<Arc<Topic>> {
        self.topics.read().await.get(channel).cloned()
    }

    pub async fn channels(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    /// Ждёт, пока у канала появится хотя бы один активный обработчик.
    pub async fn claim(
        &self,
        channel: &str,
    ) -> Arc<Topic> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get(channel).await {
                Some(topic) if !topic.is_stopped() => {
                    tokio::select! {
                        _ = topic.fanout.wait_nonempty() => return topic,
                        _ = topic.shutdown.cancelled() => {}
                    }
                }
                _ => notified.await,
            }
        }
    }

    /// Останавливает все каналы. Последующие `attach` завершаются ошибкой.
    pub async fn close(&self) {
        self.closed.cancel();
        let drained: Vec<_> = self.topics.write().await.drain().collect();
        for (channel, topic) in drained {
            debug!(%channel, "stopping channel on close");
            topic.shutdown.cancel();
        }
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

////////////////////////////////////////////////////////////////////////////////
// HubSubscriber
////////////////////////////////////////////////////////////////////////////////

impl HubSubscriber {
    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }
}

#[async_trait]
impl Subscriber for HubSubscriber {
    async fn receive(
        &self,
        callback: Callback<EnvelopeIn>,
        cancel: &Cancel,
    ) -> BusResult<()> {
        if self.closed.is_cancelled() {
            return Err(BusError::closed(format!("subscriber on {}", self.topic.channel)));
        }
        if self.topic.is_stopped() {
            return Err(self.topic.stop_error());
        }

        let _registration = self.topic.fanout.register(callback);
        debug!(channel = %self.topic.channel, "receive started");

        tokio::select! {
            _ = cancel.cancelled() => Err(cancel.error()),
            _ = self.closed.cancelled() => {
                Err(BusError::closed(format!("subscriber on {}", self.topic.channel)))
            }
            _ = self.topic.shutdown.cancelled() => Err(self.topic.stop_error()),
        }
    }

    async fn close(&self) -> BusResult<()> {
        self.closed.cancel();
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.hub.detach(&self.topic).await;
        }
        Ok(())
    }
}

impl Drop for HubSubscriber {
    fn drop(&mut self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let hub = Arc::clone(&self.hub);
            let topic = Arc::clone(&self.topic);
            runtime.spawn(async move { hub.detach(&topic).await });
        }
    }
}
