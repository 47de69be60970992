//! Реестр обработчиков с рассылкой каждому (broadcast registry).
//!
//! Обработчики хранятся в арене с поколениями: дескриптор удалённого
//! обработчика не может случайно удалить новый, занявший тот же слот.
//! [`FanOut::put`] снимает снимок обработчиков под блокировкой и запускает
//! каждый в отдельной задаче уже без неё, поэтому обработчик может
//! добавлять и удалять обработчики, не вызывая взаимоблокировку.

use std::{fmt, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{BusResult, ErrorPool};

/// Асинхронный обработчик элемента.
pub type Callback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, BusResult<()>> + Send + Sync>;

/// Оборачивает замыкание, возвращающее future, в [`Callback`].
pub fn callback<T, F, Fut>(f: F) -> Callback<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BusResult<()>> + Send + 'static,
{
    Arc::new(move |item| f(item).boxed())
}

/// Дескриптор зарегистрированного обработчика.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    callback: Option<Callback<T>>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Реестр обработчиков, рассылающий каждый элемент всем обработчикам.
pub struct FanOut<T> {
    arena: Mutex<Arena<T>>,
    /// Текущее число живых обработчиков; позволяет ждать первого.
    live: watch::Sender<usize>,
}

/// Регистрация, удаляющая обработчик при уничтожении.
pub struct Registration<T> {
    fanout: Arc<FanOut<T>>,
    handle: SlotHandle,
}

impl<T> FanOut<T> {
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            arena: Mutex::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            live,
        }
    }

    /// Добавляет обработчик и возвращает его дескриптор.
    pub fn add(
        &self,
        callback: Callback<T>,
    ) -> SlotHandle {
        let mut arena = self.arena.lock();
        let handle = match arena.free.pop() {
            Some(index) => {
                let slot = &mut arena.slots[index as usize];
                slot.callback = Some(callback);
                SlotHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = arena.slots.len() as u32;
                arena.slots.push(Slot {
                    generation: 0,
                    callback: Some(callback),
                });
                SlotHandle {
                    index,
                    generation: 0,
                }
            }
        };
        arena.live += 1;
        self.live.send_replace(arena.live);
        handle
    }

    /// Удаляет обработчик. Устаревший или чужой дескриптор ничего не
    /// делает; возвращает `true`, если обработчик был удалён.
    pub fn remove(
        &self,
        handle: SlotHandle,
    ) -> bool {
        let mut arena = self.arena.lock();
        let Some(slot) = arena.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation || slot.callback.is_none() {
            return false;
        }
        slot.callback = None;
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(handle.index);
        arena.live -= 1;
        self.live.send_replace(arena.live);
        true
    }

    /// Снимок текущих обработчиков.
    pub fn snapshot(&self) -> Vec<Callback<T>> {
        self.arena
            .lock()
            .slots
            .iter()
            .filter_map(|slot| slot.callback.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.arena.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Регистрирует обработчик на время жизни возвращённой регистрации.
    pub fn register(
        self: &Arc<Self>,
        callback: Callback<T>,
    ) -> Registration<T> {
        let handle = self.add(callback);
        Registration {
            fanout: Arc::clone(self),
            handle,
        }
    }

    /// Завершается, когда зарегистрирован хотя бы один обработчик.
    pub async fn wait_nonempty(&self) {
        let mut rx = self.live.subscribe();
        // Отправитель живёт в `self`, поэтому ошибка закрытия невозможна.
        let _ = rx.wait_for(|live| *live > 0).await;
    }
}

impl<T> FanOut<T>
where
    T: Clone + Send + 'static,
{
    /// Рассылает элемент всем обработчикам, зарегистрированным на момент
    /// вызова.
    ///
    /// Каждый обработчик получает свою копию и работает в отдельной задаче.
    /// Возвращённая группа позволяет дождаться всех и собрать ошибки;
    /// без обработчиков группа пуста. Если группу не ждать, обработчики
    /// всё равно отработают, но их ошибки потеряются.
    #[must_use = "wait on the pool to observe callback errors"]
    pub fn put(
        &self,
        item: T,
    ) -> ErrorPool {
        let callbacks = self.snapshot();
        let mut pool = ErrorPool::new();
        for callback in callbacks {
            pool.go(callback(item.clone()));
        }
        pool
    }
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FanOut<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("FanOut")
            .field("live", &arena.live)
            .field("slots", &arena.slots.len())
            .finish()
    }
}

impl<T> Registration<T> {
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        self.fanout.remove(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::time::timeout;

    use super::*;
    use crate::BusError;

    fn counting(counter: Arc<AtomicUsize>) -> Callback<u32> {
        callback(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_put_without_callbacks() {
        let fanout = FanOut::<u32>::new();
        let pool = fanout.put(1);
        assert!(pool.is_empty());
        assert!(pool.wait().await.is_ok());
    }

    /// Тест проверяет, что удаление по устаревшему дескриптору не трогает
    /// новый обработчик в том же слоте.
    #[tokio::test]
    async fn test_stale_handle_does_not_remove_reused_slot() {
        let fanout = FanOut::<u32>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = fanout.add(counting(counter.clone()));
        assert!(fanout.remove(first));
        assert!(!fanout.remove(first));

        let second = fanout.add(counting(counter.clone()));
        assert_ne!(first, second);
        assert!(!fanout.remove(first));
        assert_eq!(fanout.len(), 1);

        fanout.put(7).wait().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_from_callbacks_are_joined() {
        let fanout = FanOut::<u32>::new();
        fanout.add(callback(|n| async move { Err(BusError::delivery(n)) }));
        fanout.add(callback(|_| async { Ok(()) }));
        fanout.add(callback(|n| async move { Err(BusError::delivery(n + 1)) }));

        let err = fanout.put(1).wait().await.unwrap_err();
        assert_eq!(err.errors().len(), 2);
    }

    /// Тест проверяет RAII-регистрацию и ожидание первого обработчика.
    #[tokio::test]
    async fn test_registration_and_wait_nonempty() {
        let fanout = Arc::new(FanOut::<u32>::new());
        let waiter = {
            let fanout = fanout.clone();
            tokio::spawn(async move { fanout.wait_nonempty().await })
        };

        let registration = fanout.register(callback(|_| async { Ok(()) }));
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake on first registration")
            .unwrap();
        assert_eq!(fanout.len(), 1);

        let handle = registration.handle();
        drop(registration);
        assert!(fanout.is_empty());
        assert!(!fanout.remove(handle));
    }

    /// Тест проверяет, что обработчик может удалить себя во время рассылки.
    #[tokio::test]
    async fn test_callback_may_mutate_registry() {
        let fanout = Arc::new(FanOut::<u32>::new());
        let slot: Arc<parking_lot::Mutex<Option<SlotHandle>>> = Default::default();
        let handle = {
            let fanout = fanout.clone();
            let slot = slot.clone();
            fanout.clone().add(callback(move |_| {
                let fanout = fanout.clone();
                let slot = slot.clone();
                async move {
                    if let Some(h) = *slot.lock() {
                        fanout.remove(h);
                    }
                    Ok(())
                }
            }))
        };
        *slot.lock() = Some(handle);

        fanout.put(1).wait().await.unwrap();
        assert!(fanout.is_empty());
    }
}
