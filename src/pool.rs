use std::future::Future;

use tokio::task::{JoinError, JoinSet};
use tracing::debug;

use crate::{BusError, BusResult, Cancel};

/// Группа конкурентных задач, собирающая все их ошибки.
///
/// В отличие от "первая ошибка побеждает", [`ErrorPool::wait`] дожидается
/// каждой задачи и возвращает объединение всех ошибок. Группа, которую
/// уничтожили без ожидания, отпускает задачи работать дальше.
#[must_use = "dropping the pool detaches its tasks and discards their errors"]
#[derive(Debug, Default)]
pub struct ErrorPool {
    tasks: JoinSet<BusResult<()>>,
}

impl ErrorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Запускает задачу в группе.
    pub fn go<F>(
        &mut self,
        task: F,
    ) where
        F: Future<Output = BusResult<()>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Дожидается всех задач.
    ///
    /// Возвращает `Ok(())`, если ни одна задача не вернула ошибку, иначе
    /// объединённую ошибку. Паника задачи превращается в
    /// [`BusError::TaskPanicked`].
    pub async fn wait(mut self) -> BusResult<()> {
        let mut errors = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            collect(joined, &mut errors);
        }
        into_result(errors)
    }

    /// Как [`ErrorPool::wait`], но прекращает ожидание при отмене.
    ///
    /// Оставшиеся задачи продолжают работать в фоне; к уже собранным
    /// ошибкам добавляется ошибка отмены.
    pub async fn wait_cancellable(
        mut self,
        cancel: &Cancel,
    ) -> BusResult<()> {
        let mut errors = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(pending = self.tasks.len(), "pool wait cancelled, detaching tasks");
                    errors.push(cancel.error());
                    break;
                }
                next = self.tasks.join_next() => match next {
                    Some(joined) => collect(joined, &mut errors),
                    None => break,
                },
            }
        }
        into_result(errors)
    }
}

impl Drop for ErrorPool {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            debug!(pending = self.tasks.len(), "pool dropped, detaching tasks");
            self.tasks.detach_all();
        }
    }
}

fn collect(
    joined: Result<BusResult<()>, JoinError>,
    errors: &mut Vec<BusError>,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => errors.push(err),
        Err(err) => errors.push(BusError::TaskPanicked {
            reason: err.to_string(),
        }),
    }
}

fn into_result(errors: Vec<BusError>) -> BusResult<()> {
    match BusError::join(errors) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}
