use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::BusError;

/// Сигнал отмены с необязательной причиной.
///
/// Клоны разделяют один сигнал. Дочерний сигнал срабатывает вместе с
/// родительским и наследует его причину, но его собственная отмена не
/// затрагивает родителя.
#[derive(Debug, Clone)]
pub struct Cancel {
    token: CancellationToken,
    /// Собственная причина, затем причины предков.
    causes: Vec<Arc<OnceLock<String>>>,
}

impl Cancel {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            causes: vec![Arc::new(OnceLock::new())],
        }
    }

    /// Отменяет без указания причины.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Отменяет с причиной. Если сигнал уже сработал, причина не меняется.
    pub fn cancel_with(
        &self,
        reason: impl Into<String>,
    ) {
        if !self.token.is_cancelled() {
            let _ = self.causes[0].set(reason.into());
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Причина отмены: своя или ближайшего отменённого предка.
    pub fn cause(&self) -> Option<String> {
        if !self.is_cancelled() {
            return None;
        }
        self.causes.iter().find_map(|c| c.get().cloned())
    }

    /// Завершается, когда сигнал сработает.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn child(&self) -> Cancel {
        let mut causes = Vec::with_capacity(self.causes.len() + 1);
        causes.push(Arc::new(OnceLock::new()));
        causes.extend(self.causes.iter().cloned());
        Cancel {
            token: self.token.child_token(),
            causes,
        }
    }

    /// Ошибка отмены с текущей причиной.
    pub fn error(&self) -> BusError {
        BusError::cancelled(self.cause())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}
