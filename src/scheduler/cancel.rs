//! Cooperative cancellation of a story run.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelMode {
    None,
    /// Finish the current phase, start no new one.
    Graceful,
    /// Abandon the in-flight agent call.
    Hard,
}

/// Cloneable handle shared between the scheduler and whoever stops it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<CancelMode>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CancelMode::None);
        Self { tx: Arc::new(tx) }
    }

    pub fn mode(&self) -> CancelMode {
        *self.tx.borrow()
    }

    pub fn cancel_graceful(&self) {
        self.raise(CancelMode::Graceful);
    }

    pub fn cancel_hard(&self) {
        self.raise(CancelMode::Hard);
    }

    /// First call cancels gracefully, any later call cancels hard.
    pub fn escalate(&self) -> CancelMode {
        let next = match self.mode() {
            CancelMode::None => CancelMode::Graceful,
            _ => CancelMode::Hard,
        };
        self.raise(next);
        next
    }

    pub fn reset(&self) {
        self.tx.send_replace(CancelMode::None);
    }

    // Modes only ever escalate until reset.
    fn raise(&self, mode: CancelMode) {
        self.tx.send_if_modified(|current| {
            if mode > *current {
                *current = mode;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once a hard cancel has been requested.
    pub async fn hard_cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() == CancelMode::Hard {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_escalation() {
        let cancel = CancelHandle::new();
        assert_eq!(cancel.mode(), CancelMode::None);
        assert_eq!(cancel.escalate(), CancelMode::Graceful);
        assert_eq!(cancel.escalate(), CancelMode::Hard);
        cancel.cancel_graceful();
        assert_eq!(cancel.mode(), CancelMode::Hard);
        cancel.reset();
        assert_eq!(cancel.mode(), CancelMode::None);
    }

    #[tokio::test]
    async fn test_hard_cancelled_wakes() {
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        let waiter = tokio::spawn(async move { cancel.hard_cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel_graceful();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        trigger.cancel_hard();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
