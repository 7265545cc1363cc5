//! Run-level cancellation
//!
//! Raising the signal stops further polling and retries. Already-dispatched
//! remote tasks are left running.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Raises cancellation for every linked [`CancelSignal`]
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observes run-level cancellation; cheap to clone
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    /// Create a handle and its first signal
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    /// Raise cancellation
    pub fn cancel(&self) {
        if !*self.tx.borrow() {
            info!("Run cancellation raised");
        }
        let _ = self.tx.send(true);
    }

    /// Another signal linked to this handle
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that is never raised
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether cancellation was raised
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is raised
    ///
    /// Never resolves if the handle was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `delay`, returning `false` if cancelled first
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut signal = self.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = signal.cancelled() => false,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let (handle, signal) = CancelHandle::new();
        assert!(!signal.is_cancelled());

        let sleeper = tokio::spawn({
            let signal = signal.clone();
            async move { signal.sleep(Duration::from_secs(60)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let completed = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
        assert!(signal.is_cancelled());
        assert!(handle.signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_never_signal_sleeps_fully() {
        let signal = CancelSignal::never();
        assert!(signal.sleep(Duration::from_millis(5)).await);
        assert!(!signal.is_cancelled());
    }
}
