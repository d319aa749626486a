// src/bot/scheduler.rs - Cancellable delayed side effects (e.g. the delayed kick)

use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Runs actions after a delay; `cancel_all` drops every action still waiting.
///
/// Actions that already started are allowed to finish.
pub struct DelayedTasks {
    cancel_tx: watch::Sender<bool>,
    pending: Arc<AtomicUsize>,
}

impl Default for DelayedTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayedTasks {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            cancel_tx,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Schedule `action` to run after `delay`.
    ///
    /// Returns `false` if the scheduler was already cancelled.
    pub fn schedule<F>(&self, delay: Duration, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut cancel = self.cancel_tx.subscribe();
        if *cancel.borrow() {
            return false;
        }

        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let fire = tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = cancel.changed() => false,
            };
            pending.fetch_sub(1, Ordering::SeqCst);

            if fire {
                action.await;
            } else {
                debug!("Delayed task cancelled before firing");
            }
        });
        true
    }

    /// Number of actions still waiting for their delay to elapse
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Cancel every waiting action and refuse new ones. Idempotent.
    pub fn cancel_all(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

impl Drop for DelayedTasks {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
