use std::{sync::Arc, time::Duration};

use shared::domain::UserId;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use crate::MessageStore;

/// Bursts of recount triggers inside this window collapse into a single
/// recomputation.
pub const UNREAD_DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Debounced per-user unread total. Triggers arrive from local actions and
/// from the change feed; the worker recomputes once per burst and publishes
/// through a watch channel. A recount failure reports zero, never a stale
/// nonzero value.
pub struct UnreadAggregator {
    trigger_tx: mpsc::UnboundedSender<()>,
    count_rx: watch::Receiver<u64>,
    worker: Mutex<Option<WorkerParts>>,
}

struct WorkerParts {
    trigger_rx: mpsc::UnboundedReceiver<()>,
    count_tx: watch::Sender<u64>,
}

impl UnreadAggregator {
    pub fn new() -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (count_tx, count_rx) = watch::channel(0);
        Self {
            trigger_tx,
            count_rx,
            worker: Mutex::new(Some(WorkerParts {
                trigger_rx,
                count_tx,
            })),
        }
    }

    /// Start the recount worker. Triggers sent before this are queued and
    /// drain with the first recomputation. Returns `None` when the worker is
    /// already running.
    pub async fn spawn_worker(
        &self,
        store: Arc<dyn MessageStore>,
        user_id: UserId,
    ) -> Option<JoinHandle<()>> {
        let parts = self.worker.lock().await.take()?;
        Some(tokio::spawn(run_worker(store, user_id, parts)))
    }

    /// Request a recount; cheap enough to call from every feed event.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }

    pub fn current(&self) -> u64 {
        *self.count_rx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.count_rx.clone()
    }
}

impl Default for UnreadAggregator {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(store: Arc<dyn MessageStore>, user_id: UserId, mut parts: WorkerParts) {
    while parts.trigger_rx.recv().await.is_some() {
        tokio::time::sleep(UNREAD_DEBOUNCE_WINDOW).await;
        while parts.trigger_rx.try_recv().is_ok() {}

        let count = match store.unread_count(user_id).await {
            Ok(count) => count,
            Err(err) => {
                warn!(user_id = user_id.0, %err, "unread recount failed; reporting zero");
                0
            }
        };
        parts.count_tx.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
