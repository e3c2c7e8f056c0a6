//! Stop signalling for execution loops.
//!
//! A stop can come from inside the process (Ctrl-C, [`WorkerPool::shutdown`])
//! or from another process running `queuectl worker stop`, which only writes
//! the persisted control flag. Loops consult both at iteration boundaries.
//!
//! [`WorkerPool::shutdown`]: super::worker_pool::WorkerPool::shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::storage::{Store, StoreError};

/// Shared stop flag: an in-process watch channel backed by the store.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    store: Store,
}

impl StopSignal {
    pub fn new(store: Store) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            store,
        }
    }

    /// Requests a stop for this process and every other process sharing the store.
    pub async fn request_stop(&self) -> Result<(), StoreError> {
        self.tx.send_replace(true);
        self.store.write_control_signal(true).await
    }

    /// Requests a stop for this process only.
    pub fn request_local_stop(&self) {
        self.tx.send_replace(true);
    }

    /// Clears both the local and the persisted flag.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.tx.send_replace(false);
        self.store.write_control_signal(false).await
    }

    /// Returns whether a stop was requested locally, without a store round trip.
    pub fn is_local_stop(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns whether a stop was requested locally or through the store.
    pub async fn is_stop_requested(&self) -> Result<bool, StoreError> {
        if self.is_local_stop() {
            return Ok(true);
        }

        let persisted = self.store.read_control_signal().await?;
        if persisted {
            // Wake loops idling in this process.
            self.tx.send_replace(true);
        }
        Ok(persisted)
    }

    /// Sleeps for `duration`, returning early if a local stop is requested.
    pub async fn idle(&self, duration: Duration) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = rx.changed() => {}
        }
    }
}
