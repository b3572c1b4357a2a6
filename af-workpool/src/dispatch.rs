//! Bounded execution of long backend operations.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs operations on the tokio runtime with at most `limit` in flight at once.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Dispatcher {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Sized from the host: one slot per CPU, between 2 and 8.
    pub fn optimal() -> Self {
        Self::new(num_cpus::get().clamp(2, 8))
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Operations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    pub fn spawn<F>(&self, operation: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // The semaphore is never closed, so this only waits.
            let _permit = permits.acquire_owned().await.ok();
            debug!("Dispatching backend operation");
            operation.await
        })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::optimal()
    }
}
