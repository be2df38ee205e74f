//! Bounded topology gate
//!
//! Caps the number of operations touching database instances at the same
//! time. Callers fanning out over many instances spawn one task per instance
//! and route the instance-touching part through [`TopologyGate::execute`].

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

/// Default number of concurrent topology operations
pub const DEFAULT_TOPOLOGY_CONCURRENCY: usize = 128;

/// Admission-control gate over a fixed pool of concurrency tokens.
///
/// Admission is FIFO. A token is returned when the enclosed future completes
/// or panics; a panic is reported as [`Error::Panicked`].
#[derive(Debug, Clone)]
pub struct TopologyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TopologyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens not currently held
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `f` once a token is available
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Internal("topology gate closed".into()))?;

        match AssertUnwindSafe(f).catch_unwind().await {
            Ok(value) => Ok(value),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::error!("Topology operation panicked: {}", reason);
                Err(Error::Panicked(reason))
            }
        }
    }
}

impl Default for TopologyGate {
    fn default() -> Self {
        Self::new(DEFAULT_TOPOLOGY_CONCURRENCY)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
