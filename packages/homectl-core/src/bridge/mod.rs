//! Concurrency bridge between callers and device I/O.
//!
//! Callers never wait on the network: `invoke` hands back a
//! [`CommandTicket`] and the work runs on the I/O runtime. Every outbound
//! device operation, from any lane or probe, goes through one
//! [`CommandBridge`], which caps concurrency with a semaphore and bounds each
//! operation with the configured timeout.

mod ticket;

pub use ticket::{CommandOutcome, CommandTicket};
pub(crate) use ticket::TicketSender;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{DeviceError, DeviceResult};

/// Bounded worker pool for device operations.
#[derive(Clone)]
pub struct CommandBridge {
    permits: Arc<Semaphore>,
    pool_size: usize,
    timeout: Duration,
}

impl CommandBridge {
    pub fn new(pool_size: usize, timeout: Duration) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Operations currently holding a worker slot.
    pub fn in_use(&self) -> usize {
        self.pool_size - self.permits.available_permits()
    }

    /// Runs `operation` once a worker slot is free.
    ///
    /// The timeout starts when the slot is acquired, so time spent queued for
    /// the pool does not count against the device. Expiry drops the operation
    /// (closing its sockets) and reports `DeviceUnreachable`.
    pub async fn run<T, F>(&self, label: &str, operation: F) -> DeviceResult<T>
    where
        F: Future<Output = DeviceResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DeviceError::DeviceUnreachable("worker pool closed".into()))?;

        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("[Bridge] {} timed out after {:?}", label, self.timeout);
                Err(DeviceError::DeviceUnreachable(format!(
                    "{label} timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}
