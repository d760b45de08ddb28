//! Task spawning and the dedicated device I/O runtime.
//!
//! [`TaskSpawner`] lets core services spawn background work without knowing
//! which runtime they run on. [`IoRuntime`] is the multi-threaded runtime the
//! [`DeviceHub`](crate::hub::DeviceHub) owns so that no device I/O ever runs on
//! the thread that drives the presentation layer.

use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::{CoreError, CoreResult};

/// Abstraction for spawning background tasks.
///
/// Implementations should ensure tasks can complete even if the spawner is
/// dropped.
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future as a background task.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner bound to a runtime handle.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a spawner for the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}

/// Dedicated multi-threaded runtime for adapter, probe and lane tasks.
///
/// Dropping it shuts the runtime down in the background, so it may be
/// dropped from inside another runtime's async context.
pub struct IoRuntime {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl IoRuntime {
    /// Starts a runtime with `worker_threads` threads named `homectl-io`.
    pub fn start(worker_threads: usize) -> CoreResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("homectl-io")
            .enable_all()
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to start I/O runtime: {e}")))?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn spawner(&self) -> TokioSpawner {
        TokioSpawner::new(self.handle())
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
