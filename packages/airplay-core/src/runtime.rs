//! Background task plumbing.
//!
//! Session supervisors, the state poller, discovery intake and the stderr
//! drains of protocol processes all run detached. They are launched through
//! [`TaskSpawner`] so each one gets a `tracing` span carrying its role, which
//! is what makes interleaved per-speaker logs readable.

use std::future::Future;

use tracing::Instrument;

/// Launches detached engine tasks.
///
/// Stopping a task is not the spawner's concern: every long-lived engine
/// task owns a `CancellationToken` and exits when it fires.
pub trait TaskSpawner: Send + Sync {
    /// Runs `future` in the background under a span tagged with `task`.
    fn spawn<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// [`TaskSpawner`] backed by a tokio runtime handle.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Captures the handle of the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, task: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::info_span!("task", name = task);
        self.handle.spawn(future.instrument(span));
    }
}
