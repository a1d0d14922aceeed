//! Execution contexts for dispatch work.
//!
//! The dispatcher runs accept loops on an acceptor context and connection
//! drivers on a worker context; the timed reconnect strategy uses one as its
//! timer service. Anything that can spawn a `Send` future qualifies.

use std::future::Future;
use tokio::task::JoinHandle;

/// Spawns futures onto some runtime.
///
/// # Example
///
/// ```rust,no_run
/// use protocol_dispatch_core::Executor;
/// use tokio::runtime::Handle;
///
/// fn spawn_on<E: Executor>(executor: &E) {
///     executor.spawn(async { /* ... */ });
/// }
///
/// spawn_on(&Handle::current());
/// ```
pub trait Executor: Clone + Send + Sync + 'static {
    /// Spawns `future` and returns a handle to its output.
    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;
}

impl Executor for tokio::runtime::Handle {
    fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::runtime::Handle::spawn(self, future)
    }
}
