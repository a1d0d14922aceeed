//! The reconnect strategy contract and its stateless variants.

use std::sync::Arc;
use std::time::Duration;

use protocol_dispatch_core::{DispatchError, Promise};

/// Decides whether and when a failed connect is retried.
///
/// A strategy instance belongs to one reconnection sequence. The connection
/// attempt driving that sequence calls [`schedule_reconnect`] after every
/// failed connect and waits for the returned handle: success means "connect
/// again now", failure means "give up with this cause".
///
/// [`schedule_reconnect`]: ReconnectStrategy::schedule_reconnect
pub trait ReconnectStrategy: Send + Sync + 'static {
    /// Timeout for the next connect attempt.
    ///
    /// Fails when no time is left for another attempt.
    fn connect_timeout(&self) -> Result<Duration, DispatchError>;

    /// Schedules the next connect attempt after a failure with `cause`.
    ///
    /// Must not be called again before the previously returned handle has
    /// completed.
    fn schedule_reconnect(&self, cause: &DispatchError) -> Promise<()>;

    /// Reports that a connection was established and negotiated.
    fn reconnect_successful(&self);
}

impl<S: ReconnectStrategy + ?Sized> ReconnectStrategy for Box<S> {
    fn connect_timeout(&self) -> Result<Duration, DispatchError> {
        (**self).connect_timeout()
    }

    fn schedule_reconnect(&self, cause: &DispatchError) -> Promise<()> {
        (**self).schedule_reconnect(cause)
    }

    fn reconnect_successful(&self) {
        (**self).reconnect_successful()
    }
}

impl<S: ReconnectStrategy + ?Sized> ReconnectStrategy for Arc<S> {
    fn connect_timeout(&self) -> Result<Duration, DispatchError> {
        (**self).connect_timeout()
    }

    fn schedule_reconnect(&self, cause: &DispatchError) -> Promise<()> {
        (**self).schedule_reconnect(cause)
    }

    fn reconnect_successful(&self) {
        (**self).reconnect_successful()
    }
}

/// Never retries: every failure is final.
///
/// ```
/// use protocol_dispatch_core::DispatchError;
/// use protocol_dispatch_reconnect::{NeverReconnectStrategy, ReconnectStrategy};
/// use std::time::Duration;
///
/// let strategy = NeverReconnectStrategy::new(Duration::from_secs(1));
/// let retry = strategy.schedule_reconnect(&DispatchError::ChannelClosed);
///
/// assert!(retry.is_done());
/// assert!(retry.cause().unwrap().is_reconnect_refused());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeverReconnectStrategy {
    connect_timeout: Duration,
}

impl NeverReconnectStrategy {
    /// Creates a strategy handing out `connect_timeout` for the only attempt.
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ReconnectStrategy for NeverReconnectStrategy {
    fn connect_timeout(&self) -> Result<Duration, DispatchError> {
        Ok(self.connect_timeout)
    }

    fn schedule_reconnect(&self, cause: &DispatchError) -> Promise<()> {
        #[cfg(feature = "tracing")]
        tracing::debug!(cause = %cause, "reconnect refused by strategy");

        Promise::failed(DispatchError::ReconnectRefused {
            cause: Box::new(cause.clone()),
        })
    }

    fn reconnect_successful(&self) {}
}

/// Retries right away, forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectImmediatelyStrategy {
    connect_timeout: Duration,
}

impl ReconnectImmediatelyStrategy {
    /// Creates a strategy handing out `connect_timeout` for every attempt.
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ReconnectStrategy for ReconnectImmediatelyStrategy {
    fn connect_timeout(&self) -> Result<Duration, DispatchError> {
        Ok(self.connect_timeout)
    }

    fn schedule_reconnect(&self, _cause: &DispatchError) -> Promise<()> {
        #[cfg(feature = "tracing")]
        tracing::debug!(cause = %_cause, "reconnecting immediately");

        Promise::succeeded(())
    }

    fn reconnect_successful(&self) {}
}
