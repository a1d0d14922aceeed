//! Reconnection after an established session drops.
//!
//! A [`ReconnectSupervisor`] runs a sequence of [`ConnectionAttempt`]s
//! ("incarnations") against one address. Failed connects are retried inside
//! each attempt by its own strategy; the supervisor only steps in once a
//! fully negotiated session has closed, and then starts a brand-new attempt
//! with a brand-new strategy from its factory.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use protocol_dispatch_core::{DispatchError, Promise};
use protocol_dispatch_reconnect::ReconnectStrategyFactory;

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::attempt::ConnectionAttempt;
use crate::channel::{Channel, ChannelInitializer, ClosedObserver};
use crate::dispatcher::Dispatcher;
use crate::events::ConnectionEvent;
use crate::transport::Address;

struct SupervisorInner<S> {
    dispatcher: Dispatcher,
    address: Address,
    factory: Arc<dyn ReconnectStrategyFactory>,
    initializer: Arc<dyn ChannelInitializer<S>>,
    promise: Promise<()>,
    pending: Mutex<Option<ConnectionAttempt<S>>>,
    incarnation: AtomicU64,
}

impl<S> SupervisorInner<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Option<ConnectionAttempt<S>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<ConnectionAttempt<S>> {
        self.lock().clone()
    }

    fn initial_connect_finished(&self) -> bool {
        self.current()
            .is_some_and(|attempt| attempt.promise().is_success())
    }

    /// Starts a new incarnation.
    fn connect(self: &Arc<Self>) {
        let strategy = self.factory.create_reconnect_strategy();
        // Held by the channel until it closes, so an established session
        // keeps its supervisor alive.
        let supervisor = Arc::clone(self);
        let initializer = ClosedObserver::new(Arc::clone(&self.initializer), move |channel| {
            supervisor.channel_closed(channel);
        });

        let attempt = self
            .dispatcher
            .create_client(self.address.clone(), strategy, initializer);
        self.incarnation.fetch_add(1, Ordering::SeqCst);
        *self.lock() = Some(attempt.clone());

        let supervisor = self.promise.clone();
        attempt.promise().add_listener(move |p| {
            if let Some(cause) = p.cause() {
                supervisor.try_failure(cause);
            }
        });

        // A cancel that raced the store above found no attempt to cancel.
        if self.promise.is_cancelled() {
            attempt.cancel();
        }
    }

    fn channel_closed(self: &Arc<Self>, _channel: &Channel) {
        if self.promise.is_done() {
            return;
        }

        let name = self.dispatcher.name().to_string();
        if !self.initial_connect_finished() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                name = %name,
                address = %self.address,
                channel = _channel.id(),
                "connection dropped before the session was established, not reconnecting"
            );
            return;
        }

        let incarnation = self.incarnation.load(Ordering::SeqCst) + 1;

        #[cfg(feature = "metrics")]
        counter!("dispatch_reconnections_total", "name" => name.clone()).increment(1);

        #[cfg(feature = "tracing")]
        tracing::info!(
            name = %name,
            address = %self.address,
            incarnation,
            "session dropped, reconnecting"
        );

        self.dispatcher.inner().emit(ConnectionEvent::Reincarnation {
            pattern_name: name,
            timestamp: Instant::now(),
            address: self.address.to_string(),
            incarnation,
        });

        self.connect();
    }

    fn cancelled(&self) {
        if let Some(attempt) = self.current() {
            attempt.cancel();
        }

        self.dispatcher.inner().emit(ConnectionEvent::Cancelled {
            pattern_name: self.dispatcher.name().to_string(),
            timestamp: Instant::now(),
            address: self.address.to_string(),
        });
    }
}

/// A client that reconnects whenever its established session drops.
///
/// Completes only when cancelled or when an incarnation fails for good (its
/// strategy gave up, or negotiation failed). Cancelling aborts in-flight
/// connects, retry waits and negotiations but leaves an established session
/// alone.
pub struct ReconnectSupervisor<S> {
    inner: Arc<SupervisorInner<S>>,
}

impl<S> Clone for ReconnectSupervisor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> ReconnectSupervisor<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub(crate) fn start(
        dispatcher: Dispatcher,
        address: Address,
        factory: Arc<dyn ReconnectStrategyFactory>,
        initializer: Arc<dyn ChannelInitializer<S>>,
    ) -> Self {
        let inner = Arc::new(SupervisorInner {
            dispatcher,
            address,
            factory,
            initializer,
            promise: Promise::new(),
            pending: Mutex::new(None),
            incarnation: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        inner.promise.add_listener(move |p| {
            if p.is_cancelled() {
                if let Some(inner) = weak.upgrade() {
                    inner.cancelled();
                }
            }
        });

        inner.connect();
        Self { inner }
    }

    /// The supervisor's own completion handle.
    pub fn promise(&self) -> &Promise<()> {
        &self.inner.promise
    }

    /// The attempt of the current incarnation.
    pub fn current(&self) -> Option<ConnectionAttempt<S>> {
        self.inner.current()
    }

    /// Number of incarnations started so far, the first one included.
    pub fn incarnation(&self) -> u64 {
        self.inner.incarnation.load(Ordering::SeqCst)
    }

    /// Returns `true` once the current incarnation negotiated its session.
    pub fn is_initial_connect_finished(&self) -> bool {
        self.inner.initial_connect_finished()
    }

    /// The target address.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Waits for the session of the current incarnation.
    ///
    /// Fails with the supervisor's failure, or with
    /// [`DispatchError::Cancelled`] once it is cancelled.
    pub async fn session(&self) -> Result<S, DispatchError> {
        if let Some(cause) = self.inner.promise.cause() {
            return Err(cause);
        }
        if self.inner.promise.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        match self.current() {
            Some(attempt) => attempt.wait().await,
            None => Err(DispatchError::Cancelled),
        }
    }

    /// Stops reconnecting.
    ///
    /// Idempotent; returns `false` if the supervisor already failed.
    pub fn cancel(&self) -> bool {
        self.inner.promise.cancel()
    }

    /// Waits until the supervisor completes.
    pub async fn wait(&self) -> Result<(), DispatchError> {
        self.inner.promise.wait().await
    }
}

impl<S> fmt::Debug for ReconnectSupervisor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("address", &self.inner.address)
            .field("incarnation", &self.inner.incarnation.load(Ordering::SeqCst))
            .field("promise", &self.inner.promise)
            .finish()
    }
}
