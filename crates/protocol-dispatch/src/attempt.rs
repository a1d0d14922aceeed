//! The connect-and-retry loop of one client connection.
//!
//! A [`ConnectionAttempt`] owns at most one in-flight operation at a time:
//! an outbound connect, a retry wait handed out by the reconnect strategy,
//! or the negotiation on a connected channel. The loop runs as a task on the
//! dispatcher's worker context; every transition happens under the
//! attempt's mutex after checking for cancellation, so a cancel request has
//! exactly one target.

use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::BoxFuture;
use protocol_dispatch_core::{DispatchError, Promise};
use protocol_dispatch_reconnect::ReconnectStrategy;

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::channel::{Channel, ChannelInitializer};
use crate::dispatcher::DispatcherInner;
use crate::events::ConnectionEvent;
use crate::transport::Address;

/// What a connection attempt is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// Created, the loop has not started yet.
    Idle,
    /// An outbound connect (including address resolution) is in flight.
    Connecting,
    /// Waiting for the reconnect strategy to allow the next connect.
    RetryWaiting,
    /// Connected; the channel initializer is negotiating the session.
    Negotiating,
    /// The attempt reached a terminal state.
    Finished,
}

enum Pending {
    Idle,
    Connecting,
    Retry(Promise<()>),
    Negotiating(Channel),
    Finished,
}

impl Pending {
    fn phase(&self) -> AttemptPhase {
        match self {
            Pending::Idle => AttemptPhase::Idle,
            Pending::Connecting => AttemptPhase::Connecting,
            Pending::Retry(_) => AttemptPhase::RetryWaiting,
            Pending::Negotiating(_) => AttemptPhase::Negotiating,
            Pending::Finished => AttemptPhase::Finished,
        }
    }
}

struct AttemptState {
    pending: Pending,
    connects: u64,
}

struct AttemptShared {
    address: Address,
    state: Mutex<AttemptState>,
}

impl AttemptShared {
    fn lock(&self) -> MutexGuard<'_, AttemptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Aborts whatever the attempt is waiting on: a retry wait is
    /// cancelled, a negotiating channel is closed. An in-flight connect is
    /// dropped by the driver itself.
    fn cancel_pending(&self) {
        let (retry, channel) = match &self.lock().pending {
            Pending::Retry(retry) => (Some(retry.clone()), None),
            Pending::Negotiating(channel) => (None, Some(channel.clone())),
            _ => (None, None),
        };
        if let Some(retry) = retry {
            retry.cancel();
        }
        if let Some(channel) = channel {
            channel.close();
        }
    }

    fn finish(&self) {
        let previous = std::mem::replace(&mut self.lock().pending, Pending::Finished);
        if let Pending::Retry(retry) = previous {
            retry.cancel();
        }
    }
}

/// A client connection being established.
///
/// Resolves with the negotiated session, fails when the reconnect strategy
/// gives up or negotiation fails, and can be cancelled at any point before
/// that. A connect that completes after cancellation has its connection
/// closed immediately.
pub struct ConnectionAttempt<S> {
    promise: Promise<S>,
    shared: Arc<AttemptShared>,
}

impl<S> Clone for ConnectionAttempt<S> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> ConnectionAttempt<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub(crate) fn start<R, I>(
        dispatcher: Arc<DispatcherInner>,
        address: Address,
        strategy: R,
        initializer: Arc<I>,
    ) -> Self
    where
        R: ReconnectStrategy,
        I: ChannelInitializer<S>,
    {
        let promise = Promise::new();
        let shared = Arc::new(AttemptShared {
            address,
            state: Mutex::new(AttemptState {
                pending: Pending::Idle,
                connects: 0,
            }),
        });

        if dispatcher.is_shutdown() {
            shared.finish();
            promise.try_failure(DispatchError::Shutdown);
            return Self { promise, shared };
        }

        let on_cancel = Arc::clone(&shared);
        promise.add_listener(move |p| {
            if p.is_cancelled() {
                on_cancel.cancel_pending();
            }
        });

        let driver = AttemptDriver {
            dispatcher: Arc::clone(&dispatcher),
            shared: Arc::clone(&shared),
            promise: promise.clone(),
            strategy,
            initializer,
        };
        dispatcher.worker.spawn(driver.run());

        Self { promise, shared }
    }
}

impl<S> ConnectionAttempt<S> {
    /// The completion handle of the whole attempt.
    pub fn promise(&self) -> &Promise<S> {
        &self.promise
    }

    /// The target address.
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    /// What the attempt is currently waiting on.
    pub fn phase(&self) -> AttemptPhase {
        self.shared.lock().pending.phase()
    }

    /// Number of connects issued so far.
    pub fn connects(&self) -> u64 {
        self.shared.lock().connects
    }

    /// Cancels the attempt.
    ///
    /// Idempotent. Returns `false` if the attempt already succeeded or
    /// failed; an established session is not affected.
    pub fn cancel(&self) -> bool {
        self.promise.cancel()
    }

    /// Returns `true` once the attempt reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.promise.is_done()
    }
}

impl<S: Clone> ConnectionAttempt<S> {
    /// Waits for the negotiated session.
    pub async fn wait(&self) -> Result<S, DispatchError> {
        self.promise.wait().await
    }
}

impl<S> IntoFuture for ConnectionAttempt<S>
where
    S: Clone + Send + 'static,
{
    type Output = Result<S, DispatchError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.promise.into_future()
    }
}

impl<S> fmt::Debug for ConnectionAttempt<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAttempt")
            .field("address", &self.shared.address)
            .field("phase", &self.phase())
            .field("promise", &self.promise)
            .finish()
    }
}

enum Step {
    Connected(u64),
    Failed(DispatchError),
    Stop,
}

struct AttemptDriver<S, R, I> {
    dispatcher: Arc<DispatcherInner>,
    shared: Arc<AttemptShared>,
    promise: Promise<S>,
    strategy: R,
    initializer: Arc<I>,
}

impl<S, R, I> AttemptDriver<S, R, I>
where
    S: Clone + Send + Sync + 'static,
    R: ReconnectStrategy,
    I: ChannelInitializer<S>,
{
    async fn run(self) {
        tokio::select! {
            _ = self.connect_loop() => {}
            _ = self.dispatcher.shutdown.cancelled() => {
                self.promise.try_failure(DispatchError::Shutdown);
            }
        }
        self.shared.finish();

        if self.promise.is_cancelled() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                name = %self.dispatcher.name,
                address = %self.shared.address,
                "connection attempt cancelled"
            );

            self.dispatcher.emit(ConnectionEvent::Cancelled {
                pattern_name: self.dispatcher.name.clone(),
                timestamp: Instant::now(),
                address: self.shared.address.to_string(),
            });
        }
    }

    async fn connect_loop(&self) {
        loop {
            let cause = match self.connect().await {
                Step::Connected(channel_id) => {
                    self.await_negotiation(channel_id).await;
                    return;
                }
                Step::Failed(cause) => cause,
                Step::Stop => return,
            };

            if self.promise.is_done() {
                return;
            }
            // Unlocked: strategy listeners may call back into the attempt.
            let retry = self.strategy.schedule_reconnect(&cause);
            let cancelled = {
                let mut state = self.shared.lock();
                state.pending = Pending::Retry(retry.clone());
                self.promise.is_done()
            };
            if cancelled {
                retry.cancel();
                return;
            }

            if !retry.is_done() {
                self.dispatcher.emit(ConnectionEvent::RetryScheduled {
                    pattern_name: self.dispatcher.name.clone(),
                    timestamp: Instant::now(),
                    address: self.shared.address.to_string(),
                });
            }

            match retry.wait().await {
                Ok(()) => {
                    if self.promise.is_done() {
                        return;
                    }
                }
                Err(e) => {
                    if !self.promise.is_cancelled() {
                        self.give_up(e);
                    }
                    return;
                }
            }
        }
    }

    /// Issues one connect and installs the channel on success.
    async fn connect(&self) -> Step {
        let timeout = match self.strategy.connect_timeout() {
            Ok(timeout) => timeout,
            Err(e) => {
                self.give_up(e);
                return Step::Stop;
            }
        };

        let attempt = {
            let mut state = self.shared.lock();
            if self.promise.is_done() {
                return Step::Stop;
            }
            state.pending = Pending::Connecting;
            state.connects += 1;
            state.connects
        };

        let address = &self.shared.address;

        #[cfg(feature = "metrics")]
        counter!("dispatch_connect_attempts_total", "name" => self.dispatcher.name.clone())
            .increment(1);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            name = %self.dispatcher.name,
            %address,
            attempt,
            timeout_ms = timeout.as_millis() as u64,
            "connecting"
        );

        self.dispatcher.emit(ConnectionEvent::ConnectStarted {
            pattern_name: self.dispatcher.name.clone(),
            timestamp: Instant::now(),
            address: address.to_string(),
            attempt,
        });

        // Resolution counts against the connect timeout.
        let connect = async {
            let addr = address.resolve().await?;
            let io = self
                .dispatcher
                .connector
                .connect(addr)
                .await
                .map_err(|e| DispatchError::connect(address.to_string(), e))?;
            Ok((addr, io))
        };
        let connect = async {
            tokio::time::timeout(timeout, connect)
                .await
                .unwrap_or_else(|_| {
                    Err(DispatchError::ConnectTimeout {
                        address: address.to_string(),
                        timeout,
                    })
                })
        };

        let result = tokio::select! {
            result = connect => result,
            _ = self.promise.cancelled() => return Step::Stop,
        };

        let (addr, io) = match result {
            Ok(connected) => connected,
            Err(cause) => {
                #[cfg(feature = "metrics")]
                counter!("dispatch_connect_failures_total", "name" => self.dispatcher.name.clone())
                    .increment(1);

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    name = %self.dispatcher.name,
                    %address,
                    attempt,
                    error = %cause,
                    "connect failed"
                );

                self.dispatcher.emit(ConnectionEvent::ConnectFailed {
                    pattern_name: self.dispatcher.name.clone(),
                    timestamp: Instant::now(),
                    address: address.to_string(),
                    error: cause.to_string(),
                });
                return Step::Failed(cause);
            }
        };

        let channel = {
            let mut state = self.shared.lock();
            if self.promise.is_done() {
                drop(state);
                drop(io);
                self.orphan_closed();
                return Step::Stop;
            }
            let channel = self.dispatcher.new_channel(addr, None);
            state.pending = Pending::Negotiating(channel.clone());
            channel
        };

        self.dispatcher.emit(ConnectionEvent::Connected {
            pattern_name: self.dispatcher.name.clone(),
            timestamp: Instant::now(),
            address: address.to_string(),
            channel_id: channel.id(),
        });

        let channel_id = channel.id();
        let driver = self
            .initializer
            .init_channel(channel.clone(), io, self.promise.clone());
        self.dispatcher
            .spawn_channel(channel, driver, self.promise.clone());
        Step::Connected(channel_id)
    }

    async fn await_negotiation(&self, channel_id: u64) {
        self.promise.done().await;
        let address = self.shared.address.to_string();

        if self.promise.is_success() {
            self.strategy.reconnect_successful();

            #[cfg(feature = "metrics")]
            counter!("dispatch_sessions_established_total", "name" => self.dispatcher.name.clone())
                .increment(1);

            #[cfg(feature = "tracing")]
            tracing::info!(name = %self.dispatcher.name, %address, "session established");

            self.dispatcher.emit(ConnectionEvent::SessionEstablished {
                pattern_name: self.dispatcher.name.clone(),
                timestamp: Instant::now(),
                address,
                channel_id,
            });
        } else if let Some(cause) = self.promise.cause() {
            #[cfg(feature = "metrics")]
            counter!("dispatch_negotiation_failures_total", "name" => self.dispatcher.name.clone())
                .increment(1);

            #[cfg(feature = "tracing")]
            tracing::info!(
                name = %self.dispatcher.name,
                %address,
                error = %cause,
                "negotiation failed"
            );

            self.dispatcher.emit(ConnectionEvent::NegotiationFailed {
                pattern_name: self.dispatcher.name.clone(),
                timestamp: Instant::now(),
                address,
                channel_id,
                error: cause.to_string(),
            });
        }
    }

    fn orphan_closed(&self) {
        #[cfg(feature = "metrics")]
        counter!("dispatch_orphans_closed_total", "name" => self.dispatcher.name.clone())
            .increment(1);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            name = %self.dispatcher.name,
            address = %self.shared.address,
            "connect completed after cancellation, closing connection"
        );

        self.dispatcher.emit(ConnectionEvent::OrphanClosed {
            pattern_name: self.dispatcher.name.clone(),
            timestamp: Instant::now(),
            address: self.shared.address.to_string(),
        });
    }

    fn give_up(&self, cause: DispatchError) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            name = %self.dispatcher.name,
            address = %self.shared.address,
            error = %cause,
            "giving up connecting"
        );

        self.dispatcher.emit(ConnectionEvent::GaveUp {
            pattern_name: self.dispatcher.name.clone(),
            timestamp: Instant::now(),
            address: self.shared.address.to_string(),
            error: cause.to_string(),
        });
        self.promise.try_failure(cause);
    }
}
