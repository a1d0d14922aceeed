//! The dispatcher facade.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use protocol_dispatch_core::events::EventListeners;
use protocol_dispatch_core::{DispatchError, Promise};
use protocol_dispatch_reconnect::{ReconnectStrategy, ReconnectStrategyFactory};
use tokio::net::TcpListener;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::attempt::ConnectionAttempt;
use crate::channel::{run_channel, Channel, ChannelInitializer};
use crate::config::DispatcherConfig;
use crate::events::ConnectionEvent;
use crate::supervisor::ReconnectSupervisor;
use crate::transport::{Address, BoxIo, Connector};

pub(crate) struct DispatcherInner {
    pub(crate) name: String,
    pub(crate) event_listeners: EventListeners<ConnectionEvent>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) acceptor: Handle,
    pub(crate) worker: Handle,
    pub(crate) shutdown: CancellationToken,
    owned_runtime: Mutex<Option<Runtime>>,
    next_channel_id: AtomicU64,
}

impl DispatcherInner {
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        self.event_listeners.emit(&event);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn new_channel(
        &self,
        peer_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) -> Channel {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        Channel::new(id, peer_addr, local_addr)
    }

    /// Runs `driver` for `channel` on the worker context.
    ///
    /// If the driver stops without resolving `promise`, the promise fails
    /// with [`DispatchError::ChannelClosed`].
    pub(crate) fn spawn_channel<S>(
        self: &Arc<Self>,
        channel: Channel,
        driver: BoxFuture<'static, ()>,
        promise: Promise<S>,
    ) where
        S: Send + 'static,
    {
        let inner = Arc::clone(self);
        self.worker.spawn(async move {
            run_channel(channel.clone(), driver).await;
            promise.try_failure(DispatchError::ChannelClosed);

            #[cfg(feature = "tracing")]
            tracing::debug!(
                name = %inner.name,
                channel = channel.id(),
                peer = %channel.peer_addr(),
                "channel closed"
            );

            inner.emit(ConnectionEvent::ChannelClosed {
                pattern_name: inner.name.clone(),
                timestamp: Instant::now(),
                channel_id: channel.id(),
                peer_addr: channel.peer_addr(),
            });
        });
    }

    fn release_runtime(&self) {
        let runtime = self
            .owned_runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.release_runtime();
    }
}

/// Bootstraps servers and clients for a protocol.
///
/// Owns (or borrows) the acceptor and worker execution contexts shared by
/// every server and client it creates. Cheap to clone; clones share those
/// contexts and the shutdown state.
///
/// ```no_run
/// use protocol_dispatch::{Dispatcher, DispatcherConfig};
///
/// # #[tokio::main]
/// # async fn main() -> std::io::Result<()> {
/// let dispatcher = Dispatcher::new(DispatcherConfig::builder().name("netconf").build())?;
/// assert!(!dispatcher.is_shutdown());
/// dispatcher.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// Without explicit handles or `worker_threads`, the dispatcher runs on
    /// the current tokio runtime; outside of one this fails.
    pub fn new(config: DispatcherConfig) -> io::Result<Self> {
        let mut owned_runtime = None;

        let worker = match (config.worker_threads, config.worker.clone()) {
            (Some(threads), _) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(threads)
                    .thread_name(format!("{}-worker", config.name))
                    .enable_all()
                    .build()?;
                let handle = runtime.handle().clone();
                owned_runtime = Some(runtime);
                handle
            }
            (None, Some(handle)) => handle,
            (None, None) => current_handle()?,
        };

        let acceptor = match config.acceptor.clone() {
            Some(handle) => handle,
            None => Handle::try_current().unwrap_or_else(|_| worker.clone()),
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            name = %config.name,
            worker_threads = ?config.worker_threads,
            "dispatcher created"
        );

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                name: config.name,
                event_listeners: config.event_listeners,
                connector: config.connector,
                acceptor,
                worker,
                shutdown: CancellationToken::new(),
                owned_runtime: Mutex::new(owned_runtime),
                next_channel_id: AtomicU64::new(1),
            }),
        })
    }

    /// The configured name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The worker context. Timed reconnect strategies can use it as their
    /// timer service.
    pub fn worker(&self) -> &Handle {
        &self.inner.worker
    }

    /// Starts listening on `address`.
    ///
    /// Every accepted connection is handed to `initializer` together with a
    /// fresh completion handle. The returned handle tracks the bind only.
    pub fn create_server<S, I>(&self, address: SocketAddr, initializer: I) -> Promise<ServerHandle>
    where
        S: Send + 'static,
        I: ChannelInitializer<S>,
    {
        if self.inner.is_shutdown() {
            return Promise::failed(DispatchError::Shutdown);
        }

        let promise = Promise::new();
        let bound = promise.clone();
        let inner = Arc::clone(&self.inner);
        let initializer = Arc::new(initializer);

        self.inner.acceptor.spawn(async move {
            let listener = tokio::select! {
                result = TcpListener::bind(address) => match result {
                    Ok(listener) => listener,
                    Err(e) => {
                        bound.try_failure(DispatchError::bind(address.to_string(), e));
                        return;
                    }
                },
                _ = bound.cancelled() => return,
                _ = inner.shutdown.cancelled() => {
                    bound.try_failure(DispatchError::Shutdown);
                    return;
                }
            };

            let local_addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    bound.try_failure(DispatchError::bind(address.to_string(), e));
                    return;
                }
            };

            let token = inner.shutdown.child_token();
            let handle = ServerHandle {
                local_addr,
                token: token.clone(),
            };
            if !bound.try_success(handle) {
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::info!(name = %inner.name, %local_addr, "server listening");

            inner.emit(ConnectionEvent::ServerBound {
                pattern_name: inner.name.clone(),
                timestamp: Instant::now(),
                local_addr,
            });

            accept_loop(inner, listener, local_addr, token, initializer).await;
        });

        promise
    }

    /// Connects to `address`, retrying per `strategy`.
    ///
    /// The returned attempt resolves with the negotiated session, fails once
    /// the strategy gives up or negotiation fails, or is cancelled.
    pub fn create_client<S, R, I>(
        &self,
        address: impl Into<Address>,
        strategy: R,
        initializer: I,
    ) -> ConnectionAttempt<S>
    where
        S: Clone + Send + Sync + 'static,
        R: ReconnectStrategy,
        I: ChannelInitializer<S>,
    {
        ConnectionAttempt::start(
            Arc::clone(&self.inner),
            address.into(),
            strategy,
            Arc::new(initializer),
        )
    }

    /// Connects to `address` and keeps reconnecting whenever an established
    /// session drops.
    ///
    /// Every incarnation gets a fresh strategy from `factory`. The returned
    /// supervisor only completes when cancelled or when an incarnation fails
    /// for good.
    pub fn create_reconnecting_client<S, F, I>(
        &self,
        address: impl Into<Address>,
        factory: F,
        initializer: I,
    ) -> ReconnectSupervisor<S>
    where
        S: Clone + Send + Sync + 'static,
        F: ReconnectStrategyFactory,
        I: ChannelInitializer<S>,
    {
        ReconnectSupervisor::start(
            self.clone(),
            address.into(),
            Arc::new(factory),
            Arc::new(initializer),
        )
    }

    /// Stops all servers and pending connection attempts and releases an
    /// owned worker runtime.
    ///
    /// New work fails with [`DispatchError::Shutdown`]. Established sessions
    /// on a borrowed runtime stay up until closed.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(name = %self.inner.name, "dispatcher shutting down");

        self.inner.shutdown.cancel();
        self.inner.release_runtime();
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    pub(crate) fn inner(&self) -> &Arc<DispatcherInner> {
        &self.inner
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("shutdown", &self.inner.is_shutdown())
            .finish()
    }
}

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

fn current_handle() -> io::Result<Handle> {
    Handle::try_current().map_err(io::Error::other)
}

async fn accept_loop<S, I>(
    inner: Arc<DispatcherInner>,
    listener: TcpListener,
    local_addr: SocketAddr,
    token: CancellationToken,
    initializer: Arc<I>,
) where
    S: Send + 'static,
    I: ChannelInitializer<S>,
{
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(name = %inner.name, %local_addr, error = %_e, "accept failed");
                    // Usually fd exhaustion; pause before accepting again.
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        let channel = inner.new_channel(peer_addr, Some(local_addr));

        #[cfg(feature = "metrics")]
        counter!("dispatch_accepted_total", "name" => inner.name.clone()).increment(1);

        #[cfg(feature = "tracing")]
        tracing::debug!(name = %inner.name, %peer_addr, channel = channel.id(), "accepted connection");

        inner.emit(ConnectionEvent::Accepted {
            pattern_name: inner.name.clone(),
            timestamp: Instant::now(),
            local_addr,
            peer_addr,
            channel_id: channel.id(),
        });

        let promise = Promise::new();
        watch_server_session(&inner, &channel, &promise);

        let io: BoxIo = Box::new(stream);
        let driver = initializer.init_channel(channel.clone(), io, promise.clone());
        inner.spawn_channel(channel, driver, promise);
    }

    #[cfg(feature = "tracing")]
    tracing::info!(name = %inner.name, %local_addr, "server stopped");
}

/// Reports the negotiation outcome of an accepted connection.
fn watch_server_session<S: Send + 'static>(
    inner: &Arc<DispatcherInner>,
    channel: &Channel,
    promise: &Promise<S>,
) {
    let inner = Arc::clone(inner);
    let channel_id = channel.id();
    let peer = channel.peer_addr().to_string();
    promise.add_listener(move |p| {
        if p.is_success() {
            #[cfg(feature = "metrics")]
            counter!("dispatch_sessions_established_total", "name" => inner.name.clone())
                .increment(1);

            inner.emit(ConnectionEvent::SessionEstablished {
                pattern_name: inner.name.clone(),
                timestamp: Instant::now(),
                address: peer,
                channel_id,
            });
        } else if let Some(cause) = p.cause() {
            #[cfg(feature = "metrics")]
            counter!("dispatch_negotiation_failures_total", "name" => inner.name.clone())
                .increment(1);

            inner.emit(ConnectionEvent::NegotiationFailed {
                pattern_name: inner.name.clone(),
                timestamp: Instant::now(),
                address: peer,
                channel_id,
                error: cause.to_string(),
            });
        }
    });
}

/// A listening server.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
}

impl ServerHandle {
    /// The bound address, with the actual port when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Accepted connections stay open.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the server stopped accepting.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
