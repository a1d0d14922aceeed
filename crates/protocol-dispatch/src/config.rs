use crate::events::ConnectionEvent;
use crate::transport::{Connector, TcpConnector};
use protocol_dispatch_core::events::{EventListeners, FnListener};
use std::sync::Arc;

#[cfg(feature = "metrics")]
use metrics::describe_counter;
#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static METRICS_INIT: Once = Once::new();

/// Configuration of a [`Dispatcher`].
///
/// [`Dispatcher`]: crate::Dispatcher
#[derive(Clone)]
pub struct DispatcherConfig {
    pub(crate) name: String,
    pub(crate) worker_threads: Option<usize>,
    pub(crate) acceptor: Option<tokio::runtime::Handle>,
    pub(crate) worker: Option<tokio::runtime::Handle>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) event_listeners: EventListeners<ConnectionEvent>,
}

impl DispatcherConfig {
    /// Creates a new builder.
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::new()
    }

    /// Name used in events, logs and metric labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the dedicated worker runtime, if the dispatcher owns one.
    pub fn worker_threads(&self) -> Option<usize> {
        self.worker_threads
    }
}

impl std::fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("name", &self.name)
            .field("worker_threads", &self.worker_threads)
            .field("acceptor", &self.acceptor.is_some())
            .field("worker", &self.worker.is_some())
            .field("event_listeners", &self.event_listeners.len())
            .finish()
    }
}

/// Builder for [`DispatcherConfig`].
pub struct DispatcherConfigBuilder {
    name: String,
    worker_threads: Option<usize>,
    acceptor: Option<tokio::runtime::Handle>,
    worker: Option<tokio::runtime::Handle>,
    connector: Arc<dyn Connector>,
    event_listeners: EventListeners<ConnectionEvent>,
}

impl Default for DispatcherConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - name: `"<unnamed>"`
    /// - acceptor and worker: the runtime current when the dispatcher is
    ///   created
    /// - connector: [`TcpConnector`]
    pub fn new() -> Self {
        #[cfg(feature = "metrics")]
        {
            METRICS_INIT.call_once(|| {
                describe_counter!(
                    "dispatch_connect_attempts_total",
                    "Total number of outbound connects issued"
                );
                describe_counter!(
                    "dispatch_connect_failures_total",
                    "Total number of outbound connects that failed or timed out"
                );
                describe_counter!(
                    "dispatch_sessions_established_total",
                    "Total number of sessions that completed negotiation"
                );
                describe_counter!(
                    "dispatch_negotiation_failures_total",
                    "Total number of failed negotiations"
                );
                describe_counter!(
                    "dispatch_orphans_closed_total",
                    "Total number of connections closed because their attempt was cancelled"
                );
                describe_counter!(
                    "dispatch_reconnections_total",
                    "Total number of new incarnations started by reconnect supervisors"
                );
                describe_counter!(
                    "dispatch_accepted_total",
                    "Total number of connections accepted by servers"
                );
            });
        }

        Self {
            name: "<unnamed>".to_string(),
            worker_threads: None,
            acceptor: None,
            worker: None,
            connector: Arc::new(TcpConnector::new()),
            event_listeners: EventListeners::new(),
        }
    }

    /// Gives this dispatcher a name for events and metrics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Runs connection drivers on a dedicated multi-threaded runtime owned
    /// by the dispatcher and released on shutdown.
    ///
    /// Takes precedence over [`worker`](Self::worker).
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Runs accept loops on `handle`.
    pub fn acceptor(mut self, handle: tokio::runtime::Handle) -> Self {
        self.acceptor = Some(handle);
        self
    }

    /// Runs connection drivers, connect loops and backoff timers on
    /// `handle`.
    pub fn worker(mut self, handle: tokio::runtime::Handle) -> Self {
        self.worker = Some(handle);
        self
    }

    /// Opens outbound connections with `connector`.
    pub fn connector<C: Connector>(mut self, connector: C) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Registers a listener for every connection event.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(f));
        self
    }

    /// Registers a callback invoked with the target address whenever a
    /// session is established.
    pub fn on_session_established<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.event_listeners
            .add(FnListener::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::SessionEstablished { address, .. } = event {
                    f(address);
                }
            }));
        self
    }

    /// Registers a callback invoked with the address and failure whenever a
    /// client gives up.
    pub fn on_give_up<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.event_listeners
            .add(FnListener::new(move |event: &ConnectionEvent| {
                if let ConnectionEvent::GaveUp { address, error, .. } = event {
                    f(address, error);
                }
            }));
        self
    }

    /// Builds the configuration.
    ///
    /// # Panics
    ///
    /// Panics if `worker_threads` is zero.
    pub fn build(self) -> DispatcherConfig {
        if let Some(threads) = self.worker_threads {
            assert!(threads > 0, "worker_threads must be greater than zero");
        }

        DispatcherConfig {
            name: self.name,
            worker_threads: self.worker_threads,
            acceptor: self.acceptor,
            worker: self.worker,
            connector: self.connector,
            event_listeners: self.event_listeners,
        }
    }
}
