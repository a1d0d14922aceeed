//! Connections and the handler-chain initializer boundary.
//!
//! A [`Channel`] is the control handle of one connection. The byte stream
//! itself goes to the [`ChannelInitializer`], which installs framing and a
//! negotiator and returns the future that drives the connection. Dropping
//! that future drops the stream and so closes the connection.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use protocol_dispatch_core::Promise;
use tokio::sync::watch;

use crate::transport::BoxIo;

type CloseListener = Box<dyn FnOnce(&Channel) + Send>;

enum CloseState {
    Open(Vec<CloseListener>),
    Closed,
}

struct ChannelInner {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    close_requested: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    state: Mutex<CloseState>,
}

/// Handle to one connection.
///
/// Cheap to clone; every clone controls the same connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(id: u64, peer_addr: SocketAddr, local_addr: Option<SocketAddr>) -> Self {
        let (close_requested, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                id,
                peer_addr,
                local_addr,
                close_requested,
                closed,
                state: Mutex::new(CloseState::Open(Vec::new())),
            }),
        }
    }

    /// Identifier, unique per dispatcher.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote end of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Local end of the connection, when the transport reports it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Asks the connection to close.
    ///
    /// Returns immediately; the close listeners run once the connection
    /// driver has stopped and the stream was dropped.
    pub fn close(&self) {
        self.inner.close_requested.send_replace(true);
    }

    /// Returns `false` once a close was requested or the connection closed.
    pub fn is_open(&self) -> bool {
        !*self.inner.close_requested.borrow() && !*self.inner.closed.borrow()
    }

    /// Waits until a close is requested.
    pub async fn close_requested(&self) {
        let mut rx = self.inner.close_requested.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Waits until the connection has closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Registers `listener` to run once the connection has closed.
    ///
    /// Listeners run in registration order, exactly once. A listener added
    /// after the close runs immediately.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce(&Channel) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let CloseState::Open(listeners) = &mut *state {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener(self);
    }

    pub(crate) fn mark_closed(&self) {
        let listeners = {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, CloseState::Closed) {
                CloseState::Open(listeners) => listeners,
                CloseState::Closed => return,
            }
        };
        self.inner.close_requested.send_replace(true);
        self.inner.closed.send_replace(true);
        for listener in listeners {
            listener(self);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("local_addr", &self.inner.local_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Drives `driver` until it finishes or a close is requested, then marks the
/// channel closed.
pub(crate) async fn run_channel(channel: Channel, driver: BoxFuture<'static, ()>) {
    tokio::select! {
        biased;
        _ = driver => {}
        _ = channel.close_requested() => {}
    }
    channel.mark_closed();
}

/// Prepares a freshly connected or accepted connection.
///
/// Receives the channel handle, its byte stream and the completion handle
/// negotiation must resolve. Returns the future driving the connection;
/// the connection closes when it completes.
///
/// Closures with a matching signature implement this trait.
pub trait ChannelInitializer<S>: Send + Sync + 'static {
    /// Installs framing and negotiation on `io`.
    fn init_channel(
        &self,
        channel: Channel,
        io: BoxIo,
        promise: Promise<S>,
    ) -> BoxFuture<'static, ()>;
}

impl<S, F, Fut> ChannelInitializer<S> for F
where
    F: Fn(Channel, BoxIo, Promise<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn init_channel(
        &self,
        channel: Channel,
        io: BoxIo,
        promise: Promise<S>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(self(channel, io, promise))
    }
}

/// Registers a close listener on every channel before handing it to the
/// wrapped initializer.
///
/// Because the listener is attached first, it observes the close whatever
/// the wrapped initializer installs.
pub struct ClosedObserver<I: ?Sized> {
    inner: Arc<I>,
    on_closed: Arc<dyn Fn(&Channel) + Send + Sync>,
}

impl<I: ?Sized> ClosedObserver<I> {
    /// Wraps `inner`, calling `on_closed` whenever one of its channels closes.
    pub fn new<F>(inner: Arc<I>, on_closed: F) -> Self
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        Self {
            inner,
            on_closed: Arc::new(on_closed),
        }
    }
}

impl<S, I> ChannelInitializer<S> for ClosedObserver<I>
where
    I: ChannelInitializer<S> + ?Sized,
{
    fn init_channel(
        &self,
        channel: Channel,
        io: BoxIo,
        promise: Promise<S>,
    ) -> BoxFuture<'static, ()> {
        let on_closed = Arc::clone(&self.on_closed);
        channel.on_close(move |channel| on_closed(channel));
        self.inner.init_channel(channel, io, promise)
    }
}

impl<I: ?Sized> fmt::Debug for ClosedObserver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosedObserver").finish_non_exhaustive()
    }
}
