//! Event system for the dispatch subsystem.
//!
//! Reconnect strategies and connection drivers report what they do through
//! typed events. Listeners are registered on the relevant config builder and
//! invoked synchronously on the thread that produced the event, so they must
//! not block.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// An event emitted by a strategy, connection attempt or dispatcher.
pub trait DispatchEvent: Send + Sync + fmt::Debug {
    /// Short name of the event kind (e.g. `"reconnect_scheduled"`).
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn timestamp(&self) -> Instant;

    /// Name of the strategy or dispatcher instance that emitted it.
    fn pattern_name(&self) -> &str;
}

/// Receives events of type `E`.
pub trait EventListener<E: DispatchEvent>: Send + Sync {
    /// Called for every emitted event.
    fn on_event(&self, event: &E);
}

type BoxedEventListener<E> = Arc<dyn EventListener<E>>;

/// An ordered collection of listeners for one event type.
pub struct EventListeners<E: DispatchEvent> {
    listeners: Vec<BoxedEventListener<E>>,
}

impl<E: DispatchEvent> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E: DispatchEvent> EventListeners<E> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Appends a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Delivers `event` to every listener in registration order.
    ///
    /// A panicking listener is isolated: the remaining listeners still run
    /// and the panic does not reach the emitting connection driver.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));
            if outcome.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    name = event.pattern_name(),
                    event = event.event_type(),
                    "event listener panicked"
                );
            }
        }
    }

    /// Returns `true` if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: DispatchEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: DispatchEvent> fmt::Debug for EventListeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("len", &self.listeners.len())
            .finish()
    }
}

/// Adapts a closure into an [`EventListener`].
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _event: PhantomData<fn(&E)>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _event: PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: DispatchEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}
