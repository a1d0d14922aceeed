//! Completion handles.
//!
//! A [`Promise`] is the eventual result of an asynchronous operation: it
//! starts out pending and is resolved exactly once, either with a value, with
//! a [`DispatchError`], or by cancellation. Every clone observes the same
//! state, so the same handle serves as the public result of an operation and
//! as the internal signal the operation's driver watches for cancellation.
//!
//! ```
//! use protocol_dispatch_core::Promise;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let promise = Promise::new();
//! let observer = promise.clone();
//!
//! tokio::spawn(async move {
//!     promise.try_success(42u32);
//! });
//!
//! assert_eq!(observer.wait().await.unwrap(), 42);
//! # }
//! ```

use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::DispatchError;

type Listener<T> = Box<dyn FnOnce(&Promise<T>) + Send>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Succeeded(T),
    Failed(DispatchError),
    Cancelled,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    done: watch::Sender<bool>,
}

/// Terminal state of a [`Promise`].
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Resolved with a value.
    Succeeded(T),
    /// Resolved with a failure.
    Failed(DispatchError),
    /// Cancelled before it could resolve.
    Cancelled,
}

/// A resolve-once completion handle with cancellation support.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Creates a pending handle.
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                done,
            }),
        }
    }

    /// Creates a handle that has already succeeded with `value`.
    pub fn succeeded(value: T) -> Self {
        let promise = Self::new();
        promise.try_success(value);
        promise
    }

    /// Creates a handle that has already failed with `error`.
    pub fn failed(error: DispatchError) -> Self {
        let promise = Self::new();
        promise.try_failure(error);
        promise
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, next: State<T>) -> bool {
        let listeners = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = next;
                    listeners
                }
                _ => return false,
            }
        };

        self.shared.done.send_replace(true);
        for listener in listeners {
            listener(self);
        }
        true
    }

    /// Resolves the handle with `value`.
    ///
    /// Returns `false` if the handle was already complete, in which case
    /// `value` is dropped.
    pub fn try_success(&self, value: T) -> bool {
        self.complete(State::Succeeded(value))
    }

    /// Fails the handle with `error`.
    ///
    /// Returns `false` if the handle was already complete.
    pub fn try_failure(&self, error: DispatchError) -> bool {
        self.complete(State::Failed(error))
    }

    /// Cancels the handle.
    ///
    /// Idempotent: returns `true` if the handle is cancelled after the call,
    /// `false` if it had already succeeded or failed.
    pub fn cancel(&self) -> bool {
        self.complete(State::Cancelled) || self.is_cancelled()
    }

    /// Returns `true` once the handle has left the pending state.
    pub fn is_done(&self) -> bool {
        !matches!(*self.lock(), State::Pending(_))
    }

    /// Returns `true` if the handle resolved with a value.
    pub fn is_success(&self) -> bool {
        matches!(*self.lock(), State::Succeeded(_))
    }

    /// Returns `true` if the handle was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.lock(), State::Cancelled)
    }

    /// Returns the failure, if the handle failed.
    pub fn cause(&self) -> Option<DispatchError> {
        match &*self.lock() {
            State::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Registers `listener` to run once the handle completes.
    ///
    /// Runs immediately on the calling thread if the handle is already
    /// complete, otherwise on the thread that completes it.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Promise<T>) + Send + 'static,
    {
        {
            let mut state = self.lock();
            if let State::Pending(listeners) = &mut *state {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener(self);
    }

    /// Waits until the handle completes, whatever the outcome.
    pub async fn done(&self) {
        let mut done = self.shared.done.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = done.wait_for(|done| *done).await;
    }

    /// Waits until the handle is cancelled.
    ///
    /// Never resolves if the handle succeeds or fails instead, which makes it
    /// suitable as a `tokio::select!` branch.
    pub async fn cancelled(&self) {
        self.done().await;
        if !self.is_cancelled() {
            futures::future::pending::<()>().await;
        }
    }
}

impl<T: Clone> Promise<T> {
    /// Returns the terminal state, or `None` while pending.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.lock() {
            State::Pending(_) => None,
            State::Succeeded(value) => Some(Outcome::Succeeded(value.clone())),
            State::Failed(error) => Some(Outcome::Failed(error.clone())),
            State::Cancelled => Some(Outcome::Cancelled),
        }
    }

    /// Returns the value if the handle has succeeded.
    pub fn get_now(&self) -> Option<T> {
        match &*self.lock() {
            State::Succeeded(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Waits for the handle and converts its outcome into a `Result`.
    ///
    /// Cancellation surfaces as [`DispatchError::Cancelled`].
    pub async fn wait(&self) -> Result<T, DispatchError> {
        self.done().await;
        match self.outcome() {
            Some(Outcome::Succeeded(value)) => Ok(value),
            Some(Outcome::Failed(error)) => Err(error),
            Some(Outcome::Cancelled) | None => Err(DispatchError::Cancelled),
        }
    }
}

impl<T> IntoFuture for Promise<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, DispatchError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            State::Pending(_) => "pending",
            State::Succeeded(_) => "succeeded",
            State::Failed(_) => "failed",
            State::Cancelled => "cancelled",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}
