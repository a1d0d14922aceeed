//! Core infrastructure for protocol-dispatch.
//!
//! This crate provides the primitives shared by the reconnect strategies and
//! the dispatcher:
//! - [`Promise`], the completion handle used both as an API result and as an
//!   internal scheduling signal
//! - [`DispatchError`], the failure type every handle carries
//! - [`Executor`], the execution contexts work is spawned onto
//! - the event system for observability

pub mod error;
pub mod events;
pub mod executor;
pub mod promise;

pub use error::{BoxError, DispatchError, SharedError};
pub use events::{DispatchEvent, EventListener, EventListeners, FnListener};
pub use executor::Executor;
pub use promise::{Outcome, Promise};
