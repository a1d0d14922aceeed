//! End-to-end tests for the dispatcher.
//!
//! Test organization:
//! - common.rs: hello protocol fixtures and polling helpers
//! - attempt.rs: connect loop, retries, cancellation and orphan cleanup
//! - supervisor.rs: reconnecting clients
//! - lifecycle.rs: servers, execution contexts and shutdown

mod attempt;
mod lifecycle;
