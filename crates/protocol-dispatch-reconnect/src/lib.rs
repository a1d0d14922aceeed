//! Reconnect strategies for protocol-dispatch clients.
//!
//! A [`ReconnectStrategy`] decides, after a failed connect, whether the
//! client tries again and how long it waits first. Three variants ship with
//! this crate:
//!
//! - [`NeverReconnectStrategy`]: every failure is final
//! - [`ReconnectImmediatelyStrategy`]: retry right away, forever
//! - [`TimedReconnectStrategy`]: exponential backoff bounded by a delay cap,
//!   an attempt cap and an absolute deadline
//!
//! Reconnecting clients obtain a fresh strategy for each reconnection
//! sequence from a [`ReconnectStrategyFactory`].
//!
//! # Examples
//!
//! ```rust
//! use protocol_dispatch_reconnect::{
//!     ReconnectStrategy, ReconnectStrategyFactory, TimedReconnectConfig,
//!     TimedReconnectStrategyFactory,
//! };
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = TimedReconnectConfig::builder()
//!     .min_sleep(Duration::from_millis(100))
//!     .sleep_factor(2.0)
//!     .max_sleep(Duration::from_secs(10))
//!     .max_attempts(20)
//!     .connect_timeout(Duration::from_secs(2))
//!     .name("upstream")
//!     .on_scheduled(|attempt, delay| {
//!         println!("reconnect #{attempt} in {delay:?}");
//!     })
//!     .build();
//!
//! let factory = TimedReconnectStrategyFactory::new(config);
//! let strategy = factory.create_reconnect_strategy();
//! assert_eq!(strategy.connect_timeout().unwrap(), Duration::from_secs(2));
//! # }
//! ```
//!
//! # Feature flags
//!
//! - `metrics`: counters for scheduled and exhausted reconnects, and a delay
//!   histogram
//! - `tracing`: structured log lines for scheduling decisions

mod config;
mod events;
mod factory;
mod strategy;
mod timed;

pub use config::{TimedReconnectConfig, TimedReconnectConfigBuilder};
pub use events::ReconnectEvent;
pub use factory::{factory_fn, FactoryFn, ReconnectStrategyFactory, TimedReconnectStrategyFactory};
pub use strategy::{NeverReconnectStrategy, ReconnectImmediatelyStrategy, ReconnectStrategy};
pub use timed::TimedReconnectStrategy;
