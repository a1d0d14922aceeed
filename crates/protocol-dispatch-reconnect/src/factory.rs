//! Factories producing one strategy per reconnection sequence.

use std::sync::Arc;
use std::time::Duration;

use protocol_dispatch_core::Executor;
use tokio::time::Instant;

use crate::config::TimedReconnectConfig;
use crate::strategy::{NeverReconnectStrategy, ReconnectImmediatelyStrategy, ReconnectStrategy};
use crate::timed::TimedReconnectStrategy;

/// Creates a fresh [`ReconnectStrategy`] for every reconnection sequence.
///
/// A reconnecting client asks its factory for a new strategy each time an
/// established session drops, so per-sequence state such as attempt counters
/// starts from zero.
pub trait ReconnectStrategyFactory: Send + Sync + 'static {
    /// Creates a new strategy instance.
    fn create_reconnect_strategy(&self) -> Box<dyn ReconnectStrategy>;
}

impl<F: ReconnectStrategyFactory + ?Sized> ReconnectStrategyFactory for Arc<F> {
    fn create_reconnect_strategy(&self) -> Box<dyn ReconnectStrategy> {
        (**self).create_reconnect_strategy()
    }
}

impl ReconnectStrategyFactory for NeverReconnectStrategy {
    fn create_reconnect_strategy(&self) -> Box<dyn ReconnectStrategy> {
        Box::new(*self)
    }
}

impl ReconnectStrategyFactory for ReconnectImmediatelyStrategy {
    fn create_reconnect_strategy(&self) -> Box<dyn ReconnectStrategy> {
        Box::new(*self)
    }
}

/// A factory backed by a closure.
#[derive(Clone)]
pub struct FactoryFn<F> {
    f: F,
}

/// Wraps a closure into a [`ReconnectStrategyFactory`].
///
/// ```
/// use protocol_dispatch_reconnect::{
///     factory_fn, NeverReconnectStrategy, ReconnectStrategy, ReconnectStrategyFactory,
/// };
/// use std::time::Duration;
///
/// let factory = factory_fn(|| NeverReconnectStrategy::new(Duration::from_secs(1)));
/// let strategy = factory.create_reconnect_strategy();
/// assert_eq!(strategy.connect_timeout().unwrap(), Duration::from_secs(1));
/// ```
pub fn factory_fn<F, S>(f: F) -> FactoryFn<F>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: ReconnectStrategy,
{
    FactoryFn { f }
}

impl<F, S> ReconnectStrategyFactory for FactoryFn<F>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: ReconnectStrategy,
{
    fn create_reconnect_strategy(&self) -> Box<dyn ReconnectStrategy> {
        Box::new((self.f)())
    }
}

impl<F> std::fmt::Debug for FactoryFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryFn").finish_non_exhaustive()
    }
}

/// Produces [`TimedReconnectStrategy`] instances sharing one configuration.
///
/// With [`deadline_per_sequence`](Self::deadline_per_sequence) every created
/// strategy gets its own deadline, measured from the moment it is created.
#[derive(Clone)]
pub struct TimedReconnectStrategyFactory<E = tokio::runtime::Handle> {
    config: Arc<TimedReconnectConfig>,
    sequence_budget: Option<Duration>,
    executor: E,
}

impl TimedReconnectStrategyFactory<tokio::runtime::Handle> {
    /// Creates a factory whose strategies run their timers on the current
    /// runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a tokio runtime.
    pub fn new(config: TimedReconnectConfig) -> Self {
        Self::with_executor(config, tokio::runtime::Handle::current())
    }
}

impl<E: Executor> TimedReconnectStrategyFactory<E> {
    /// Creates a factory whose strategies run their timers on `executor`.
    pub fn with_executor(config: TimedReconnectConfig, executor: E) -> Self {
        Self {
            config: Arc::new(config),
            sequence_budget: None,
            executor,
        }
    }

    /// Gives every created strategy a deadline `budget` after its creation,
    /// replacing the configured absolute deadline.
    pub fn deadline_per_sequence(mut self, budget: Duration) -> Self {
        self.sequence_budget = Some(budget);
        self
    }

    /// The configuration shared by created strategies.
    pub fn config(&self) -> &TimedReconnectConfig {
        &self.config
    }
}

impl<E: Executor + 'static> ReconnectStrategyFactory for TimedReconnectStrategyFactory<E> {
    fn create_reconnect_strategy(&self) -> Box<dyn ReconnectStrategy> {
        let config = match self.sequence_budget {
            Some(budget) => {
                let mut config = (*self.config).clone();
                config.deadline = Some(Instant::now() + budget);
                Arc::new(config)
            }
            None => Arc::clone(&self.config),
        };
        Box::new(TimedReconnectStrategy::with_executor(
            config,
            self.executor.clone(),
        ))
    }
}

impl<E> std::fmt::Debug for TimedReconnectStrategyFactory<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedReconnectStrategyFactory")
            .field("config", &self.config)
            .field("sequence_budget", &self.sequence_budget)
            .finish()
    }
}
