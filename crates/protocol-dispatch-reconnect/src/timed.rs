//! Exponential backoff with a delay cap, an attempt cap and a deadline.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use protocol_dispatch_core::{DispatchError, Executor, Promise};
use tokio::time::Instant;

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use crate::config::TimedReconnectConfig;
use crate::events::ReconnectEvent;
use crate::strategy::ReconnectStrategy;

#[derive(Debug, Default)]
struct TimedState {
    attempts: u64,
    last_sleep_ms: u64,
    scheduled: bool,
}

/// Retries with exponentially growing delays.
///
/// The first retry waits `min_sleep`; each following one multiplies the
/// previous delay by `sleep_factor`, capped at `max_sleep`. The strategy
/// gives up once `max_attempts` retries were granted or when the next retry
/// (or connect) would run past the deadline. Delays are timers on the
/// strategy's executor, never blocking sleeps.
///
/// ```
/// use protocol_dispatch_core::DispatchError;
/// use protocol_dispatch_reconnect::{
///     ReconnectStrategy, TimedReconnectConfig, TimedReconnectStrategy,
/// };
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = TimedReconnectConfig::builder()
///     .min_sleep(Duration::from_millis(10))
///     .sleep_factor(2.0)
///     .max_attempts(1)
///     .build();
/// let strategy = TimedReconnectStrategy::new(config);
///
/// let retry = strategy.schedule_reconnect(&DispatchError::ChannelClosed);
/// retry.wait().await.unwrap();
///
/// let give_up = strategy.schedule_reconnect(&DispatchError::ChannelClosed);
/// assert!(give_up.cause().unwrap().is_attempts_exhausted());
/// # }
/// ```
pub struct TimedReconnectStrategy<E = tokio::runtime::Handle> {
    config: Arc<TimedReconnectConfig>,
    executor: E,
    state: Arc<Mutex<TimedState>>,
}

impl TimedReconnectStrategy<tokio::runtime::Handle> {
    /// Creates a strategy whose timers run on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a tokio runtime.
    pub fn new(config: TimedReconnectConfig) -> Self {
        Self::with_executor(Arc::new(config), tokio::runtime::Handle::current())
    }
}

impl<E: Executor> TimedReconnectStrategy<E> {
    /// Creates a strategy whose timers run on `executor`.
    pub fn with_executor(config: Arc<TimedReconnectConfig>, executor: E) -> Self {
        Self {
            config,
            executor,
            state: Arc::new(Mutex::new(TimedState::default())),
        }
    }

    /// The shared configuration.
    pub fn config(&self) -> &TimedReconnectConfig {
        &self.config
    }

    /// Retries granted since creation or the last successful connect.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    /// The most recently computed delay.
    pub fn last_sleep(&self) -> Duration {
        Duration::from_millis(self.lock().last_sleep_ms)
    }

    /// Returns `true` while a delayed retry is pending.
    pub fn is_scheduled(&self) -> bool {
        self.lock().scheduled
    }

    fn lock(&self) -> MutexGuard<'_, TimedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_sleep_ms(&self, state: &TimedState) -> u64 {
        let min_ms = duration_ms(self.config.min_sleep);
        let sleep_ms = if state.attempts == 0 {
            min_ms
        } else {
            let grown = state.last_sleep_ms as f64 * self.config.sleep_factor;
            if grown >= u64::MAX as f64 {
                u64::MAX
            } else {
                grown as u64
            }
        };

        match self.config.max_sleep {
            Some(max_sleep) => sleep_ms.min(duration_ms(max_sleep)),
            None => sleep_ms,
        }
    }

    fn give_up(&self, attempts: u64, error: DispatchError) -> Promise<()> {
        let event = if error.is_attempts_exhausted() {
            ReconnectEvent::AttemptsExhausted {
                pattern_name: self.config.name.clone(),
                timestamp: std::time::Instant::now(),
                attempts,
            }
        } else {
            ReconnectEvent::DeadlineExceeded {
                pattern_name: self.config.name.clone(),
                timestamp: std::time::Instant::now(),
                attempts,
            }
        };
        self.config.event_listeners.emit(&event);

        #[cfg(feature = "metrics")]
        counter!("reconnect_exhausted_total", "name" => self.config.name.clone()).increment(1);

        #[cfg(feature = "tracing")]
        tracing::info!(
            name = %self.config.name,
            attempts,
            error = %error,
            "giving up reconnecting"
        );

        Promise::failed(error)
    }
}

impl<E: Executor> ReconnectStrategy for TimedReconnectStrategy<E> {
    fn connect_timeout(&self) -> Result<Duration, DispatchError> {
        let timeout = self.config.connect_timeout;
        let Some(deadline) = self.config.deadline else {
            return Ok(timeout);
        };

        let now = Instant::now();
        if deadline <= now {
            return Err(DispatchError::DeadlineExceeded { cause: None });
        }

        let clamped = timeout.min(deadline - now);
        if clamped < Duration::from_millis(1) {
            return Err(DispatchError::DeadlineExceeded { cause: None });
        }
        Ok(clamped)
    }

    fn schedule_reconnect(&self, cause: &DispatchError) -> Promise<()> {
        let now = Instant::now();
        let mut state = self.lock();

        assert!(
            !state.scheduled,
            "schedule_reconnect called while a previous reconnect is still pending"
        );

        if let Some(max_attempts) = self.config.max_attempts {
            if state.attempts >= max_attempts {
                let attempts = state.attempts;
                drop(state);
                return self.give_up(
                    attempts,
                    DispatchError::AttemptsExhausted {
                        attempts,
                        cause: Box::new(cause.clone()),
                    },
                );
            }
        }

        let deadline_exceeded = || DispatchError::DeadlineExceeded {
            cause: Some(Box::new(cause.clone())),
        };

        if let Some(deadline) = self.config.deadline {
            if deadline <= now {
                let attempts = state.attempts;
                drop(state);
                return self.give_up(attempts, deadline_exceeded());
            }
        }

        let sleep_ms = self.next_sleep_ms(&state);
        state.last_sleep_ms = sleep_ms;
        state.attempts += 1;
        let attempt = state.attempts;
        let delay = Duration::from_millis(sleep_ms);

        // Checked after computing the delay so even the first retry honours it.
        if let Some(deadline) = self.config.deadline {
            let fires_at = now.checked_add(delay);
            if fires_at.map_or(true, |at| at > deadline) {
                drop(state);
                return self.give_up(attempt, deadline_exceeded());
            }
        }

        #[cfg(feature = "metrics")]
        {
            counter!("reconnect_scheduled_total", "name" => self.config.name.clone()).increment(1);
            histogram!("reconnect_delay_seconds", "name" => self.config.name.clone())
                .record(delay.as_secs_f64());
        }

        if sleep_ms == 0 {
            drop(state);
            self.config.event_listeners.emit(&ReconnectEvent::Immediate {
                pattern_name: self.config.name.clone(),
                timestamp: std::time::Instant::now(),
                attempt,
            });
            return Promise::succeeded(());
        }

        state.scheduled = true;
        drop(state);

        self.config.event_listeners.emit(&ReconnectEvent::Scheduled {
            pattern_name: self.config.name.clone(),
            timestamp: std::time::Instant::now(),
            attempt,
            delay,
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(
            name = %self.config.name,
            attempt,
            delay_ms = sleep_ms,
            cause = %cause,
            "reconnect scheduled"
        );

        let promise = Promise::new();
        let timer = promise.clone();
        let state = Arc::clone(&self.state);
        self.executor.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    clear_scheduled(&state);
                    timer.try_success(());
                }
                _ = timer.cancelled() => {
                    clear_scheduled(&state);
                }
            }
        });
        promise
    }

    fn reconnect_successful(&self) {
        let mut state = self.lock();
        assert!(
            !state.scheduled,
            "reconnect_successful called while a reconnect is still pending"
        );
        let attempts = std::mem::take(&mut state.attempts);
        drop(state);

        self.config.event_listeners.emit(&ReconnectEvent::Reset {
            pattern_name: self.config.name.clone(),
            timestamp: std::time::Instant::now(),
            attempts,
        });
    }
}

impl<E> std::fmt::Debug for TimedReconnectStrategy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TimedReconnectStrategy")
            .field("name", &self.config.name)
            .field("attempts", &state.attempts)
            .field("last_sleep_ms", &state.last_sleep_ms)
            .field("scheduled", &state.scheduled)
            .finish()
    }
}

fn clear_scheduled(state: &Mutex<TimedState>) {
    state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .scheduled = false;
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
