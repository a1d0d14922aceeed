use crate::events::ReconnectEvent;
use protocol_dispatch_core::events::{EventListeners, FnListener};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "metrics")]
use metrics::{describe_counter, describe_histogram};
#[cfg(feature = "metrics")]
use std::sync::Once;

#[cfg(feature = "metrics")]
static METRICS_INIT: Once = Once::new();

/// Configuration of a [`TimedReconnectStrategy`].
///
/// Immutable once built; every strategy created from it shares it.
///
/// [`TimedReconnectStrategy`]: crate::TimedReconnectStrategy
#[derive(Clone)]
pub struct TimedReconnectConfig {
    pub(crate) min_sleep: Duration,
    pub(crate) sleep_factor: f64,
    pub(crate) max_sleep: Option<Duration>,
    pub(crate) max_attempts: Option<u64>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) connect_timeout: Duration,
    pub(crate) name: String,
    pub(crate) event_listeners: EventListeners<ReconnectEvent>,
}

impl TimedReconnectConfig {
    /// Creates a new builder.
    pub fn builder() -> TimedReconnectConfigBuilder {
        TimedReconnectConfigBuilder::new()
    }

    /// Delay before the first retry.
    pub fn min_sleep(&self) -> Duration {
        self.min_sleep
    }

    /// Multiplier applied to the previous delay.
    pub fn sleep_factor(&self) -> f64 {
        self.sleep_factor
    }

    /// Upper bound for any delay.
    pub fn max_sleep(&self) -> Option<Duration> {
        self.max_sleep
    }

    /// Maximum number of scheduled retries per sequence.
    pub fn max_attempts(&self) -> Option<u64> {
        self.max_attempts
    }

    /// Instant after which no retry is scheduled and no connect started.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Timeout for a single connect attempt.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Name used in events, logs and metric labels.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for TimedReconnectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedReconnectConfig")
            .field("name", &self.name)
            .field("min_sleep", &self.min_sleep)
            .field("sleep_factor", &self.sleep_factor)
            .field("max_sleep", &self.max_sleep)
            .field("max_attempts", &self.max_attempts)
            .field("deadline", &self.deadline)
            .field("connect_timeout", &self.connect_timeout)
            .field("event_listeners", &self.event_listeners.len())
            .finish()
    }
}

/// Builder for [`TimedReconnectConfig`].
pub struct TimedReconnectConfigBuilder {
    min_sleep: Duration,
    sleep_factor: f64,
    max_sleep: Option<Duration>,
    max_attempts: Option<u64>,
    deadline: Option<Instant>,
    connect_timeout: Duration,
    name: String,
    event_listeners: EventListeners<ReconnectEvent>,
}

impl Default for TimedReconnectConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimedReconnectConfigBuilder {
    /// Creates a new builder with defaults.
    ///
    /// Defaults:
    /// - min_sleep: 100ms
    /// - sleep_factor: 2.0
    /// - max_sleep: none
    /// - max_attempts: none (unlimited)
    /// - deadline: none
    /// - connect_timeout: 5s
    /// - name: `"<unnamed>"`
    pub fn new() -> Self {
        #[cfg(feature = "metrics")]
        {
            METRICS_INIT.call_once(|| {
                describe_counter!(
                    "reconnect_scheduled_total",
                    "Total number of reconnect attempts granted by timed strategies"
                );
                describe_counter!(
                    "reconnect_exhausted_total",
                    "Total number of times a timed strategy gave up"
                );
                describe_histogram!(
                    "reconnect_delay_seconds",
                    "Delay scheduled before a reconnect attempt"
                );
            });
        }

        Self {
            min_sleep: Duration::from_millis(100),
            sleep_factor: 2.0,
            max_sleep: None,
            max_attempts: None,
            deadline: None,
            connect_timeout: Duration::from_secs(5),
            name: "<unnamed>".to_string(),
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the delay before the first retry.
    pub fn min_sleep(mut self, min_sleep: Duration) -> Self {
        self.min_sleep = min_sleep;
        self
    }

    /// Sets the multiplier applied to each successive delay.
    ///
    /// Must be at least `1.0`.
    pub fn sleep_factor(mut self, sleep_factor: f64) -> Self {
        self.sleep_factor = sleep_factor;
        self
    }

    /// Caps every delay at `max_sleep`.
    pub fn max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = Some(max_sleep);
        self
    }

    /// Gives up after `max_attempts` scheduled retries.
    ///
    /// # Examples
    ///
    /// ```
    /// use protocol_dispatch_reconnect::TimedReconnectConfig;
    ///
    /// let config = TimedReconnectConfig::builder()
    ///     .max_attempts(5)
    ///     .build();
    /// assert_eq!(config.max_attempts(), Some(5));
    /// ```
    pub fn max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Removes the attempt cap.
    pub fn unlimited_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Gives up once `deadline` has passed.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Gives up `budget` from now.
    pub fn deadline_after(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    /// Sets the timeout of a single connect attempt.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Gives this strategy configuration a name for events and metrics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Registers a listener for every reconnect event.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&ReconnectEvent) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(f));
        self
    }

    /// Registers a callback invoked with `(attempt, delay)` whenever a
    /// retry is scheduled, including zero-delay retries.
    ///
    /// # Examples
    ///
    /// ```
    /// use protocol_dispatch_reconnect::TimedReconnectConfig;
    ///
    /// let config = TimedReconnectConfig::builder()
    ///     .on_scheduled(|attempt, delay| {
    ///         println!("retry #{} in {:?}", attempt, delay);
    ///     })
    ///     .build();
    /// ```
    pub fn on_scheduled<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, Duration) + Send + Sync + 'static,
    {
        self.event_listeners
            .add(FnListener::new(move |event: &ReconnectEvent| match event {
                ReconnectEvent::Scheduled { attempt, delay, .. } => f(*attempt, *delay),
                ReconnectEvent::Immediate { attempt, .. } => f(*attempt, Duration::ZERO),
                _ => {}
            }));
        self
    }

    /// Registers a callback invoked when the strategy gives up.
    pub fn on_give_up<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.event_listeners
            .add(FnListener::new(move |event: &ReconnectEvent| match event {
                ReconnectEvent::AttemptsExhausted { attempts, .. }
                | ReconnectEvent::DeadlineExceeded { attempts, .. } => f(*attempts),
                _ => {}
            }));
        self
    }

    /// Builds the configuration.
    ///
    /// # Panics
    ///
    /// Panics if `sleep_factor` is below `1.0` or not finite, or if
    /// `min_sleep` exceeds `max_sleep`.
    pub fn build(self) -> TimedReconnectConfig {
        assert!(
            self.sleep_factor.is_finite() && self.sleep_factor >= 1.0,
            "sleep_factor must be a finite value >= 1.0, got {}",
            self.sleep_factor
        );
        if let Some(max_sleep) = self.max_sleep {
            assert!(
                self.min_sleep <= max_sleep,
                "min_sleep ({:?}) must not exceed max_sleep ({:?})",
                self.min_sleep,
                max_sleep
            );
        }

        TimedReconnectConfig {
            min_sleep: self.min_sleep,
            sleep_factor: self.sleep_factor,
            max_sleep: self.max_sleep,
            max_attempts: self.max_attempts,
            deadline: self.deadline,
            connect_timeout: self.connect_timeout,
            name: self.name,
            event_listeners: self.event_listeners,
        }
    }
}
