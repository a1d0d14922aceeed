use protocol_dispatch_core::events::DispatchEvent;
use std::time::{Duration, Instant};

/// Events emitted by a timed reconnect strategy.
#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    /// A retry was scheduled after `delay`.
    Scheduled {
        pattern_name: String,
        timestamp: Instant,
        attempt: u64,
        delay: Duration,
    },
    /// A retry was granted without any delay.
    Immediate {
        pattern_name: String,
        timestamp: Instant,
        attempt: u64,
    },
    /// The attempt budget is used up.
    AttemptsExhausted {
        pattern_name: String,
        timestamp: Instant,
        attempts: u64,
    },
    /// The deadline has passed, or the next wait would pass it.
    DeadlineExceeded {
        pattern_name: String,
        timestamp: Instant,
        attempts: u64,
    },
    /// A connection succeeded and the attempt counter was reset.
    Reset {
        pattern_name: String,
        timestamp: Instant,
        attempts: u64,
    },
}

impl DispatchEvent for ReconnectEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ReconnectEvent::Scheduled { .. } => "reconnect_scheduled",
            ReconnectEvent::Immediate { .. } => "reconnect_immediate",
            ReconnectEvent::AttemptsExhausted { .. } => "attempts_exhausted",
            ReconnectEvent::DeadlineExceeded { .. } => "deadline_exceeded",
            ReconnectEvent::Reset { .. } => "reconnect_reset",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            ReconnectEvent::Scheduled { timestamp, .. }
            | ReconnectEvent::Immediate { timestamp, .. }
            | ReconnectEvent::AttemptsExhausted { timestamp, .. }
            | ReconnectEvent::DeadlineExceeded { timestamp, .. }
            | ReconnectEvent::Reset { timestamp, .. } => *timestamp,
        }
    }

    fn pattern_name(&self) -> &str {
        match self {
            ReconnectEvent::Scheduled { pattern_name, .. }
            | ReconnectEvent::Immediate { pattern_name, .. }
            | ReconnectEvent::AttemptsExhausted { pattern_name, .. }
            | ReconnectEvent::DeadlineExceeded { pattern_name, .. }
            | ReconnectEvent::Reset { pattern_name, .. } => pattern_name,
        }
    }
}
