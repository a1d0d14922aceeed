use protocol_dispatch_core::events::DispatchEvent;
use std::net::SocketAddr;
use std::time::Instant;

/// Events emitted by the dispatcher, its connection attempts and reconnect
/// supervisors.
///
/// `address` is the target as requested by the caller, rendered for display;
/// `channel_id` identifies a connection for the lifetime of its dispatcher.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// An outbound connect was issued.
    ConnectStarted {
        pattern_name: String,
        timestamp: Instant,
        address: String,
        attempt: u64,
    },
    /// An outbound connect failed or timed out.
    ConnectFailed {
        pattern_name: String,
        timestamp: Instant,
        address: String,
        error: String,
    },
    /// An outbound connect succeeded; negotiation starts.
    Connected {
        pattern_name: String,
        timestamp: Instant,
        address: String,
        channel_id: u64,
    },
    /// The strategy granted another connect; the attempt waits for it.
    RetryScheduled {
        pattern_name: String,
        timestamp: Instant,
        address: String,
    },
    /// Negotiation completed and the session was handed to the caller.
    SessionEstablished {
        pattern_name: String,
        timestamp: Instant,
        address: String,
        channel_id: u64,
    },
    /// Negotiation was rejected or the connection dropped mid-handshake.
    NegotiationFailed {
        pattern_name: String,
        timestamp: Instant,
        address: String,
        channel_id: u64,
        error: String,
    },
    /// A connect finished after its attempt was cancelled; the connection
    /// was closed right away.
    OrphanClosed {
        pattern_name: String,
        timestamp: Instant,
        address: String,
    },
    /// An attempt or supervisor was cancelled.
    Cancelled {
        pattern_name: String,
        timestamp: Instant,
        address: String,
    },
    /// The strategy refused any further connect.
    GaveUp {
        pattern_name: String,
        timestamp: Instant,
        address: String,
        error: String,
    },
    /// A supervisor started a new incarnation after an established session
    /// dropped.
    Reincarnation {
        pattern_name: String,
        timestamp: Instant,
        address: String,
        incarnation: u64,
    },
    /// A connection closed.
    ChannelClosed {
        pattern_name: String,
        timestamp: Instant,
        channel_id: u64,
        peer_addr: SocketAddr,
    },
    /// A server started listening.
    ServerBound {
        pattern_name: String,
        timestamp: Instant,
        local_addr: SocketAddr,
    },
    /// A server accepted a connection.
    Accepted {
        pattern_name: String,
        timestamp: Instant,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        channel_id: u64,
    },
}

impl DispatchEvent for ConnectionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ConnectionEvent::ConnectStarted { .. } => "connect_started",
            ConnectionEvent::ConnectFailed { .. } => "connect_failed",
            ConnectionEvent::Connected { .. } => "connected",
            ConnectionEvent::RetryScheduled { .. } => "retry_scheduled",
            ConnectionEvent::SessionEstablished { .. } => "session_established",
            ConnectionEvent::NegotiationFailed { .. } => "negotiation_failed",
            ConnectionEvent::OrphanClosed { .. } => "orphan_closed",
            ConnectionEvent::Cancelled { .. } => "cancelled",
            ConnectionEvent::GaveUp { .. } => "gave_up",
            ConnectionEvent::Reincarnation { .. } => "reincarnation",
            ConnectionEvent::ChannelClosed { .. } => "channel_closed",
            ConnectionEvent::ServerBound { .. } => "server_bound",
            ConnectionEvent::Accepted { .. } => "accepted",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            ConnectionEvent::ConnectStarted { timestamp, .. }
            | ConnectionEvent::ConnectFailed { timestamp, .. }
            | ConnectionEvent::Connected { timestamp, .. }
            | ConnectionEvent::RetryScheduled { timestamp, .. }
            | ConnectionEvent::SessionEstablished { timestamp, .. }
            | ConnectionEvent::NegotiationFailed { timestamp, .. }
            | ConnectionEvent::OrphanClosed { timestamp, .. }
            | ConnectionEvent::Cancelled { timestamp, .. }
            | ConnectionEvent::GaveUp { timestamp, .. }
            | ConnectionEvent::Reincarnation { timestamp, .. }
            | ConnectionEvent::ChannelClosed { timestamp, .. }
            | ConnectionEvent::ServerBound { timestamp, .. }
            | ConnectionEvent::Accepted { timestamp, .. } => *timestamp,
        }
    }

    fn pattern_name(&self) -> &str {
        match self {
            ConnectionEvent::ConnectStarted { pattern_name, .. }
            | ConnectionEvent::ConnectFailed { pattern_name, .. }
            | ConnectionEvent::Connected { pattern_name, .. }
            | ConnectionEvent::RetryScheduled { pattern_name, .. }
            | ConnectionEvent::SessionEstablished { pattern_name, .. }
            | ConnectionEvent::NegotiationFailed { pattern_name, .. }
            | ConnectionEvent::OrphanClosed { pattern_name, .. }
            | ConnectionEvent::Cancelled { pattern_name, .. }
            | ConnectionEvent::GaveUp { pattern_name, .. }
            | ConnectionEvent::Reincarnation { pattern_name, .. }
            | ConnectionEvent::ChannelClosed { pattern_name, .. }
            | ConnectionEvent::ServerBound { pattern_name, .. }
            | ConnectionEvent::Accepted { pattern_name, .. } => pattern_name,
        }
    }
}
