//! The failure type carried by every completion handle.
//!
//! All failures in the dispatch subsystem flow through [`Promise`] failure
//! channels as a [`DispatchError`]. Wrapping variants keep the original cause
//! as their [`source`](std::error::Error::source), so a caller can tell a
//! retry policy that ran out of attempts from one that hit its deadline, and
//! both from a rejected handshake.
//!
//! ```
//! use protocol_dispatch_core::DispatchError;
//! use std::io;
//!
//! let refused = DispatchError::connect(
//!     "127.0.0.1:4000",
//!     io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
//! );
//! let exhausted = DispatchError::AttemptsExhausted {
//!     attempts: 3,
//!     cause: Box::new(refused),
//! };
//!
//! assert!(exhausted.is_attempts_exhausted());
//! assert!(exhausted.root_cause().to_string().contains("refused"));
//! ```
//!
//! [`Promise`]: crate::Promise

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error accepted from protocol plug points.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Reference-counted error, cheap to hand to every waiter of a handle.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced through completion handles.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The transport refused or aborted an outbound connect.
    #[error("failed to connect to {address}")]
    Connect {
        /// Target address as requested.
        address: String,
        /// Underlying I/O failure.
        #[source]
        source: Arc<io::Error>,
    },

    /// An outbound connect did not finish within its timeout.
    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target address as requested.
        address: String,
        /// Timeout handed out by the reconnect strategy.
        timeout: Duration,
    },

    /// An unresolved target address could not be resolved.
    #[error("failed to resolve {host}")]
    Resolve {
        /// Host name that failed to resolve.
        host: String,
        /// Underlying resolver failure.
        #[source]
        source: Arc<io::Error>,
    },

    /// A listening socket could not be bound.
    #[error("failed to bind {address}")]
    Bind {
        /// Requested listen address.
        address: String,
        /// Underlying I/O failure.
        #[source]
        source: Arc<io::Error>,
    },

    /// The reconnect strategy does not allow any retry.
    #[error("reconnect failed")]
    ReconnectRefused {
        /// The failure that prompted the retry request.
        #[source]
        cause: Box<DispatchError>,
    },

    /// The reconnect strategy used up its attempt budget.
    #[error("maximum reconnection attempts ({attempts}) reached")]
    AttemptsExhausted {
        /// Attempts made before giving up.
        attempts: u64,
        /// The failure that prompted the last retry request.
        #[source]
        cause: Box<DispatchError>,
    },

    /// The reconnect deadline has passed or would be passed by the next wait.
    #[error("reconnection deadline exceeded")]
    DeadlineExceeded {
        /// The failure that prompted the retry request, if any.
        #[source]
        cause: Option<Box<DispatchError>>,
    },

    /// The protocol handshake was rejected or raised an error.
    #[error("session negotiation failed")]
    Negotiation {
        /// Error reported by the negotiator.
        #[source]
        source: SharedError,
    },

    /// The connection closed before the operation could finish.
    #[error("channel closed")]
    ChannelClosed,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,
}

impl DispatchError {
    /// Wraps a connect failure for `address`.
    pub fn connect(address: impl Into<String>, source: io::Error) -> Self {
        DispatchError::Connect {
            address: address.into(),
            source: Arc::new(source),
        }
    }

    /// Wraps a bind failure for `address`.
    pub fn bind(address: impl Into<String>, source: io::Error) -> Self {
        DispatchError::Bind {
            address: address.into(),
            source: Arc::new(source),
        }
    }

    /// Wraps a resolver failure for `host`.
    pub fn resolve(host: impl Into<String>, source: io::Error) -> Self {
        DispatchError::Resolve {
            host: host.into(),
            source: Arc::new(source),
        }
    }

    /// Wraps an error raised by a session negotiator.
    pub fn negotiation(source: impl Into<BoxError>) -> Self {
        DispatchError::Negotiation {
            source: Arc::from(source.into()),
        }
    }

    /// Returns `true` for connect timeouts and exceeded deadlines.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DispatchError::ConnectTimeout { .. } | DispatchError::DeadlineExceeded { .. }
        )
    }

    /// Returns `true` if the retry policy ran out of attempts.
    pub fn is_attempts_exhausted(&self) -> bool {
        matches!(self, DispatchError::AttemptsExhausted { .. })
    }

    /// Returns `true` if the retry policy ran into its deadline.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, DispatchError::DeadlineExceeded { .. })
    }

    /// Returns `true` if retries were not allowed at all.
    pub fn is_reconnect_refused(&self) -> bool {
        matches!(self, DispatchError::ReconnectRefused { .. })
    }

    /// Returns `true` if the handshake failed.
    pub fn is_negotiation(&self) -> bool {
        matches!(self, DispatchError::Negotiation { .. })
    }

    /// Returns `true` if the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }

    /// Follows the `source` chain down to the innermost error.
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut current: &(dyn StdError + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }
}
