//! Negotiated sessions and the application-facing listener contract.

use std::fmt;

use protocol_dispatch_core::DispatchError;
use tokio::sync::mpsc;

/// Queues outbound messages on a connection.
///
/// Messages are written in the order they are queued. Cheap to clone.
pub struct MessageSender<M> {
    tx: mpsc::UnboundedSender<M>,
}

impl<M> MessageSender<M> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<M>) -> Self {
        Self { tx }
    }

    /// Queues `msg` for writing.
    ///
    /// Fails with [`DispatchError::ChannelClosed`] once the connection
    /// driver has stopped.
    pub fn send(&self, msg: M) -> Result<(), DispatchError> {
        self.tx.send(msg).map_err(|_| DispatchError::ChannelClosed)
    }

    /// Returns `true` once the connection driver has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<M> Clone for MessageSender<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> fmt::Debug for MessageSender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// A session produced by successful negotiation.
///
/// The session is handed to the caller through the connection's completion
/// handle and, at the same time, replaces the negotiator on the connection:
/// every later inbound message goes to [`handle_message`]. Implementations
/// are therefore shared handles (typically an `Arc` around the state).
///
/// [`handle_message`]: ProtocolSession::handle_message
pub trait ProtocolSession<M>: Clone + Send + Sync + 'static {
    /// Called once the session took over the connection.
    fn session_up(&self) {}

    /// Handles one inbound message.
    fn handle_message(&self, msg: M);

    /// Called when the inbound side of the connection ended.
    fn end_of_input(&self) {}

    /// Closes the session and its connection.
    fn close(&self);
}

/// Why a session was terminated by one of its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Orderly shutdown requested by the local side.
    Local(String),
    /// Orderly shutdown requested by the remote side.
    Remote(String),
    /// The peer violated the protocol.
    ProtocolError(String),
}

impl TerminationReason {
    /// Human-readable description.
    pub fn description(&self) -> &str {
        match self {
            TerminationReason::Local(reason)
            | TerminationReason::Remote(reason)
            | TerminationReason::ProtocolError(reason) => reason,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Local(reason) => write!(f, "terminated locally: {reason}"),
            TerminationReason::Remote(reason) => write!(f, "terminated by peer: {reason}"),
            TerminationReason::ProtocolError(reason) => write!(f, "protocol error: {reason}"),
        }
    }
}

/// Receives session lifecycle notifications and inbound messages.
///
/// Sessions call these; the dispatcher never does.
pub trait SessionListener<S, M>: Send + Sync + 'static {
    /// The session is established and usable.
    fn on_session_up(&self, session: &S);

    /// The session went down because of `cause` without an orderly
    /// termination.
    fn on_session_down(&self, session: &S, cause: DispatchError);

    /// The session was terminated in an orderly way.
    fn on_session_terminated(&self, session: &S, reason: TerminationReason);

    /// A message arrived on an established session.
    fn on_message(&self, session: &S, msg: M);
}

/// Creates a listener for every new session.
pub trait SessionListenerFactory<S, M>: Send + Sync + 'static {
    /// Listener type handed to sessions.
    type Listener: SessionListener<S, M>;

    /// Creates a listener for a session about to be negotiated.
    fn get_session_listener(&self) -> Self::Listener;
}

impl<S, M, L, F> SessionListenerFactory<S, M> for F
where
    F: Fn() -> L + Send + Sync + 'static,
    L: SessionListener<S, M>,
{
    type Listener = L;

    fn get_session_listener(&self) -> L {
        self()
    }
}
