//! Session negotiation.
//!
//! A protocol implements [`SessionNegotiator`] for its handshake. The
//! surrounding plumbing (reading framed messages, writing replies, resolving
//! the completion handle, handing over to the session, closing on failure)
//! lives in the driver behind [`NegotiatingInitializer`], so negotiators
//! only decide.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use protocol_dispatch_core::{BoxError, DispatchError, Promise};
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelInitializer};
use crate::session::{MessageSender, ProtocolSession};
use crate::transport::BoxIo;

/// Protocol-specific handshake for one connection.
///
/// Errors returned from either method fail the negotiation exactly like
/// [`Negotiation::negotiation_failed`].
pub trait SessionNegotiator<M, S>: Send + 'static {
    /// Called once when the connection becomes active.
    fn start_negotiation(&mut self, cx: &mut Negotiation<M, S>) -> Result<(), BoxError>;

    /// Called for every inbound message until negotiation completes.
    fn handle_message(&mut self, cx: &mut Negotiation<M, S>, msg: M) -> Result<(), BoxError>;
}

/// Creates a negotiator for every new connection.
pub trait SessionNegotiatorFactory<M, S>: Send + Sync + 'static {
    /// Negotiator type installed on connections.
    type Negotiator: SessionNegotiator<M, S>;

    /// Creates the negotiator for `channel`.
    fn get_session_negotiator(&self, channel: &Channel) -> Self::Negotiator;
}

impl<M, S, N, F> SessionNegotiatorFactory<M, S> for F
where
    F: Fn(&Channel) -> N + Send + Sync + 'static,
    N: SessionNegotiator<M, S>,
{
    type Negotiator = N;

    fn get_session_negotiator(&self, channel: &Channel) -> N {
        self(channel)
    }
}

/// Context handed to a negotiator.
///
/// Only the first call to [`negotiation_successful`] or
/// [`negotiation_failed`] counts; later calls are ignored.
///
/// [`negotiation_successful`]: Negotiation::negotiation_successful
/// [`negotiation_failed`]: Negotiation::negotiation_failed
pub struct Negotiation<M, S> {
    channel: Channel,
    sender: MessageSender<M>,
    outcome: Option<Result<S, BoxError>>,
}

impl<M, S> Negotiation<M, S> {
    fn new(channel: Channel, sender: MessageSender<M>) -> Self {
        Self {
            channel,
            sender,
            outcome: None,
        }
    }

    /// Queues a handshake message.
    pub fn send(&self, msg: M) -> Result<(), DispatchError> {
        self.sender.send(msg)
    }

    /// Sender the negotiated session keeps for writing.
    pub fn sender(&self) -> &MessageSender<M> {
        &self.sender
    }

    /// The connection being negotiated.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Completes negotiation with `session`.
    pub fn negotiation_successful(&mut self, session: S) {
        if self.outcome.is_none() {
            self.outcome = Some(Ok(session));
        }
    }

    /// Fails negotiation with `cause`; the connection is closed.
    pub fn negotiation_failed(&mut self, cause: impl Into<BoxError>) {
        if self.outcome.is_none() {
            self.outcome = Some(Err(cause.into()));
        }
    }

    /// Returns `true` once an outcome was recorded.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    fn take_outcome(&mut self) -> Option<Result<S, BoxError>> {
        self.outcome.take()
    }
}

impl<M, S> fmt::Debug for Negotiation<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiation")
            .field("channel", &self.channel)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Channel initializer that frames the stream and runs a negotiator on it.
///
/// `framing` turns the raw stream into a message transport, typically a
/// `tokio_util::codec::Framed`. After successful negotiation the session
/// receives all further inbound messages.
pub struct NegotiatingInitializer<Fr, F> {
    framing: Arc<Fr>,
    factory: Arc<F>,
}

impl<Fr, F> NegotiatingInitializer<Fr, F> {
    /// Combines a framing function with a negotiator factory.
    pub fn new(framing: Fr, factory: F) -> Self {
        Self {
            framing: Arc::new(framing),
            factory: Arc::new(factory),
        }
    }
}

impl<Fr, F> Clone for NegotiatingInitializer<Fr, F> {
    fn clone(&self) -> Self {
        Self {
            framing: Arc::clone(&self.framing),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<Fr, F> fmt::Debug for NegotiatingInitializer<Fr, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatingInitializer").finish_non_exhaustive()
    }
}

impl<M, S, T, E, E2, Fr, F> ChannelInitializer<S> for NegotiatingInitializer<Fr, F>
where
    Fr: Fn(BoxIo) -> T + Send + Sync + 'static,
    T: Stream<Item = Result<M, E>> + Sink<M, Error = E2> + Send + Unpin + 'static,
    E: Into<BoxError> + Send + 'static,
    E2: Into<BoxError> + Send + 'static,
    M: Send + 'static,
    S: ProtocolSession<M>,
    F: SessionNegotiatorFactory<M, S>,
{
    fn init_channel(
        &self,
        channel: Channel,
        io: BoxIo,
        promise: Promise<S>,
    ) -> BoxFuture<'static, ()> {
        let transport = (self.framing)(io);
        let negotiator = self.factory.get_session_negotiator(&channel);
        Box::pin(drive(channel, transport, negotiator, promise))
    }
}

async fn drive<M, S, T, E, E2, N>(
    channel: Channel,
    transport: T,
    mut negotiator: N,
    promise: Promise<S>,
) where
    T: Stream<Item = Result<M, E>> + Sink<M, Error = E2> + Send + Unpin + 'static,
    E: Into<BoxError>,
    E2: Into<BoxError>,
    S: ProtocolSession<M>,
    N: SessionNegotiator<M, S>,
{
    let (mut sink, mut stream) = transport.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut cx = Negotiation::new(channel.clone(), MessageSender::new(tx));

    if let Err(e) = negotiator.start_negotiation(&mut cx) {
        cx.negotiation_failed(e);
    }

    let outcome = loop {
        if let Some(outcome) = cx.take_outcome() {
            break outcome;
        }

        tokio::select! {
            biased;
            Some(msg) = rx.recv() => {
                if let Err(e) = sink.send(msg).await {
                    cx.negotiation_failed(e);
                }
            }
            _ = promise.cancelled() => {
                #[cfg(feature = "tracing")]
                tracing::debug!(channel = channel.id(), "negotiation cancelled, closing");
                return;
            }
            _ = channel.close_requested() => {
                promise.try_failure(DispatchError::ChannelClosed);
                return;
            }
            inbound = stream.next() => match inbound {
                Some(Ok(msg)) => {
                    if let Err(e) = negotiator.handle_message(&mut cx, msg) {
                        cx.negotiation_failed(e);
                    }
                }
                Some(Err(e)) => cx.negotiation_failed(e),
                None => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(channel = channel.id(), "connection dropped during negotiation");
                    promise.try_failure(DispatchError::ChannelClosed);
                    return;
                }
            },
        }
    };
    drop(negotiator);

    let session = match outcome {
        Ok(session) => session,
        Err(cause) => {
            // Let a rejection notice reach the peer before the close.
            while let Ok(msg) = rx.try_recv() {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(channel = channel.id(), error = %cause, "negotiation failed");
            promise.try_failure(DispatchError::negotiation(cause));
            return;
        }
    };

    if !promise.try_success(session.clone()) {
        // Cancelled while the last handshake message was processed.
        session.close();
        return;
    }
    drop(cx);

    #[cfg(feature = "tracing")]
    tracing::debug!(channel = channel.id(), "session established");
    session.session_up();

    loop {
        tokio::select! {
            biased;
            Some(msg) = rx.recv() => {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            _ = channel.close_requested() => break,
            inbound = stream.next() => match inbound {
                Some(Ok(msg)) => session.handle_message(msg),
                Some(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    {
                        let error: BoxError = _e.into();
                        tracing::warn!(channel = channel.id(), error = %error, "inbound decode error, closing session");
                    }
                    break;
                }
                None => break,
            },
        }
    }
    session.end_of_input();
}
