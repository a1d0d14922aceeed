//! Client/server bootstrap with session negotiation and automatic
//! reconnection.
//!
//! A [`Dispatcher`] opens servers and clients for a message-oriented
//! protocol. Every new connection is handed to a [`ChannelInitializer`],
//! usually a [`NegotiatingInitializer`] that frames the byte stream and runs
//! the protocol's [`SessionNegotiator`]. Once the handshake succeeds, the
//! connection's completion handle resolves with the protocol session.
//!
//! Clients come in two flavors:
//!
//! - [`Dispatcher::create_client`] connects once, retrying failed connects
//!   as its [`ReconnectStrategy`] allows, and yields a [`ConnectionAttempt`]
//! - [`Dispatcher::create_reconnecting_client`] additionally starts over
//!   whenever an established session drops, with a fresh strategy from a
//!   [`ReconnectStrategyFactory`], and yields a [`ReconnectSupervisor`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use protocol_dispatch::{
//!     BoxError, BoxIo, Channel, Dispatcher, DispatcherConfig, MessageSender,
//!     NegotiatingInitializer, Negotiation, ProtocolSession, SessionNegotiator,
//!     TimedReconnectConfig, TimedReconnectStrategyFactory,
//! };
//! use std::time::Duration;
//! use tokio_util::codec::{Framed, LinesCodec};
//!
//! #[derive(Clone)]
//! struct Session {
//!     channel: Channel,
//!     sender: MessageSender<String>,
//! }
//!
//! impl ProtocolSession<String> for Session {
//!     fn handle_message(&self, msg: String) {
//!         let _ = self.sender.send(format!("ack {msg}"));
//!     }
//!
//!     fn close(&self) {
//!         self.channel.close();
//!     }
//! }
//!
//! struct Hello;
//!
//! impl SessionNegotiator<String, Session> for Hello {
//!     fn start_negotiation(&mut self, cx: &mut Negotiation<String, Session>) -> Result<(), BoxError> {
//!         cx.send("HELLO".to_string())?;
//!         Ok(())
//!     }
//!
//!     fn handle_message(
//!         &mut self,
//!         cx: &mut Negotiation<String, Session>,
//!         msg: String,
//!     ) -> Result<(), BoxError> {
//!         if msg != "HELLO" {
//!             return Err(format!("unexpected greeting {msg:?}").into());
//!         }
//!         let session = Session {
//!             channel: cx.channel().clone(),
//!             sender: cx.sender().clone(),
//!         };
//!         cx.negotiation_successful(session);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::new(DispatcherConfig::builder().name("hello").build())?;
//!
//! let initializer = NegotiatingInitializer::new(
//!     |io: BoxIo| Framed::new(io, LinesCodec::new()),
//!     |_: &Channel| Hello,
//! );
//!
//! let reconnect = TimedReconnectConfig::builder()
//!     .min_sleep(Duration::from_millis(100))
//!     .max_sleep(Duration::from_secs(5))
//!     .connect_timeout(Duration::from_secs(2))
//!     .build();
//!
//! let client = dispatcher.create_reconnecting_client(
//!     "127.0.0.1:4000".parse::<std::net::SocketAddr>()?,
//!     TimedReconnectStrategyFactory::new(reconnect),
//!     initializer,
//! );
//!
//! let session = client.session().await?;
//! session.sender.send("ping".to_string())?;
//!
//! client.cancel();
//! dispatcher.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Execution contexts
//!
//! Accept loops run on the acceptor context; connects, connection drivers
//! and backoff timers run on the worker context. Both default to the tokio
//! runtime current when the dispatcher is created. See
//! [`DispatcherConfigBuilder`].
//!
//! # Feature flags
//!
//! - `metrics`: counters for connects, sessions, negotiation failures,
//!   orphaned connections and reconnections
//! - `tracing`: structured log lines for connection lifecycle decisions

mod attempt;
mod channel;
mod config;
mod dispatcher;
mod events;
mod negotiator;
mod session;
mod supervisor;
mod transport;

pub use attempt::{AttemptPhase, ConnectionAttempt};
pub use channel::{Channel, ChannelInitializer, ClosedObserver};
pub use config::{DispatcherConfig, DispatcherConfigBuilder};
pub use dispatcher::{Dispatcher, ServerHandle};
pub use events::ConnectionEvent;
pub use negotiator::{
    NegotiatingInitializer, Negotiation, SessionNegotiator, SessionNegotiatorFactory,
};
pub use session::{
    MessageSender, ProtocolSession, SessionListener, SessionListenerFactory, TerminationReason,
};
pub use supervisor::ReconnectSupervisor;
pub use transport::{Address, AsyncIo, BoxIo, Connector, TcpConnector};

pub use protocol_dispatch_core::{BoxError, DispatchError, Promise};
pub use protocol_dispatch_reconnect::{
    factory_fn, NeverReconnectStrategy, ReconnectEvent, ReconnectImmediatelyStrategy,
    ReconnectStrategy, ReconnectStrategyFactory, TimedReconnectConfig,
    TimedReconnectConfigBuilder, TimedReconnectStrategy, TimedReconnectStrategyFactory,
};
