use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol_dispatch::{
    BoxError, BoxIo, Channel, ConnectionEvent, Dispatcher, DispatcherConfig, MessageSender,
    NegotiatingInitializer, Negotiation, ProtocolSession, SessionNegotiator,
    TimedReconnectConfig, TimedReconnectStrategyFactory,
};
use tokio_util::codec::{Framed, LinesCodec};

/// Example of a line-based protocol with a version handshake.
///
/// Both peers greet with `HELLO <version>`; a session is established once the
/// greeting of the other side arrived. The server drops its sessions after a
/// while and the reconnecting client comes back on its own.
#[derive(Clone)]
struct LineSession {
    role: &'static str,
    channel: Channel,
    sender: MessageSender<String>,
}

impl ProtocolSession<String> for LineSession {
    fn session_up(&self) {
        println!("[{}] session up on channel {}", self.role, self.channel.id());
    }

    fn handle_message(&self, msg: String) {
        println!("[{}] received {msg:?}", self.role);
        if let Some(body) = msg.strip_prefix("PING ") {
            let _ = self.sender.send(format!("PONG {body}"));
        }
    }

    fn end_of_input(&self) {
        println!("[{}] peer hung up", self.role);
    }

    fn close(&self) {
        self.channel.close();
    }
}

struct HelloNegotiator {
    role: &'static str,
    sessions: Arc<Mutex<Vec<LineSession>>>,
}

impl SessionNegotiator<String, LineSession> for HelloNegotiator {
    fn start_negotiation(
        &mut self,
        cx: &mut Negotiation<String, LineSession>,
    ) -> Result<(), BoxError> {
        cx.send("HELLO 1".to_string())?;
        Ok(())
    }

    fn handle_message(
        &mut self,
        cx: &mut Negotiation<String, LineSession>,
        msg: String,
    ) -> Result<(), BoxError> {
        let version = msg
            .strip_prefix("HELLO ")
            .ok_or_else(|| format!("expected a greeting, got {msg:?}"))?;
        if version != "1" {
            cx.negotiation_failed(format!("unsupported version {version}"));
            return Ok(());
        }

        let session = LineSession {
            role: self.role,
            channel: cx.channel().clone(),
            sender: cx.sender().clone(),
        };
        self.sessions.lock().unwrap().push(session.clone());
        cx.negotiation_successful(session);
        Ok(())
    }
}

fn hello_initializer(
    role: &'static str,
    sessions: Arc<Mutex<Vec<LineSession>>>,
) -> NegotiatingInitializer<
    impl Fn(BoxIo) -> Framed<BoxIo, LinesCodec> + Send + Sync + 'static,
    impl Fn(&Channel) -> HelloNegotiator + Send + Sync + 'static,
> {
    NegotiatingInitializer::new(
        |io: BoxIo| Framed::new(io, LinesCodec::new()),
        move |_: &Channel| HelloNegotiator {
            role,
            sessions: Arc::clone(&sessions),
        },
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .init();

    println!("Line protocol - server and reconnecting client\n");

    let config = DispatcherConfig::builder()
        .name("line-protocol")
        .on_event(|event| match event {
            ConnectionEvent::Reincarnation { incarnation, .. } => {
                println!("[events] starting incarnation {incarnation}");
            }
            ConnectionEvent::RetryScheduled { address, .. } => {
                println!("[events] retry scheduled for {address}");
            }
            _ => {}
        })
        .on_session_established(|address| println!("[events] session established with {address}"))
        .on_give_up(|address, error| println!("[events] gave up on {address}: {error}"))
        .build();
    let dispatcher = Dispatcher::new(config)?;

    let server_sessions = Arc::new(Mutex::new(Vec::new()));
    let server = dispatcher
        .create_server(
            "127.0.0.1:0".parse::<SocketAddr>()?,
            hello_initializer("server", Arc::clone(&server_sessions)),
        )
        .wait()
        .await?;
    println!("server listening on {}\n", server.local_addr());

    let reconnect = TimedReconnectConfig::builder()
        .name("line-client")
        .min_sleep(Duration::from_millis(100))
        .sleep_factor(2.0)
        .max_sleep(Duration::from_secs(2))
        .max_attempts(10)
        .connect_timeout(Duration::from_secs(1))
        .build();

    let client = dispatcher.create_reconnecting_client(
        server.local_addr(),
        TimedReconnectStrategyFactory::new(reconnect),
        hello_initializer("client", Arc::new(Mutex::new(Vec::new()))),
    );

    for round in 1..=3 {
        let session = client.session().await?;
        session.sender.send(format!("PING {round}"))?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        println!("\nserver drops its sessions (round {round})\n");
        for session in server_sessions.lock().unwrap().drain(..) {
            session.close();
        }

        // Give the supervisor time to notice and start the next incarnation.
        while client.incarnation() <= round {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    println!("\nincarnations started: {}", client.incarnation());

    client.cancel();
    server.close();
    dispatcher.shutdown();
    Ok(())
}
