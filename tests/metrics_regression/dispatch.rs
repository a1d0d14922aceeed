//! Dispatcher metrics regression tests

use super::helpers::*;
use protocol_dispatch::{
    factory_fn, BoxError, BoxIo, Channel, Dispatcher, DispatcherConfig, MessageSender,
    NegotiatingInitializer, Negotiation, NeverReconnectStrategy, ProtocolSession,
    ReconnectImmediatelyStrategy, SessionNegotiator,
};
use serial_test::serial;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::codec::{Framed, LinesCodec};

#[derive(Debug, Clone)]
struct Session {
    channel: Channel,
    _sender: MessageSender<String>,
}

impl ProtocolSession<String> for Session {
    fn handle_message(&self, _msg: String) {}

    fn close(&self) {
        self.channel.close();
    }
}

struct Hello {
    sessions: Arc<Mutex<Vec<Session>>>,
}

impl SessionNegotiator<String, Session> for Hello {
    fn start_negotiation(&mut self, cx: &mut Negotiation<String, Session>) -> Result<(), BoxError> {
        cx.send("HELLO".to_string())?;
        Ok(())
    }

    fn handle_message(
        &mut self,
        cx: &mut Negotiation<String, Session>,
        msg: String,
    ) -> Result<(), BoxError> {
        if msg != "HELLO" {
            return Err("unexpected greeting".into());
        }
        let session = Session {
            channel: cx.channel().clone(),
            _sender: cx.sender().clone(),
        };
        self.sessions.lock().unwrap().push(session.clone());
        cx.negotiation_successful(session);
        Ok(())
    }
}

fn hello(sessions: Arc<Mutex<Vec<Session>>>) -> NegotiatingInitializer<
    impl Fn(BoxIo) -> Framed<BoxIo, LinesCodec> + Send + Sync + 'static,
    impl Fn(&Channel) -> Hello + Send + Sync + 'static,
> {
    NegotiatingInitializer::new(
        |io: BoxIo| Framed::new(io, LinesCodec::new()),
        move |_: &Channel| Hello {
            sessions: Arc::clone(&sessions),
        },
    )
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
#[serial]
async fn dispatch_metrics_exist() {
    init_recorder();

    let dispatcher =
        Dispatcher::new(DispatcherConfig::builder().name("metrics_dispatch").build()).unwrap();

    let server_sessions = Arc::new(Mutex::new(Vec::new()));
    let server = dispatcher
        .create_server(
            "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
            hello(Arc::clone(&server_sessions)),
        )
        .wait()
        .await
        .unwrap();

    let client = dispatcher.create_reconnecting_client(
        server.local_addr(),
        factory_fn(|| ReconnectImmediatelyStrategy::new(Duration::from_secs(1))),
        hello(Arc::new(Mutex::new(Vec::new()))),
    );
    client.session().await.unwrap();

    // Drop the session so the supervisor starts a second incarnation.
    eventually(|| !server_sessions.lock().unwrap().is_empty()).await;
    for session in server_sessions.lock().unwrap().iter() {
        session.close();
    }
    eventually(|| client.incarnation() == 2).await;
    client.session().await.unwrap();
    client.cancel();

    // A refused connect.
    let closed_port: SocketAddr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let refused = dispatcher.create_client(
        closed_port,
        NeverReconnectStrategy::new(Duration::from_millis(500)),
        hello(Arc::new(Mutex::new(Vec::new()))),
    );
    assert!(refused.wait().await.is_err());

    for name in [
        "dispatch_connect_attempts_total",
        "dispatch_connect_failures_total",
        "dispatch_sessions_established_total",
        "dispatch_accepted_total",
        "dispatch_reconnections_total",
    ] {
        assert_counter_exists(name);
        assert_metric_has_label(name, "name", "metrics_dispatch");
    }
}
