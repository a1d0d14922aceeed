//! Dispatcher lifecycle: servers, execution contexts and shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use protocol_dispatch::{
    ConnectionEvent, DispatchError, Dispatcher, DispatcherConfig, NeverReconnectStrategy,
    TimedReconnectConfig, TimedReconnectStrategy,
};

use super::common::{dispatcher, eventually, start_server, within, Events, Greeting, Sessions};

#[tokio::test]
async fn server_reports_bind_and_accepts() {
    let events = Events::new();
    let dispatcher = dispatcher(&events);
    let server_sessions = Sessions::new();
    let server = start_server(&dispatcher, &server_sessions, Greeting::Accept).await;

    assert_ne!(server.local_addr().port(), 0);
    let bound = server.local_addr();
    eventually("bound event", || {
        events.any(|e| matches!(
            e,
            ConnectionEvent::ServerBound { local_addr, .. } if *local_addr == bound
        ))
    })
    .await;

    for _ in 0..3 {
        let attempt = dispatcher.create_client(
            server.local_addr(),
            NeverReconnectStrategy::new(Duration::from_secs(1)),
            Sessions::new().initializer(Greeting::Accept),
        );
        within(attempt.wait()).await.unwrap();
    }

    eventually("three server sessions", || server_sessions.len() == 3).await;
    assert_eq!(
        events.count(|e| matches!(e, ConnectionEvent::Accepted { .. })),
        3
    );

    server.close();
    assert!(server.is_closed());
}

#[tokio::test]
async fn bind_conflict_fails_the_server_handle() {
    let dispatcher = dispatcher(&Events::new());
    let first = start_server(&dispatcher, &Sessions::new(), Greeting::Accept).await;

    let second = dispatcher.create_server(
        first.local_addr(),
        Sessions::new().initializer(Greeting::Accept),
    );
    match within(second.wait()).await.unwrap_err() {
        DispatchError::Bind { address, .. } => {
            assert_eq!(address, first.local_addr().to_string());
        }
        other => panic!("expected a bind failure, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_a_session_runs_channel_close_listeners() {
    let events = Events::new();
    let dispatcher = dispatcher(&events);
    let server_sessions = Sessions::new();
    let server = start_server(&dispatcher, &server_sessions, Greeting::Accept).await;

    let session = within(
        dispatcher
            .create_client(
                server.local_addr(),
                NeverReconnectStrategy::new(Duration::from_secs(1)),
                Sessions::new().initializer(Greeting::Accept),
            )
            .wait(),
    )
    .await
    .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    session.channel.on_close(move |channel| {
        let _ = tx.send(channel.id());
    });

    session.channel.close();
    assert_eq!(within(rx).await.unwrap(), session.channel.id());
    within(session.channel.closed()).await;

    eventually("server side closed", || {
        server_sessions.all().iter().all(|s| !s.channel.is_open())
    })
    .await;
    assert!(events.count(|e| matches!(e, ConnectionEvent::ChannelClosed { .. })) >= 1);
}

#[tokio::test]
async fn shutdown_rejects_new_work_and_fails_pending_attempts() {
    let events = Events::new();
    let dispatcher = dispatcher(&events);
    let closed_port: SocketAddr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let config = TimedReconnectConfig::builder()
        .min_sleep(Duration::from_secs(3600))
        .connect_timeout(Duration::from_millis(500))
        .build();
    let pending = dispatcher.create_client(
        closed_port,
        TimedReconnectStrategy::new(config),
        Sessions::new().initializer(Greeting::Accept),
    );
    eventually("retry scheduled", || {
        events.any(|e| matches!(e, ConnectionEvent::RetryScheduled { .. }))
    })
    .await;

    dispatcher.shutdown();
    dispatcher.shutdown();
    assert!(dispatcher.is_shutdown());

    assert!(matches!(
        within(pending.wait()).await,
        Err(DispatchError::Shutdown)
    ));

    let late = dispatcher.create_client(
        closed_port,
        NeverReconnectStrategy::new(Duration::from_secs(1)),
        Sessions::new().initializer(Greeting::Accept),
    );
    assert!(matches!(late.promise().cause(), Some(DispatchError::Shutdown)));

    let server = dispatcher.create_server(
        "127.0.0.1:0".parse().unwrap(),
        Sessions::new().initializer(Greeting::Accept),
    );
    assert!(matches!(server.cause(), Some(DispatchError::Shutdown)));
}

#[tokio::test]
async fn owned_worker_runtime_drives_connections() {
    let events = Events::new();
    let config = events
        .attach(
            DispatcherConfig::builder()
                .name("owned")
                .worker_threads(2),
        )
        .build();
    let dispatcher = Dispatcher::new(config).unwrap();
    assert_eq!(dispatcher.name(), "owned");

    let server_sessions = Sessions::new();
    let server = start_server(&dispatcher, &server_sessions, Greeting::Accept).await;

    let session = within(
        dispatcher
            .create_client(
                server.local_addr(),
                NeverReconnectStrategy::new(Duration::from_secs(1)),
                Sessions::new().initializer(Greeting::Accept),
            )
            .wait(),
    )
    .await
    .unwrap();

    session.sender.send("over the worker".to_string()).unwrap();
    eventually("server receives", || {
        server_sessions
            .all()
            .iter()
            .any(|s| s.received() == vec!["over the worker".to_string()])
    })
    .await;

    dispatcher.shutdown();
}

#[test]
fn new_outside_a_runtime_needs_a_context() {
    let err = Dispatcher::new(DispatcherConfig::builder().build()).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Other);

    let owned = Dispatcher::new(DispatcherConfig::builder().worker_threads(1).build()).unwrap();
    owned.shutdown();
}
