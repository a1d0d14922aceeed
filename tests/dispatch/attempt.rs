//! Connection attempts: retry loop, cancellation and orphan cleanup.

use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use protocol_dispatch::{
    AttemptPhase, BoxIo, Channel, ConnectionAttempt, ConnectionEvent, DispatchError, Dispatcher,
    DispatcherConfig, NeverReconnectStrategy, Promise, ReconnectStrategy, TimedReconnectConfig,
    TimedReconnectStrategy,
};
use tokio::io::{AsyncReadExt, DuplexStream};

use super::common::{
    dispatcher, eventually, start_server, within, Events, Greeting, LineSession, Sessions,
};

fn unreachable_addr() -> SocketAddr {
    "127.0.0.1:9".parse().unwrap()
}

fn refused() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
}

#[tokio::test]
async fn never_strategy_fails_after_the_first_connect_failure() {
    let events = Events::new();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let connector = tower::service_fn(move |_: SocketAddr| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<DuplexStream, _>(refused()) }
    });
    let config = events
        .attach(DispatcherConfig::builder().connector(connector))
        .build();
    let dispatcher = Dispatcher::new(config).unwrap();

    let attempt = dispatcher.create_client(
        unreachable_addr(),
        NeverReconnectStrategy::new(Duration::from_millis(1000)),
        Sessions::new().initializer(Greeting::Accept),
    );

    let err = within(attempt.wait()).await.unwrap_err();
    match err {
        DispatchError::ReconnectRefused { cause } => {
            assert!(matches!(*cause, DispatchError::Connect { .. }));
        }
        other => panic!("expected ReconnectRefused, got {other:?}"),
    }

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(attempt.connects(), 1);
    assert_eq!(attempt.phase(), AttemptPhase::Finished);
    assert_eq!(
        events.count(|e| matches!(e, ConnectionEvent::GaveUp { .. })),
        1
    );
    assert!(!events.any(|e| matches!(e, ConnectionEvent::RetryScheduled { .. })));
}

/// Grants a few retries after a short timer and records whether a retry was
/// outstanding while a connect ran.
struct OverlapCheckingStrategy {
    retries_left: AtomicUsize,
    retry_outstanding: Arc<AtomicBool>,
}

impl ReconnectStrategy for OverlapCheckingStrategy {
    fn connect_timeout(&self) -> Result<Duration, DispatchError> {
        Ok(Duration::from_secs(1))
    }

    fn schedule_reconnect(&self, cause: &DispatchError) -> Promise<()> {
        let left = self.retries_left.load(Ordering::SeqCst);
        if left == 0 {
            return Promise::failed(DispatchError::AttemptsExhausted {
                attempts: 5,
                cause: Box::new(cause.clone()),
            });
        }
        self.retries_left.store(left - 1, Ordering::SeqCst);

        self.retry_outstanding.store(true, Ordering::SeqCst);
        let promise = Promise::new();
        let timer = promise.clone();
        let outstanding = Arc::clone(&self.retry_outstanding);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            outstanding.store(false, Ordering::SeqCst);
            timer.try_success(());
        });
        promise
    }

    fn reconnect_successful(&self) {}
}

#[tokio::test]
async fn connect_and_retry_timer_are_never_pending_together() {
    let retry_outstanding = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let slot: Arc<OnceLock<ConnectionAttempt<LineSession>>> = Arc::new(OnceLock::new());

    let connector = {
        let retry_outstanding = Arc::clone(&retry_outstanding);
        let overlaps = Arc::clone(&overlaps);
        let slot = Arc::clone(&slot);
        tower::service_fn(move |_: SocketAddr| {
            let phase = slot.get().map(|attempt| attempt.phase());
            if retry_outstanding.load(Ordering::SeqCst)
                || phase.is_some_and(|phase| phase != AttemptPhase::Connecting)
            {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            async { Err::<DuplexStream, _>(refused()) }
        })
    };
    let dispatcher =
        Dispatcher::new(DispatcherConfig::builder().connector(connector).build()).unwrap();

    let attempt = dispatcher.create_client(
        unreachable_addr(),
        OverlapCheckingStrategy {
            retries_left: AtomicUsize::new(5),
            retry_outstanding: Arc::clone(&retry_outstanding),
        },
        Sessions::new().initializer(Greeting::Accept),
    );
    let _ = slot.set(attempt.clone());

    let err = within(attempt.wait()).await.unwrap_err();
    assert!(err.is_attempts_exhausted());
    assert_eq!(attempt.connects(), 6);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_during_a_retry_wait_cancels_the_timer() {
    let events = Events::new();
    let dispatcher = dispatcher(&events);

    let config = TimedReconnectConfig::builder()
        .min_sleep(Duration::from_secs(3600))
        .connect_timeout(Duration::from_millis(500))
        .build();
    let strategy = Arc::new(TimedReconnectStrategy::new(config));

    // Bind then drop a listener so the port is closed.
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let attempt = dispatcher.create_client(
        closed_port,
        Arc::clone(&strategy),
        Sessions::new().initializer(Greeting::Accept),
    );

    eventually("retry wait", || attempt.phase() == AttemptPhase::RetryWaiting).await;
    assert!(strategy.is_scheduled());

    assert!(attempt.cancel());
    assert!(attempt.cancel(), "cancel is idempotent");
    assert!(attempt.promise().is_cancelled());

    eventually("timer cleanup", || !strategy.is_scheduled()).await;
    eventually("cancelled event", || {
        events.any(|e| matches!(e, ConnectionEvent::Cancelled { .. }))
    })
    .await;
    assert_eq!(attempt.phase(), AttemptPhase::Finished);
    assert_eq!(attempt.connects(), 1);
}

#[tokio::test]
async fn cancel_during_negotiation_closes_the_connection() {
    let peer: Arc<Mutex<Option<DuplexStream>>> = Arc::new(Mutex::new(None));
    let connector = {
        let peer = Arc::clone(&peer);
        tower::service_fn(move |_: SocketAddr| {
            let (io, remote) = tokio::io::duplex(64);
            *peer.lock().unwrap() = Some(remote);
            async move { Ok::<_, io::Error>(io) }
        })
    };
    let dispatcher =
        Dispatcher::new(DispatcherConfig::builder().connector(connector).build()).unwrap();

    // Holds the stream and never completes the handshake on its own.
    let initializer = |_channel: Channel, io: BoxIo, _promise: Promise<u64>| async move {
        let _io = io;
        tokio::time::sleep(Duration::from_secs(3600)).await;
    };
    let attempt = dispatcher.create_client(
        unreachable_addr(),
        NeverReconnectStrategy::new(Duration::from_secs(1)),
        initializer,
    );

    eventually("negotiating", || attempt.phase() == AttemptPhase::Negotiating).await;
    assert!(attempt.cancel());

    let mut remote = peer.lock().unwrap().take().expect("connector was called");
    let mut buf = [0u8; 8];
    let n = within(remote.read(&mut buf)).await.unwrap();
    assert_eq!(n, 0, "connection must be closed once the attempt is cancelled");
    eventually("finished", || attempt.phase() == AttemptPhase::Finished).await;
}

#[tokio::test]
async fn strategy_listener_may_cancel_the_attempt() {
    let slot: Arc<OnceLock<ConnectionAttempt<LineSession>>> = Arc::new(OnceLock::new());
    let connector =
        tower::service_fn(|_: SocketAddr| async { Err::<DuplexStream, _>(refused()) });
    let dispatcher =
        Dispatcher::new(DispatcherConfig::builder().connector(connector).build()).unwrap();

    let config = {
        let slot = Arc::clone(&slot);
        TimedReconnectConfig::builder()
            .min_sleep(Duration::from_millis(10))
            .on_scheduled(move |_, _| {
                if let Some(attempt) = slot.get() {
                    attempt.cancel();
                    // Inspecting the attempt from a listener must not block.
                    let _ = attempt.phase();
                }
            })
            .build()
    };
    let strategy = Arc::new(TimedReconnectStrategy::new(config));

    let attempt = dispatcher.create_client(
        unreachable_addr(),
        Arc::clone(&strategy),
        Sessions::new().initializer(Greeting::Accept),
    );
    let _ = slot.set(attempt.clone());

    let err = within(attempt.wait()).await.unwrap_err();
    assert!(err.is_cancelled());
    eventually("finished", || attempt.phase() == AttemptPhase::Finished).await;
    eventually("timer cleanup", || !strategy.is_scheduled()).await;
    assert_eq!(attempt.connects(), 1);
}

#[tokio::test]
async fn connect_completing_after_cancel_is_closed() {
    let events = Events::new();
    let slot: Arc<OnceLock<ConnectionAttempt<LineSession>>> = Arc::new(OnceLock::new());
    let peer: Arc<Mutex<Option<DuplexStream>>> = Arc::new(Mutex::new(None));

    let connector = {
        let slot = Arc::clone(&slot);
        let peer = Arc::clone(&peer);
        tower::service_fn(move |_: SocketAddr| {
            // The caller gives up while the connect is in flight.
            if let Some(attempt) = slot.get() {
                attempt.cancel();
            }
            let (io, remote) = tokio::io::duplex(64);
            *peer.lock().unwrap() = Some(remote);
            async move { Ok::<_, io::Error>(io) }
        })
    };
    let config = events
        .attach(DispatcherConfig::builder().connector(connector))
        .build();
    let dispatcher = Dispatcher::new(config).unwrap();

    let attempt = dispatcher.create_client(
        unreachable_addr(),
        NeverReconnectStrategy::new(Duration::from_secs(1)),
        Sessions::new().initializer(Greeting::Accept),
    );
    let _ = slot.set(attempt.clone());

    eventually("orphan cleanup", || {
        events.any(|e| matches!(e, ConnectionEvent::OrphanClosed { .. }))
    })
    .await;

    assert!(attempt.promise().is_cancelled());
    assert!(!attempt.promise().is_success());
    assert!(!events.any(|e| matches!(e, ConnectionEvent::Connected { .. })));

    let mut remote = peer.lock().unwrap().take().expect("connector was called");
    let mut buf = [0u8; 8];
    let n = within(remote.read(&mut buf)).await.unwrap();
    assert_eq!(n, 0, "orphaned connection must be closed");
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_counts_as_a_failed_connect() {
    let connector = tower::service_fn(|_: SocketAddr| {
        futures::future::pending::<Result<DuplexStream, io::Error>>()
    });
    let dispatcher =
        Dispatcher::new(DispatcherConfig::builder().connector(connector).build()).unwrap();

    let attempt = dispatcher.create_client(
        unreachable_addr(),
        NeverReconnectStrategy::new(Duration::from_millis(50)),
        Sessions::new().initializer(Greeting::Accept),
    );

    match attempt.wait().await.unwrap_err() {
        DispatchError::ReconnectRefused { cause } => {
            assert!(cause.is_timeout());
        }
        other => panic!("expected ReconnectRefused, got {other:?}"),
    }
}

#[tokio::test]
async fn connects_and_negotiates_over_tcp() {
    let events = Events::new();
    let dispatcher = dispatcher(&events);
    let server_sessions = Sessions::new();
    let server = start_server(&dispatcher, &server_sessions, Greeting::Accept).await;

    let attempt = dispatcher.create_client(
        server.local_addr(),
        NeverReconnectStrategy::new(Duration::from_secs(1)),
        Sessions::new().initializer(Greeting::Accept),
    );

    let session = within(attempt.clone().into_future()).await.unwrap();
    assert_eq!(session.channel.peer_addr(), server.local_addr());
    assert_eq!(attempt.phase(), AttemptPhase::Finished);
    assert!(!attempt.cancel(), "an established session is not cancelled");

    session.sender.send("ping".to_string()).unwrap();
    eventually("server receives ping", || {
        server_sessions
            .all()
            .iter()
            .any(|s| s.received() == vec!["ping".to_string()])
    })
    .await;

    // Client side and server side.
    eventually("both sessions reported", || {
        events.count(|e| matches!(e, ConnectionEvent::SessionEstablished { .. })) == 2
    })
    .await;
}

#[tokio::test]
async fn rejected_negotiation_fails_the_attempt() {
    let events = Events::new();
    let dispatcher = dispatcher(&events);
    let server = start_server(&dispatcher, &Sessions::new(), Greeting::Reject).await;

    let attempt = dispatcher.create_client(
        server.local_addr(),
        NeverReconnectStrategy::new(Duration::from_secs(1)),
        Sessions::new().initializer(Greeting::Accept),
    );

    let err = within(attempt.wait()).await.unwrap_err();
    assert!(err.is_negotiation());
    assert!(err.root_cause().to_string().contains("rejected by peer"));

    eventually("negotiation failure event", || {
        events.any(|e| matches!(e, ConnectionEvent::NegotiationFailed { .. }))
    })
    .await;
    assert!(!events.any(|e| matches!(e, ConnectionEvent::GaveUp { .. })));
}

#[tokio::test]
async fn unresolved_addresses_are_resolved_per_connect() {
    let dispatcher = dispatcher(&Events::new());
    let server = start_server(&dispatcher, &Sessions::new(), Greeting::Accept).await;

    let attempt = dispatcher.create_client(
        protocol_dispatch::Address::unresolved("127.0.0.1", server.local_addr().port()),
        NeverReconnectStrategy::new(Duration::from_secs(1)),
        Sessions::new().initializer(Greeting::Accept),
    );

    assert!(attempt.address().is_unresolved());
    let session = within(attempt.wait()).await.unwrap();
    assert_eq!(session.channel.peer_addr().port(), server.local_addr().port());
}

#[tokio::test]
async fn address_lookup_is_bounded_by_the_connect_timeout() {
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connects);
    let connector = tower::service_fn(move |_: SocketAddr| {
        counter.fetch_add(1, Ordering::SeqCst);
        let (io, _peer) = tokio::io::duplex(64);
        async move { Ok::<_, io::Error>(io) }
    });
    let dispatcher =
        Dispatcher::new(DispatcherConfig::builder().connector(connector).build()).unwrap();

    // A lookup goes through the blocking pool, so it cannot finish before a
    // zero timeout expires.
    let attempt = dispatcher.create_client(
        protocol_dispatch::Address::unresolved("localhost", 830),
        NeverReconnectStrategy::new(Duration::ZERO),
        Sessions::new().initializer(Greeting::Accept),
    );

    match within(attempt.wait()).await.unwrap_err() {
        DispatchError::ReconnectRefused { cause } => {
            assert!(
                matches!(*cause, DispatchError::ConnectTimeout { .. }),
                "unexpected cause {cause:?}"
            );
        }
        other => panic!("expected ReconnectRefused, got {other:?}"),
    }
    assert_eq!(connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn timed_strategy_retries_until_the_connect_succeeds() {
    let events = Events::new();
    let server_dispatcher = dispatcher(&Events::new());
    let server = start_server(&server_dispatcher, &Sessions::new(), Greeting::Accept).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let connector = {
        let calls = Arc::clone(&calls);
        tower::service_fn(move |addr: SocketAddr| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(refused())
                } else {
                    tokio::net::TcpStream::connect(addr).await
                }
            }
        })
    };
    let config = events
        .attach(DispatcherConfig::builder().connector(connector))
        .build();
    let dispatcher = Dispatcher::new(config).unwrap();

    let strategy = Arc::new(TimedReconnectStrategy::new(
        TimedReconnectConfig::builder()
            .min_sleep(Duration::from_millis(10))
            .sleep_factor(2.0)
            .max_attempts(5)
            .connect_timeout(Duration::from_secs(1))
            .build(),
    ));

    let attempt = dispatcher.create_client(
        server.local_addr(),
        Arc::clone(&strategy),
        Sessions::new().initializer(Greeting::Accept),
    );

    within(attempt.wait()).await.unwrap();
    assert_eq!(attempt.connects(), 3);
    assert_eq!(
        events.count(|e| matches!(e, ConnectionEvent::RetryScheduled { .. })),
        2
    );
    eventually("strategy reset", || strategy.attempts() == 0).await;
    assert_eq!(strategy.last_sleep(), Duration::from_millis(20));
}
