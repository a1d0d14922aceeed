use std::sync::Arc;
use std::time::Duration;

use protocol_dispatch::{
    factory_fn, DispatchError, NeverReconnectStrategy, ReconnectImmediatelyStrategy,
    ReconnectStrategy, ReconnectStrategyFactory,
};

#[test]
fn never_refuses_every_retry_with_the_original_cause() {
    let strategy = NeverReconnectStrategy::new(Duration::from_millis(1000));
    assert_eq!(strategy.connect_timeout().unwrap(), Duration::from_millis(1000));

    for _ in 0..3 {
        let refused = strategy.schedule_reconnect(&DispatchError::ChannelClosed);
        assert!(refused.is_done());
        match refused.cause() {
            Some(DispatchError::ReconnectRefused { cause }) => {
                assert!(matches!(*cause, DispatchError::ChannelClosed));
            }
            other => panic!("expected ReconnectRefused, got {other:?}"),
        }
    }
}

#[test]
fn immediate_grants_every_retry_at_once() {
    let strategy = ReconnectImmediatelyStrategy::new(Duration::from_millis(250));
    for _ in 0..10 {
        assert!(strategy
            .schedule_reconnect(&DispatchError::ChannelClosed)
            .is_success());
    }
    strategy.reconnect_successful();
    assert_eq!(strategy.connect_timeout().unwrap(), Duration::from_millis(250));
}

#[test]
fn shared_strategies_delegate() {
    let strategy: Arc<dyn ReconnectStrategy> =
        Arc::new(ReconnectImmediatelyStrategy::new(Duration::from_secs(3)));
    let shared = Arc::clone(&strategy);
    assert_eq!(shared.connect_timeout().unwrap(), Duration::from_secs(3));
    assert!(shared
        .schedule_reconnect(&DispatchError::Cancelled)
        .is_success());
}

#[test]
fn factories_hand_out_fresh_instances() {
    let factory = factory_fn(|| NeverReconnectStrategy::new(Duration::from_millis(700)));
    let a = factory.create_reconnect_strategy();
    let b = factory.create_reconnect_strategy();
    assert_eq!(a.connect_timeout().unwrap(), Duration::from_millis(700));
    assert_eq!(b.connect_timeout().unwrap(), Duration::from_millis(700));

    let shared: Arc<dyn ReconnectStrategyFactory> =
        Arc::new(ReconnectImmediatelyStrategy::new(Duration::from_secs(1)));
    assert!(shared
        .create_reconnect_strategy()
        .schedule_reconnect(&DispatchError::ChannelClosed)
        .is_success());
}
