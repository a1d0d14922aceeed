//! Reconnect strategy metrics regression tests

use super::helpers::*;
use protocol_dispatch::{
    DispatchError, ReconnectStrategy, TimedReconnectConfig, TimedReconnectStrategy,
};
use serial_test::serial;
use std::time::Duration;

#[tokio::test(start_paused = true)]
#[serial]
async fn timed_strategy_metrics_exist() {
    init_recorder();

    let config = TimedReconnectConfig::builder()
        .name("metrics_upstream")
        .min_sleep(Duration::from_millis(10))
        .max_attempts(1)
        .build();
    let strategy = TimedReconnectStrategy::new(config);

    // One granted retry, then exhaustion.
    strategy
        .schedule_reconnect(&DispatchError::ChannelClosed)
        .wait()
        .await
        .unwrap();
    assert!(strategy
        .schedule_reconnect(&DispatchError::ChannelClosed)
        .cause()
        .is_some());

    assert_counter_exists("reconnect_scheduled_total");
    assert_metric_has_label("reconnect_scheduled_total", "name", "metrics_upstream");

    assert_histogram_exists("reconnect_delay_seconds");
    assert_metric_has_label("reconnect_delay_seconds", "name", "metrics_upstream");

    assert_counter_exists("reconnect_exhausted_total");
    assert_metric_has_label("reconnect_exhausted_total", "name", "metrics_upstream");
}
