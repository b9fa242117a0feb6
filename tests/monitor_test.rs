//! Connection monitor behaviour against the scripted mock device.

use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use vent_harness::config::HarnessConfig;
use vent_harness::connection::{ConnectionMonitor, ConnectionState, MonitorSettings};
use vent_harness::error::HarnessError;
use vent_harness::serial::mock::{MockPortOpener, Reply, ScriptedDevice};

fn settings() -> MonitorSettings {
    let mut config = HarnessConfig::default();
    config.probe.retry_budget = 3;
    config.probe.response_window = Duration::from_secs(1);
    config.probe.reconnect_delay = Duration::from_millis(200);
    config.probe.clear_interval = Duration::from_secs(20);
    MonitorSettings::from_config(&config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn connects_when_probe_is_answered() {
    let opener = MockPortOpener::new(ScriptedDevice::responsive());
    let monitor = ConnectionMonitor::spawn(Arc::new(opener.clone()), settings());

    assert_ok!(monitor.wait_connected(Duration::from_secs(5)).await);
    assert_eq!(monitor.state(), ConnectionState::Connected);
    assert_eq!(opener.count_of("time_tick"), 1);

    monitor.shutdown().await;
    assert_eq!(monitor.state(), ConnectionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn probe_retries_within_budget() {
    let device = ScriptedDevice::responsive()
        .once("time_tick", Reply::Silent)
        .once("time_tick", Reply::Lines(vec![">".into(), "".into()]));
    let opener = MockPortOpener::new(device);
    let monitor = ConnectionMonitor::spawn(Arc::new(opener.clone()), settings());

    assert_ok!(monitor.wait_connected(Duration::from_secs(10)).await);
    assert_eq!(opener.count_of("time_tick"), 3);
    assert_eq!(opener.open_count(), 1);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_starts_a_new_cycle() {
    let device = ScriptedDevice::responsive()
        .once("time_tick", Reply::Silent)
        .once("time_tick", Reply::Silent)
        .once("time_tick", Reply::Silent);
    let opener = MockPortOpener::new(device);
    let monitor = ConnectionMonitor::spawn(Arc::new(opener.clone()), settings());

    let mut states = monitor.subscribe();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            seen.push(state);
            if state == ConnectionState::Connected {
                break;
            }
        }
        seen
    });

    // Fourth probe, on a freshly opened port, succeeds
    assert_ok!(monitor.wait_connected(Duration::from_secs(10)).await);
    assert_eq!(opener.open_count(), 2);
    assert_eq!(opener.count_of("time_tick"), 4);

    let seen = recorder.await.unwrap();
    assert!(seen.contains(&ConnectionState::Disconnected));
    assert_eq!(seen.last(), Some(&ConnectionState::Connected));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn probe_reply_must_start_with_the_pattern() {
    let device = ScriptedDevice::new().respond("time_tick", ["nack: expected [time_tick+ok]"]);
    let opener = MockPortOpener::new(device);
    let monitor = ConnectionMonitor::spawn(Arc::new(opener.clone()), settings());

    let err = assert_err!(monitor.wait_connected(Duration::from_secs(10)).await);
    assert!(matches!(err, HarnessError::Timeout(_)));
    assert_ne!(monitor.state(), ConnectionState::Connected);
    assert!(opener.count_of("time_tick") >= 3);
    assert!(monitor.console().contains("nack: expected"));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_open_is_retried() {
    let opener = MockPortOpener::new(ScriptedDevice::responsive().fail_opens(2));
    let monitor = ConnectionMonitor::spawn(Arc::new(opener.clone()), settings());

    assert_ok!(monitor.wait_connected(Duration::from_secs(10)).await);
    assert_eq!(opener.open_count(), 3);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn wait_connected_times_out_on_a_dead_device() {
    let opener = MockPortOpener::new(ScriptedDevice::new());
    let monitor = ConnectionMonitor::spawn(Arc::new(opener), settings());

    let err = assert_err!(monitor.wait_connected(Duration::from_secs(2)).await);
    assert!(matches!(err, HarnessError::Timeout(_)));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn serves_commands_and_skips_prompts() {
    let device = ScriptedDevice::responsive()
        .respond("sn_get", [">", "[sn_get+ok] 1212324500026"]);
    let opener = MockPortOpener::new(device);
    let monitor = ConnectionMonitor::spawn(Arc::new(opener), settings());
    monitor.wait_connected(Duration::from_secs(5)).await.unwrap();

    let line = monitor
        .send_line("sn_get", Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(line, "[sn_get+ok] 1212324500026");

    let err = assert_err!(monitor.send_line("fw_get", Duration::from_millis(500)).await);
    assert!(matches!(err, HarnessError::Timeout(_)));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn end_of_file_triggers_reconnect() {
    let device = ScriptedDevice::responsive().once("reboot", Reply::HangUp);
    let opener = MockPortOpener::new(device);
    let monitor = ConnectionMonitor::spawn(Arc::new(opener.clone()), settings());
    monitor.wait_connected(Duration::from_secs(5)).await.unwrap();

    let mut states = monitor.subscribe();
    let err = assert_err!(monitor.send_line("reboot", Duration::from_secs(2)).await);
    assert!(matches!(err, HarnessError::Connection(_)));

    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();
    assert_ok!(monitor.wait_connected(Duration::from_secs(5)).await);
    assert_eq!(opener.open_count(), 2);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_request_reopens_the_port() {
    let opener = MockPortOpener::new(ScriptedDevice::responsive());
    let monitor = ConnectionMonitor::spawn(Arc::new(opener.clone()), settings());
    monitor.wait_connected(Duration::from_secs(5)).await.unwrap();

    monitor.request_reconnect().await.unwrap();
    assert_ne!(monitor.state(), ConnectionState::Connected);

    assert_ok!(monitor.wait_connected(Duration::from_secs(5)).await);
    assert_eq!(opener.open_count(), 2);
    assert_eq!(opener.count_of("time_tick"), 2);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reboot_marker_reaches_the_console() {
    let device = ScriptedDevice::responsive().greeting(["boot 0x01", "POST Check - Coin Bat."]);
    let opener = MockPortOpener::new(device);
    let monitor = ConnectionMonitor::spawn(Arc::new(opener), settings());
    monitor.wait_connected(Duration::from_secs(5)).await.unwrap();

    assert!(monitor.console().contains("POST Check - Coin Bat."));
    assert!(monitor.console().contains("[time_tick+ok]"));

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn console_is_cleared_periodically() {
    let opener = MockPortOpener::new(ScriptedDevice::responsive());
    let monitor = ConnectionMonitor::spawn(Arc::new(opener), settings());
    monitor.wait_connected(Duration::from_secs(5)).await.unwrap();
    assert!(!monitor.console().is_empty());

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(monitor.console().is_empty());

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_probe_ends_in_stopped() {
    let opener = MockPortOpener::new(ScriptedDevice::new());
    let monitor = ConnectionMonitor::spawn(Arc::new(opener), settings());

    let mut states = monitor.subscribe();
    states
        .wait_for(|s| *s == ConnectionState::Connecting)
        .await
        .unwrap();
    monitor.shutdown().await;

    assert_eq!(monitor.state(), ConnectionState::Stopped);
    let err = assert_err!(monitor.wait_connected(Duration::from_secs(1)).await);
    assert!(matches!(err, HarnessError::MonitorStopped));
}
