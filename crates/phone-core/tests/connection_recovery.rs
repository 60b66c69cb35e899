//! Signalling, registration and token refresh recovery scenarios

mod common;

use std::time::Duration;

use agentdesk_phone_core::registration::RegistrationState;
use agentdesk_phone_core::signalling::{OutboundFrame, SignallingState};
use agentdesk_phone_core::{PhoneError, SessionNotice, StatusLevel};
use common::{advance, secs, settle, Harness, AGENT_ID};

#[tokio::test(start_paused = true)]
async fn test_boot_registers_device_and_announces_agent() {
    let mut h = Harness::start().await;

    let device = h.device();
    assert_eq!(device.tokens(), vec!["token-1".to_string()]);
    assert_eq!(device.successful_registrations(), 1);
    assert!(!device.options().allow_incoming_while_busy);

    let announce = h.peer().sent_of_type("agent_register");
    assert_eq!(announce.len(), 1);
    assert_eq!(announce[0]["data"]["agent_id"], AGENT_ID);
    assert_eq!(announce[0]["data"]["token"], "token-1");
    assert_eq!(h.peer().url(), "ws://routing.test/ws/agents");

    h.peer().push_text(r#"{"type":"registration_success"}"#);
    settle().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.device, RegistrationState::Registered);
    assert_eq!(snapshot.connection.signalling, SignallingState::Connected);
    assert_eq!(snapshot.status, StatusLevel::Healthy);
    assert!(!snapshot.can_reconnect);
    assert!(h
        .drain_notices()
        .iter()
        .any(|n| matches!(n, SessionNotice::AgentRegistered)));
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_reconnects_after_backoff() {
    let h = Harness::start_registered().await;
    assert_eq!(h.transport.attempts(), 1);

    h.peer().close(1006);
    settle().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.signalling, SignallingState::Disconnected);
    assert_eq!(snapshot.connection.reconnect_attempts, 1);
    assert_eq!(snapshot.status, StatusLevel::Degraded);

    advance(Duration::from_millis(5_900)).await;
    assert_eq!(h.transport.attempts(), 1);

    advance(Duration::from_millis(200)).await;
    assert_eq!(h.transport.attempts(), 2);
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.signalling, SignallingState::Connected);
    assert_eq!(snapshot.connection.reconnect_attempts, 0);

    // the new connection announces the agent again
    assert_eq!(h.peer().sent_of_type("agent_register").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_normal_close_does_not_reconnect() {
    let h = Harness::start_registered().await;

    h.peer().close(1000);
    advance(secs(120)).await;

    assert_eq!(h.transport.attempts(), 1);
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.signalling, SignallingState::Disconnected);
    assert!(snapshot.can_reconnect);

    h.session.reconnect().await.unwrap();
    settle().await;
    assert_eq!(h.transport.attempts(), 2);
    assert_eq!(h.session.snapshot().connection.signalling, SignallingState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connects_back_off() {
    let builder = Harness::builder();
    builder.transport.fail_next(PhoneError::network("connection refused"));
    builder.transport.fail_next(PhoneError::network("connection refused"));
    let h = builder.start().await;

    assert_eq!(h.session.snapshot().connection.signalling, SignallingState::Error);
    assert_eq!(h.session.snapshot().connection.reconnect_attempts, 1);

    // attempt 1 waits 6s, attempt 2 waits 12s
    advance(Duration::from_millis(6_100)).await;
    assert_eq!(h.transport.attempts(), 2);
    assert_eq!(h.session.snapshot().connection.reconnect_attempts, 2);

    advance(Duration::from_millis(11_800)).await;
    assert_eq!(h.transport.attempts(), 2);
    advance(Duration::from_millis(300)).await;
    assert_eq!(h.transport.attempts(), 3);
    assert_eq!(h.session.snapshot().connection.signalling, SignallingState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_counts_as_failure() {
    let builder = Harness::builder();
    builder.transport.hang_next();
    let h = builder.start().await;

    assert_eq!(h.session.snapshot().connection.signalling, SignallingState::Connecting);

    advance(secs(10)).await;
    assert_eq!(h.session.snapshot().connection.signalling, SignallingState::Error);

    advance(Duration::from_millis(6_100)).await;
    assert_eq!(h.transport.attempts(), 2);
    assert_eq!(h.session.snapshot().connection.signalling, SignallingState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_registration_failures_retry_with_growing_delay() {
    let builder = Harness::builder();
    builder.telephony.fail_next_registrations(3);
    let h = builder.start().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.device, RegistrationState::Error);
    assert_eq!(snapshot.connection.registration_attempts, 1);
    assert_eq!(snapshot.status, StatusLevel::Disconnected);

    advance(secs(21)).await;
    assert_eq!(h.session.snapshot().connection.registration_attempts, 3);

    advance(secs(15)).await;
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.device, RegistrationState::Registered);
    assert_eq!(snapshot.connection.registration_attempts, 0);

    let times = h.telephony.register_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps, vec![secs(5), secs(10), secs(20)]);

    // each retry fetched a fresh token and built a fresh device
    assert_eq!(h.tokens.fetch_count(), 4);
    assert_eq!(h.telephony.device_count(), 4);
    assert!(h.telephony.devices()[..3].iter().all(|d| d.is_destroyed()));
    assert_eq!(h.device().tokens(), vec!["token-4".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_initial_token_failure_is_retried() {
    let builder = Harness::builder();
    builder.tokens.fail_next([PhoneError::network("token endpoint unreachable")]);
    let h = builder.start().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.device, RegistrationState::Error);
    assert_eq!(h.telephony.device_count(), 0);
    assert_eq!(h.transport.attempts(), 0);

    advance(Duration::from_millis(5_100)).await;
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.device, RegistrationState::Registered);
    assert_eq!(snapshot.connection.signalling, SignallingState::Connected);
    assert_eq!(h.peer().sent_of_type("agent_register")[0]["data"]["token"], "token-2");
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_wait_for_manual_reconnect() {
    let builder = Harness::builder();
    builder.tokens.fail_next([PhoneError::auth("session expired")]);
    let h = builder.start().await;

    advance(secs(60)).await;
    assert_eq!(h.tokens.fetch_count(), 1);
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.device, RegistrationState::Uninitialized);
    assert!(snapshot.last_error.is_some());
    assert!(snapshot.can_reconnect);

    h.session.reconnect().await.unwrap();
    settle().await;
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.device, RegistrationState::Registered);
    assert_eq!(snapshot.connection.signalling, SignallingState::Connected);
    assert!(snapshot.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stale_heartbeat_marks_connection_unhealthy() {
    let h = Harness::start_registered().await;
    assert!(h.session.snapshot().is_healthy());

    advance(secs(85)).await;
    assert!(h.session.snapshot().is_healthy());
    assert!(h.peer().sent_of_type("ping").len() >= 2);

    advance(secs(16)).await;
    let snapshot = h.session.snapshot();
    assert!(!snapshot.is_healthy());
    assert_eq!(snapshot.status, StatusLevel::Degraded);
    assert_eq!(snapshot.status_message, "Routing connection is not responding");
    assert!(snapshot.can_reconnect);

    // a pong brings it back
    h.peer().push_text(r#"{"type":"pong"}"#);
    settle().await;
    assert!(h.session.snapshot().is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_manual_reconnect_replaces_stale_link() {
    let h = Harness::start_registered().await;
    let stale = h.peer();
    advance(secs(101)).await;
    assert!(!h.session.snapshot().is_healthy());

    h.session.reconnect().await.unwrap();
    settle().await;

    assert!(matches!(
        stale.sent().last(),
        Some(OutboundFrame::Close { code: 1000, .. })
    ));
    assert_eq!(h.transport.attempts(), 2);
    assert_eq!(h.session.snapshot().connection.signalling, SignallingState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_registration_error_is_surfaced() {
    let mut h = Harness::start().await;
    h.drain_notices();

    h.peer()
        .push_text(r#"{"type":"registration_error","message":"unknown agent"}"#);
    settle().await;

    assert_eq!(h.session.snapshot().last_error.as_deref(), Some("unknown agent"));
    assert!(h
        .drain_notices()
        .iter()
        .any(|n| matches!(n, SessionNotice::RegistrationError { message } if message == "unknown agent")));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_signalling_message_is_dropped() {
    let h = Harness::start_registered().await;

    h.peer().push_text("not json at all");
    h.peer().push_text(r#"{"type":"queue_stats","data":{"waiting":3}}"#);
    settle().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection.signalling, SignallingState::Connected);
    assert!(snapshot.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_periodic_token_refresh_updates_device() {
    let h = Harness::start_registered().await;
    let device = h.device();

    advance(secs(15 * 60 + 1)).await;
    assert_eq!(device.tokens(), vec!["token-1".to_string(), "token-2".to_string()]);
    assert_eq!(h.telephony.device_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_retries_once_then_waits_for_next_cycle() {
    let mut h = Harness::start_registered().await;
    let device = h.device();
    h.drain_notices();
    h.tokens.fail_next([
        PhoneError::network("token endpoint unreachable"),
        PhoneError::network("token endpoint unreachable"),
    ]);

    advance(secs(15 * 60 + 6)).await;
    assert_eq!(h.tokens.fetch_count(), 3);
    assert_eq!(device.tokens(), vec!["token-1".to_string()]);
    assert!(h
        .drain_notices()
        .iter()
        .any(|n| matches!(n, SessionNotice::TokenRefreshFailed { .. })));

    // the old token stays live until the next cycle succeeds
    advance(secs(15 * 60)).await;
    assert_eq!(h.tokens.fetch_count(), 4);
    assert_eq!(device.tokens(), vec!["token-1".to_string(), "token-4".to_string()]);

    let times = h.tokens.fetch_times();
    assert_eq!(times[2] - times[1], secs(5));
    assert_eq!(times[3] - times[2], secs(15 * 60));
}

#[tokio::test(start_paused = true)]
async fn test_refused_refresh_waits_for_next_cycle_without_retry() {
    let mut h = Harness::start_registered().await;
    let device = h.device();
    h.drain_notices();
    h.tokens.fail_next([PhoneError::auth("session expired")]);

    advance(secs(15 * 60 + 6)).await;
    assert_eq!(h.tokens.fetch_count(), 2);
    assert_eq!(device.tokens(), vec!["token-1".to_string()]);
    assert!(h
        .drain_notices()
        .iter()
        .any(|n| matches!(n, SessionNotice::TokenRefreshFailed { .. })));

    advance(secs(15 * 60)).await;
    assert_eq!(h.tokens.fetch_count(), 3);
    assert_eq!(device.tokens(), vec!["token-1".to_string(), "token-3".to_string()]);

    let times = h.tokens.fetch_times();
    assert_eq!(times[2] - times[1], secs(15 * 60));
}

#[tokio::test(start_paused = true)]
async fn test_token_will_expire_triggers_refresh() {
    let h = Harness::start_registered().await;
    let device = h.device();

    device.emit(agentdesk_phone_core::telephony::DeviceEvent::TokenWillExpire);
    settle().await;

    assert_eq!(h.tokens.fetch_count(), 2);
    assert_eq!(device.tokens(), vec!["token-1".to_string(), "token-2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_device_registers_again() {
    let h = Harness::start_registered().await;
    let device = h.device();

    device.emit(agentdesk_phone_core::telephony::DeviceEvent::Unregistered);
    settle().await;
    assert_eq!(h.session.snapshot().connection.device, RegistrationState::Unregistered);

    advance(secs(5)).await;
    settle().await;
    assert_eq!(h.session.snapshot().connection.device, RegistrationState::Registered);
    assert_eq!(device.successful_registrations(), 2);
    assert_eq!(h.telephony.device_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_device_error_retries_with_new_device() {
    let h = Harness::start_registered().await;

    h.device().emit(agentdesk_phone_core::telephony::DeviceEvent::Error {
        message: "transport lost".to_string(),
    });
    settle().await;
    assert_eq!(h.session.snapshot().connection.device, RegistrationState::Error);

    advance(Duration::from_millis(5_100)).await;
    assert_eq!(h.session.snapshot().connection.device, RegistrationState::Registered);
    assert_eq!(h.telephony.device_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything_in_order() {
    let h = Harness::start_registered().await;
    let peer = h.peer();
    let device = h.device();

    h.session.shutdown().await.unwrap();
    h.session.closed().await;
    settle().await;

    assert!(matches!(peer.sent().last(), Some(OutboundFrame::Close { code: 1000, .. })));
    assert!(device.is_destroyed());
    assert!(h.media.captures_stopped() >= 1);

    let snapshot = h.session.snapshot();
    assert!(snapshot.shut_down);
    assert!(!snapshot.can_reconnect);
    assert_eq!(snapshot.connection.device, RegistrationState::Uninitialized);
    assert!(matches!(h.session.accept().await, Err(PhoneError::ChannelClosed)));

    // nothing reconnects afterwards
    advance(secs(60)).await;
    assert_eq!(h.transport.attempts(), 1);
}
