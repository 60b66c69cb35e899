//! Microphone, level metering and device selection through the session

mod common;

use agentdesk_phone_core::audio::AudioDeviceInfo;
use agentdesk_phone_core::{PhoneError, SessionNotice};
use common::{settle, Harness};

#[tokio::test(start_paused = true)]
async fn test_boot_opens_microphone_and_lists_devices() {
    let builder = Harness::builder();
    builder.media.set_input_amplitude(8_000);
    let h = builder.start().await;
    settle().await;

    let audio = h.session.snapshot().audio;
    assert!(audio.has_mic_permission);
    assert_eq!(audio.input_devices.len(), 2);
    assert_eq!(audio.output_devices.len(), 2);
    assert_eq!(audio.selected_input.as_deref(), Some("default-mic"));
    assert!(audio.input_level > 0.2 && audio.input_level < 0.3);
    assert_eq!(h.media.capture_requests(), vec![None]);
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone_is_reported_and_can_be_retried() {
    let builder = Harness::builder();
    builder.media.deny_microphone(true);
    let mut h = builder.start().await;

    let audio = h.session.snapshot().audio;
    assert!(!audio.has_mic_permission);
    assert_eq!(audio.input_level, 0.0);
    assert!(h
        .drain_notices()
        .iter()
        .any(|n| matches!(n, SessionNotice::MicrophoneDenied { .. })));

    // the rest of the session is unaffected
    assert!(h.telephony.latest_device().is_some());

    h.media.deny_microphone(false);
    h.session.retry_microphone().await.unwrap();
    settle().await;
    assert!(h.session.snapshot().audio.has_mic_permission);
}

#[tokio::test(start_paused = true)]
async fn test_selecting_input_moves_device_and_capture() {
    let h = Harness::start_registered().await;

    h.session.select_input("headset-mic").await.unwrap();
    settle().await;

    assert_eq!(h.device().input_device().as_deref(), Some("headset-mic"));
    assert_eq!(h.session.snapshot().audio.selected_input.as_deref(), Some("headset-mic"));
    assert_eq!(
        h.media.capture_requests().last().cloned().flatten().as_deref(),
        Some("headset-mic")
    );
    // the previous capture was released
    assert!(h.media.captures_stopped() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_selecting_output_routes_speakers() {
    let h = Harness::start_registered().await;

    h.session.select_output("headset-speaker").await.unwrap();
    assert_eq!(h.device().speaker_devices(), vec!["headset-speaker".to_string()]);
    assert_eq!(
        h.session.snapshot().audio.selected_output.as_deref(),
        Some("headset-speaker")
    );

    h.session.test_speaker().await.unwrap();
    assert_eq!(h.device().speaker_tests(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_selection_keeps_previous_device() {
    let h = Harness::start_registered().await;
    h.session.select_output("headset-speaker").await.unwrap();

    let unknown = h.session.select_output("bluetooth-speaker").await;
    assert!(unknown.is_err());

    h.device().fail_device_selection(true);
    let refused = h.session.select_output("default-speaker").await;
    assert!(matches!(refused, Err(PhoneError::Media { .. })));

    assert_eq!(
        h.session.snapshot().audio.selected_output.as_deref(),
        Some("headset-speaker")
    );
}

#[tokio::test(start_paused = true)]
async fn test_hotplug_updates_device_lists() {
    let h = Harness::start_registered().await;
    h.session.select_output("headset-speaker").await.unwrap();

    h.media.plug(AudioDeviceInfo::input("usb-mic", "USB Microphone"));
    settle().await;
    let audio = h.session.snapshot().audio;
    assert_eq!(audio.input_devices.len(), 3);
    assert!(audio.input_devices.iter().any(|d| d.id == "usb-mic"));

    h.media.unplug("headset-speaker");
    settle().await;
    let audio = h.session.snapshot().audio;
    assert_eq!(audio.output_devices.len(), 1);
    assert_eq!(audio.selected_output, None);
}

#[tokio::test(start_paused = true)]
async fn test_device_enumeration_failure_is_not_fatal() {
    let builder = Harness::builder();
    builder.media.fail_enumeration(true);
    let mut h = builder.start().await;

    assert!(h.session.snapshot().audio.input_devices.is_empty());
    assert!(h
        .drain_notices()
        .iter()
        .any(|n| matches!(n, SessionNotice::Error { category, .. } if category == "media")));

    h.media.fail_enumeration(false);
    h.session.refresh_devices().await.unwrap();
    assert_eq!(h.session.snapshot().audio.input_devices.len(), 2);
}
