//! Device lifecycle: single-flight initialization, reset, token refresh,
//! connectivity tracking

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use softphone_client_core::{ClientError, DeviceState, SdkNotification, VoiceDevice};

#[tokio::test]
async fn test_concurrent_initialize_registers_once() {
    let h = harness().await;
    h.factory.set_register_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(h.phone.initialize("alice"), h.phone.initialize("alice"));
    let first = first.expect("first initialize");
    let second = second.expect("second initialize");

    assert!(same_client(&first, &second), "both callers get the same client");
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.factory.device().registrations.load(Ordering::SeqCst), 1);
    assert_eq!(h.tokens.calls(), 1);
    assert_eq!(h.phone.connection_status().state, DeviceState::Ready);
}

#[tokio::test]
async fn test_many_concurrent_initializers_share_one_bring_up() {
    let h = harness().await;
    h.factory.set_register_delay(Duration::from_millis(20));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let phone = h.phone.clone();
            tokio::spawn(async move { phone.initialize("alice").await })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("initialize");
    }

    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.factory.device().registrations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_initialize_when_ready_returns_existing_client() {
    let h = ready_harness().await;
    let again = h.phone.initialize("alice").await.expect("initialize again");

    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.factory.device().registrations.load(Ordering::SeqCst), 1);
    let device: Arc<dyn VoiceDevice> = h.factory.device();
    assert!(same_client(&again, &device));
}

#[tokio::test(start_paused = true)]
async fn test_reset_cancels_pending_initialize() {
    let h = harness().await;
    h.factory.set_register_delay(Duration::from_secs(30));

    let phone = h.phone.clone();
    let pending = tokio::spawn(async move { phone.initialize("alice").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.phone.connection_status().state, DeviceState::Initializing);

    h.phone.reset().await;
    let result = pending.await.expect("join");
    assert!(matches!(result, Err(ClientError::Cancelled { .. })), "got {:?}", result.err());

    assert!(h.factory.device().is_destroyed());
    assert_eq!(h.phone.connection_status().state, DeviceState::Uninitialized);
    assert!(h.phone.last_error().is_none());
}

#[tokio::test]
async fn test_reset_without_device_is_safe() {
    let h = harness().await;
    h.phone.reset().await;
    h.phone.reset().await;
    assert_eq!(h.phone.connection_status().state, DeviceState::Uninitialized);
}

#[tokio::test]
async fn test_token_failure_sets_error_state() {
    let tokens = ScriptedTokenProvider::new().then(Err(ClientError::token_fetch("identity not allowed", Some(403))));
    let h = harness_with(test_config(), tokens).await;

    let result = h.phone.initialize("mallory").await;
    assert!(matches!(result, Err(ClientError::TokenFetch { status: Some(403), .. })));

    let state = h.phone.state();
    assert_eq!(state.connection_status, DeviceState::Error);
    assert_eq!(state.last_error.as_deref(), Some("Token fetch failed: identity not allowed"));
    assert!(h.phone.feed().contains("identity not allowed"));
    assert_eq!(h.factory.created(), 0);
}

#[tokio::test]
async fn test_registration_failure_destroys_client_and_retry_recreates() {
    let h = harness().await;
    h.factory.fail_register.store(true, Ordering::SeqCst);

    let result = h.phone.initialize("alice").await;
    assert!(matches!(result, Err(ClientError::Transport { .. })));
    assert_eq!(h.phone.connection_status().state, DeviceState::Error);
    let failed = h.factory.device();
    assert!(failed.is_destroyed());
    assert!(h.phone.last_error().unwrap_or_default().contains("invalid access token"));

    h.factory.fail_register.store(false, Ordering::SeqCst);
    h.phone.initialize("alice").await.expect("retry initialize");
    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.phone.connection_status().state, DeviceState::Ready);
    assert!(h.phone.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_is_not_fatal() {
    let tokens = ScriptedTokenProvider::new()
        .then(Ok(voice_token("alice", 180)))
        .then(Err(ClientError::token_fetch("refresh denied", Some(500))));
    let h = harness_with(test_config(), tokens).await;

    h.phone.initialize("alice").await.expect("initialize");
    assert_eq!(h.phone.device().next_refresh_delay(), Some(Duration::from_secs(60)));

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(h.tokens.calls(), 1, "refresh must not fire early");

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(h.tokens.calls(), 2);

    let state = h.phone.state();
    assert!(state.last_error.is_none());
    assert_eq!(state.connection_status, DeviceState::Ready);
    assert!(h.phone.feed().contains("Token refresh failed"));
    assert!(h.factory.device().token_updates.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_swaps_token_and_reschedules() {
    let tokens = ScriptedTokenProvider::new()
        .then(Ok(voice_token("alice", 180)))
        .then(Ok(voice_token("alice", 3600)));
    let h = harness_with(test_config(), tokens).await;

    h.phone.initialize("alice").await.expect("initialize");
    tokio::time::sleep(Duration::from_secs(61)).await;
    settle().await;

    let device = h.factory.device();
    assert_eq!(device.token_updates.lock().as_slice(), ["token-alice-3600".to_string()]);
    assert_eq!(device.registrations.load(Ordering::SeqCst), 1, "refresh must not re-register");
    assert_eq!(h.phone.device().next_refresh_delay(), Some(Duration::from_secs(3480)));
    assert_eq!(h.phone.connection_status().state, DeviceState::Ready);
}

#[tokio::test]
async fn test_token_will_expire_triggers_refresh() {
    let h = ready_harness().await;
    h.factory.emit(SdkNotification::device("tokenWillExpire"));
    settle().await;

    assert_eq!(h.tokens.calls(), 2);
    assert_eq!(h.factory.device().token_updates.lock().len(), 1);
    assert!(h.phone.feed().contains("Access token refreshed"));
}

#[tokio::test]
async fn test_token_will_expire_without_device_is_ignored() {
    let h = harness().await;
    h.factory.fail_register.store(true, Ordering::SeqCst);
    assert!(h.phone.initialize("alice").await.is_err());

    // the failed device's sink still carries the current generation
    h.factory.emit(SdkNotification::device("tokenWillExpire"));
    settle().await;

    assert_eq!(h.tokens.calls(), 1, "no refresh without a device");
    assert!(!h.phone.feed().contains("Access token expiring soon"));
    assert_eq!(h.phone.connection_status().state, DeviceState::Error);
}

#[tokio::test]
async fn test_disconnect_and_reconnect() {
    let h = ready_harness().await;

    h.factory
        .emit(SdkNotification::device("unregistered").with_payload(serde_json::json!({ "reason": "network lost" })));
    wait_for_device_state(&h.phone, DeviceState::Disconnected).await;
    assert_eq!(h.phone.connection_status().message.as_deref(), Some("network lost"));

    let result = h.phone.make_call("+12025550123").await;
    assert_eq!(result, Err(ClientError::NotReady));

    h.factory.emit(SdkNotification::device("registered"));
    wait_for_device_state(&h.phone, DeviceState::Ready).await;
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn test_device_error_populates_last_error() {
    let h = ready_harness().await;
    h.factory.emit(
        SdkNotification::device("error").with_payload(serde_json::json!({ "message": "websocket closed", "code": 31005 })),
    );
    wait_for_device_state(&h.phone, DeviceState::Error).await;

    let error = h.phone.last_error().expect("last error");
    assert!(error.contains("websocket closed (code 31005)"), "got {}", error);
    assert!(h.phone.feed().contains("websocket closed"));
}

#[tokio::test]
async fn test_identity_switch_replaces_client() {
    let h = ready_harness().await;
    let alice = h.factory.device();

    h.phone.initialize("bob").await.expect("initialize bob");
    assert!(alice.is_destroyed());
    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.phone.device().identity().as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_notifications_from_detached_device_are_ignored() {
    let h = ready_harness().await;
    let old_sink = h.factory.sink();

    h.phone.reset().await;
    h.phone.initialize("alice").await.expect("initialize again");

    old_sink.emit(SdkNotification::device("unregistered"));
    old_sink.emit(SdkNotification::device("error"));
    settle().await;

    assert_eq!(h.phone.connection_status().state, DeviceState::Ready);
    assert!(h.phone.last_error().is_none());
}

#[tokio::test]
async fn test_device_options_come_from_config() {
    let config = test_config().with_audio_devices(Some("headset-mic".into()), Some("headset".into()));
    let h = harness_with(config, ScriptedTokenProvider::new()).await;
    h.phone.initialize("alice").await.expect("initialize");

    let device = h.factory.device();
    assert_eq!(device.options.input_device.as_deref(), Some("headset-mic"));
    assert_eq!(device.options.codec_preferences.len(), 2);
    assert_eq!(device.token.lock().as_str(), "token-alice-3600");
}
