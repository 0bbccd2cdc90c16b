use std::sync::Arc;
use std::time::Duration;

use relay_core::detector::{SimulatedEmotionDetector, SimulatedGazeTracker};
use relay_core::protocol::{CollectionMethod, DataKind, PermissionSet};
use relay_core::{DataRelay, ExtensionState, MemoryStorage, Producer, RelayConfig, StorageMirror, TrackingGate};
use serde_json::json;
use tokio::time::sleep;

const EVERY: Duration = Duration::from_secs(5);

fn memory_relay() -> Arc<DataRelay> {
    let mirror = StorageMirror::new().with_backend(Arc::new(MemoryStorage::new("wellness_")));
    DataRelay::new(RelayConfig::default(), mirror)
}

fn granted_relay() -> Arc<DataRelay> {
    let relay = memory_relay();
    relay.apply_permissions(PermissionSet::granted(CollectionMethod::Both));
    relay
}

fn gaze_producer(relay: &Arc<DataRelay>, tracking: &TrackingGate) -> Producer {
    Producer::start("gaze", relay.clone(), tracking.clone(), Arc::new(SimulatedGazeTracker::new(Some(3))), || (), EVERY)
}

fn paused(relay: &DataRelay, on: bool) {
    let mut permissions = relay.permissions();
    permissions.paused = on;
    relay.apply_permissions(permissions);
}

#[tokio::test(start_paused = true)]
async fn test_samples_follow_the_tick() {
    let relay = granted_relay();
    let tracking = TrackingGate::new(true);
    let _gaze = gaze_producer(&relay, &tracking);

    sleep(EVERY - Duration::from_millis(100)).await;
    assert_eq!(relay.len(DataKind::Gaze), 0, "first sample waits a full period");

    sleep(EVERY * 2).await;
    assert_eq!(relay.len(DataKind::Gaze), 2);
}

#[tokio::test(start_paused = true)]
async fn test_samples_stop_while_tracking_is_off() {
    let relay = granted_relay();
    let tracking = TrackingGate::new(false);
    let producer = gaze_producer(&relay, &tracking);

    sleep(EVERY * 4 + Duration::from_millis(100)).await;
    assert_eq!(relay.len(DataKind::Gaze), 0);
    assert!(producer.is_running(), "an idle producer keeps its timer");

    assert!(!tracking.set(true));
    sleep(EVERY * 2).await;
    assert_eq!(relay.len(DataKind::Gaze), 2);

    assert!(tracking.set(false));
    sleep(EVERY * 4).await;
    assert_eq!(relay.len(DataKind::Gaze), 2);
}

#[tokio::test(start_paused = true)]
async fn test_background_state_drives_the_gate() {
    let relay = granted_relay();
    let state = ExtensionState::new(relay.clone());
    assert!(!state.is_tracking());
    let _gaze = gaze_producer(&relay, &state.tracking_gate());

    sleep(EVERY * 2 + Duration::from_millis(100)).await;
    assert_eq!(relay.len(DataKind::Gaze), 0);

    assert!(!state.set_tracking(true));
    sleep(EVERY).await;
    assert_eq!(relay.len(DataKind::Gaze), 1);

    state.set_tracking(false);
    sleep(EVERY * 3).await;
    assert_eq!(relay.len(DataKind::Gaze), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permissions_gate_each_kind() {
    let relay = memory_relay();
    let tracking = TrackingGate::new(true);
    let _emotion = Producer::start(
        "emotion",
        relay.clone(),
        tracking.clone(),
        Arc::new(SimulatedEmotionDetector::new(Some(1))),
        || (),
        EVERY,
    );
    let _gaze = gaze_producer(&relay, &tracking);

    sleep(EVERY * 2 + Duration::from_millis(100)).await;
    assert_eq!(relay.len(DataKind::Emotion), 0, "nothing before consent");
    assert_eq!(relay.len(DataKind::Gaze), 0);

    // Content-only consent still blocks webcam-derived kinds
    relay.apply_permissions(PermissionSet::granted(CollectionMethod::Content));
    sleep(EVERY * 2).await;
    assert_eq!(relay.len(DataKind::Emotion), 0);
    assert_eq!(relay.len(DataKind::Gaze), 0);

    relay.apply_permissions(PermissionSet::granted(CollectionMethod::Both));
    sleep(EVERY * 2).await;
    assert_eq!(relay.len(DataKind::Emotion), 2);
    assert_eq!(relay.len(DataKind::Gaze), 2);

    paused(&relay, true);
    sleep(EVERY * 3).await;
    assert_eq!(relay.len(DataKind::Emotion), 2);
    assert_eq!(relay.len(DataKind::Gaze), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_drop_abort_the_timer() {
    let relay = granted_relay();
    let tracking = TrackingGate::new(true);
    let mut stopped = gaze_producer(&relay, &tracking);
    let dropped = Producer::start(
        "emotion",
        relay.clone(),
        tracking.clone(),
        Arc::new(SimulatedEmotionDetector::new(Some(1))),
        || (),
        EVERY,
    );
    assert_eq!(stopped.name(), "gaze");
    assert!(stopped.is_running());

    sleep(EVERY + Duration::from_millis(100)).await;
    assert_eq!(relay.len(DataKind::Gaze), 1);
    assert_eq!(relay.len(DataKind::Emotion), 1);

    stopped.stop();
    drop(dropped);
    assert!(!stopped.is_running());
    // A second stop is harmless
    stopped.stop();

    sleep(EVERY * 4).await;
    assert_eq!(relay.len(DataKind::Gaze), 1);
    assert_eq!(relay.len(DataKind::Emotion), 1);
}

#[tokio::test(start_paused = true)]
async fn test_break_reminder_fires_after_continuous_collection() {
    let relay = granted_relay();
    let tracking = TrackingGate::new(true);
    let reminder = Producer::break_reminder(
        relay.clone(),
        tracking.clone(),
        Duration::from_secs(10 * 60),
        Duration::from_secs(60),
    );
    assert_eq!(reminder.name(), "break-reminder");

    sleep(Duration::from_secs(9 * 60 + 30)).await;
    assert_eq!(relay.len(DataKind::Analytics), 0);

    sleep(Duration::from_secs(60)).await;
    let sent = relay.get_recent(DataKind::Analytics, usize::MAX);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].get("continuousMinutes"), Some(&json!(10)));

    // The clock restarts after each reminder
    sleep(Duration::from_secs(9 * 60)).await;
    assert_eq!(relay.len(DataKind::Analytics), 1);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(relay.len(DataKind::Analytics), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pause_resets_break_clock() {
    let relay = granted_relay();
    let tracking = TrackingGate::new(true);
    let _reminder = Producer::break_reminder(
        relay.clone(),
        tracking.clone(),
        Duration::from_secs(10 * 60),
        Duration::from_secs(60),
    );

    sleep(Duration::from_secs(8 * 60 + 30)).await;
    paused(&relay, true);
    // The 9 minute check sees the pause and restarts the clock there
    sleep(Duration::from_secs(60)).await;
    paused(&relay, false);

    sleep(Duration::from_secs(9 * 60)).await;
    assert_eq!(relay.len(DataKind::Analytics), 0, "paused time does not count");

    sleep(Duration::from_secs(60)).await;
    assert_eq!(relay.len(DataKind::Analytics), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tracking_off_resets_break_clock() {
    let relay = granted_relay();
    let tracking = TrackingGate::new(true);
    let _reminder = Producer::break_reminder(
        relay.clone(),
        tracking.clone(),
        Duration::from_secs(10 * 60),
        Duration::from_secs(60),
    );

    sleep(Duration::from_secs(8 * 60 + 30)).await;
    tracking.set(false);
    sleep(Duration::from_secs(5 * 60)).await;
    assert_eq!(relay.len(DataKind::Analytics), 0);

    // Last reset happened at the 13 minute check
    tracking.set(true);
    sleep(Duration::from_secs(9 * 60)).await;
    assert_eq!(relay.len(DataKind::Analytics), 0);
    sleep(Duration::from_secs(60)).await;
    assert_eq!(relay.len(DataKind::Analytics), 1);
}
