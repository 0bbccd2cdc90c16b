use std::time::Duration;

use relay_core::mocks::MockTransport;
use relay_core::{ChannelState, ConnectionEvent, ReconnectPolicy, ReconnectionManager, TransportAdapter};
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};

async fn wait_for_event<F>(rx: &mut broadcast::Receiver<ConnectionEvent>, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    timeout(Duration::from_secs(600), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not seen in time")
}

async fn wait_connected(manager: &ReconnectionManager) {
    timeout(Duration::from_secs(600), manager.wait_for_state(ChannelState::Connected))
        .await
        .expect("never connected");
}

/// Failed attempts back off 1s, 2s, 3s; the counter resets once connected.
#[tokio::test(start_paused = true)]
async fn test_backoff_grows_then_resets() {
    let transport = MockTransport::socket();
    transport.fail_next_connects(3);
    let manager = ReconnectionManager::new(transport.clone(), ReconnectPolicy::socket());

    let started = Instant::now();
    manager.connect();
    wait_connected(&manager).await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(7), "elapsed {:?}", elapsed);
    assert_eq!(transport.connect_calls(), 4);
    assert_eq!(manager.status().reconnect_attempts, 0);
    assert!(manager.status().connection_id.is_some());

    // A fresh drop starts again from the base delay
    let dropped_at = Instant::now();
    transport.drop_link("peer went away");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.state(), ChannelState::Reconnecting);
    wait_connected(&manager).await;
    let elapsed = dropped_at.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let transport = MockTransport::runtime();
    transport.refuse_connects(true);
    let manager = ReconnectionManager::new(transport.clone(), ReconnectPolicy::extension());
    let mut events = manager.subscribe();

    manager.connect();
    let gave_up = wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::GaveUp { .. })).await;
    assert!(matches!(gave_up, ConnectionEvent::GaveUp { attempts: 5, .. }));

    // Initial connect plus five retries, then nothing more
    assert_eq!(transport.connect_calls(), 6);
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.connect_calls(), 6);

    let status = manager.status();
    assert_eq!(status.state, ChannelState::Disconnected);
    assert!(status.gave_up);
    assert!(status.last_error.is_some());

    // Only an explicit force_reconnect revives it
    transport.refuse_connects(false);
    manager.force_reconnect();
    wait_connected(&manager).await;
    assert!(!manager.status().gave_up);
    assert_eq!(transport.connect_calls(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_retry() {
    let transport = MockTransport::socket();
    transport.refuse_connects(true);
    let manager = ReconnectionManager::new(transport.clone(), ReconnectPolicy::socket());

    manager.connect();
    timeout(Duration::from_secs(5), manager.wait_for_state(ChannelState::Reconnecting))
        .await
        .unwrap();
    manager.close();
    timeout(Duration::from_secs(5), manager.wait_for_state(ChannelState::Disconnected))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.connect_calls(), 1);
    assert_eq!(manager.state(), ChannelState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_mark_down_while_transport_open() {
    let transport = MockTransport::socket();
    let manager = ReconnectionManager::new(transport.clone(), ReconnectPolicy::socket());
    let mut events = manager.subscribe();

    manager.connect();
    wait_connected(&manager).await;
    assert!(transport.is_open());

    manager.mark_down("heartbeat missed");
    wait_for_event(&mut events, |e| {
        matches!(e, ConnectionEvent::StateChanged { to: ChannelState::Reconnecting, .. })
    })
    .await;
    assert_eq!(manager.status().last_error.as_deref(), Some("heartbeat missed"));

    wait_connected(&manager).await;
    assert_eq!(transport.connect_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_connection() {
    let transport = MockTransport::socket();
    let manager = ReconnectionManager::new(transport.clone(), ReconnectPolicy::socket());

    let msg = relay_core::protocol::Message::new("PING", serde_json::json!({}));
    assert!(matches!(
        manager.send(msg.clone()).await,
        Err(relay_core::RelayError::ChannelUnavailable)
    ));

    manager.connect();
    wait_connected(&manager).await;
    manager.send(msg).await.unwrap();
    assert_eq!(manager.status().message_count, 1);
    assert_eq!(transport.sent().len(), 1);
}

fn hanging_policy() -> ReconnectPolicy {
    ReconnectPolicy { connect_timeout: Duration::from_secs(10), ..ReconnectPolicy::extension() }
}

#[tokio::test(start_paused = true)]
async fn test_close_interrupts_hung_connect() {
    let transport = MockTransport::socket();
    transport.hang_connects(true);
    let manager = ReconnectionManager::new(transport.clone(), hanging_policy());

    manager.connect();
    timeout(Duration::from_secs(1), manager.wait_for_state(ChannelState::Connecting))
        .await
        .unwrap();
    manager.close();
    // Well before the connect timeout would have fired
    timeout(Duration::from_secs(1), manager.wait_for_state(ChannelState::Disconnected))
        .await
        .expect("close not honoured while connecting");

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.connect_calls(), 1);
    assert_eq!(manager.state(), ChannelState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_force_reconnect_restarts_hung_connect() {
    let transport = MockTransport::socket();
    transport.hang_connects(true);
    let manager = ReconnectionManager::new(transport.clone(), hanging_policy());

    manager.connect();
    timeout(Duration::from_secs(1), manager.wait_for_state(ChannelState::Connecting))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    transport.hang_connects(false);
    manager.force_reconnect();
    timeout(Duration::from_secs(1), manager.wait_for_state(ChannelState::Connected))
        .await
        .expect("force_reconnect did not replace the stuck attempt");
    assert_eq!(transport.connect_calls(), 2);
}

/// Each hung attempt times out and counts toward the cap.
#[tokio::test(start_paused = true)]
async fn test_hung_connects_time_out_and_give_up() {
    let transport = MockTransport::runtime();
    transport.hang_connects(true);
    let manager = ReconnectionManager::new(transport.clone(), hanging_policy());
    let mut events = manager.subscribe();

    let started = Instant::now();
    manager.connect();
    let gave_up = wait_for_event(&mut events, |e| matches!(e, ConnectionEvent::GaveUp { .. })).await;
    match gave_up {
        ConnectionEvent::GaveUp { attempts, last_error } => {
            assert_eq!(attempts, 5);
            assert!(last_error.unwrap_or_default().contains("timed out"));
        }
        other => panic!("expected GaveUp, got {:?}", other),
    }
    // Six 10s attempts plus 1+2+3+4+5s of backoff
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(75) && elapsed < Duration::from_secs(76), "elapsed {:?}", elapsed);
    assert_eq!(transport.connect_calls(), 6);
    assert_eq!(manager.state(), ChannelState::Disconnected);
    assert!(manager.status().gave_up);
}
