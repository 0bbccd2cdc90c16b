use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_core::protocol::Message;
use relay_core::{
    ChannelState, LinkEvent, ReconnectPolicy, ReconnectionManager, RelayError, SocketAdapter, TransportAdapter,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as Frame;

/// One-connection server: sends `frames`, then either hangs up or reports
/// what it receives until the client goes away.
async fn serve_once(frames: Vec<String>, hang_up: bool) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for frame in frames {
            ws.send(Frame::Text(frame)).await.unwrap();
        }
        if hang_up {
            let _ = ws.close(None).await;
            return;
        }
        while let Some(Ok(frame)) = ws.next().await {
            match frame {
                Frame::Text(text) => {
                    let _ = tx.send(text);
                }
                Frame::Close(_) => break,
                _ => {}
            }
        }
        let _ = ws.close(None).await;
    });
    (url, rx)
}

fn collect_messages(adapter: &SocketAdapter) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    adapter.on_message(Arc::new(move |m: Message| {
        let _ = tx.send(m);
    }));
    rx
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let valid = Message::new("CAMPUS_PULSE_UPDATE", json!({ "activeUsers": 12 })).to_json().unwrap();
    let (url, _rx) = serve_once(vec!["{not json".to_string(), valid], false).await;

    let adapter = SocketAdapter::new(url);
    let mut inbound = collect_messages(&adapter);
    adapter.connect().await.unwrap();
    assert!(adapter.is_open());

    let first = timeout(Duration::from_secs(5), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(first.msg_type(), "CAMPUS_PULSE_UPDATE");
    assert_eq!(first.payload()["activeUsers"], 12);
    adapter.close().await;
}

#[tokio::test]
async fn test_outbound_frames_reach_server() {
    let (url, mut received) = serve_once(Vec::new(), false).await;
    let adapter = SocketAdapter::new(url);
    adapter.connect().await.unwrap();

    adapter.send(Message::new("GAZE_DATA", json!({ "x": 0.4, "y": 0.6 }))).await.unwrap();
    let text = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
    let echoed = Message::from_json(&text).unwrap();
    assert_eq!(echoed.msg_type(), "GAZE_DATA");
    assert_eq!(echoed.payload()["x"], 0.4);
    adapter.close().await;
}

#[tokio::test]
async fn test_peer_close_reports_disconnect() {
    let (url, _rx) = serve_once(Vec::new(), true).await;
    let adapter = SocketAdapter::new(url);
    let (tx, mut links) = mpsc::unbounded_channel();
    adapter.on_state_change(Arc::new(move |e: LinkEvent| {
        let _ = tx.send(e);
    }));
    adapter.connect().await.unwrap();
    assert_eq!(links.recv().await.unwrap(), LinkEvent::Open);

    let event = timeout(Duration::from_secs(5), links.recv()).await.unwrap().unwrap();
    assert!(matches!(event, LinkEvent::Closed { .. }), "got {:?}", event);
    assert!(!adapter.is_open());
    assert!(matches!(
        adapter.send(Message::new("PING", json!({}))).await,
        Err(RelayError::ChannelUnavailable)
    ));

    // Closing an already-closed link reports nothing further
    adapter.close().await;
    assert!(links.try_recv().is_err());
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let adapter = SocketAdapter::new(format!("ws://{}/ws", addr));
    let err = adapter.connect().await.unwrap_err();
    assert!(matches!(err, RelayError::ConnectionFailed(_)));
    assert!(!adapter.is_open());
}

/// Accepts TCP connections and holds them without ever answering the
/// WebSocket handshake.
async fn silent_listener() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    url
}

#[tokio::test]
async fn test_close_honoured_during_silent_handshake() {
    let url = silent_listener().await;
    let policy = ReconnectPolicy { connect_timeout: Duration::from_secs(30), ..ReconnectPolicy::socket() };
    let manager = ReconnectionManager::new(Arc::new(SocketAdapter::new(url)), policy);

    manager.connect();
    timeout(Duration::from_secs(5), manager.wait_for_state(ChannelState::Connecting))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), ChannelState::Connecting);

    manager.close();
    timeout(Duration::from_secs(5), manager.wait_for_state(ChannelState::Disconnected))
        .await
        .expect("close not honoured while the handshake hangs");
}

#[tokio::test]
async fn test_silent_handshake_times_out_into_backoff() {
    let url = silent_listener().await;
    let policy = ReconnectPolicy { connect_timeout: Duration::from_millis(300), ..ReconnectPolicy::socket() };
    let manager = ReconnectionManager::new(Arc::new(SocketAdapter::new(url)), policy);

    manager.connect();
    timeout(Duration::from_secs(5), manager.wait_for_state(ChannelState::Reconnecting))
        .await
        .expect("hung handshake never counted as a failed attempt");
    let status = manager.status();
    assert_eq!(status.reconnect_attempts, 1);
    assert!(status.last_error.unwrap_or_default().contains("timed out"));
    manager.close();
}
