use crate::AppState;
use axum::{
    extract::{ws::{Message as WsMessage, WebSocket, WebSocketUpgrade}, Extension},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use protocol::{DataStats, Message, MessageType, PongPayload};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum Outgoing {
    Text(String),
    Close,
}

/// What to do with one inbound text frame.
#[derive(Debug, PartialEq)]
enum Inbound {
    /// Answer the sender directly.
    Reply(String),
    /// Relay the original frame to every other client.
    Forward,
    Drop,
}

pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket_handler(socket, state))
}

async fn websocket_handler(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Outgoing>(1000);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                Outgoing::Text(s) => {
                    if ws_sender.send(WsMessage::Text(s)).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    state.register(client_id.clone(), tx.clone()).await;
    let clients = state.client_count().await;
    info!(client = %client_id, clients, "Client connected");

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                error!(client = %client_id, "WebSocket error: {}", e);
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => match route_frame(&text) {
                Inbound::Reply(reply) => {
                    if tx.send(Outgoing::Text(reply)).await.is_err() {
                        break;
                    }
                }
                Inbound::Forward => {
                    let delivered = state.broadcast(&text, Some(&client_id)).await;
                    debug!(client = %client_id, delivered, "relayed frame");
                }
                Inbound::Drop => {}
            },
            WsMessage::Binary(data) => {
                debug!(client = %client_id, bytes = data.len(), "ignoring binary frame");
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.unregister(&client_id).await;
    drop(tx);
    // Let a pending close frame go out before tearing the writer down
    if tokio::time::timeout(std::time::Duration::from_secs(1), send_task).await.is_err() {
        debug!(client = %client_id, "writer did not finish in time");
    }
    info!(client = %client_id, "Client disconnected");
}

fn route_frame(text: &str) -> Inbound {
    let message = match Message::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping malformed frame: {}", e);
            return Inbound::Drop;
        }
    };
    if message.msg_type().is_empty() {
        warn!("dropping frame without a type");
        return Inbound::Drop;
    }
    if message.kind() == Some(MessageType::Ping) {
        let payload = serde_json::to_value(PongPayload::new(DataStats::default()))
            .unwrap_or_default();
        return match message.reply(payload).to_json() {
            Ok(reply) => Inbound::Reply(reply),
            Err(e) => {
                warn!("failed to encode PONG: {}", e);
                Inbound::Drop
            }
        };
    }
    Inbound::Forward
}
