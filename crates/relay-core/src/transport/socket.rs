use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use protocol::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as Frame};
use tracing::{debug, info, warn};

use super::{LinkCallback, LinkEvent, Listeners, MessageCallback, TransportAdapter, TransportKind};
use crate::error::{RelayError, RelayResult};

const OUTGOING_BUFFER: usize = 1000;

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// WebSocket client link. Inbound text frames are decoded as `Message`;
/// frames that fail to decode are logged and dropped.
pub struct SocketAdapter {
    url: String,
    label: String,
    listeners: Arc<Listeners>,
    outgoing: Mutex<Option<mpsc::Sender<Outgoing>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    open: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
}

impl SocketAdapter {
    pub fn new<S: Into<String>>(url: S) -> Self {
        let url = url.into();
        Self {
            label: format!("socket:{}", url),
            url,
            listeners: Arc::new(Listeners::default()),
            outgoing: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn abort_tasks(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl TransportAdapter for SocketAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn name(&self) -> &str {
        &self.label
    }

    async fn connect(&self) -> RelayResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        // Stale handles from a previous connection, if any
        self.abort_tasks();

        let (tx, mut rx) = mpsc::channel::<Outgoing>(OUTGOING_BUFFER);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.outgoing.lock() = Some(tx);
        self.open.store(true, Ordering::SeqCst);

        let writer_listeners = Arc::clone(&self.listeners);
        let writer_open = Arc::clone(&self.open);
        let writer_current = Arc::clone(&self.generation);
        let writer_label = self.label.clone();
        let writer = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outgoing::Text(text) => {
                        if let Err(e) = write.send(Frame::Text(text)).await {
                            // A dead writer must not leave the link looking open
                            if writer_current.load(Ordering::SeqCst) == generation
                                && writer_open.swap(false, Ordering::SeqCst)
                            {
                                let reason = format!("write failed: {}", e);
                                warn!(link = %writer_label, %reason, "socket closed");
                                writer_listeners.emit_link(LinkEvent::Closed { reason });
                            }
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = write.send(Frame::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let listeners = Arc::clone(&self.listeners);
        let open = Arc::clone(&self.open);
        let current = Arc::clone(&self.generation);
        let label = self.label.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Frame::Text(text))) => match Message::from_json(&text) {
                        Ok(message) => listeners.emit_message(message),
                        Err(e) => warn!(link = %label, error = %e, "dropping malformed frame"),
                    },
                    Some(Ok(Frame::Binary(data))) => {
                        debug!(link = %label, bytes = data.len(), "ignoring binary frame");
                    }
                    Some(Ok(Frame::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by peer".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("socket error: {}", e),
                    None => break "stream ended".to_string(),
                }
            };
            if current.load(Ordering::SeqCst) == generation && open.swap(false, Ordering::SeqCst) {
                info!(link = %label, %reason, "socket closed");
                listeners.emit_link(LinkEvent::Closed { reason });
            }
        });

        *self.writer.lock() = Some(writer);
        *self.reader.lock() = Some(reader);
        info!(link = %self.label, "socket open");
        self.listeners.emit_link(LinkEvent::Open);
        Ok(())
    }

    async fn send(&self, message: Message) -> RelayResult<()> {
        if !self.is_open() {
            return Err(RelayError::ChannelUnavailable);
        }
        let tx = self.outgoing.lock().clone().ok_or(RelayError::ChannelUnavailable)?;
        let text = message.to_json()?;
        tx.send(Outgoing::Text(text)).await.map_err(|_| RelayError::ChannelUnavailable)
    }

    fn on_message(&self, handler: MessageCallback) {
        self.listeners.add_message(handler);
    }

    fn on_state_change(&self, handler: LinkCallback) {
        self.listeners.add_link(handler);
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        // Invalidate the reader so it does not report this close a second time
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.outgoing.lock().take() {
            let _ = tx.try_send(Outgoing::Close);
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.listeners.emit_link(LinkEvent::Closed { reason: "closed by caller".to_string() });
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for SocketAdapter {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
