//! In-process stand-in for extension runtime messaging.
//!
//! Every adapter is a link from one named context to one peer context. A
//! send to a peer that has no live adapter pointing back fails with
//! `NoReceiver`, which is a per-call failure: the sending link stays open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{LinkCallback, LinkEvent, Listeners, MessageCallback, TransportAdapter, TransportKind};
use crate::error::{RelayError, RelayResult};

type Inbox = mpsc::UnboundedSender<Message>;

/// Registry of live inboxes keyed by `(receiver, sender)` context pair.
#[derive(Clone, Default)]
pub struct RuntimeBus {
    inboxes: Arc<Mutex<HashMap<(String, String), Inbox>>>,
}

impl RuntimeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter for `context` talking to `peer`.
    pub fn adapter(&self, context: &str, peer: &str) -> RuntimeMessageAdapter {
        RuntimeMessageAdapter {
            bus: self.clone(),
            context: context.to_string(),
            peer: peer.to_string(),
            label: format!("runtime:{}->{}", context, peer),
            listeners: Arc::new(Listeners::default()),
            open: AtomicBool::new(false),
            pump: Mutex::new(None),
        }
    }

    pub fn has_listener(&self, context: &str, from: &str) -> bool {
        self.inboxes
            .lock()
            .get(&(context.to_string(), from.to_string()))
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    fn register(&self, context: &str, from: &str, inbox: Inbox) {
        self.inboxes.lock().insert((context.to_string(), from.to_string()), inbox);
    }

    fn unregister(&self, context: &str, from: &str) {
        self.inboxes.lock().remove(&(context.to_string(), from.to_string()));
    }

    fn deliver(&self, to: &str, from: &str, message: Message) -> RelayResult<()> {
        let key = (to.to_string(), from.to_string());
        let mut inboxes = self.inboxes.lock();
        let delivered = match inboxes.get(&key) {
            Some(tx) => tx.send(message).is_ok(),
            None => return Err(RelayError::NoReceiver(to.to_string())),
        };
        if !delivered {
            // Receiver task is gone; the context unloaded without closing.
            inboxes.remove(&key);
            return Err(RelayError::NoReceiver(to.to_string()));
        }
        Ok(())
    }
}

pub struct RuntimeMessageAdapter {
    bus: RuntimeBus,
    context: String,
    peer: String,
    label: String,
    listeners: Arc<Listeners>,
    open: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeMessageAdapter {
    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl TransportAdapter for RuntimeMessageAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Runtime
    }

    fn name(&self) -> &str {
        &self.label
    }

    async fn connect(&self) -> RelayResult<()> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.bus.register(&self.context, &self.peer, tx);

        let listeners = Arc::clone(&self.listeners);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                listeners.emit_message(message);
            }
        });
        if let Some(old) = self.pump.lock().replace(handle) {
            old.abort();
        }
        debug!(link = %self.label, "runtime link open");
        self.listeners.emit_link(LinkEvent::Open);
        Ok(())
    }

    async fn send(&self, message: Message) -> RelayResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RelayError::ChannelUnavailable);
        }
        self.bus.deliver(&self.peer, &self.context, message)
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
        self.bus.unregister(&self.context, &self.peer);
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.listeners.emit_link(LinkEvent::Closed { reason: "closed by caller".to_string() });
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for RuntimeMessageAdapter {
    fn drop(&mut self) {
        if self.open.load(Ordering::SeqCst) {
            self.bus.unregister(&self.context, &self.peer);
        }
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_without_receiver_is_per_call() {
        let bus = RuntimeBus::new();
        let dashboard = bus.adapter("dashboard", "background");
        dashboard.connect().await.unwrap();

        let err = dashboard.send(Message::new("PING", json!({}))).await.unwrap_err();
        assert!(matches!(err, RelayError::NoReceiver(ref to) if to == "background"));
        assert!(dashboard.is_open());
    }

    #[tokio::test]
    async fn delivers_between_paired_contexts() {
        let bus = RuntimeBus::new();
        let dashboard = bus.adapter("dashboard", "background");
        let background = bus.adapter("background", "dashboard");

        let (tx, mut rx) = mpsc::unbounded_channel();
        background.on_message(Arc::new(move |m: Message| {
            let _ = tx.send(m);
        }));
        background.connect().await.unwrap();
        dashboard.connect().await.unwrap();

        dashboard.send(Message::new("GET_PERMISSIONS", json!({}))).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.msg_type(), "GET_PERMISSIONS");
    }

    #[tokio::test]
    async fn send_before_connect_is_unavailable() {
        let bus = RuntimeBus::new();
        let a = bus.adapter("a", "b");
        assert!(matches!(
            a.send(Message::new("X", json!({}))).await,
            Err(RelayError::ChannelUnavailable)
        ));
    }

    #[tokio::test]
    async fn close_unregisters_inbox() {
        let bus = RuntimeBus::new();
        let background = bus.adapter("background", "dashboard");
        background.connect().await.unwrap();
        assert!(bus.has_listener("background", "dashboard"));
        background.close().await;
        assert!(!bus.has_listener("background", "dashboard"));
    }
}
