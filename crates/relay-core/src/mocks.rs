//! Scriptable in-memory transport for tests and demos.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::{Message, MessageType, PongPayload};
use serde_json::Value;

use crate::error::{RelayError, RelayResult};
use crate::transport::{LinkCallback, LinkEvent, Listeners, MessageCallback, TransportAdapter, TransportKind};

type Responder = Arc<dyn Fn(&Message) -> Option<Value> + Send + Sync>;

pub struct MockTransport {
    label: String,
    kind: TransportKind,
    listeners: Arc<Listeners>,
    open: AtomicBool,
    refuse: AtomicBool,
    hang: AtomicBool,
    broken_writes: AtomicBool,
    fail_next: AtomicU32,
    connect_calls: AtomicU32,
    answer_pings: AtomicBool,
    sent: Mutex<Vec<Message>>,
    responder: Mutex<Option<Responder>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            label: format!("mock:{:?}", kind).to_lowercase(),
            kind,
            listeners: Arc::new(Listeners::default()),
            open: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            broken_writes: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            answer_pings: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        })
    }

    pub fn socket() -> Arc<Self> {
        Self::new(TransportKind::Socket)
    }

    pub fn runtime() -> Arc<Self> {
        Self::new(TransportKind::Runtime)
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every connect until called again with `false`.
    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Leave connect attempts pending forever, like a peer that accepts
    /// the TCP connection but never answers the handshake.
    pub fn hang_connects(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Fail every send while still reporting the link as open.
    pub fn break_writes(&self, broken: bool) {
        self.broken_writes.store(broken, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Whether `PING` requests get an automatic `PONG`. On by default.
    pub fn answer_pings(&self, on: bool) {
        self.answer_pings.store(on, Ordering::SeqCst);
    }

    /// Answer requests (messages carrying an id) with `f`'s payload.
    pub fn reply_with<F>(&self, f: F)
    where
        F: Fn(&Message) -> Option<Value> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Arc::new(f));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Sent messages of one type, in send order.
    pub fn sent_of(&self, msg_type: &str) -> Vec<Message> {
        self.sent.lock().iter().filter(|m| m.msg_type() == msg_type).cloned().collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Simulate the peer going away.
    pub fn drop_link(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.listeners.emit_link(LinkEvent::Closed { reason: reason.to_string() });
        }
    }

    /// Deliver `message` as if it arrived from the peer.
    pub fn inject(&self, message: Message) {
        self.listeners.emit_message(message);
    }

    fn auto_reply(&self, message: &Message) -> Option<Message> {
        if !message.expects_reply() {
            return None;
        }
        if message.kind() == Some(MessageType::Ping) && self.answer_pings.load(Ordering::SeqCst) {
            let payload = serde_json::to_value(PongPayload::new(Default::default())).ok()?;
            return Some(message.reply(payload));
        }
        let responder = self.responder.lock().clone()?;
        responder(message).map(|payload| message.reply(payload))
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.label
    }

    async fn connect(&self) -> RelayResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RelayError::ConnectionFailed("mock refused".to_string()));
        }
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RelayError::ConnectionFailed("mock failure".to_string()));
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            self.listeners.emit_link(LinkEvent::Open);
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> RelayResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RelayError::ChannelUnavailable);
        }
        if self.broken_writes.load(Ordering::SeqCst) {
            return Err(RelayError::ChannelUnavailable);
        }
        self.sent.lock().push(message.clone());
        if let Some(reply) = self.auto_reply(&message) {
            self.listeners.emit_message(reply);
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageCallback) {
        self.listeners.add_message(handler);
    }

    fn on_state_change(&self, handler: LinkCallback) {
        self.listeners.add_link(handler);
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.listeners.emit_link(LinkEvent::Closed { reason: "closed by caller".to_string() });
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
