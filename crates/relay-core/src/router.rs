//! Type-keyed dispatch for one channel, plus send/request on top of the
//! reconnection manager and outbound queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use protocol::{ErrorPayload, Message};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::queue::{FlushReport, OutboundQueue};
use crate::reconnect::{ChannelState, ConnectionEvent, ReconnectionManager};
use crate::transport::TransportKind;

/// Handles one message type. A returned payload becomes the reply when the
/// sender asked for one.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Option<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Value>> + Send,
{
    async fn handle(&self, message: &Message) -> Option<Value> {
        (self.0)(message.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Handler keys must be non-empty and free of whitespace.
pub fn validate_type(msg_type: &str) -> RelayResult<()> {
    if msg_type.is_empty() || msg_type.chars().any(char::is_whitespace) {
        return Err(RelayError::InvalidHandler(format!("bad message type {:?}", msg_type)));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

type HandlerTable = HashMap<String, Vec<(HandlerId, Arc<dyn MessageHandler>)>>;

pub struct MessageRouter {
    manager: Arc<ReconnectionManager>,
    handlers: RwLock<HandlerTable>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    queue: tokio::sync::Mutex<OutboundQueue>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageRouter {
    /// Wire a router onto `manager`'s transport. Inbound messages are
    /// dispatched one at a time in arrival order.
    pub fn new(manager: Arc<ReconnectionManager>, queue_capacity: usize) -> Arc<Self> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Message>();
        manager.transport().on_message(Arc::new(move |message: Message| {
            let _ = inbound_tx.send(message);
        }));
        let mut events = manager.subscribe();

        let router = Arc::new(Self {
            manager,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            queue: tokio::sync::Mutex::new(OutboundQueue::new(queue_capacity)),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&router);
        let dispatcher = tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                let Some(router) = weak.upgrade() else { break };
                if let Err(e) = router.dispatch(message).await {
                    warn!(error = %e, "dropping inbound message");
                }
            }
        });

        let weak: Weak<Self> = Arc::downgrade(&router);
        let watcher = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "connection events lagged");
                        let Some(router) = weak.upgrade() else { break };
                        router.resync().await;
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(router) = weak.upgrade() else { break };
                if let ConnectionEvent::StateChanged { from, to } = event {
                    if to == ChannelState::Connected {
                        let report = router.flush().await;
                        if report.sent > 0 || report.remaining > 0 {
                            debug!(sent = report.sent, remaining = report.remaining, "flushed outbound queue");
                        }
                    } else if from == ChannelState::Connected {
                        router.fail_pending();
                    }
                }
            }
        });

        router.tasks.lock().extend([dispatcher, watcher]);
        router
    }

    pub fn manager(&self) -> &Arc<ReconnectionManager> {
        &self.manager
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.manager.transport().kind()
    }

    pub fn register(&self, msg_type: &str, handler: Arc<dyn MessageHandler>) -> RelayResult<HandlerId> {
        validate_type(msg_type)?;
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(msg_type.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    /// Returns whether a handler was removed.
    pub fn unregister(&self, msg_type: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(msg_type) else { return false };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(msg_type);
        }
        removed
    }

    pub fn has_handler(&self, msg_type: &str) -> bool {
        self.handlers.read().contains_key(msg_type)
    }

    pub async fn dispatch(&self, message: Message) -> RelayResult<()> {
        if message.msg_type().is_empty() {
            return Err(RelayError::MalformedMessage("empty message type".to_string()));
        }

        if let Some(reply_to) = message.reply_to().map(str::to_string) {
            let waiter = self.pending.lock().remove(&reply_to);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => debug!(reply_to = %reply_to, "dropping late or foreign reply"),
            }
            return Ok(());
        }

        let handlers = self.handlers.read().get(message.msg_type()).cloned();
        let Some(handlers) = handlers else {
            match self.transport_kind() {
                TransportKind::Runtime => {
                    warn!(msg_type = %message.msg_type(), "unknown message type");
                    if message.expects_reply() {
                        let payload = serde_json::to_value(ErrorPayload::unknown_type(message.msg_type()))?;
                        self.reply(message.reply(payload)).await;
                    }
                }
                // Socket peers share one bus; another client may own the type.
                TransportKind::Socket => debug!(msg_type = %message.msg_type(), "unknown message type"),
            }
            return Ok(());
        };

        let mut reply = None;
        for (_, handler) in handlers {
            let out = handler.handle(&message).await;
            if reply.is_none() {
                reply = out;
            }
        }
        if message.expects_reply() {
            let payload = reply.unwrap_or_else(|| json!({ "ok": true }));
            self.reply(message.reply(payload)).await;
        }
        Ok(())
    }

    async fn reply(&self, reply: Message) {
        if let Err(e) = self.manager.send(reply).await {
            debug!(error = %e, "reply not delivered");
        }
    }

    /// Send now when connected, otherwise queue for the next connect.
    pub async fn send<S: Into<String>>(&self, msg_type: S, payload: Value) -> RelayResult<Delivery> {
        self.send_message(Message::new(msg_type, payload)).await
    }

    pub async fn send_message(&self, message: Message) -> RelayResult<Delivery> {
        if message.msg_type().is_empty() {
            return Err(RelayError::MalformedMessage("empty message type".to_string()));
        }
        let mut queue = self.queue.lock().await;
        if self.manager.is_connected() {
            if !queue.is_empty() {
                self.flush_locked(&mut queue).await;
            }
            // Anything still queued must go first.
            if queue.is_empty() {
                match self.manager.send(message.clone()).await {
                    Ok(()) => return Ok(Delivery::Sent),
                    Err(RelayError::ChannelUnavailable) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        queue.enqueue(message);
        Ok(Delivery::Queued)
    }

    /// Send with a correlation id and wait for the matching reply. Fails
    /// fast when the channel is down; an error payload in the reply comes
    /// back as `Remote`.
    pub async fn request<S: Into<String>>(
        &self,
        msg_type: S,
        payload: Value,
        timeout: Duration,
    ) -> RelayResult<Message> {
        let msg_type = msg_type.into();
        if !self.manager.is_connected() {
            return Err(RelayError::ChannelUnavailable);
        }
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let message = Message::new(msg_type.clone(), payload).with_id(id.clone());
        if let Err(e) = self.manager.send(message).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => match ErrorPayload::from_payload(reply.payload()) {
                Some(err) => Err(RelayError::Remote(err.error)),
                None => Ok(reply),
            },
            // Waiter dropped: the channel went down underneath us.
            Ok(Err(_)) => Err(RelayError::ChannelUnavailable),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RelayError::Timeout(timeout, msg_type))
            }
        }
    }

    pub async fn flush(&self) -> FlushReport {
        let mut queue = self.queue.lock().await;
        if !self.manager.is_connected() {
            return FlushReport { remaining: queue.len(), ..FlushReport::default() };
        }
        self.flush_locked(&mut queue).await
    }

    async fn flush_locked(&self, queue: &mut OutboundQueue) -> FlushReport {
        queue
            .flush(|message| {
                let manager = Arc::clone(&self.manager);
                async move { manager.send(message).await }
            })
            .await
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Catch up after missed connection events: whatever transition was
    /// skipped, the current state decides what is owed.
    async fn resync(&self) {
        if self.manager.is_connected() {
            let report = self.flush().await;
            debug!(sent = report.sent, remaining = report.remaining, "resynced after lagged events");
        } else {
            self.fail_pending();
        }
    }

    fn fail_pending(&self) {
        let dropped: Vec<_> = self.pending.lock().drain().collect();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "failing in-flight requests after disconnect");
        }
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
