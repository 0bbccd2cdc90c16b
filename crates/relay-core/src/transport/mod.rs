//! Uniform wrapper over the concrete cross-process channels.

pub mod runtime;
pub mod socket;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use protocol::Message;

use crate::error::RelayResult;

pub use runtime::{RuntimeBus, RuntimeMessageAdapter};
pub use socket::SocketAdapter;

pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;
pub type LinkCallback = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Link-level events reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Open,
    Closed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Point-to-point request/response; no persistent connection.
    Runtime,
    /// Persistent duplex socket, possibly shared with other peers.
    Socket,
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Label used in logs.
    fn name(&self) -> &str;

    async fn connect(&self) -> RelayResult<()>;

    /// Fails with `ChannelUnavailable` when not connected.
    async fn send(&self, message: Message) -> RelayResult<()>;

    fn on_message(&self, handler: MessageCallback);

    fn on_state_change(&self, handler: LinkCallback);

    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Callback lists shared by the adapters. Callbacks are cloned out of the
/// lock before they run so a callback may register further callbacks.
#[derive(Default)]
pub struct Listeners {
    messages: RwLock<Vec<MessageCallback>>,
    links: RwLock<Vec<LinkCallback>>,
}

impl Listeners {
    pub fn add_message(&self, handler: MessageCallback) {
        self.messages.write().push(handler);
    }

    pub fn add_link(&self, handler: LinkCallback) {
        self.links.write().push(handler);
    }

    pub fn emit_message(&self, message: Message) {
        let handlers = self.messages.read().clone();
        for handler in handlers {
            handler(message.clone());
        }
    }

    pub fn emit_link(&self, event: LinkEvent) {
        let handlers = self.links.read().clone();
        for handler in handlers {
            handler(event.clone());
        }
    }
}
