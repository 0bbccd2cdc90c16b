//! Cross-context data relay: transports, reconnection, routing, queued
//! delivery, heartbeats, and the bounded stores each process keeps.

pub mod background;
pub mod config;
pub mod content;
pub mod dashboard;
pub mod detector;
pub mod error;
pub mod health;
pub mod producer;
pub mod queue;
pub mod reconnect;
pub mod relay;
pub mod router;
pub mod storage;
pub mod store;
pub mod transport;

// Scriptable transport for tests and demos
pub mod mocks;

pub use background::ExtensionState;
pub use config::RelayConfig;
pub use content::{ContentScript, PageSource, StaticPage};
pub use dashboard::DashboardClient;
pub use detector::{
    Detector, PageText, SimulatedContentDetector, SimulatedEmotionDetector, SimulatedGazeTracker,
};
pub use error::{RelayError, RelayResult};
pub use health::{HealthConfig, HealthEvent, HealthMonitor};
pub use producer::{Producer, TrackingGate};
pub use queue::{FlushReport, OutboundQueue, QueuedMessage};
pub use reconnect::{ChannelState, ConnectionEvent, ConnectionStatus, ReconnectPolicy, ReconnectionManager};
pub use relay::{ChannelOptions, DataRelay, SubscriptionId};
pub use router::{handler_fn, Delivery, HandlerId, MessageHandler, MessageRouter};
pub use storage::{FileStorage, MemoryStorage, StorageBackend, StorageMirror};
pub use store::BoundedStore;
pub use transport::{
    LinkEvent, RuntimeBus, RuntimeMessageAdapter, SocketAdapter, TransportAdapter, TransportKind,
};

pub use protocol;
