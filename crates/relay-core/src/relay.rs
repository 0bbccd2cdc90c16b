//! Per-process facade: bounded stores, local subscribers, persistence, and
//! fan-out over every attached channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use protocol::{
    now_millis, DataKind, DataStats, Message, MessageType, PermissionSet, PermissionsRequest,
    PongPayload, Record, Snapshot, SnapshotSource,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::health::{HealthConfig, HealthEvent, HealthMonitor};
use crate::reconnect::{ChannelState, ConnectionStatus, ReconnectPolicy, ReconnectionManager};
use crate::router::{handler_fn, validate_type, MessageHandler, MessageRouter};
use crate::storage::{StorageMirror, PERMISSIONS_KEY, SETTINGS_KEY};
use crate::store::BoundedStore;
use crate::transport::TransportAdapter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Inbound types whose payload is a record for one of the stores.
const INGEST_TYPES: [MessageType; 7] = [
    MessageType::EmotionData,
    MessageType::GazeData,
    MessageType::AnalyticsData,
    MessageType::WebcamData,
    MessageType::EmotionUpdate,
    MessageType::ContentTrigger,
    MessageType::BreakReminder,
];

pub type Subscriber = Arc<dyn Fn(&Record) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub policy: ReconnectPolicy,
    /// `None` skips the heartbeat entirely.
    pub heartbeat: Option<HealthConfig>,
}

impl ChannelOptions {
    /// Extension runtime link: bounded retries, no heartbeat.
    pub fn runtime() -> Self {
        Self { policy: ReconnectPolicy::extension(), heartbeat: None }
    }

    /// Long-lived socket: unbounded retries with a heartbeat.
    pub fn socket() -> Self {
        Self { policy: ReconnectPolicy::socket(), heartbeat: Some(HealthConfig::default()) }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self { policy: config.reconnect.clone(), heartbeat: Some(config.health.clone()) }
    }
}

struct Channel {
    name: String,
    router: Arc<MessageRouter>,
    health: Mutex<HealthMonitor>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Channel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

enum PersistJob {
    Write { key: String, value: Value },
    Remove(String),
    Barrier(oneshot::Sender<()>),
}

pub struct DataRelay {
    config: RelayConfig,
    stores: RwLock<HashMap<DataKind, BoundedStore<Record>>>,
    subscribers: RwLock<HashMap<DataKind, Vec<(SubscriptionId, Subscriber)>>>,
    next_subscription: AtomicU64,
    permissions: watch::Sender<PermissionSet>,
    settings: RwLock<Map<String, Value>>,
    channels: RwLock<Vec<Arc<Channel>>>,
    extra_handlers: RwLock<Vec<(String, Arc<dyn MessageHandler>)>>,
    mirror: StorageMirror,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    persist_task: JoinHandle<()>,
}

impl DataRelay {
    /// Build a relay with empty stores. Call `restore` to load the mirror.
    pub fn new(config: RelayConfig, mirror: StorageMirror) -> Arc<Self> {
        let stores = DataKind::ALL
            .iter()
            .map(|kind| (*kind, BoundedStore::new(config.capacity(*kind))))
            .collect();
        let (permissions, _) = watch::channel(PermissionSet::default());
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let persist_task = tokio::spawn(persist_worker(mirror.clone(), persist_rx));

        Arc::new(Self {
            config,
            stores: RwLock::new(stores),
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            permissions,
            settings: RwLock::new(Map::new()),
            channels: RwLock::new(Vec::new()),
            extra_handlers: RwLock::new(Vec::new()),
            mirror,
            persist_tx,
            persist_task,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // ---- channels ----

    /// Attach a transport under `name` and start connecting it.
    pub fn add_channel(
        self: &Arc<Self>,
        name: &str,
        transport: Arc<dyn TransportAdapter>,
        options: ChannelOptions,
    ) -> RelayResult<Arc<MessageRouter>> {
        if self.channel(name).is_some() {
            return Err(RelayError::InvalidConfig(format!("channel {} already attached", name)));
        }
        let manager = Arc::new(ReconnectionManager::new(transport, options.policy));
        let router = MessageRouter::new(Arc::clone(&manager), self.config.queue_capacity);

        self.install_core_handlers(&router)?;
        for (msg_type, handler) in self.extra_handlers.read().iter() {
            router.register(msg_type, Arc::clone(handler))?;
        }

        let mut health = HealthMonitor::new();
        let mut tasks = Vec::new();
        if let Some(heartbeat) = options.heartbeat {
            let mut events = health.subscribe();
            health.start(Arc::clone(&router), heartbeat);
            let weak = Arc::downgrade(self);
            let channel_name = name.to_string();
            tasks.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(HealthEvent::ResyncDue) => {
                            let Some(relay) = weak.upgrade() else { break };
                            let snapshot = relay.request_snapshot().await;
                            debug!(channel = %channel_name, source = ?snapshot.source, "periodic resync");
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        self.channels.write().push(Arc::new(Channel {
            name: name.to_string(),
            router: Arc::clone(&router),
            health: Mutex::new(health),
            tasks,
        }));
        info!(channel = %name, link = %manager.transport().name(), "channel attached");
        manager.connect();
        Ok(router)
    }

    pub fn channel(&self, name: &str) -> Option<Arc<MessageRouter>> {
        self.channels
            .read()
            .iter()
            .find(|c| c.name == name)
            .map(|c| Arc::clone(&c.router))
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().iter().map(|c| c.name.clone()).collect()
    }

    pub fn status(&self, name: &str) -> Option<ConnectionStatus> {
        self.channel(name).map(|r| r.manager().status())
    }

    pub fn force_reconnect_all(&self) {
        for router in self.routers() {
            router.manager().force_reconnect();
        }
    }

    fn routers(&self) -> Vec<Arc<MessageRouter>> {
        self.channels.read().iter().map(|c| Arc::clone(&c.router)).collect()
    }

    /// Register `handler` on every current channel and on channels added
    /// later.
    pub fn register_handler(&self, msg_type: &str, handler: Arc<dyn MessageHandler>) -> RelayResult<()> {
        validate_type(msg_type)?;
        for router in self.routers() {
            router.register(msg_type, Arc::clone(&handler))?;
        }
        self.extra_handlers.write().push((msg_type.to_string(), handler));
        Ok(())
    }

    fn install_core_handlers(self: &Arc<Self>, router: &MessageRouter) -> RelayResult<()> {
        let weak = Arc::downgrade(self);
        router.register(
            MessageType::Ping.as_str(),
            handler_fn(move |_| {
                let weak = weak.clone();
                async move {
                    let relay = weak.upgrade()?;
                    serde_json::to_value(PongPayload::new(relay.stats())).ok()
                }
            }),
        )?;

        for msg_type in INGEST_TYPES {
            let weak = Arc::downgrade(self);
            router.register(
                msg_type.as_str(),
                handler_fn(move |message| {
                    let weak = weak.clone();
                    async move {
                        let relay = weak.upgrade()?;
                        relay.ingest_message(msg_type, message);
                        None
                    }
                }),
            )?;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        router.register(
            MessageType::PermissionsUpdated.as_str(),
            handler_fn(move |message| {
                let weak = weak.clone();
                async move {
                    let relay = weak.upgrade()?;
                    match parse_permissions(message.payload()) {
                        Some(permissions) => relay.apply_permissions(permissions),
                        None => warn!("ignoring malformed PERMISSIONS_UPDATED"),
                    }
                    None
                }
            }),
        )?;
        Ok(())
    }

    // ---- publish / ingest ----

    /// Store, persist, notify, then broadcast `<KIND>_DATA` on every channel.
    pub async fn publish<T: Serialize>(&self, kind: DataKind, record: &T) -> RelayResult<Record> {
        let record = to_record(record)?;
        self.ingest(kind, record.clone());
        self.broadcast(kind.data_message().as_str(), record.to_value()).await;
        Ok(record)
    }

    /// `publish` after checking the current permissions. A denied record
    /// never reaches the store.
    pub async fn publish_gated<T: Serialize>(&self, kind: DataKind, record: &T) -> RelayResult<Record> {
        self.check_permission(kind)?;
        self.publish(kind, record).await
    }

    /// Gated publish under an event type such as `CONTENT_TRIGGER`. The
    /// record lands in the store the event type feeds.
    pub async fn publish_event<T: Serialize>(&self, msg_type: MessageType, record: &T) -> RelayResult<Record> {
        let kind = DataKind::for_message(msg_type).ok_or_else(|| {
            RelayError::MalformedMessage(format!("{} does not carry a record", msg_type))
        })?;
        self.check_permission(kind)?;
        let record = to_record(record)?;
        self.ingest(kind, record.clone());
        self.broadcast(msg_type.as_str(), record.to_value()).await;
        Ok(record)
    }

    fn check_permission(&self, kind: DataKind) -> RelayResult<()> {
        if self.permissions.borrow().allows(kind) {
            Ok(())
        } else {
            debug!(%kind, "publish denied by permissions");
            Err(RelayError::PermissionDenied(kind))
        }
    }

    /// Send to every channel. Failures are per channel and only logged.
    pub async fn broadcast(&self, msg_type: &str, payload: Value) {
        for router in self.routers() {
            if let Err(e) = router.send(msg_type, payload.clone()).await {
                debug!(link = %router.manager().transport().name(), msg_type, error = %e, "broadcast not delivered");
            }
        }
    }

    fn ingest_message(&self, msg_type: MessageType, message: Message) {
        let Some(kind) = DataKind::for_message(msg_type) else { return };
        match Record::from_value(message.into_payload(), now_millis()) {
            Ok(record) => self.ingest(kind, record),
            Err(e) => warn!(%msg_type, error = %e, "dropping invalid inbound record"),
        }
    }

    /// Append without re-broadcasting, then persist and notify.
    pub fn ingest(&self, kind: DataKind, record: Record) {
        self.update_store(kind, |store| {
            store.append(record.clone());
        });
        self.notify(kind, &record);
    }

    pub fn ingest_all(&self, kind: DataKind, records: Vec<Record>) -> usize {
        let count = records.len();
        self.update_store(kind, |store| store.extend(records.iter().cloned()));
        for record in &records {
            self.notify(kind, record);
        }
        count
    }

    fn notify(&self, kind: DataKind, record: &Record) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .get(&kind)
            .map(|subs| subs.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();
        for subscriber in subscribers {
            subscriber(record);
        }
    }

    // ---- subscribers / reads ----

    pub fn subscribe<F>(&self, kind: DataKind, callback: F) -> SubscriptionId
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let mut removed = false;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn get_recent(&self, kind: DataKind, limit: usize) -> Vec<Record> {
        self.stores.read().get(&kind).map(|s| s.recent(limit)).unwrap_or_default()
    }

    pub fn len(&self, kind: DataKind) -> usize {
        self.stores.read().get(&kind).map(BoundedStore::len).unwrap_or(0)
    }

    pub fn stats(&self) -> DataStats {
        DataStats {
            emotion: self.len(DataKind::Emotion),
            gaze: self.len(DataKind::Gaze),
            analytics: self.len(DataKind::Analytics),
            webcam_data: self.len(DataKind::Webcam),
        }
    }

    // ---- permissions / settings ----

    pub fn permissions(&self) -> PermissionSet {
        self.permissions.borrow().clone()
    }

    pub fn watch_permissions(&self) -> watch::Receiver<PermissionSet> {
        self.permissions.subscribe()
    }

    /// Replace the permission set and persist it. Does not broadcast.
    pub fn apply_permissions(&self, permissions: PermissionSet) {
        match serde_json::to_value(&permissions) {
            Ok(value) => self.persist(PERMISSIONS_KEY, value),
            Err(e) => warn!(error = %e, "permissions not persisted"),
        }
        self.permissions.send_replace(permissions);
    }

    /// Replace the permission set, persist it, and tell every peer.
    pub async fn set_permissions(&self, permissions: PermissionSet) {
        self.apply_permissions(permissions.clone());
        match serde_json::to_value(PermissionsRequest { permissions }) {
            Ok(payload) => self.broadcast(MessageType::PermissionsUpdated.as_str(), payload).await,
            Err(e) => warn!(error = %e, "permissions update not broadcast"),
        }
    }

    pub fn settings(&self) -> Map<String, Value> {
        self.settings.read().clone()
    }

    /// Merge `patch` into the settings object and persist the result.
    pub fn update_settings(&self, patch: Map<String, Value>) -> Map<String, Value> {
        let merged = {
            let mut settings = self.settings.write();
            settings.extend(patch);
            settings.clone()
        };
        self.persist(SETTINGS_KEY, Value::Object(merged.clone()));
        merged
    }

    // ---- requests / snapshots ----

    /// Request over the first channel that answers.
    pub async fn request(&self, msg_type: MessageType, payload: Value) -> RelayResult<Message> {
        let mut last_err = RelayError::ChannelUnavailable;
        for router in self.routers() {
            if !router.manager().is_connected() {
                continue;
            }
            match router.request(msg_type.as_str(), payload.clone(), self.config.request_timeout).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    debug!(link = %router.manager().transport().name(), %msg_type, error = %e, "request failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    pub async fn request_via(&self, channel: &str, msg_type: MessageType, payload: Value) -> RelayResult<Message> {
        let router = self.channel(channel).ok_or(RelayError::ChannelUnavailable)?;
        router.request(msg_type.as_str(), payload, self.config.request_timeout).await
    }

    /// Pull `{permissions, analytics, webcamData, settings}` from the peer.
    /// Falls back to the local mirror on any failure; never errors.
    pub async fn request_snapshot(&self) -> Snapshot {
        match self.request(MessageType::GetContinuousData, json!({})).await {
            Ok(reply) => match parse_snapshot(reply.into_payload()) {
                Ok(snapshot) => {
                    self.apply_snapshot(&snapshot);
                    return snapshot;
                }
                Err(e) => warn!(error = %e, "malformed snapshot reply, using local data"),
            },
            Err(e) => debug!(error = %e, "snapshot request failed, using local data"),
        }
        self.local_snapshot().await
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) {
        self.apply_permissions(snapshot.permissions.clone());
        for (kind, records) in [
            (DataKind::Analytics, &snapshot.analytics),
            (DataKind::Webcam, &snapshot.webcam_data),
        ] {
            self.update_store(kind, |store| store.replace(records.clone()));
        }
        if !snapshot.settings.is_empty() {
            self.update_settings(snapshot.settings.clone());
        }
    }

    /// Snapshot from the mirror, or from memory where the mirror has nothing.
    pub async fn local_snapshot(&self) -> Snapshot {
        let permissions = match self.mirror.get(PERMISSIONS_KEY).await {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|_| self.permissions()),
            None => self.permissions(),
        };
        let settings = match self.mirror.get(SETTINGS_KEY).await {
            Some(Value::Object(map)) => map,
            _ => self.settings(),
        };
        Snapshot {
            permissions,
            analytics: self.mirrored_records(DataKind::Analytics).await,
            webcam_data: self.mirrored_records(DataKind::Webcam).await,
            settings,
            source: SnapshotSource::Local,
        }
    }

    /// Snapshot of current in-memory state, as served to peers.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            permissions: self.permissions(),
            analytics: self.get_recent(DataKind::Analytics, usize::MAX),
            webcam_data: self.get_recent(DataKind::Webcam, usize::MAX),
            settings: self.settings(),
            source: SnapshotSource::Remote,
        }
    }

    async fn mirrored_records(&self, kind: DataKind) -> Vec<Record> {
        match self.mirror.get(kind.storage_key()).await {
            Some(value) => records_from_value(value),
            None => self.get_recent(kind, usize::MAX),
        }
    }

    // ---- persistence ----

    /// Mutate one store and queue its persisted copy under the same lock,
    /// so mirror writes for a kind land in the order the store changed.
    fn update_store<F>(&self, kind: DataKind, update: F)
    where
        F: FnOnce(&mut BoundedStore<Record>),
    {
        let mut stores = self.stores.write();
        let store = stores
            .entry(kind)
            .or_insert_with(|| BoundedStore::new(self.config.capacity(kind)));
        update(store);
        self.persist(kind.storage_key(), Value::Array(store.iter().map(Record::to_value).collect()));
    }

    fn persist(&self, key: &str, value: Value) {
        if self.persist_tx.send(PersistJob::Write { key: key.to_string(), value }).is_err() {
            warn!(key, "persistence worker gone, write skipped");
        }
    }

    /// Load stores, permissions, and settings from the mirror. Returns the
    /// number of records restored.
    pub async fn restore(&self) -> usize {
        let mut restored = 0;
        for kind in DataKind::ALL {
            if let Some(value) = self.mirror.get(kind.storage_key()).await {
                let records = records_from_value(value);
                restored += records.len();
                let mut stores = self.stores.write();
                let store = stores
                    .entry(kind)
                    .or_insert_with(|| BoundedStore::new(self.config.capacity(kind)));
                store.replace(records);
            }
        }
        if let Some(value) = self.mirror.get(PERMISSIONS_KEY).await {
            match serde_json::from_value::<PermissionSet>(value) {
                Ok(permissions) => {
                    self.permissions.send_replace(permissions);
                }
                Err(e) => warn!(error = %e, "ignoring malformed persisted permissions"),
            }
        }
        if let Some(Value::Object(settings)) = self.mirror.get(SETTINGS_KEY).await {
            *self.settings.write() = settings;
        }
        info!(records = restored, "restored persisted state");
        restored
    }

    /// Empty every store and remove the persisted arrays. Permissions and
    /// settings are kept.
    pub fn clear_data(&self) {
        let mut stores = self.stores.write();
        for store in stores.values_mut() {
            store.clear();
        }
        for kind in DataKind::ALL {
            let _ = self.persist_tx.send(PersistJob::Remove(kind.storage_key().to_string()));
        }
        drop(stores);
        info!("cleared all stores");
    }

    /// Wait until every persistence job queued so far has run.
    pub async fn flush_persistence(&self) {
        let (tx, rx) = oneshot::channel();
        if self.persist_tx.send(PersistJob::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Close every channel and drain pending writes.
    pub async fn shutdown(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.write().drain(..).collect();
        for channel in &channels {
            channel.health.lock().stop();
            let manager = channel.router.manager();
            manager.close();
            if tokio::time::timeout(SHUTDOWN_GRACE, manager.wait_for_state(ChannelState::Disconnected))
                .await
                .is_err()
            {
                warn!(channel = %channel.name, "channel did not close in time");
            }
        }
        self.flush_persistence().await;
        info!(channels = channels.len(), "relay shut down");
    }
}

impl Drop for DataRelay {
    fn drop(&mut self) {
        self.persist_task.abort();
    }
}

async fn persist_worker(mirror: StorageMirror, mut jobs: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            PersistJob::Write { key, value } => {
                if let Err(e) = mirror.set(&key, &value).await {
                    warn!(key = %key, error = %e, "persistence failed");
                }
            }
            PersistJob::Remove(key) => mirror.remove(&key).await,
            PersistJob::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn to_record<T: Serialize>(record: &T) -> RelayResult<Record> {
    let value = serde_json::to_value(record)?;
    Ok(Record::from_value(value, now_millis())?)
}

/// Valid records from a persisted array; anything else is skipped.
pub fn records_from_value(value: Value) -> Vec<Record> {
    let now = now_millis();
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match Record::from_value(item, now) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping invalid persisted record");
                    None
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Accepts `{permissions: {...}}` or a bare permission set.
pub fn parse_permissions(payload: &Value) -> Option<PermissionSet> {
    serde_json::from_value::<PermissionsRequest>(payload.clone())
        .map(|req| req.permissions)
        .or_else(|_| serde_json::from_value::<PermissionSet>(payload.clone()))
        .ok()
}

fn parse_snapshot(mut payload: Value) -> RelayResult<Snapshot> {
    if let Value::Object(map) = &mut payload {
        map.insert("source".to_string(), json!(SnapshotSource::Remote));
    }
    Ok(serde_json::from_value(payload)?)
}
