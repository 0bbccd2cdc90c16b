//! Background-context service: owns the consent state and answers the
//! dashboard's requests.

use std::sync::{Arc, Weak};

use protocol::{
    now_millis, DataKind, Message, MessageType, PermissionSet, PermissionsRequest, SyncLocalData,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::RelayResult;
use crate::producer::TrackingGate;
use crate::relay::{parse_permissions, records_from_value, DataRelay};
use crate::router::handler_fn;

pub struct ExtensionState {
    relay: Arc<DataRelay>,
    tracking: TrackingGate,
}

impl ExtensionState {
    pub fn new(relay: Arc<DataRelay>) -> Arc<Self> {
        Arc::new(Self { relay, tracking: TrackingGate::new(false) })
    }

    pub fn relay(&self) -> &Arc<DataRelay> {
        &self.relay
    }

    /// Register request handlers on the relay and announce the extension.
    pub async fn install(self: &Arc<Self>) -> RelayResult<()> {
        self.on(MessageType::GetPermissions, |state, _| async move {
            serde_json::to_value(state.relay.permissions()).ok()
        })?;
        self.on(MessageType::RequestPermissions, |state, message| async move {
            Some(state.handle_request_permissions(message).await)
        })?;
        self.on(MessageType::GetAnalyticsData, |state, _| async move {
            let records = state.relay.get_recent(DataKind::Analytics, usize::MAX);
            Some(json!({ "analytics": records }))
        })?;
        self.on(MessageType::GetWebcamData, |state, _| async move {
            let records = state.relay.get_recent(DataKind::Webcam, usize::MAX);
            Some(json!({ "webcamData": records }))
        })?;
        self.on(MessageType::GetContinuousData, |state, _| async move {
            serde_json::to_value(state.relay.snapshot()).ok()
        })?;
        self.on(MessageType::SyncLocalData, |state, message| async move {
            Some(state.handle_sync(message))
        })?;
        self.on(MessageType::ClearData, |state, _| async move {
            state.relay.clear_data();
            Some(json!({ "success": true }))
        })?;

        self.relay
            .broadcast(MessageType::ExtensionConnected.as_str(), json!({ "timestamp": now_millis() }))
            .await;
        info!("background service installed");
        Ok(())
    }

    fn on<F, Fut>(self: &Arc<Self>, msg_type: MessageType, f: F) -> RelayResult<()>
    where
        F: Fn(Arc<Self>, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<Value>> + Send + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let f = Arc::new(f);
        self.relay.register_handler(
            msg_type.as_str(),
            handler_fn(move |message| {
                let state = weak.upgrade();
                let f = Arc::clone(&f);
                async move {
                    let state = state?;
                    f(state, message).await
                }
            }),
        )
    }

    async fn handle_request_permissions(&self, message: Message) -> Value {
        let Some(permissions) = parse_permissions(message.payload()) else {
            warn!("REQUEST_PERMISSIONS without a permission set");
            return json!({ "error": "invalid permissions payload" });
        };
        self.relay.set_permissions(permissions).await;
        let stored = self.relay.permissions();
        info!(collection = stored.collection_active(), "permissions updated");
        json!(PermissionsRequest { permissions: stored })
    }

    fn handle_sync(&self, message: Message) -> Value {
        let data = match serde_json::from_value::<SyncLocalData>(message.into_payload()) {
            Ok(sync) => sync.data,
            Err(e) => return json!({ "error": format!("invalid sync payload: {}", e) }),
        };
        let mut synced = 0;
        for kind in [DataKind::Analytics, DataKind::Webcam] {
            if let Some(value) = data.get(kind.storage_key()) {
                let records = records_from_value(value.clone());
                synced += self.relay.ingest_all(kind, records);
            }
        }
        if let Some(Value::Object(settings)) = data.get("settings") {
            self.relay.update_settings(settings.clone());
        }
        json!({ "success": true, "synced": synced })
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.is_on()
    }

    /// Handle for producers; they generate nothing while tracking is off.
    pub fn tracking_gate(&self) -> TrackingGate {
        self.tracking.clone()
    }

    /// Start or stop tracking. Returns the previous value.
    pub fn set_tracking(&self, on: bool) -> bool {
        let was = self.tracking.set(on);
        if was != on {
            info!(tracking = on, "tracking toggled");
        }
        was
    }

    /// Flip `paused` and tell peers. Returns the new value.
    pub async fn toggle_pause(&self) -> bool {
        let mut permissions: PermissionSet = self.relay.permissions();
        let paused = permissions.toggle_pause();
        self.relay.set_permissions(permissions).await;
        paused
    }

    pub async fn shutdown(&self) {
        self.set_tracking(false);
        self.relay
            .broadcast(MessageType::ExtensionDisconnected.as_str(), json!({ "timestamp": now_millis() }))
            .await;
        self.relay.shutdown().await;
    }
}
