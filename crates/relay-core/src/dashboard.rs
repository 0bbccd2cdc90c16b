//! Typed client for the dashboard side of the relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use protocol::{MessageType, PermissionSet, PermissionsRequest, Snapshot, SyncLocalData};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{RelayError, RelayResult};
use crate::relay::{parse_permissions, DataRelay};
use crate::router::handler_fn;

pub struct DashboardClient {
    relay: Arc<DataRelay>,
    extension_present: AtomicBool,
}

impl DashboardClient {
    /// Wrap `relay` and track extension presence announcements.
    pub fn new(relay: Arc<DataRelay>) -> RelayResult<Arc<Self>> {
        let client = Arc::new(Self { relay, extension_present: AtomicBool::new(false) });
        for (msg_type, present) in [
            (MessageType::ExtensionConnected, true),
            (MessageType::ExtensionDisconnected, false),
        ] {
            let weak: Weak<Self> = Arc::downgrade(&client);
            client.relay.register_handler(
                msg_type.as_str(),
                handler_fn(move |_| {
                    if let Some(client) = weak.upgrade() {
                        client.extension_present.store(present, Ordering::SeqCst);
                        info!(present, "extension presence changed");
                    }
                    async { None }
                }),
            )?;
        }
        Ok(client)
    }

    pub fn relay(&self) -> &Arc<DataRelay> {
        &self.relay
    }

    pub fn extension_present(&self) -> bool {
        self.extension_present.load(Ordering::SeqCst)
    }

    pub async fn get_permissions(&self) -> RelayResult<PermissionSet> {
        let reply = self.relay.request(MessageType::GetPermissions, json!({})).await?;
        let permissions = parse_permissions(reply.payload())
            .ok_or_else(|| RelayError::MalformedMessage("GET_PERMISSIONS reply".to_string()))?;
        self.extension_present.store(true, Ordering::SeqCst);
        Ok(permissions)
    }

    /// Ask the background to store `permissions`; returns what it stored.
    pub async fn request_permissions(&self, permissions: PermissionSet) -> RelayResult<PermissionSet> {
        let payload = serde_json::to_value(PermissionsRequest { permissions })?;
        let reply = self.relay.request(MessageType::RequestPermissions, payload).await?;
        let stored = parse_permissions(reply.payload())
            .ok_or_else(|| RelayError::MalformedMessage("REQUEST_PERMISSIONS reply".to_string()))?;
        self.relay.apply_permissions(stored.clone());
        Ok(stored)
    }

    pub async fn analyze_page(&self) -> RelayResult<Value> {
        let reply = self.relay.request(MessageType::AnalyzePage, json!({})).await?;
        Ok(reply.into_payload())
    }

    pub async fn sync_local_data(&self, data: Map<String, Value>) -> RelayResult<Value> {
        let payload = serde_json::to_value(SyncLocalData { data })?;
        let reply = self.relay.request(MessageType::SyncLocalData, payload).await?;
        Ok(reply.into_payload())
    }

    pub async fn clear_data(&self) -> RelayResult<()> {
        self.relay.request(MessageType::ClearData, json!({})).await?;
        self.relay.clear_data();
        Ok(())
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.relay.request_snapshot().await
    }

    /// Reconnect every channel now, skipping any pending backoff.
    pub fn check_connection(&self) {
        self.relay.force_reconnect_all();
    }
}
