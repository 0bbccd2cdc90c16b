//! Application-level heartbeat for long-lived channels.
//!
//! A transport can report open long after the peer has gone away. The
//! monitor pings on an interval and marks the channel down when the `PONG`
//! does not come back in time, which hands control to the reconnection
//! manager.

use std::sync::Arc;
use std::time::Duration;

use protocol::{MessageType, PongPayload};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::router::MessageRouter;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Zero disables the resync tick.
    pub resync_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            resync_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    Healthy { latency: Duration },
    Unhealthy { reason: String },
    ResyncDue,
}

pub struct HealthMonitor {
    events: broadcast::Sender<HealthEvent>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self { events, task: None }
    }

    /// Start pinging through `router`. Restarting replaces the old task.
    pub fn start(&mut self, router: Arc<MessageRouter>, config: HealthConfig) {
        self.stop();
        let events = self.events.clone();
        self.task = Some(tokio::spawn(run(router, config, events)));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(router: Arc<MessageRouter>, config: HealthConfig, events: broadcast::Sender<HealthEvent>) {
    let mut heartbeat = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let resync_enabled = !config.resync_interval.is_zero();
    let resync_period = if resync_enabled { config.resync_interval } else { Duration::from_secs(3600) };
    let mut resync = tokio::time::interval_at(Instant::now() + resync_period, resync_period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Some(event) = ping(&router, config.timeout).await {
                    let _ = events.send(event);
                }
            }
            _ = resync.tick(), if resync_enabled => {
                if router.manager().is_connected() {
                    let _ = events.send(HealthEvent::ResyncDue);
                }
            }
        }
    }
}

async fn ping(router: &MessageRouter, timeout: Duration) -> Option<HealthEvent> {
    let manager = router.manager();
    if !manager.is_connected() {
        return None;
    }
    let started = Instant::now();
    let reason = match router.request(MessageType::Ping.as_str(), json!({}), timeout).await {
        Ok(reply) => match serde_json::from_value::<PongPayload>(reply.payload().clone()) {
            Ok(pong) if pong.is_valid() && reply.kind() == Some(MessageType::Pong) => {
                let latency = started.elapsed();
                debug!(link = %manager.transport().name(), ?latency, "heartbeat ok");
                return Some(HealthEvent::Healthy { latency });
            }
            _ => format!("malformed heartbeat reply {}", reply.msg_type()),
        },
        Err(e @ RelayError::Timeout(..)) => e.to_string(),
        // Nobody to answer right now; not evidence the channel is dead.
        Err(e) if e.is_per_call() => {
            debug!(error = %e, "heartbeat skipped");
            return None;
        }
        // Went down while waiting; the manager already knows.
        Err(RelayError::ChannelUnavailable) if !manager.is_connected() => return None,
        // Still "connected" but nothing gets through
        Err(RelayError::ChannelUnavailable) => "heartbeat PING could not be sent".to_string(),
        Err(e) => e.to_string(),
    };

    warn!(link = %manager.transport().name(), %reason, "heartbeat failed");
    manager.mark_down(reason.clone());
    Some(HealthEvent::Unhealthy { reason })
}
