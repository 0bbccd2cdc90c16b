use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::{BreakReminder, MessageType};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::detector::Detector;
use crate::error::RelayError;
use crate::relay::DataRelay;

/// Shared on/off switch checked on every producer tick. Clones share
/// the same flag.
#[derive(Debug, Clone, Default)]
pub struct TrackingGate(Arc<AtomicBool>);

impl TrackingGate {
    pub fn new(on: bool) -> Self {
        Self(Arc::new(AtomicBool::new(on)))
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set(&self, on: bool) -> bool {
        self.0.swap(on, Ordering::SeqCst)
    }
}

/// Timer task that feeds a relay. Stopping or dropping aborts the task.
pub struct Producer {
    name: String,
    task: Option<JoinHandle<()>>,
}

impl Producer {
    /// Run `detector` every `every` and publish the result. Ticks are
    /// skipped while `tracking` is off; the relay's permissions gate the
    /// publish itself.
    pub fn start<D, I>(
        name: &str,
        relay: Arc<DataRelay>,
        tracking: TrackingGate,
        detector: Arc<D>,
        input: I,
        every: Duration,
    ) -> Self
    where
        D: Detector + 'static,
        I: Fn() -> D::Input + Send + Sync + 'static,
    {
        let label = name.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !tracking.is_on() {
                    continue;
                }
                let output = match detector.detect(input()).await {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(producer = %label, error = %e, "detector failed");
                        continue;
                    }
                };
                match relay.publish_gated(detector.kind(), &output).await {
                    Ok(_) => {}
                    Err(RelayError::PermissionDenied(kind)) => {
                        debug!(producer = %label, %kind, "collection not permitted, sample dropped");
                    }
                    Err(e) => warn!(producer = %label, error = %e, "publish failed"),
                }
            }
        });
        info!(producer = %name, ?every, "producer started");
        Self { name: name.to_string(), task: Some(task) }
    }

    /// Emit a `BREAK_REMINDER` after `after` of uninterrupted collection.
    /// Stopping tracking, pausing, or revoking collection resets the clock.
    pub fn break_reminder(relay: Arc<DataRelay>, tracking: TrackingGate, after: Duration, check_every: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + check_every, check_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut since = Instant::now();
            loop {
                ticker.tick().await;
                if !tracking.is_on() || !relay.permissions().collection_active() {
                    since = Instant::now();
                    continue;
                }
                let elapsed = since.elapsed();
                if elapsed < after {
                    continue;
                }
                let minutes = elapsed.as_secs() / 60;
                let reminder = BreakReminder {
                    message: format!("You've been active for {} minutes. Time for a short break.", minutes),
                    continuous_minutes: minutes,
                    timestamp: None,
                };
                match relay.publish_event(MessageType::BreakReminder, &reminder).await {
                    Ok(_) => info!(minutes, "break reminder sent"),
                    Err(e) => debug!(error = %e, "break reminder not sent"),
                }
                since = Instant::now();
            }
        });
        Self { name: "break-reminder".to_string(), task: Some(task) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(producer = %self.name, "producer stopped");
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop();
    }
}
