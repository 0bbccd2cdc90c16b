//! Connection state machine with bounded exponential backoff.
//!
//! ```text
//! disconnected --connect()--> connecting --(open)--> connected
//! connected --(close/error/mark_down)--> disconnected --> reconnecting --(delay)--> connecting
//! reconnecting --(max attempts exhausted)--> disconnected (gave up)
//! ```
//!
//! All transitions happen on one driver task fed by a command channel, so a
//! link-loss report and a user command can never interleave mid-transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::Message;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};
use crate::transport::{LinkEvent, TransportAdapter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ChannelState,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub is_reconnecting: bool,
    pub last_error: Option<String>,
    pub connection_id: Option<String>,
    pub message_count: u64,
    pub reconnect_attempts: u32,
    /// Set once the attempt cap is hit; cleared by `connect`/`force_reconnect`.
    pub gave_up: bool,
}

impl ConnectionStatus {
    fn set_state(&mut self, state: ChannelState) {
        self.state = state;
        self.is_connected = state == ChannelState::Connected;
        self.is_connecting = state == ChannelState::Connecting;
        self.is_reconnecting = state == ChannelState::Reconnecting;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged { from: ChannelState, to: ChannelState },
    GaveUp { attempts: u32, last_error: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever at the capped delay.
    pub max_attempts: Option<u32>,
    /// A connect that has not finished by then counts as a failed attempt.
    pub connect_timeout: Duration,
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl ReconnectPolicy {
    /// Extension-side links: five attempts, then give up.
    pub fn extension() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: Some(5),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Socket links: unlimited attempts with the delay capped.
    pub fn socket() -> Self {
        Self { max_attempts: None, ..Self::extension() }
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1)).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::socket()
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    ForceReconnect,
    LinkLost { epoch: u64, reason: String },
    MarkDown(String),
    Close,
}

struct Inner {
    transport: Arc<dyn TransportAdapter>,
    policy: ReconnectPolicy,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Bumped on every successful connect; stale link-loss reports carry an
    /// older value and are ignored.
    epoch: Arc<AtomicU64>,
}

impl Inner {
    fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    fn transition(&self, to: ChannelState, update: impl FnOnce(&mut ConnectionStatus)) {
        let mut from = to;
        self.status.send_modify(|status| {
            from = status.state;
            status.set_state(to);
            update(status);
        });
        if from != to {
            debug!(link = %self.transport.name(), ?from, ?to, "channel state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged { from, to });
        }
    }
}

pub struct ReconnectionManager {
    inner: Arc<Inner>,
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

impl ReconnectionManager {
    /// Take ownership of `transport`. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn TransportAdapter>, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (events, _) = broadcast::channel(64);
        let (commands, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));

        let link_commands = commands.clone();
        let link_epoch = Arc::clone(&epoch);
        transport.on_state_change(Arc::new(move |event: LinkEvent| {
            if let LinkEvent::Closed { reason } = event {
                let epoch = link_epoch.load(Ordering::SeqCst);
                let _ = link_commands.send(Command::LinkLost { epoch, reason });
            }
        }));

        let inner = Arc::new(Inner { transport, policy, status, events, epoch });
        let driver = tokio::spawn(Driver::new(Arc::clone(&inner)).run(rx));
        Self { inner, commands, driver }
    }

    pub fn transport(&self) -> &Arc<dyn TransportAdapter> {
        &self.inner.transport
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Reset the attempt counter and reconnect now, skipping any backoff.
    pub fn force_reconnect(&self) {
        let _ = self.commands.send(Command::ForceReconnect);
    }

    /// Treat the channel as down even if the transport still reports open.
    pub fn mark_down<S: Into<String>>(&self, reason: S) {
        let _ = self.commands.send(Command::MarkDown(reason.into()));
    }

    /// Close on the caller's behalf. Pending retry timers are dropped.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve once the channel reaches `target`.
    pub async fn wait_for_state(&self, target: ChannelState) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|s| s.state == target).await;
    }

    /// Send through the transport. Only valid while connected.
    pub async fn send(&self, message: Message) -> RelayResult<()> {
        if !self.is_connected() {
            return Err(RelayError::ChannelUnavailable);
        }
        self.inner.transport.send(message).await?;
        self.inner.status.send_modify(|s| s.message_count += 1);
        Ok(())
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

struct Driver {
    inner: Arc<Inner>,
    attempt: u32,
    retry_at: Option<Instant>,
}

impl Driver {
    fn new(inner: Arc<Inner>) -> Self {
        Self { inner, attempt: 0, retry_at: None }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        // A command that cut a connect attempt short
        let mut next: Option<Command> = None;
        loop {
            let command = match (next.take(), self.retry_at) {
                (Some(command), _) => Some(command),
                (None, Some(at)) => tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep_until(at) => {
                        self.retry_at = None;
                        next = self.try_connect(&mut rx).await;
                        continue;
                    }
                },
                (None, None) => rx.recv().await,
            };
            let Some(command) = command else { break };

            match command {
                Command::Connect => match self.inner.state() {
                    ChannelState::Disconnected => {
                        self.attempt = 0;
                        next = self.try_connect(&mut rx).await;
                    }
                    state => debug!(?state, "connect ignored"),
                },
                Command::ForceReconnect => {
                    self.retry_at = None;
                    self.attempt = 0;
                    if self.inner.transport.is_open() {
                        self.inner.transport.close().await;
                    }
                    next = self.try_connect(&mut rx).await;
                }
                Command::LinkLost { epoch, reason } => {
                    let current = self.inner.epoch.load(Ordering::SeqCst);
                    if epoch != current || self.inner.state() != ChannelState::Connected {
                        debug!(reason = %reason, "stale link-loss report ignored");
                        continue;
                    }
                    warn!(link = %self.inner.transport.name(), reason = %reason, "link lost");
                    self.on_disconnect(reason);
                }
                Command::MarkDown(reason) => {
                    if self.inner.state() != ChannelState::Connected {
                        continue;
                    }
                    warn!(link = %self.inner.transport.name(), reason = %reason, "channel marked down");
                    self.on_disconnect(reason);
                    self.inner.transport.close().await;
                }
                Command::Close => {
                    self.retry_at = None;
                    self.attempt = 0;
                    self.inner.transport.close().await;
                    self.inner.transition(ChannelState::Disconnected, |s| {
                        s.connection_id = None;
                        s.reconnect_attempts = 0;
                    });
                    info!(link = %self.inner.transport.name(), "channel closed by caller");
                }
            }
        }
    }

    /// One connect attempt, bounded by the policy's timeout. A `Close` or
    /// `ForceReconnect` arriving meanwhile abandons the attempt and is
    /// handed back to the caller; other commands are moot while connecting.
    async fn try_connect(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) -> Option<Command> {
        self.inner.transition(ChannelState::Connecting, |s| s.gave_up = false);
        let transport = Arc::clone(&self.inner.transport);
        let limit = self.inner.policy.connect_timeout;
        let connect = tokio::time::timeout(limit, transport.connect());
        tokio::pin!(connect);

        let result = loop {
            tokio::select! {
                result = &mut connect => break result,
                command = rx.recv() => match command {
                    Some(command @ (Command::Close | Command::ForceReconnect)) => {
                        debug!(link = %transport.name(), ?command, "connect attempt abandoned");
                        return Some(command);
                    }
                    Some(command) => debug!(?command, "ignored while connecting"),
                    None => return None,
                },
            }
        };

        match result {
            Ok(Ok(())) => {
                self.attempt = 0;
                self.inner.epoch.fetch_add(1, Ordering::SeqCst);
                let id = Uuid::new_v4().to_string();
                info!(link = %self.inner.transport.name(), connection_id = %id, "channel connected");
                self.inner.transition(ChannelState::Connected, |s| {
                    s.connection_id = Some(id);
                    s.last_error = None;
                    s.reconnect_attempts = 0;
                });
            }
            Ok(Err(e)) => {
                warn!(link = %self.inner.transport.name(), error = %e, attempt = self.attempt, "connect failed");
                self.on_disconnect(e.to_string());
            }
            Err(_) => {
                warn!(link = %self.inner.transport.name(), ?limit, attempt = self.attempt, "connect timed out");
                self.on_disconnect(format!("connect timed out after {:?}", limit));
            }
        }
        None
    }

    /// Enter `disconnected` and either schedule the next attempt or give up.
    fn on_disconnect(&mut self, reason: String) {
        self.inner.transition(ChannelState::Disconnected, |s| {
            s.last_error = Some(reason.clone());
            s.connection_id = None;
        });

        if let Some(max) = self.inner.policy.max_attempts {
            if self.attempt >= max {
                self.retry_at = None;
                let attempts = self.attempt;
                self.inner.status.send_modify(|s| s.gave_up = true);
                warn!(link = %self.inner.transport.name(), attempts, "giving up on reconnection");
                let _ = self.inner.events.send(ConnectionEvent::GaveUp {
                    attempts,
                    last_error: Some(reason),
                });
                return;
            }
        }

        self.attempt += 1;
        let delay = self.inner.policy.delay_for(self.attempt);
        self.retry_at = Some(Instant::now() + delay);
        let attempt = self.attempt;
        info!(link = %self.inner.transport.name(), attempt, ?delay, "reconnecting");
        self.inner.transition(ChannelState::Reconnecting, |s| s.reconnect_attempts = attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_then_capped() {
        let policy = ReconnectPolicy::extension();
        let delays: Vec<_> = (1..=40).map(|n| policy.delay_for(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(1000));
        assert_eq!(delays[2], Duration::from_millis(3000));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(30_000));
    }

    #[test]
    fn zero_attempt_uses_base_delay() {
        assert_eq!(ReconnectPolicy::socket().delay_for(0), Duration::from_millis(1000));
    }

    #[test]
    fn status_flags_follow_state() {
        let mut status = ConnectionStatus::default();
        status.set_state(ChannelState::Reconnecting);
        assert!(status.is_reconnecting && !status.is_connected && !status.is_connecting);
        status.set_state(ChannelState::Connected);
        assert!(status.is_connected && !status.is_reconnecting);
    }
}
