use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use relay_core::detector::{SimulatedGazeTracker, SimulatedEmotionDetector};
use relay_core::protocol::{CampusPulse, CollectionMethod, DataKind, MessageType, PermissionSet};
use relay_core::{
    handler_fn, ChannelOptions, DashboardClient, DataRelay, ExtensionState, FileStorage, MemoryStorage, Producer,
    RelayConfig, SocketAdapter, StorageMirror,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Owns permissions and runs the simulated producers.
    Background,
    /// Pulls a snapshot and prints relayed events.
    Dashboard,
}

#[derive(Parser, Debug)]
#[clap(name = "relay-client")]
#[clap(about = "Wellness relay endpoint", long_about = None)]
struct Args {
    #[clap(long, value_enum, default_value = "dashboard")]
    role: Role,

    /// WebSocket URL of the relay server (overrides RELAY_WS_URL)
    #[clap(long)]
    url: Option<String>,

    /// Health endpoint; derived from the WebSocket URL when omitted
    #[clap(long)]
    health_url: Option<String>,

    /// Seconds between simulated samples
    #[clap(long, default_value_t = 5)]
    sample_secs: u64,

    /// Minutes of continuous collection before a break reminder
    #[clap(long, default_value_t = 45)]
    break_minutes: u64,

    /// Seed for the simulated detectors
    #[clap(long)]
    seed: Option<u64>,

    /// Grant content and webcam collection on start (background only)
    #[clap(long)]
    grant: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    relay_core::config::load_dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay_client=info,relay_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = RelayConfig::from_env().context("invalid relay configuration")?;
    if let Some(url) = &args.url {
        config.ws_url = url.clone();
    }
    let health_url = args.health_url.clone().unwrap_or_else(|| health_url_for(&config.ws_url));
    check_health(&health_url).await;

    let relay = DataRelay::new(config.clone(), mirror_for(&config));
    let restored = relay.restore().await;
    if restored > 0 {
        info!(records = restored, "Restored persisted records");
    }

    let options = ChannelOptions::from_config(&config);
    relay
        .add_channel("relay", Arc::new(SocketAdapter::new(config.ws_url.clone())), options)
        .context("failed to open relay channel")?;
    info!(role = ?args.role, url = %config.ws_url, "Relay client started");

    match args.role {
        Role::Background => run_background(relay, &args).await,
        Role::Dashboard => run_dashboard(relay).await,
    }
}

fn mirror_for(config: &RelayConfig) -> StorageMirror {
    match &config.storage_dir {
        Some(dir) => StorageMirror::new().with_backend(Arc::new(FileStorage::new(dir, config.storage_prefix.clone()))),
        None => StorageMirror::new().with_backend(Arc::new(MemoryStorage::new(config.storage_prefix.clone()))),
    }
}

/// `ws://host:port/ws` → `http://host:port/health`.
fn health_url_for(ws_url: &str) -> String {
    let http = if let Some(rest) = ws_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = ws_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        ws_url.to_string()
    };
    let base = http.trim_end_matches('/');
    let base = base.strip_suffix("/ws").unwrap_or(base);
    format!("{}/health", base)
}

/// Advisory only; the reconnection manager keeps trying either way.
async fn check_health(url: &str) {
    let client = reqwest::Client::new();
    let response = client.get(url).timeout(Duration::from_secs(3)).send().await;
    match response {
        Ok(resp) => match resp.json::<serde_json::Value>().await {
            Ok(body) => info!(
                clients = %body["clients"],
                uptime_secs = %body["uptimeSecs"],
                "Relay server is up"
            ),
            Err(e) => warn!("Unexpected health response from {}: {}", url, e),
        },
        Err(e) => warn!("Relay server health check failed ({}): {}", url, e),
    }
}

async fn run_background(relay: Arc<DataRelay>, args: &Args) -> Result<()> {
    let state = ExtensionState::new(relay.clone());
    state.install().await.context("failed to install background handlers")?;
    if args.grant {
        relay.set_permissions(PermissionSet::granted(CollectionMethod::Both)).await;
    }

    let every = Duration::from_secs(args.sample_secs.max(1));
    let seed = args.seed;
    let gate = state.tracking_gate();
    let producers = vec![
        Producer::start("emotion", relay.clone(), gate.clone(), Arc::new(SimulatedEmotionDetector::new(seed)), || (), every),
        Producer::start("gaze", relay.clone(), gate.clone(), Arc::new(SimulatedGazeTracker::new(seed)), || (), every),
        Producer::start(
            "webcam",
            relay.clone(),
            gate.clone(),
            Arc::new(SimulatedEmotionDetector::webcam(seed.map(|s| s.wrapping_add(1)))),
            || (),
            every * 2,
        ),
        Producer::break_reminder(
            relay.clone(),
            gate,
            Duration::from_secs(args.break_minutes * 60),
            Duration::from_secs(60),
        ),
    ];
    state.set_tracking(true);
    info!(producers = producers.len(), "Simulated producers running");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    drop(producers);
    state.shutdown().await;
    Ok(())
}

async fn run_dashboard(relay: Arc<DataRelay>) -> Result<()> {
    let dashboard = DashboardClient::new(relay.clone()).context("failed to install dashboard handlers")?;

    relay.register_handler(
        MessageType::CampusPulseUpdate.as_str(),
        handler_fn(|message| async move {
            match serde_json::from_value::<CampusPulse>(message.payload().clone()) {
                Ok(pulse) => println!(
                    "[pulse] {} active, stress {:.2}, focus {:.2}, trending {}",
                    pulse.active_users, pulse.stress_level, pulse.focus_level, pulse.trending_emotion
                ),
                Err(e) => warn!("Malformed campus pulse: {}", e),
            }
            None
        }),
    )?;

    for kind in DataKind::ALL {
        relay.subscribe(kind, move |record| {
            println!("[{}] {}", kind, record.to_value());
        });
    }

    // Give the socket a moment before pulling the first snapshot
    tokio::time::sleep(Duration::from_secs(1)).await;
    let snapshot = dashboard.snapshot().await;
    println!(
        "[snapshot] source {:?}, {} analytics, {} webcam, collection {}",
        snapshot.source,
        snapshot.analytics.len(),
        snapshot.webcam_data.len(),
        if snapshot.permissions.collection_active() { "active" } else { "off" }
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    relay.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_url_follows_socket_url() {
        assert_eq!(health_url_for("ws://127.0.0.1:3001/ws"), "http://127.0.0.1:3001/health");
        assert_eq!(health_url_for("wss://relay.example/ws/"), "https://relay.example/health");
        assert_eq!(health_url_for("ws://localhost:9000"), "http://localhost:9000/health");
    }

    #[test]
    fn role_parses_from_flag() {
        let args = Args::parse_from(["relay-client", "--role", "background", "--grant"]);
        assert_eq!(args.role, Role::Background);
        assert!(args.grant);
        assert_eq!(Args::parse_from(["relay-client"]).role, Role::Dashboard);
    }
}
