mod pulse;
mod websocket;

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Json},
    response::IntoResponse,
    routing::get,
    Router,
};
use dotenvy::dotenv;
use serde_json::json;
use std::{collections::HashMap, env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, RwLock},
    time::Instant,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use websocket::{handle_websocket, Outgoing};

const DEFAULT_PULSE_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub clients: Arc<RwLock<HashMap<String, mpsc::Sender<Outgoing>>>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            started_at: Instant::now(),
        }
    }

    pub async fn register(&self, client_id: String, tx: mpsc::Sender<Outgoing>) {
        self.clients.write().await.insert(client_id, tx);
    }

    pub async fn unregister(&self, client_id: &str) {
        self.clients.write().await.remove(client_id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Queue `text` for every client except `except`. Returns how many
    /// clients accepted it; a client whose buffer is full misses the frame.
    pub async fn broadcast(&self, text: &str, except: Option<&str>) -> usize {
        let targets: Vec<(String, mpsc::Sender<Outgoing>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != except)
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.try_send(Outgoing::Text(text.to_string())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = %id, "client buffer full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(client = %id, "client already gone");
                }
            }
        }
        delivered
    }

    /// Ask every connected socket to close.
    pub async fn close_all(&self) {
        let clients: Vec<mpsc::Sender<Outgoing>> = self.clients.read().await.values().cloned().collect();
        for tx in clients {
            let _ = tx.send(Outgoing::Close).await;
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(handle_websocket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "relay_server=info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port: u16 = env::var("PORT")
        .unwrap_or_else(|_| "3001".to_string())
        .parse()
        .context("PORT must be a port number")?;
    let pulse_secs: u64 = env::var("PULSE_INTERVAL_SECS")
        .unwrap_or_else(|_| DEFAULT_PULSE_SECS.to_string())
        .parse()
        .context("PULSE_INTERVAL_SECS must be a whole number of seconds")?;

    let state = AppState::new();
    let pulse_task = tokio::spawn(pulse::run(state.clone(), Duration::from_secs(pulse_secs.max(1))));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on {}", addr);
    info!("WebSocket endpoint: ws://localhost:{}/ws", port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    pulse_task.abort();
    info!("Server stopped");
    Ok(())
}

async fn health_check(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "clients": state.client_count().await,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

/// Resolves on SIGINT or SIGTERM after asking every socket to close, so the
/// server stops accepting and upgraded connections wind down with it.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let clients = state.client_count().await;
    info!(clients, "Shutting down, closing client sockets");
    state.close_all().await;
}
