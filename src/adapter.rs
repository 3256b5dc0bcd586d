//! Boundary adapter around the simulation core.
//!
//! This is deliberately a thin shell: a health probe, an echoing duplex
//! message stream standing in for the command channel, and the external
//! endpoints (event bus, key-value store) read from the environment and
//! logged at startup. The simulation core never depends on any of it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

/// Environment-derived configuration of the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Listen port, from `PORT`.
    pub port: u16,
    /// Event-bus endpoint, from `KAFKA_BROKERS`.
    pub kafka_brokers: String,
    /// Key-value endpoint, from `REDIS_URL`.
    pub redis_url: String,
}

impl AdapterConfig {
    /// Reads the configuration from the environment, with the usual
    /// defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(8080);
        let kafka_brokers =
            std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| String::from("localhost:9092"));
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| String::from("localhost:6379"));
        Self {
            port,
            kafka_brokers,
            redis_url,
        }
    }
}

/// Builds the adapter's router: a constant-body health probe and the echo
/// stream.
#[must_use]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(upgrade))
}

async fn health() -> &'static str {
    "Simulation engine is healthy!"
}

async fn upgrade(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(echo)
}

async fn echo(mut socket: WebSocket) {
    log::info!("Client connected to the command stream");
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Close(_) => return,
            message => {
                if socket.send(message).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Binds the listen port and serves the adapter until the process exits.
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn serve(config: AdapterConfig) -> eyre::Result<()> {
    log::info!("Event bus endpoint: {}", config.kafka_brokers);
    log::info!("Key-value endpoint: {}", config.redis_url);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    log::info!("Boundary adapter listening on port {}", config.port);
    axum::serve(listener, router()).await?;
    Ok(())
}
