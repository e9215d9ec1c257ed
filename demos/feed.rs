//! Example: following a JSON price feed
//!
//! Connects in hybrid mode to the endpoint given on the command line, logs
//! status changes and committed updates, then disconnects.
//!
//! Run with: cargo run --example feed -- wss://feed.example.com/prices

use realtime_feed::{
    ConnectionConfig, ConnectionController, ConnectionStatus, Error, Payload, UpdateHandler,
    UpdateOptions,
};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Accepts objects carrying a numeric `price` and delivers just that number
struct PriceHandler;

impl UpdateHandler for PriceHandler {
    type Data = f64;

    fn validate(&self, payload: &Payload) -> bool {
        price(payload).is_some()
    }

    fn transform(&self, payload: Payload) -> f64 {
        price(&payload).unwrap_or_default()
    }

    fn on_status_change(&self, status: ConnectionStatus) {
        info!("Status: {}", status);
    }

    fn on_update(&self, price: &f64) {
        info!("Price: {:.4}", price);
    }

    fn on_error(&self, error: &Error) {
        warn!("Error ({:?}): {}", error.kind(), error);
    }

    fn on_reconnect(&self, attempt: u32) {
        info!("Reconnect attempt {}", attempt);
    }
}

fn price(payload: &Payload) -> Option<f64> {
    payload.as_json().and_then(|v| v.get("price")).and_then(Value::as_f64)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9000/prices".to_string());

    let config = ConnectionConfig::builder(endpoint)
        .update_interval(Duration::from_secs(5))
        .reconnect_delay(Duration::from_secs(3))
        .build()?;
    let options = UpdateOptions::builder()
        .debounce(Duration::from_millis(250))
        .build();

    let controller = ConnectionController::new(config, options, PriceHandler)?;
    controller.connect().await?;

    info!("Running for 30s...");
    tokio::time::sleep(Duration::from_secs(30)).await;

    let state = controller.state();
    info!(
        "Final state: {} via {:?}, last update {:?}",
        state.status, state.active_mode, state.last_update
    );
    let snapshot = controller.metrics().snapshot();
    info!("  Socket connections: {}", snapshot.socket_connections_total);
    info!("  Reconnect attempts: {}", snapshot.reconnect_attempts_total);
    info!("  Polls: {}", snapshot.polls_total);
    info!("  Deliveries: {}", snapshot.deliveries_total);

    controller.disconnect().await?;
    info!("Disconnected");

    Ok(())
}
