//! # realtime-feed
//!
//! A realtime update feed that prefers a WebSocket and falls back to HTTP polling.
//!
//! ## Features
//!
//! - **Auto-reconnection** with a fixed delay and a bounded number of attempts
//! - **Polling fallback** while the socket is in error (hybrid mode)
//! - **Validate → transform → debounce** pipeline shared by both transports
//! - **Observable state** via `tokio::sync::watch` snapshots
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use realtime_feed::{ConnectionConfig, ConnectionController, Passthrough, UpdateOptions};
//!
//! let config = ConnectionConfig::builder("wss://feed.example.com/updates")
//!     .auth_token("secret")
//!     .build()?;
//!
//! let controller = ConnectionController::new(config, UpdateOptions::default(), Passthrough)?;
//! controller.connect().await?;
//!
//! let mut data = controller.subscribe_data();
//! while data.changed().await.is_ok() {
//!     println!("{:?}", *data.borrow());
//! }
//! ```

mod codec;
mod config;
mod controller;
mod error;
mod event;
mod handler;
mod metrics;
mod pipeline;
mod polling;
mod socket;
mod state;

pub use codec::{Payload, PayloadFormat};
pub use config::{
    ConfigError, ConnectionConfig, ConnectionConfigBuilder, UpdateMode, UpdateOptions,
    UpdateOptionsBuilder,
};
pub use controller::ConnectionController;
pub use error::{Error, ErrorKind};
pub use handler::{Passthrough, UpdateHandler};
pub use metrics::{Channel, ChannelMetrics, Metrics, MetricsSnapshot};
pub use pipeline::Debouncer;
pub use state::{ConnectionStatus, RealtimeUpdateState};

// Re-export http types for configured headers
pub use http::{HeaderName, HeaderValue};

/// Result type for realtime-feed operations
pub type Result<T> = std::result::Result<T, Error>;
