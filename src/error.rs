use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that handlers and presentation code can match on without holding
/// the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket-level failure (handshake, read, write)
    Transport,
    /// Malformed payload from either channel
    Decode,
    /// Well-formed payload rejected by the validator
    Validation,
    /// Non-success HTTP status or network failure while polling
    Fetch,
    /// Polling request exceeded its timeout
    Timeout,
    /// Socket reconnect budget used up
    ReconnectExhausted,
    /// Controller task is gone
    ShuttingDown,
    /// Configuration rejected at construction
    Config,
}

/// Errors that can occur in realtime-feed
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket protocol or transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Socket connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Payload could not be decoded in the configured format
    #[error("Decode error: {0}")]
    Decode(String),

    /// Payload failed the caller-supplied validator
    #[error("Payload rejected by validator")]
    Validation,

    /// Polling request failed. `status` is set when the server answered.
    #[error("Fetch failed: {message}")]
    Fetch {
        status: Option<u16>,
        message: String,
    },

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Polling request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Socket gave up reconnecting
    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Controller has been dropped
    #[error("Controller is shut down")]
    ShuttingDown,
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) | Error::ConnectionFailed(_) => ErrorKind::Transport,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Validation => ErrorKind::Validation,
            Error::Fetch { .. } | Error::Client(_) => ErrorKind::Fetch,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// HTTP status carried by a fetch error, if the server responded.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Fetch { status, .. } => *status,
            _ => None,
        }
    }

    /// True for polling failures, timeouts included.
    pub fn is_fetch(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fetch | ErrorKind::Timeout)
    }
}
