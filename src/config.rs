use crate::codec::PayloadFormat;
use http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Which transport the controller drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Socket only
    Websocket,
    /// HTTP polling only
    Polling,
    /// Prefer the socket, fall back to polling while it is in error
    #[default]
    Hybrid,
}

/// Transport configuration, resolved once at construction
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Primary transport address
    pub endpoint: Url,
    /// Override address for the polling channel (defaults to `endpoint`)
    pub polling_endpoint: Option<Url>,
    /// Polling period
    pub update_interval: Duration,
    /// Bound on consecutive socket reconnect attempts
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Per-request timeout for polling fetches
    pub timeout: Duration,
    /// Timeout for the socket handshake
    pub connect_timeout: Duration,
    /// Static headers attached to polling requests
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Credential appended as `token` to socket and polling URLs
    pub auth_token: Option<String>,
    /// Test mode: the socket reports itself open without touching the network
    pub offline: bool,
}

impl ConnectionConfig {
    /// Create a new builder for the given endpoint
    pub fn builder(endpoint: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            endpoint: endpoint.into(),
            polling_endpoint: None,
            update_interval: Duration::from_millis(5000),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(3000),
            timeout: Duration::from_millis(10_000),
            connect_timeout: Duration::from_millis(10_000),
            headers: Vec::new(),
            auth_token: None,
            offline: false,
        }
    }

    /// URL the socket connects to: `endpoint` with `token` appended.
    ///
    /// `http`/`https` endpoints are mapped to `ws`/`wss`.
    pub fn socket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        remap_scheme(&mut url, &[("http", "ws"), ("https", "wss")]);
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        url
    }

    /// URL for one polling request issued at `now`.
    ///
    /// Uses `polling_endpoint` or `endpoint` (with `ws`/`wss` mapped to
    /// `http`/`https`), then appends `token` and a `timestamp` in epoch ms.
    pub fn polling_url(&self, now: SystemTime) -> Url {
        let mut url = self
            .polling_endpoint
            .clone()
            .unwrap_or_else(|| self.endpoint.clone());
        remap_scheme(&mut url, &[("ws", "http"), ("wss", "https")]);
        let timestamp = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.auth_token {
                query.append_pair("token", token);
            }
            query.append_pair("timestamp", &timestamp.to_string());
        }
        url
    }
}

impl ConnectionConfig {
    /// Check the fields a builder would have checked.
    ///
    /// Fields are public, so a config edited after `build()` is checked again
    /// before any timer is created from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme(&self.endpoint)?;
        if let Some(polling) = &self.polling_endpoint {
            check_scheme(polling)?;
        }

        if self.update_interval.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "update_interval must be > 0".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidDuration("timeout must be > 0".to_string()));
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "connect_timeout must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn remap_scheme(url: &mut Url, mapping: &[(&str, &str)]) {
    if let Some((_, to)) = mapping.iter().find(|(from, _)| *from == url.scheme()) {
        // ws/http are both special schemes, so the switch is accepted
        let _ = url.set_scheme(to);
    }
}

/// Render a URL for logs with the auth token masked.
pub(crate) fn redact(url: &Url) -> String {
    if !url.query_pairs().any(|(k, _)| k == "token") {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

/// Builder for ConnectionConfig
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    endpoint: String,
    polling_endpoint: Option<String>,
    update_interval: Duration,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    timeout: Duration,
    connect_timeout: Duration,
    headers: Vec<(HeaderName, HeaderValue)>,
    auth_token: Option<String>,
    offline: bool,
}

impl ConnectionConfigBuilder {
    /// Poll a different address than the socket endpoint
    pub fn polling_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.polling_endpoint = Some(endpoint.into());
        self
    }

    /// Set the polling period
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Set the reconnect budget
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the fixed delay between reconnect attempts
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the per-request polling timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the socket handshake timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add a header sent with every polling request
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Set the auth token appended to both URLs
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Enable or disable offline (test) mode
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Rejects unparseable endpoints, unsupported schemes and zero durations
    /// where a timer needs a period.
    pub fn build(self) -> Result<ConnectionConfig, ConfigError> {
        let endpoint = parse_endpoint(&self.endpoint)?;
        let polling_endpoint = self
            .polling_endpoint
            .as_deref()
            .map(parse_endpoint)
            .transpose()?;

        let config = ConnectionConfig {
            endpoint,
            polling_endpoint,
            update_interval: self.update_interval,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
            timeout: self.timeout,
            connect_timeout: self.connect_timeout,
            headers: self.headers,
            auth_token: self.auth_token,
            offline: self.offline,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidEndpoint(format!("{}: {}", raw, e)))?;
    check_scheme(&url)?;
    Ok(url)
}

fn check_scheme(url: &Url) -> Result<(), ConfigError> {
    match url.scheme() {
        "ws" | "wss" | "http" | "https" => Ok(()),
        scheme => Err(ConfigError::InvalidEndpoint(format!(
            "unsupported scheme '{}'",
            scheme
        ))),
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Endpoint missing, unparseable or with an unsupported scheme
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// A duration that drives a timer is zero
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}

/// How inbound payloads are decoded and delivered
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Transport selection
    pub mode: UpdateMode,
    /// Payload decoding
    pub format: PayloadFormat,
    /// Run the handler's validator before delivery
    pub validate: bool,
    /// Quiet window used to coalesce bursts
    pub debounce: Duration,
    /// Reserved; accepted but has no effect
    pub compression: bool,
    /// Allow polling to take over while the socket is in error (hybrid mode)
    pub fallback_polling: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            mode: UpdateMode::Hybrid,
            format: PayloadFormat::Json,
            validate: true,
            debounce: Duration::from_millis(100),
            compression: false,
            fallback_polling: true,
        }
    }
}

impl UpdateOptions {
    /// Create a new builder starting from the defaults
    pub fn builder() -> UpdateOptionsBuilder {
        UpdateOptionsBuilder::default()
    }
}

/// Builder for UpdateOptions
#[derive(Debug, Clone, Default)]
pub struct UpdateOptionsBuilder {
    options: UpdateOptions,
}

impl UpdateOptionsBuilder {
    /// Select the transport
    pub fn mode(mut self, mode: UpdateMode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Set how payloads are decoded
    pub fn format(mut self, format: PayloadFormat) -> Self {
        self.options.format = format;
        self
    }

    /// Enable or disable the handler's validator
    pub fn validate(mut self, enabled: bool) -> Self {
        self.options.validate = enabled;
        self
    }

    /// Set the quiet window used to coalesce bursts
    pub fn debounce(mut self, window: Duration) -> Self {
        self.options.debounce = window;
        self
    }

    /// Accepted for compatibility; has no effect
    pub fn compression(mut self, enabled: bool) -> Self {
        self.options.compression = enabled;
        self
    }

    /// Allow polling to take over while the socket is in error
    pub fn fallback_polling(mut self, enabled: bool) -> Self {
        self.options.fallback_polling = enabled;
        self
    }

    /// Finish building. Every combination of options is valid.
    pub fn build(self) -> UpdateOptions {
        self.options
    }
}
