use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters are lock-free; per-channel gauges sit behind a `parking_lot`
/// lock. Use `snapshot()` for a consistent point-in-time view.
///
/// # Example
/// ```ignore
/// let metrics = controller.metrics();
///
/// println!("Deliveries: {}", metrics.deliveries());
/// println!("Poll failures: {}", metrics.poll_failures());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    socket_connections_total: AtomicU64,
    reconnect_attempts_total: AtomicU64,
    socket_messages_total: AtomicU64,
    polls_total: AtomicU64,
    poll_failures_total: AtomicU64,
    decode_failures_total: AtomicU64,
    validation_rejections_total: AtomicU64,
    deliveries_total: AtomicU64,
    coalesced_total: AtomicU64,
    errors_total: AtomicU64,
    handler_panics_total: AtomicU64,

    channels: RwLock<Gauges>,
}

/// Transport a gauge belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Socket,
    Polling,
}

/// Gauges for a single channel
#[derive(Debug, Clone)]
pub struct ChannelMetrics {
    pub channel: Channel,
    /// Socket open, or polling interval running
    pub is_active: bool,
    /// Duration since the channel last became active
    pub time_since_active: Option<Duration>,
    /// Duration since the channel last produced a payload
    pub time_since_last_payload: Option<Duration>,
    /// Accumulated active time
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) active_since: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_payload_at: Option<Instant>,
}

impl ChannelMetrics {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            is_active: false,
            time_since_active: None,
            time_since_last_payload: None,
            total_uptime: Duration::ZERO,
            active_since: None,
            last_payload_at: None,
        }
    }

    fn snapshot(&self) -> ChannelMetrics {
        let live = if self.is_active {
            self.active_since.map(|t| t.elapsed()).unwrap_or_default()
        } else {
            Duration::ZERO
        };
        ChannelMetrics {
            time_since_active: self.active_since.map(|t| t.elapsed()),
            time_since_last_payload: self.last_payload_at.map(|t| t.elapsed()),
            total_uptime: self.total_uptime + live,
            ..self.clone()
        }
    }
}

#[derive(Debug)]
struct Gauges {
    socket: ChannelMetrics,
    polling: ChannelMetrics,
}

impl Default for Gauges {
    fn default() -> Self {
        Self {
            socket: ChannelMetrics::new(Channel::Socket),
            polling: ChannelMetrics::new(Channel::Polling),
        }
    }
}

impl Gauges {
    fn get(&self, channel: Channel) -> &ChannelMetrics {
        match channel {
            Channel::Socket => &self.socket,
            Channel::Polling => &self.polling,
        }
    }

    fn get_mut(&mut self, channel: Channel) -> &mut ChannelMetrics {
        match channel {
            Channel::Socket => &mut self.socket,
            Channel::Polling => &mut self.polling,
        }
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total successful socket opens
    pub fn socket_connections(&self) -> u64 {
        self.socket_connections_total.load(Ordering::Relaxed)
    }

    /// Get total scheduled reconnect attempts
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts_total.load(Ordering::Relaxed)
    }

    /// Get total decoded socket messages
    pub fn socket_messages(&self) -> u64 {
        self.socket_messages_total.load(Ordering::Relaxed)
    }

    /// Get total polling requests issued
    pub fn polls(&self) -> u64 {
        self.polls_total.load(Ordering::Relaxed)
    }

    /// Get total failed polling requests
    pub fn poll_failures(&self) -> u64 {
        self.poll_failures_total.load(Ordering::Relaxed)
    }

    /// Get total payloads dropped as undecodable
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures_total.load(Ordering::Relaxed)
    }

    /// Get total payloads rejected by the validator
    pub fn validation_rejections(&self) -> u64 {
        self.validation_rejections_total.load(Ordering::Relaxed)
    }

    /// Get total payloads committed to the consumer
    pub fn deliveries(&self) -> u64 {
        self.deliveries_total.load(Ordering::Relaxed)
    }

    /// Get total payloads superseded inside a debounce window
    pub fn coalesced(&self) -> u64 {
        self.coalesced_total.load(Ordering::Relaxed)
    }

    /// Get total errors surfaced to the handler
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get total panics caught in handler callbacks
    pub fn handler_panics(&self) -> u64 {
        self.handler_panics_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_socket_connection(&self) {
        self.socket_connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.reconnect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_socket_message(&self) {
        self.socket_messages_total.fetch_add(1, Ordering::Relaxed);
        self.touch_payload(Channel::Socket);
    }

    pub(crate) fn record_poll(&self) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_poll_success(&self) {
        self.touch_payload(Channel::Polling);
    }

    pub(crate) fn record_poll_failure(&self) {
        self.poll_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_rejection(&self) {
        self.validation_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self) {
        self.deliveries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_panic(&self) {
        self.handler_panics_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a channel active or inactive, accumulating uptime on the way down
    pub(crate) fn set_active(&self, channel: Channel, active: bool) {
        let mut channels = self.channels.write();
        let gauge = channels.get_mut(channel);
        match (gauge.is_active, active) {
            (false, true) => gauge.active_since = Some(Instant::now()),
            (true, false) => {
                if let Some(since) = gauge.active_since {
                    gauge.total_uptime += since.elapsed();
                }
            }
            _ => {}
        }
        gauge.is_active = active;
    }

    fn touch_payload(&self, channel: Channel) {
        self.channels.write().get_mut(channel).last_payload_at = Some(Instant::now());
    }

    /// Get a snapshot of one channel's gauges
    pub fn channel(&self, channel: Channel) -> ChannelMetrics {
        self.channels.read().get(channel).snapshot()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let channels = self.channels.read();

        MetricsSnapshot {
            socket_connections_total: self.socket_connections_total.load(Ordering::Acquire),
            reconnect_attempts_total: self.reconnect_attempts_total.load(Ordering::Acquire),
            socket_messages_total: self.socket_messages_total.load(Ordering::Acquire),
            polls_total: self.polls_total.load(Ordering::Acquire),
            poll_failures_total: self.poll_failures_total.load(Ordering::Acquire),
            decode_failures_total: self.decode_failures_total.load(Ordering::Acquire),
            validation_rejections_total: self
                .validation_rejections_total
                .load(Ordering::Acquire),
            deliveries_total: self.deliveries_total.load(Ordering::Acquire),
            coalesced_total: self.coalesced_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            handler_panics_total: self.handler_panics_total.load(Ordering::Acquire),
            socket: channels.socket.snapshot(),
            polling: channels.polling.snapshot(),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub socket_connections_total: u64,
    pub reconnect_attempts_total: u64,
    pub socket_messages_total: u64,
    pub polls_total: u64,
    pub poll_failures_total: u64,
    pub decode_failures_total: u64,
    pub validation_rejections_total: u64,
    pub deliveries_total: u64,
    pub coalesced_total: u64,
    pub errors_total: u64,
    pub handler_panics_total: u64,
    pub socket: ChannelMetrics,
    pub polling: ChannelMetrics,
}
