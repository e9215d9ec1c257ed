use crate::codec::Payload;
use crate::error::Error;
use crate::state::ConnectionStatus;

/// Trait that users implement to receive realtime updates.
///
/// This trait defines the contract between the controller and user code.
/// The controller handles transports, reconnection and fallback, while the
/// handler shapes payloads and observes what happens.
///
/// All methods are called from the controller task, one at a time, so
/// implementations never race with each other. A panicking callback is
/// caught and logged.
///
/// # Example
///
/// ```ignore
/// use realtime_feed::{Payload, UpdateHandler};
///
/// struct PriceHandler;
///
/// impl UpdateHandler for PriceHandler {
///     type Data = f64;
///
///     fn validate(&self, payload: &Payload) -> bool {
///         payload.as_json().and_then(|v| v["price"].as_f64()).is_some()
///     }
///
///     fn transform(&self, payload: Payload) -> f64 {
///         payload.as_json().and_then(|v| v["price"].as_f64()).unwrap_or_default()
///     }
///
///     fn on_update(&self, price: &f64) {
///         println!("price: {price}");
///     }
/// }
/// ```
pub trait UpdateHandler: Send + Sync + 'static {
    /// Shape of the data delivered to the consumer
    type Data: Clone + Send + Sync + 'static;

    /// Returns `false` to reject a payload before it is transformed.
    ///
    /// Only consulted when `UpdateOptions::validate` is enabled.
    fn validate(&self, _payload: &Payload) -> bool {
        true
    }

    /// Converts a decoded payload into the delivered data shape.
    fn transform(&self, payload: Payload) -> Self::Data;

    /// Called on every status transition.
    fn on_status_change(&self, _status: ConnectionStatus) {}

    /// Called when a debounced payload is committed as current data.
    fn on_update(&self, _data: &Self::Data) {}

    /// Called for every surfaced failure (transport, fetch, validation).
    fn on_error(&self, _error: &Error) {}

    /// Called each time the socket schedules reconnect attempt `attempt`.
    fn on_reconnect(&self, _attempt: u32) {}
}

/// Handler that delivers decoded payloads unchanged and observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl UpdateHandler for Passthrough {
    type Data = Payload;

    fn transform(&self, payload: Payload) -> Payload {
        payload
    }
}
