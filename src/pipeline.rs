//! Validate → transform → debounce stage shared by both channels.

use crate::codec::Payload;
use crate::error::Error;
use crate::handler::UpdateHandler;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Runs the handler's validator and transform over decoded payloads
pub(crate) struct Pipeline<H: UpdateHandler> {
    handler: Arc<H>,
    validate: bool,
}

impl<H: UpdateHandler> Pipeline<H> {
    pub(crate) fn new(handler: Arc<H>, validate: bool) -> Self {
        Self { handler, validate }
    }

    /// Turn a payload into deliverable data, or reject it.
    pub(crate) fn admit(&self, payload: Payload) -> Result<H::Data, Error> {
        if self.validate && !self.handler.validate(&payload) {
            return Err(Error::Validation);
        }
        Ok(self.handler.transform(payload))
    }
}

/// Coalesces bursts: only the latest value survives a quiet window.
///
/// Every `push` restarts the window. The value becomes due once `window`
/// has elapsed since the most recent push.
#[derive(Debug)]
pub struct Debouncer<T> {
    window: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    /// Create an empty debouncer with the given quiet window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    /// Replace the pending value and restart the window.
    ///
    /// Returns `true` if an undelivered value was discarded.
    pub fn push(&mut self, value: T, now: Instant) -> bool {
        self.pending.replace((value, now + self.window)).is_some()
    }

    /// When the pending value becomes due
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, due)| *due)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending value if its window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((_, due)) if *due <= now => self.pending.take().map(|(value, _)| value),
            _ => None,
        }
    }

    /// Drop the pending value. Returns `true` if there was one.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }
}
