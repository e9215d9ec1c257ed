//! Mailbox between channel tasks and the controller task.

use crate::codec::Payload;
use crate::error::Error;
use crate::socket::SocketEvent;
use tokio::sync::mpsc;

/// Something a channel observed
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    /// Socket lifecycle transition
    Socket(SocketEvent),
    /// Decoded payload from either channel
    Payload(Payload),
    /// Polling request failed
    PollFailed(Error),
}

/// Event tagged with the id of the channel instance that produced it
#[derive(Debug)]
pub(crate) struct Envelope {
    pub channel: u64,
    pub event: ChannelEvent,
}

/// Sending side handed to one channel instance
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    channel: u64,
    tx: mpsc::Sender<Envelope>,
}

impl EventSink {
    pub(crate) fn new(channel: u64, tx: mpsc::Sender<Envelope>) -> Self {
        Self { channel, tx }
    }

    /// Returns `false` once the controller is gone.
    pub(crate) async fn send(&self, event: ChannelEvent) -> bool {
        self.tx
            .send(Envelope {
                channel: self.channel,
                event,
            })
            .await
            .is_ok()
    }

    /// Non-blocking send for events raised from the controller task itself.
    pub(crate) fn try_send(&self, event: ChannelEvent) -> bool {
        self.tx
            .try_send(Envelope {
                channel: self.channel,
                event,
            })
            .is_ok()
    }
}
