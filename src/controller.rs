//! The connection controller: one task that owns the state machine, both
//! transports and the delivery pipeline.

use crate::codec::{Payload, PayloadFormat};
use crate::config::{ConnectionConfig, UpdateOptions};
use crate::error::Error;
use crate::event::{ChannelEvent, Envelope, EventSink};
use crate::handler::UpdateHandler;
use crate::metrics::Metrics;
use crate::pipeline::{Debouncer, Pipeline};
use crate::polling::{http_client, PollingChannel};
use crate::socket::SocketChannel;
use crate::state::{Effect, RealtimeUpdateState, StateMachine};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

const MAILBOX_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 16;

/// Drives a realtime feed: a WebSocket with reconnection, optional polling
/// fallback, and validated, debounced delivery to an [`UpdateHandler`].
///
/// All state lives in a background task spawned by [`new`](Self::new); the
/// controller itself is a cheap handle that sends commands and reads
/// snapshots. Dropping it tears everything down.
///
/// # Example
/// ```ignore
/// let config = ConnectionConfig::builder("wss://feed.example.com/updates").build()?;
/// let controller = ConnectionController::new(config, UpdateOptions::default(), Passthrough)?;
///
/// controller.connect().await?;
/// let mut states = controller.subscribe();
/// while states.changed().await.is_ok() {
///     println!("status: {}", states.borrow().status);
/// }
/// ```
pub struct ConnectionController<H: UpdateHandler> {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<RealtimeUpdateState>,
    data_rx: watch::Receiver<Option<H::Data>>,
    metrics: Arc<Metrics>,
    handler: Arc<H>,
    task: JoinHandle<()>,
}

impl<H: UpdateHandler> ConnectionController<H> {
    /// Create the controller and spawn its task. Nothing connects until
    /// [`connect`](Self::connect) is called.
    ///
    /// Must be called from within a Tokio runtime. Returns
    /// [`Error::Config`] if `config` fails [`ConnectionConfig::validate`].
    pub fn new(
        config: ConnectionConfig,
        options: UpdateOptions,
        handler: H,
    ) -> Result<Self, Error> {
        config.validate()?;
        let client = http_client(&config)?;
        let handler = Arc::new(handler);
        let metrics = Arc::new(Metrics::new());
        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let (driver, state_rx, data_rx) = Driver::new(
            Arc::new(config),
            &options,
            handler.clone(),
            client,
            metrics.clone(),
        );
        let task = tokio::spawn(driver.run(commands_rx));

        Ok(Self {
            commands,
            state_rx,
            data_rx,
            metrics,
            handler,
            task,
        })
    }

    /// Start the configured transport. No-op while it is already running.
    pub async fn connect(&self) -> Result<(), Error> {
        self.send(CommandKind::Connect).await
    }

    /// Close the socket, stop polling and drop any pending delivery.
    ///
    /// Once this returns no handler callback fires until the next
    /// [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.send(CommandKind::Disconnect).await
    }

    /// Clear the current error and connect again.
    pub async fn retry(&self) -> Result<(), Error> {
        self.send(CommandKind::Retry).await
    }

    async fn send(&self, kind: CommandKind) -> Result<(), Error> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command { kind, ack })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        done.await.map_err(|_| Error::ShuttingDown)
    }

    /// Current state snapshot
    pub fn state(&self) -> RealtimeUpdateState {
        self.state_rx.borrow().clone()
    }

    /// Watch state snapshots as they change
    pub fn subscribe(&self) -> watch::Receiver<RealtimeUpdateState> {
        self.state_rx.clone()
    }

    /// Most recently committed data, if any
    pub fn current_data(&self) -> Option<H::Data> {
        self.data_rx.borrow().clone()
    }

    /// Watch committed data as it changes
    pub fn subscribe_data(&self) -> watch::Receiver<Option<H::Data>> {
        self.data_rx.clone()
    }

    /// Get metrics
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Get the handler
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }
}

impl<H: UpdateHandler> Drop for ConnectionController<H> {
    fn drop(&mut self) {
        // channel handles owned by the driver abort their tasks when dropped
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum CommandKind {
    Connect,
    Disconnect,
    Retry,
}

struct Command {
    kind: CommandKind,
    ack: oneshot::Sender<()>,
}

/// State owned by the controller task
struct Driver<H: UpdateHandler> {
    machine: StateMachine,
    pipeline: Pipeline<H>,
    handler: Arc<H>,
    debouncer: Debouncer<H::Data>,
    config: Arc<ConnectionConfig>,
    format: PayloadFormat,
    client: reqwest::Client,
    metrics: Arc<Metrics>,
    events_tx: mpsc::Sender<Envelope>,
    events_rx: mpsc::Receiver<Envelope>,
    next_channel: u64,
    socket: Option<SocketChannel>,
    polling: Option<PollingChannel>,
    state_tx: watch::Sender<RealtimeUpdateState>,
    data_tx: watch::Sender<Option<H::Data>>,
}

impl<H: UpdateHandler> Driver<H> {
    fn new(
        config: Arc<ConnectionConfig>,
        options: &UpdateOptions,
        handler: Arc<H>,
        client: reqwest::Client,
        metrics: Arc<Metrics>,
    ) -> (
        Self,
        watch::Receiver<RealtimeUpdateState>,
        watch::Receiver<Option<H::Data>>,
    ) {
        let machine = StateMachine::new(options.mode, options.fallback_polling);
        let (state_tx, state_rx) = watch::channel(machine.state().clone());
        let (data_tx, data_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let driver = Self {
            machine,
            pipeline: Pipeline::new(handler.clone(), options.validate),
            handler,
            debouncer: Debouncer::new(options.debounce),
            config,
            format: options.format,
            client,
            metrics,
            events_tx,
            events_rx,
            next_channel: 0,
            socket: None,
            polling: None,
            state_tx,
            data_tx,
        };
        (driver, state_rx, data_rx)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("[CONTROLLER] Task started");

        loop {
            let deadline = self.debouncer.deadline();

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.command(command),
                    None => {
                        debug!("[CONTROLLER] Handle dropped, shutting down");
                        self.shutdown();
                        return;
                    }
                },

                Some(envelope) = self.events_rx.recv() => self.dispatch(envelope),

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush();
                }
            }

            self.publish();
        }
    }

    fn command(&mut self, command: Command) {
        debug!("[CONTROLLER] {:?}", command.kind);
        let effects = match command.kind {
            CommandKind::Connect => self.machine.connect(),
            CommandKind::Disconnect => {
                if self.debouncer.cancel() {
                    debug!("[CONTROLLER] Dropped pending delivery");
                }
                self.machine.disconnect()
            }
            CommandKind::Retry => self.machine.retry(),
        };
        self.execute(effects);
        // publish before acking so callers observe their own command
        self.publish();
        let _ = command.ack.send(());
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let from_socket = self.socket.as_ref().map(|s| s.id()) == Some(envelope.channel);
        let from_polling = self.polling.as_ref().map(|p| p.id()) == Some(envelope.channel);

        match envelope.event {
            ChannelEvent::Socket(event) if from_socket => {
                let effects = self.machine.apply(&event);
                if !self.machine.has_socket() {
                    // the channel gave up and its task has ended
                    self.socket = None;
                }
                self.execute(effects);
            }
            ChannelEvent::Payload(payload) if from_socket || from_polling => self.ingest(payload),
            ChannelEvent::PollFailed(e) if from_polling => {
                let effects = self.machine.record_error(Arc::new(e));
                self.execute(effects);
            }
            event => {
                debug!(
                    "[CONTROLLER] Ignoring event from retired channel {}: {:?}",
                    envelope.channel, event
                );
            }
        }
    }

    /// Validate and transform, then hand the result to the debouncer.
    fn ingest(&mut self, payload: Payload) {
        let pipeline = &self.pipeline;
        let admitted = match guarded(&self.metrics, "transform", || pipeline.admit(payload)) {
            Some(admitted) => admitted,
            None => return,
        };

        match admitted {
            Ok(data) => {
                if self.debouncer.push(data, Instant::now()) {
                    self.metrics.record_coalesced();
                }
            }
            Err(e) => {
                self.metrics.record_validation_rejection();
                warn!("[CONTROLLER] {}", e);
                let effects = self.machine.record_error(Arc::new(e));
                self.execute(effects);
            }
        }
    }

    /// Commit the debounced value if its window has elapsed.
    fn flush(&mut self) {
        let Some(data) = self.debouncer.take_due(Instant::now()) else {
            return;
        };
        self.machine.record_update(SystemTime::now());
        self.metrics.record_delivery();
        self.data_tx.send_replace(Some(data.clone()));

        let handler = &self.handler;
        guarded(&self.metrics, "on_update", || handler.on_update(&data));
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Status(status) => {
                    info!("[CONTROLLER] Status: {}", status);
                    let handler = &self.handler;
                    guarded(&self.metrics, "on_status_change", || {
                        handler.on_status_change(status)
                    });
                }
                Effect::Error(e) => {
                    self.metrics.record_error();
                    let handler = &self.handler;
                    guarded(&self.metrics, "on_error", || handler.on_error(&e));
                }
                Effect::Reconnect(attempt) => {
                    let handler = &self.handler;
                    guarded(&self.metrics, "on_reconnect", || {
                        handler.on_reconnect(attempt)
                    });
                }
                Effect::SpawnSocket => {
                    let id = self.next_id();
                    self.socket = Some(SocketChannel::spawn(
                        id,
                        self.config.clone(),
                        self.format,
                        self.metrics.clone(),
                        EventSink::new(id, self.events_tx.clone()),
                    ));
                }
                Effect::CloseSocket => {
                    if let Some(socket) = self.socket.take() {
                        socket.close();
                    }
                }
                Effect::StartPolling => {
                    let id = self.next_id();
                    debug!("[CONTROLLER] Starting polling channel {}", id);
                    self.polling = Some(PollingChannel::spawn(
                        id,
                        self.config.clone(),
                        self.client.clone(),
                        self.format,
                        self.metrics.clone(),
                        EventSink::new(id, self.events_tx.clone()),
                    ));
                }
                Effect::StopPolling => {
                    if let Some(polling) = self.polling.take() {
                        // a fetch still in flight is aborted with the task
                        debug!("[CONTROLLER] Stopping polling channel {}", polling.id());
                        polling.stop();
                    }
                }
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_channel += 1;
        self.next_channel
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.machine.state().clone());
    }

    fn shutdown(&mut self) {
        self.debouncer.cancel();
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.polling.take();
    }
}

/// Run a handler callback, containing any panic it raises.
fn guarded<T>(metrics: &Metrics, callback: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(
                "[CONTROLLER] Handler callback {} PANICKED: {}",
                callback, panic_msg
            );
            metrics.record_handler_panic();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateMode;
    use crate::socket::SocketEvent;
    use crate::state::ConnectionStatus;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<ConnectionStatus>>,
        updates: Mutex<Vec<serde_json::Value>>,
        errors: Mutex<Vec<String>>,
        reconnects: Mutex<Vec<u32>>,
    }

    impl UpdateHandler for Recorder {
        type Data = serde_json::Value;

        fn validate(&self, payload: &Payload) -> bool {
            payload.as_json().map(|v| v.get("id").is_some()).unwrap_or(false)
        }

        fn transform(&self, payload: Payload) -> serde_json::Value {
            payload.as_json().cloned().unwrap_or_default()
        }

        fn on_status_change(&self, status: ConnectionStatus) {
            self.statuses.lock().push(status);
        }

        fn on_update(&self, data: &serde_json::Value) {
            self.updates.lock().push(data.clone());
        }

        fn on_error(&self, error: &Error) {
            self.errors.lock().push(error.to_string());
        }

        fn on_reconnect(&self, attempt: u32) {
            self.reconnects.lock().push(attempt);
        }
    }

    struct Panicky;

    impl UpdateHandler for Panicky {
        type Data = Payload;

        fn transform(&self, payload: Payload) -> Payload {
            payload
        }

        fn on_update(&self, _data: &Payload) {
            panic!("consumer bug");
        }
    }

    fn driver<H: UpdateHandler>(handler: H, mode: UpdateMode) -> Driver<H> {
        let config = ConnectionConfig::builder("ws://127.0.0.1:1/feed")
            .offline(true)
            .build()
            .unwrap();
        let client = http_client(&config).unwrap();
        let options = UpdateOptions::builder()
            .mode(mode)
            .debounce(Duration::from_millis(100))
            .build();
        let (driver, _state, _data) = Driver::new(
            Arc::new(config),
            &options,
            Arc::new(handler),
            client,
            Arc::new(Metrics::new()),
        );
        driver
    }

    fn connect<H: UpdateHandler>(driver: &mut Driver<H>) {
        let (ack, _done) = oneshot::channel();
        driver.command(Command {
            kind: CommandKind::Connect,
            ack,
        });
    }

    fn disconnect<H: UpdateHandler>(driver: &mut Driver<H>) {
        let (ack, _done) = oneshot::channel();
        driver.command(Command {
            kind: CommandKind::Disconnect,
            ack,
        });
    }

    /// Deliver everything the channels have reported so far.
    fn drain<H: UpdateHandler>(driver: &mut Driver<H>) {
        while let Ok(envelope) = driver.events_rx.try_recv() {
            driver.dispatch(envelope);
        }
    }

    fn socket_payload<H: UpdateHandler>(driver: &mut Driver<H>, value: serde_json::Value) {
        let id = driver.socket.as_ref().map(|s| s.id()).unwrap();
        driver.dispatch(Envelope {
            channel: id,
            event: ChannelEvent::Payload(Payload::Json(value)),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_delivers_last_payload_once() {
        let mut driver = driver(Recorder::default(), UpdateMode::Websocket);
        connect(&mut driver);
        drain(&mut driver);
        assert_eq!(driver.machine.state().status, ConnectionStatus::Connected);

        socket_payload(&mut driver, json!({"id": 1}));
        tokio::time::advance(Duration::from_millis(20)).await;
        socket_payload(&mut driver, json!({"id": 2}));
        tokio::time::advance(Duration::from_millis(20)).await;
        socket_payload(&mut driver, json!({"id": 3}));

        tokio::time::advance(Duration::from_millis(99)).await;
        driver.flush();
        assert!(driver.handler.updates.lock().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        driver.flush();
        assert_eq!(*driver.handler.updates.lock(), vec![json!({"id": 3})]);
        assert_eq!(driver.metrics.coalesced(), 2);
        assert_eq!(driver.metrics.deliveries(), 1);
        assert!(driver.machine.state().last_update.is_some());
        assert_eq!(*driver.data_tx.borrow(), Some(json!({"id": 3})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_payload_keeps_data_and_status() {
        let mut driver = driver(Recorder::default(), UpdateMode::Websocket);
        connect(&mut driver);
        drain(&mut driver);

        socket_payload(&mut driver, json!({"id": 1}));
        tokio::time::advance(Duration::from_millis(100)).await;
        driver.flush();

        socket_payload(&mut driver, json!({"name": "no id"}));
        tokio::time::advance(Duration::from_millis(100)).await;
        driver.flush();

        assert_eq!(*driver.handler.updates.lock(), vec![json!({"id": 1})]);
        assert_eq!(driver.machine.state().status, ConnectionStatus::Connected);
        assert!(matches!(
            driver.machine.state().error.as_deref(),
            Some(Error::Validation)
        ));
        assert_eq!(driver.handler.errors.lock().len(), 1);
        assert_eq!(driver.metrics.validation_rejections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_drops_pending_delivery_and_stale_events() {
        let mut driver = driver(Recorder::default(), UpdateMode::Websocket);
        connect(&mut driver);
        drain(&mut driver);
        let old_socket = driver.socket.as_ref().map(|s| s.id()).unwrap();

        socket_payload(&mut driver, json!({"id": 1}));
        disconnect(&mut driver);
        let statuses_after_disconnect = driver.handler.statuses.lock().len();

        // a late event from the closed socket is discarded
        driver.dispatch(Envelope {
            channel: old_socket,
            event: ChannelEvent::Socket(SocketEvent::Error(Arc::new(Error::ConnectionFailed(
                "late".into(),
            )))),
        });
        driver.dispatch(Envelope {
            channel: old_socket,
            event: ChannelEvent::Payload(Payload::Json(json!({"id": 2}))),
        });

        tokio::time::advance(Duration::from_secs(1)).await;
        driver.flush();

        assert!(driver.handler.updates.lock().is_empty());
        assert!(driver.handler.errors.lock().is_empty());
        assert_eq!(
            driver.handler.statuses.lock().len(),
            statuses_after_disconnect
        );
        assert_eq!(
            driver.machine.state().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_fetch_from_brief_fallback_is_discarded() {
        let mut driver = driver(Recorder::default(), UpdateMode::Hybrid);
        connect(&mut driver);
        drain(&mut driver);
        let socket = driver.socket.as_ref().map(|s| s.id()).unwrap();

        // a transient error starts fallback polling until the retry is scheduled
        driver.dispatch(Envelope {
            channel: socket,
            event: ChannelEvent::Socket(SocketEvent::Error(Arc::new(Error::ConnectionFailed(
                "reset".into(),
            )))),
        });
        let polling = driver.polling.as_ref().map(|p| p.id()).unwrap();
        for event in [SocketEvent::Closed, SocketEvent::Reconnecting { attempt: 1 }] {
            driver.dispatch(Envelope {
                channel: socket,
                event: ChannelEvent::Socket(event),
            });
        }
        assert!(driver.polling.is_none());

        // the first GET of that window answers late
        driver.dispatch(Envelope {
            channel: polling,
            event: ChannelEvent::Payload(Payload::Json(json!({"id": 9}))),
        });
        driver.dispatch(Envelope {
            channel: polling,
            event: ChannelEvent::PollFailed(Error::Timeout(Duration::from_secs(10))),
        });

        assert!(!driver.debouncer.is_pending());
        assert_eq!(driver.handler.errors.lock().len(), 1);
        assert_eq!(
            driver.machine.state().status,
            ConnectionStatus::Reconnecting
        );
        assert!(driver.machine.state().error.is_none());
    }

    #[tokio::test]
    async fn test_connect_twice_spawns_one_socket() {
        let mut driver = driver(Recorder::default(), UpdateMode::Hybrid);
        connect(&mut driver);
        drain(&mut driver);
        let first = driver.socket.as_ref().map(|s| s.id());

        connect(&mut driver);
        drain(&mut driver);

        assert_eq!(driver.socket.as_ref().map(|s| s.id()), first);
        assert_eq!(driver.metrics.socket_connections(), 1);
        assert_eq!(
            *driver.handler.statuses.lock(),
            vec![ConnectionStatus::Connected]
        );
    }

    #[tokio::test]
    async fn test_reconnect_attempts_reach_handler() {
        let mut driver = driver(Recorder::default(), UpdateMode::Websocket);
        connect(&mut driver);
        drain(&mut driver);
        let id = driver.socket.as_ref().map(|s| s.id()).unwrap();

        for event in [
            SocketEvent::Error(Arc::new(Error::ConnectionFailed("reset".into()))),
            SocketEvent::Closed,
            SocketEvent::Reconnecting { attempt: 1 },
            SocketEvent::Connecting,
            SocketEvent::Open,
        ] {
            driver.dispatch(Envelope {
                channel: id,
                event: ChannelEvent::Socket(event),
            });
        }

        assert_eq!(*driver.handler.reconnects.lock(), vec![1]);
        assert_eq!(
            *driver.handler.statuses.lock(),
            vec![
                ConnectionStatus::Connected,
                ConnectionStatus::Error,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
            ]
        );
        assert_eq!(driver.machine.state().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_exhausted_socket_is_released_and_retry_respawns() {
        let mut driver = driver(Recorder::default(), UpdateMode::Websocket);
        connect(&mut driver);
        drain(&mut driver);
        let id = driver.socket.as_ref().map(|s| s.id()).unwrap();

        driver.dispatch(Envelope {
            channel: id,
            event: ChannelEvent::Socket(SocketEvent::Exhausted { attempts: 5 }),
        });
        assert!(driver.socket.is_none());
        assert_eq!(driver.machine.state().status, ConnectionStatus::Error);

        let (ack, _done) = oneshot::channel();
        driver.command(Command {
            kind: CommandKind::Retry,
            ack,
        });
        drain(&mut driver);

        assert!(driver.socket.as_ref().map(|s| s.id()) > Some(id));
        assert_eq!(driver.machine.state().status, ConnectionStatus::Connected);
        assert!(driver.machine.state().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_is_contained() {
        let mut driver = driver(Panicky, UpdateMode::Websocket);
        connect(&mut driver);
        drain(&mut driver);

        socket_payload(&mut driver, json!({"id": 1}));
        tokio::time::advance(Duration::from_millis(100)).await;
        driver.flush();

        assert_eq!(driver.metrics.handler_panics(), 1);
        assert_eq!(driver.metrics.deliveries(), 1);
        assert!(driver.data_tx.borrow().is_some());
    }
}
