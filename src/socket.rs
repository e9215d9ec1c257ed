use crate::codec::{Payload, PayloadFormat};
use crate::config::{redact, ConnectionConfig};
use crate::error::Error;
use crate::event::{ChannelEvent, EventSink};
use crate::metrics::{Channel, Metrics};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Lifecycle transitions reported by the socket channel
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Opening a connection
    Connecting,
    /// Handshake completed; attempt counter is back to 0
    Open,
    /// Transport-level failure
    Error(Arc<Error>),
    /// Connection ended without being asked to
    Closed,
    /// Reconnect `attempt` scheduled after the fixed delay
    Reconnecting { attempt: u32 },
    /// No attempts left; the channel has stopped
    Exhausted { attempts: u32 },
}

/// Commands that can be sent to a socket channel
#[derive(Debug)]
enum SocketCommand {
    /// Close intentionally; never followed by a reconnect
    Close,
}

/// How a single connected session ended
enum Session {
    /// Consumer asked us to stop (or the controller went away)
    Stopped,
    /// Peer closed or the stream ended
    PeerClosed,
}

/// Handle to a running socket channel.
///
/// Dropping the handle aborts the task and clears the socket gauge;
/// `close()` lets it send a close frame first.
pub(crate) struct SocketChannel {
    id: u64,
    command_tx: mpsc::Sender<SocketCommand>,
    metrics: Arc<Metrics>,
    task: Option<JoinHandle<()>>,
}

impl SocketChannel {
    /// Start the channel. In offline mode it reports `Open` without connecting.
    pub(crate) fn spawn(
        id: u64,
        config: Arc<ConnectionConfig>,
        format: PayloadFormat,
        metrics: Arc<Metrics>,
        sink: EventSink,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(4);

        if config.offline {
            debug!("[SOCKET] Offline mode, reporting open without connecting");
            metrics.record_socket_connection();
            metrics.set_active(Channel::Socket, true);
            let task = if sink.try_send(ChannelEvent::Socket(SocketEvent::Open)) {
                None
            } else {
                warn!("[SOCKET] Mailbox full, deferring offline open");
                Some(tokio::spawn(async move {
                    sink.send(ChannelEvent::Socket(SocketEvent::Open)).await;
                }))
            };
            return Self {
                id,
                command_tx,
                metrics,
                task,
            };
        }

        let worker = SocketWorker {
            config,
            format,
            metrics: metrics.clone(),
            sink,
            command_rx,
        };
        Self {
            id,
            command_tx,
            metrics,
            task: Some(tokio::spawn(worker.run())),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Intentional teardown: cancels any pending reconnect and closes the
    /// live connection.
    pub(crate) fn close(mut self) {
        if self.command_tx.try_send(SocketCommand::Close).is_ok() {
            // the worker exits on its own once the close frame is out
            self.task.take();
        }
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.metrics.set_active(Channel::Socket, false);
    }
}

struct SocketWorker {
    config: Arc<ConnectionConfig>,
    format: PayloadFormat,
    metrics: Arc<Metrics>,
    sink: EventSink,
    command_rx: mpsc::Receiver<SocketCommand>,
}

impl SocketWorker {
    /// Run the connection loop (reconnects on unexpected close)
    async fn run(mut self) {
        let mut attempt = 0u32;
        let max_attempts = self.config.max_reconnect_attempts;
        let delay = self.config.reconnect_delay;

        loop {
            if !self.emit(SocketEvent::Connecting).await {
                return;
            }

            match self.connect_and_run(&mut attempt).await {
                Ok(Session::Stopped) => {
                    info!("[SOCKET] Connection closed by consumer");
                    return;
                }
                Ok(Session::PeerClosed) => {
                    info!("[SOCKET] Connection closed by peer");
                }
                Err(e) => {
                    warn!("[SOCKET] Connection error: {}", e);
                    if !self.emit(SocketEvent::Error(Arc::new(e))).await {
                        return;
                    }
                }
            }

            if !self.emit(SocketEvent::Closed).await {
                return;
            }

            if attempt >= max_attempts {
                warn!(
                    "[SOCKET] Max reconnection attempts ({}) reached, giving up",
                    max_attempts
                );
                self.emit(SocketEvent::Exhausted { attempts: attempt }).await;
                return;
            }

            attempt += 1;
            self.metrics.record_reconnect_attempt();
            if !self.emit(SocketEvent::Reconnecting { attempt }).await {
                return;
            }

            debug!(
                "[SOCKET] Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, max_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.command_rx.recv() => {
                    info!("[SOCKET] Pending reconnect cancelled");
                    return;
                }
            }
        }
    }

    /// Connect and pump messages until the session ends.
    async fn connect_and_run(&mut self, attempt: &mut u32) -> Result<Session, Error> {
        let url = self.config.socket_url();
        debug!("[SOCKET] Connecting to {}", redact(&url));

        let connect_timeout = self.config.connect_timeout;
        let ws_stream = tokio::select! {
            result = timeout(connect_timeout, open_socket(&url)) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::ConnectionFailed(format!(
                        "handshake timed out after {:?}",
                        connect_timeout
                    )))
                }
            },
            _ = self.command_rx.recv() => return Ok(Session::Stopped),
        };

        *attempt = 0;
        self.metrics.record_socket_connection();
        self.metrics.set_active(Channel::Socket, true);
        info!("[SOCKET] Connected to {}", redact(&url));

        let result = self.pump(ws_stream).await;
        self.metrics.set_active(Channel::Socket, false);
        result
    }

    async fn pump(&mut self, ws_stream: WsStream) -> Result<Session, Error> {
        if !self.emit(SocketEvent::Open).await {
            return Ok(Session::Stopped);
        }

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Text(text))) => self.format.decode_text(&text),
                        Some(Ok(Message::Binary(bytes))) => self.format.decode_bytes(&bytes),
                        Some(Ok(Message::Close(frame))) => {
                            debug!("[SOCKET] Received close frame: {:?}", frame);
                            return Ok(Session::PeerClosed);
                        }
                        // pongs are queued by tungstenite itself
                        Some(Ok(other)) => {
                            trace!("[SOCKET] Control frame: {:?}", other);
                            continue;
                        }
                        Some(Err(e)) => return Err(Error::WebSocket(e)),
                        None => return Ok(Session::PeerClosed),
                    };
                    if !self.forward(decoded).await {
                        return Ok(Session::Stopped);
                    }
                }

                _ = self.command_rx.recv() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Session::Stopped);
                }
            }
        }
    }

    /// Forward a decoded message; undecodable ones are logged and dropped.
    async fn forward(&self, decoded: Result<Payload, Error>) -> bool {
        match decoded {
            Ok(payload) => {
                self.metrics.record_socket_message();
                self.sink.send(ChannelEvent::Payload(payload)).await
            }
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!("[SOCKET] Dropping undecodable message: {}", e);
                true
            }
        }
    }

    async fn emit(&self, event: SocketEvent) -> bool {
        self.sink.send(ChannelEvent::Socket(event)).await
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a TCP connection and run the WebSocket handshake over it.
async fn open_socket(url: &Url) -> Result<WsStream, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("no host in URL".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::ConnectionFailed("no port for URL scheme".to_string()))?;

    let request = url.as_str().into_client_request()?;

    let tcp_stream = TcpStream::connect(format!("{}:{}", host, port))
        .await
        .map_err(|e| {
            Error::ConnectionFailed(format!("TCP connect to {}:{} failed: {}", host, port, e))
        })?;
    tune_tcp(&tcp_stream);

    let (ws_stream, _response) =
        client_async_tls_with_config(request, tcp_stream, None, None).await?;
    Ok(ws_stream)
}

/// Disable Nagle and enable keepalive so dead peers are noticed.
fn tune_tcp(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_nodelay(true);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = sock.set_tcp_keepalive(&keepalive);
}
