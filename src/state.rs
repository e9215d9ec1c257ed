//! Connection status model and the controller's transition function.
//!
//! [`StateMachine`] owns the observable [`RealtimeUpdateState`] and turns
//! lifecycle inputs into a list of [`Effect`]s. It performs no I/O; the
//! controller task executes the effects.

use crate::config::UpdateMode;
use crate::error::Error;
use crate::socket::SocketEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Connection status exposed to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the controller, recomputed on every transition
#[derive(Debug, Clone, Default)]
pub struct RealtimeUpdateState {
    pub status: ConnectionStatus,
    /// When the last payload was committed
    pub last_update: Option<SystemTime>,
    /// Last observed error; cleared on reconnect attempts and commits
    pub error: Option<Arc<Error>>,
    /// Socket reconnect attempts since the last successful open
    pub reconnect_attempts: u32,
    /// Transport currently in effect
    pub active_mode: Option<UpdateMode>,
    /// Reserved
    pub latency: Option<Duration>,
}

/// Work requested by a transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Status changed; notify the handler
    Status(ConnectionStatus),
    /// Surface an error to the handler
    Error(Arc<Error>),
    /// Socket scheduled reconnect attempt n
    Reconnect(u32),
    SpawnSocket,
    CloseSocket,
    StartPolling,
    StopPolling,
}

/// Status and transport arbitration for one controller
#[derive(Debug)]
pub struct StateMachine {
    mode: UpdateMode,
    fallback_polling: bool,
    /// Consumer asked to be connected
    engaged: bool,
    /// A socket channel is running
    socket: bool,
    /// The polling channel is running
    polling: bool,
    state: RealtimeUpdateState,
}

impl StateMachine {
    pub fn new(mode: UpdateMode, fallback_polling: bool) -> Self {
        Self {
            mode,
            fallback_polling,
            engaged: false,
            socket: false,
            polling: false,
            state: RealtimeUpdateState::default(),
        }
    }

    pub fn state(&self) -> &RealtimeUpdateState {
        &self.state
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn has_socket(&self) -> bool {
        self.socket
    }

    /// Start (or resume) the configured transport.
    ///
    /// No-op while the transport for the current mode is already running.
    pub fn connect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let running = match self.mode {
            UpdateMode::Polling => self.polling,
            UpdateMode::Websocket | UpdateMode::Hybrid => self.socket,
        };
        if self.engaged && running {
            return effects;
        }

        self.engaged = true;
        self.state.error = None;

        match self.mode {
            UpdateMode::Polling => {
                self.state.active_mode = Some(UpdateMode::Polling);
                // polling has no handshake
                self.set_status(ConnectionStatus::Connected, &mut effects);
                self.sync_polling(&mut effects);
            }
            UpdateMode::Websocket | UpdateMode::Hybrid => {
                if !self.polling {
                    self.state.active_mode = Some(UpdateMode::Websocket);
                }
                self.socket = true;
                effects.push(Effect::SpawnSocket);
            }
        }
        effects
    }

    /// Tear down both transports and settle in `Disconnected`.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.engaged = false;
        if self.socket {
            self.socket = false;
            effects.push(Effect::CloseSocket);
        }
        self.state.reconnect_attempts = 0;
        self.state.error = None;
        self.state.active_mode = None;
        self.set_status(ConnectionStatus::Disconnected, &mut effects);
        self.sync_polling(&mut effects);
        effects
    }

    /// Clear the stored error and connect again.
    pub fn retry(&mut self) -> Vec<Effect> {
        self.state.error = None;
        self.connect()
    }

    /// Apply a socket lifecycle event.
    pub fn apply(&mut self, event: &SocketEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.engaged {
            return effects;
        }

        match event {
            SocketEvent::Connecting => {
                self.set_status(ConnectionStatus::Connecting, &mut effects);
            }
            SocketEvent::Open => {
                self.state.reconnect_attempts = 0;
                self.state.active_mode = Some(UpdateMode::Websocket);
                self.set_status(ConnectionStatus::Connected, &mut effects);
            }
            SocketEvent::Error(error) => {
                self.state.error = Some(error.clone());
                effects.push(Effect::Error(error.clone()));
                self.set_status(ConnectionStatus::Error, &mut effects);
            }
            SocketEvent::Closed => {
                // an error stays visible until a retry is scheduled
                if self.state.status != ConnectionStatus::Error {
                    self.set_status(ConnectionStatus::Disconnected, &mut effects);
                }
            }
            SocketEvent::Reconnecting { attempt } => {
                self.state.reconnect_attempts = *attempt;
                self.state.error = None;
                if *attempt > 0 {
                    effects.push(Effect::Reconnect(*attempt));
                }
                self.set_status(ConnectionStatus::Reconnecting, &mut effects);
            }
            SocketEvent::Exhausted { attempts } => {
                self.socket = false;
                let error = Arc::new(Error::ReconnectExhausted {
                    attempts: *attempts,
                });
                self.state.error = Some(error.clone());
                effects.push(Effect::Error(error));
                self.set_status(ConnectionStatus::Error, &mut effects);
            }
        }
        effects
    }

    /// Record a non-fatal failure (poll, validation). Status is unchanged.
    pub fn record_error(&mut self, error: Arc<Error>) -> Vec<Effect> {
        if !self.engaged {
            return Vec::new();
        }
        self.state.error = Some(error.clone());
        vec![Effect::Error(error)]
    }

    /// Record that a payload was committed at `at`.
    pub fn record_update(&mut self, at: SystemTime) {
        self.state.last_update = Some(at);
        self.state.error = None;
    }

    fn set_status(&mut self, status: ConnectionStatus, effects: &mut Vec<Effect>) {
        if self.state.status != status {
            self.state.status = status;
            effects.push(Effect::Status(status));
        }
        self.sync_polling(effects);
    }

    fn polling_wanted(&self) -> bool {
        if !self.engaged {
            return false;
        }
        match self.mode {
            UpdateMode::Polling => true,
            UpdateMode::Hybrid => {
                self.fallback_polling && self.state.status == ConnectionStatus::Error
            }
            UpdateMode::Websocket => false,
        }
    }

    fn sync_polling(&mut self, effects: &mut Vec<Effect>) {
        let wanted = self.polling_wanted();
        if wanted == self.polling {
            return;
        }
        self.polling = wanted;
        if wanted {
            effects.push(Effect::StartPolling);
            self.state.active_mode = Some(UpdateMode::Polling);
        } else {
            effects.push(Effect::StopPolling);
            if self.engaged && self.mode == UpdateMode::Hybrid {
                self.state.active_mode = Some(UpdateMode::Websocket);
            }
        }
    }
}
