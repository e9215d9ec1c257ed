#![allow(dead_code)]

use parking_lot::Mutex;
use realtime_feed::{
    ConnectionController, ConnectionStatus, Error, ErrorKind, Payload, RealtimeUpdateState,
    UpdateHandler,
};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};

/// Handler that records every callback. Accepts JSON objects with an `id`.
#[derive(Default)]
pub struct Recorder {
    pub statuses: Mutex<Vec<ConnectionStatus>>,
    pub updates: Mutex<Vec<Value>>,
    pub errors: Mutex<Vec<ErrorKind>>,
    pub reconnects: Mutex<Vec<(u32, Instant)>>,
}

impl Recorder {
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().clone()
    }

    pub fn updates(&self) -> Vec<Value> {
        self.updates.lock().clone()
    }

    pub fn errors(&self) -> Vec<ErrorKind> {
        self.errors.lock().clone()
    }

    pub fn reconnect_attempts(&self) -> Vec<u32> {
        self.reconnects.lock().iter().map(|(n, _)| *n).collect()
    }

    pub fn callback_count(&self) -> usize {
        self.statuses.lock().len() + self.updates.lock().len() + self.errors.lock().len()
    }
}

impl UpdateHandler for Recorder {
    type Data = Value;

    fn validate(&self, payload: &Payload) -> bool {
        payload.as_json().map(|v| v.get("id").is_some()).unwrap_or(false)
    }

    fn transform(&self, payload: Payload) -> Value {
        payload.as_json().cloned().unwrap_or_default()
    }

    fn on_status_change(&self, status: ConnectionStatus) {
        self.statuses.lock().push(status);
    }

    fn on_update(&self, data: &Value) {
        self.updates.lock().push(data.clone());
    }

    fn on_error(&self, error: &Error) {
        self.errors.lock().push(error.kind());
    }

    fn on_reconnect(&self, attempt: u32) {
        self.reconnects.lock().push((attempt, Instant::now()));
    }
}

/// Wait until the controller's state satisfies `pred`.
pub async fn wait_for_state<H: UpdateHandler>(
    controller: &ConnectionController<H>,
    pred: impl Fn(&RealtimeUpdateState) -> bool,
) -> RealtimeUpdateState {
    let mut states = controller.subscribe();
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = states.borrow_and_update();
                if pred(&state) {
                    return state.clone();
                }
            }
            states.changed().await.expect("controller alive");
        }
    })
    .await
    .expect("state reached in time")
}

/// Wait until committed data satisfies `pred`.
pub async fn wait_for_data<H: UpdateHandler>(
    controller: &ConnectionController<H>,
    pred: impl Fn(&H::Data) -> bool,
) -> H::Data {
    let mut data = controller.subscribe_data();
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = data.borrow_and_update();
                if let Some(value) = current.as_ref().filter(|v| pred(v)) {
                    return value.clone();
                }
            }
            data.changed().await.expect("controller alive");
        }
    })
    .await
    .expect("data arrived in time")
}

/// A local port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
