pub mod modbus;
pub mod mqtt;

use crate::model::{ConnectionDescriptor, ProtocolKind, ReadingValue};
use crate::persistence::WriteHandler;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle. `Disconnected` is terminal: reconnecting a torn
/// down connection means building a new instance from its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Created,
    Connecting,
    Active,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct SharedConnState(Arc<AtomicU8>);

impl SharedConnState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnState::Created as u8)))
    }

    pub(crate) fn set(&self, state: ConnState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> ConnState {
        match self.0.load(Ordering::Relaxed) {
            0 => ConnState::Created,
            1 => ConnState::Connecting,
            2 => ConnState::Active,
            _ => ConnState::Disconnected,
        }
    }
}

/// One live subscription bound to one sensor id. Handler failures are
/// caught here; the owning connection's receive path never sees them.
pub struct TimeseriesInput {
    pub sensor_id: String,
    pub address: String,
    handler: WriteHandler,
}

impl TimeseriesInput {
    pub fn new(sensor_id: &str, address: &str, handler: WriteHandler) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            address: address.to_string(),
            handler,
        }
    }

    pub fn deliver(&self, value: ReadingValue, timestamp: Option<DateTime<Utc>>) {
        if let Err(err) = self.handler.write(&self.sensor_id, value, timestamp) {
            // the handler edge-logs its own failures; this is per-reading
            // context only
            tracing::trace!(sensor = %self.sensor_id, error = %err, "reading dropped");
        }
    }

    pub fn is_blob(&self) -> bool {
        self.handler.is_blob()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub mqtt_client_prefix: String,
    pub mqtt_keepalive: Duration,
    pub modbus_poll_interval: Duration,
}

pub enum ConnectionCommand {
    AddInput(TimeseriesInput),
    RemoveInput(String),
}

impl std::fmt::Debug for ConnectionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionCommand::AddInput(input) => {
                f.debug_tuple("AddInput").field(&input.sensor_id).finish()
            }
            ConnectionCommand::RemoveInput(sensor_id) => {
                f.debug_tuple("RemoveInput").field(sensor_id).finish()
            }
        }
    }
}

/// Reconciler-side handle to one running protocol connection task. Inputs
/// are rewired over the command channel; the task owns the wire session.
pub struct ConnectionHandle {
    id: String,
    cmd_tx: mpsc::Sender<ConnectionCommand>,
    cancel: CancellationToken,
    state: SharedConnState,
    task: Option<JoinHandle<()>>,
    input_ids: HashSet<String>,
}

impl ConnectionHandle {
    pub fn start(
        descriptor: ConnectionDescriptor,
        credentials: Option<(String, String)>,
        inputs: Vec<TimeseriesInput>,
        options: ConnectionOptions,
    ) -> Self {
        let id = descriptor.id.clone();
        let cancel = CancellationToken::new();
        let state = SharedConnState::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let input_ids = inputs.iter().map(|input| input.sensor_id.clone()).collect();

        let task = match descriptor.kind {
            ProtocolKind::Mqtt => tokio::spawn(mqtt::run(
                descriptor,
                credentials,
                inputs,
                cmd_rx,
                cancel.clone(),
                state.clone(),
                options,
            )),
            ProtocolKind::ModbusTcp => tokio::spawn(modbus::run(
                descriptor,
                inputs,
                cmd_rx,
                cancel.clone(),
                state.clone(),
                options,
            )),
        };

        Self {
            id,
            cmd_tx,
            cancel,
            state,
            task: Some(task),
            input_ids,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn input_ids(&self) -> &HashSet<String> {
        &self.input_ids
    }

    pub fn is_active(&self) -> bool {
        self.state.get() == ConnState::Active
    }

    pub async fn add_input(&mut self, input: TimeseriesInput) {
        self.input_ids.insert(input.sensor_id.clone());
        if self
            .cmd_tx
            .send(ConnectionCommand::AddInput(input))
            .await
            .is_err()
        {
            tracing::warn!(connection = %self.id, "connection task gone; input not attached");
        }
    }

    pub async fn remove_input(&mut self, sensor_id: &str) {
        self.input_ids.remove(sensor_id);
        let _ = self
            .cmd_tx
            .send(ConnectionCommand::RemoveInput(sensor_id.to_string()))
            .await;
    }

    /// Cooperative stop: signal the task and join with a bounded wait. Safe
    /// to call on a connection that never reached `Active`.
    pub async fn disconnect(mut self, join_timeout: Duration) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(join_timeout, task).await.is_err() {
                tracing::warn!(connection = %self.id, "connection task did not stop within bound");
            }
        }
        self.state.set(ConnState::Disconnected);
    }
}
