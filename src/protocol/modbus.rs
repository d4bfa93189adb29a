use super::{ConnState, ConnectionCommand, ConnectionOptions, SharedConnState, TimeseriesInput};
use crate::model::{ConnectionDescriptor, ReadingValue};
use crate::persistence::{FailureEdge, FailureGate};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::Slave;
use tokio_util::sync::CancellationToken;

/// Request/response binding: each input addresses one holding register,
/// sampled on the connection's poll interval. A transport error tears the
/// session down and the next tick reconnects.
// TODO: support input registers and per-input scaling once descriptors
// carry a register-kind field.
pub(super) async fn run(
    descriptor: ConnectionDescriptor,
    inputs: Vec<TimeseriesInput>,
    mut cmd_rx: mpsc::Receiver<ConnectionCommand>,
    cancel: CancellationToken,
    state: SharedConnState,
    options: ConnectionOptions,
) {
    state.set(ConnState::Connecting);

    let unit = Slave(descriptor.unit.unwrap_or(1));
    let poll_interval = descriptor
        .poll_interval_ms
        .map(Duration::from_millis)
        .unwrap_or(options.modbus_poll_interval);

    let mut registers: HashMap<String, (u16, TimeseriesInput)> = HashMap::new();
    for input in inputs {
        attach_input(&descriptor.id, &mut registers, input);
    }

    let endpoint_gate = FailureGate::new();
    let mut session: Option<Context> = None;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnectionCommand::AddInput(input)) => {
                    attach_input(&descriptor.id, &mut registers, input);
                }
                Some(ConnectionCommand::RemoveInput(sensor_id)) => {
                    registers.remove(&sensor_id);
                }
                None => break,
            },
            _ = ticker.tick() => {
                if session.is_none() {
                    session = match connect(&descriptor, unit).await {
                        Ok(ctx) => {
                            state.set(ConnState::Active);
                            if let Some(FailureEdge::Recovered) = endpoint_gate.observe(true) {
                                tracing::info!(connection = %descriptor.id, "modbus endpoint recovered");
                            } else {
                                tracing::info!(connection = %descriptor.id, "modbus session established");
                            }
                            Some(ctx)
                        }
                        Err(err) => {
                            state.set(ConnState::Connecting);
                            if let Some(FailureEdge::Failed) = endpoint_gate.observe(false) {
                                tracing::warn!(
                                    connection = %descriptor.id,
                                    error = %err,
                                    "modbus endpoint unreachable; retrying each poll"
                                );
                            }
                            None
                        }
                    };
                }
                if let Some(ctx) = session.as_mut() {
                    if let Err(err) = poll_registers(ctx, &registers).await {
                        state.set(ConnState::Connecting);
                        if let Some(FailureEdge::Failed) = endpoint_gate.observe(false) {
                            tracing::warn!(
                                connection = %descriptor.id,
                                error = %err,
                                "modbus poll failed; reconnecting"
                            );
                        }
                        session = None;
                    }
                }
            }
        }
    }

    state.set(ConnState::Disconnected);
    tracing::info!(connection = %descriptor.id, "modbus connection stopped");
}

fn attach_input(
    connection_id: &str,
    registers: &mut HashMap<String, (u16, TimeseriesInput)>,
    input: TimeseriesInput,
) {
    match input.address.trim().parse::<u16>() {
        Ok(register) => {
            tracing::info!(
                connection = %connection_id,
                sensor = %input.sensor_id,
                register,
                "polling register"
            );
            registers.insert(input.sensor_id.clone(), (register, input));
        }
        Err(_) => {
            tracing::warn!(
                connection = %connection_id,
                sensor = %input.sensor_id,
                address = %input.address,
                "invalid register address; input dropped until next reconciliation"
            );
        }
    }
}

async fn connect(descriptor: &ConnectionDescriptor, unit: Slave) -> anyhow::Result<Context> {
    let endpoint = format!("{}:{}", descriptor.host, descriptor.port);
    let addr = tokio::net::lookup_host(endpoint.as_str())
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address for {endpoint}"))?;
    let ctx = tcp::connect_slave(addr, unit).await?;
    Ok(ctx)
}

async fn poll_registers(
    ctx: &mut Context,
    registers: &HashMap<String, (u16, TimeseriesInput)>,
) -> anyhow::Result<()> {
    for (register, input) in registers.values() {
        let words = ctx.read_holding_registers(*register, 1).await?;
        if let Some(word) = words.first() {
            input.deliver(
                ReadingValue::Float {
                    value: f64::from(*word),
                    quality: 0,
                },
                None,
            );
        }
    }
    Ok(())
}
