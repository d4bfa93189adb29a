use super::{ConnState, ConnectionCommand, ConnectionOptions, SharedConnState, TimeseriesInput};
use crate::model::{ConnectionDescriptor, ReadingValue};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Pub/sub binding: one broker session per connection, one subscription
/// topic per input. Readings arrive on the event loop and are dispatched
/// in arrival order.
pub(super) async fn run(
    descriptor: ConnectionDescriptor,
    credentials: Option<(String, String)>,
    inputs: Vec<TimeseriesInput>,
    mut cmd_rx: mpsc::Receiver<ConnectionCommand>,
    cancel: CancellationToken,
    state: SharedConnState,
    options: ConnectionOptions,
) {
    state.set(ConnState::Connecting);

    let mut mqtt_options = MqttOptions::new(
        format!("{}-{}", options.mqtt_client_prefix, descriptor.id),
        descriptor.host.clone(),
        descriptor.port,
    );
    mqtt_options.set_keep_alive(options.mqtt_keepalive);
    if let Some((username, password)) = credentials {
        mqtt_options.set_credentials(username, password);
    }
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    let mut by_topic: HashMap<String, TimeseriesInput> = HashMap::new();
    for input in inputs {
        subscribe_input(&client, &descriptor.id, &mut by_topic, input).await;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnectionCommand::AddInput(input)) => {
                    subscribe_input(&client, &descriptor.id, &mut by_topic, input).await;
                }
                Some(ConnectionCommand::RemoveInput(sensor_id)) => {
                    let topic = by_topic
                        .iter()
                        .find(|(_, input)| input.sensor_id == sensor_id)
                        .map(|(topic, _)| topic.clone());
                    if let Some(topic) = topic {
                        by_topic.remove(&topic);
                        if let Err(err) = client.unsubscribe(topic.clone()).await {
                            tracing::warn!(
                                connection = %descriptor.id,
                                topic = %topic,
                                error = %err,
                                "unsubscribe failed"
                            );
                        }
                    }
                }
                None => break,
            },
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    state.set(ConnState::Active);
                    tracing::info!(connection = %descriptor.id, "mqtt session established");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if let Some(input) = by_topic.get(&publish.topic) {
                        dispatch(input, publish.payload);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    state.set(ConnState::Connecting);
                    tracing::warn!(
                        connection = %descriptor.id,
                        error = %err,
                        "mqtt event loop error; reconnecting"
                    );
                    sleep(Duration::from_secs(2)).await;
                }
            },
        }
    }

    let _ = client.disconnect().await;
    state.set(ConnState::Disconnected);
    tracing::info!(connection = %descriptor.id, "mqtt connection stopped");
}

async fn subscribe_input(
    client: &AsyncClient,
    connection_id: &str,
    by_topic: &mut HashMap<String, TimeseriesInput>,
    input: TimeseriesInput,
) {
    match client
        .subscribe(input.address.clone(), QoS::AtLeastOnce)
        .await
    {
        Ok(()) => {
            tracing::info!(
                connection = %connection_id,
                sensor = %input.sensor_id,
                topic = %input.address,
                "subscribed"
            );
            by_topic.insert(input.address.clone(), input);
        }
        Err(err) => {
            tracing::warn!(
                connection = %connection_id,
                sensor = %input.sensor_id,
                error = %err,
                "subscribe failed; input dropped until next reconciliation"
            );
        }
    }
}

fn dispatch(input: &TimeseriesInput, payload: Bytes) {
    if input.is_blob() {
        input.deliver(ReadingValue::Bytes(payload), None);
        return;
    }
    let mut buf = payload.to_vec();
    match parse_payload(&mut buf) {
        Ok((value, timestamp)) => input.deliver(value, timestamp),
        Err(err) => {
            tracing::warn!(sensor = %input.sensor_id, error = %err, "unparseable payload dropped");
        }
    }
}

#[derive(Debug, Deserialize)]
struct BorrowedReading<'a> {
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
    value: PayloadValue,
    #[serde(default)]
    quality: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PayloadValue {
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> DateTime<Utc> {
        match self {
            BorrowedTimestamp::Str(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            BorrowedTimestamp::Int(ms) => millis_to_dt(*ms),
            BorrowedTimestamp::Float(secs) => millis_to_dt((*secs * 1000.0) as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    let secs = ms / 1000;
    let nanos = ((ms % 1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

fn parse_payload(payload: &mut [u8]) -> anyhow::Result<(ReadingValue, Option<DateTime<Utc>>)> {
    let reading: BorrowedReading = simd_json::from_slice(payload)?;
    let timestamp = reading.timestamp.as_ref().map(|t| t.to_datetime());
    let value = match reading.value {
        PayloadValue::Float(value) => ReadingValue::Float {
            value,
            quality: reading.quality.unwrap_or(0),
        },
        PayloadValue::Bool(value) => ReadingValue::Bool(value),
    };
    Ok((value, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_payload_with_rfc3339_timestamp() {
        let mut payload =
            br#"{"value": 21.5, "quality": 1, "timestamp": "2026-05-01T10:00:00Z"}"#.to_vec();
        let (value, timestamp) = parse_payload(&mut payload).unwrap();
        match value {
            ReadingValue::Float { value, quality } => {
                assert_eq!(value, 21.5);
                assert_eq!(quality, 1);
            }
            other => panic!("unexpected value {other:?}"),
        }
        assert_eq!(
            timestamp.unwrap(),
            Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn parses_boolean_payload_without_timestamp() {
        let mut payload = br#"{"value": true}"#.to_vec();
        let (value, timestamp) = parse_payload(&mut payload).unwrap();
        assert!(matches!(value, ReadingValue::Bool(true)));
        assert!(timestamp.is_none());
    }

    #[test]
    fn parses_millisecond_timestamps() {
        let mut payload = br#"{"value": 3.0, "timestamp": 1746093600000}"#.to_vec();
        let (_, timestamp) = parse_payload(&mut payload).unwrap();
        assert_eq!(timestamp.unwrap().timestamp_millis(), 1_746_093_600_000);
    }

    #[test]
    fn rejects_payload_without_value() {
        let mut payload = br#"{"quality": 1}"#.to_vec();
        assert!(parse_payload(&mut payload).is_err());
    }
}
