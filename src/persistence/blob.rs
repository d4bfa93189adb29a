use super::{FailureEdge, FailureGate, PersistenceSettings};
use crate::error::WriteError;
use crate::model::ReadingValue;
use crate::status::EngineStats;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
struct BlobObject {
    stream_id: String,
    timestamp: DateTime<Utc>,
    payload: Bytes,
}

#[derive(Debug)]
enum BlobCommand {
    Object(BlobObject),
    Flush(oneshot::Sender<()>),
}

/// Blob store handle for opaque payloads (camera frames, waveform dumps).
/// Objects are keyed by stream id and timestamp and PUT one at a time by a
/// writer task; a failed PUT drops that one object.
#[derive(Clone)]
pub struct BlobService {
    backend_id: String,
    tx: mpsc::Sender<BlobCommand>,
    enqueue_gate: Arc<FailureGate>,
}

impl BlobService {
    pub fn new(
        backend_id: &str,
        base_url: &str,
        settings: &PersistenceSettings,
        stats: Arc<EngineStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.max_queue);
        spawn_writer(backend_id.to_string(), base_url.to_string(), rx, stats);
        Self {
            backend_id: backend_id.to_string(),
            tx,
            enqueue_gate: Arc::new(FailureGate::new()),
        }
    }

    pub fn write(
        &self,
        stream_id: &str,
        value: &ReadingValue,
        timestamp: DateTime<Utc>,
    ) -> Result<(), WriteError> {
        let payload = match value {
            ReadingValue::Bytes(payload) => payload.clone(),
            ReadingValue::Float { value, .. } => Bytes::from(value.to_string()),
            ReadingValue::Bool(value) => Bytes::from(value.to_string()),
        };
        let object = BlobObject {
            stream_id: stream_id.to_string(),
            timestamp,
            payload,
        };
        self.tx
            .try_send(BlobCommand::Object(object))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => WriteError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => {
                    WriteError::Connectivity("writer task stopped".to_string())
                }
            })
    }

    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BlobCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub(super) fn enqueue_gate(&self) -> &FailureGate {
        &self.enqueue_gate
    }
}

fn spawn_writer(
    backend_id: String,
    base_url: String,
    mut rx: mpsc::Receiver<BlobCommand>,
    stats: Arc<EngineStats>,
) {
    tokio::spawn(async move {
        let client = Client::new();
        let gate = FailureGate::new();
        let base_url = base_url.trim_end_matches('/').to_string();

        while let Some(cmd) = rx.recv().await {
            match cmd {
                BlobCommand::Object(object) => {
                    match put_object(&client, &base_url, &object).await {
                        Ok(()) => {
                            if let Some(FailureEdge::Recovered) = gate.observe(true) {
                                tracing::info!(backend = %backend_id, "blob store recovered");
                            }
                        }
                        Err(err) => {
                            stats.writes_dropped.fetch_add(1, Ordering::Relaxed);
                            if let Some(FailureEdge::Failed) = gate.observe(false) {
                                tracing::warn!(
                                    backend = %backend_id,
                                    error = %err,
                                    "blob store unavailable; dropping objects"
                                );
                            }
                        }
                    }
                }
                BlobCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
}

async fn put_object(client: &Client, base_url: &str, object: &BlobObject) -> Result<(), String> {
    let url = format!(
        "{}/{}/{}",
        base_url,
        object.stream_id,
        object.timestamp.timestamp_millis()
    );
    let response = client
        .put(url)
        .body(object.payload.clone())
        .send()
        .await
        .map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("status {}", response.status()));
    }
    Ok(())
}
