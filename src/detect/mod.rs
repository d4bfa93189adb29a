mod matcher;

pub use matcher::{BaselineTrack, DetectionSpan, PatternMatcher};

use crate::graph::GraphApi;
use crate::model::{DetectionEvent, DetectorKey, LiveReading};
use crate::status::EngineStats;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Reconciler-side handle to one running detector task.
pub struct DetectorHandle {
    key: DetectorKey,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DetectorHandle {
    /// Cooperative stop: signal the task and join with a bounded wait. The
    /// caller must not start a replacement for this key until this returns.
    pub async fn stop(mut self, join_timeout: Duration) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(join_timeout, task).await.is_err() {
                tracing::warn!(detector = %self.key, "detector task did not stop within bound");
            }
        }
    }
}

pub fn spawn_detector(
    key: DetectorKey,
    matcher: PatternMatcher,
    live_rx: broadcast::Receiver<LiveReading>,
    detections_tx: mpsc::Sender<DetectionEvent>,
) -> DetectorHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(
        key.clone(),
        matcher,
        live_rx,
        detections_tx,
        cancel.clone(),
    ));
    DetectorHandle {
        key,
        cancel,
        task: Some(task),
    }
}

async fn run(
    key: DetectorKey,
    mut matcher: PatternMatcher,
    mut live_rx: broadcast::Receiver<LiveReading>,
    detections_tx: mpsc::Sender<DetectionEvent>,
    cancel: CancellationToken,
) {
    tracing::info!(detector = %key, streams = matcher.stream_ids().len(), "detector started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            reading = live_rx.recv() => match reading {
                Ok(reading) => {
                    if !matcher.tracks(&reading.stream_id) {
                        continue;
                    }
                    let span = matcher.push(&reading.stream_id, reading.value, reading.timestamp);
                    if let Some(span) = span {
                        tracing::info!(
                            detector = %key,
                            start = %span.start,
                            end = %span.end,
                            "pattern matched"
                        );
                        let event = DetectionEvent {
                            id: Uuid::new_v4(),
                            definition_id: key.definition_id.clone(),
                            asset_id: key.asset_id.clone(),
                            start: span.start,
                            end: span.end,
                            stream_ids: matcher.stream_ids(),
                        };
                        // a lost detection is not fatal
                        if let Err(err) = detections_tx.try_send(event) {
                            tracing::warn!(detector = %key, error = %err, "detection queue full; event dropped");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(detector = %key, skipped, "live feed lagged; readings skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::info!(detector = %key, "detector stopped");
}

/// Drains detection events onto the graph write surface. Write failures
/// are logged and the detectors keep running.
pub fn spawn_detection_writer<G: GraphApi>(
    graph: G,
    mut rx: mpsc::Receiver<DetectionEvent>,
    stats: Arc<EngineStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match graph.write_detection(&event).await {
                Ok(()) => {
                    stats.detections_emitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::warn!(
                        definition = %event.definition_id,
                        asset = %event.asset_id,
                        error = %err,
                        "failed to record detection"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn test_key() -> DetectorKey {
        DetectorKey {
            definition_id: "overrun".to_string(),
            asset_id: "asset-7".to_string(),
        }
    }

    fn test_matcher() -> PatternMatcher {
        PatternMatcher::new(
            vec![BaselineTrack {
                live_id: "asset-7/temp".to_string(),
                baseline: vec![2.0, 2.0, 2.0],
                min_max: Some((0.0, 10.0)),
                precision: 0.9,
            }],
            ChronoDuration::seconds(60),
            ChronoDuration::seconds(30),
        )
    }

    #[tokio::test]
    async fn matching_readings_produce_a_detection_event() {
        let (live_tx, live_rx) = broadcast::channel(64);
        let (detections_tx, mut detections_rx) = mpsc::channel(8);
        let handle = spawn_detector(test_key(), test_matcher(), live_rx, detections_tx);

        let base = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        for i in 0..3 {
            live_tx
                .send(LiveReading {
                    stream_id: "asset-7/temp".to_string(),
                    value: 2.0,
                    timestamp: base + ChronoDuration::seconds(i),
                })
                .unwrap();
        }
        // an untracked stream must not disturb the windows
        live_tx
            .send(LiveReading {
                stream_id: "asset-9/temp".to_string(),
                value: 99.0,
                timestamp: base,
            })
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), detections_rx.recv())
            .await
            .expect("detection within bound")
            .expect("event present");
        assert_eq!(event.definition_id, "overrun");
        assert_eq!(event.asset_id, "asset-7");
        assert_eq!(event.end - event.start, ChronoDuration::seconds(60));
        assert_eq!(event.stream_ids, vec!["asset-7/temp".to_string()]);

        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_joins_the_task_promptly() {
        let (_live_tx, live_rx) = broadcast::channel::<LiveReading>(8);
        let (detections_tx, _detections_rx) = mpsc::channel(1);
        let handle = spawn_detector(test_key(), test_matcher(), live_rx, detections_tx);
        let started = std::time::Instant::now();
        handle.stop(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
