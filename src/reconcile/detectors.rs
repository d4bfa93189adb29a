use crate::detect::{spawn_detector, BaselineTrack, DetectorHandle, PatternMatcher};
use crate::error::GraphError;
use crate::graph::GraphApi;
use crate::model::{DetectionEvent, DetectorKey, DetectorSpec};
use crate::persistence::PersistenceRegistry;
use crate::status::EngineStats;
use chrono::Duration as ChronoDuration;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Converges the running detector set onto the declared (definition,
/// asset) pairs. Stopping is synchronous so two detector instances for the
/// same key never run concurrently.
pub struct DetectorReconciler<G: GraphApi> {
    graph: G,
    registry: Arc<PersistenceRegistry>,
    detections_tx: mpsc::Sender<DetectionEvent>,
    stats: Arc<EngineStats>,
    debounce: ChronoDuration,
    stop_timeout: Duration,
    running: HashMap<DetectorKey, DetectorHandle>,
}

impl<G: GraphApi> DetectorReconciler<G> {
    pub fn new(
        graph: G,
        registry: Arc<PersistenceRegistry>,
        detections_tx: mpsc::Sender<DetectionEvent>,
        stats: Arc<EngineStats>,
        debounce: ChronoDuration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            graph,
            registry,
            detections_tx,
            stats,
            debounce,
            stop_timeout,
            running: HashMap::new(),
        }
    }

    pub async fn reconcile(&mut self, desired: &[DetectorSpec]) {
        let desired_keys: HashSet<DetectorKey> = desired.iter().map(DetectorSpec::key).collect();

        let stale: Vec<DetectorKey> = self
            .running
            .keys()
            .filter(|key| !desired_keys.contains(key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = self.running.remove(&key) {
                tracing::info!(detector = %key, "stopping removed detector");
                handle.stop(self.stop_timeout).await;
            }
        }

        for spec in desired {
            let key = spec.key();
            if self.running.contains_key(&key) {
                continue;
            }
            match self.build_matcher(spec).await {
                Ok(matcher) => {
                    tracing::info!(detector = %key, streams = spec.streams.len(), "starting detector");
                    let live_rx = self.registry.subscribe_live();
                    let handle =
                        spawn_detector(key.clone(), matcher, live_rx, self.detections_tx.clone());
                    self.running.insert(key, handle);
                }
                Err(err) if err.is_not_found() => {
                    tracing::warn!(
                        detector = %key,
                        error = %err,
                        "baseline stream missing; detector not created"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        detector = %key,
                        error = %err,
                        "baseline read failed; deferred to next reconciliation"
                    );
                }
            }
        }

        self.stats
            .active_detectors
            .store(self.running.len(), Ordering::Relaxed);
    }

    /// Baselines are fetched once, at construction, over the original
    /// annotation's recorded interval. A missing stream aborts creation of
    /// this one detector; it is retried on the next full reconciliation.
    async fn build_matcher(&self, spec: &DetectorSpec) -> Result<PatternMatcher, GraphError> {
        let mut tracks = Vec::with_capacity(spec.streams.len());
        for binding in &spec.streams {
            let mut samples = self
                .graph
                .read_historical_period(&binding.original_id, spec.annotated_begin, spec.annotated_end)
                .await?;
            samples.sort_by_key(|sample| sample.timestamp);
            if samples.is_empty() {
                return Err(GraphError::NotFound(format!(
                    "{} has no samples over the annotated period",
                    binding.original_id
                )));
            }
            tracks.push(BaselineTrack {
                live_id: binding.live_id.clone(),
                baseline: samples.iter().map(|sample| sample.value).collect(),
                min_max: match (binding.min, binding.max) {
                    (Some(min), Some(max)) => Some((min, max)),
                    _ => None,
                },
                precision: binding.precision,
            });
        }
        Ok(PatternMatcher::new(
            tracks,
            spec.annotated_end - spec.annotated_begin,
            self.debounce,
        ))
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    pub async fn shutdown(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.stop(self.stop_timeout).await;
        }
        self.stats.active_detectors.store(0, Ordering::Relaxed);
    }
}
