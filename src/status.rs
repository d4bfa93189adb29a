use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters polled by the external status cache. Connection/detector counts
/// are stored by the reconcilers after each pass, so they reflect actual
/// reconciled state rather than desired state.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub active_connections: AtomicUsize,
    pub active_detectors: AtomicUsize,
    pub readings_received: AtomicU64,
    pub writes_dropped: AtomicU64,
    pub detections_emitted: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn active_detector_count(&self) -> usize {
        self.active_detectors.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    active_connections: usize,
    active_detectors: usize,
    readings_received: u64,
    writes_dropped: u64,
    detections_emitted: u64,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(stats): State<Arc<EngineStats>>) -> Json<StatusBody> {
    Json(StatusBody {
        active_connections: stats.active_connection_count(),
        active_detectors: stats.active_detector_count(),
        readings_received: stats.readings_received.load(Ordering::Relaxed),
        writes_dropped: stats.writes_dropped.load(Ordering::Relaxed),
        detections_emitted: stats.detections_emitted.load(Ordering::Relaxed),
    })
}

pub fn router(stats: Arc<EngineStats>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(stats)
}

pub async fn serve(addr: &str, stats: Arc<EngineStats>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "status endpoint listening");
    axum::serve(listener, router(stats)).await?;
    Ok(())
}
