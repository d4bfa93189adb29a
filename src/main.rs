mod config;
mod detect;
mod error;
mod graph;
mod model;
mod persistence;
mod protocol;
mod reconcile;
mod status;

use crate::config::Config;
use crate::detect::spawn_detection_writer;
use crate::graph::{GraphApi, HttpGraphApi};
use crate::persistence::{PersistenceRegistry, PersistenceSettings};
use crate::protocol::ConnectionOptions;
use crate::reconcile::connections::ConnectionReconciler;
use crate::reconcile::detectors::DetectorReconciler;
use crate::status::EngineStats;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,twin_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "twin-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let stats = Arc::new(EngineStats::new());
    let registry = Arc::new(PersistenceRegistry::new(
        PersistenceSettings::from_config(&config),
        config.live_tap_capacity,
        stats.clone(),
    ));
    let graph = HttpGraphApi::new(&config.graph_base_url, config.graph_api_token.clone());

    let (detections_tx, detections_rx) = mpsc::channel(config.detection_queue);
    let detection_writer = spawn_detection_writer(graph.clone(), detections_rx, stats.clone());

    let mut connections = ConnectionReconciler::new(
        registry.clone(),
        stats.clone(),
        ConnectionOptions {
            mqtt_client_prefix: config.mqtt_client_prefix.clone(),
            mqtt_keepalive: config.mqtt_keepalive(),
            modbus_poll_interval: config.modbus_poll_interval(),
        },
        config.stop_timeout(),
    );
    let mut detectors = DetectorReconciler::new(
        graph.clone(),
        registry.clone(),
        detections_tx,
        stats.clone(),
        config.detection_debounce(),
        config.stop_timeout(),
    );

    let status_handle = {
        let addr = config.status_listen_addr.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            if let Err(err) = status::serve(&addr, stats).await {
                tracing::error!(error = %err, "status endpoint exited");
            }
        })
    };

    // single caller: reconciliation passes are serialized by construction;
    // the first tick fires immediately for the startup reconcile
    let mut ticker = tokio::time::interval(config.reconcile_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match graph.desired_inputs().await {
                    Ok(desired) => connections.reconcile(&desired).await,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to load desired connections; keeping current state");
                    }
                }
                match graph.desired_detectors().await {
                    Ok(desired) => detectors.reconcile(&desired).await,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to load desired detectors; keeping current state");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    connections.shutdown().await;
    detectors.shutdown().await;
    registry.flush_all().await;
    status_handle.abort();
    drop(detection_writer);

    Ok(())
}
