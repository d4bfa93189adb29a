use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub graph_base_url: String,
    pub graph_api_token: Option<String>,
    pub reconcile_interval_secs: u64,
    pub detection_debounce_secs: i64,
    pub stop_timeout_secs: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub db_pool_size: u32,
    pub db_acquire_timeout_secs: u64,
    pub live_tap_capacity: usize,
    pub detection_queue: usize,
    pub mqtt_client_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub modbus_poll_interval_ms: u64,
    pub status_listen_addr: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let graph_base_url = env::var("TWIN_GRAPH_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .context("TWIN_GRAPH_URL is required (base URL of the graph query API)")?;
        let graph_api_token = env::var("TWIN_GRAPH_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let reconcile_interval_secs = env::var("TWIN_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30)
            .max(1);
        let detection_debounce_secs = env::var("TWIN_DETECTION_DEBOUNCE_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(30)
            .max(0);
        let stop_timeout_secs = env::var("TWIN_STOP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5)
            .max(1);

        let batch_size = env::var("TWIN_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(500)
            .max(1);
        let flush_interval_ms = env::var("TWIN_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(750)
            .max(1);
        let max_queue = env::var("TWIN_MAX_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(batch_size * 10)
            .max(1);
        let db_pool_size = env::var("TWIN_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(4)
            .max(1);
        let db_acquire_timeout_secs = env::var("TWIN_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5)
            .max(1);

        let live_tap_capacity = env::var("TWIN_LIVE_TAP_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1024)
            .max(16);
        let detection_queue = env::var("TWIN_DETECTION_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(64)
            .max(1);

        let mqtt_client_prefix = env::var("TWIN_MQTT_CLIENT_PREFIX")
            .unwrap_or_else(|_| format!("twin-ingest-{}", std::process::id()));
        let mqtt_keepalive_secs = env::var("TWIN_MQTT_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30)
            .max(5);
        let modbus_poll_interval_ms = env::var("TWIN_MODBUS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1000)
            .max(50);

        let status_listen_addr =
            env::var("TWIN_STATUS_LISTEN").unwrap_or_else(|_| "127.0.0.1:9605".to_string());
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        Ok(Self {
            graph_base_url,
            graph_api_token,
            reconcile_interval_secs,
            detection_debounce_secs,
            stop_timeout_secs,
            batch_size,
            flush_interval_ms,
            max_queue,
            db_pool_size,
            db_acquire_timeout_secs,
            live_tap_capacity,
            detection_queue,
            mqtt_client_prefix,
            mqtt_keepalive_secs,
            modbus_poll_interval_ms,
            status_listen_addr,
            otlp_endpoint,
        })
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn detection_debounce(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.detection_debounce_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.db_acquire_timeout_secs)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn modbus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.modbus_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_only_graph_url_is_set() {
        std::env::set_var("TWIN_GRAPH_URL", "http://graph.local:8000/");
        let config = Config::from_env().unwrap();
        assert_eq!(config.graph_base_url, "http://graph.local:8000");
        assert_eq!(config.reconcile_interval_secs, 30);
        assert_eq!(config.detection_debounce_secs, 30);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.max_queue, 5000);
    }
}
