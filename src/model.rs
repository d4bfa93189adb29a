use crate::error::ConfigError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Mqtt,
    ModbusTcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Timeseries,
    Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub kind: ProtocolKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    /// Modbus only: unit (slave) id on the shared TCP endpoint.
    #[serde(default)]
    pub unit: Option<u8>,
    /// Modbus only: request/response poll period override.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl ConnectionDescriptor {
    /// Credentials are referenced by environment variable name so the graph
    /// never stores secrets. A dangling reference skips this connection only.
    pub fn resolve_credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        let user_var = self
            .username_env
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let Some(user_var) = user_var else {
            return Ok(None);
        };
        let username = std::env::var(user_var)
            .map_err(|_| ConfigError::MissingEnv(user_var.to_string()))?;
        let password = match self
            .password_env
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            Some(pass_var) => std::env::var(pass_var)
                .map_err(|_| ConfigError::MissingEnv(pass_var.to_string()))?,
            None => String::new(),
        };
        Ok(Some((username, password)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub kind: BackendKind,
    pub url: String,
}

/// One desired live subscription: a sensor bound to a connection, a
/// protocol-specific address (topic or register) and a persistence backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub id: String,
    pub address: String,
    pub connection: ConnectionDescriptor,
    pub backend: BackendDescriptor,
}

#[derive(Debug, Clone)]
pub enum ReadingValue {
    Float { value: f64, quality: i32 },
    Bool(bool),
    Bytes(Bytes),
}

impl ReadingValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Float { value, .. } => Some(*value),
            ReadingValue::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            ReadingValue::Bytes(_) => None,
        }
    }
}

/// Numeric reading fanned out to pattern detectors.
#[derive(Debug, Clone)]
pub struct LiveReading {
    pub stream_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectorKey {
    pub definition_id: String,
    pub asset_id: String,
}

impl std::fmt::Display for DetectorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.definition_id, self.asset_id)
    }
}

/// Maps a stream of the original annotated occurrence to the live stream
/// playing its role on the scanned asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamBinding {
    pub original_id: String,
    pub live_id: String,
    /// Relative precision in (0, 1]; the stream matches while its
    /// length-normalized distance stays below `1 - precision`.
    pub precision: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSpec {
    pub definition_id: String,
    pub asset_id: String,
    /// Interval of the original annotated occurrence; baselines are read
    /// over this period.
    pub annotated_begin: DateTime<Utc>,
    pub annotated_end: DateTime<Utc>,
    pub streams: Vec<StreamBinding>,
}

impl DetectorSpec {
    pub fn key(&self) -> DetectorKey {
        DetectorKey {
            definition_id: self.definition_id.clone(),
            asset_id: self.asset_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub definition_id: String,
    pub asset_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Live streams that produced the match, for relationship linking.
    pub stream_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(username_env: Option<&str>, password_env: Option<&str>) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id: "plc-7".to_string(),
            kind: ProtocolKind::Mqtt,
            host: "127.0.0.1".to_string(),
            port: 1883,
            username_env: username_env.map(str::to_string),
            password_env: password_env.map(str::to_string),
            unit: None,
            poll_interval_ms: None,
        }
    }

    #[test]
    fn resolves_credentials_from_environment() {
        std::env::set_var("TWIN_TEST_BROKER_USER", "ingest");
        std::env::set_var("TWIN_TEST_BROKER_PASS", "s3cret");
        let resolved = descriptor(Some("TWIN_TEST_BROKER_USER"), Some("TWIN_TEST_BROKER_PASS"))
            .resolve_credentials()
            .unwrap();
        assert_eq!(resolved, Some(("ingest".to_string(), "s3cret".to_string())));
    }

    #[test]
    fn anonymous_connection_needs_no_environment() {
        let resolved = descriptor(None, None).resolve_credentials().unwrap();
        assert_eq!(resolved, None);
    }

    #[test]
    fn missing_variable_is_a_config_error() {
        let err = descriptor(Some("TWIN_TEST_UNSET_USER"), None)
            .resolve_credentials()
            .unwrap_err();
        assert!(err.to_string().contains("TWIN_TEST_UNSET_USER"));
    }

    #[test]
    fn input_descriptor_round_trips_through_json() {
        let raw = serde_json::json!({
            "id": "asset-3/temp",
            "address": "plant/asset-3/temp",
            "connection": {
                "id": "broker-main",
                "kind": "mqtt",
                "host": "broker.local",
                "port": 1883
            },
            "backend": { "id": "ts-main", "kind": "timeseries", "url": "postgres://twin@db/twin" }
        });
        let input: InputDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(input.connection.kind, ProtocolKind::Mqtt);
        assert_eq!(input.backend.kind, BackendKind::Timeseries);
        assert_eq!(input.connection.unit, None);
    }
}
