use crate::error::GraphError;
use crate::model::{DetectionEvent, DetectorSpec, InputDescriptor};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Boundary to the declarative graph/query layer. The engine only consumes
/// desired state, historical periods and a detection write surface; the
/// graph schema itself lives on the other side of this trait.
pub trait GraphApi: Clone + Send + Sync + 'static {
    fn desired_inputs(
        &self,
    ) -> impl Future<Output = Result<Vec<InputDescriptor>, GraphError>> + Send;

    fn desired_detectors(
        &self,
    ) -> impl Future<Output = Result<Vec<DetectorSpec>, GraphError>> + Send;

    /// Ordered samples for one stream over a closed period. NotFound when
    /// the stream id is unknown.
    fn read_historical_period(
        &self,
        stream_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<HistoricalSample>, GraphError>> + Send;

    /// Records one detection occurrence and links it to the scanned asset,
    /// the scanned streams and the matched pattern definition.
    fn write_detection(
        &self,
        detection: &DetectionEvent,
    ) -> impl Future<Output = Result<(), GraphError>> + Send;
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
struct InputsResponse {
    inputs: Vec<InputDescriptor>,
}

#[derive(Debug, Deserialize)]
struct DetectorsResponse {
    detectors: Vec<DetectorSpec>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    samples: Vec<HistoricalSample>,
}

#[derive(Clone)]
pub struct HttpGraphApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpGraphApi {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .timeout(REQUEST_TIMEOUT);
        if let Some(token) = &self.token {
            request = request.header("X-Graph-Token", token);
        }
        request
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, GraphError> {
        let response = request
            .send()
            .await
            .map_err(|err| GraphError::Connectivity(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GraphError::NotFound(what.to_string()));
        }
        if !response.status().is_success() {
            return Err(GraphError::Protocol(format!(
                "{} returned status {}",
                what,
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| GraphError::Protocol(err.to_string()))
    }
}

impl GraphApi for HttpGraphApi {
    async fn desired_inputs(&self) -> Result<Vec<InputDescriptor>, GraphError> {
        let response: InputsResponse = self
            .fetch(self.get("/v1/desired/inputs"), "desired inputs")
            .await?;
        Ok(response.inputs)
    }

    async fn desired_detectors(&self) -> Result<Vec<DetectorSpec>, GraphError> {
        let response: DetectorsResponse = self
            .fetch(self.get("/v1/desired/detectors"), "desired detectors")
            .await?;
        Ok(response.detectors)
    }

    async fn read_historical_period(
        &self,
        stream_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalSample>, GraphError> {
        let request = self
            .get(&format!("/v1/streams/{stream_id}/history"))
            .query(&[("begin", begin.to_rfc3339()), ("end", end.to_rfc3339())]);
        let response: HistoryResponse = self.fetch(request, stream_id).await?;
        Ok(response.samples)
    }

    async fn write_detection(&self, detection: &DetectionEvent) -> Result<(), GraphError> {
        let mut request = self
            .client
            .post(format!("{}/v1/detections", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(detection);
        if let Some(token) = &self.token {
            request = request.header("X-Graph-Token", token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| GraphError::Connectivity(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GraphError::Protocol(format!(
                "detection write returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_spec_parses_from_graph_payload() {
        let raw = serde_json::json!({
            "detectors": [{
                "definition_id": "pump-cavitation",
                "asset_id": "asset-7",
                "annotated_begin": "2026-05-01T10:00:00Z",
                "annotated_end": "2026-05-01T10:05:00Z",
                "streams": [{
                    "original_id": "asset-1/pressure",
                    "live_id": "asset-7/pressure",
                    "precision": 0.85,
                    "min": 0.0,
                    "max": 16.0
                }, {
                    "original_id": "asset-1/valve_open",
                    "live_id": "asset-7/valve_open",
                    "precision": 0.9
                }]
            }]
        });
        let response: DetectorsResponse = serde_json::from_value(raw).unwrap();
        let spec = &response.detectors[0];
        assert_eq!(spec.key().to_string(), "pump-cavitation/asset-7");
        assert_eq!(spec.streams.len(), 2);
        assert_eq!(spec.streams[0].min, Some(0.0));
        assert_eq!(spec.streams[1].min, None);
    }
}
