//! Prometheus trigger scaler
//!
//! Evaluates an instant-query against a Prometheus-compatible endpoint and
//! compares the single returned sample to a threshold. The health probe runs
//! a constructed uptime query over the cooldown window so that a metric store
//! that has recently been down cannot cause a spurious scale-to-zero.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{Scaler, ScalerError};

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_UPTIME_FILTER: &str = "container=\"prometheus\"";

/// Trigger metadata understood by the prometheus scaler
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PrometheusMetadata {
    /// Base URL of the query endpoint, e.g. `http://prometheus:9090`
    pub server_address: String,
    /// Instant query whose single sample is compared to the threshold
    pub query: String,
    /// Idleness threshold; samples below it count as idle
    #[serde(deserialize_with = "threshold_from_string_or_number")]
    pub threshold: f64,
    /// Label filter for the uptime health query
    #[serde(default)]
    pub uptime_filter: Option<String>,
}

/// The threshold travels as a quoted string on the wire; bare numbers are
/// tolerated as well.
fn threshold_from_string_or_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Scaler backed by a Prometheus instant query
#[derive(Debug)]
pub struct PrometheusScaler {
    client: reqwest::Client,
    metadata: PrometheusMetadata,
    cooldown_period: Duration,
}

impl PrometheusScaler {
    /// Parse the trigger metadata and build the HTTP client
    pub fn new(
        metadata: &serde_json::Value,
        cooldown_period: Duration,
    ) -> Result<Self, ScalerError> {
        let metadata: PrometheusMetadata = serde_json::from_value(metadata.clone())
            .map_err(|e| ScalerError::ParseMetadata(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(HTTP_CLIENT_TIMEOUT)
            .build()
            .map_err(|e| ScalerError::BuildRequest(e.to_string()))?;

        Ok(Self {
            client,
            metadata,
            cooldown_period,
        })
    }

    async fn execute_query(&self, query: &str) -> Result<Option<f64>, ScalerError> {
        let time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let url = format!(
            "{}/api/v1/query?query={}&time={}",
            self.metadata.server_address,
            query_escape(query),
            time
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_builder() {
                ScalerError::BuildRequest(e.to_string())
            } else {
                ScalerError::ExecuteRequest(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScalerError::UnexpectedStatus(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ScalerError::ExecuteRequest(e.to_string()))?;

        parse_query_response(&body, query)
    }

    fn uptime_query(&self) -> String {
        let filter = self
            .metadata
            .uptime_filter
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_UPTIME_FILTER);
        let window = self.cooldown_period.as_secs_f64().ceil() as u64;
        format!("min_over_time((max(up{{{filter}}}) or vector(0))[{window}s:])")
    }
}

#[async_trait]
impl Scaler for PrometheusScaler {
    async fn should_scale_to_zero(&self) -> Result<bool, ScalerError> {
        match self.execute_query(&self.metadata.query).await? {
            // No data: cannot conclude the workload is idle.
            None => Ok(false),
            Some(value) => Ok(value < self.metadata.threshold),
        }
    }

    async fn should_scale_from_zero(&self) -> Result<bool, ScalerError> {
        match self.execute_query(&self.metadata.query).await? {
            // No data: fail open, never strand traffic.
            None => Ok(true),
            Some(value) => Ok(value >= self.metadata.threshold),
        }
    }

    async fn is_healthy(&self) -> Result<bool, ScalerError> {
        let query = self.uptime_query();
        match self.execute_query(&query).await {
            Ok(Some(value)) => Ok(value == 1.0),
            // The uptime query carries `or vector(0)`, so a shapeless answer
            // is a store-side glitch, not evidence of downtime.
            Ok(None) => Ok(true),
            Err(e) if e.is_http() => Err(e),
            Err(e) => {
                debug!(error = %e, "ignoring non-HTTP error in health probe");
                Ok(true)
            }
        }
    }

    async fn close(&self) {
        // reqwest pools connections per client; dropping the scaler at the
        // end of the evaluation cycle releases them.
    }
}

/// URL-escape a PromQL query. Spaces must travel as `%20`, not `+`, because
/// the query lands in a URL query string rather than a form body.
fn query_escape(query: &str) -> String {
    let escaped: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    escaped.replace('+', "%20")
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    value: Vec<serde_json::Value>,
}

/// Decode an instant-query response body into a single sample.
///
/// `Ok(None)` is the "no data" outcome (empty result set, or a null sample).
/// Every other malformed shape maps to a distinct [`ScalerError`] kind.
fn parse_query_response(body: &[u8], query: &str) -> Result<Option<f64>, ScalerError> {
    let response: QueryResponse =
        serde_json::from_slice(body).map_err(|e| ScalerError::Decode(e.to_string()))?;

    let results = &response.data.result;
    if results.is_empty() {
        return Ok(None);
    }
    if results.len() > 1 {
        return Err(ScalerError::MultipleResults(query.to_string()));
    }

    let value = &results[0].value;
    if value.is_empty() {
        return Err(ScalerError::EmptyValue(query.to_string()));
    }
    if value.len() < 2 {
        return Err(ScalerError::ShortValue(query.to_string()));
    }

    let sample = match &value[1] {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|e| ScalerError::ParseValue(e.to_string()))?,
        other => {
            return Err(ScalerError::ParseValue(format!(
                "expected string sample, got {other}"
            )))
        }
    };

    if sample.is_infinite() {
        return Err(ScalerError::InfiniteValue);
    }

    Ok(Some(sample))
}
