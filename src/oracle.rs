//! Traffic oracle backed by the Prometheus HTTP API.
//!
//! The idler asks for the number of successful requests an environment's
//! ingresses served over a window; any nonzero count keeps the environment
//! awake. A query failure is surfaced as an error so the caller can abort
//! idling rather than guess.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait TrafficOracle: Send + Sync {
    /// Returns the total successful-request count for the namespace over the
    /// trailing window.
    async fn namespace_hits(&self, namespace: &str, window: Duration) -> Result<u64>;
}

pub struct PrometheusOracle {
    client: reqwest::Client,
    address: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    warnings: Vec<String>,
    data: Option<QueryData>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    value: (f64, String),
}

impl PrometheusOracle {
    pub fn new(address: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building prometheus http client")?;
        Ok(PrometheusOracle { client, address: address.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl TrafficOracle for PrometheusOracle {
    async fn namespace_hits(&self, namespace: &str, window: Duration) -> Result<u64> {
        // total requests to any ingress in the namespace by status code
        let query = format!(
            "round(sum(increase(nginx_ingress_controller_requests{{exported_namespace=\"{}\",status=\"200\"}}[{}s])) by (status))",
            namespace,
            window.as_secs(),
        );
        let now =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs().to_string();
        let response: QueryResponse = self
            .client
            .get(format!("{}/api/v1/query", self.address))
            .query(&[("query", query.as_str()), ("time", now.as_str())])
            .send()
            .await
            .context("querying prometheus")?
            .error_for_status()
            .context("prometheus returned an error status")?
            .json()
            .await
            .context("decoding prometheus response")?;

        for warning in &response.warnings {
            log::warn!(target: "oracle", "prometheus warning: {}", warning);
        }
        if response.status != "success" {
            return Err(anyhow!("prometheus query status {}", response.status));
        }
        let data = response.data.ok_or_else(|| anyhow!("prometheus response without data"))?;
        if data.result_type != "vector" {
            return Err(anyhow!("unexpected prometheus result type {}", data.result_type));
        }
        let mut hits = 0u64;
        for sample in data.result {
            hits += sample.value.1.parse::<f64>().unwrap_or(0.0) as u64;
        }
        Ok(hits)
    }
}
