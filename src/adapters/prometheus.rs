//! Metrics source backed by the Prometheus HTTP query API

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::MetricsSource;
use crate::config::MetricsConfig;
use crate::{Error, Result};

/// Placeholder replaced with the gate window in query templates
pub const WINDOW_PLACEHOLDER: &str = "{window}";

/// Queries `GET /api/v1/query` for instant vector or scalar results
pub struct PrometheusSource {
    client: Client,
    endpoint: String,
    queries: BTreeMap<String, String>,
}

impl PrometheusSource {
    /// Create a source from configuration
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.query_timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/v1/query", config.prometheus_url.trim_end_matches('/')),
            queries: config.query_templates(),
        })
    }

    /// PromQL for a metric key.
    ///
    /// Known keys use their configured template; anything else is sent as-is.
    #[must_use]
    pub fn resolve(&self, metric: &str, window: Duration) -> String {
        let template = self.queries.get(metric).map_or(metric, String::as_str);
        template.replace(WINDOW_PLACEHOLDER, &format!("{}s", window.as_secs().max(1)))
    }
}

/// Extract the first sample from a query response body
pub fn parse_query_response(metric: &str, body: &Value) -> Result<f64> {
    let unavailable = |why: &str| Error::MetricsUnavailable(format!("{metric}: {why}"));

    if body.get("status").and_then(Value::as_str) != Some("success") {
        return Err(unavailable("query did not succeed"));
    }

    let data = body.get("data").ok_or_else(|| unavailable("missing data"))?;
    let sample = match data.get("resultType").and_then(Value::as_str) {
        Some("scalar") => data.get("result"),
        _ => data
            .get("result")
            .and_then(Value::as_array)
            .and_then(|series| series.first())
            .and_then(|first| first.get("value")),
    }
    .ok_or_else(|| unavailable("empty result"))?;

    // A sample is `[timestamp, "value"]`.
    let raw = sample
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| unavailable("malformed sample"))?;
    let value: f64 = raw
        .parse()
        .map_err(|_| unavailable(&format!("unparsable value '{raw}'")))?;

    if value.is_nan() {
        return Err(unavailable("NaN"));
    }
    Ok(value)
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    async fn query(&self, metric: &str, window: Duration) -> Result<f64> {
        let promql = self.resolve(metric, window);
        debug!(metric, query = %promql, "Querying Prometheus");

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("query", promql.as_str())])
            .send()
            .await
            .map_err(|e| Error::MetricsUnavailable(format!("{metric}: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::MetricsUnavailable(format!(
                "{metric}: HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::MetricsUnavailable(format!("{metric}: {e}")))?;
        parse_query_response(metric, &body)
    }
}
