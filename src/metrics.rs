use chrono::{DateTime, Utc};
use kube::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One node's last observation of a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetric {
    pub value: f64,
    pub window_seconds: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Node name to its last observation.
pub type NodeMetricValues = HashMap<String, NodeMetric>;

#[derive(Debug, Default)]
struct MetricEntry {
    /// How many registered policies reference this metric.
    references: usize,
    values: NodeMetricValues,
}

/// Last-observation store for every metric any registered policy references.
///
/// Snapshots replace atomically per metric; eviction follows the reference
/// count so deleted policies stop paying for their metrics.
#[derive(Debug, Default)]
pub struct MetricsCache {
    inner: RwLock<HashMap<String, MetricEntry>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_reference(&self, metric: &str) {
        let mut inner = self.inner.write().await;
        inner.entry(metric.to_string()).or_default().references += 1;
    }

    pub async fn remove_reference(&self, metric: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(metric) {
            entry.references = entry.references.saturating_sub(1);
            if entry.references == 0 {
                inner.remove(metric);
                debug!(metric, "evicted unreferenced metric");
            }
        }
    }

    /// Replaces the whole per-node snapshot of `metric`. Untracked metrics are
    /// dropped on the floor.
    pub async fn update(&self, metric: &str, values: NodeMetricValues) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(metric) {
            entry.values = values;
        }
    }

    pub async fn node_value(&self, metric: &str, node: &str) -> Option<f64> {
        let inner = self.inner.read().await;
        inner
            .get(metric)
            .and_then(|entry| entry.values.get(node))
            .map(|observation| observation.value)
    }

    pub async fn values(&self, metric: &str) -> Option<NodeMetricValues> {
        let inner = self.inner.read().await;
        inner.get(metric).map(|entry| entry.values.clone())
    }

    pub async fn tracked_metrics(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.keys().cloned().collect()
    }

    /// A consistent copy of every node observation, for strategy evaluation.
    pub async fn snapshot(&self) -> HashMap<String, NodeMetricValues> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .map(|(metric, entry)| (metric.clone(), entry.values.clone()))
            .collect()
    }
}

/// Parses a Kubernetes quantity string into a float; only the milli suffix
/// needs scaling for metric values.
pub fn parse_quantity(value: &str) -> Option<f64> {
    if let Some(milli) = value.strip_suffix('m') {
        return milli.parse::<f64>().ok().map(|v| v / 1000.0);
    }
    value.parse::<f64>().ok()
}

#[derive(Debug, Deserialize)]
struct MetricValueList {
    #[serde(default)]
    items: Vec<MetricValueItem>,
}

#[derive(Debug, Deserialize)]
struct MetricValueItem {
    #[serde(rename = "describedObject")]
    described_object: DescribedObject,
    value: String,
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "windowSeconds")]
    window_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DescribedObject {
    name: String,
}

/// Thin reader over the custom-metrics API. The pipeline that produces the
/// values (an adapter scraping node exporters) is outside this program.
#[derive(Clone)]
pub struct MetricsReader {
    client: Client,
}

impl MetricsReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Current per-node values of `metric` from
    /// `/apis/custom.metrics.k8s.io/v1beta2/nodes/*/<metric>`.
    pub async fn node_metrics(&self, metric: &str) -> Result<NodeMetricValues> {
        let path = format!("/apis/custom.metrics.k8s.io/v1beta2/nodes/%2A/{metric}");
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|err| Error::NotFound(format!("cannot build metric request: {err}")))?;
        let list: MetricValueList = self.client.request(request).await?;

        let mut values = NodeMetricValues::new();
        for item in list.items {
            let Some(value) = parse_quantity(&item.value) else {
                warn!(metric, node = %item.described_object.name, raw = %item.value,
                    "unparsable metric quantity");
                continue;
            };
            values.insert(
                item.described_object.name,
                NodeMetric {
                    value,
                    window_seconds: item.window_seconds,
                    timestamp: item.timestamp.unwrap_or_else(Utc::now),
                },
            );
        }
        if values.is_empty() {
            debug!(metric, "metric has no node observations");
        }
        Ok(values)
    }
}
