//! Control signals
//!
//! The CPU loop is driven by two inputs: the latency slack of the tracked
//! QoS application (plus a global on/off switch), both served by the QoS
//! data store, and the node's CPU utilization. Sources report failures as
//! errors; the control loop owns the fallback policy.

use crate::registry::WorkloadRegistry;
use crate::runtime::{ContainerRuntime, RuntimeError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid signal source url: {0}")]
    Url(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("QoS data store reported an error: {0}")]
    Store(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Latency slack of the QoS application
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Slack {
    pub slack: f64,
    pub latency: f64,
}

#[async_trait]
pub trait SlackSource: Send + Sync {
    /// Global controller switch
    async fn controller_enabled(&self) -> Result<bool, SignalError>;

    /// Slack of `app`. An unknown app or a missing slack value reads as zero.
    async fn slack(&self, app: &str) -> Result<Slack, SignalError>;
}

#[async_trait]
pub trait UtilizationSource: Send + Sync {
    /// Node CPU utilization in percent
    async fn node_cpu_percent(&self) -> Result<f64, SignalError>;
}

#[derive(Debug, Deserialize)]
struct SwitchResponse {
    data: bool,
}

#[derive(Debug, Deserialize)]
struct AppMetricsResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct AppEntry {
    #[serde(default)]
    metrics: AppMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct AppMetrics {
    slack: Option<f64>,
    latency: Option<f64>,
}

/// Pick one application's slack out of a `/v1/apps/metrics` body
pub fn parse_app_metrics(body: &str, app: &str) -> Result<Slack, SignalError> {
    let response: AppMetricsResponse =
        serde_json::from_str(body).map_err(|e| SignalError::Store(e.to_string()))?;
    if response.error {
        return Err(SignalError::Store(response.data.to_string()));
    }

    let apps: HashMap<String, AppEntry> = serde_json::from_value(response.data).unwrap_or_default();
    let Some(entry) = apps.get(app) else {
        return Ok(Slack::default());
    };
    let Some(slack) = entry.metrics.slack else {
        return Ok(Slack::default());
    };

    Ok(Slack {
        slack,
        latency: entry.metrics.latency.unwrap_or(0.0),
    })
}

/// HTTP client for the QoS data store
pub struct QosDataStore {
    client: Client,
    base_url: Url,
}

impl QosDataStore {
    pub fn new(base_url: &str) -> Result<Self, SignalError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
        })
    }

    async fn get(&self, path: &str) -> Result<String, SignalError> {
        let url = self.base_url.join(path)?;
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(SignalError::Status {
                endpoint: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl SlackSource for QosDataStore {
    async fn controller_enabled(&self) -> Result<bool, SignalError> {
        let body = self.get("/v1/switch").await?;
        let switch: SwitchResponse =
            serde_json::from_str(&body).map_err(|e| SignalError::Store(e.to_string()))?;
        Ok(switch.data)
    }

    async fn slack(&self, app: &str) -> Result<Slack, SignalError> {
        let body = self.get("/v1/apps/metrics").await?;
        parse_app_metrics(&body, app)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryCpu {
    usage_nano_cores: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SummaryNode {
    cpu: Option<SummaryCpu>,
}

#[derive(Debug, Deserialize)]
struct Summary {
    node: SummaryNode,
}

/// Node CPU percent from a kubelet `/stats/summary` body
pub fn parse_kubelet_summary(body: &str, cpu_count: u32) -> Result<f64, SignalError> {
    let summary: Summary =
        serde_json::from_str(body).map_err(|e| SignalError::Store(e.to_string()))?;
    let nano_cores = summary
        .node
        .cpu
        .and_then(|cpu| cpu.usage_nano_cores)
        .ok_or_else(|| SignalError::Store("summary has no node.cpu.usageNanoCores".into()))?;

    Ok(nano_cores as f64 / (cpu_count.max(1) as f64 * 1e9) * 100.0)
}

/// Node utilization from the kubelet's read-only stats endpoint
pub struct KubeletSummary {
    client: Client,
    url: Url,
    cpu_count: u32,
}

impl KubeletSummary {
    pub fn new(node_name: &str, port: u16, cpu_count: u32) -> Result<Self, SignalError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let url = Url::parse(&format!("http://{}:{}/stats/summary", node_name, port))?;
        Ok(Self {
            client,
            url,
            cpu_count,
        })
    }
}

#[async_trait]
impl UtilizationSource for KubeletSummary {
    async fn node_cpu_percent(&self) -> Result<f64, SignalError> {
        let response = self.client.get(self.url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(SignalError::Status {
                endpoint: self.url.to_string(),
                status: response.status().as_u16(),
            });
        }
        parse_kubelet_summary(&response.text().await?, self.cpu_count)
    }
}

/// Node utilization as the sum of tracked containers' CPU percent.
///
/// Each sample is also recorded on the registry as the container's last
/// observed usage. Containers whose stats cannot be read are skipped.
pub struct RuntimeUtilization {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<WorkloadRegistry>,
}

impl RuntimeUtilization {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, registry: Arc<WorkloadRegistry>) -> Self {
        Self { runtime, registry }
    }
}

#[async_trait]
impl UtilizationSource for RuntimeUtilization {
    async fn node_cpu_percent(&self) -> Result<f64, SignalError> {
        let snapshot = self.registry.snapshot().await;
        let mut samples = Vec::new();

        for (_, container) in snapshot.containers() {
            match self.runtime.cpu_percent(&container.id).await {
                Ok(percent) => {
                    samples.push((container.pod_key.clone(), container.id.clone(), percent))
                }
                Err(e) => warn!(
                    subsystem = "cpu",
                    container_id = %container.id,
                    error = %e,
                    "Cannot read container CPU stats"
                ),
            }
        }

        let total: f64 = samples.iter().map(|(_, _, percent)| percent).sum();
        debug!(containers = samples.len(), total, "Runtime CPU utilization sampled");
        self.registry.set_cpu_percents(&samples).await;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerStatus, PodObject};
    use crate::testing::MockRuntime;

    const METRICS: &str = r#"{
        "error": false,
        "data": {
            "tech-demo": { "metrics": { "slack": 0.35, "latency": 12.5 } },
            "no-latency": { "metrics": { "slack": -0.1 } },
            "no-slack": { "metrics": { "latency": 3.0 } }
        }
    }"#;

    #[test]
    fn test_parse_app_metrics() {
        assert_eq!(
            parse_app_metrics(METRICS, "tech-demo").unwrap(),
            Slack { slack: 0.35, latency: 12.5 }
        );
        assert_eq!(
            parse_app_metrics(METRICS, "no-latency").unwrap(),
            Slack { slack: -0.1, latency: 0.0 }
        );
        assert_eq!(parse_app_metrics(METRICS, "no-slack").unwrap(), Slack::default());
        assert_eq!(parse_app_metrics(METRICS, "unknown").unwrap(), Slack::default());
    }

    #[test]
    fn test_store_error_flag() {
        let body = r#"{ "error": true, "data": "app registry unavailable" }"#;
        assert!(matches!(
            parse_app_metrics(body, "tech-demo"),
            Err(SignalError::Store(_))
        ));
        assert!(parse_app_metrics("not json", "tech-demo").is_err());
    }

    #[test]
    fn test_parse_kubelet_summary() {
        let body = r#"{ "node": { "nodeName": "n1", "cpu": { "usageNanoCores": 2000000000 } } }"#;
        let percent = parse_kubelet_summary(body, 4).unwrap();
        assert!((percent - 50.0).abs() < 1e-9);

        let missing = r#"{ "node": { "nodeName": "n1" } }"#;
        assert!(parse_kubelet_summary(missing, 4).is_err());
    }

    #[test]
    fn test_bad_store_url_rejected() {
        assert!(matches!(QosDataStore::new("not a url"), Err(SignalError::Url(_))));
    }

    #[tokio::test]
    async fn test_runtime_utilization_sums_and_records() {
        let runtime = Arc::new(MockRuntime::default());
        runtime.add_container("a", 100_000, -1);
        runtime.add_container("b", 100_000, -1);
        runtime.add_container("c", 100_000, -1);
        runtime.set_cpu_percent("a", 30.0);
        runtime.set_cpu_percent("b", 12.5);

        let registry = Arc::new(WorkloadRegistry::new());
        let mut object = PodObject {
            name: "web".to_string(),
            namespace: "default".to_string(),
            node_name: Some("node-1".to_string()),
            ..Default::default()
        };
        for id in ["a", "b", "c"] {
            object.container_statuses.push(ContainerStatus {
                name: id.to_string(),
                container_id: Some(format!("docker://{}", id)),
            });
        }
        registry.add_pod("default/web", &object).await.unwrap();
        registry
            .modify_pod("default/web", &object, runtime.as_ref(), None)
            .await
            .unwrap();
        // Stats for "c" are unavailable
        runtime.remove_container("c");

        let source = RuntimeUtilization::new(runtime, registry.clone());
        let total = source.node_cpu_percent().await.unwrap();
        assert!((total - 42.5).abs() < 1e-9);

        let snapshot = registry.snapshot().await;
        let percents: Vec<f64> = snapshot.containers().map(|(_, c)| c.cpu_percent).collect();
        assert_eq!(percents, vec![30.0, 12.5, 0.0]);
    }
}
