//! Per-cycle metrics sink
//!
//! Control loops describe each cycle as a [`CycleRecord`]. Writing a record
//! never fails from the caller's point of view: sinks log and drop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Measurement every record is written under
pub const MEASUREMENT: &str = "data";

/// One control-loop cycle
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub timestamp: DateTime<Utc>,
    pub controller: String,
    pub fields: Map<String, Value>,
}

impl CycleRecord {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            controller: controller.into(),
            fields: Map::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write(&self, hostname: &str, record: &CycleRecord);
}

/// Drops every record
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    async fn write(&self, _hostname: &str, _record: &CycleRecord) {}
}

/// Writes records to InfluxDB over the HTTP line protocol
pub struct InfluxSink {
    client: Client,
    write_url: Url,
}

impl InfluxSink {
    pub fn new(base_url: &str, database: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        let mut write_url = Url::parse(base_url)?.join("/write")?;
        write_url
            .query_pairs_mut()
            .append_pair("db", database)
            .append_pair("precision", "ns");
        Ok(Self { client, write_url })
    }
}

#[async_trait]
impl MetricsSink for InfluxSink {
    async fn write(&self, hostname: &str, record: &CycleRecord) {
        let Some(line) = to_line_protocol(hostname, record) else {
            debug!(controller = %record.controller, "Record has no writable fields");
            return;
        };

        let result = self
            .client
            .post(self.write_url.clone())
            .body(line)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                subsystem = "sink",
                controller = %record.controller,
                status = response.status().as_u16(),
                "Metrics write rejected"
            ),
            Err(e) => warn!(
                subsystem = "sink",
                controller = %record.controller,
                error = %e,
                "Metrics write failed"
            ),
        }
    }
}

/// Render a record as one line-protocol line.
///
/// Null and non-finite values are dropped; `None` when nothing is left.
pub fn to_line_protocol(hostname: &str, record: &CycleRecord) -> Option<String> {
    let fields: Vec<String> = record
        .fields
        .iter()
        .filter_map(|(key, value)| {
            field_value(value).map(|v| format!("{}={}", escape_key(key), v))
        })
        .collect();
    if fields.is_empty() {
        return None;
    }

    let timestamp = record
        .timestamp
        .timestamp_nanos_opt()
        .unwrap_or_else(|| record.timestamp.timestamp() * 1_000_000_000);

    Some(format!(
        "{},hostname={},controller={} {} {}",
        MEASUREMENT,
        escape_key(hostname),
        escape_key(&record.controller),
        fields.join(","),
        timestamp
    ))
}

fn field_value(value: &Value) -> Option<String> {
    match value {
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(format!("{}i", i))
            } else if let Some(u) = n.as_u64() {
                Some(format!("{}u", u))
            } else {
                n.as_f64().filter(|f| f.is_finite()).map(|f| f.to_string())
            }
        }
        Value::String(s) => Some(format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn escape_key(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
