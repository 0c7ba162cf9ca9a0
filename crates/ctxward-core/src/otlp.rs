//! OTLP/JSON decoding (§4.1, §6 wire protocol).
//!
//! Pure decode logic, kept transport-free so it is unit-testable without
//! spinning up an HTTP server; `ctxward-web` only owns the axum handler
//! that reads the request body and calls into here.

use crate::models::{HistogramData, MetricPoint, MetricValue};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct ExportMetricsServiceRequest {
    #[serde(default, rename = "resourceMetrics")]
    pub resource_metrics: Vec<ResourceMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceMetrics {
    #[serde(default)]
    pub resource: Option<Resource>,
    #[serde(default, rename = "scopeMetrics")]
    pub scope_metrics: Vec<ScopeMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
pub struct ScopeMetrics {
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub sum: Option<NumberDataPoints>,
    #[serde(default)]
    pub gauge: Option<NumberDataPoints>,
    #[serde(default)]
    pub histogram: Option<HistogramDataPoints>,
}

#[derive(Debug, Deserialize)]
pub struct NumberDataPoints {
    #[serde(default, rename = "dataPoints")]
    pub data_points: Vec<NumberDataPoint>,
    #[serde(default, rename = "aggregationTemporality")]
    pub aggregation_temporality: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct NumberDataPoint {
    #[serde(default, rename = "asInt")]
    pub as_int: Option<AnyInt>,
    #[serde(default, rename = "asDouble")]
    pub as_double: Option<f64>,
    #[serde(default, rename = "timeUnixNano")]
    pub time_unix_nano: Option<AnyInt>,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
pub struct HistogramDataPoints {
    #[serde(default, rename = "dataPoints")]
    pub data_points: Vec<HistogramDataPoint>,
}

#[derive(Debug, Deserialize)]
pub struct HistogramDataPoint {
    #[serde(default)]
    pub count: Option<AnyInt>,
    #[serde(default)]
    pub sum: Option<f64>,
    #[serde(default, rename = "bucketCounts")]
    pub bucket_counts: Vec<AnyInt>,
    #[serde(default, rename = "explicitBounds")]
    pub explicit_bounds: Vec<f64>,
    #[serde(default, rename = "timeUnixNano")]
    pub time_unix_nano: Option<AnyInt>,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

/// OTLP encodes 64-bit integers as JSON strings or numbers depending on the
/// exporter; accept both so the receiver never rejects well-formed bodies
/// over an encoding quirk.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AnyInt {
    Number(i64),
    String(String),
}

impl AnyInt {
    pub fn value(&self) -> Option<i64> {
        match self {
            AnyInt::Number(n) => Some(*n),
            AnyInt::String(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: Option<AnyValue>,
}

#[derive(Debug, Deserialize)]
pub struct AnyValue {
    #[serde(default, rename = "stringValue")]
    pub string_value: Option<String>,
    #[serde(default, rename = "intValue")]
    pub int_value: Option<AnyInt>,
    #[serde(default, rename = "doubleValue")]
    pub double_value: Option<f64>,
    #[serde(default, rename = "boolValue")]
    pub bool_value: Option<bool>,
}

impl AnyValue {
    pub fn to_display_string(&self) -> String {
        if let Some(s) = &self.string_value {
            s.clone()
        } else if let Some(i) = &self.int_value {
            i.value().map(|v| v.to_string()).unwrap_or_default()
        } else if let Some(d) = self.double_value {
            d.to_string()
        } else if let Some(b) = self.bool_value {
            b.to_string()
        } else {
            String::new()
        }
    }
}

fn attrs_to_map(attrs: &[KeyValue]) -> HashMap<String, String> {
    attrs
        .iter()
        .map(|kv| {
            (
                kv.key.clone(),
                kv.value.as_ref().map(AnyValue::to_display_string).unwrap_or_default(),
            )
        })
        .collect()
}

/// Resource attributes of interest (§6), pulled out once per `resourceMetrics[]`.
#[derive(Debug, Clone, Default)]
pub struct ResourceIdentity {
    pub service_name: Option<String>,
    pub service_instance_id: Option<String>,
    pub claude_session_id: Option<String>,
    pub project_name: Option<String>,
    pub project_path: Option<String>,
    pub model_name: Option<String>,
}

impl ResourceIdentity {
    fn from_attrs(attrs: &HashMap<String, String>) -> Self {
        Self {
            service_name: attrs.get("service.name").cloned(),
            service_instance_id: attrs.get("service.instance.id").cloned(),
            claude_session_id: attrs.get("claude.session.id").cloned(),
            project_name: attrs.get("project.name").cloned(),
            project_path: attrs.get("project.path").cloned(),
            model_name: attrs.get("model.name").cloned(),
        }
    }
}

/// One decoded resource's worth of points, ready for session assignment.
pub struct DecodedBatch {
    pub identity: ResourceIdentity,
    pub points: Vec<MetricPoint>,
    /// Unknown metric shapes encountered and dropped (§4.1).
    pub unknown_shapes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum OtlpDecodeError {
    #[error("invalid OTLP JSON: {0}")]
    InvalidJson(String),
}

/// Decode a raw OTLP/JSON body into per-resource batches of `MetricPoint`s.
pub fn decode_otlp_json(body: &[u8]) -> Result<Vec<DecodedBatch>, OtlpDecodeError> {
    let req: ExportMetricsServiceRequest =
        serde_json::from_slice(body).map_err(|e| OtlpDecodeError::InvalidJson(e.to_string()))?;

    let mut batches = Vec::with_capacity(req.resource_metrics.len());
    for rm in req.resource_metrics {
        let resource_attrs = rm
            .resource
            .as_ref()
            .map(|r| attrs_to_map(&r.attributes))
            .unwrap_or_default();
        let identity = ResourceIdentity::from_attrs(&resource_attrs);

        let mut points = Vec::new();
        let mut unknown_shapes = 0u64;

        for sm in rm.scope_metrics {
            for metric in sm.metrics {
                if let Some(sum) = &metric.sum {
                    decode_number_points(&metric.name, sum, &resource_attrs, &mut points);
                } else if let Some(gauge) = &metric.gauge {
                    decode_number_points(&metric.name, gauge, &resource_attrs, &mut points);
                } else if let Some(hist) = &metric.histogram {
                    decode_histogram_points(&metric.name, hist, &resource_attrs, &mut points);
                } else {
                    unknown_shapes += 1;
                }
            }
        }

        batches.push(DecodedBatch {
            identity,
            points,
            unknown_shapes,
        });
    }

    Ok(batches)
}

fn merge_attrs(
    resource_attrs: &HashMap<String, String>,
    point_attrs: &[KeyValue],
) -> HashMap<String, String> {
    let mut merged = resource_attrs.clone();
    merged.extend(attrs_to_map(point_attrs));
    merged
}

/// OTLP `AggregationTemporality` enum value for delta-accumulated sums.
const AGGREGATION_TEMPORALITY_DELTA: i32 = 1;

fn decode_number_points(
    name: &str,
    points: &NumberDataPoints,
    resource_attrs: &HashMap<String, String>,
    out: &mut Vec<MetricPoint>,
) {
    let is_delta = points.aggregation_temporality == Some(AGGREGATION_TEMPORALITY_DELTA);
    for dp in &points.data_points {
        let value = if let Some(i) = &dp.as_int {
            i.value().map(MetricValue::Int)
        } else {
            dp.as_double.map(MetricValue::Float)
        };
        let Some(value) = value else { continue };
        let timestamp_ns = dp
            .time_unix_nano
            .as_ref()
            .and_then(AnyInt::value)
            .unwrap_or(0);
        out.push(MetricPoint {
            name: name.to_string(),
            value,
            timestamp_ns,
            attributes: merge_attrs(resource_attrs, &dp.attributes),
            is_delta,
        });
    }
}

fn decode_histogram_points(
    name: &str,
    points: &HistogramDataPoints,
    resource_attrs: &HashMap<String, String>,
    out: &mut Vec<MetricPoint>,
) {
    for dp in &points.data_points {
        let count = dp.count.as_ref().and_then(AnyInt::value).unwrap_or(0) as u64;
        let sum = dp.sum.unwrap_or(0.0);
        // §4.1: prefer asInt/asDouble, else bucket midpoint for histograms.
        let value = if count > 0 {
            sum / count as f64
        } else {
            bucket_midpoint(&dp.bucket_counts, &dp.explicit_bounds)
        };
        let timestamp_ns = dp
            .time_unix_nano
            .as_ref()
            .and_then(AnyInt::value)
            .unwrap_or(0);
        let mut point = MetricPoint {
            name: name.to_string(),
            value: MetricValue::Float(value),
            timestamp_ns,
            attributes: merge_attrs(resource_attrs, &dp.attributes),
            is_delta: false,
        };
        point.attributes.insert(
            "__histogram__".to_string(),
            serde_json::to_string(&HistogramData {
                count,
                sum,
                bucket_counts: dp.bucket_counts.iter().filter_map(AnyInt::value).map(|v| v as u64).collect(),
                explicit_bounds: dp.explicit_bounds.clone(),
            })
            .unwrap_or_default(),
        );
        out.push(point);
    }
}

fn bucket_midpoint(bucket_counts: &[AnyInt], explicit_bounds: &[f64]) -> f64 {
    let counts: Vec<i64> = bucket_counts.iter().filter_map(AnyInt::value).collect();
    let Some((idx, _)) = counts.iter().enumerate().max_by_key(|(_, c)| **c) else {
        return 0.0;
    };
    let lower = if idx == 0 {
        0.0
    } else {
        explicit_bounds.get(idx - 1).copied().unwrap_or(0.0)
    };
    let upper = explicit_bounds.get(idx).copied().unwrap_or(lower * 2.0 + 1.0);
    (lower + upper) / 2.0
}
