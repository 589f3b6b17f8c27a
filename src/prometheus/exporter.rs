use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use ::prometheus::proto::{
    Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricFamily, MetricType,
};
use ::prometheus::{Encoder, TextEncoder};
use opentelemetry::KeyValue;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::Temporality;
use tracing::debug;

/// Content type of the Prometheus text exposition format.
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Label carrying the instrumentation scope, so same-named instruments from
/// different meters stay distinct series of one family.
pub const SCOPE_LABEL: &str = "otel_scope_name";

/// Latest rendering of the collected metrics, shared with the scrape handler.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    text: Arc<RwLock<String>>,
}

impl MetricsSnapshot {
    pub fn read(&self) -> String {
        self.text
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, text: String) {
        *self.text.write().unwrap_or_else(PoisonError::into_inner) = text;
    }
}

/// Renders every collection into Prometheus text and keeps the latest one.
#[derive(Debug, Default)]
pub struct PrometheusExporter {
    snapshot: MetricsSnapshot,
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.clone()
    }
}

impl PushMetricExporter for PrometheusExporter {
    async fn export(&self, metrics: &ResourceMetrics) -> OTelSdkResult {
        let text = encode(metrics).map_err(|e| OTelSdkError::InternalFailure(e.to_string()))?;
        self.snapshot.replace(text);
        Ok(())
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }

    fn temporality(&self) -> Temporality {
        Temporality::Cumulative
    }
}

/// Encode a collection in the Prometheus text exposition format.
pub fn encode(metrics: &ResourceMetrics) -> ::prometheus::Result<String> {
    let families = gather(metrics);
    let mut buf = Vec::with_capacity(8 * 1024);
    TextEncoder::new().encode(&families, &mut buf)?;
    String::from_utf8(buf).map_err(|e| ::prometheus::Error::Msg(e.to_string()))
}

/// Convert a collection into metric families, one per exposition name.
///
/// Instruments sharing a name across scopes land in the same family. An
/// instrument whose kind disagrees with the family already registered under
/// its name is dropped.
pub fn gather(metrics: &ResourceMetrics) -> Vec<MetricFamily> {
    let mut families: BTreeMap<String, (MetricType, MetricFamily)> = BTreeMap::new();

    for scope in metrics.scope_metrics() {
        let scope_name = scope.scope().name();
        for metric in scope.metrics() {
            let converted = match metric.data() {
                AggregatedMetrics::F64(data) => convert(data, scope_name),
                AggregatedMetrics::U64(data) => convert(data, scope_name),
                AggregatedMetrics::I64(data) => convert(data, scope_name),
            };
            let Some((kind, series)) = converted else {
                debug!(metric = metric.name(), "Skipping exponential histogram in Prometheus output");
                continue;
            };
            if series.is_empty() {
                continue;
            }

            let mut name = sanitize_name(metric.name());
            if kind == MetricType::COUNTER {
                name.push_str("_total");
            }
            let (family_kind, family) = families.entry(name.clone()).or_insert_with(|| {
                let mut family = MetricFamily::default();
                family.set_name(name.clone());
                family.set_help(metric.description().to_string());
                family.set_field_type(kind);
                (kind, family)
            });
            if *family_kind != kind {
                debug!(metric = %name, "Dropping instrument whose kind conflicts with its family");
                continue;
            }
            for sample in series {
                family.mut_metric().push(sample);
            }
        }
    }

    families.into_values().map(|(_, family)| family).collect()
}

trait SampleValue: Copy {
    fn to_f64(self) -> f64;
}

impl SampleValue for f64 {
    fn to_f64(self) -> f64 {
        self
    }
}

impl SampleValue for u64 {
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl SampleValue for i64 {
    fn to_f64(self) -> f64 {
        self as f64
    }
}

fn convert<T: SampleValue>(data: &MetricData<T>, scope: &str) -> Option<(MetricType, Vec<Metric>)> {
    let converted = match data {
        MetricData::Gauge(gauge) => (
            MetricType::GAUGE,
            gauge
                .data_points()
                .map(|p| gauge_metric(labels(p.attributes(), scope), p.value().to_f64()))
                .collect(),
        ),
        MetricData::Sum(sum) if sum.is_monotonic() => (
            MetricType::COUNTER,
            sum.data_points()
                .map(|p| {
                    let mut counter = Counter::default();
                    counter.set_value(p.value().to_f64());
                    let mut metric = Metric::default();
                    metric.set_label(labels(p.attributes(), scope).into());
                    metric.set_counter(counter);
                    metric
                })
                .collect(),
        ),
        // Up-down counters can go below zero, which only a gauge allows.
        MetricData::Sum(sum) => (
            MetricType::GAUGE,
            sum.data_points()
                .map(|p| gauge_metric(labels(p.attributes(), scope), p.value().to_f64()))
                .collect(),
        ),
        MetricData::Histogram(histogram) => (
            MetricType::HISTOGRAM,
            histogram
                .data_points()
                .map(|p| {
                    let mut proto = Histogram::default();
                    proto.set_sample_count(p.count());
                    proto.set_sample_sum(p.sum().to_f64());
                    let mut cumulative = 0u64;
                    for (bound, count) in p.bounds().zip(p.bucket_counts()) {
                        cumulative += count;
                        let mut bucket = Bucket::default();
                        bucket.set_upper_bound(bound);
                        bucket.set_cumulative_count(cumulative);
                        proto.mut_bucket().push(bucket);
                    }
                    let mut metric = Metric::default();
                    metric.set_label(labels(p.attributes(), scope).into());
                    metric.set_histogram(proto);
                    metric
                })
                .collect(),
        ),
        MetricData::ExponentialHistogram(_) => return None,
    };
    Some(converted)
}

fn gauge_metric(labels: Vec<LabelPair>, value: f64) -> Metric {
    let mut gauge = Gauge::default();
    gauge.set_value(value);
    let mut metric = Metric::default();
    metric.set_label(labels.into());
    metric.set_gauge(gauge);
    metric
}

fn labels<'a>(attributes: impl Iterator<Item = &'a KeyValue>, scope: &str) -> Vec<LabelPair> {
    let mut pairs: Vec<LabelPair> = attributes
        .map(|kv| label(sanitize_name(kv.key.as_str()), kv.value.as_str().into_owned()))
        .collect();
    pairs.push(label(SCOPE_LABEL.to_string(), scope.to_string()));
    pairs
}

fn label(name: String, value: String) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name);
    pair.set_value(value);
    pair
}

/// Replace characters Prometheus does not allow in metric and label names.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}
