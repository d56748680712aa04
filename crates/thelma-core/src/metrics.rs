use std::collections::BTreeMap;
use tracing::info;

pub type Labels = BTreeMap<String, String>;

/// Label names the metrics backend reserves for itself.
const RESERVED_LABELS: &[&str] = &["job"];

/// Merge label maps left to right; later maps win. `None` entries are skipped.
pub fn merge_labels<'a>(maps: impl IntoIterator<Item = Option<&'a Labels>>) -> Labels {
    let mut out = Labels::new();
    for m in maps.into_iter().flatten() {
        out.extend(m.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

/// Rename reserved label keys by prefixing `_`; everything else passes through.
/// A label already named `_job` keeps its value over a renamed `job`.
pub fn normalize_labels(labels: Labels) -> Labels {
    let (reserved, mut out): (Labels, Labels) = labels
        .into_iter()
        .partition(|(k, _)| RESERVED_LABELS.contains(&k.as_str()));
    for (k, v) in reserved {
        out.entry(format!("_{k}")).or_insert(v);
    }
    out
}

// ---------------------------------------------------------------------------
// MetricsSink
// ---------------------------------------------------------------------------

pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, labels: &Labels, value: u64);
    fn gauge(&self, name: &str, labels: &Labels, value: f64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _labels: &Labels, _value: u64) {}
    fn gauge(&self, _name: &str, _labels: &Labels, _value: f64) {}
}

/// Emits each sample as an `info` event on the `metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMetrics;

impl MetricsSink for LoggingMetrics {
    fn counter(&self, name: &str, labels: &Labels, value: u64) {
        info!(target: "metrics", metric = name, ?labels, value, "counter");
    }

    fn gauge(&self, name: &str, labels: &Labels, value: f64) {
        info!(target: "metrics", metric = name, ?labels, value, "gauge");
    }
}
