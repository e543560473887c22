use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;

/// Default bucket boundaries (seconds) used by [`RecordingMetrics`]'s
/// histograms, matching the buckets a typical Prometheus histogram
/// client ships with.
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

pub trait Counter: Send + Sync {
    fn increment(&self, by: u64);
}

pub trait Gauge: Send + Sync {
    fn set(&self, value: i64);
    fn add(&self, delta: i64);
}

pub trait Histogram: Send + Sync {
    fn observe(&self, value: f64);
}

/// A label set attached to a metric at creation time, e.g.
/// `[("node", "parser")]`. Kept as an owned vec rather than a map:
/// label sets here are small and built once per edge/node.
pub type Labels = Vec<(&'static str, String)>;

/// The abstract metrics collaborator the scheduler and edges report
/// through. No global instance exists; a sink is constructed by the
/// embedder and handed to the [`crate::metrics::MetricsSink`]-typed
/// fields it owns, consistent with there being no metrics exporter
/// shipped by this crate.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &'static str, labels: Labels) -> Arc<dyn Counter>;
    fn gauge(&self, name: &'static str, labels: Labels) -> Arc<dyn Gauge>;
    fn histogram(&self, name: &'static str, labels: Labels) -> Arc<dyn Histogram>;
}

/// Discards everything. The default sink when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

struct NoopHandle;
impl Counter for NoopHandle {
    fn increment(&self, _by: u64) {}
}
impl Gauge for NoopHandle {
    fn set(&self, _value: i64) {}
    fn add(&self, _delta: i64) {}
}
impl Histogram for NoopHandle {
    fn observe(&self, _value: f64) {}
}

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &'static str, _labels: Labels) -> Arc<dyn Counter> {
        Arc::new(NoopHandle)
    }
    fn gauge(&self, _name: &'static str, _labels: Labels) -> Arc<dyn Gauge> {
        Arc::new(NoopHandle)
    }
    fn histogram(&self, _name: &'static str, _labels: Labels) -> Arc<dyn Histogram> {
        Arc::new(NoopHandle)
    }
}

struct AtomicCounter(AtomicU64);
impl Counter for AtomicCounter {
    fn increment(&self, by: u64) {
        self.0.fetch_add(by, Ordering::Relaxed);
    }
}

struct AtomicGauge(std::sync::atomic::AtomicI64);
impl Gauge for AtomicGauge {
    fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }
    fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }
}

struct BucketedHistogram {
    bucket_counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram for BucketedHistogram {
    fn observe(&self, value: f64) {
        for (bound, counter) in DEFAULT_LATENCY_BUCKETS.iter().zip(self.bucket_counts.iter()) {
            if value <= *bound {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_bits.fetch_add(value.to_bits(), Ordering::Relaxed);
    }
}

fn metric_key(name: &'static str, labels: &Labels) -> String {
    let mut key = name.to_string();
    for (k, v) in labels {
        key.push('{');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
        key.push('}');
    }
    key
}

/// An in-process sink that actually records values, useful in tests
/// and for embedders who want numbers without standing up a real
/// exporter.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<AHashMap<String, Arc<AtomicCounter>>>,
    gauges: Mutex<AHashMap<String, Arc<AtomicGauge>>>,
    histograms: Mutex<AHashMap<String, Arc<BucketedHistogram>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &'static str, labels: Labels) -> u64 {
        let key = metric_key(name, &labels);
        self.counters
            .lock()
            .unwrap()
            .get(&key)
            .map(|c| c.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &'static str, labels: Labels) -> i64 {
        let key = metric_key(name, &labels);
        self.gauges
            .lock()
            .unwrap()
            .get(&key)
            .map(|g| g.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetrics {
    fn counter(&self, name: &'static str, labels: Labels) -> Arc<dyn Counter> {
        let key = metric_key(name, &labels);
        let mut map = self.counters.lock().unwrap();
        map.entry(key).or_insert_with(|| Arc::new(AtomicCounter(AtomicU64::new(0)))).clone()
    }

    fn gauge(&self, name: &'static str, labels: Labels) -> Arc<dyn Gauge> {
        let key = metric_key(name, &labels);
        let mut map = self.gauges.lock().unwrap();
        map.entry(key).or_insert_with(|| Arc::new(AtomicGauge(std::sync::atomic::AtomicI64::new(0)))).clone()
    }

    fn histogram(&self, name: &'static str, labels: Labels) -> Arc<dyn Histogram> {
        let key = metric_key(name, &labels);
        let mut map = self.histograms.lock().unwrap();
        map.entry(key)
            .or_insert_with(|| {
                Arc::new(BucketedHistogram {
                    bucket_counts: DEFAULT_LATENCY_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
                    sum_bits: AtomicU64::new(0),
                    count: AtomicU64::new(0),
                })
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_across_calls() {
        let sink = RecordingMetrics::new();
        let c = sink.counter("node_messages_total", vec![("node", "a".into())]);
        c.increment(1);
        c.increment(2);
        assert_eq!(sink.counter_value("node_messages_total", vec![("node", "a".into())]), 3);
    }

    #[test]
    fn labels_distinguish_metrics() {
        let sink = RecordingMetrics::new();
        sink.counter("x", vec![("node", "a".into())]).increment(1);
        sink.counter("x", vec![("node", "b".into())]).increment(5);
        assert_eq!(sink.counter_value("x", vec![("node", "a".into())]), 1);
        assert_eq!(sink.counter_value("x", vec![("node", "b".into())]), 5);
    }

    #[test]
    fn noop_sink_discards() {
        let sink = NoopMetrics;
        sink.counter("x", vec![]).increment(100);
        sink.gauge("y", vec![]).set(5);
    }
}
