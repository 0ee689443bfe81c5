//! Counters, gauges, and histograms behind a pluggable sink.
//!
//! Components record through the collector; an external sink (statsd,
//! OTLP, a test buffer) receives pushed values. `snapshot` feeds the
//! engine's introspection API with a nested map keyed by component.

use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Receives pushed metric updates.
pub trait MetricsSink: Send + Sync {
    /// Called on every counter increment.
    fn counter(&self, name: &str, delta: u64);
    /// Called on every gauge set.
    fn gauge(&self, name: &str, value: f64);
    /// Called on every histogram observation.
    fn histogram(&self, name: &str, value: f64);
}

/// Histogram summary: count, sum, min, max.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    /// Returns the mean observation, or zero before any.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// The in-process metrics collector.
///
/// Metric names are dotted, with the leading segment naming the component
/// (`engine.processes_started`, `scheduler.timer.fired`).
#[derive(Default)]
pub struct MetricsCollector {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    histograms: RwLock<HashMap<String, HistogramSummary>>,
    sink: RwLock<Option<Arc<dyn MetricsSink>>>,
}

impl MetricsCollector {
    /// Creates an empty collector with no sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a sink receiving pushed updates.
    pub fn set_sink(&self, sink: Arc<dyn MetricsSink>) {
        *self.sink.write().expect("metrics lock") = Some(sink);
    }

    /// Increments a counter.
    pub fn incr(&self, name: &str, delta: u64) {
        *self
            .counters
            .write()
            .expect("metrics lock")
            .entry(name.to_string())
            .or_insert(0) += delta;
        if let Some(sink) = self.sink.read().expect("metrics lock").as_ref() {
            sink.counter(name, delta);
        }
    }

    /// Sets a gauge.
    pub fn gauge(&self, name: &str, value: f64) {
        self.gauges
            .write()
            .expect("metrics lock")
            .insert(name.to_string(), value);
        if let Some(sink) = self.sink.read().expect("metrics lock").as_ref() {
            sink.gauge(name, value);
        }
    }

    /// Records a histogram observation.
    pub fn observe(&self, name: &str, value: f64) {
        self.histograms
            .write()
            .expect("metrics lock")
            .entry(name.to_string())
            .or_default()
            .observe(value);
        if let Some(sink) = self.sink.read().expect("metrics lock").as_ref() {
            sink.histogram(name, value);
        }
    }

    /// Reads one counter.
    #[must_use]
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .read()
            .expect("metrics lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Returns every metric, nested by the leading name segment.
    #[must_use]
    pub fn snapshot(&self) -> JsonValue {
        let mut root: JsonMap<String, JsonValue> = JsonMap::new();

        let mut insert = |name: &str, value: JsonValue| {
            let (component, rest) = name.split_once('.').unwrap_or(("engine", name));
            let entry = root
                .entry(component.to_string())
                .or_insert_with(|| JsonValue::Object(JsonMap::new()));
            if let JsonValue::Object(map) = entry {
                map.insert(rest.to_string(), value);
            }
        };

        for (name, value) in self.counters.read().expect("metrics lock").iter() {
            insert(name, json!(value));
        }
        for (name, value) in self.gauges.read().expect("metrics lock").iter() {
            insert(name, json!(value));
        }
        for (name, h) in self.histograms.read().expect("metrics lock").iter() {
            insert(
                name,
                json!({
                    "count": h.count,
                    "sum": h.sum,
                    "min": h.min,
                    "max": h.max,
                    "mean": h.mean(),
                }),
            );
        }

        JsonValue::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.incr("engine.processes_started", 1);
        metrics.incr("engine.processes_started", 2);
        assert_eq!(metrics.counter_value("engine.processes_started"), 3);
    }

    #[test]
    fn histogram_summary() {
        let metrics = MetricsCollector::new();
        metrics.observe("service.duration_ms", 10.0);
        metrics.observe("service.duration_ms", 30.0);

        let snapshot = metrics.snapshot();
        let entry = &snapshot["service"]["duration_ms"];
        assert_eq!(entry["count"], 2);
        assert_eq!(entry["min"], 10.0);
        assert_eq!(entry["max"], 30.0);
        assert_eq!(entry["mean"], 20.0);
    }

    #[test]
    fn snapshot_nests_by_component() {
        let metrics = MetricsCollector::new();
        metrics.incr("scheduler.timer.fired", 1);
        metrics.gauge("engine.running_processes", 4.0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["scheduler"]["timer.fired"], 1);
        assert_eq!(snapshot["engine"]["running_processes"], 4.0);
    }

    #[test]
    fn sink_receives_pushes() {
        #[derive(Default)]
        struct Buffer {
            events: Mutex<Vec<String>>,
        }

        impl MetricsSink for Buffer {
            fn counter(&self, name: &str, delta: u64) {
                self.events.lock().unwrap().push(format!("c:{name}:{delta}"));
            }
            fn gauge(&self, name: &str, value: f64) {
                self.events.lock().unwrap().push(format!("g:{name}:{value}"));
            }
            fn histogram(&self, name: &str, value: f64) {
                self.events.lock().unwrap().push(format!("h:{name}:{value}"));
            }
        }

        let metrics = MetricsCollector::new();
        let sink = Arc::new(Buffer::default());
        metrics.set_sink(sink.clone());

        metrics.incr("a.b", 1);
        metrics.gauge("a.c", 2.0);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.as_slice(), ["c:a.b:1", "g:a.c:2"]);
    }
}
