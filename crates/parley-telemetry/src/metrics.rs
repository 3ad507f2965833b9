use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory histogram. Keeps a bounded window of recent observations.
struct Histogram {
    observations: Mutex<Vec<f64>>,
}

const HISTOGRAM_WINDOW: usize = 4096;

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(Vec::new()),
        }
    }

    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.remove(0);
        }
        obs.push(value);
    }

    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = obs.len();
        let sum: f64 = obs.iter().sum();
        let at = |q: f64| obs[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time view of every recorded metric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: String,
    pub counters: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Process-wide metrics registry. Metric keys are `name` or `name{k=v,...}`.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, n: u64) {
        self.counter_handle(name).increment(n);
    }

    pub fn increment_labeled(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.increment(&metric_key(name, labels), n);
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.read().get(key).map_or(0, |c| c.get())
    }

    pub fn observe(&self, name: &str, value: f64) {
        self.histogram_handle(name).observe(value);
    }

    pub fn histogram(&self, name: &str) -> HistogramSummary {
        self.histograms
            .read()
            .get(name)
            .map(|h| h.summary())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(k, c)| (k.clone(), c.get()))
            .collect();
        let histograms = self
            .histograms
            .read()
            .iter()
            .map(|(k, h)| (k.clone(), h.summary()))
            .collect();
        MetricsSnapshot {
            taken_at: Utc::now().to_rfc3339(),
            counters,
            histograms,
        }
    }

    fn counter_handle(&self, key: &str) -> Arc<Counter> {
        if let Some(c) = self.counters.read().get(key) {
            return Arc::clone(c);
        }
        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Counter::new())),
        )
    }

    fn histogram_handle(&self, key: &str) -> Arc<Histogram> {
        if let Some(h) = self.histograms.read().get(key) {
            return Arc::clone(h);
        }
        let mut histograms = self.histograms.write();
        Arc::clone(
            histograms
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Histogram::new())),
        )
    }
}

/// Render a metric key with sorted labels, e.g. `checks{outcome=allowed}`.
pub fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}
