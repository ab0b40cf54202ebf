//! Metrics export functionality for simulation results.
//!
//! This module provides an in-memory metrics recorder that collects metrics
//! during simulation and can export them in JSON or Prometheus format.
//! Metrics carrying a `region` label are additionally broken down per region.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Metrics Snapshot Types
// ============================================================================

/// Per-region metric values.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RegionMetrics {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Collected metric data for export.
#[derive(Debug, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Timestamp when metrics were collected.
    pub timestamp: String,
    /// Counter metrics (name -> value), summed over all label sets.
    pub counters: BTreeMap<String, u64>,
    /// Gauge metrics (name -> last value).
    pub gauges: BTreeMap<String, f64>,
    /// Histogram metrics (name -> summary stats).
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Per-region breakdown of metrics.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub regions: BTreeMap<String, RegionMetrics>,
    /// Metric descriptions registered through `describe_*`.
    #[serde(skip)]
    pub descriptions: BTreeMap<String, String>,
}

/// Summary statistics for a histogram metric.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl HistogramSummary {
    fn empty() -> Self {
        HistogramSummary {
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            p50: 0.0,
            p90: 0.0,
            p99: 0.0,
        }
    }
}

// ============================================================================
// Export Functions
// ============================================================================

/// Export metrics as JSON.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

/// Export metrics in Prometheus text exposition format.
pub fn export_prometheus<W: Write>(
    snapshot: &MetricsSnapshot,
    writer: &mut W,
) -> std::io::Result<()> {
    writeln!(writer, "# cellsim metrics at {}", snapshot.timestamp)?;

    for (name, value) in &snapshot.counters {
        let prom_name = prometheus_name(name);
        write_header(writer, snapshot, name, &prom_name, "counter")?;
        writeln!(writer, "{} {}", prom_name, value)?;
        for (region, metrics) in &snapshot.regions {
            if let Some(value) = metrics.counters.get(name) {
                writeln!(writer, "{}{{region=\"{}\"}} {}", prom_name, region, value)?;
            }
        }
    }

    for (name, value) in &snapshot.gauges {
        let prom_name = prometheus_name(name);
        write_header(writer, snapshot, name, &prom_name, "gauge")?;
        writeln!(writer, "{} {}", prom_name, value)?;
        for (region, metrics) in &snapshot.regions {
            if let Some(value) = metrics.gauges.get(name) {
                writeln!(writer, "{}{{region=\"{}\"}} {}", prom_name, region, value)?;
            }
        }
    }

    // histograms are exported as summaries with quantiles
    for (name, summary) in &snapshot.histograms {
        let prom_name = prometheus_name(name);
        write_header(writer, snapshot, name, &prom_name, "summary")?;
        writeln!(writer, "{}_count {}", prom_name, summary.count)?;
        writeln!(writer, "{}_sum {}", prom_name, summary.sum)?;
        writeln!(writer, "{}{{quantile=\"0.5\"}} {}", prom_name, summary.p50)?;
        writeln!(writer, "{}{{quantile=\"0.9\"}} {}", prom_name, summary.p90)?;
        writeln!(writer, "{}{{quantile=\"0.99\"}} {}", prom_name, summary.p99)?;
        for (region, metrics) in &snapshot.regions {
            if let Some(summary) = metrics.histograms.get(name) {
                writeln!(writer, "{}_count{{region=\"{}\"}} {}", prom_name, region, summary.count)?;
                writeln!(writer, "{}_sum{{region=\"{}\"}} {}", prom_name, region, summary.sum)?;
            }
        }
    }

    Ok(())
}

fn prometheus_name(name: &str) -> String {
    name.replace('.', "_")
}

fn write_header<W: Write>(
    writer: &mut W,
    snapshot: &MetricsSnapshot,
    name: &str,
    prom_name: &str,
    kind: &str,
) -> std::io::Result<()> {
    if let Some(description) = snapshot.descriptions.get(name) {
        writeln!(writer, "# HELP {} {}", prom_name, description)?;
    }
    writeln!(writer, "# TYPE {} {}", prom_name, kind)
}

// ============================================================================
// In-Memory Recorder
// ============================================================================

/// Thread-safe storage for a single counter value.
#[derive(Debug, Default)]
struct CounterState {
    value: AtomicU64,
}

impl CounterState {
    fn increment(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe storage for a single gauge value.
/// Uses AtomicU64 to store f64 bits.
#[derive(Debug, Default)]
struct GaugeState {
    value: AtomicU64,
}

impl GaugeState {
    fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    fn increment(&self, value: f64) {
        loop {
            let current = self.value.load(Ordering::Relaxed);
            let new_value = f64::from_bits(current) + value;
            if self
                .value
                .compare_exchange_weak(current, new_value.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Maximum number of samples kept per histogram for percentiles.
const HISTOGRAM_RESERVOIR_SIZE: usize = 10_000;

#[derive(Debug)]
struct HistogramSamples {
    reservoir: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    /// xorshift state for reservoir replacement
    rng_state: u64,
}

/// Histogram storage using reservoir sampling (Algorithm R).
#[derive(Debug)]
struct HistogramState {
    samples: RwLock<HistogramSamples>,
}

impl Default for HistogramState {
    fn default() -> Self {
        HistogramState {
            samples: RwLock::new(HistogramSamples {
                reservoir: Vec::new(),
                count: 0,
                sum: 0.0,
                min: f64::MAX,
                max: f64::MIN,
                rng_state: 0x12345678_9ABCDEF0,
            }),
        }
    }
}

impl HistogramState {
    fn record(&self, value: f64) {
        let mut s = self.samples.write();
        s.count += 1;
        s.sum += value;
        s.min = s.min.min(value);
        s.max = s.max.max(value);
        if s.reservoir.len() < HISTOGRAM_RESERVOIR_SIZE {
            s.reservoir.push(value);
        } else {
            let mut x = s.rng_state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            s.rng_state = x;
            let j = (x % s.count) as usize;
            if j < HISTOGRAM_RESERVOIR_SIZE {
                s.reservoir[j] = value;
            }
        }
    }

    fn summary(&self) -> HistogramSummary {
        let s = self.samples.read();
        if s.count == 0 {
            return HistogramSummary::empty();
        }
        let mut summary = compute_histogram_summary(&s.reservoir);
        summary.count = s.count;
        summary.sum = s.sum;
        summary.min = s.min;
        summary.max = s.max;
        summary.mean = s.sum / s.count as f64;
        summary
    }

    fn samples(&self) -> Vec<f64> {
        self.samples.read().reservoir.clone()
    }
}

/// Compute histogram summary from a vector of samples.
fn compute_histogram_summary(samples: &[f64]) -> HistogramSummary {
    if samples.is_empty() {
        return HistogramSummary::empty();
    }

    let mut sorted: Vec<f64> = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = sorted.len() as u64;
    let sum: f64 = sorted.iter().sum();
    let percentile = |p: f64| -> f64 {
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };

    HistogramSummary {
        count,
        sum,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: sum / count as f64,
        p50: percentile(50.0),
        p90: percentile(90.0),
        p99: percentile(99.0),
    }
}

/// Name and labels of a registered key.
#[derive(Debug, Clone)]
struct KeyMetadata {
    name: String,
    labels: Vec<(String, String)>,
}

impl KeyMetadata {
    fn from_key(key: &Key) -> Self {
        KeyMetadata {
            name: key.name().to_string(),
            labels: key
                .labels()
                .map(|l| (l.key().to_string(), l.value().to_string()))
                .collect(),
        }
    }

    fn region(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == "region")
            .map(|(_, v)| v.as_str())
    }
}

/// Build a unique key string from a metrics Key (including labels).
fn key_to_string(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}|{}", key.name(), labels.join(","))
    }
}

/// Shared state for the in-memory recorder.
#[derive(Debug, Default)]
struct RecorderState {
    counters: RwLock<BTreeMap<String, Arc<CounterState>>>,
    gauges: RwLock<BTreeMap<String, Arc<GaugeState>>>,
    histograms: RwLock<BTreeMap<String, Arc<HistogramState>>>,
    key_metadata: RwLock<BTreeMap<String, KeyMetadata>>,
    descriptions: RwLock<BTreeMap<String, String>>,
}

impl RecorderState {
    fn get_or_create<T: Default>(
        &self,
        map: &RwLock<BTreeMap<String, Arc<T>>>,
        key: &Key,
    ) -> Arc<T> {
        let key_str = key_to_string(key);
        if let Some(existing) = map.read().get(&key_str) {
            return existing.clone();
        }
        self.key_metadata
            .write()
            .entry(key_str.clone())
            .or_insert_with(|| KeyMetadata::from_key(key));
        map.write()
            .entry(key_str)
            .or_insert_with(|| Arc::new(T::default()))
            .clone()
    }

    fn get_or_create_counter(&self, key: &Key) -> Arc<CounterState> {
        self.get_or_create(&self.counters, key)
    }

    fn get_or_create_gauge(&self, key: &Key) -> Arc<GaugeState> {
        self.get_or_create(&self.gauges, key)
    }

    fn get_or_create_histogram(&self, key: &Key) -> Arc<HistogramState> {
        self.get_or_create(&self.histograms, key)
    }

    fn describe(&self, key: KeyName, description: SharedString) {
        self.descriptions
            .write()
            .insert(key.as_str().to_string(), description.to_string());
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let metadata = self.key_metadata.read();

        let mut counters: BTreeMap<String, u64> = BTreeMap::new();
        let mut gauges: BTreeMap<String, f64> = BTreeMap::new();
        let mut histogram_samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut histogram_counts: BTreeMap<String, (u64, f64)> = BTreeMap::new();
        let mut regions: BTreeMap<String, RegionMetrics> = BTreeMap::new();

        for (key_str, counter) in self.counters.read().iter() {
            let Some(meta) = metadata.get(key_str) else { continue };
            let value = counter.get();
            *counters.entry(meta.name.clone()).or_insert(0) += value;
            if let Some(region) = meta.region() {
                *regions
                    .entry(region.to_string())
                    .or_default()
                    .counters
                    .entry(meta.name.clone())
                    .or_insert(0) += value;
            }
        }

        // gauges don't sum; the last label set wins for the aggregate
        for (key_str, gauge) in self.gauges.read().iter() {
            let Some(meta) = metadata.get(key_str) else { continue };
            let value = gauge.get();
            gauges.insert(meta.name.clone(), value);
            if let Some(region) = meta.region() {
                regions
                    .entry(region.to_string())
                    .or_default()
                    .gauges
                    .insert(meta.name.clone(), value);
            }
        }

        for (key_str, histogram) in self.histograms.read().iter() {
            let Some(meta) = metadata.get(key_str) else { continue };
            let summary = histogram.summary();
            histogram_samples
                .entry(meta.name.clone())
                .or_default()
                .extend(histogram.samples());
            let totals = histogram_counts.entry(meta.name.clone()).or_insert((0, 0.0));
            totals.0 += summary.count;
            totals.1 += summary.sum;
            if let Some(region) = meta.region() {
                let region_metrics = regions.entry(region.to_string()).or_default();
                match region_metrics.histograms.get_mut(&meta.name) {
                    Some(existing) => {
                        existing.count += summary.count;
                        existing.sum += summary.sum;
                    }
                    None => {
                        region_metrics.histograms.insert(meta.name.clone(), summary);
                    }
                }
            }
        }

        let histograms = histogram_samples
            .into_iter()
            .map(|(name, samples)| {
                let mut summary = compute_histogram_summary(&samples);
                if let Some(&(count, sum)) = histogram_counts.get(&name) {
                    summary.count = count;
                    summary.sum = sum;
                    summary.mean = if count > 0 { sum / count as f64 } else { 0.0 };
                }
                (name, summary)
            })
            .collect();

        MetricsSnapshot {
            timestamp,
            counters,
            gauges,
            histograms,
            regions,
            descriptions: self.descriptions.read().clone(),
        }
    }
}

/// In-memory metrics recorder that collects metrics for later export.
///
/// This recorder implements the `metrics::Recorder` trait and stores all
/// metrics in memory for snapshot export at the end of simulation.
#[derive(Debug, Clone)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    /// Create a new in-memory recorder.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RecorderState::default()),
        }
    }

    /// Take a snapshot of all current metric values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.snapshot()
    }
}

impl Default for InMemoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryCounter {
    state: Arc<CounterState>,
}

impl metrics::CounterFn for InMemoryCounter {
    fn increment(&self, value: u64) {
        self.state.increment(value);
    }

    fn absolute(&self, value: u64) {
        self.state.value.store(value, Ordering::Relaxed);
    }
}

struct InMemoryGauge {
    state: Arc<GaugeState>,
}

impl metrics::GaugeFn for InMemoryGauge {
    fn increment(&self, value: f64) {
        self.state.increment(value);
    }

    fn decrement(&self, value: f64) {
        self.state.increment(-value);
    }

    fn set(&self, value: f64) {
        self.state.set(value);
    }
}

struct InMemoryHistogram {
    state: Arc<HistogramState>,
}

impl metrics::HistogramFn for InMemoryHistogram {
    fn record(&self, value: f64) {
        self.state.record(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, description);
    }

    fn describe_gauge(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, description);
    }

    fn describe_histogram(&self, key: KeyName, _unit: Option<Unit>, description: SharedString) {
        self.state.describe(key, description);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let state = self.state.get_or_create_counter(key);
        Counter::from_arc(Arc::new(InMemoryCounter { state }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let state = self.state.get_or_create_gauge(key);
        Gauge::from_arc(Arc::new(InMemoryGauge { state }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let state = self.state.get_or_create_histogram(key);
        Histogram::from_arc(Arc::new(InMemoryHistogram { state }))
    }
}
