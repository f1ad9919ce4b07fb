//! Metrics for the document sequencer
//!
//! In-process counters and latency histograms, exported as JSON or in the
//! Prometheus text format.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Metrics registry shared by the allocator and the HTTP layer
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter
    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    /// Add to a counter
    pub async fn add_counter(&self, name: &str, value: u64) {
        let counters = self.counters.read().await;
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        drop(counters);

        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Get a counter value
    pub async fn get_counter(&self, name: &str) -> u64 {
        let counters = self.counters.read().await;
        counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation
    pub async fn observe_histogram(&self, name: &str, value: f64) {
        let histograms = self.histograms.read().await;
        if let Some(histogram) = histograms.get(name) {
            histogram.observe(value);
            return;
        }
        drop(histograms);

        let mut histograms = self.histograms.write().await;
        let histogram = histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()));
        histogram.observe(value);
    }

    /// Number of observations recorded in a histogram
    pub async fn histogram_count(&self, name: &str) -> u64 {
        let histograms = self.histograms.read().await;
        histograms.get(name).map(|h| h.count()).unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get all metrics as JSON
    pub async fn to_json(&self) -> serde_json::Value {
        let counters = self.counters.read().await;
        let histograms = self.histograms.read().await;

        let counter_values: HashMap<String, u64> = counters
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let histogram_values: HashMap<String, serde_json::Value> = histograms
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counter_values,
            "histograms": histogram_values,
        })
    }

    /// Export metrics in Prometheus format
    pub async fn to_prometheus(&self) -> String {
        let counters = self.counters.read().await;
        let histograms = self.histograms.read().await;

        let mut output = String::new();

        output.push_str("# HELP docseq_uptime_seconds Time since service start\n");
        output.push_str("# TYPE docseq_uptime_seconds gauge\n");
        output.push_str(&format!("docseq_uptime_seconds {}\n\n", self.uptime_seconds()));

        let mut names: Vec<_> = counters.keys().collect();
        names.sort();
        for name in names {
            let prometheus_name = prometheus_name(name);
            output.push_str(&format!("# TYPE {} counter\n", prometheus_name));
            output.push_str(&format!(
                "{} {}\n",
                prometheus_name,
                counters[name].load(Ordering::Relaxed)
            ));
        }

        for (name, histogram) in histograms.iter() {
            output.push_str(&histogram.to_prometheus(name));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fixed-bucket histogram
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// Sum of observations in thousandths
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let scaled = (value.max(0.0) * 1000.0) as u64;
        self.sum.fetch_add(scaled, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(i) = self.buckets.iter().position(|bucket| value <= *bucket) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let bucket_counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": bucket_counts,
            "sum": self.sum.load(Ordering::Relaxed) as f64 / 1000.0,
            "count": self.count(),
        })
    }

    pub fn to_prometheus(&self, name: &str) -> String {
        let prometheus_name = prometheus_name(name);
        let mut output = format!("# TYPE {} histogram\n", prometheus_name);

        let mut cumulative = 0u64;
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                prometheus_name, bucket, cumulative
            ));
        }

        output.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            prometheus_name,
            self.count()
        ));
        output.push_str(&format!(
            "{}_sum {}\n",
            prometheus_name,
            self.sum.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        output.push_str(&format!("{}_count {}\n", prometheus_name, self.count()));

        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Allocation latency in milliseconds
        Self::new(vec![
            0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
        ])
    }
}

/// Predefined metric names
pub mod metric_names {
    pub const ALLOCATIONS: &str = "docseq.allocations.total";
    pub const ALLOCATION_LOCK_TIMEOUTS: &str = "docseq.allocations.lock_timeouts";
    pub const ALLOCATION_NOT_FOUND: &str = "docseq.allocations.not_found";
    pub const ALLOCATION_FAILURES: &str = "docseq.allocations.failures";
    pub const YEAR_ROLLOVERS: &str = "docseq.allocations.year_rollovers";
    pub const ALLOCATION_LATENCY_MS: &str = "docseq.allocations.latency_ms";

    pub const DEFINITIONS_CREATED: &str = "docseq.definitions.created";
    pub const DEFINITIONS_UPDATED: &str = "docseq.definitions.updated";
    pub const DEFINITIONS_DELETED: &str = "docseq.definitions.deleted";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter() {
        let registry = MetricsRegistry::new();

        registry.inc_counter("test.counter").await;
        registry.inc_counter("test.counter").await;
        registry.add_counter("test.counter", 5).await;

        assert_eq!(registry.get_counter("test.counter").await, 7);
        assert_eq!(registry.get_counter("missing").await, 0);
    }

    #[tokio::test]
    async fn test_histogram_buckets() {
        let registry = MetricsRegistry::new();

        registry.observe_histogram("lat", 0.2).await;
        registry.observe_histogram("lat", 7.0).await;
        registry.observe_histogram("lat", 99999.0).await;

        assert_eq!(registry.histogram_count("lat").await, 3);

        let json = registry.to_json().await;
        let counts = json["histograms"]["lat"]["counts"].as_array().unwrap();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[4], 1);
    }

    #[tokio::test]
    async fn test_prometheus_export() {
        let registry = MetricsRegistry::new();
        registry.inc_counter(metric_names::ALLOCATIONS).await;
        registry
            .observe_histogram(metric_names::ALLOCATION_LATENCY_MS, 3.0)
            .await;

        let output = registry.to_prometheus().await;
        assert!(output.contains("docseq_allocations_total 1"));
        assert!(output.contains("docseq_allocations_latency_ms_bucket{le=\"5\"} 1"));
        assert!(output.contains("docseq_allocations_latency_ms_count 1"));
    }
}
