//! Per-vendor latency percentiles using HDR Histogram.
//!
//! Prometheus histograms only give bucket counts; these trackers keep exact
//! enough percentiles (3 significant digits) for the `/stats` document and
//! the end-of-run summary.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Tracks latencies from 1µs to 60 seconds.
const MAX_LATENCY_US: u64 = 60_000_000;
const SIGNIFICANT_DIGITS: u8 = 3;

/// Percentile statistics for one vendor, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentileStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PercentileStats {
    fn from_histogram(hist: &Histogram<u64>) -> Self {
        let ms = |us: u64| us as f64 / 1000.0;
        Self {
            count: hist.len(),
            min: ms(hist.min()),
            max: ms(hist.max()),
            mean: hist.mean() / 1000.0,
            p50: ms(hist.value_at_quantile(0.50)),
            p90: ms(hist.value_at_quantile(0.90)),
            p95: ms(hist.value_at_quantile(0.95)),
            p99: ms(hist.value_at_quantile(0.99)),
        }
    }

    /// Format statistics as a compact table row.
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<20} {:>8} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2}",
            label, self.count, self.p50, self.p90, self.p95, self.p99, self.mean, self.max,
        )
    }
}

/// Thread-safe latency tracker keyed by vendor name.
#[derive(Default)]
pub struct LatencyTracker {
    histograms: Mutex<HashMap<String, Histogram<u64>>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request latency for a vendor.
    pub fn record(&self, vendor: &str, latency: Duration) {
        let latency_us = u64::try_from(latency.as_micros()).unwrap_or(MAX_LATENCY_US);
        let clamped = latency_us.clamp(1, MAX_LATENCY_US);

        let mut histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        if !histograms.contains_key(vendor) {
            match Histogram::new_with_bounds(1, MAX_LATENCY_US, SIGNIFICANT_DIGITS) {
                Ok(hist) => {
                    histograms.insert(vendor.to_string(), hist);
                }
                Err(e) => {
                    warn!(vendor = vendor, error = %e, "Failed to create latency histogram");
                    return;
                }
            }
        }

        if let Some(hist) = histograms.get_mut(vendor) {
            if let Err(e) = hist.record(clamped) {
                warn!(
                    vendor = vendor,
                    latency_us = latency_us,
                    error = %e,
                    "Failed to record latency in histogram"
                );
            }
        }
    }

    /// Statistics for one vendor, `None` if nothing was recorded.
    pub fn stats(&self, vendor: &str) -> Option<PercentileStats> {
        let histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        histograms
            .get(vendor)
            .filter(|h| !h.is_empty())
            .map(PercentileStats::from_histogram)
    }

    /// Statistics for every vendor with samples, sorted by vendor name.
    pub fn all_stats(&self) -> BTreeMap<String, PercentileStats> {
        let histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
        histograms
            .iter()
            .filter(|(_, h)| !h.is_empty())
            .map(|(vendor, h)| (vendor.clone(), PercentileStats::from_histogram(h)))
            .collect()
    }
}

/// Format percentile statistics as a table.
pub fn format_percentile_table(stats: &BTreeMap<String, PercentileStats>) -> String {
    if stats.is_empty() {
        return "No latency data available.\n".to_string();
    }

    let mut output = String::new();
    output.push_str(&format!(
        "\n{:<20} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "Vendor", "Count", "P50", "P90", "P95", "P99", "Mean", "Max"
    ));
    output.push_str(&format!(
        "{:<20} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "", "", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)"
    ));
    output.push_str(&"-".repeat(86));
    output.push('\n');

    for (vendor, stat) in stats {
        output.push_str(&stat.format_table_row(vendor));
        output.push('\n');
    }

    output
}
