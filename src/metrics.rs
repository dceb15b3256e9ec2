//! Metrics aggregation over a Prometheus registry.
//!
//! One [`Metrics`] instance is built at process start and shared by every
//! scheduler and in-flight request. Per-request updates are single-series
//! atomic increments; the per-vendor error rate is derived separately on a
//! timer by [`Metrics::refresh_derived`].

use prometheus::core::Collector;
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use tracing::debug;

use crate::executor::RequestOutcome;
use crate::latency::{LatencyTracker, PercentileStats};
use crate::system::SystemSample;
use crate::utils::destination_host;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "load_generator".to_string());
}

/// Buckets of the request duration histogram, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 60.0];

/// `status_code` label used for requests that never produced a status.
pub const ERROR_STATUS_LABEL: &str = "error";

/// Whether a `status_code` label value counts as an error for the error rate.
pub fn is_error_status(label: &str) -> bool {
    match label.parse::<u16>() {
        Ok(code) => !(200..400).contains(&code),
        Err(_) => true,
    }
}

/// Process-wide metric families.
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    bytes_sent_total: IntCounterVec,
    bytes_received_total: IntCounterVec,
    active_connections: IntGaugeVec,
    error_rate: GaugeVec,
    pool_health: IntGaugeVec,
    errors_by_category: IntCounterVec,
    dispatch_skipped_total: IntCounterVec,
    cpu_usage_percent: Gauge,
    memory_usage_bytes: Gauge,
    latency: LatencyTracker,
    known_vendors: Vec<String>,
}

impl Metrics {
    /// Builds and registers every metric family under the given namespace.
    ///
    /// `known_vendors` always appear in snapshots and error-rate refreshes,
    /// even before their first request.
    pub fn new(namespace: &str, known_vendors: Vec<String>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total HTTP requests made by load generator")
                .namespace(namespace),
            &["vendor", "method", "status_code", "destination_host"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "HTTP request duration in seconds")
                .namespace(namespace)
                .buckets(DURATION_BUCKETS.to_vec()),
            &["vendor", "method", "destination_host"],
        )?;

        let bytes_sent_total = IntCounterVec::new(
            Opts::new("bytes_sent_total", "Total bytes sent in HTTP requests").namespace(namespace),
            &["vendor", "destination_host"],
        )?;

        let bytes_received_total = IntCounterVec::new(
            Opts::new("bytes_received_total", "Total bytes received in HTTP responses")
                .namespace(namespace),
            &["vendor", "destination_host"],
        )?;

        let active_connections = IntGaugeVec::new(
            Opts::new("active_connections", "Number of active connections").namespace(namespace),
            &["vendor"],
        )?;

        let error_rate = GaugeVec::new(
            Opts::new("error_rate", "Current error rate by vendor").namespace(namespace),
            &["vendor"],
        )?;

        // Kept unprefixed so existing dashboards keep matching.
        let pool_health = IntGaugeVec::new(
            Opts::new(
                "proxy_pool_health",
                "Health status of proxy pool (1=healthy, 0=unhealthy)",
            ),
            &["vendor", "pool"],
        )?;

        let errors_by_category = IntCounterVec::new(
            Opts::new(
                "requests_errors_by_category_total",
                "Failed requests by error category",
            )
            .namespace(namespace),
            &["vendor", "category"],
        )?;

        let dispatch_skipped_total = IntCounterVec::new(
            Opts::new(
                "dispatch_skipped_total",
                "Dispatch ticks skipped because the in-flight cap was reached",
            )
            .namespace(namespace),
            &["pattern"],
        )?;

        let cpu_usage_percent = Gauge::with_opts(
            Opts::new("cpu_usage_percent", "CPU usage percentage").namespace(namespace),
        )?;

        let memory_usage_bytes = Gauge::with_opts(
            Opts::new("memory_usage_bytes", "Memory usage in bytes").namespace(namespace),
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(error_rate.clone()))?;
        registry.register(Box::new(pool_health.clone()))?;
        registry.register(Box::new(errors_by_category.clone()))?;
        registry.register(Box::new(dispatch_skipped_total.clone()))?;
        registry.register(Box::new(cpu_usage_percent.clone()))?;
        registry.register(Box::new(memory_usage_bytes.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            bytes_sent_total,
            bytes_received_total,
            active_connections,
            error_rate,
            pool_health,
            errors_by_category,
            dispatch_skipped_total,
            cpu_usage_percent,
            memory_usage_bytes,
            latency: LatencyTracker::new(),
            known_vendors,
        })
    }

    /// Builds metrics under the namespace from `METRIC_NAMESPACE`.
    pub fn with_default_namespace(known_vendors: Vec<String>) -> Result<Self, prometheus::Error> {
        Self::new(METRIC_NAMESPACE.as_str(), known_vendors)
    }

    /// Marks one request as in flight for `vendor` until the guard drops.
    pub fn track_connection(&self, vendor: &str) -> ActiveConnectionGuard {
        let gauge = self.active_connections.with_label_values(&[vendor]);
        gauge.inc();
        ActiveConnectionGuard { gauge }
    }

    /// Folds one completed request into the aggregates.
    pub fn record(&self, outcome: &RequestOutcome) {
        let host = destination_host(&outcome.destination);
        let method = outcome.method.as_str();
        let status = outcome.status_label();

        self.requests_total
            .with_label_values(&[&outcome.vendor, method, &status, host])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[&outcome.vendor, method, host])
            .observe(outcome.elapsed.as_secs_f64());

        // Byte counters only move for calls that produced a status line.
        if outcome.status_code().is_some() {
            if outcome.bytes_sent > 0 {
                self.bytes_sent_total
                    .with_label_values(&[&outcome.vendor, host])
                    .inc_by(outcome.bytes_sent);
            }
            self.bytes_received_total
                .with_label_values(&[&outcome.vendor, host])
                .inc_by(outcome.bytes_received);
        }

        self.pool_health
            .with_label_values(&[&outcome.vendor, &outcome.pool])
            .set(i64::from(outcome.is_success()));

        if let Some(category) = outcome.error_category() {
            self.errors_by_category
                .with_label_values(&[&outcome.vendor, category.label()])
                .inc();
        }

        self.latency.record(&outcome.vendor, outcome.elapsed);
    }

    /// Counts a dispatch tick dropped by the in-flight cap.
    pub fn record_dispatch_skipped(&self, pattern: &str) {
        self.dispatch_skipped_total.with_label_values(&[pattern]).inc();
    }

    pub fn set_system(&self, sample: &SystemSample) {
        self.cpu_usage_percent.set(sample.cpu_usage_percent);
        self.memory_usage_bytes.set(sample.memory_used_bytes as f64);
    }

    /// Recomputes `error_rate{vendor}` by re-scanning every recorded
    /// `requests_total` series. Vendors with no requests get 0.
    pub fn refresh_derived(&self) -> BTreeMap<String, f64> {
        let mut totals: HashMap<String, (u64, u64)> = HashMap::new();

        for family in self.requests_total.collect() {
            for metric in family.get_metric() {
                let mut vendor = None;
                let mut status = None;
                for pair in metric.get_label() {
                    match pair.get_name() {
                        "vendor" => vendor = Some(pair.get_value()),
                        "status_code" => status = Some(pair.get_value()),
                        _ => {}
                    }
                }
                let (Some(vendor), Some(status)) = (vendor, status) else {
                    continue;
                };

                let count = metric.get_counter().get_value() as u64;
                let entry = totals.entry(vendor.to_string()).or_insert((0, 0));
                entry.0 += count;
                if is_error_status(status) {
                    entry.1 += count;
                }
            }
        }

        let vendors: BTreeSet<String> = self
            .known_vendors
            .iter()
            .cloned()
            .chain(totals.keys().cloned())
            .collect();

        let mut rates = BTreeMap::new();
        for vendor in vendors {
            let (total, errors) = totals.get(&vendor).copied().unwrap_or((0, 0));
            let rate = if total > 0 {
                errors as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            self.error_rate.with_label_values(&[&vendor]).set(rate);
            rates.insert(vendor, rate);
        }

        debug!(vendors = rates.len(), "Refreshed derived error rates");
        rates
    }

    /// Drops every active-connection series. Guards still alive hold the
    /// removed children, so their later decrements never reach an exported
    /// series and the next request starts a fresh one at zero.
    pub fn reset_active_connections(&self) {
        self.active_connections.reset();
    }

    /// Current value of `requests_total` for one label set, without creating it.
    pub fn request_count(&self, vendor: &str, method: &str, status: &str, destination: &str) -> u64 {
        let host = destination_host(destination);
        self.requests_total
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                labels_match(
                    metric,
                    &[
                        ("vendor", vendor),
                        ("method", method),
                        ("status_code", status),
                        ("destination_host", host),
                    ],
                )
            })
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    /// Last observed pool health, `None` if the pool never served a request.
    pub fn pool_health(&self, vendor: &str, pool: &str) -> Option<i64> {
        self.pool_health
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| labels_match(metric, &[("vendor", vendor), ("pool", pool)]))
            .map(|metric| metric.get_gauge().get_value() as i64)
    }

    pub fn active_connections(&self, vendor: &str) -> i64 {
        self.gauge_values(&self.active_connections, "vendor")
            .get(vendor)
            .map(|v| *v as i64)
            .unwrap_or(0)
    }

    pub fn error_rate(&self, vendor: &str) -> f64 {
        self.gauge_values(&self.error_rate, "vendor")
            .get(vendor)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn latency_stats(&self) -> BTreeMap<String, PercentileStats> {
        self.latency.all_stats()
    }

    /// Point-in-time read of the per-vendor and per-pool gauges.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let active = self.gauge_values(&self.active_connections, "vendor");
        let rates = self.gauge_values(&self.error_rate, "vendor");
        let latency = self.latency.all_stats();

        let mut requests: HashMap<String, (u64, u64)> = HashMap::new();
        for family in self.requests_total.collect() {
            for metric in family.get_metric() {
                let vendor = label_value(metric, "vendor").unwrap_or_default();
                let status = label_value(metric, "status_code").unwrap_or_default();
                let count = metric.get_counter().get_value() as u64;
                let entry = requests.entry(vendor.to_string()).or_insert((0, 0));
                entry.0 += count;
                if is_error_status(status) {
                    entry.1 += count;
                }
            }
        }

        let vendor_names: BTreeSet<String> = self
            .known_vendors
            .iter()
            .cloned()
            .chain(active.keys().cloned())
            .chain(requests.keys().cloned())
            .collect();

        let vendors = vendor_names
            .into_iter()
            .map(|name| {
                let (requests_total, errors_total) =
                    requests.get(&name).copied().unwrap_or((0, 0));
                let snapshot = VendorSnapshot {
                    active_connections: active.get(&name).map(|v| *v as i64).unwrap_or(0),
                    error_rate: rates.get(&name).copied().unwrap_or(0.0),
                    requests_total,
                    errors_total,
                    latency_ms: latency.get(&name).cloned(),
                };
                (name, snapshot)
            })
            .collect();

        let mut pool_health: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
        for family in self.pool_health.collect() {
            for metric in family.get_metric() {
                if let (Some(vendor), Some(pool)) =
                    (label_value(metric, "vendor"), label_value(metric, "pool"))
                {
                    pool_health
                        .entry(vendor.to_string())
                        .or_default()
                        .insert(pool.to_string(), metric.get_gauge().get_value() as i64);
                }
            }
        }

        MetricsSnapshot {
            vendors,
            pool_health,
            system: SystemSample {
                cpu_usage_percent: self.cpu_usage_percent.get(),
                memory_used_bytes: self.memory_usage_bytes.get() as u64,
            },
        }
    }

    /// Encodes every family in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn gauge_values<C: Collector>(&self, collector: &C, label: &str) -> HashMap<String, f64> {
        collector
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .filter_map(|metric| {
                label_value(metric, label)
                    .map(|value| (value.to_string(), metric.get_gauge().get_value()))
            })
            .collect()
    }
}

fn label_value<'a>(metric: &'a prometheus::proto::Metric, name: &str) -> Option<&'a str> {
    metric
        .get_label()
        .iter()
        .find(|pair| pair.get_name() == name)
        .map(|pair| pair.get_value())
}

fn labels_match(metric: &prometheus::proto::Metric, expected: &[(&str, &str)]) -> bool {
    expected
        .iter()
        .all(|(name, value)| label_value(metric, name) == Some(*value))
}

/// Decrements `active_connections{vendor}` when dropped, on every exit path.
pub struct ActiveConnectionGuard {
    gauge: IntGauge,
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorSnapshot {
    pub active_connections: i64,
    pub error_rate: f64,
    pub requests_total: u64,
    pub errors_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<PercentileStats>,
}

/// Read-only view handed to the exposure server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub vendors: BTreeMap<String, VendorSnapshot>,
    pub pool_health: BTreeMap<String, BTreeMap<String, i64>>,
    pub system: SystemSample,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{OutcomeStatus, RequestOutcome};
    use crate::errors::{ErrorCategory, TransportError};
    use reqwest::Method;
    use std::time::{Duration, SystemTime};

    fn metrics() -> Metrics {
        Metrics::new("test", vec!["vendor-a".to_string(), "vendor-b".to_string()]).unwrap()
    }

    fn outcome(vendor: &str, pool: &str, status: OutcomeStatus) -> RequestOutcome {
        RequestOutcome {
            vendor: vendor.to_string(),
            pool: pool.to_string(),
            method: Method::GET,
            destination: "https://httpbin.org".to_string(),
            url: "https://httpbin.org/get".to_string(),
            status,
            elapsed: Duration::from_millis(20),
            bytes_sent: 0,
            bytes_received: 128,
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn error_status_classification() {
        assert!(!is_error_status("200"));
        assert!(!is_error_status("302"));
        assert!(is_error_status("404"));
        assert!(is_error_status("500"));
        assert!(is_error_status(ERROR_STATUS_LABEL));
    }

    #[test]
    fn record_counts_by_status_and_host() {
        let m = metrics();
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(200)));
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(200)));

        assert_eq!(m.request_count("vendor-a", "GET", "200", "https://httpbin.org"), 2);
        assert_eq!(m.pool_health("vendor-a", "p1"), Some(1));
    }

    #[test]
    fn pool_health_tracks_last_outcome() {
        let m = metrics();
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(200)));
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(503)));
        assert_eq!(m.pool_health("vendor-a", "p1"), Some(0));

        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(301)));
        assert_eq!(m.pool_health("vendor-a", "p1"), Some(1));

        let fault = TransportError::new(ErrorCategory::NetworkError, "reset");
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Failed(fault)));
        assert_eq!(m.pool_health("vendor-a", "p1"), Some(0));
        assert_eq!(m.pool_health("vendor-a", "p2"), None);
    }

    #[test]
    fn error_rate_is_zero_without_requests() {
        let m = metrics();
        let rates = m.refresh_derived();
        assert_eq!(rates.get("vendor-a"), Some(&0.0));
        assert_eq!(m.error_rate("vendor-b"), 0.0);
    }

    #[test]
    fn error_rate_mixes_statuses_and_faults() {
        let m = metrics();
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(200)));
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(404)));
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(418)));
        let fault = TransportError::new(ErrorCategory::TimeoutError, "slow");
        m.record(&outcome("vendor-a", "p2", OutcomeStatus::Failed(fault)));
        m.record(&outcome("vendor-b", "p1", OutcomeStatus::Status(500)));

        let rates = m.refresh_derived();
        assert_eq!(rates["vendor-a"], 75.0);
        assert_eq!(rates["vendor-b"], 100.0);
        assert_eq!(m.error_rate("vendor-a"), 75.0);
    }

    #[test]
    fn unknown_vendor_seen_in_counters_gets_a_rate() {
        let m = metrics();
        m.record(&outcome("vendor-z", "p1", OutcomeStatus::Status(200)));
        let rates = m.refresh_derived();
        assert_eq!(rates.get("vendor-z"), Some(&0.0));
    }

    #[test]
    fn connection_guard_decrements_on_drop() {
        let m = metrics();
        let first = m.track_connection("vendor-a");
        let second = m.track_connection("vendor-a");
        assert_eq!(m.active_connections("vendor-a"), 2);

        drop(first);
        assert_eq!(m.active_connections("vendor-a"), 1);
        drop(second);
        assert_eq!(m.active_connections("vendor-a"), 0);
    }

    #[test]
    fn reset_prevents_negative_gauges() {
        let m = metrics();
        let guard = m.track_connection("vendor-a");
        m.reset_active_connections();
        assert_eq!(m.active_connections("vendor-a"), 0);

        drop(guard);
        assert_eq!(m.active_connections("vendor-a"), 0);

        let fresh = m.track_connection("vendor-a");
        assert_eq!(m.active_connections("vendor-a"), 1);
        drop(fresh);
        assert_eq!(m.active_connections("vendor-a"), 0);
        assert!(!m.render().unwrap().contains("active_connections{vendor=\"vendor-a\"} -1"));
    }

    #[test]
    fn snapshot_includes_known_vendors_and_pools() {
        let m = metrics();
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(200)));
        m.refresh_derived();

        let snapshot = m.snapshot();
        assert_eq!(snapshot.vendors.len(), 2);
        assert_eq!(snapshot.vendors["vendor-a"].requests_total, 1);
        assert!(snapshot.vendors["vendor-a"].latency_ms.is_some());
        assert_eq!(snapshot.vendors["vendor-b"].requests_total, 0);
        assert_eq!(snapshot.pool_health["vendor-a"]["p1"], 1);
    }

    #[test]
    fn render_uses_namespace_and_unprefixed_pool_health() {
        let m = metrics();
        m.record(&outcome("vendor-a", "p1", OutcomeStatus::Status(200)));
        let text = m.render().unwrap();

        assert!(text.contains("test_requests_total"));
        assert!(text.contains("destination_host=\"httpbin.org\""));
        assert!(text.contains("proxy_pool_health"));
        assert!(!text.contains("test_proxy_pool_health"));
    }
}
