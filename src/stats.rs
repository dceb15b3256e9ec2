//! Run-wide request counters and the documents served from `/health` and `/stats`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::executor::RequestOutcome;
use crate::metrics::MetricsSnapshot;
use crate::system::SystemSample;

/// Global totals for the whole run, updated once per completed request.
#[derive(Debug)]
pub struct RunStatistics {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    started: Instant,
    started_at: SystemTime,
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStatistics {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    pub fn record(&self, outcome: &RequestOutcome) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if outcome.is_success() {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Seconds since the Unix epoch at which the run started.
    pub fn start_time(&self) -> f64 {
        self.started_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// `successful / total * 100`, or 0 before the first request.
    pub fn success_rate(&self) -> f64 {
        success_rate(self.successful(), self.total())
    }

    pub fn counters(&self) -> StatsCounters {
        StatsCounters {
            total_requests: self.total(),
            successful_requests: self.successful(),
            failed_requests: self.failed(),
            start_time: self.start_time(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let counters = self.counters();
        HealthReport {
            status: "healthy",
            uptime: self.uptime_secs(),
            total_requests: counters.total_requests,
            successful_requests: counters.successful_requests,
            failed_requests: counters.failed_requests,
            success_rate: success_rate(counters.successful_requests, counters.total_requests),
        }
    }
}

fn success_rate(successful: u64, total: u64) -> f64 {
    successful as f64 / total.max(1) as f64 * 100.0
}

/// Body of `/health`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsCounters {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub start_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorStats {
    pub active_connections: i64,
    pub error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<crate::latency::PercentileStats>,
}

/// Body of `/stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub stats: StatsCounters,
    pub vendors: BTreeMap<String, VendorStats>,
    pub system: SystemSample,
}

impl StatsReport {
    pub fn build(stats: &RunStatistics, snapshot: MetricsSnapshot) -> Self {
        let vendors = snapshot
            .vendors
            .into_iter()
            .map(|(name, vendor)| {
                (
                    name,
                    VendorStats {
                        active_connections: vendor.active_connections,
                        error_rate: vendor.error_rate,
                        latency_ms: vendor.latency_ms,
                    },
                )
            })
            .collect();

        Self {
            stats: stats.counters(),
            vendors,
            system: snapshot.system,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorCategory, TransportError};
    use crate::executor::OutcomeStatus;
    use reqwest::Method;
    use std::time::Duration;

    fn outcome(status: OutcomeStatus) -> RequestOutcome {
        RequestOutcome {
            vendor: "vendor-a".to_string(),
            pool: "p1".to_string(),
            method: Method::GET,
            destination: "https://d1".to_string(),
            url: "https://d1/".to_string(),
            status,
            elapsed: Duration::from_millis(1),
            bytes_sent: 0,
            bytes_received: 0,
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn success_rate_is_zero_without_requests() {
        let stats = RunStatistics::new();
        let health = stats.health();
        assert_eq!(health.total_requests, 0);
        assert_eq!(health.success_rate, 0.0);
        assert!(!health.success_rate.is_nan());
    }

    #[test]
    fn counts_success_and_failure() {
        let stats = RunStatistics::new();
        stats.record(&outcome(OutcomeStatus::Status(200)));
        stats.record(&outcome(OutcomeStatus::Status(302)));
        stats.record(&outcome(OutcomeStatus::Status(404)));
        stats.record(&outcome(OutcomeStatus::Failed(TransportError::new(
            ErrorCategory::NetworkError,
            "refused",
        ))));

        assert_eq!(stats.total(), 4);
        assert_eq!(stats.successful(), 2);
        assert_eq!(stats.failed(), 2);
        assert_eq!(stats.success_rate(), 50.0);
    }

    #[test]
    fn health_document_shape() {
        let stats = RunStatistics::new();
        stats.record(&outcome(OutcomeStatus::Status(200)));
        let json = serde_json::to_value(stats.health()).unwrap();

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["success_rate"], 100.0);
        assert!(json["uptime"].is_number());
    }
}
