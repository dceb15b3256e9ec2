//! Pattern scheduling: one open-loop dispatcher per traffic pattern.
//!
//! A scheduler fires one request per `1 / requests_per_second` until the
//! pattern's duration elapses or shutdown is signalled. Requests are spawned
//! and never awaited, so slow upstreams do not slow the dispatch rate.

use rand::seq::SliceRandom;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::executor::{method_has_payload, PlannedRequest, RequestExecutor};
use crate::registry::{TrafficPattern, VendorRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Completed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("pattern '{0}': no vendors configured")]
    NoVendors(String),

    #[error("pattern '{0}': no destinations configured")]
    NoDestinations(String),

    #[error("pattern '{0}': no methods configured")]
    NoMethods(String),

    #[error("pattern '{0}': scheduler already ran")]
    AlreadyRun(String),
}

/// What one scheduler did over its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerReport {
    pub pattern: String,
    pub dispatched: u64,
    /// Ticks dropped because the in-flight cap was reached.
    pub skipped: u64,
    /// True when shutdown arrived before the duration elapsed.
    pub interrupted: bool,
}

/// Resolves once the shutdown flag is set. Pends forever if the sender is
/// dropped without signalling.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct PatternScheduler {
    pattern: Arc<TrafficPattern>,
    vendors: Arc<VendorRegistry>,
    executor: Arc<RequestExecutor>,
    limiter: Option<Arc<Semaphore>>,
    state: SchedulerState,
}

impl PatternScheduler {
    /// `limiter` caps requests in flight across every scheduler sharing it;
    /// `None` keeps dispatch unbounded.
    pub fn new(
        pattern: Arc<TrafficPattern>,
        vendors: Arc<VendorRegistry>,
        executor: Arc<RequestExecutor>,
        limiter: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            pattern,
            vendors,
            executor,
            limiter,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn pattern(&self) -> &TrafficPattern {
        &self.pattern
    }

    fn validate(&self) -> Result<(), SchedulerError> {
        let name = || self.pattern.name.clone();
        if self.vendors.is_empty() {
            return Err(SchedulerError::NoVendors(name()));
        }
        if self.pattern.destinations.is_empty() {
            return Err(SchedulerError::NoDestinations(name()));
        }
        if self.pattern.methods.is_empty() {
            return Err(SchedulerError::NoMethods(name()));
        }
        Ok(())
    }

    /// Draws vendor, method, destination and payload size uniformly at random.
    pub fn plan_request(&self) -> Result<PlannedRequest, SchedulerError> {
        let mut rng = rand::thread_rng();
        let pattern = &self.pattern;

        let vendor = self
            .vendors
            .choose(&mut rng)
            .ok_or_else(|| SchedulerError::NoVendors(pattern.name.clone()))?;
        let method = pattern
            .methods
            .choose(&mut rng)
            .ok_or_else(|| SchedulerError::NoMethods(pattern.name.clone()))?;
        let destination = pattern
            .destinations
            .choose(&mut rng)
            .ok_or_else(|| SchedulerError::NoDestinations(pattern.name.clone()))?;

        let payload_size = if method_has_payload(method) {
            pattern.payload_sizes.choose(&mut rng).copied().unwrap_or(0)
        } else {
            0
        };

        Ok(PlannedRequest {
            vendor: Arc::clone(vendor),
            method: method.clone(),
            destination: destination.clone(),
            payload_size,
            extra_headers: pattern.headers.clone(),
        })
    }

    /// Runs the pattern to completion: Idle → Running → Completed.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SchedulerReport, SchedulerError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulerError::AlreadyRun(self.pattern.name.clone()));
        }
        self.validate()?;
        self.state = SchedulerState::Running;

        let interval = self.pattern.interval();
        let start = Instant::now();
        // Durations past the end of the clock run until shutdown.
        let deadline = start.checked_add(self.pattern.duration);

        info!(
            pattern = %self.pattern.name,
            rps = self.pattern.requests_per_second,
            duration_secs = self.pattern.duration.as_secs_f64(),
            capped = self.limiter.is_some(),
            "Starting traffic pattern"
        );

        let mut dispatched = 0u64;
        let mut skipped = 0u64;
        let mut interrupted = false;
        // Absolute fire times so pacing does not drift with timer overshoot.
        let mut next_fire = start;

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    interrupted = true;
                    break;
                }
                _ = time::sleep_until(next_fire) => {}
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
            next_fire += interval;

            let permit = match &self.limiter {
                Some(limiter) => match Arc::clone(limiter).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        skipped += 1;
                        self.executor
                            .metrics()
                            .record_dispatch_skipped(&self.pattern.name);
                        debug!(pattern = %self.pattern.name, "In-flight cap reached, skipping tick");
                        continue;
                    }
                },
                None => None,
            };

            let planned = self.plan_request()?;
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                let _permit = permit;
                executor.execute(&planned).await;
            });
            dispatched += 1;
        }

        self.state = SchedulerState::Completed;
        info!(
            pattern = %self.pattern.name,
            dispatched,
            skipped,
            interrupted,
            "Traffic pattern completed"
        );

        Ok(SchedulerReport {
            pattern: self.pattern.name.clone(),
            dispatched,
            skipped,
            interrupted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::metrics::Metrics;
    use crate::registry::{PathCatalogue, Vendor};
    use crate::stats::RunStatistics;
    use crate::transport::{Transport, TransportRequest, TransportResponse};
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use reqwest::Method;
    use std::time::Duration;

    struct Ok200;

    #[async_trait]
    impl Transport for Ok200 {
        async fn call(&self, _: TransportRequest) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 200,
                body_bytes: 0,
            })
        }
    }

    fn vendors() -> Arc<VendorRegistry> {
        Arc::new(VendorRegistry::new(vec![Vendor {
            name: "vendor-a".to_string(),
            base_url: "https://proxy-vendor-a.com".to_string(),
            pools: vec!["pool-1".to_string()],
            auth_headers: HeaderMap::new(),
            rate_limit: 10,
            timeout: Duration::from_secs(5),
            retry_count: 0,
        }]))
    }

    fn pattern(methods: Vec<Method>, payload_sizes: Vec<usize>) -> Arc<TrafficPattern> {
        Arc::new(TrafficPattern {
            name: "steady".to_string(),
            requests_per_second: 10,
            duration: Duration::from_secs(1),
            methods,
            destinations: vec!["https://d1.example".to_string()],
            payload_sizes,
            headers: HeaderMap::new(),
        })
    }

    fn scheduler(pattern: Arc<TrafficPattern>) -> PatternScheduler {
        let metrics = Arc::new(Metrics::new("sched", vec!["vendor-a".to_string()]).unwrap());
        let executor = Arc::new(RequestExecutor::new(
            Arc::new(Ok200),
            metrics,
            Arc::new(RunStatistics::new()),
            Arc::new(PathCatalogue::default()),
        ));
        PatternScheduler::new(pattern, vendors(), executor, None)
    }

    #[test]
    fn get_requests_never_carry_payload_sizes() {
        let s = scheduler(pattern(vec![Method::GET], vec![500]));
        for _ in 0..20 {
            assert_eq!(s.plan_request().unwrap().payload_size, 0);
        }
    }

    #[test]
    fn post_requests_draw_from_payload_sizes() {
        let s = scheduler(pattern(vec![Method::POST], vec![100, 200]));
        for _ in 0..20 {
            let planned = s.plan_request().unwrap();
            assert!(planned.payload_size == 100 || planned.payload_size == 200);
            assert_eq!(planned.vendor.name, "vendor-a");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn state_moves_from_idle_to_completed() {
        let mut s = scheduler(pattern(vec![Method::GET], vec![]));
        assert_eq!(s.state(), SchedulerState::Idle);

        let (_tx, rx) = watch::channel(false);
        let report = s.run(rx.clone()).await.unwrap();
        assert_eq!(s.state(), SchedulerState::Completed);
        assert!(!report.interrupted);

        let err = s.run(rx).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRun(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_method_list_is_rejected() {
        let mut s = scheduler(pattern(vec![], vec![]));
        let (_tx, rx) = watch::channel(false);
        let err = s.run(rx).await.unwrap_err();
        assert_eq!(err, SchedulerError::NoMethods("steady".to_string()));
        assert_eq!(s.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_dispatch() {
        let mut s = scheduler(pattern(vec![Method::GET], vec![]));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = s.run(rx).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_duration_runs_until_shutdown() {
        let mut endless = (*pattern(vec![Method::GET], vec![])).clone();
        endless.duration = Duration::from_secs(u64::MAX);
        let mut s = scheduler(Arc::new(endless));

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1050)).await;
            let _ = tx.send(true);
        });

        let report = s.run(rx).await.unwrap();
        assert!(report.interrupted);
        assert!((10..=12).contains(&report.dispatched), "dispatched {}", report.dispatched);
        assert_eq!(s.state(), SchedulerState::Completed);
    }
}
