//! Run coordination: exposure server, periodic updater and one scheduler per
//! requested pattern.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{GeneratorSettings, LoadedConfig};
use crate::executor::RequestExecutor;
use crate::latency::format_percentile_table;
use crate::metrics::Metrics;
use crate::registry::{PatternCatalogue, VendorRegistry};
use crate::scheduler::{wait_for_shutdown, PatternScheduler, SchedulerError, SchedulerReport};
use crate::server::ExposureServer;
use crate::stats::RunStatistics;
use crate::system::{process_rss_bytes, SystemProbe};
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to bind exposure server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Per-run knobs that come from the command line rather than the config file.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub patterns: Vec<String>,
    pub metrics_addr: SocketAddr,
    pub max_in_flight: Option<usize>,
    pub refresh_interval: Duration,
    pub idle_interval: Duration,
    /// Keep serving for this long after every pattern finished.
    pub linger: Duration,
}

impl RunSettings {
    pub fn new(patterns: Vec<String>, metrics_addr: SocketAddr, generator: &GeneratorSettings) -> Self {
        Self {
            patterns,
            metrics_addr,
            max_in_flight: generator.max_in_flight,
            refresh_interval: generator.refresh_interval,
            idle_interval: generator.idle_interval,
            linger: Duration::ZERO,
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Address the exposure server was bound to.
    pub metrics_addr: Option<SocketAddr>,
    pub started: Vec<String>,
    /// Requested names missing from the catalogue.
    pub skipped: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub dispatched: BTreeMap<String, u64>,
    pub dispatch_skipped: BTreeMap<String, u64>,
}

impl RunReport {
    fn record_completion(&mut self, report: SchedulerReport) {
        *self.dispatched.entry(report.pattern.clone()).or_insert(0) += report.dispatched;
        *self
            .dispatch_skipped
            .entry(report.pattern.clone())
            .or_insert(0) += report.skipped;
        self.completed.push(report.pattern);
    }

    pub fn total_dispatched(&self) -> u64 {
        self.dispatched.values().sum()
    }
}

pub struct RunCoordinator {
    vendors: Arc<VendorRegistry>,
    patterns: PatternCatalogue,
    executor: Arc<RequestExecutor>,
    metrics: Arc<Metrics>,
    stats: Arc<RunStatistics>,
    settings: RunSettings,
}

impl RunCoordinator {
    /// Builds the shared metrics, statistics and executor for a run.
    pub fn new(
        config: LoadedConfig,
        transport: Arc<dyn Transport>,
        settings: RunSettings,
    ) -> Result<Self, RunError> {
        let metrics = Arc::new(Metrics::with_default_namespace(config.vendors.names())?);
        let stats = Arc::new(RunStatistics::new());
        let executor = Arc::new(RequestExecutor::new(
            transport,
            Arc::clone(&metrics),
            Arc::clone(&stats),
            Arc::new(config.paths),
        ));

        Ok(Self {
            vendors: Arc::new(config.vendors),
            patterns: config.patterns,
            executor,
            metrics,
            stats,
            settings,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn stats(&self) -> &Arc<RunStatistics> {
        &self.stats
    }

    /// Runs every requested pattern until they all finish or `shutdown`
    /// flips to true. Only a failure to bind the exposure server is fatal.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<RunReport, RunError> {
        let server = ExposureServer::bind(
            self.settings.metrics_addr,
            Arc::clone(&self.metrics),
            Arc::clone(&self.stats),
        )
        .map_err(|source| RunError::Bind {
            addr: self.settings.metrics_addr,
            source,
        })?;

        let mut report = RunReport {
            metrics_addr: Some(server.local_addr()),
            ..RunReport::default()
        };

        let (server_stop, server_stopped) = oneshot::channel::<()>();
        let server_task = tokio::spawn(server.serve(async move {
            let _ = server_stopped.await;
        }));
        let updater = spawn_updater(Arc::clone(&self.metrics), self.settings.refresh_interval);

        let mut schedulers = Vec::new();
        for name in &self.settings.patterns {
            match self.patterns.get(name) {
                Some(pattern) => schedulers.push(Arc::clone(pattern)),
                None => {
                    warn!(pattern = %name, available = ?self.patterns.names(), "Unknown traffic pattern, skipping");
                    report.skipped.push(name.clone());
                }
            }
        }

        let mut shutdown_rx = shutdown.clone();
        if schedulers.is_empty() {
            warn!("No valid traffic patterns requested, idling until shutdown");
            idle_until_shutdown(&mut shutdown_rx, self.settings.idle_interval).await;
        } else {
            let limiter = self.settings.max_in_flight.map(|cap| {
                info!(max_in_flight = cap, "In-flight cap enabled");
                Arc::new(Semaphore::new(cap))
            });

            let mut handles: Vec<(String, JoinHandle<Result<SchedulerReport, SchedulerError>>)> =
                Vec::new();
            for pattern in schedulers {
                let name = pattern.name.clone();
                let mut scheduler = PatternScheduler::new(
                    pattern,
                    Arc::clone(&self.vendors),
                    Arc::clone(&self.executor),
                    limiter.clone(),
                );
                let rx = shutdown.clone();
                report.started.push(name.clone());
                handles.push((name, tokio::spawn(async move { scheduler.run(rx).await })));
            }

            for (name, handle) in handles {
                match handle.await {
                    Ok(Ok(scheduler_report)) => report.record_completion(scheduler_report),
                    Ok(Err(e)) => {
                        error!(pattern = %name, error = %e, "Traffic pattern failed");
                        report.failed.push(name);
                    }
                    Err(e) => {
                        error!(pattern = %name, error = %e, "Traffic pattern task panicked");
                        report.failed.push(name);
                    }
                }
            }

            if !self.settings.linger.is_zero() {
                info!(linger_secs = self.settings.linger.as_secs_f64(), "All patterns finished, lingering");
                tokio::select! {
                    _ = time::sleep(self.settings.linger) => {}
                    _ = wait_for_shutdown(&mut shutdown_rx) => {}
                }
            }
        }

        self.metrics.refresh_derived();
        let latency = self.metrics.latency_stats();
        if !latency.is_empty() {
            info!("Latency by vendor:\n{}", format_percentile_table(&latency));
        }
        info!(
            total_requests = self.stats.total(),
            successful = self.stats.successful(),
            failed = self.stats.failed(),
            success_rate = self.stats.success_rate(),
            dispatched = report.total_dispatched(),
            "Run finished"
        );

        updater.abort();
        let _ = server_stop.send(());
        if let Err(e) = server_task.await {
            error!(error = %e, "Exposure server task failed");
        }
        self.metrics.reset_active_connections();

        Ok(report)
    }
}

/// Keeps the process alive without dispatching until shutdown.
async fn idle_until_shutdown(shutdown: &mut watch::Receiver<bool>, interval: Duration) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(shutdown) => return,
            _ = time::sleep(interval) => debug!("Idle, no traffic patterns running"),
        }
    }
}

/// Samples host usage and recomputes derived metrics on a fixed tick.
fn spawn_updater(metrics: Arc<Metrics>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut probe = SystemProbe::new();
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let sample = probe.sample();
            metrics.set_system(&sample);
            let rates = metrics.refresh_derived();
            debug!(
                cpu_usage_percent = sample.cpu_usage_percent,
                memory_used_bytes = sample.memory_used_bytes,
                process_rss_bytes = ?process_rss_bytes(),
                vendors = rates.len(),
                "Updated derived metrics"
            );
        }
    })
}
