use clap::{Parser, ValueEnum};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::utils::{parse_duration_string, parse_pattern_list};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "proxy-loadgen",
    version,
    about = "Synthetic proxy-vendor traffic generator with Prometheus metrics",
    after_help = "Examples:\n  proxy-loadgen --patterns steady,burst\n  proxy-loadgen --config config/config.yaml --metrics-port 9100 --max-in-flight 500"
)]
pub struct Cli {
    /// YAML configuration merged over the built-in defaults.
    #[arg(long, env = "LOADGEN_CONFIG", default_value = "config/config.yaml")]
    pub config: PathBuf,

    /// Comma-separated traffic pattern names to run.
    #[arg(long, env = "LOADGEN_PATTERNS", default_value = "steady")]
    pub patterns: String,

    /// Port of the /metrics, /health and /stats server.
    #[arg(long, env = "LOADGEN_METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Cap on requests in flight; unlimited when omitted.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_in_flight: Option<u64>,

    /// Keep serving metrics this long after all patterns finish (e.g. 2m).
    #[arg(long, default_value = "0s", value_parser = parse_linger)]
    pub linger: Duration,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

fn parse_linger(input: &str) -> Result<Duration, String> {
    if input.trim() == "0" || input.trim() == "0s" {
        return Ok(Duration::ZERO);
    }
    parse_duration_string(input)
}

impl Cli {
    pub fn pattern_names(&self) -> Vec<String> {
        parse_pattern_list(&self.patterns)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.metrics_port))
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        self.max_in_flight
            .map(|cap| usize::try_from(cap).unwrap_or(usize::MAX))
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Text => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Tracing already initialised: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["proxy-loadgen"]).unwrap();
        assert_eq!(cli.metrics_port, 8080);
        assert_eq!(cli.pattern_names(), vec!["steady".to_string()]);
        assert_eq!(cli.max_in_flight(), None);
        assert_eq!(cli.linger, Duration::ZERO);
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn explicit_flags() {
        let cli = Cli::try_parse_from([
            "proxy-loadgen",
            "--patterns",
            "burst, spike,,",
            "--metrics-port",
            "9100",
            "--max-in-flight",
            "50",
            "--linger",
            "2m",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.pattern_names(), vec!["burst".to_string(), "spike".to_string()]);
        assert_eq!(cli.metrics_addr().port(), 9100);
        assert_eq!(cli.max_in_flight(), Some(50));
        assert_eq!(cli.linger, Duration::from_secs(120));
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn zero_in_flight_cap_is_rejected() {
        assert!(Cli::try_parse_from(["proxy-loadgen", "--max-in-flight", "0"]).is_err());
    }
}
