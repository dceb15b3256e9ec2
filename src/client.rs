use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for building the shared outbound HTTP client.
///
/// One client (and therefore one connection pool) is shared by every
/// in-flight request across all vendors and patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Maximum idle connections to keep per host
    pub max_idle_per_host: usize,

    /// How long idle connections stay in the pool before cleanup
    pub idle_timeout: Duration,

    pub connect_timeout: Duration,

    /// Upper bound for a whole request; vendor timeouts apply per request on top.
    pub request_timeout: Duration,

    /// TCP keepalive duration
    pub tcp_keepalive: Option<Duration>,

    pub skip_tls_verify: bool,

    /// Default User-Agent; every generated request overrides it with a crawler UA.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 100,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            tcp_keepalive: Some(Duration::from_secs(60)),
            skip_tls_verify: false,
            user_agent: "LoadGenerator/1.0".to_string(),
        }
    }
}

impl ClientConfig {
    /// Apply pool and timeout settings to a reqwest ClientBuilder.
    pub fn apply_to_builder(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        let mut builder = builder
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout)
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout);

        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder
    }
}

/// Builds a reqwest HTTP client with the specified configuration.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut default_headers = HeaderMap::new();
    match HeaderValue::from_str(&config.user_agent) {
        Ok(value) => {
            default_headers.insert(USER_AGENT, value);
        }
        Err(e) => {
            warn!(user_agent = %config.user_agent, error = %e, "Ignoring invalid default User-Agent");
        }
    }

    let mut client_builder = config.apply_to_builder(
        reqwest::Client::builder().default_headers(default_headers),
    );

    info!(
        max_idle_per_host = config.max_idle_per_host,
        idle_timeout = ?config.idle_timeout,
        connect_timeout = ?config.connect_timeout,
        request_timeout = ?config.request_timeout,
        "Connection pool configured"
    );

    if config.skip_tls_verify {
        warn!("Skipping TLS certificate verification");
        client_builder = client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    client_builder.build()
}
