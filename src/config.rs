//! YAML configuration with built-in defaults.
//!
//! The user file is merged over the built-in document one top-level key at a
//! time: a `vendors` block in the file replaces every default vendor, it does
//! not add to them. Any problem with the file (missing, unparsable, missing a
//! required field) is logged and the built-in defaults are used instead.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::client::ClientConfig;
use crate::registry::{PathCatalogue, PatternCatalogue, TrafficPattern, Vendor, VendorRegistry};

/// Errors that can occur when loading or parsing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Built-in configuration: three vendors, four destinations, three patterns.
pub const DEFAULT_CONFIG_YAML: &str = r#"
vendors:
  vendor-a:
    base_url: "https://proxy-vendor-a.com"
    pools: ["datacenter-us-east", "datacenter-us-west", "datacenter-eu"]
    auth_headers:
      X-API-Key: "vendor-a-key"
    rate_limit: 1000
    timeout: 30
    retry_count: 3
  vendor-b:
    base_url: "https://proxy-vendor-b.com"
    pools: ["residential-us", "residential-eu", "residential-asia"]
    auth_headers:
      Authorization: "Bearer vendor-b-token"
    rate_limit: 500
    timeout: 45
    retry_count: 2
  vendor-c:
    base_url: "https://proxy-vendor-c.com"
    pools: ["mobile-us", "mobile-eu", "mobile-global"]
    auth_headers:
      X-Auth-Token: "vendor-c-token"
    rate_limit: 300
    timeout: 60
    retry_count: 1
destinations:
  - "https://httpbin.org"
  - "https://jsonplaceholder.typicode.com"
  - "https://api.github.com"
  - "https://postman-echo.com"
traffic_patterns:
  burst:
    requests_per_second: 50
    duration: 300
    methods: ["GET", "POST"]
    payload_sizes: [100, 500, 1000, 5000]
  steady:
    requests_per_second: 10
    duration: 3600
    methods: ["GET"]
    payload_sizes: [100, 200]
  spike:
    requests_per_second: 200
    duration: 60
    methods: ["GET", "POST", "PUT"]
    payload_sizes: [50, 100, 500, 1000, 10000]
paths:
  "https://httpbin.org": ["/get", "/post", "/put", "/delete", "/status/200", "/delay/1"]
  "https://jsonplaceholder.typicode.com": ["/posts", "/users", "/comments", "/albums"]
  "https://api.github.com": ["/users/octocat", "/repos/microsoft/vscode", "/rate_limit"]
  "https://postman-echo.com": ["/get", "/post", "/status/200", "/delay/1"]
"#;

/// Duration format for YAML (e.g., 30, "30s", "5m", "2h").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(u64),
    String(String),
}

impl YamlDuration {
    pub fn to_std_duration(&self) -> Result<Duration, ConfigError> {
        match self {
            YamlDuration::Seconds(s) => Ok(Duration::from_secs(*s)),
            YamlDuration::String(s) => crate::utils::parse_duration_string(s)
                .map_err(|e| ConfigError::Validation(format!("Invalid duration '{}': {}", s, e))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct YamlVendor {
    base_url: String,
    pools: Vec<String>,
    #[serde(default)]
    auth_headers: BTreeMap<String, String>,
    rate_limit: u32,
    timeout: YamlDuration,
    retry_count: u32,
}

/// Required fields are optional here so a missing one can be reported by name.
#[derive(Debug, Clone, Deserialize)]
struct YamlPattern {
    requests_per_second: Option<u32>,
    duration: Option<YamlDuration>,
    methods: Option<Vec<String>>,
    destinations: Option<Vec<String>>,
    #[serde(default)]
    payload_sizes: Vec<usize>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct YamlClientConfig {
    max_idle_per_host: Option<usize>,
    idle_timeout: Option<YamlDuration>,
    connect_timeout: Option<YamlDuration>,
    request_timeout: Option<YamlDuration>,
    tcp_keepalive: Option<YamlDuration>,
    skip_tls_verify: Option<bool>,
    user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct YamlGeneratorConfig {
    max_in_flight: Option<usize>,
    refresh_interval: Option<YamlDuration>,
    idle_interval: Option<YamlDuration>,
}

#[derive(Debug, Clone, Deserialize)]
struct YamlDocument {
    vendors: BTreeMap<String, YamlVendor>,
    destinations: Vec<String>,
    traffic_patterns: BTreeMap<String, YamlPattern>,
    #[serde(default)]
    paths: HashMap<String, Vec<String>>,
    #[serde(default)]
    client: YamlClientConfig,
    #[serde(default)]
    generator: YamlGeneratorConfig,
}

/// Generator-wide knobs that are not part of any single pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorSettings {
    /// Cap on concurrently in-flight requests. `None` means unlimited fan-out.
    pub max_in_flight: Option<usize>,
    /// Tick of the derived-metrics/system-metrics updater.
    pub refresh_interval: Duration,
    /// Sleep between no-op wakeups when no valid pattern was requested.
    pub idle_interval: Duration,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            max_in_flight: None,
            refresh_interval: Duration::from_secs(10),
            idle_interval: Duration::from_secs(60),
        }
    }
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub vendors: VendorRegistry,
    pub patterns: PatternCatalogue,
    pub paths: PathCatalogue,
    pub client: ClientConfig,
    pub generator: GeneratorSettings,
}

impl LoadedConfig {
    /// The built-in configuration with no user overrides.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_document(default_document()?)
    }

    /// Load configuration from a YAML file merged over the built-in defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a YAML string merged over the built-in defaults.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let overrides = match serde_yaml::from_str::<Value>(content)? {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            _ => {
                return Err(ConfigError::Validation(
                    "top level of the config file must be a mapping".to_string(),
                ))
            }
        };

        let merged = merge_shallow(default_document()?, overrides);
        Self::from_document(merged)
    }

    /// Load the file at `path`, falling back to the built-in configuration on
    /// any error. Only fails if the built-in configuration itself is broken.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match Self::from_file(path) {
            Ok(config) => {
                info!(
                    path = %path.display(),
                    vendors = config.vendors.len(),
                    patterns = config.patterns.len(),
                    "Loaded configuration"
                );
                Ok(config)
            }
            Err(ConfigError::FileRead(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Self::builtin()
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Error loading config, using defaults");
                Self::builtin()
            }
        }
    }

    fn from_document(document: Mapping) -> Result<Self, ConfigError> {
        let doc: YamlDocument = serde_yaml::from_value(Value::Mapping(document))?;

        let vendors = doc
            .vendors
            .into_iter()
            .map(|(name, raw)| build_vendor(name, raw))
            .collect::<Result<Vec<_>, _>>()?;

        let patterns = doc
            .traffic_patterns
            .into_iter()
            .map(|(name, raw)| build_pattern(name, raw, &doc.destinations))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            vendors: VendorRegistry::new(vendors),
            patterns: PatternCatalogue::new(patterns),
            paths: PathCatalogue::new(doc.paths),
            client: build_client_config(doc.client)?,
            generator: build_generator_settings(doc.generator)?,
        })
    }
}

/// Parses the built-in document.
pub fn default_document() -> Result<Mapping, ConfigError> {
    match serde_yaml::from_str::<Value>(DEFAULT_CONFIG_YAML)? {
        Value::Mapping(map) => Ok(map),
        _ => Err(ConfigError::Validation(
            "built-in configuration is not a mapping".to_string(),
        )),
    }
}

/// Top-level replace-by-key merge. Nested mappings are not merged.
pub fn merge_shallow(mut defaults: Mapping, overrides: Mapping) -> Mapping {
    for (key, value) in overrides {
        defaults.insert(key, value);
    }
    defaults
}

fn build_headers(context: &str, raw: BTreeMap<String, String>) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    for (name, value) in raw {
        let header_name = HeaderName::from_str(&name).map_err(|e| {
            ConfigError::Validation(format!("{}: invalid header name '{}': {}", context, name, e))
        })?;
        let header_value = HeaderValue::from_str(&value).map_err(|e| {
            ConfigError::Validation(format!(
                "{}: invalid value for header '{}': {}",
                context, name, e
            ))
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn build_vendor(name: String, raw: YamlVendor) -> Result<Vendor, ConfigError> {
    let context = format!("vendors.{}", name);

    if raw.base_url.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{}.base_url cannot be empty",
            context
        )));
    }
    if raw.pools.is_empty() {
        return Err(ConfigError::Validation(format!(
            "{}.pools must list at least one pool",
            context
        )));
    }

    Ok(Vendor {
        auth_headers: build_headers(&format!("{}.auth_headers", context), raw.auth_headers)?,
        timeout: raw.timeout.to_std_duration()?,
        name,
        base_url: raw.base_url,
        pools: raw.pools,
        rate_limit: raw.rate_limit,
        retry_count: raw.retry_count,
    })
}

fn build_pattern(
    name: String,
    raw: YamlPattern,
    default_destinations: &[String],
) -> Result<TrafficPattern, ConfigError> {
    let context = format!("traffic_patterns.{}", name);
    let missing = |field: &str| ConfigError::MissingField(format!("{}.{}", context, field));

    let requests_per_second = raw
        .requests_per_second
        .ok_or_else(|| missing("requests_per_second"))?;
    if requests_per_second == 0 {
        return Err(ConfigError::Validation(format!(
            "{}.requests_per_second must be greater than 0",
            context
        )));
    }

    let duration = raw.duration.ok_or_else(|| missing("duration"))?.to_std_duration()?;

    let method_names = raw.methods.ok_or_else(|| missing("methods"))?;
    if method_names.is_empty() {
        return Err(ConfigError::Validation(format!(
            "{}.methods must list at least one method",
            context
        )));
    }
    let methods = method_names
        .iter()
        .map(|m| {
            Method::from_bytes(m.trim().to_uppercase().as_bytes()).map_err(|_| {
                ConfigError::Validation(format!("{}.methods: invalid HTTP method '{}'", context, m))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TrafficPattern {
        headers: build_headers(&format!("{}.headers", context), raw.headers)?,
        destinations: raw
            .destinations
            .unwrap_or_else(|| default_destinations.to_vec()),
        name,
        requests_per_second,
        duration,
        methods,
        payload_sizes: raw.payload_sizes,
    })
}

fn optional_duration(raw: Option<YamlDuration>) -> Result<Option<Duration>, ConfigError> {
    raw.map(|d| d.to_std_duration()).transpose()
}

fn build_client_config(raw: YamlClientConfig) -> Result<ClientConfig, ConfigError> {
    let defaults = ClientConfig::default();
    Ok(ClientConfig {
        max_idle_per_host: raw.max_idle_per_host.unwrap_or(defaults.max_idle_per_host),
        idle_timeout: optional_duration(raw.idle_timeout)?.unwrap_or(defaults.idle_timeout),
        connect_timeout: optional_duration(raw.connect_timeout)?.unwrap_or(defaults.connect_timeout),
        request_timeout: optional_duration(raw.request_timeout)?.unwrap_or(defaults.request_timeout),
        tcp_keepalive: optional_duration(raw.tcp_keepalive)?.or(defaults.tcp_keepalive),
        skip_tls_verify: raw.skip_tls_verify.unwrap_or(defaults.skip_tls_verify),
        user_agent: raw.user_agent.unwrap_or(defaults.user_agent),
    })
}

fn build_generator_settings(raw: YamlGeneratorConfig) -> Result<GeneratorSettings, ConfigError> {
    let defaults = GeneratorSettings::default();

    if raw.max_in_flight == Some(0) {
        return Err(ConfigError::Validation(
            "generator.max_in_flight must be greater than 0 when set".to_string(),
        ));
    }

    let refresh_interval =
        optional_duration(raw.refresh_interval)?.unwrap_or(defaults.refresh_interval);
    if refresh_interval.is_zero() {
        return Err(ConfigError::Validation(
            "generator.refresh_interval must be greater than 0".to_string(),
        ));
    }

    let idle_interval = optional_duration(raw.idle_interval)?.unwrap_or(defaults.idle_interval);
    if idle_interval.is_zero() {
        return Err(ConfigError::Validation(
            "generator.idle_interval must be greater than 0".to_string(),
        ));
    }

    Ok(GeneratorSettings {
        max_in_flight: raw.max_in_flight,
        refresh_interval,
        idle_interval,
    })
}
