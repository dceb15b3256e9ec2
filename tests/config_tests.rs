//! Configuration loading from disk and the command-line surface.

use clap::Parser;
use serial_test::serial;
use std::env;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use proxy_loadgen::cli::Cli;
use proxy_loadgen::config::{ConfigError, LoadedConfig};

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn assert_builtin(config: &LoadedConfig) {
    assert_eq!(
        config.vendors.names(),
        vec!["vendor-a", "vendor-b", "vendor-c"]
    );
    assert_eq!(config.patterns.names(), vec!["burst", "spike", "steady"]);
}

#[test]
fn vendors_override_replaces_every_default_vendor() {
    let file = write_config(
        r#"
vendors:
  only-vendor:
    base_url: "https://only.example"
    pools: ["p1", "p2"]
    rate_limit: 5
    timeout: "10s"
    retry_count: 0
"#,
    );

    let config = LoadedConfig::load_or_default(file.path()).unwrap();

    assert_eq!(config.vendors.names(), vec!["only-vendor"]);
    let vendor = config.vendors.get("only-vendor").unwrap();
    assert_eq!(vendor.timeout, Duration::from_secs(10));
    assert!(vendor.auth_headers.is_empty());
    // Keys absent from the file keep their defaults.
    assert_eq!(config.patterns.names(), vec!["burst", "spike", "steady"]);

    println!("✅ Top-level vendors key replaces defaults wholesale");
}

#[test]
fn patterns_inherit_top_level_destinations() {
    let file = write_config(
        r#"
destinations: ["https://a.example", "https://b.example"]
traffic_patterns:
  custom:
    requests_per_second: 3
    duration: "2m"
    methods: ["get", "put"]
    payload_sizes: [10]
    headers:
      X-Pattern: "custom"
  pinned:
    requests_per_second: 1
    duration: 5
    methods: ["GET"]
    destinations: ["https://pinned.example"]
"#,
    );

    let config = LoadedConfig::load_or_default(file.path()).unwrap();

    let custom = config.patterns.get("custom").unwrap();
    assert_eq!(custom.duration, Duration::from_secs(120));
    assert_eq!(
        custom.destinations,
        vec!["https://a.example", "https://b.example"]
    );
    assert_eq!(custom.methods.len(), 2);
    assert_eq!(custom.headers.get("x-pattern").unwrap(), "custom");

    let pinned = config.patterns.get("pinned").unwrap();
    assert_eq!(pinned.destinations, vec!["https://pinned.example"]);
    assert!(!config.patterns.contains("steady"));
}

#[test]
fn missing_file_falls_back_to_builtin() {
    let dir = tempfile::tempdir().unwrap();
    let config = LoadedConfig::load_or_default(dir.path().join("absent.yaml")).unwrap();
    assert_builtin(&config);
}

#[test]
fn malformed_yaml_falls_back_to_builtin() {
    let file = write_config("vendors: [unclosed");
    assert!(matches!(
        LoadedConfig::from_file(file.path()),
        Err(ConfigError::YamlParse(_))
    ));
    assert_builtin(&LoadedConfig::load_or_default(file.path()).unwrap());
}

#[test]
fn missing_required_pattern_field_falls_back_to_builtin() {
    let file = write_config(
        r#"
traffic_patterns:
  incomplete:
    duration: 60
    methods: ["GET"]
"#,
    );

    match LoadedConfig::from_file(file.path()) {
        Err(ConfigError::MissingField(field)) => {
            assert!(field.contains("requests_per_second"), "field was {}", field)
        }
        other => panic!("expected MissingField, got {:?}", other.map(|_| ())),
    }
    assert_builtin(&LoadedConfig::load_or_default(file.path()).unwrap());
}

#[test]
fn generator_and_client_sections() {
    let file = write_config(
        r#"
client:
  max_idle_per_host: 8
  connect_timeout: "3s"
generator:
  max_in_flight: 250
  refresh_interval: "5s"
"#,
    );

    let config = LoadedConfig::load_or_default(file.path()).unwrap();
    assert_eq!(config.client.max_idle_per_host, 8);
    assert_eq!(config.client.connect_timeout, Duration::from_secs(3));
    assert_eq!(config.generator.max_in_flight, Some(250));
    assert_eq!(config.generator.refresh_interval, Duration::from_secs(5));
    assert_eq!(config.generator.idle_interval, Duration::from_secs(60));
}

fn clean_env() {
    for var in ["LOADGEN_CONFIG", "LOADGEN_PATTERNS", "LOADGEN_METRICS_PORT"] {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn cli_reads_environment_fallbacks() {
    clean_env();
    env::set_var("LOADGEN_CONFIG", "/etc/loadgen.yaml");
    env::set_var("LOADGEN_PATTERNS", "burst,spike");
    env::set_var("LOADGEN_METRICS_PORT", "9300");

    let cli = Cli::try_parse_from(["proxy-loadgen"]).unwrap();
    clean_env();

    assert_eq!(cli.config.to_str(), Some("/etc/loadgen.yaml"));
    assert_eq!(cli.pattern_names(), vec!["burst", "spike"]);
    assert_eq!(cli.metrics_port, 9300);
}

#[test]
#[serial]
fn cli_flags_win_over_environment() {
    clean_env();
    env::set_var("LOADGEN_PATTERNS", "burst");

    let cli = Cli::try_parse_from(["proxy-loadgen", "--patterns", "steady"]).unwrap();
    clean_env();

    assert_eq!(cli.pattern_names(), vec!["steady"]);
    assert_eq!(cli.config.to_str(), Some("config/config.yaml"));
}

#[test]
fn shipped_config_file_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/config.yaml");
    let config = LoadedConfig::from_file(path).expect("config/config.yaml should load");
    assert_builtin(&config);
    assert_eq!(config.generator.max_in_flight, None);
}
