//! Vendor registry, traffic pattern catalogue and known destination paths.
//!
//! All three are populated once at startup by [`crate::config`] and are
//! read-only afterwards, so they are shared behind `Arc` without locking.

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// A simulated upstream proxy provider.
#[derive(Debug, Clone)]
pub struct Vendor {
    pub name: String,
    pub base_url: String,
    /// Pools requests are spread across, e.g. "residential-us".
    pub pools: Vec<String>,
    pub auth_headers: HeaderMap,
    /// Informational only; pacing is driven by the traffic pattern.
    pub rate_limit: u32,
    /// Per-request timeout applied to every call made through this vendor.
    pub timeout: Duration,
    /// Informational only; each dispatched request is attempted once.
    pub retry_count: u32,
}

impl Vendor {
    /// Picks one pool uniformly at random. Every request picks independently.
    pub fn choose_pool<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        self.pools.choose(rng).map(String::as_str)
    }
}

/// Immutable catalogue of vendors.
#[derive(Debug, Clone, Default)]
pub struct VendorRegistry {
    vendors: Vec<Arc<Vendor>>,
}

impl VendorRegistry {
    pub fn new(vendors: Vec<Vendor>) -> Self {
        Self {
            vendors: vendors.into_iter().map(Arc::new).collect(),
        }
    }

    /// Look up a vendor by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Vendor>> {
        self.vendors.iter().find(|v| v.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Vendor>> {
        self.vendors.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.vendors.iter().map(|v| v.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }

    /// Picks a vendor uniformly at random.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Arc<Vendor>> {
        self.vendors.choose(rng)
    }
}

/// A named traffic shape.
#[derive(Debug, Clone)]
pub struct TrafficPattern {
    pub name: String,
    /// Always > 0; enforced at load time.
    pub requests_per_second: u32,
    pub duration: Duration,
    /// Never empty; enforced at load time.
    pub methods: Vec<Method>,
    pub destinations: Vec<String>,
    /// Only consulted for POST and PUT.
    pub payload_sizes: Vec<usize>,
    pub headers: HeaderMap,
}

impl TrafficPattern {
    /// Time between two dispatches: `1 / requests_per_second`.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.requests_per_second.max(1)))
    }
}

/// Immutable set of named traffic patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternCatalogue {
    patterns: BTreeMap<String, Arc<TrafficPattern>>,
}

impl PatternCatalogue {
    pub fn new(patterns: Vec<TrafficPattern>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TrafficPattern>> {
        self.patterns.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.patterns.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.patterns.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TrafficPattern>> {
        self.patterns.values()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Path used when a destination has no known paths.
pub const FALLBACK_PATH: &str = "/";

/// Known request paths per destination.
#[derive(Debug, Clone, Default)]
pub struct PathCatalogue {
    paths: HashMap<String, Vec<String>>,
}

impl PathCatalogue {
    pub fn new(paths: HashMap<String, Vec<String>>) -> Self {
        Self { paths }
    }

    /// Paths registered for a destination (empty if unknown).
    pub fn paths_for(&self, destination: &str) -> &[String] {
        self.paths
            .get(destination)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Picks one known path for the destination, or `/` if it has none.
    pub fn choose<R: Rng + ?Sized>(&self, destination: &str, rng: &mut R) -> &str {
        self.paths_for(destination)
            .choose(rng)
            .map(String::as_str)
            .unwrap_or(FALLBACK_PATH)
    }
}
