//! Request execution through a vendor.
//!
//! One call to [`RequestExecutor::execute`] picks a pool, synthesizes headers,
//! payload and path, performs the call through the [`Transport`] and folds
//! the outcome into metrics and run statistics. Failures never escape: a
//! transport fault becomes an outcome with an `error` status.

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, Url};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error};

use crate::errors::{ErrorCategory, TransportError};
use crate::metrics::{Metrics, ERROR_STATUS_LABEL};
use crate::registry::{PathCatalogue, Vendor};
use crate::stats::RunStatistics;
use crate::transport::{Transport, TransportRequest};

const X_PROXY_VENDOR: &str = "x-proxy-vendor";
const X_PROXY_POOL: &str = "x-proxy-pool";
const X_REQUEST_ID: &str = "x-request-id";

const LOREM_WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "ut", "labore", "et", "dolore", "magna", "aliqua", "enim",
    "ad", "minim", "veniam", "quis", "nostrud", "exercitation", "ullamco", "laboris", "nisi",
    "aliquip", "ex", "ea", "commodo", "consequat",
];

/// How a request ended.
#[derive(Debug, Clone)]
pub enum OutcomeStatus {
    /// The upstream answered with this status code.
    Status(u16),
    /// No status line was received.
    Failed(TransportError),
}

/// Structured result of one dispatched request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub vendor: String,
    pub pool: String,
    pub method: Method,
    pub destination: String,
    pub url: String,
    pub status: OutcomeStatus,
    pub elapsed: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub timestamp: SystemTime,
}

impl RequestOutcome {
    pub fn status_code(&self) -> Option<u16> {
        match self.status {
            OutcomeStatus::Status(code) => Some(code),
            OutcomeStatus::Failed(_) => None,
        }
    }

    /// True for statuses in `[200, 400)`.
    pub fn is_success(&self) -> bool {
        matches!(self.status_code(), Some(code) if (200..400).contains(&code))
    }

    /// Value of the `status_code` metric label.
    pub fn status_label(&self) -> Cow<'static, str> {
        match self.status {
            OutcomeStatus::Status(code) => status_code_label(code),
            OutcomeStatus::Failed(_) => Cow::Borrowed(ERROR_STATUS_LABEL),
        }
    }

    pub fn error_category(&self) -> Option<ErrorCategory> {
        match &self.status {
            OutcomeStatus::Status(code) => ErrorCategory::from_status_code(*code),
            OutcomeStatus::Failed(e) => Some(e.category),
        }
    }
}

/// Returns the label for a status code.
///
/// Common codes are static strings so the hot path does not allocate.
fn status_code_label(code: u16) -> Cow<'static, str> {
    let label = match code {
        200 => "200",
        201 => "201",
        204 => "204",
        301 => "301",
        302 => "302",
        304 => "304",
        400 => "400",
        401 => "401",
        403 => "403",
        404 => "404",
        429 => "429",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        _ => return Cow::Owned(code.to_string()),
    };
    Cow::Borrowed(label)
}

/// One request chosen by a scheduler, before pool/path selection.
#[derive(Debug, Clone)]
pub struct PlannedRequest {
    pub vendor: Arc<Vendor>,
    pub method: Method,
    pub destination: String,
    /// Ignored unless the method is POST or PUT.
    pub payload_size: usize,
    pub extra_headers: HeaderMap,
}

/// Whether requests with this method carry a synthesized body.
pub fn method_has_payload(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT
}

/// Builds roughly `size` characters of filler text.
pub fn synthesize_payload<R: Rng + ?Sized>(size: usize, rng: &mut R) -> String {
    let mut text = String::with_capacity(size + 16);
    while text.len() < size {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(LOREM_WORDS[rng.gen_range(0..LOREM_WORDS.len())]);
    }
    text.truncate(size);
    text
}

/// Joins a known path onto a destination base address.
pub fn resolve_url(destination: &str, path: &str) -> Result<Url, TransportError> {
    let base = Url::parse(destination).map_err(|e| {
        TransportError::new(
            ErrorCategory::OtherError,
            format!("invalid destination '{}': {}", destination, e),
        )
    })?;
    base.join(path).map_err(|e| {
        TransportError::new(
            ErrorCategory::OtherError,
            format!("cannot join '{}' onto '{}': {}", path, destination, e),
        )
    })
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => {
            debug!(header = %name, error = %e, "Skipping header with invalid value");
        }
    }
}

/// Pattern headers, then vendor auth, then identification headers.
fn build_headers<R: Rng + ?Sized>(
    vendor: &Vendor,
    pool: &str,
    extra_headers: &HeaderMap,
    rng: &mut R,
) -> HeaderMap {
    let mut headers = extra_headers.clone();
    for (name, value) in vendor.auth_headers.iter() {
        headers.insert(name.clone(), value.clone());
    }

    insert_header(&mut headers, HeaderName::from_static(X_PROXY_VENDOR), &vendor.name);
    insert_header(&mut headers, HeaderName::from_static(X_PROXY_POOL), pool);
    insert_header(
        &mut headers,
        HeaderName::from_static(X_REQUEST_ID),
        &uuid::Uuid::new_v4().to_string(),
    );
    insert_header(
        &mut headers,
        USER_AGENT,
        &format!("Crawler-{}-{}", vendor.name, rng.gen_range(1000..=9999)),
    );

    headers
}

/// Executes planned requests and records their outcomes.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
    stats: Arc<RunStatistics>,
    paths: Arc<PathCatalogue>,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        metrics: Arc<Metrics>,
        stats: Arc<RunStatistics>,
        paths: Arc<PathCatalogue>,
    ) -> Self {
        Self {
            transport,
            metrics,
            stats,
            paths,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn stats(&self) -> &Arc<RunStatistics> {
        &self.stats
    }

    /// Runs one request to completion. Never fails; faults are reported
    /// through the returned outcome and the metrics.
    pub async fn execute(&self, request: &PlannedRequest) -> RequestOutcome {
        let start = Instant::now();
        let timestamp = SystemTime::now();
        let vendor = &request.vendor;

        // The RNG is not Send, so every random choice happens before the first await.
        let (pool, path, headers, payload) = {
            let mut rng = rand::thread_rng();
            let pool = vendor.choose_pool(&mut rng).unwrap_or_default().to_string();
            let path = self.paths.choose(&request.destination, &mut rng).to_string();
            let mut headers = build_headers(vendor, &pool, &request.extra_headers, &mut rng);

            let payload = if method_has_payload(&request.method) && request.payload_size > 0 {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Some(synthesize_payload(request.payload_size, &mut rng))
            } else {
                None
            };
            (pool, path, headers, payload)
        };

        let bytes_sent = payload.as_ref().map_or(0, |p| p.len() as u64);
        let resolved = resolve_url(&request.destination, &path);
        let url = match &resolved {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}{}", request.destination.trim_end_matches('/'), path),
        };

        let connection = self.metrics.track_connection(&vendor.name);

        let result = match resolved {
            Ok(resolved_url) => {
                self.transport
                    .call(TransportRequest {
                        method: request.method.clone(),
                        url: resolved_url,
                        headers,
                        body: payload,
                        timeout: Some(vendor.timeout),
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        let (status, bytes_received) = match result {
            Ok(response) => {
                debug!(
                    vendor = %vendor.name,
                    pool = %pool,
                    url = %url,
                    status_code = response.status,
                    "Request completed"
                );
                (OutcomeStatus::Status(response.status), response.body_bytes)
            }
            Err(e) => {
                error!(
                    vendor = %vendor.name,
                    pool = %pool,
                    url = %url,
                    error = %e,
                    error_category = %e.category.label(),
                    "Request failed"
                );
                (OutcomeStatus::Failed(e), 0)
            }
        };

        let outcome = RequestOutcome {
            vendor: vendor.name.clone(),
            pool,
            method: request.method.clone(),
            destination: request.destination.clone(),
            url,
            status,
            elapsed: start.elapsed(),
            bytes_sent,
            bytes_received,
            timestamp,
        };

        self.metrics.record(&outcome);
        self.stats.record(&outcome);
        drop(connection);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendor() -> Vendor {
        let mut auth_headers = HeaderMap::new();
        auth_headers.insert("x-api-key", HeaderValue::from_static("secret"));
        Vendor {
            name: "vendor-a".to_string(),
            base_url: "https://proxy-vendor-a.com".to_string(),
            pools: vec!["pool-1".to_string()],
            auth_headers,
            rate_limit: 10,
            timeout: Duration::from_secs(5),
            retry_count: 0,
        }
    }

    #[test]
    fn payload_has_requested_length() {
        let mut rng = rand::thread_rng();
        for size in [1, 50, 100, 1000, 10000] {
            assert_eq!(synthesize_payload(size, &mut rng).len(), size);
        }
        assert!(synthesize_payload(0, &mut rng).is_empty());
    }

    #[test]
    fn only_post_and_put_carry_payloads() {
        assert!(method_has_payload(&Method::POST));
        assert!(method_has_payload(&Method::PUT));
        assert!(!method_has_payload(&Method::GET));
        assert!(!method_has_payload(&Method::DELETE));
    }

    #[test]
    fn resolve_url_joins_absolute_paths() {
        let url = resolve_url("https://httpbin.org", "/status/200").unwrap();
        assert_eq!(url.as_str(), "https://httpbin.org/status/200");

        let url = resolve_url("https://example.com/base/", "/get").unwrap();
        assert_eq!(url.as_str(), "https://example.com/get");
    }

    #[test]
    fn resolve_url_rejects_bad_destinations() {
        let err = resolve_url("not a url", "/").unwrap_err();
        assert_eq!(err.category, ErrorCategory::OtherError);
    }

    #[test]
    fn headers_identify_vendor_and_pool() {
        let mut extra = HeaderMap::new();
        extra.insert("x-pattern", HeaderValue::from_static("burst"));
        extra.insert("x-proxy-pool", HeaderValue::from_static("overridden"));

        let headers = build_headers(&vendor(), "pool-1", &extra, &mut rand::thread_rng());

        assert_eq!(headers.get("x-api-key").unwrap(), "secret");
        assert_eq!(headers.get("x-proxy-vendor").unwrap(), "vendor-a");
        assert_eq!(headers.get("x-proxy-pool").unwrap(), "pool-1");
        assert_eq!(headers.get("x-pattern").unwrap(), "burst");
        assert_eq!(headers.get("x-request-id").unwrap().len(), 36);

        let ua = headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(ua.starts_with("Crawler-vendor-a-"), "user agent was {}", ua);
        let suffix: u32 = ua.rsplit('-').next().unwrap().parse().unwrap();
        assert!((1000..=9999).contains(&suffix));
    }

    #[test]
    fn status_labels() {
        assert_eq!(status_code_label(200), "200");
        assert_eq!(status_code_label(418), "418");
    }
}
