//! Failure classification for outbound proxy requests.
//!
//! Non-2xx/3xx statuses and transport faults both map to an [`ErrorCategory`],
//! exported per vendor as `requests_errors_by_category_total`.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 4xx status, redirect loops, unbuildable requests.
    ClientError,
    /// 5xx status.
    ServerError,
    /// DNS, refused or reset connections, truncated bodies.
    NetworkError,
    TimeoutError,
    /// Certificate or handshake failure.
    TlsError,
    OtherError,
}

impl ErrorCategory {
    /// `None` for statuses in `[200, 400)`.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(Self::ClientError),
            500..=599 => Some(Self::ServerError),
            _ => Some(Self::OtherError),
        }
    }

    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::TimeoutError;
        }
        if error.is_builder() || error.is_redirect() {
            return Self::ClientError;
        }

        // Handshake failures surface as connect errors; the message tells them apart.
        let by_message = Self::from_message(&error.to_string());
        if by_message == Self::TlsError {
            return by_message;
        }
        if error.is_connect() || error.is_request() || error.is_body() || error.is_decode() {
            return Self::NetworkError;
        }
        by_message
    }

    /// Best-effort classification from an error message.
    pub fn from_message(message: &str) -> Self {
        let message = message.to_lowercase();
        let mentions = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

        if mentions(&["certificate", "tls", "ssl", "handshake"]) {
            Self::TlsError
        } else if mentions(&["timeout", "timed out", "deadline"]) {
            Self::TimeoutError
        } else if mentions(&["dns", "resolve", "connect", "connection", "reset", "broken pipe"]) {
            Self::NetworkError
        } else {
            Self::OtherError
        }
    }

    /// Value of the `category` metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::TimeoutError => "timeout_error",
            Self::TlsError => "tls_error",
            Self::OtherError => "other_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A failed outbound call.
///
/// Covers everything between building the request and reading the last body
/// chunk: bad URLs, DNS failures, resets, timeouts.
#[derive(Debug, Clone, Error)]
#[error("[{category}] {message}")]
pub struct TransportError {
    pub category: ErrorCategory,
    pub message: String,
}

impl TransportError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        Self::new(ErrorCategory::from_reqwest_error(&error), error.to_string())
    }
}
