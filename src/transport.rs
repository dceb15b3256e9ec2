//! Outbound call seam.
//!
//! The executor only needs "send this, tell me the status and how many bytes
//! came back". [`ReqwestTransport`] is the production implementation; tests
//! plug in stubs that succeed, fail, or stall on demand.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use std::time::Duration;

use crate::errors::TransportError;

/// One fully-resolved outbound request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
}

/// What came back from a call that produced a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body_bytes: u64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs the call and drains the response body.
    async fn call(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Transport backed by a shared reqwest client and its connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn call(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await?;
        let status = response.status().as_u16();

        // Stream and discard the body so large responses are never buffered whole.
        let mut body_bytes = 0u64;
        while let Some(chunk) = response.chunk().await? {
            body_bytes += chunk.len() as u64;
        }

        Ok(TransportResponse { status, body_bytes })
    }
}
