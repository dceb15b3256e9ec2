//! HTTP exposure server: `/metrics`, `/health` and `/stats`.

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::metrics::Metrics;
use crate::stats::{RunStatistics, StatsReport};

struct ServerState {
    metrics: Arc<Metrics>,
    stats: Arc<RunStatistics>,
}

/// A bound but not yet serving exposure server.
pub struct ExposureServer {
    incoming: AddrIncoming,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
}

impl ExposureServer {
    /// Binds the listening socket. Port 0 picks a free port.
    pub fn bind(
        addr: SocketAddr,
        metrics: Arc<Metrics>,
        stats: Arc<RunStatistics>,
    ) -> Result<Self, hyper::Error> {
        let incoming = AddrIncoming::bind(&addr)?;
        let local_addr = incoming.local_addr();
        Ok(Self {
            incoming,
            local_addr,
            state: Arc::new(ServerState { metrics, stats }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves requests until `shutdown` resolves, then drains open connections.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.state;
        let make_svc = make_service_fn(move |_conn| {
            let state = Arc::clone(&state);
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { handle(req, state).await }
                }))
            }
        });

        let addr = self.local_addr;
        let server = Server::builder(self.incoming)
            .serve(make_svc)
            .with_graceful_shutdown(shutdown);
        info!(addr = %addr, "Exposure server listening");

        if let Err(e) = server.await {
            error!(error = %e, "Exposure server error");
        }
        info!(addr = %addr, "Exposure server stopped");
    }
}

async fn handle(req: Request<Body>, state: Arc<ServerState>) -> Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => metrics_response(&state.metrics),
        (&Method::GET, "/health") => json_response(&state.stats.health()),
        (&Method::GET, "/stats") => {
            json_response(&StatsReport::build(&state.stats, state.metrics.snapshot()))
        }
        _ => status_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

fn metrics_response(metrics: &Metrics) -> Response<Body> {
    match metrics.render() {
        Ok(text) => {
            let mut response = Response::new(Body::from(text));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
        }
    }
}

fn json_response<T: Serialize>(document: &T) -> Response<Body> {
    match serde_json::to_vec(document) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize response document");
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

fn status_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}
