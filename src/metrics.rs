//! Prometheus instrumentation.
//!
//! Every application instance owns its own [`Registry`], so routers built in
//! tests never share counters. The HTTP middleware records request counts,
//! latency and in-flight requests per matched route. On Linux the registry
//! also carries the standard `process_*` collectors.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Route label used for requests that matched no route.
const UNMATCHED: &str = "unmatched";

/// Status recorded for requests dropped before a response existed.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    in_flight: IntGauge,
}

impl Metrics {
    /// Create and register all collectors. `environment` becomes the
    /// `config` label of `app_info`.
    pub fn new(version: &str, environment: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests handled"),
            &["method", "handler", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Time until response headers were produced",
            ),
            &["method", "handler"],
        )?;
        let in_flight = IntGauge::new(
            "http_requests_in_flight",
            "HTTP requests currently being handled",
        )?;
        let app_info = IntGaugeVec::new(
            Opts::new("app_info", "Application version and deployment"),
            &["version", "config"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(app_info.clone()))?;

        app_info.with_label_values(&[version, environment]).set(1);

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            in_flight,
        })
    }

    /// Render the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Content type of [`Metrics::encode`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    fn observe(&self, method: &str, handler: &str, status: u16, started: Instant) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[method, handler, status.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[method, handler])
            .observe(started.elapsed().as_secs_f64());
    }
}

/// Middleware recording count, latency and in-flight gauge per route.
///
/// For streamed bodies the latency covers the time to headers, not the
/// whole stream.
pub async fn track_http(
    State(metrics): State<Arc<Metrics>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let handler = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| UNMATCHED.to_owned());

    let mut guard = RequestGuard::start(&metrics, method, handler);
    let response = next.run(req).await;
    guard.status = Some(response.status().as_u16());
    response
}

/// Counts a request as in flight until dropped, then records it.
///
/// The handler future can be dropped mid-await when the client goes away;
/// the request is then recorded with [`CLIENT_CLOSED_REQUEST`].
struct RequestGuard<'a> {
    metrics: &'a Metrics,
    method: String,
    handler: String,
    started: Instant,
    status: Option<u16>,
}

impl<'a> RequestGuard<'a> {
    fn start(metrics: &'a Metrics, method: String, handler: String) -> Self {
        metrics.in_flight.inc();
        Self {
            metrics,
            method,
            handler,
            started: Instant::now(),
            status: None,
        }
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.dec();
        let status = self.status.unwrap_or(CLIENT_CLOSED_REQUEST);
        self.metrics
            .observe(&self.method, &self.handler, status, self.started);
    }
}
