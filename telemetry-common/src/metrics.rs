//! Prometheus exposition for the worker's HTTP surface.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Histogram buckets in seconds. Store writes land in the low milliseconds,
/// deletes and checkpoints take up to several seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Serve `router` on `bind` until `shutdown` fires.
pub async fn serve(router: Router, bind: &str, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Mount `/metrics` on `router` and time every request it serves. Installs the
/// global recorder, so call it once, after every other route is added.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = install_recorder();
    router
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(middleware::from_fn(record_request))
}

fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)
        .expect("latency buckets are not empty")
        .install_recorder()
        .expect("prometheus recorder installed twice")
}

async fn record_request(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    // Matched routes keep label cardinality bounded, unknown paths fall back to the raw path.
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    let response = next.run(req).await;

    let labels = [
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
