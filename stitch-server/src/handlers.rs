use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use stitch_core::health::HealthRegistry;

/// The diagnostics surface: index, liveness, and (when a recorder is
/// installed) Prometheus metrics.
pub fn app(liveness: HealthRegistry, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.status())),
        );

    match metrics {
        Some(handle) => router.route(
            "/metrics",
            routing::get(move || std::future::ready(handle.render())),
        ),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "event stitcher"
}
