use axum::{routing::get, Router};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use monitor_common::metrics::add_metrics_route;
use std::future::ready;

pub fn app(liveness: HealthRegistry, recorder: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    match recorder {
        Some(recorder) => add_metrics_route(router, recorder),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "ws-monitor"
}
