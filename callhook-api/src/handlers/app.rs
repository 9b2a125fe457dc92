use std::sync::Arc;

use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use callhook_common::config::CampaignWhitelist;
use callhook_common::metrics;

use crate::ingest::Ingestor;
use crate::realtime::RealtimeCache;
use crate::reconcile::Reconciler;

use super::{admin, status, webhook};

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub reconciler: Arc<Reconciler>,
    pub cache: Arc<RealtimeCache>,
    pub campaigns: CampaignWhitelist,
    pub store_configured: bool,
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/ringba-webhook", routing::post(webhook::post))
        .route("/ringba-webhook1", routing::post(webhook::post))
        .route("/admin/refresh-map", routing::post(admin::refresh_map))
        .route("/healthz", routing::get(status::healthz))
        .route("/debug/stats", routing::get(status::debug_stats));

    metrics::add_metrics_route(router, metrics)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(metrics::track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "callhook api"
}
