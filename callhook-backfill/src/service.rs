use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing, Router};
use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use callhook_common::auth::token_source;
use callhook_common::metrics;
use callhook_common::sheets::SheetsClient;
use callhook_common::store::TabularStore;
use callhook_common::time::{SystemTime, TimeSource};

use crate::config::Config;
use crate::poller::{PollSettings, Poller};
use crate::ringba::{CallSource, InsightsClient};

pub fn app(metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new().route("/", routing::get(index));

    metrics::add_metrics_route(router, metrics)
}

pub async fn index() -> &'static str {
    "callhook backfill"
}

fn build_store(config: &Config) -> Result<Arc<dyn TabularStore + Send + Sync>> {
    let tokens = token_source(
        config.google_credentials_json.as_deref(),
        config.sheets_access_token.as_deref(),
    )
    .wrap_err("failed to load store credentials")?;
    let client = SheetsClient::new(
        &config.sheets_api_url,
        config.spreadsheet.clone(),
        tokens,
        config.request_timeout.0,
    )
    .wrap_err("failed to build sheets client")?;

    Ok(Arc::new(client))
}

/// Poll until `shutdown` resolves while serving `/metrics` on `listener`.
pub async fn run<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;

    let store = build_store(&config)?;
    let source: Arc<dyn CallSource + Send + Sync> = Arc::new(
        InsightsClient::new(
            &config.ringba_api_url,
            config.ringba_account_id.as_str(),
            config.ringba_api_token.as_str(),
            config.request_timeout.0,
        )
        .wrap_err("failed to build ringba client")?,
    );
    let timesource: Arc<dyn TimeSource + Send + Sync> = Arc::new(SystemTime {});

    let poller = Poller::bootstrap(
        source,
        store,
        config.campaigns.clone(),
        timesource,
        PollSettings {
            table: config.sheet_name.clone(),
            lookback: Duration::from_secs(u64::from(config.lookback_hours) * 3600),
            resume_overlap: config.resume_overlap.0,
            window_overlap: config.window_overlap.0,
            store_timeout: config.request_timeout.0,
        },
    )
    .await
    .wrap_err("failed to read existing calls")?;

    let handle = match metrics::setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("failed to install metrics recorder: {}", e);
            None
        }
    };

    let stop = CancellationToken::new();
    let polling = tokio::spawn(poller.run(config.poll_interval.0, stop.clone()));

    info!(
        "backfill polling every {:?}, metrics on {:?}",
        config.poll_interval.0,
        listener.local_addr()?
    );

    let served = axum::serve(listener, app(handle))
        .with_graceful_shutdown(shutdown)
        .await;

    stop.cancel();
    if let Err(e) = polling.await {
        error!("backfill poller failed: {}", e);
    }
    info!("callhook backfill stopped");

    Ok(served?)
}
