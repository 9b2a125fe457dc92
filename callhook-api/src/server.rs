use std::future::Future;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use callhook_common::auth::token_source;
use callhook_common::ledger::DedupLedger;
use callhook_common::metrics::setup_metrics_recorder;
use callhook_common::sheets::SheetsClient;
use callhook_common::store::{MemoryStore, TabularStore};
use callhook_common::time::{SystemTime, TimeSource};

use crate::config::{Config, PersistenceMode};
use crate::handlers::{app, AppState};
use crate::ingest::Ingestor;
use crate::janitor::LedgerJanitor;
use crate::queue::{BatchWriter, IngestQueue, WriterSettings};
use crate::realtime::{RealtimeCache, RealtimeRefresher};
use crate::reconcile::{ReconcileTables, Reconciler};
use crate::sink::{DirectSink, PersistenceSink, QueuedSink};

fn build_store(config: &Config) -> Result<Arc<dyn TabularStore + Send + Sync>> {
    if config.memory_store {
        warn!("using the in-memory store, nothing will be persisted remotely");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let tokens = token_source(
        config.google_credentials_json.as_deref(),
        config.sheets_access_token.as_deref(),
    )
    .wrap_err("failed to load store credentials")?;
    let client = SheetsClient::new(
        &config.sheets_api_url,
        config.spreadsheet_id()?,
        tokens,
        config.store_timeout.0,
    )
    .wrap_err("failed to build sheets client")?;

    Ok(Arc::new(client))
}

/// Wire every component, serve on `listener` until `shutdown` resolves, then stop the
/// background tasks, letting the batch writer flush what is still queued.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;

    let store = build_store(&config)?;
    serve_with_store(config, store, listener, shutdown).await
}

/// `serve` over an already built store.
pub async fn serve_with_store<F>(
    config: Config,
    store: Arc<dyn TabularStore + Send + Sync>,
    listener: TcpListener,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;

    let ledger = DedupLedger::new(&config.dedup_database_url)
        .await
        .wrap_err("failed to open dedup ledger")?;
    let timesource: Arc<dyn TimeSource + Send + Sync> = Arc::new(SystemTime {});
    let stop = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let sink: Arc<dyn PersistenceSink + Send + Sync> = match config.persistence_mode {
        PersistenceMode::Direct => Arc::new(DirectSink::new(
            store.clone(),
            &config.raw_table,
            config.header_timeout.0,
            config.append_timeout.0,
        )),
        PersistenceMode::Queued => {
            let queue = Arc::new(IngestQueue::new(
                config.queue_capacity,
                config.queue_overflow,
            ));
            let writer = Arc::new(BatchWriter::new(
                queue.clone(),
                store.clone(),
                WriterSettings {
                    table: config.raw_table.clone(),
                    batch_size: config.batch_size,
                    header_timeout: config.header_timeout.0,
                    append_timeout: config.append_timeout.0,
                },
            ));
            tasks.spawn(writer.run(
                config.flush_interval.0,
                config.failure_backoff.0,
                stop.clone(),
            ));
            Arc::new(QueuedSink::new(queue))
        }
    };

    let cache = Arc::new(RealtimeCache::new());
    let refresher = RealtimeRefresher::new(
        cache.clone(),
        store.clone(),
        &config.realtime_table,
        config.store_timeout.0,
    );
    tasks.spawn(refresher.run(config.realtime_refresh_interval.0, stop.clone()));

    if let Some(days) = config.dedup_retention_days {
        let janitor = LedgerJanitor::new(ledger.clone(), days, timesource.clone());
        tasks.spawn(janitor.run(config.dedup_janitor_interval.0, stop.clone()));
    }

    let reconciler = Reconciler::new(
        store,
        cache.clone(),
        config.campaigns.clone(),
        config.timestamp_ordering,
        ReconcileTables {
            events: config.raw_table.clone(),
            map: config.map_table.clone(),
            counts: config.counts_table.clone(),
        },
        config.store_timeout.0,
        timesource.clone(),
    );

    let metrics = if config.export_prometheus {
        match setup_metrics_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("failed to install metrics recorder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let state = AppState {
        ingestor: Arc::new(Ingestor::new(ledger.clone(), sink, timesource)),
        reconciler: Arc::new(reconciler),
        cache,
        campaigns: config.campaigns.clone(),
        store_configured: config.store_configured(),
    };

    info!(
        "listening on {:?} with {:?} persistence",
        listener.local_addr()?,
        config.persistence_mode
    );

    let server_stop = stop.clone();
    let served = axum::serve(listener, app(state, metrics))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown => {},
                _ = server_stop.cancelled() => {},
            }
        })
        .await;

    stop.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("background task failed: {}", e);
        }
    }
    ledger.close().await;
    info!("callhook api stopped");

    Ok(served?)
}
