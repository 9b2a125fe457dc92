use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use callhook_common::ledger::{DedupLedger, LedgerResult};
use callhook_common::time::TimeSource;

/// Forgets dedup records older than the retention window.
pub struct LedgerJanitor {
    ledger: DedupLedger,
    retention: chrono::Duration,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl LedgerJanitor {
    pub fn new(
        ledger: DedupLedger,
        retention_days: u32,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            ledger,
            retention: chrono::Duration::days(i64::from(retention_days)),
            timesource,
        }
    }

    pub async fn cleanup(&self) -> LedgerResult<u64> {
        let cutoff = self.timesource.now() - self.retention;
        let removed = self.ledger.prune_before(cutoff).await?;
        if removed > 0 {
            info!(removed, %cutoff, "pruned dedup ledger");
        }

        Ok(removed)
    }

    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.cleanup().await {
                error!("failed to prune dedup ledger: {}", e);
            }
        }
    }
}
