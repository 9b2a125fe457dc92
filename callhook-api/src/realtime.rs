use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use callhook_common::normalize::canonical_did;
use callhook_common::store::{with_timeout, StoreError, TabularStore};

/// The DIDs currently eligible for reconciliation.
///
/// Readers take an immutable snapshot; a refresh builds a whole new set and swaps the
/// pointer, so nobody ever sees a half-built set.
#[derive(Default)]
pub struct RealtimeCache {
    dids: RwLock<Arc<HashSet<String>>>,
}

impl RealtimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        self.dids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, did: &str) -> bool {
        self.snapshot().contains(did)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn replace(&self, dids: HashSet<String>) {
        let fresh = Arc::new(dids);
        metrics::gauge!("callhook_realtime_dids").set(fresh.len() as f64);
        *self.dids.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }
}

/// Keeps a `RealtimeCache` in sync with the curated realtime table.
pub struct RealtimeRefresher {
    cache: Arc<RealtimeCache>,
    store: Arc<dyn TabularStore + Send + Sync>,
    table: String,
    timeout: Duration,
}

impl RealtimeRefresher {
    pub fn new(
        cache: Arc<RealtimeCache>,
        store: Arc<dyn TabularStore + Send + Sync>,
        table: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            table: table.to_owned(),
            timeout,
        }
    }

    /// Reload the cache from the first column of the table, skipping its header.
    /// An empty table leaves the current contents alone. Returns the cache size after the
    /// refresh.
    pub async fn refresh_once(&self) -> Result<usize, StoreError> {
        let table = self.table.as_str();
        let rows = with_timeout("read", table, self.timeout, self.store.read_rows(table)).await?;

        let dids: HashSet<String> = rows
            .iter()
            .skip(1)
            .filter_map(|row| row.first())
            .map(|cell| canonical_did(cell))
            .filter(|did| !did.is_empty())
            .collect();

        if dids.is_empty() {
            warn!(table, "realtime table has no DIDs, keeping previous cache");
            return Ok(self.cache.len());
        }

        let count = dids.len();
        self.cache.replace(dids);
        info!(table, dids = count, "refreshed realtime DID cache");

        Ok(count)
    }

    /// Refresh immediately, then on every tick until `shutdown` fires. Failures keep the
    /// previous cache and are retried on the next tick.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.refresh_once().await {
                error!("failed to refresh realtime DIDs: {}", e);
            }
        }

        info!("realtime refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callhook_common::store::MemoryStore;

    fn refresher(store: MemoryStore, cache: Arc<RealtimeCache>) -> RealtimeRefresher {
        RealtimeRefresher::new(cache, Arc::new(store), "Real Time", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn loads_first_column_without_header() {
        let store = MemoryStore::new().with_table(
            "Real Time",
            vec![
                vec!["did", "notes"],
                vec!["(555) 123-4567", "x"],
                vec!["+1 555 765 4321"],
                vec![""],
                vec![],
            ],
        );
        let cache = Arc::new(RealtimeCache::new());

        assert_eq!(refresher(store, cache.clone()).refresh_once().await.unwrap(), 2);
        assert!(cache.contains("5551234567"));
        assert!(cache.contains("5557654321"));
        assert!(!cache.contains("did"));
    }

    #[tokio::test]
    async fn empty_table_keeps_previous_contents() {
        let cache = Arc::new(RealtimeCache::new());
        cache.replace(HashSet::from(["5551234567".to_owned()]));

        let store = MemoryStore::new().with_table("Real Time", vec![vec!["did"]]);
        refresher(store, cache.clone()).refresh_once().await.unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.contains("5551234567"));
    }

    #[tokio::test]
    async fn refresh_swaps_whole_set() {
        let cache = Arc::new(RealtimeCache::new());
        cache.replace(HashSet::from(["1111111111".to_owned()]));
        let before = cache.snapshot();

        let store = MemoryStore::new().with_table("Real Time", vec![vec!["did"], vec!["2222222222"]]);
        refresher(store, cache.clone()).refresh_once().await.unwrap();

        // A snapshot taken earlier is unaffected by the swap.
        assert!(before.contains("1111111111"));
        assert!(!cache.contains("1111111111"));
        assert!(cache.contains("2222222222"));
    }
}
