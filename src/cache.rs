//! Two-tier run cache.
//!
//! Completed runs are immutable and cache well; live runs grow and must go
//! stale quickly. Two independent TTL+size-bounded maps encode that split -
//! no promotion logic, no invalidation API, the two TTLs bound the staleness
//! window on their own. A per-uid in-flight guard makes lookup-or-construct
//! atomic so concurrent readers of a cold run build it once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CatalogResult;
use crate::run::RunCore;

pub(crate) struct RunCache {
    complete: Cache<String, Arc<RunCore>>,
    live: Cache<String, Arc<RunCore>>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for RunCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCache")
            .field("complete", &self.complete.entry_count())
            .field("live", &self.live.entry_count())
            .finish()
    }
}

impl RunCache {
    pub(crate) fn new(ttl_complete: Duration, ttl_partial: Duration, capacity: u64) -> Self {
        Self {
            complete: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl_complete)
                .build(),
            live: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl_partial)
                .build(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Probe complete, then live; on miss, build under a per-uid guard and
    /// place the run into the tier matching its completion state.
    pub(crate) async fn get_or_build<F, Fut>(
        &self,
        uid: &str,
        build: F,
    ) -> CatalogResult<Arc<RunCore>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CatalogResult<Arc<RunCore>>>,
    {
        if let Some(core) = self.probe(uid) {
            return Ok(core);
        }

        let guard = Arc::clone(
            self.inflight
                .lock()
                .entry(uid.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );
        let _held = guard.lock().await;

        // Another caller may have finished the build while we waited.
        if let Some(core) = self.probe(uid) {
            self.inflight.lock().remove(uid);
            return Ok(core);
        }

        let result = build().await;
        if let Ok(core) = &result {
            if core.stop.is_some() {
                debug!(uid, "caching completed run");
                self.complete.insert(uid.to_string(), Arc::clone(core));
            } else {
                debug!(uid, "caching live run");
                self.live.insert(uid.to_string(), Arc::clone(core));
            }
        }
        self.inflight.lock().remove(uid);
        result
    }

    fn probe(&self, uid: &str) -> Option<Arc<RunCore>> {
        self.complete.get(uid).or_else(|| self.live.get(uid))
    }
}
