//! Single-flight routing map cache
//!
//! One entry per collection. The first caller to miss starts a build and
//! every concurrent caller awaits that same build instead of issuing its own
//! metadata request. A failed build is evicted so the next caller retries.
//!
//! ```text
//!   (absent) --resolve--> Pending{build_id} --ok--> Resolved(map)
//!                              |                        |
//!                              +--err--> (absent)       +--force_refresh--> Pending
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};

use crossfeed_core::{
    CollectionId, DiagnosticContext, MetadataLookupType, PartitionKeyRange, QueryRange, RoutingMap,
};

use crate::error::{ClientError, Result};
use crate::metrics;
use crate::transport::PartitionRangeSource;

type BuildResult = std::result::Result<Arc<RoutingMap>, Arc<ClientError>>;
type SharedBuild = Shared<BoxFuture<'static, BuildResult>>;
type EntryMap = Arc<Mutex<HashMap<CollectionId, CacheEntry>>>;

enum CacheEntry {
    Pending { build_id: u64, build: SharedBuild },
    Resolved(Arc<RoutingMap>),
}

/// Per-client cache of routing maps, keyed by collection
pub struct PartitionRoutingCache {
    source: Arc<dyn PartitionRangeSource>,
    entries: EntryMap,
    next_build_id: AtomicU64,
}

// The entry map is only touched in short synchronous sections, never across an await.
fn lock(
    entries: &Mutex<HashMap<CollectionId, CacheEntry>>,
) -> MutexGuard<'_, HashMap<CollectionId, CacheEntry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PartitionRoutingCache {
    pub fn new(source: Arc<dyn PartitionRangeSource>) -> Self {
        Self {
            source,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_build_id: AtomicU64::new(0),
        }
    }

    /// Routing map for `collection`, building it on first use
    pub async fn resolve(
        &self,
        collection: &CollectionId,
        force_refresh: bool,
    ) -> Result<Arc<RoutingMap>> {
        self.resolve_with_diagnostics(collection, force_refresh, &DiagnosticContext::new())
            .await
    }

    /// Like [`PartitionRoutingCache::resolve`], attributing metadata traffic
    ///
    /// Only the caller that starts a build has the build's calls merged into
    /// `diagnostics`, as partition key range lookups. Callers that join a
    /// build already in flight, or hit a resolved entry, record nothing.
    ///
    /// `force_refresh` replaces a resolved map. If a build is already in
    /// flight it is joined instead of starting another one.
    pub async fn resolve_with_diagnostics(
        &self,
        collection: &CollectionId,
        force_refresh: bool,
        diagnostics: &DiagnosticContext,
    ) -> Result<Arc<RoutingMap>> {
        let (build, initiated) = {
            let mut entries = lock(&self.entries);
            match entries.get(collection) {
                Some(CacheEntry::Resolved(map)) if !force_refresh => {
                    metrics::record_cache_lookup(metrics::CACHE_HIT);
                    return Ok(map.clone());
                }
                Some(CacheEntry::Pending { build, .. }) => {
                    metrics::record_cache_lookup(metrics::CACHE_JOINED);
                    (build.clone(), None)
                }
                _ => {
                    metrics::record_cache_lookup(metrics::CACHE_MISS);
                    let build_id = self.next_build_id.fetch_add(1, Ordering::Relaxed);
                    let child = Arc::new(DiagnosticContext::new());
                    let build = self.start_build(collection.clone(), build_id, child.clone());
                    entries.insert(
                        collection.clone(),
                        CacheEntry::Pending {
                            build_id,
                            build: build.clone(),
                        },
                    );
                    (build, Some(child))
                }
            }
        };

        let result = build.await;

        if let Some(child) = initiated {
            diagnostics.merge_diagnostics(&child, MetadataLookupType::PartitionKeyRangeLookUp);
        }

        result.map_err(|source| ClientError::RoutingMapBuild {
            collection_id: collection.to_string(),
            source,
        })
    }

    fn start_build(
        &self,
        collection: CollectionId,
        build_id: u64,
        child: Arc<DiagnosticContext>,
    ) -> SharedBuild {
        let source = Arc::clone(&self.source);
        let entries = Arc::clone(&self.entries);

        async move {
            let started = Instant::now();
            tracing::debug!(collection = %collection, build_id, "Building routing map");

            let result = source
                .list_partition_ranges(&collection, &child)
                .await
                .and_then(|ranges| {
                    RoutingMap::try_new(collection.clone(), ranges).map_err(ClientError::from)
                });

            let mut entries = lock(&entries);
            let still_current = matches!(
                entries.get(&collection),
                Some(CacheEntry::Pending { build_id: id, .. }) if *id == build_id
            );

            match result {
                Ok(map) => {
                    let map = Arc::new(map);
                    if still_current {
                        entries.insert(collection.clone(), CacheEntry::Resolved(map.clone()));
                    }
                    metrics::record_routing_build(metrics::STATUS_OK, started.elapsed());
                    tracing::info!(
                        collection = %collection,
                        ranges = map.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Routing map built"
                    );
                    Ok(map)
                }
                Err(e) => {
                    if still_current {
                        entries.remove(&collection);
                    }
                    metrics::record_routing_build(metrics::STATUS_ERROR, started.elapsed());
                    tracing::warn!(
                        collection = %collection,
                        error = %e,
                        "Routing map build failed"
                    );
                    Err(Arc::new(e))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Ranges of `collection` intersecting `query`, in ascending order
    pub async fn overlapping(
        &self,
        collection: &CollectionId,
        query: &QueryRange,
        force_refresh: bool,
    ) -> Result<Vec<PartitionKeyRange>> {
        self.overlapping_ranges(collection, std::slice::from_ref(query), force_refresh)
            .await
    }

    /// Deduplicated union of the ranges intersecting any of `queries`
    pub async fn overlapping_ranges(
        &self,
        collection: &CollectionId,
        queries: &[QueryRange],
        force_refresh: bool,
    ) -> Result<Vec<PartitionKeyRange>> {
        for query in queries {
            query.validate()?;
        }
        let map = self.resolve(collection, force_refresh).await?;
        Ok(map.overlapping_many(queries).into_iter().cloned().collect())
    }

    /// Drop the resolved map for `collection`; a build in flight is left alone
    pub fn invalidate(&self, collection: &CollectionId) -> bool {
        let mut entries = lock(&self.entries);
        if matches!(entries.get(collection), Some(CacheEntry::Resolved(_))) {
            entries.remove(collection);
            true
        } else {
            false
        }
    }

    /// Resolved map for `collection`, without building
    pub fn cached(&self, collection: &CollectionId) -> Option<Arc<RoutingMap>> {
        match lock(&self.entries).get(collection) {
            Some(CacheEntry::Resolved(map)) => Some(map.clone()),
            _ => None,
        }
    }

    /// Whether a build for `collection` is in flight
    pub fn is_pending(&self, collection: &CollectionId) -> bool {
        matches!(lock(&self.entries).get(collection), Some(CacheEntry::Pending { .. }))
    }
}
