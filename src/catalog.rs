//! The searchable run catalog.
//!
//! A `Catalog` is an immutable view onto the run index: `search` appends a
//! query conjunct and returns a new catalog, `sort_by` replaces the sort
//! order, and `authenticated_as` rebinds the view through the access policy.
//! Iteration, counting, uid and scan-id indexing, and positional paging all
//! compose the accumulated conjuncts and delegate to the keyset-paginated
//! `chunked_find` cursor, so results stay stable under concurrent writers.
//! Run construction is short-circuited by the two-tier run cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::access::{AccessPolicy, Identity};
use crate::cache::RunCache;
use crate::config::CatalogSettings;
use crate::documents::Transforms;
use crate::error::{CatalogError, CatalogResult};
use crate::filler::HandlerRegistry;
use crate::query::{Query, QueryRegistry};
use crate::run::{Run, RunCore, RunOptions};
use crate::store::{
    open_store, ChunkedFind, Collection, DocStore, Filter, SortOrder, SortSpec, StoreAdapter,
    StoreCtx,
};

/// Top-level, searchable catalog of runs.
#[derive(Clone)]
pub struct Catalog {
    adapter: StoreAdapter,
    query_registry: Arc<QueryRegistry>,
    handler_registry: Arc<HandlerRegistry>,
    root_map: Arc<BTreeMap<String, String>>,
    run_cache: Arc<RunCache>,
    options: RunOptions,
    policy: Option<Arc<dyn AccessPolicy>>,
    queries: Vec<Query>,
    sort: SortSpec,
    ctx: StoreCtx,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("queries", &self.queries.len())
            .field("sort", &self.sort)
            .finish()
    }
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Catalog over the stores named by `settings`, with default registries.
    pub fn from_settings(settings: CatalogSettings) -> CatalogResult<Self> {
        Self::builder().settings(settings).build()
    }

    /// Narrow the catalog with one more query conjunct.
    pub fn search(&self, query: Query) -> Catalog {
        let mut narrowed = self.clone();
        narrowed.queries.push(query);
        narrowed
    }

    /// Replace the sort order (default `[(time, asc)]`).
    pub fn sort_by(&self, sort: SortSpec) -> Catalog {
        let mut sorted = self.clone();
        sorted.sort = sort;
        sorted
    }

    /// The accumulated query conjuncts.
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Bind a deadline for every store call made through this catalog.
    pub fn with_deadline(&self, deadline: Instant) -> Catalog {
        let mut bounded = self.clone();
        bounded.ctx.deadline = Some(deadline);
        bounded
    }

    /// Bind a cancellation token for every store call made through this
    /// catalog.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Catalog {
        let mut bounded = self.clone();
        bounded.ctx.cancel = cancel;
        bounded
    }

    /// Rebind the catalog through the access policy for `identity`.
    ///
    /// The `Admin` sentinel bypasses query modification.
    pub fn authenticated_as(&self, identity: &Identity) -> CatalogResult<Catalog> {
        let Some(policy) = &self.policy else {
            return Ok(self.clone());
        };
        if !policy.check_compatibility(self) {
            return Err(CatalogError::Configuration(
                "access policy is not compatible with this catalog".into(),
            ));
        }
        if *identity == Identity::Admin {
            return Ok(self.clone());
        }
        let mut bound = self.clone();
        bound.queries = policy.modify_queries(&self.queries, identity)?;
        Ok(bound)
    }

    /// Translate the accumulated conjuncts. Text queries against stores
    /// without native search fall out into client-side scan needles.
    fn composed(&self) -> CatalogResult<(Filter, Vec<String>)> {
        let mut conjuncts = Vec::with_capacity(self.queries.len());
        let mut scans = Vec::new();
        for query in &self.queries {
            let filter = self.query_registry.translate(query)?;
            match filter {
                Filter::Text(needle) if !self.adapter.supports_text_search() => {
                    scans.push(needle);
                }
                other => conjuncts.push(other),
            }
        }
        Ok((Filter::and(conjuncts), scans))
    }

    fn start_cursor(&self, skip: usize, limit: Option<usize>) -> CatalogResult<(ChunkedFind, Vec<String>)> {
        let (filter, scans) = self.composed()?;
        // Positional windows only push down to the store when no client-side
        // scan sits between it and the result set.
        let cursor = self.adapter.chunked_find(
            Collection::RunStart,
            &self.ctx,
            filter,
            self.sort.clone(),
            if scans.is_empty() { skip } else { 0 },
            if scans.is_empty() { limit } else { None },
        );
        Ok((cursor, scans))
    }

    /// Number of runs matching the accumulated conjuncts.
    pub async fn len(&self) -> CatalogResult<u64> {
        let (filter, scans) = self.composed()?;
        if scans.is_empty() {
            return self.adapter.count(&self.ctx, Collection::RunStart, &filter).await;
        }
        let mut cursor =
            self.adapter
                .chunked_find(Collection::RunStart, &self.ctx, filter, vec![], 0, None);
        let mut count = 0;
        while let Some(doc) = cursor.next().await? {
            if text_matches(&doc, &scans) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn is_empty(&self) -> CatalogResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Matching run uids, in sort order.
    pub async fn uids(&self) -> CatalogResult<Vec<String>> {
        let (mut cursor, scans) = self.start_cursor(0, None)?;
        let mut uids = Vec::new();
        while let Some(doc) = cursor.next().await? {
            if !text_matches(&doc, &scans) {
                continue;
            }
            if let Some(uid) = doc.get("uid").and_then(Value::as_str) {
                uids.push(uid.to_string());
            }
        }
        Ok(uids)
    }

    /// Cursor over matching runs, in sort order.
    pub fn runs(&self) -> CatalogResult<RunCursor> {
        let (cursor, scans) = self.start_cursor(0, None)?;
        Ok(RunCursor {
            catalog: self.clone(),
            cursor,
            scans,
        })
    }

    /// Positional slice of the result set.
    pub async fn page(&self, offset: usize, limit: usize) -> CatalogResult<Vec<Run>> {
        let (mut cursor, scans) = self.start_cursor(offset, Some(limit))?;
        let mut runs = Vec::new();
        let mut skipped = 0;
        while let Some(doc) = cursor.next().await? {
            if !text_matches(&doc, &scans) {
                continue;
            }
            if !scans.is_empty() && skipped < offset {
                skipped += 1;
                continue;
            }
            if let Some(uid) = doc.get("uid").and_then(Value::as_str) {
                runs.push(self.fetch_run(uid).await?);
            }
            if runs.len() >= limit {
                break;
            }
        }
        Ok(runs)
    }

    /// Run by uid, honoring the accumulated conjuncts.
    pub async fn get(&self, uid: &str) -> CatalogResult<Run> {
        if !self.queries.is_empty() {
            let (filter, scans) = self.composed()?;
            let member = Filter::and(vec![filter, Filter::Eq("uid".into(), uid.into())]);
            let doc = self
                .adapter
                .chunked_find(Collection::RunStart, &self.ctx, member, vec![], 0, Some(1))
                .next()
                .await?;
            match doc {
                Some(doc) if text_matches(&doc, &scans) => {}
                _ => return Err(CatalogError::RunNotFound(uid.to_string())),
            }
        }
        self.fetch_run(uid).await
    }

    /// Newest run carrying `scan_id`.
    pub async fn get_by_scan_id(&self, scan_id: i64) -> CatalogResult<Run> {
        let (filter, scans) = self.composed()?;
        let member = Filter::and(vec![filter, Filter::Eq("scan_id".into(), scan_id.into())]);
        let sort = vec![("time".to_string(), SortOrder::Desc)];
        let mut cursor =
            self.adapter
                .chunked_find(Collection::RunStart, &self.ctx, member, sort, 0, None);
        while let Some(doc) = cursor.next().await? {
            if !text_matches(&doc, &scans) {
                continue;
            }
            if let Some(uid) = doc.get("uid").and_then(Value::as_str) {
                return self.fetch_run(uid).await;
            }
        }
        Err(CatalogError::RunNotFound(format!("scan_id={scan_id}")))
    }

    /// Build or recall one run, bypassing membership checks.
    async fn fetch_run(&self, uid: &str) -> CatalogResult<Run> {
        let adapter = self.adapter.clone();
        let handlers = self.handler_registry.snapshot();
        let root_map = Arc::clone(&self.root_map);
        let options = self.options.clone();
        let ctx = self.ctx.clone();
        let uid_owned = uid.to_string();
        let core = self
            .run_cache
            .get_or_build(uid, move || async move {
                RunCore::load(&ctx, adapter, &uid_owned, handlers, root_map, options)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(Run::from_core(core))
    }

    /// The store context bound to this catalog.
    pub fn ctx(&self) -> &StoreCtx {
        &self.ctx
    }
}

/// Async cursor over a catalog's matching runs.
pub struct RunCursor {
    catalog: Catalog,
    cursor: ChunkedFind,
    scans: Vec<String>,
}

impl RunCursor {
    pub async fn next(&mut self) -> CatalogResult<Option<Run>> {
        while let Some(doc) = self.cursor.next().await? {
            if !text_matches(&doc, &self.scans) {
                continue;
            }
            if let Some(uid) = doc.get("uid").and_then(Value::as_str) {
                return Ok(Some(self.catalog.fetch_run(uid).await?));
            }
        }
        Ok(None)
    }

    pub async fn collect(mut self) -> CatalogResult<Vec<Run>> {
        let mut runs = Vec::new();
        while let Some(run) = self.next().await? {
            runs.push(run);
        }
        Ok(runs)
    }
}

fn text_matches(doc: &Value, needles: &[String]) -> bool {
    if needles.is_empty() {
        return true;
    }
    let haystack = doc.to_string().to_lowercase();
    needles
        .iter()
        .all(|needle| haystack.contains(&needle.to_lowercase()))
}

/// Wires stores, registries, and policies into a [`Catalog`].
pub struct CatalogBuilder {
    settings: CatalogSettings,
    meta: Option<Arc<dyn DocStore>>,
    assets: Option<Arc<dyn DocStore>>,
    handler_registry: Arc<HandlerRegistry>,
    transforms: Transforms,
    query_registry: QueryRegistry,
    policy: Option<Arc<dyn AccessPolicy>>,
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self {
            settings: CatalogSettings::default(),
            meta: None,
            assets: None,
            handler_registry: Arc::new(HandlerRegistry::with_defaults()),
            transforms: Transforms::default(),
            query_registry: QueryRegistry::with_builtins(),
            policy: None,
        }
    }
}

impl CatalogBuilder {
    pub fn settings(mut self, settings: CatalogSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use an already-open metadata store instead of `store_uri`.
    pub fn store(mut self, store: Arc<dyn DocStore>) -> Self {
        self.meta = Some(store);
        self
    }

    /// Use an already-open asset store instead of `asset_store_uri`.
    pub fn asset_store(mut self, store: Arc<dyn DocStore>) -> Self {
        self.assets = Some(store);
        self
    }

    pub fn handler_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.handler_registry = registry;
        self
    }

    pub fn transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn query_registry(mut self, registry: QueryRegistry) -> Self {
        self.query_registry = registry;
        self
    }

    pub fn access_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> CatalogResult<Catalog> {
        self.settings.validate()?;
        let meta = match self.meta {
            Some(store) => store,
            None => open_store(&self.settings.store_uri)?,
        };
        let assets = match self.assets {
            Some(store) => store,
            None => match &self.settings.asset_store_uri {
                Some(uri) => open_store(uri)?,
                None => Arc::clone(&meta),
            },
        };
        let adapter = StoreAdapter::new(meta, assets, Arc::new(self.transforms));
        let options = RunOptions {
            chunk_byte_limit: self.settings.chunk_byte_limit,
            frames_per_chunk: self.settings.area_detector_frames_per_chunk,
            ttl_complete: self.settings.cache_ttl_complete,
            ttl_partial: self.settings.cache_ttl_partial,
        };
        let run_cache = Arc::new(RunCache::new(
            self.settings.cache_ttl_complete,
            self.settings.cache_ttl_partial,
            self.settings.cache_size,
        ));
        Ok(Catalog {
            adapter,
            query_registry: Arc::new(self.query_registry),
            handler_registry: self.handler_registry,
            root_map: Arc::new(self.settings.root_map.clone()),
            run_cache,
            options,
            policy: self.policy,
            queries: Vec::new(),
            sort: vec![("time".to_string(), SortOrder::Asc)],
            ctx: StoreCtx::unbounded(),
        })
    }
}
