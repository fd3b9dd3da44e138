//! Typed adapter over the document store.
//!
//! Wraps the raw [`DocStore`] trait with entity-aware lookups (transform
//! application, legacy-resource uid normalization), the keyset-paginated
//! [`ChunkedFind`] cursor, and the event-table aggregation the materializer
//! reads columns through. Metadata and asset collections may live on two
//! different store handles; behavior is identical either way.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::documents::{Datum, EventDescriptor, Resource, RunStart, RunStop, Transforms};
use crate::error::{CatalogError, CatalogResult};

use super::{CmpOp, Collection, DocStore, Filter, SortOrder, SortSpec, StoreCtx};

/// Internal find batch size for cursor iteration.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Byte ceiling targeted by one aggregation page, held safely below typical
/// per-document store limits (16 MB).
pub const TARGET_PAGE_BYTES: usize = 10 * 1024 * 1024;

/// Which per-event sub-dict a column read sources from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubDict {
    Data,
    Timestamps,
}

impl SubDict {
    pub fn field(&self) -> &'static str {
        match self {
            SubDict::Data => "data",
            SubDict::Timestamps => "timestamps",
        }
    }
}

/// Event rows for one stream slice, collapsed by `seq_num` and pushed into
/// per-column vectors. Rows are sorted by `seq_num`; gaps are the
/// materializer's concern.
#[derive(Debug, Clone, Default)]
pub struct EventTable {
    pub seq_nums: Vec<u64>,
    pub times: Vec<f64>,
    /// Column name to per-row raw values (`None` where the event lacks the
    /// column).
    pub columns: BTreeMap<String, Vec<Option<Value>>>,
    /// Column name to per-row filled flags (meaningful for external columns).
    pub filled: BTreeMap<String, Vec<bool>>,
}

#[derive(Debug, Clone)]
pub struct StoreAdapter {
    meta: Arc<dyn DocStore>,
    assets: Arc<dyn DocStore>,
    transforms: Arc<Transforms>,
    batch_size: usize,
    page_bytes: usize,
}

impl StoreAdapter {
    pub fn new(
        meta: Arc<dyn DocStore>,
        assets: Arc<dyn DocStore>,
        transforms: Arc<Transforms>,
    ) -> Self {
        Self {
            meta,
            assets,
            transforms,
            batch_size: DEFAULT_BATCH_SIZE,
            page_bytes: TARGET_PAGE_BYTES,
        }
    }

    /// Override the cursor batch size (tests exercise small batches).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Override the aggregation page byte target.
    pub fn with_page_bytes(mut self, page_bytes: usize) -> Self {
        self.page_bytes = page_bytes.max(1);
        self
    }

    fn store_for(&self, collection: Collection) -> &Arc<dyn DocStore> {
        match collection {
            Collection::Resource | Collection::Datum => &self.assets,
            _ => &self.meta,
        }
    }

    pub fn supports_text_search(&self) -> bool {
        self.meta.supports_text_search()
    }

    pub async fn run_start(&self, ctx: &StoreCtx, uid: &str) -> CatalogResult<RunStart> {
        let doc = self
            .meta
            .find_one(ctx, Collection::RunStart, &Filter::Eq("uid".into(), uid.into()))
            .await?
            .ok_or_else(|| CatalogError::RunNotFound(uid.to_string()))?;
        decode(Collection::RunStart, self.transforms.apply_start(doc))
    }

    pub async fn run_stop(&self, ctx: &StoreCtx, run_uid: &str) -> CatalogResult<Option<RunStop>> {
        let doc = self
            .meta
            .find_one(
                ctx,
                Collection::RunStop,
                &Filter::Eq("run_start".into(), run_uid.into()),
            )
            .await?;
        match doc {
            Some(doc) => Ok(Some(decode(
                Collection::RunStop,
                self.transforms.apply_stop(doc),
            )?)),
            None => Ok(None),
        }
    }

    /// All descriptors of a run, in time order.
    pub async fn descriptors(
        &self,
        ctx: &StoreCtx,
        run_uid: &str,
    ) -> CatalogResult<Vec<EventDescriptor>> {
        let sort = vec![("time".to_string(), SortOrder::Asc)];
        let docs = self
            .meta
            .find(
                ctx,
                Collection::EventDescriptor,
                &Filter::Eq("run_start".into(), run_uid.into()),
                &sort,
                0,
                None,
                None,
            )
            .await?;
        docs.into_iter()
            .map(|doc| decode(Collection::EventDescriptor, self.transforms.apply_descriptor(doc)))
            .collect()
    }

    /// Resource by uid, falling back to the legacy native primary key.
    ///
    /// Legacy records are surfaced as if `uid = str(_id)`.
    pub async fn resource(&self, ctx: &StoreCtx, uid: &str) -> CatalogResult<Resource> {
        let by_uid = self
            .assets
            .find_one(ctx, Collection::Resource, &Filter::Eq("uid".into(), uid.into()))
            .await?;
        let doc = match by_uid {
            Some(doc) => doc,
            None => self
                .assets
                .find_one(ctx, Collection::Resource, &Filter::Eq("_id".into(), uid.into()))
                .await?
                .ok_or_else(|| CatalogError::ResourceNotFound(uid.to_string()))?,
        };
        let mut resource: Resource =
            decode(Collection::Resource, self.transforms.apply_resource(doc))?;
        if resource.uid.is_empty() {
            resource.uid = uid.to_string();
        }
        Ok(resource)
    }

    pub async fn datum(&self, ctx: &StoreCtx, datum_id: &str) -> CatalogResult<Datum> {
        let doc = self
            .assets
            .find_one(
                ctx,
                Collection::Datum,
                &Filter::Eq("datum_id".into(), datum_id.into()),
            )
            .await?
            .ok_or_else(|| CatalogError::DatumNotFound(datum_id.to_string()))?;
        decode(Collection::Datum, doc)
    }

    /// Every datum of one resource, for prefetch.
    pub async fn datums_for_resource(
        &self,
        ctx: &StoreCtx,
        resource_uid: &str,
    ) -> CatalogResult<Vec<Datum>> {
        let sort = vec![("datum_id".to_string(), SortOrder::Asc)];
        let docs = self
            .assets
            .find(
                ctx,
                Collection::Datum,
                &Filter::Eq("resource".into(), resource_uid.into()),
                &sort,
                0,
                None,
                None,
            )
            .await?;
        docs.into_iter()
            .map(|doc| decode(Collection::Datum, doc))
            .collect()
    }

    /// Highest `seq_num` across the given descriptors, 0 when eventless.
    pub async fn max_seq_num(
        &self,
        ctx: &StoreCtx,
        descriptor_uids: &[String],
    ) -> CatalogResult<u64> {
        let sort = vec![("seq_num".to_string(), SortOrder::Desc)];
        let docs = self
            .meta
            .find(
                ctx,
                Collection::Event,
                &descriptor_filter(descriptor_uids),
                &sort,
                0,
                Some(1),
                Some(&["seq_num".to_string()]),
            )
            .await?;
        Ok(docs
            .first()
            .and_then(|doc| doc.get("seq_num"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// Estimated serialized size of one event row, from a sampled document.
    async fn estimate_row_bytes(
        &self,
        ctx: &StoreCtx,
        descriptor_uids: &[String],
    ) -> CatalogResult<usize> {
        let docs = self
            .meta
            .find(
                ctx,
                Collection::Event,
                &descriptor_filter(descriptor_uids),
                &vec![],
                0,
                Some(1),
                None,
            )
            .await?;
        Ok(docs
            .first()
            .map(|doc| doc.to_string().len())
            .unwrap_or(1)
            .max(1))
    }

    /// Column extraction over `seq_num ∈ [seq_min, seq_max)`.
    ///
    /// Pages the underlying find by a byte ceiling (boundaries computed up
    /// front), sorts by `time`, collapses duplicate `seq_num` keeping the
    /// latest, and re-sorts by `seq_num` into pushed per-column vectors.
    pub async fn event_table(
        &self,
        ctx: &StoreCtx,
        descriptor_uids: &[String],
        seq_min: u64,
        seq_max: u64,
        fields: &[String],
        sub: SubDict,
    ) -> CatalogResult<EventTable> {
        let mut table = EventTable::default();
        if seq_max <= seq_min || descriptor_uids.is_empty() {
            return Ok(table);
        }

        let row_bytes = self.estimate_row_bytes(ctx, descriptor_uids).await?;
        let rows_per_page = (self.page_bytes.div_ceil(row_bytes)).max(1) as u64;
        let boundaries: Vec<(u64, u64)> = {
            let mut pages = Vec::new();
            let mut lo = seq_min;
            while lo < seq_max {
                let hi = seq_max.min(lo + rows_per_page);
                pages.push((lo, hi));
                lo = hi;
            }
            pages
        };

        let mut projection: Vec<String> =
            vec!["seq_num".into(), "time".into(), "descriptor".into()];
        for field in fields {
            projection.push(format!("{}.{}", sub.field(), field));
            projection.push(format!("filled.{field}"));
        }
        let sort = vec![("time".to_string(), SortOrder::Asc)];

        // seq_num -> latest row; later inserts (greater time) win.
        let mut rows: BTreeMap<u64, Value> = BTreeMap::new();
        for (lo, hi) in boundaries {
            let filter = Filter::and(vec![
                descriptor_filter(descriptor_uids),
                Filter::Cmp {
                    field: "seq_num".into(),
                    op: CmpOp::Gte,
                    value: lo.into(),
                },
                Filter::Cmp {
                    field: "seq_num".into(),
                    op: CmpOp::Lt,
                    value: hi.into(),
                },
            ]);
            let docs = self
                .meta
                .find(ctx, Collection::Event, &filter, &sort, 0, None, Some(&projection))
                .await?;
            for doc in docs {
                if let Some(seq) = doc.get("seq_num").and_then(Value::as_u64) {
                    rows.insert(seq, doc);
                }
            }
        }

        for field in fields {
            table.columns.insert(field.clone(), Vec::with_capacity(rows.len()));
            table.filled.insert(field.clone(), Vec::with_capacity(rows.len()));
        }
        for (seq, doc) in rows {
            table.seq_nums.push(seq);
            table
                .times
                .push(doc.get("time").and_then(Value::as_f64).unwrap_or(f64::NAN));
            let section = doc.get(sub.field());
            let filled = doc.get("filled");
            for field in fields {
                let value = section.and_then(|s| s.get(field)).cloned();
                if let Some(column) = table.columns.get_mut(field) {
                    column.push(value);
                }
                let flag = filled
                    .and_then(|f| f.get(field))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if let Some(flags) = table.filled.get_mut(field) {
                    flags.push(flag);
                }
            }
        }
        Ok(table)
    }

    /// Lazy cursor over `collection` in `(user_sort, primary_key)` order with
    /// keyset continuation after the first batch.
    pub fn chunked_find(
        &self,
        collection: Collection,
        ctx: &StoreCtx,
        filter: Filter,
        user_sort: SortSpec,
        skip: usize,
        limit: Option<usize>,
    ) -> ChunkedFind {
        let mut sort = user_sort;
        sort.push((collection.primary_key().to_string(), SortOrder::Asc));
        ChunkedFind {
            store: Arc::clone(self.store_for(collection)),
            ctx: ctx.clone(),
            collection,
            base: filter,
            sort,
            batch_size: self.batch_size,
            skip,
            remaining: limit,
            buffer: VecDeque::new(),
            last_keys: None,
            exhausted: false,
        }
    }

    pub async fn count(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        filter: &Filter,
    ) -> CatalogResult<u64> {
        Ok(self.store_for(collection).count(ctx, collection, filter).await?)
    }
}

fn descriptor_filter(descriptor_uids: &[String]) -> Filter {
    Filter::In(
        "descriptor".into(),
        descriptor_uids.iter().map(|uid| Value::from(uid.as_str())).collect(),
    )
}

fn decode<T: DeserializeOwned>(collection: Collection, doc: Value) -> CatalogResult<T> {
    serde_json::from_value(doc).map_err(|source| CatalogError::MalformedDocument {
        collection: collection.name(),
        source,
    })
}

/// Batched cursor with keyset continuation.
///
/// The first batch honors `skip`; every later batch restarts the find from a
/// predicate built out of the last returned document's sort values, OR'd with
/// equality on those values plus strict inequality on the primary key. Under
/// concurrent insertion this never repeats or skips a pre-existing document.
pub struct ChunkedFind {
    store: Arc<dyn DocStore>,
    ctx: StoreCtx,
    collection: Collection,
    base: Filter,
    sort: SortSpec,
    batch_size: usize,
    skip: usize,
    remaining: Option<usize>,
    buffer: VecDeque<Value>,
    last_keys: Option<Vec<(String, SortOrder, Value)>>,
    exhausted: bool,
}

impl ChunkedFind {
    /// Next document, or `None` at the end of the result set.
    pub async fn next(&mut self) -> CatalogResult<Option<Value>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_batch().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Drain the cursor.
    pub async fn collect(mut self) -> CatalogResult<Vec<Value>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    async fn fetch_batch(&mut self) -> CatalogResult<()> {
        if matches!(self.remaining, Some(0)) {
            self.exhausted = true;
            return Ok(());
        }
        let (filter, skip) = match &self.last_keys {
            None => (self.base.clone(), self.skip),
            Some(keys) => (
                Filter::and(vec![self.base.clone(), keyset_predicate(keys)]),
                0,
            ),
        };
        let limit = match self.remaining {
            Some(remaining) => remaining.min(self.batch_size),
            None => self.batch_size,
        };
        let docs = self
            .store
            .find(&self.ctx, self.collection, &filter, &self.sort, skip, Some(limit), None)
            .await?;
        if docs.len() < limit {
            self.exhausted = true;
        }
        if let Some(last) = docs.last() {
            let null = Value::Null;
            self.last_keys = Some(
                self.sort
                    .iter()
                    .map(|(field, order)| {
                        let value = super::memory::lookup(last, field).unwrap_or(&null);
                        (field.clone(), *order, value.clone())
                    })
                    .collect(),
            );
        }
        if let Some(remaining) = &mut self.remaining {
            *remaining = remaining.saturating_sub(docs.len());
        }
        self.buffer.extend(docs);
        Ok(())
    }
}

/// Continuation predicate: strictly after the given sort-key values in the
/// composite order. The final term is the primary-key tiebreaker.
fn keyset_predicate(keys: &[(String, SortOrder, Value)]) -> Filter {
    let mut branches = Vec::with_capacity(keys.len());
    for (index, (field, order, value)) in keys.iter().enumerate() {
        let mut conjuncts: Vec<Filter> = keys[..index]
            .iter()
            .map(|(f, _, v)| Filter::Eq(f.clone(), v.clone()))
            .collect();
        let op = match order {
            SortOrder::Asc => CmpOp::Gt,
            SortOrder::Desc => CmpOp::Lt,
        };
        conjuncts.push(Filter::Cmp {
            field: field.clone(),
            op,
            value: value.clone(),
        });
        branches.push(Filter::and(conjuncts));
    }
    Filter::Or(branches)
}
