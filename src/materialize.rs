//! Column materialization: descriptors to typed n-dimensional datasets.
//!
//! A [`Materializer`] is bound to one stream view (`data` or `timestamps`) at
//! instantiation time, freezing the stream's cutoff `seq_num`. It builds the
//! dataset schema from the representative descriptor, executes the paged
//! event-table extraction, coerces rows to the declared element types, and
//! stacks them into arrays - whole-dataset, per-column, or per-block.
//!
//! Two reads through the same materializer see the same snapshot length; a
//! live run grows only across materializer instantiations.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::array::{
    self, stack_rows, ColumnData, DataArray, Dataset, Dtype, RowValue,
};
use crate::chunking::{self, block_bounds, plan_chunks};
use crate::documents::{DataKey, DtypeKind, EventDescriptor};
use crate::error::{CatalogError, CatalogResult};
use crate::filler::Filler;
use crate::store::{EventTable, StoreAdapter, StoreCtx, SubDict};

/// Memoization capacity for the time coordinate and inner column fetches.
const MEMO_CAPACITY: usize = 1024;

/// Schema of one materialized column.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    /// `["time", ...]`; generated axis names share one counter across the
    /// dataset.
    pub dims: Vec<String>,
    /// Full shape including the leading time axis.
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    /// Per-axis chunk partition over `shape`.
    pub chunks: Vec<Vec<usize>>,
    pub object: Option<String>,
    pub units: Option<String>,
    pub external: bool,
}

/// Schema of a whole stream view.
#[derive(Debug, Clone)]
pub struct DatasetSchema {
    /// Row count: `cutoff_seq_num - 1`.
    pub length: usize,
    pub columns: BTreeMap<String, ColumnSchema>,
}

struct Memo {
    time: LruCache<(u64, u64), Arc<Vec<f64>>>,
    tables: LruCache<(Vec<String>, u64, u64), Arc<EventTable>>,
}

/// Materializes one stream view into typed arrays.
pub struct Materializer {
    adapter: StoreAdapter,
    filler: Arc<Filler>,
    run_uid: String,
    stream: String,
    descriptor: EventDescriptor,
    descriptor_uids: Vec<String>,
    /// `1 + max(seq_num)` at instantiation.
    cutoff: u64,
    sub: SubDict,
    chunk_byte_limit: usize,
    frames_per_chunk: usize,
    schema: OnceCell<DatasetSchema>,
    memo: Mutex<Memo>,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("run_uid", &self.run_uid)
            .field("stream", &self.stream)
            .field("sub", &self.sub)
            .field("cutoff", &self.cutoff)
            .finish()
    }
}

impl Materializer {
    /// Bind a materializer to a stream, freezing its cutoff.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn bind(
        ctx: &StoreCtx,
        adapter: StoreAdapter,
        filler: Arc<Filler>,
        run_uid: String,
        stream: String,
        descriptors: &[EventDescriptor],
        sub: SubDict,
        chunk_byte_limit: usize,
        frames_per_chunk: usize,
    ) -> CatalogResult<Self> {
        let descriptor = descriptors
            .first()
            .cloned()
            .ok_or_else(|| CatalogError::StreamNotFound {
                run_uid: run_uid.clone(),
                stream: stream.clone(),
            })?;
        let descriptor_uids: Vec<String> =
            descriptors.iter().map(|d| d.uid.clone()).collect();
        let cutoff = adapter.max_seq_num(ctx, &descriptor_uids).await? + 1;
        Ok(Self {
            adapter,
            filler,
            run_uid,
            stream,
            descriptor,
            descriptor_uids,
            cutoff,
            sub,
            chunk_byte_limit,
            frames_per_chunk,
            schema: OnceCell::new(),
            memo: Mutex::new(Memo {
                time: LruCache::new(NonZeroUsize::new(MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
                tables: LruCache::new(NonZeroUsize::new(MEMO_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
            }),
        })
    }

    /// Row count of this snapshot.
    pub fn len(&self) -> usize {
        (self.cutoff - 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cutoff <= 1
    }

    /// The frozen cutoff `seq_num`.
    pub fn cutoff_seq_num(&self) -> u64 {
        self.cutoff
    }

    /// Dataset schema, built once per materializer.
    pub async fn schema(&self, ctx: &StoreCtx) -> CatalogResult<&DatasetSchema> {
        self.schema
            .get_or_try_init(|| self.build_schema(ctx))
            .await
    }

    async fn build_schema(&self, ctx: &StoreCtx) -> CatalogResult<DatasetSchema> {
        let length = self.len();
        let mut columns = BTreeMap::new();
        let mut axis_counter = 0usize;
        for (key, data_key) in &self.descriptor.data_keys {
            let dtype = self.column_dtype(ctx, key, data_key).await?;
            let row_shape: &[usize] = match self.sub {
                SubDict::Data => &data_key.shape,
                SubDict::Timestamps => &[],
            };

            let mut dims = Vec::with_capacity(row_shape.len() + 1);
            dims.push("time".to_string());
            match (&data_key.dims, self.sub) {
                (Some(labels), SubDict::Data) if labels.len() == row_shape.len() => {
                    dims.extend(labels.iter().cloned());
                }
                _ => {
                    for _ in 0..row_shape.len() {
                        dims.push(format!("dim_{axis_counter}"));
                        axis_counter += 1;
                    }
                }
            }

            let mut shape = Vec::with_capacity(row_shape.len() + 1);
            shape.push(length);
            shape.extend_from_slice(row_shape);

            let hints: Option<Vec<chunking::ChunkHint>> = match (&data_key.chunks, self.sub) {
                (Some(hints), SubDict::Data) if hints.len() == shape.len() => {
                    Some(hints.clone())
                }
                _ => None,
            };
            let chunks = plan_chunks(
                &shape,
                dtype.itemsize(),
                self.chunk_byte_limit,
                hints.as_deref(),
                self.frames_per_chunk,
            );

            columns.insert(
                key.clone(),
                ColumnSchema {
                    dims,
                    shape,
                    dtype,
                    chunks,
                    object: self.descriptor.object_for(key).map(str::to_string),
                    units: data_key.units.clone(),
                    external: data_key.is_external(),
                },
            );
        }
        Ok(DatasetSchema { length, columns })
    }

    /// Element type of one column: structured dtype, then explicit type
    /// string, then the declared-kind fallback. Unknown-width strings scan
    /// the whole column for the widest element.
    async fn column_dtype(
        &self,
        ctx: &StoreCtx,
        key: &str,
        data_key: &DataKey,
    ) -> CatalogResult<Dtype> {
        if self.sub == SubDict::Timestamps {
            return Ok(Dtype::Float64);
        }
        if let Some(descr) = &data_key.dtype_descr {
            return array::dtype_from_descr(key, descr);
        }
        if let Some(spec) = &data_key.dtype_str {
            return array::parse_dtype_str(spec).ok_or_else(|| CatalogError::UnsupportedDtype {
                key: key.to_string(),
                reason: format!("unparseable dtype_str '{spec}'"),
            });
        }
        Ok(match data_key.dtype {
            DtypeKind::Boolean => Dtype::Bool,
            DtypeKind::Number => Dtype::Float64,
            DtypeKind::Integer => Dtype::Int64,
            DtypeKind::Array => Dtype::Float64,
            DtypeKind::String => {
                let table = self
                    .table(ctx, std::slice::from_ref(&key.to_string()), 1, self.cutoff)
                    .await?;
                let width = table
                    .columns
                    .get(key)
                    .into_iter()
                    .flatten()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(|s| s.chars().count())
                    .max()
                    .unwrap_or(0);
                Dtype::Str(width)
            }
        })
    }

    /// Whole view: every column plus the time coordinate.
    pub async fn read(&self, ctx: &StoreCtx) -> CatalogResult<Dataset> {
        let schema = self.schema(ctx).await?.clone();
        let time = self.time_coord(ctx, 1, self.cutoff).await?;

        let mut arrays = BTreeMap::new();
        // Scalar columns share one paged query; array columns go one by one.
        let scalar_keys: Vec<String> = schema
            .columns
            .iter()
            .filter(|(_, column)| column.shape.len() == 1)
            .map(|(key, _)| key.clone())
            .collect();
        if !scalar_keys.is_empty() {
            let table = self.table(ctx, &scalar_keys, 1, self.cutoff).await?;
            for key in &scalar_keys {
                let column = &schema.columns[key];
                let values = self
                    .assemble(ctx, key, column, &table, 1, self.cutoff)
                    .await?;
                arrays.insert(key.clone(), self.finish(column, values));
            }
        }
        let array_columns = schema
            .columns
            .iter()
            .filter(|(_, column)| column.shape.len() > 1);
        let fetched = futures::future::try_join_all(array_columns.map(|(key, column)| {
            async move {
                let table = self
                    .table(ctx, std::slice::from_ref(key), 1, self.cutoff)
                    .await?;
                let values = self
                    .assemble(ctx, key, column, &table, 1, self.cutoff)
                    .await?;
                Ok::<_, CatalogError>((key.clone(), self.finish(column, values)))
            }
        }))
        .await?;
        arrays.extend(fetched);
        Ok(Dataset {
            time: (*time).clone(),
            arrays,
        })
    }

    /// One whole column.
    pub async fn read_column(&self, ctx: &StoreCtx, key: &str) -> CatalogResult<DataArray> {
        let schema = self.schema(ctx).await?;
        let column = schema.columns.get(key).cloned().ok_or_else(|| {
            CatalogError::FieldNotFound {
                run_uid: self.run_uid.clone(),
                stream: self.stream.clone(),
                key: key.to_string(),
            }
        })?;
        let table = self
            .table(ctx, std::slice::from_ref(&key.to_string()), 1, self.cutoff)
            .await?;
        let values = self.assemble(ctx, key, &column, &table, 1, self.cutoff).await?;
        Ok(self.finish(&column, values))
    }

    /// One chunk of one column, by per-axis block index.
    ///
    /// The block's time-axis bounds imply the `seq_num` interval; inner axes
    /// are sliced out of the validated rows. Concatenating every block
    /// reconstructs the whole column bit-identically.
    pub async fn read_block(
        &self,
        ctx: &StoreCtx,
        key: &str,
        block: &[usize],
    ) -> CatalogResult<ColumnData> {
        let schema = self.schema(ctx).await?;
        let column = schema.columns.get(key).cloned().ok_or_else(|| {
            CatalogError::FieldNotFound {
                run_uid: self.run_uid.clone(),
                stream: self.stream.clone(),
                key: key.to_string(),
            }
        })?;
        if block.len() != column.chunks.len()
            || block
                .iter()
                .zip(&column.chunks)
                .any(|(&index, axis)| index >= axis.len())
        {
            return Err(CatalogError::BadShapeMetadata {
                key: key.to_string(),
                declared: chunking::block_counts(&column.chunks),
                actual: block.to_vec(),
            });
        }

        let bounds: Vec<(usize, usize)> = block
            .iter()
            .zip(&column.chunks)
            .map(|(&index, axis)| block_bounds(axis, index))
            .collect();
        let (row_start, row_end) = bounds[0];
        let seq_min = row_start as u64 + 1;
        let seq_max = row_end as u64 + 1;

        let table = self
            .table(ctx, std::slice::from_ref(&key.to_string()), seq_min, seq_max)
            .await?;
        let values = self
            .assemble(ctx, key, &column, &table, seq_min, seq_max)
            .await?;

        // Rows are already restricted; cut the inner axes.
        let mut cut = vec![(0, values.shape()[0])];
        cut.extend_from_slice(&bounds[1..]);
        Ok(values.slice_axes(&cut))
    }

    /// Time coordinate over a seq interval, memoized on the interval.
    pub async fn time_coord(
        &self,
        ctx: &StoreCtx,
        seq_min: u64,
        seq_max: u64,
    ) -> CatalogResult<Arc<Vec<f64>>> {
        if let Some(times) = self.memo.lock().time.get(&(seq_min, seq_max)) {
            return Ok(Arc::clone(times));
        }
        let table = self
            .adapter
            .event_table(ctx, &self.descriptor_uids, seq_min, seq_max, &[], self.sub)
            .await?;
        let mut times = vec![f64::NAN; (seq_max - seq_min) as usize];
        for (seq, time) in table.seq_nums.iter().zip(&table.times) {
            times[(seq - seq_min) as usize] = *time;
        }
        let times = Arc::new(times);
        self.memo
            .lock()
            .time
            .put((seq_min, seq_max), Arc::clone(&times));
        Ok(times)
    }

    /// Inner column fetch, memoized on `(keys, seq_min, seq_max)`.
    async fn table(
        &self,
        ctx: &StoreCtx,
        keys: &[String],
        seq_min: u64,
        seq_max: u64,
    ) -> CatalogResult<Arc<EventTable>> {
        let memo_key = (keys.to_vec(), seq_min, seq_max);
        if let Some(table) = self.memo.lock().tables.get(&memo_key) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(
            self.adapter
                .event_table(ctx, &self.descriptor_uids, seq_min, seq_max, keys, self.sub)
                .await?,
        );
        self.memo.lock().tables.put(memo_key, Arc::clone(&table));
        Ok(table)
    }

    /// Align table rows onto the dense seq interval and stack them.
    async fn assemble(
        &self,
        ctx: &StoreCtx,
        key: &str,
        column: &ColumnSchema,
        table: &EventTable,
        seq_min: u64,
        seq_max: u64,
    ) -> CatalogResult<ColumnData> {
        let empty = Vec::new();
        let cells = table.columns.get(key).unwrap_or(&empty);
        let no_flags = Vec::new();
        let flags = table.filled.get(key).unwrap_or(&no_flags);

        let mut by_seq: BTreeMap<u64, usize> = BTreeMap::new();
        for (index, seq) in table.seq_nums.iter().enumerate() {
            by_seq.insert(*seq, index);
        }

        let mut rows = Vec::with_capacity((seq_max - seq_min) as usize);
        for seq in seq_min..seq_max {
            let row = match by_seq.get(&seq) {
                None => RowValue::Missing,
                Some(&index) => {
                    let cell = cells.get(index).cloned().flatten();
                    let already_filled = flags.get(index).copied().unwrap_or(false);
                    match cell {
                        None | Some(Value::Null) => RowValue::Missing,
                        Some(Value::String(datum_id))
                            if column.external && !already_filled =>
                        {
                            RowValue::Array(self.filler.fetch(ctx, &datum_id).await?)
                        }
                        Some(value) => RowValue::Json(value),
                    }
                }
            };
            rows.push(row);
        }
        stack_rows(key, &self.run_uid, &column.dtype, &column.shape[1..], rows)
    }

    fn finish(&self, column: &ColumnSchema, values: ColumnData) -> DataArray {
        DataArray {
            dims: column.dims.clone(),
            dtype: column.dtype.clone(),
            values,
            object: column.object.clone(),
            units: column.units.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::Transforms;
    use crate::filler::HandlerRegistry;
    use crate::store::{Collection, MemStore};
    use serde_json::json;

    async fn materializer_for(
        store: Arc<MemStore>,
        descriptor: Value,
        sub: SubDict,
    ) -> Materializer {
        let adapter = StoreAdapter::new(store.clone(), store, Arc::new(Transforms::default()));
        let descriptor: EventDescriptor = serde_json::from_value(descriptor).unwrap();
        let registry = HandlerRegistry::with_defaults();
        let filler = Arc::new(Filler::new(
            descriptor.run_start.clone(),
            adapter.clone(),
            registry.snapshot(),
            Arc::new(BTreeMap::new()),
        ));
        Materializer::bind(
            &StoreCtx::unbounded(),
            adapter,
            filler,
            descriptor.run_start.clone(),
            descriptor.name.clone(),
            &[descriptor],
            sub,
            chunking::DEFAULT_CHUNK_BYTE_LIMIT,
            chunking::DEFAULT_FRAMES_PER_CHUNK,
        )
        .await
        .unwrap()
    }

    fn scalar_descriptor() -> Value {
        json!({
            "uid": "d-1", "run_start": "r-1", "name": "primary", "time": 0.0,
            "data_keys": {
                "x": {"dtype": "integer", "shape": []},
                "temp": {"dtype": "number", "shape": [], "units": "K"}
            },
            "object_keys": {"motor": ["x"], "lakeshore": ["temp"]}
        })
    }

    fn seed_scalar_events(store: &MemStore) {
        for (seq, time, x, temp) in [(1u64, 10.0, 1, 295.5), (2, 20.0, 2, 296.5), (3, 30.0, 3, 297.5)]
        {
            store.insert(
                Collection::Event,
                json!({"uid": format!("e-{seq}"), "descriptor": "d-1", "seq_num": seq,
                       "time": time, "data": {"x": x, "temp": temp},
                       "timestamps": {"x": time - 0.5, "temp": time - 0.25}}),
            );
        }
    }

    #[tokio::test]
    async fn whole_read_matches_schema() {
        let store = Arc::new(MemStore::new());
        seed_scalar_events(&store);
        let mat = materializer_for(store, scalar_descriptor(), SubDict::Data).await;
        let ctx = StoreCtx::unbounded();

        let schema = mat.schema(&ctx).await.unwrap();
        assert_eq!(schema.length, 3);
        assert_eq!(schema.columns["x"].dims, vec!["time"]);
        assert_eq!(schema.columns["x"].dtype, Dtype::Int64);
        assert_eq!(schema.columns["x"].object.as_deref(), Some("motor"));
        assert_eq!(schema.columns["temp"].units.as_deref(), Some("K"));

        let dataset = mat.read(&ctx).await.unwrap();
        assert_eq!(dataset.time, vec![10.0, 20.0, 30.0]);
        let x = &dataset.arrays["x"];
        assert_eq!(x.values.shape(), &[3]);
        assert_eq!(x.values.int_at(&[0]), Some(1));
        assert_eq!(x.values.int_at(&[2]), Some(3));
    }

    #[tokio::test]
    async fn timestamps_view_is_scalar_float() {
        let store = Arc::new(MemStore::new());
        seed_scalar_events(&store);
        let mat = materializer_for(store, scalar_descriptor(), SubDict::Timestamps).await;
        let ctx = StoreCtx::unbounded();

        let schema = mat.schema(&ctx).await.unwrap();
        assert_eq!(schema.columns["x"].shape, vec![3]);
        assert_eq!(schema.columns["x"].dtype, Dtype::Float64);

        let dataset = mat.read(&ctx).await.unwrap();
        assert_eq!(dataset.arrays["x"].values.float_at(&[0]), Some(9.5));
    }

    #[tokio::test]
    async fn duplicate_seq_num_takes_latest_by_time() {
        let store = Arc::new(MemStore::new());
        for (seq, time, x) in [(1u64, 1.0, 10), (1, 2.0, 11), (2, 3.0, 20)] {
            store.insert(
                Collection::Event,
                json!({"uid": format!("e-{seq}-{time}"), "descriptor": "d-1", "seq_num": seq,
                       "time": time, "data": {"x": x}, "timestamps": {"x": time}}),
            );
        }
        let descriptor = json!({
            "uid": "d-1", "run_start": "r-1", "name": "primary", "time": 0.0,
            "data_keys": {"x": {"dtype": "integer", "shape": []}}
        });
        let mat = materializer_for(store, descriptor, SubDict::Data).await;
        let ctx = StoreCtx::unbounded();

        assert_eq!(mat.len(), 2);
        let dataset = mat.read(&ctx).await.unwrap();
        assert_eq!(dataset.time, vec![2.0, 3.0]);
        assert_eq!(dataset.arrays["x"].values.int_at(&[0]), Some(11));
        assert_eq!(dataset.arrays["x"].values.int_at(&[1]), Some(20));
    }

    #[tokio::test]
    async fn block_reads_reconstruct_whole_column() {
        let store = Arc::new(MemStore::new());
        for seq in 1u64..=10 {
            let row: Vec<Vec<f64>> = (0..3)
                .map(|r| (0..4).map(|c| (seq * 100 + r * 10 + c) as f64).collect())
                .collect();
            store.insert(
                Collection::Event,
                json!({"uid": format!("e-{seq}"), "descriptor": "d-1", "seq_num": seq,
                       "time": seq as f64, "data": {"img": row},
                       "timestamps": {"img": seq as f64}}),
            );
        }
        let descriptor = json!({
            "uid": "d-1", "run_start": "r-1", "name": "primary", "time": 0.0,
            "data_keys": {"img": {"dtype": "array", "shape": [3, 4],
                                   "chunks": [4, "auto", 2]}}
        });
        let mat = materializer_for(store, descriptor, SubDict::Data).await;
        let ctx = StoreCtx::unbounded();

        let schema = mat.schema(&ctx).await.unwrap();
        let counts = chunking::block_counts(&schema.columns["img"].chunks);
        assert_eq!(counts, vec![3, 1, 2]);
        let whole = mat.read_column(&ctx, "img").await.unwrap();

        // Reassemble along each axis in index order.
        let mut time_parts = Vec::new();
        for b0 in 0..counts[0] {
            let mut col_parts = Vec::new();
            for b2 in 0..counts[2] {
                col_parts.push(mat.read_block(&ctx, "img", &[b0, 0, b2]).await.unwrap());
            }
            time_parts.push(ColumnData::concat(&col_parts, 2).unwrap());
        }
        let rebuilt = ColumnData::concat(&time_parts, 0).unwrap();
        assert_eq!(rebuilt, whole.values);
    }

    #[tokio::test]
    async fn string_columns_scan_for_width() {
        let store = Arc::new(MemStore::new());
        for (seq, label) in [(1u64, "ok"), (2, "saturated"), (3, "ok")] {
            store.insert(
                Collection::Event,
                json!({"uid": format!("e-{seq}"), "descriptor": "d-1", "seq_num": seq,
                       "time": seq as f64, "data": {"status": label},
                       "timestamps": {"status": seq as f64}}),
            );
        }
        let descriptor = json!({
            "uid": "d-1", "run_start": "r-1", "name": "primary", "time": 0.0,
            "data_keys": {"status": {"dtype": "string", "shape": []}}
        });
        let mat = materializer_for(store, descriptor, SubDict::Data).await;
        let ctx = StoreCtx::unbounded();
        let schema = mat.schema(&ctx).await.unwrap();
        assert_eq!(schema.columns["status"].dtype, Dtype::Str(9));

        let dataset = mat.read(&ctx).await.unwrap();
        assert_eq!(dataset.arrays["status"].values.str_at(&[1]), Some("saturated"));
    }

    #[tokio::test]
    async fn generated_dims_share_one_counter() {
        let store = Arc::new(MemStore::new());
        store.insert(
            Collection::Event,
            json!({"uid": "e-1", "descriptor": "d-1", "seq_num": 1, "time": 1.0,
                   "data": {"a": [1.0, 2.0], "b": [[1.0], [2.0]]},
                   "timestamps": {"a": 1.0, "b": 1.0}}),
        );
        let descriptor = json!({
            "uid": "d-1", "run_start": "r-1", "name": "primary", "time": 0.0,
            "data_keys": {
                "a": {"dtype": "array", "shape": [2]},
                "b": {"dtype": "array", "shape": [2, 1]}
            }
        });
        let mat = materializer_for(store, descriptor, SubDict::Data).await;
        let ctx = StoreCtx::unbounded();
        let schema = mat.schema(&ctx).await.unwrap();
        assert_eq!(schema.columns["a"].dims, vec!["time", "dim_0"]);
        assert_eq!(schema.columns["b"].dims, vec!["time", "dim_1", "dim_2"]);
    }

    #[tokio::test]
    async fn missing_column_is_field_not_found() {
        let store = Arc::new(MemStore::new());
        seed_scalar_events(&store);
        let mat = materializer_for(store, scalar_descriptor(), SubDict::Data).await;
        let ctx = StoreCtx::unbounded();
        assert!(matches!(
            mat.read_column(&ctx, "nope").await,
            Err(CatalogError::FieldNotFound { .. })
        ));
    }
}
