//! Run and stream objects.
//!
//! A [`Run`] bundles the start/stop documents and the per-stream descriptors
//! of one acquisition, plus the lazily constructed filler shared by all of
//! its readers. Streams are lightweight handles onto the same shared core -
//! no owning back-links, so evicting a run from the cache drops its streams
//! with it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::array::{stack_rows, DataArray, Dataset, Dtype, RowValue};
use crate::chunking;
use crate::documents::{DataKey, DtypeKind, EventDescriptor, RunStart, RunStop};
use crate::error::{CatalogError, CatalogResult};
use crate::filler::{Filler, HandlerFactory};
use crate::materialize::Materializer;
use crate::replay::{DocReplay, PagedReplay};
use crate::store::{StoreAdapter, StoreCtx, SubDict};

/// Materialization and staleness knobs a run inherits from its catalog.
#[derive(Debug, Clone)]
pub(crate) struct RunOptions {
    pub chunk_byte_limit: usize,
    pub frames_per_chunk: usize,
    pub ttl_complete: Duration,
    pub ttl_partial: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            chunk_byte_limit: chunking::DEFAULT_CHUNK_BYTE_LIMIT,
            frames_per_chunk: chunking::DEFAULT_FRAMES_PER_CHUNK,
            ttl_complete: Duration::from_secs(60),
            ttl_partial: Duration::from_secs(2),
        }
    }
}

/// Cache-revalidation hint exported by every cacheable view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Staleness {
    pub must_revalidate: bool,
    /// How long the view may be served before revalidation.
    pub ttl: Duration,
}

/// Shared state of one run. Everything hangs off an `Arc` of this.
pub(crate) struct RunCore {
    pub start: RunStart,
    pub stop: Option<RunStop>,
    /// Stream name to its descriptors, each list in time order.
    pub descriptors: BTreeMap<String, Vec<EventDescriptor>>,
    pub adapter: StoreAdapter,
    pub handlers: HashMap<String, Arc<dyn HandlerFactory>>,
    pub root_map: Arc<BTreeMap<String, String>>,
    pub options: RunOptions,
    filler: OnceCell<Arc<Filler>>,
}

impl std::fmt::Debug for RunCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCore")
            .field("uid", &self.start.uid)
            .field("complete", &self.stop.is_some())
            .field("streams", &self.descriptors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RunCore {
    /// Fetch and bundle one run's metadata.
    pub(crate) async fn load(
        ctx: &StoreCtx,
        adapter: StoreAdapter,
        uid: &str,
        handlers: HashMap<String, Arc<dyn HandlerFactory>>,
        root_map: Arc<BTreeMap<String, String>>,
        options: RunOptions,
    ) -> CatalogResult<Self> {
        let start = adapter.run_start(ctx, uid).await?;
        let stop = adapter.run_stop(ctx, uid).await?;
        let mut descriptors: BTreeMap<String, Vec<EventDescriptor>> = BTreeMap::new();
        for descriptor in adapter.descriptors(ctx, uid).await? {
            descriptors
                .entry(descriptor.name.clone())
                .or_default()
                .push(descriptor);
        }
        Ok(Self {
            start,
            stop,
            descriptors,
            adapter,
            handlers,
            root_map,
            options,
            filler: OnceCell::new(),
        })
    }

    /// The run's filler, constructed by the first caller; later callers see
    /// the same instance.
    pub(crate) fn filler(&self) -> Arc<Filler> {
        Arc::clone(self.filler.get_or_init(|| {
            Arc::new(Filler::new(
                self.start.uid.clone(),
                self.adapter.clone(),
                self.handlers.clone(),
                Arc::clone(&self.root_map),
            ))
        }))
    }

    pub(crate) fn staleness(&self) -> Staleness {
        Staleness {
            must_revalidate: true,
            ttl: if self.stop.is_some() {
                self.options.ttl_complete
            } else {
                self.options.ttl_partial
            },
        }
    }
}

/// One experimental acquisition session: a sub-catalog of named streams.
#[derive(Debug, Clone)]
pub struct Run {
    core: Arc<RunCore>,
}

impl Run {
    pub(crate) fn from_core(core: Arc<RunCore>) -> Self {
        Self { core }
    }

    pub fn uid(&self) -> &str {
        &self.core.start.uid
    }

    pub fn scan_id(&self) -> i64 {
        self.core.start.scan_id
    }

    pub fn start(&self) -> &RunStart {
        &self.core.start
    }

    pub fn stop(&self) -> Option<&RunStop> {
        self.core.stop.as_ref()
    }

    /// Whether the stop document has been written.
    pub fn is_complete(&self) -> bool {
        self.core.stop.is_some()
    }

    /// Stable (complete) runs advertise the long TTL, volatile (live) runs
    /// the short one.
    pub fn staleness(&self) -> Staleness {
        self.core.staleness()
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.core.descriptors.keys().cloned().collect()
    }

    pub fn stream(&self, name: &str) -> CatalogResult<Stream> {
        if !self.core.descriptors.contains_key(name) {
            return Err(CatalogError::StreamNotFound {
                run_uid: self.uid().to_string(),
                stream: name.to_string(),
            });
        }
        Ok(Stream {
            core: Arc::clone(&self.core),
            name: name.to_string(),
        })
    }

    /// Replay the run's documents one at a time, in emission order.
    pub fn single_documents(&self, ctx: &StoreCtx, fill: bool) -> CatalogResult<DocReplay> {
        DocReplay::new(ctx.clone(), Arc::clone(&self.core), fill)
    }

    /// Replay with consecutive events/datums batched into pages of at most
    /// `size` rows.
    pub fn documents(&self, ctx: &StoreCtx, fill: bool, size: usize) -> CatalogResult<PagedReplay> {
        Ok(PagedReplay::new(
            DocReplay::new(ctx.clone(), Arc::clone(&self.core), fill)?,
            size,
        ))
    }
}

/// One named event stream within a run.
#[derive(Debug, Clone)]
pub struct Stream {
    core: Arc<RunCore>,
    name: String,
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_uid(&self) -> &str {
        &self.core.start.uid
    }

    pub fn staleness(&self) -> Staleness {
        self.core.staleness()
    }

    fn stream_descriptors(&self) -> &[EventDescriptor] {
        self.core
            .descriptors
            .get(&self.name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    async fn materializer(&self, ctx: &StoreCtx, sub: SubDict) -> CatalogResult<Materializer> {
        Materializer::bind(
            ctx,
            self.core.adapter.clone(),
            self.core.filler(),
            self.core.start.uid.clone(),
            self.name.clone(),
            self.stream_descriptors(),
            sub,
            self.core.options.chunk_byte_limit,
            self.core.options.frames_per_chunk,
        )
        .await
    }

    /// Column materializer over the events' `data` sub-dict.
    pub async fn data(&self, ctx: &StoreCtx) -> CatalogResult<Materializer> {
        self.materializer(ctx, SubDict::Data).await
    }

    /// Column materializer over the events' `timestamps` sub-dict.
    pub async fn timestamps(&self, ctx: &StoreCtx) -> CatalogResult<Materializer> {
        self.materializer(ctx, SubDict::Timestamps).await
    }

    /// Whole `data` view in one call.
    pub async fn read(&self, ctx: &StoreCtx) -> CatalogResult<Dataset> {
        self.data(ctx).await?.read(ctx).await
    }

    /// Devices with configuration snapshots in this stream.
    pub fn config_objects(&self) -> Vec<String> {
        self.stream_descriptors()
            .first()
            .map(|d| d.configuration.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Configuration snapshot of one device: one row per descriptor, columns
    /// from the object's configuration `data_keys`.
    pub fn config(&self, object: &str) -> CatalogResult<Dataset> {
        self.config_view(object, SubDict::Data)
    }

    /// Hardware timestamps of the configuration snapshot.
    pub fn config_timestamps(&self, object: &str) -> CatalogResult<Dataset> {
        self.config_view(object, SubDict::Timestamps)
    }

    fn config_view(&self, object: &str, sub: SubDict) -> CatalogResult<Dataset> {
        let descriptors = self.stream_descriptors();
        let representative = descriptors
            .first()
            .and_then(|d| d.configuration.get(object))
            .ok_or_else(|| CatalogError::FieldNotFound {
                run_uid: self.run_uid().to_string(),
                stream: self.name.clone(),
                key: object.to_string(),
            })?;

        let time: Vec<f64> = descriptors.iter().map(|d| d.time).collect();
        let mut arrays = BTreeMap::new();
        for (key, data_key) in &representative.data_keys {
            let dtype = config_dtype(key, data_key, sub, descriptors, object)?;
            let declared: &[usize] = match sub {
                SubDict::Data => &data_key.shape,
                SubDict::Timestamps => &[],
            };
            let rows: Vec<RowValue> = descriptors
                .iter()
                .map(|descriptor| {
                    let section = descriptor.configuration.get(object).map(|config| match sub {
                        SubDict::Data => &config.data,
                        SubDict::Timestamps => &config.timestamps,
                    });
                    match section.and_then(|map| map.get(key)) {
                        Some(value) => RowValue::Json(value.clone()),
                        None => RowValue::Missing,
                    }
                })
                .collect();
            let values = stack_rows(key, self.run_uid(), &dtype, declared, rows)?;
            let mut dims = vec!["time".to_string()];
            for axis in 0..declared.len() {
                dims.push(format!("dim_{axis}"));
            }
            arrays.insert(
                key.clone(),
                DataArray {
                    dims,
                    dtype,
                    values,
                    object: Some(object.to_string()),
                    units: data_key.units.clone(),
                },
            );
        }
        Ok(Dataset { time, arrays })
    }
}

/// Element type for a configuration column. Unknown-width strings scan the
/// in-memory snapshot rows instead of the store.
fn config_dtype(
    key: &str,
    data_key: &DataKey,
    sub: SubDict,
    descriptors: &[EventDescriptor],
    object: &str,
) -> CatalogResult<Dtype> {
    if sub == SubDict::Timestamps {
        return Ok(Dtype::Float64);
    }
    if let Some(descr) = &data_key.dtype_descr {
        return crate::array::dtype_from_descr(key, descr);
    }
    if let Some(spec) = &data_key.dtype_str {
        return crate::array::parse_dtype_str(spec).ok_or_else(|| CatalogError::UnsupportedDtype {
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
            let width = descriptors
                .iter()
                .filter_map(|d| d.configuration.get(object))
                .filter_map(|config| config.data.get(key))
                .filter_map(Value::as_str)
                .map(|s| s.chars().count())
                .max()
                .unwrap_or(0);
            Dtype::Str(width)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::Transforms;
    use crate::store::{Collection, MemStore};
    use serde_json::json;

    async fn load_run(store: Arc<MemStore>, uid: &str) -> Run {
        let adapter = StoreAdapter::new(store.clone(), store, Arc::new(Transforms::default()));
        let core = RunCore::load(
            &StoreCtx::unbounded(),
            adapter,
            uid,
            HashMap::new(),
            Arc::new(BTreeMap::new()),
            RunOptions::default(),
        )
        .await
        .unwrap();
        Run::from_core(Arc::new(core))
    }

    fn seed_run(store: &MemStore, uid: &str, with_stop: bool) {
        store.insert(
            Collection::RunStart,
            json!({"uid": uid, "time": 100.0, "scan_id": 5}),
        );
        if with_stop {
            store.insert(
                Collection::RunStop,
                json!({"uid": format!("{uid}-stop"), "run_start": uid, "time": 200.0,
                       "exit_status": "success"}),
            );
        }
        store.insert(
            Collection::EventDescriptor,
            json!({"uid": format!("{uid}-d1"), "run_start": uid, "name": "primary",
                   "time": 101.0,
                   "data_keys": {"x": {"dtype": "number", "shape": []}},
                   "configuration": {
                       "motor": {
                           "data": {"velocity": 2.5, "label": "slow"},
                           "timestamps": {"velocity": 100.5, "label": 100.5},
                           "data_keys": {
                               "velocity": {"dtype": "number", "shape": []},
                               "label": {"dtype": "string", "shape": []}
                           }
                       }
                   }}),
        );
    }

    #[tokio::test]
    async fn staleness_follows_completion_state() {
        let store = Arc::new(MemStore::new());
        seed_run(&store, "live-1", false);
        seed_run(&store, "done-1", true);

        let live = load_run(store.clone(), "live-1").await;
        assert!(!live.is_complete());
        assert_eq!(live.staleness().ttl, Duration::from_secs(2));
        assert!(live.staleness().must_revalidate);

        let done = load_run(store, "done-1").await;
        assert!(done.is_complete());
        assert_eq!(done.staleness().ttl, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn unknown_stream_is_not_found() {
        let store = Arc::new(MemStore::new());
        seed_run(&store, "r-1", true);
        let run = load_run(store, "r-1").await;
        assert_eq!(run.stream_names(), vec!["primary"]);
        assert!(matches!(
            run.stream("baseline"),
            Err(CatalogError::StreamNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn filler_is_constructed_once() {
        let store = Arc::new(MemStore::new());
        seed_run(&store, "r-1", true);
        let run = load_run(store, "r-1").await;
        let a = run.core.filler();
        let b = run.core.filler();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn config_view_has_one_row_per_descriptor() {
        let store = Arc::new(MemStore::new());
        seed_run(&store, "r-1", true);
        let run = load_run(store, "r-1").await;
        let stream = run.stream("primary").unwrap();
        assert_eq!(stream.config_objects(), vec!["motor"]);

        let config = stream.config("motor").unwrap();
        assert_eq!(config.time, vec![101.0]);
        assert_eq!(config.arrays["velocity"].values.float_at(&[0]), Some(2.5));
        assert_eq!(config.arrays["label"].values.str_at(&[0]), Some("slow"));
        assert_eq!(config.arrays["label"].dtype, Dtype::Str(4));

        let stamps = stream.config_timestamps("motor").unwrap();
        assert_eq!(stamps.arrays["velocity"].values.float_at(&[0]), Some(100.5));

        assert!(matches!(
            stream.config("camera"),
            Err(CatalogError::FieldNotFound { .. })
        ));
    }
}
