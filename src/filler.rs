//! External-reference resolution.
//!
//! Event cells of externally-declared columns hold datum ids, not values. The
//! [`Filler`] replaces those references with materialized payloads through
//! handlers looked up in a process-wide [`HandlerRegistry`]. Each run owns one
//! filler; its handler instances, resource documents, and datum documents are
//! cached behind a single non-reentrant mutex so handler state is always
//! serially accessed, while separate runs fill concurrently.
//!
//! Resolution of an unknown datum id tries the `"/"`-embedded resource-uid
//! prefix first (an opportunistic hint), falls back to the authoritative
//! datum→resource lookup, then prefetches every datum of that resource in one
//! query before re-entering. A second re-entry for the same id fails with
//! `UnresolvableExternalReference` instead of looping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use crate::array::ColumnData;
use crate::documents::{Datum, Event, EventDescriptor, JsonMap, Resource};
use crate::error::{CatalogError, CatalogResult};
use crate::store::{StoreAdapter, StoreCtx};

/// A materialized payload reader for one resource.
///
/// Invoked with a datum's `datum_kwargs`; returns a dense array or scalar.
/// Handlers are constructed once per resource and may keep open files or
/// decompression state; the filler serializes access to them.
pub trait Handler: Send + Sync {
    fn read(&self, datum_kwargs: &JsonMap) -> CatalogResult<ColumnData>;
}

/// Constructs a [`Handler`] from a resource's location triple.
pub trait HandlerFactory: Send + Sync {
    fn construct(
        &self,
        resource_path: &str,
        root: &str,
        resource_kwargs: &JsonMap,
    ) -> CatalogResult<Box<dyn Handler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&str, &str, &JsonMap) -> CatalogResult<Box<dyn Handler>> + Send + Sync,
{
    fn construct(
        &self,
        resource_path: &str,
        root: &str,
        resource_kwargs: &JsonMap,
    ) -> CatalogResult<Box<dyn Handler>> {
        self(resource_path, root, resource_kwargs)
    }
}

/// Process-wide capability table mapping resource `spec` tags to handler
/// factories.
///
/// Registration is rare and serialized; readers take a snapshot, so an
/// in-flight fill keeps the handler set it started with.
#[derive(Default)]
pub struct HandlerRegistry {
    specs: RwLock<HashMap<String, Arc<dyn HandlerFactory>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut specs: Vec<String> = self.specs.read().keys().cloned().collect();
        specs.sort();
        f.debug_struct("HandlerRegistry").field("specs", &specs).finish()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the bundled handlers (`npy`).
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let _ = registry.register("npy", Arc::new(crate::handlers::NpyFactory), false);
        registry
    }

    pub fn register(
        &self,
        spec: &str,
        factory: Arc<dyn HandlerFactory>,
        overwrite: bool,
    ) -> CatalogResult<()> {
        let mut specs = self.specs.write();
        if !overwrite && specs.contains_key(spec) {
            return Err(CatalogError::DuplicateHandler(spec.to_string()));
        }
        specs.insert(spec.to_string(), factory);
        Ok(())
    }

    pub fn deregister(&self, spec: &str) -> Option<Arc<dyn HandlerFactory>> {
        self.specs.write().remove(spec)
    }

    /// Point-in-time copy for a filler.
    pub fn snapshot(&self) -> HashMap<String, Arc<dyn HandlerFactory>> {
        self.specs.read().clone()
    }
}

#[derive(Default)]
struct FillerState {
    /// Resource uid to live handler instance.
    handler_cache: HashMap<String, Arc<dyn Handler>>,
    resources: HashMap<String, Resource>,
    /// Unbounded within a filler; dropped with it.
    datums: HashMap<String, Datum>,
    constructions: usize,
}

/// Per-run external-reference filler. Threadsafe for concurrent readers of
/// the same run.
pub struct Filler {
    run_uid: String,
    adapter: StoreAdapter,
    handlers: HashMap<String, Arc<dyn HandlerFactory>>,
    root_map: Arc<BTreeMap<String, String>>,
    state: Mutex<FillerState>,
}

impl std::fmt::Debug for Filler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filler")
            .field("run_uid", &self.run_uid)
            .field("specs", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Filler {
    pub fn new(
        run_uid: String,
        adapter: StoreAdapter,
        handlers: HashMap<String, Arc<dyn HandlerFactory>>,
        root_map: Arc<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            run_uid,
            adapter,
            handlers,
            root_map,
            state: Mutex::new(FillerState::default()),
        }
    }

    /// How many handler instances this filler has constructed.
    pub fn handler_constructions(&self) -> usize {
        self.state.lock().constructions
    }

    /// Materialize one datum reference.
    pub async fn fetch(&self, ctx: &StoreCtx, datum_id: &str) -> CatalogResult<ColumnData> {
        let mut last_attempt: Option<String> = None;
        loop {
            let cached = {
                let state = self.state.lock();
                state.datums.get(datum_id).map(|datum| {
                    (datum.clone(), state.resources.get(&datum.resource).cloned())
                })
            };
            if let Some((datum, resource)) = cached {
                let resource = match resource {
                    Some(resource) => resource,
                    None => {
                        let resource = self.adapter.resource(ctx, &datum.resource).await?;
                        self.state
                            .lock()
                            .resources
                            .insert(resource.uid.clone(), resource.clone());
                        resource
                    }
                };
                return self.invoke(&resource, &datum);
            }

            if last_attempt.as_deref() == Some(datum_id) {
                return Err(CatalogError::UnresolvableExternalReference {
                    run_uid: self.run_uid.clone(),
                    datum_id: datum_id.to_string(),
                });
            }
            last_attempt = Some(datum_id.to_string());
            self.prefetch_for(ctx, datum_id).await?;
        }
    }

    /// Replace every unfilled external cell of `event` with its payload.
    pub async fn fill_event(
        &self,
        ctx: &StoreCtx,
        descriptor: &EventDescriptor,
        event: &mut Event,
    ) -> CatalogResult<()> {
        for (key, data_key) in &descriptor.data_keys {
            if !data_key.is_external() || event.filled.get(key).copied().unwrap_or(false) {
                continue;
            }
            let datum_id = match event.data.get(key) {
                Some(Value::String(id)) => id.clone(),
                _ => continue,
            };
            let column = self.fetch(ctx, &datum_id).await?;
            event.data.insert(key.clone(), column.to_value());
            event.filled.insert(key.clone(), true);
        }
        Ok(())
    }

    /// Resolve the owning resource of `datum_id` and pull all of its datums
    /// into the cache in one query.
    async fn prefetch_for(&self, ctx: &StoreCtx, datum_id: &str) -> CatalogResult<()> {
        let fast_path = match datum_id.split_once('/') {
            Some((prefix, _)) => match self.adapter.resource(ctx, prefix).await {
                Ok(resource) => Some(resource),
                Err(CatalogError::ResourceNotFound(_)) => None,
                Err(other) => return Err(other),
            },
            None => None,
        };
        let resource = match fast_path {
            Some(resource) => resource,
            None => {
                let datum = self.adapter.datum(ctx, datum_id).await?;
                self.adapter.resource(ctx, &datum.resource).await?
            }
        };
        debug!(
            run_uid = %self.run_uid,
            resource = %resource.uid,
            "prefetching datums for resource"
        );
        let datums = self.adapter.datums_for_resource(ctx, &resource.uid).await?;
        let mut state = self.state.lock();
        for datum in datums {
            state.datums.entry(datum.datum_id.clone()).or_insert(datum);
        }
        state.resources.entry(resource.uid.clone()).or_insert(resource);
        Ok(())
    }

    /// Look up or construct the resource's handler, then read the datum.
    /// Runs under the state mutex: handler state is serially accessed.
    fn invoke(&self, resource: &Resource, datum: &Datum) -> CatalogResult<ColumnData> {
        let mut state = self.state.lock();
        let handler = match state.handler_cache.get(&resource.uid) {
            Some(handler) => Arc::clone(handler),
            None => {
                let factory = self
                    .handlers
                    .get(&resource.spec)
                    .ok_or_else(|| CatalogError::MissingHandler(resource.spec.clone()))?;
                let root = self
                    .root_map
                    .get(&resource.root)
                    .cloned()
                    .unwrap_or_else(|| resource.root.clone());
                let handler: Arc<dyn Handler> = factory
                    .construct(&resource.resource_path, &root, &resource.resource_kwargs)?
                    .into();
                state.constructions += 1;
                state
                    .handler_cache
                    .insert(resource.uid.clone(), Arc::clone(&handler));
                handler
            }
        };
        handler.read(&datum.datum_kwargs)
    }
}
