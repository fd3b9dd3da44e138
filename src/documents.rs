//! Document model for structured experiment run data.
//!
//! Implements the document vocabulary the catalog reads: a run is opened by a
//! [`RunStart`], described stream-by-stream by [`EventDescriptor`]s, filled by
//! an append-only sequence of [`Event`]s, and eventually closed by a
//! [`RunStop`]. Bulk payloads live outside the store and are addressed through
//! [`Resource`] / [`Datum`] references.
//!
//! # Document Flow
//!
//! ```text
//! RunStart (1)
//!    │
//!    ├── EventDescriptor (1+, one per data stream)
//!    │       │
//!    │       └── Event (N, measurements; external cells hold datum ids)
//!    │
//!    ├── Resource (0+) ── Datum (N per resource)
//!    │
//! RunStop (0..1, absent while the run is live)
//! ```
//!
//! All documents are immutable once written. Every struct carries a flattened
//! `extra` bag so user metadata survives the typed layer untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunking::ChunkHint;
use crate::error::{CatalogError, CatalogResult};

/// Free-form metadata bag preserved alongside the typed fields.
pub type JsonMap = serde_json::Map<String, Value>;

/// Generate a new unique document ID.
pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Fail,
    Abort,
}

/// Start document - opens a run.
///
/// `uid` is the run identifier used everywhere else; `scan_id` is a
/// user-facing counter and is not unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStart {
    pub uid: String,
    /// Epoch seconds.
    pub time: f64,
    #[serde(default)]
    pub scan_id: i64,
    /// User-provided metadata.
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Stop document - closes a run. Absent while the run is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStop {
    pub uid: String,
    /// Links to [`RunStart::uid`].
    pub run_start: String,
    pub time: f64,
    pub exit_status: ExitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Declared element kind of a column, before `dtype_str` refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtypeKind {
    Boolean,
    Number,
    Integer,
    String,
    Array,
}

/// Schema for one column within a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataKey {
    pub dtype: DtypeKind,
    /// NumPy-style type string (e.g. `<f8`, `<U10`), when the writer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype_str: Option<String>,
    /// Structured dtype description: `[name, type-string]` pairs. Only rank-1
    /// structures are supported downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype_descr: Option<Vec<(String, Value)>>,
    /// Per-row shape (empty for scalars).
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Labels for the non-time axes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<Vec<String>>,
    /// Truthy when event cells hold datum ids instead of values. Legacy
    /// writers store marker strings such as `FILESTORE:`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Per-axis chunking suggestion for the non-time axes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkHint>>,
}

impl DataKey {
    /// Whether event cells of this column hold external datum references.
    pub fn is_external(&self) -> bool {
        match &self.external {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(marker)) => !marker.is_empty(),
            Some(_) => true,
        }
    }
}

/// Per-object configuration snapshot inside a descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectConfig {
    #[serde(default)]
    pub data: JsonMap,
    #[serde(default)]
    pub timestamps: JsonMap,
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,
}

/// Descriptor document - defines one event stream within a run.
///
/// All descriptors sharing a `name` under one run agree on `data_keys`
/// structure; any one of them may serve as the representative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub uid: String,
    /// Links to [`RunStart::uid`].
    pub run_start: String,
    /// Stream name (e.g. "primary", "baseline").
    pub name: String,
    pub time: f64,
    pub data_keys: BTreeMap<String, DataKey>,
    /// Producing device to the set of column names it owns.
    #[serde(default)]
    pub object_keys: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub configuration: BTreeMap<String, ObjectConfig>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl EventDescriptor {
    /// Producing device for a column, by reverse `object_keys` lookup.
    pub fn object_for(&self, key: &str) -> Option<&str> {
        self.object_keys
            .iter()
            .find(|(_, keys)| keys.iter().any(|k| k == key))
            .map(|(object, _)| object.as_str())
    }
}

/// Event document - one row within a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub uid: String,
    /// Links to [`EventDescriptor::uid`].
    pub descriptor: String,
    /// 1-based row index, intended dense and monotone.
    pub seq_num: u64,
    pub time: f64,
    pub data: JsonMap,
    /// Hardware timestamps, column by column.
    #[serde(default)]
    pub timestamps: JsonMap,
    /// Whether an external column has already been filled in place.
    #[serde(default)]
    pub filled: BTreeMap<String, bool>,
}

/// Resource document - a file-level handle on an external artifact.
///
/// Legacy records lack `uid` and are identified by their native primary key;
/// the store adapter surfaces those as `uid = str(_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub uid: String,
    /// Handler selector.
    pub spec: String,
    pub resource_path: String,
    pub root: String,
    #[serde(default)]
    pub resource_kwargs: JsonMap,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Datum document - one addressable record within a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datum {
    /// Globally unique; may embed the resource uid as a `"/"`-separated
    /// prefix. The prefix is an optimistic hint, not a contract.
    pub datum_id: String,
    /// Links to [`Resource::uid`].
    pub resource: String,
    #[serde(default)]
    pub datum_kwargs: JsonMap,
}

/// Event rows batched into field-wise transposed vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub descriptor: String,
    pub uid: Vec<String>,
    pub seq_num: Vec<u64>,
    pub time: Vec<f64>,
    pub data: BTreeMap<String, Vec<Value>>,
    pub timestamps: BTreeMap<String, Vec<Value>>,
    pub filled: BTreeMap<String, Vec<bool>>,
}

/// Datum rows batched into field-wise transposed vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumPage {
    pub resource: String,
    pub datum_id: Vec<String>,
    pub datum_kwargs: BTreeMap<String, Vec<Value>>,
}

/// Tagged union over every document kind the replayer can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "doc", rename_all = "snake_case")]
pub enum Document {
    Start(RunStart),
    Descriptor(EventDescriptor),
    Event(Event),
    EventPage(EventPage),
    Resource(Resource),
    Datum(Datum),
    DatumPage(DatumPage),
    Stop(RunStop),
}

impl Document {
    /// The wire name of this document kind.
    pub fn name(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::EventPage(_) => "event_page",
            Document::Resource(_) => "resource",
            Document::Datum(_) => "datum",
            Document::DatumPage(_) => "datum_page",
            Document::Stop(_) => "stop",
        }
    }
}

/// A pure repair function applied to a stored document on read.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Lazily applied per-kind transforms.
///
/// Transforms shadow stored values with repaired copies at read boundaries;
/// they never propagate back to storage. Construction rejects kinds outside
/// {start, stop, descriptor, resource}.
#[derive(Clone, Default)]
pub struct Transforms {
    start: Option<Transform>,
    stop: Option<Transform>,
    descriptor: Option<Transform>,
    resource: Option<Transform>,
}

impl std::fmt::Debug for Transforms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transforms")
            .field("start", &self.start.is_some())
            .field("stop", &self.stop.is_some())
            .field("descriptor", &self.descriptor.is_some())
            .field("resource", &self.resource.is_some())
            .finish()
    }
}

impl Transforms {
    /// Build from a keyed map, rejecting unsupported kinds.
    pub fn from_map(map: BTreeMap<String, Transform>) -> CatalogResult<Self> {
        let mut transforms = Transforms::default();
        for (kind, func) in map {
            match kind.as_str() {
                "start" => transforms.start = Some(func),
                "stop" => transforms.stop = Some(func),
                "descriptor" => transforms.descriptor = Some(func),
                "resource" => transforms.resource = Some(func),
                other => return Err(CatalogError::UnsupportedTransformKey(other.to_string())),
            }
        }
        Ok(transforms)
    }

    pub fn apply_start(&self, doc: Value) -> Value {
        apply(&self.start, doc)
    }

    pub fn apply_stop(&self, doc: Value) -> Value {
        apply(&self.stop, doc)
    }

    pub fn apply_descriptor(&self, doc: Value) -> Value {
        apply(&self.descriptor, doc)
    }

    pub fn apply_resource(&self, doc: Value) -> Value {
        apply(&self.resource, doc)
    }
}

fn apply(transform: &Option<Transform>, doc: Value) -> Value {
    match transform {
        Some(func) => func(doc),
        None => doc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_start_keeps_user_metadata() {
        let doc: RunStart = serde_json::from_value(json!({
            "uid": "r-1",
            "time": 1700000000.5,
            "scan_id": 42,
            "operator": "alice",
            "sample": {"name": "quartz"}
        }))
        .unwrap();
        assert_eq!(doc.scan_id, 42);
        assert_eq!(doc.extra.get("operator"), Some(&json!("alice")));

        let round = serde_json::to_value(&doc).unwrap();
        assert_eq!(round["sample"]["name"], json!("quartz"));
    }

    #[test]
    fn external_flag_is_truthy_checked() {
        let mut key: DataKey = serde_json::from_value(json!({
            "dtype": "array",
            "shape": [5, 5]
        }))
        .unwrap();
        assert!(!key.is_external());

        key.external = Some(json!("FILESTORE:"));
        assert!(key.is_external());
        key.external = Some(json!(""));
        assert!(!key.is_external());
        key.external = Some(json!(true));
        assert!(key.is_external());
        key.external = Some(json!(false));
        assert!(!key.is_external());
    }

    #[test]
    fn object_reverse_lookup() {
        let descriptor: EventDescriptor = serde_json::from_value(json!({
            "uid": "d-1",
            "run_start": "r-1",
            "name": "primary",
            "time": 1.0,
            "data_keys": {"x": {"dtype": "number", "shape": []}},
            "object_keys": {"motor": ["x", "x_setpoint"]}
        }))
        .unwrap();
        assert_eq!(descriptor.object_for("x"), Some("motor"));
        assert_eq!(descriptor.object_for("y"), None);
    }

    #[test]
    fn document_enum_round_trips_by_name() {
        let event: Event = serde_json::from_value(json!({
            "uid": "e-1",
            "descriptor": "d-1",
            "seq_num": 1,
            "time": 10.0,
            "data": {"x": 1}
        }))
        .unwrap();
        let doc = Document::Event(event);
        assert_eq!(doc.name(), "event");

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["name"], json!("event"));
        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back.name(), "event");
    }

    #[test]
    fn transforms_reject_unknown_kinds() {
        let mut map: BTreeMap<String, Transform> = BTreeMap::new();
        map.insert("event".into(), Arc::new(|doc| doc));
        match Transforms::from_map(map) {
            Err(CatalogError::UnsupportedTransformKey(kind)) => assert_eq!(kind, "event"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn transforms_shadow_on_read() {
        let mut map: BTreeMap<String, Transform> = BTreeMap::new();
        map.insert(
            "start".into(),
            Arc::new(|mut doc: Value| {
                doc["repaired"] = json!(true);
                doc
            }),
        );
        let transforms = Transforms::from_map(map).unwrap();
        let out = transforms.apply_start(json!({"uid": "r-1"}));
        assert_eq!(out["repaired"], json!(true));
        // Kinds without a transform pass through untouched.
        let stop = transforms.apply_stop(json!({"uid": "s-1"}));
        assert_eq!(stop, json!({"uid": "s-1"}));
    }
}
