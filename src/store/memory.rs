//! In-process document store backend.
//!
//! `MemStore` keeps each collection as a plain vector of JSON documents
//! behind a `parking_lot` read-write lock and evaluates the whole [`Filter`]
//! predicate language, including text search. It is the reference deployment
//! (`mem://` uris) and the substrate for the test suite and the CLI's JSONL
//! archives. Ingest is inherent to this type, not part of [`DocStore`]: the
//! core never writes documents.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::documents::Document;
use crate::error::StoreError;

use super::{CmpOp, Collection, DocStore, Filter, SortOrder, SortSpec, StoreCtx};

#[derive(Debug, Default)]
pub struct MemStore {
    collections: RwLock<HashMap<Collection, Vec<Value>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one raw document to a collection.
    pub fn insert(&self, collection: Collection, doc: Value) {
        self.collections
            .write()
            .entry(collection)
            .or_default()
            .push(doc);
    }

    /// Append a typed document, routed to its collection.
    ///
    /// Page documents are not storable; writers emit single rows.
    pub fn insert_document(&self, doc: &Document) -> Result<(), StoreError> {
        let (collection, value) = match doc {
            Document::Start(d) => (Collection::RunStart, serde_json::to_value(d)),
            Document::Stop(d) => (Collection::RunStop, serde_json::to_value(d)),
            Document::Descriptor(d) => (Collection::EventDescriptor, serde_json::to_value(d)),
            Document::Event(d) => (Collection::Event, serde_json::to_value(d)),
            Document::Resource(d) => (Collection::Resource, serde_json::to_value(d)),
            Document::Datum(d) => (Collection::Datum, serde_json::to_value(d)),
            Document::EventPage(_) | Document::DatumPage(_) => {
                return Err(StoreError::Permanent(
                    "page documents cannot be stored; insert single rows".into(),
                ))
            }
        };
        let value = value.map_err(|e| StoreError::Permanent(e.to_string()))?;
        self.insert(collection, value);
        Ok(())
    }

    /// Load a JSONL archive of `{"name": ..., "doc": ...}` lines.
    ///
    /// Returns the number of documents ingested.
    pub fn load_jsonl(&self, path: &Path) -> Result<usize, StoreError> {
        let file = std::fs::File::open(path)
            .map_err(|e| StoreError::Permanent(format!("cannot open {}: {e}", path.display())))?;
        let reader = std::io::BufReader::new(file);
        let mut count = 0;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| StoreError::Permanent(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Document = serde_json::from_str(&line).map_err(|e| {
                StoreError::Permanent(format!("{}:{}: {e}", path.display(), line_no + 1))
            })?;
            self.insert_document(&doc)?;
            count += 1;
        }
        Ok(count)
    }

    fn matching(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.read();
        let docs = collections.get(&collection).map(Vec::as_slice).unwrap_or(&[]);
        let mut out = Vec::new();
        for (index, doc) in docs.iter().enumerate() {
            // Cheap cooperative cancellation between documents.
            if index % 256 == 0 {
                ctx.check()?;
            }
            if matches(doc, filter) {
                out.push(doc.clone());
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DocStore for MemStore {
    async fn find_one(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Value>, StoreError> {
        ctx.check()?;
        let collections = self.collections.read();
        let docs = collections.get(&collection).map(Vec::as_slice).unwrap_or(&[]);
        Ok(docs.iter().find(|doc| matches(doc, filter)).cloned())
    }

    async fn find(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        filter: &Filter,
        sort: &SortSpec,
        skip: usize,
        limit: Option<usize>,
        projection: Option<&[String]>,
    ) -> Result<Vec<Value>, StoreError> {
        ctx.check()?;
        let mut docs = self.matching(ctx, collection, filter)?;
        if !sort.is_empty() {
            docs.sort_by(|a, b| compare_by_spec(a, b, sort));
        }
        let mut window: Vec<Value> = docs
            .into_iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        if let Some(fields) = projection {
            let pk = collection.primary_key();
            for doc in &mut window {
                *doc = project(doc, fields, pk);
            }
        }
        ctx.check()?;
        Ok(window)
    }

    async fn distinct(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        ctx.check()?;
        let docs = self.matching(ctx, collection, filter)?;
        let mut seen: Vec<Value> = Vec::new();
        for doc in &docs {
            if let Some(value) = lookup(doc, field) {
                if !seen.contains(value) {
                    seen.push(value.clone());
                }
            }
        }
        Ok(seen)
    }

    async fn count(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        ctx.check()?;
        Ok(self.matching(ctx, collection, filter)?.len() as u64)
    }

    fn supports_text_search(&self) -> bool {
        true
    }
}

/// Resolve a dotted field path inside a document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Total order over JSON values: null < bool < number < string < array <
/// object, numbers by f64, everything else by serialized form.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn compare_by_spec(a: &Value, b: &Value, sort: &SortSpec) -> Ordering {
    for (field, order) in sort {
        let null = Value::Null;
        let left = lookup(a, field).unwrap_or(&null);
        let right = lookup(b, field).unwrap_or(&null);
        let ordering = compare_values(left, right);
        let ordering = match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn matches(doc: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::All => true,
        Filter::Eq(field, value) => lookup(doc, field) == Some(value),
        Filter::Cmp { field, op, value } => match lookup(doc, field) {
            Some(actual) => {
                let ordering = compare_values(actual, value);
                match op {
                    CmpOp::Gt => ordering == Ordering::Greater,
                    CmpOp::Gte => ordering != Ordering::Less,
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Lte => ordering != Ordering::Greater,
                }
            }
            None => false,
        },
        Filter::In(field, values) => match lookup(doc, field) {
            Some(actual) => values.contains(actual),
            None => false,
        },
        Filter::Prefix(field, prefix) => match lookup(doc, field) {
            Some(Value::String(s)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        Filter::Text(needle) => {
            let haystack = doc.to_string().to_lowercase();
            haystack.contains(&needle.to_lowercase())
        }
        Filter::And(filters) => filters.iter().all(|f| matches(doc, f)),
        Filter::Or(filters) => filters.iter().any(|f| matches(doc, f)),
        Filter::Raw(query) => matches_raw(doc, query),
    }
}

/// Native-query passthrough: a conjunction of per-field conditions, each an
/// equality or a small operator document.
fn matches_raw(doc: &Value, query: &Value) -> bool {
    let Some(conditions) = query.as_object() else {
        return false;
    };
    conditions.iter().all(|(field, condition)| {
        let actual = lookup(doc, field);
        match condition.as_object() {
            Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, operand)| match (op.as_str(), actual) {
                    ("$ne", actual) => actual != Some(operand),
                    ("$in", _) => match (operand.as_array(), actual) {
                        (Some(values), Some(actual)) => values.contains(actual),
                        _ => false,
                    },
                    (cmp, Some(actual)) => {
                        let ordering = compare_values(actual, operand);
                        match cmp {
                            "$lt" => ordering == Ordering::Less,
                            "$lte" => ordering != Ordering::Greater,
                            "$gt" => ordering == Ordering::Greater,
                            "$gte" => ordering != Ordering::Less,
                            _ => false,
                        }
                    }
                    _ => false,
                })
            }
            _ => actual == Some(condition),
        }
    })
}

/// Keep only the requested dotted paths (plus the primary key).
fn project(doc: &Value, fields: &[String], primary_key: &str) -> Value {
    let mut out = serde_json::Map::new();
    let mut retain = |path: &str| {
        if let Some(value) = lookup(doc, path) {
            set_path(&mut out, path, value.clone());
        }
    };
    retain(primary_key);
    for field in fields {
        retain(field);
    }
    Value::Object(out)
}

fn set_path(map: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> MemStore {
        let store = MemStore::new();
        for (uid, scan, time) in [("a", 1, 10.0), ("b", 2, 20.0), ("c", 2, 30.0)] {
            store.insert(
                Collection::RunStart,
                json!({"uid": uid, "scan_id": scan, "time": time, "plan": "count"}),
            );
        }
        store
    }

    #[tokio::test]
    async fn find_sorts_and_windows() {
        let store = seeded();
        let ctx = StoreCtx::unbounded();
        let sort = vec![("time".to_string(), SortOrder::Desc)];
        let docs = store
            .find(&ctx, Collection::RunStart, &Filter::All, &sort, 1, Some(1), None)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["uid"], json!("b"));
    }

    #[tokio::test]
    async fn filters_compose() {
        let store = seeded();
        let ctx = StoreCtx::unbounded();
        let filter = Filter::And(vec![
            Filter::Eq("scan_id".into(), json!(2)),
            Filter::Cmp {
                field: "time".into(),
                op: CmpOp::Gte,
                value: json!(25.0),
            },
        ]);
        let count = store.count(&ctx, Collection::RunStart, &filter).await.unwrap();
        assert_eq!(count, 1);

        let prefix = Filter::Prefix("uid".into(), "a".into());
        assert_eq!(
            store.count(&ctx, Collection::RunStart, &prefix).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn raw_queries_support_operator_subset() {
        let store = seeded();
        let ctx = StoreCtx::unbounded();
        let raw = Filter::Raw(json!({"time": {"$gte": 15.0, "$lt": 30.0}, "plan": "count"}));
        let docs = store
            .find_one(&ctx, Collection::RunStart, &raw)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(docs["uid"], json!("b"));
    }

    #[tokio::test]
    async fn text_search_scans_whole_document() {
        let store = seeded();
        let ctx = StoreCtx::unbounded();
        assert!(store.supports_text_search());
        let hits = store
            .count(&ctx, Collection::RunStart, &Filter::Text("COUNT".into()))
            .await
            .unwrap();
        assert_eq!(hits, 3);
    }

    #[tokio::test]
    async fn distinct_preserves_first_seen_order() {
        let store = seeded();
        let ctx = StoreCtx::unbounded();
        let values = store
            .distinct(&ctx, Collection::RunStart, "scan_id", &Filter::All)
            .await
            .unwrap();
        assert_eq!(values, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn projection_keeps_requested_paths_and_pk() {
        let store = MemStore::new();
        store.insert(
            Collection::Event,
            json!({"uid": "e1", "descriptor": "d1", "seq_num": 1, "time": 1.0,
                   "data": {"x": 1, "y": 2}, "timestamps": {"x": 1.5, "y": 1.5}}),
        );
        let ctx = StoreCtx::unbounded();
        let fields = vec!["seq_num".to_string(), "data.x".to_string()];
        let docs = store
            .find(&ctx, Collection::Event, &Filter::All, &vec![], 0, None, Some(&fields))
            .await
            .unwrap();
        assert_eq!(docs[0], json!({"uid": "e1", "seq_num": 1, "data": {"x": 1}}));
    }

    #[tokio::test]
    async fn cancelled_context_unwinds() {
        let store = seeded();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let ctx = StoreCtx::with_cancellation(token);
        let result = store.count(&ctx, Collection::RunStart, &Filter::All).await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[test]
    fn jsonl_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.jsonl");
        let lines = [
            json!({"name": "start", "doc": {"uid": "r1", "time": 1.0, "scan_id": 1}}),
            json!({"name": "stop", "doc": {"uid": "s1", "run_start": "r1", "time": 2.0,
                                            "exit_status": "success"}}),
        ];
        let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
        std::fs::write(&path, body).unwrap();

        let store = MemStore::new();
        assert_eq!(store.load_jsonl(&path).unwrap(), 2);
        let collections = store.collections.read();
        assert_eq!(collections[&Collection::RunStart].len(), 1);
        assert_eq!(collections[&Collection::RunStop].len(), 1);
    }
}
