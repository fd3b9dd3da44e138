//! Document-stream replay.
//!
//! Replays a run's documents in emission order: the start document, a
//! time-merged interleave of every stream's descriptors and events, and the
//! stop document when present. External references are woven in lazily - the
//! first datum id that points at a not-yet-emitted resource emits the
//! resource document and all of that resource's datums before the referencing
//! event, so a consumer never sees a dangling reference.
//!
//! [`PagedReplay`] packs consecutive events sharing a descriptor into
//! `event_page` documents and consecutive datums sharing a resource into
//! `datum_page` documents, flushing on type change, foreign-key change, the
//! size bound, or any non-batchable document.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::documents::{Datum, DatumPage, Document, Event, EventDescriptor, EventPage};
use crate::error::{CatalogError, CatalogResult};
use crate::run::RunCore;
use crate::store::{ChunkedFind, Collection, Filter, SortOrder, StoreCtx};

enum Stage {
    Start,
    Body,
    Stop,
    Done,
}

enum Item {
    Descriptor(EventDescriptor),
    Event(Event),
}

/// One stream's merged descriptor/event sequence, ordered by time.
struct StreamCursor {
    descriptors: VecDeque<EventDescriptor>,
    events: ChunkedFind,
    peeked: Option<Event>,
    exhausted: bool,
}

impl StreamCursor {
    async fn ensure_peek(&mut self) -> CatalogResult<()> {
        if self.peeked.is_none() && !self.exhausted {
            match self.events.next().await? {
                Some(doc) => {
                    let event: Event = serde_json::from_value(doc).map_err(|source| {
                        CatalogError::MalformedDocument {
                            collection: Collection::Event.name(),
                            source,
                        }
                    })?;
                    self.peeked = Some(event);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    async fn peek_time(&mut self) -> CatalogResult<Option<f64>> {
        self.ensure_peek().await?;
        let descriptor = self.descriptors.front().map(|d| d.time);
        let event = self.peeked.as_ref().map(|e| e.time);
        Ok(match (descriptor, event) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        })
    }

    /// Pop the earliest item; a descriptor precedes its events on a tie.
    async fn pop(&mut self) -> CatalogResult<Option<Item>> {
        self.ensure_peek().await?;
        match (self.descriptors.front(), &self.peeked) {
            (Some(descriptor), Some(event)) if descriptor.time <= event.time => {
                Ok(self.descriptors.pop_front().map(Item::Descriptor))
            }
            (Some(_), None) => Ok(self.descriptors.pop_front().map(Item::Descriptor)),
            (_, Some(_)) => Ok(self.peeked.take().map(Item::Event)),
            (None, None) => Ok(None),
        }
    }
}

/// Single-document replay of one run.
pub struct DocReplay {
    ctx: StoreCtx,
    core: Arc<RunCore>,
    stage: Stage,
    streams: Vec<StreamCursor>,
    descriptors_by_uid: HashMap<String, EventDescriptor>,
    pending: VecDeque<Document>,
    emitted_resources: HashSet<String>,
}

impl DocReplay {
    pub(crate) fn new(ctx: StoreCtx, core: Arc<RunCore>, fill: bool) -> CatalogResult<Self> {
        if fill {
            // Reserved until a definitive semantics exists; materialization
            // is the filled interface.
            return Err(CatalogError::ReplayFillUnsupported);
        }
        let mut streams = Vec::new();
        let mut descriptors_by_uid = HashMap::new();
        for descriptors in core.descriptors.values() {
            let uids: Vec<Value> = descriptors
                .iter()
                .map(|d| Value::from(d.uid.as_str()))
                .collect();
            for descriptor in descriptors {
                descriptors_by_uid.insert(descriptor.uid.clone(), descriptor.clone());
            }
            let events = core.adapter.chunked_find(
                Collection::Event,
                &ctx,
                Filter::In("descriptor".into(), uids),
                vec![("time".to_string(), SortOrder::Asc)],
                0,
                None,
            );
            streams.push(StreamCursor {
                descriptors: descriptors.iter().cloned().collect(),
                events,
                peeked: None,
                exhausted: false,
            });
        }
        Ok(Self {
            ctx,
            core,
            stage: Stage::Start,
            streams,
            descriptors_by_uid,
            pending: VecDeque::new(),
            emitted_resources: HashSet::new(),
        })
    }

    /// Next document in replay order, or `None` after the stop document.
    pub async fn next(&mut self) -> CatalogResult<Option<Document>> {
        loop {
            if let Some(doc) = self.pending.pop_front() {
                return Ok(Some(doc));
            }
            match self.stage {
                Stage::Start => {
                    self.stage = Stage::Body;
                    return Ok(Some(Document::Start(self.core.start.clone())));
                }
                Stage::Body => {
                    let mut earliest: Option<(usize, f64)> = None;
                    for (index, cursor) in self.streams.iter_mut().enumerate() {
                        if let Some(time) = cursor.peek_time().await? {
                            let better = earliest.map_or(true, |(_, best)| time < best);
                            if better {
                                earliest = Some((index, time));
                            }
                        }
                    }
                    match earliest {
                        None => self.stage = Stage::Stop,
                        Some((index, _)) => match self.streams[index].pop().await? {
                            Some(Item::Descriptor(descriptor)) => {
                                self.pending.push_back(Document::Descriptor(descriptor));
                            }
                            Some(Item::Event(event)) => self.stage_event(event).await?,
                            None => {}
                        },
                    }
                }
                Stage::Stop => {
                    self.stage = Stage::Done;
                    if let Some(stop) = &self.core.stop {
                        return Ok(Some(Document::Stop(stop.clone())));
                    }
                }
                Stage::Done => return Ok(None),
            }
        }
    }

    /// Drain the replay.
    pub async fn collect(mut self) -> CatalogResult<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    /// Queue an event, preceded by any resource/datum documents it is the
    /// first to reference.
    async fn stage_event(&mut self, event: Event) -> CatalogResult<()> {
        if let Some(descriptor) = self.descriptors_by_uid.get(&event.descriptor).cloned() {
            for (key, data_key) in &descriptor.data_keys {
                if !data_key.is_external() || event.filled.get(key).copied().unwrap_or(false) {
                    continue;
                }
                if let Some(Value::String(datum_id)) = event.data.get(key) {
                    self.stage_reference(datum_id.clone()).await?;
                }
            }
        }
        self.pending.push_back(Document::Event(event));
        Ok(())
    }

    async fn stage_reference(&mut self, datum_id: String) -> CatalogResult<()> {
        let adapter = self.core.adapter.clone();
        let resource = match datum_id.split_once('/') {
            // Prefix hit on an already-emitted resource: nothing to do.
            Some((prefix, _)) if self.emitted_resources.contains(prefix) => return Ok(()),
            Some((prefix, _)) => match adapter.resource(&self.ctx, prefix).await {
                Ok(resource) => resource,
                Err(CatalogError::ResourceNotFound(_)) => {
                    let datum = adapter.datum(&self.ctx, &datum_id).await?;
                    adapter.resource(&self.ctx, &datum.resource).await?
                }
                Err(other) => return Err(other),
            },
            None => {
                let datum = adapter.datum(&self.ctx, &datum_id).await?;
                adapter.resource(&self.ctx, &datum.resource).await?
            }
        };
        if !self.emitted_resources.insert(resource.uid.clone()) {
            return Ok(());
        }
        let datums = adapter.datums_for_resource(&self.ctx, &resource.uid).await?;
        self.pending.push_back(Document::Resource(resource));
        for datum in datums {
            self.pending.push_back(Document::Datum(datum));
        }
        Ok(())
    }
}

/// Replay with size-bounded page batching.
pub struct PagedReplay {
    inner: DocReplay,
    size: usize,
    queue: VecDeque<Document>,
    events: Vec<Event>,
    datums: Vec<Datum>,
    finished: bool,
}

impl PagedReplay {
    pub(crate) fn new(inner: DocReplay, size: usize) -> Self {
        Self {
            inner,
            size: size.max(1),
            queue: VecDeque::new(),
            events: Vec::new(),
            datums: Vec::new(),
            finished: false,
        }
    }

    /// Next document, with events and datums arriving as pages.
    pub async fn next(&mut self) -> CatalogResult<Option<Document>> {
        loop {
            if let Some(doc) = self.queue.pop_front() {
                return Ok(Some(doc));
            }
            if self.finished {
                return Ok(None);
            }
            match self.inner.next().await? {
                None => {
                    self.flush();
                    self.finished = true;
                }
                Some(Document::Event(event)) => {
                    if !self.datums.is_empty() {
                        self.flush();
                    }
                    if self
                        .events
                        .last()
                        .map(|last| last.descriptor != event.descriptor)
                        .unwrap_or(false)
                    {
                        self.flush();
                    }
                    self.events.push(event);
                    if self.events.len() >= self.size {
                        self.flush();
                    }
                }
                Some(Document::Datum(datum)) => {
                    if !self.events.is_empty() {
                        self.flush();
                    }
                    if self
                        .datums
                        .last()
                        .map(|last| last.resource != datum.resource)
                        .unwrap_or(false)
                    {
                        self.flush();
                    }
                    self.datums.push(datum);
                    if self.datums.len() >= self.size {
                        self.flush();
                    }
                }
                Some(other) => {
                    self.flush();
                    self.queue.push_back(other);
                }
            }
        }
    }

    /// Drain the replay.
    pub async fn collect(mut self) -> CatalogResult<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    fn flush(&mut self) {
        if !self.events.is_empty() {
            let page = transpose_events(&std::mem::take(&mut self.events));
            self.queue.push_back(Document::EventPage(page));
        }
        if !self.datums.is_empty() {
            let page = transpose_datums(&std::mem::take(&mut self.datums));
            self.queue.push_back(Document::DatumPage(page));
        }
    }
}

/// Field-wise transpose of events sharing one descriptor.
fn transpose_events(rows: &[Event]) -> EventPage {
    let mut data: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut timestamps: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut filled: BTreeMap<String, Vec<bool>> = BTreeMap::new();
    for event in rows {
        for key in event.data.keys() {
            data.entry(key.clone()).or_default();
        }
        for key in event.timestamps.keys() {
            timestamps.entry(key.clone()).or_default();
        }
        for key in event.filled.keys() {
            filled.entry(key.clone()).or_default();
        }
    }
    for event in rows {
        for (key, column) in &mut data {
            column.push(event.data.get(key).cloned().unwrap_or(Value::Null));
        }
        for (key, column) in &mut timestamps {
            column.push(event.timestamps.get(key).cloned().unwrap_or(Value::Null));
        }
        for (key, flags) in &mut filled {
            flags.push(event.filled.get(key).copied().unwrap_or(false));
        }
    }
    EventPage {
        descriptor: rows.first().map(|e| e.descriptor.clone()).unwrap_or_default(),
        uid: rows.iter().map(|e| e.uid.clone()).collect(),
        seq_num: rows.iter().map(|e| e.seq_num).collect(),
        time: rows.iter().map(|e| e.time).collect(),
        data,
        timestamps,
        filled,
    }
}

/// Field-wise transpose of datums sharing one resource.
fn transpose_datums(rows: &[Datum]) -> DatumPage {
    let mut datum_kwargs: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for datum in rows {
        for key in datum.datum_kwargs.keys() {
            datum_kwargs.entry(key.clone()).or_default();
        }
    }
    for datum in rows {
        for (key, column) in &mut datum_kwargs {
            column.push(datum.datum_kwargs.get(key).cloned().unwrap_or(Value::Null));
        }
    }
    DatumPage {
        resource: rows.first().map(|d| d.resource.clone()).unwrap_or_default(),
        datum_id: rows.iter().map(|d| d.datum_id.clone()).collect(),
        datum_kwargs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::Transforms;
    use crate::run::RunOptions;
    use crate::store::{MemStore, StoreAdapter};
    use serde_json::json;
    use std::collections::BTreeMap as StdBTreeMap;

    async fn core_over(store: Arc<MemStore>, uid: &str) -> Arc<RunCore> {
        let adapter = StoreAdapter::new(store.clone(), store, Arc::new(Transforms::default()));
        Arc::new(
            RunCore::load(
                &StoreCtx::unbounded(),
                adapter,
                uid,
                HashMap::new(),
                Arc::new(StdBTreeMap::new()),
                RunOptions::default(),
            )
            .await
            .unwrap(),
        )
    }

    fn seed_two_stream_run(store: &MemStore) {
        store.insert(
            Collection::RunStart,
            json!({"uid": "r-1", "time": 0.0, "scan_id": 1}),
        );
        store.insert(
            Collection::RunStop,
            json!({"uid": "s-1", "run_start": "r-1", "time": 99.0, "exit_status": "success"}),
        );
        for (uid, name, time) in [("d-a", "A", 0.1), ("d-b", "B", 0.2)] {
            store.insert(
                Collection::EventDescriptor,
                json!({"uid": uid, "run_start": "r-1", "name": name, "time": time,
                       "data_keys": {"x": {"dtype": "number", "shape": []}}}),
            );
        }
        // A at 1, 3, 5; B at 2, 4.
        for (descriptor, seq, time) in
            [("d-a", 1, 1.0), ("d-a", 2, 3.0), ("d-a", 3, 5.0), ("d-b", 1, 2.0), ("d-b", 2, 4.0)]
        {
            store.insert(
                Collection::Event,
                json!({"uid": format!("{descriptor}-{seq}"), "descriptor": descriptor,
                       "seq_num": seq, "time": time, "data": {"x": time},
                       "timestamps": {"x": time}}),
            );
        }
    }

    #[tokio::test]
    async fn replay_merges_streams_by_time() {
        let store = Arc::new(MemStore::new());
        seed_two_stream_run(&store);
        let core = core_over(store, "r-1").await;
        let replay = DocReplay::new(StoreCtx::unbounded(), core, false).unwrap();
        let docs = replay.collect().await.unwrap();

        let names: Vec<&str> = docs.iter().map(Document::name).collect();
        assert_eq!(
            names,
            vec![
                "start", "descriptor", "descriptor", "event", "event", "event", "event",
                "event", "stop"
            ]
        );
        let times: Vec<f64> = docs
            .iter()
            .filter_map(|doc| match doc {
                Document::Event(e) => Some(e.time),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn fill_is_reserved() {
        let store = Arc::new(MemStore::new());
        seed_two_stream_run(&store);
        let core = core_over(store, "r-1").await;
        assert!(matches!(
            DocReplay::new(StoreCtx::unbounded(), core, true),
            Err(CatalogError::ReplayFillUnsupported)
        ));
    }

    #[tokio::test]
    async fn external_references_emit_resource_then_datums() {
        let store = Arc::new(MemStore::new());
        store.insert(
            Collection::RunStart,
            json!({"uid": "r-1", "time": 0.0, "scan_id": 1}),
        );
        store.insert(
            Collection::EventDescriptor,
            json!({"uid": "d-1", "run_start": "r-1", "name": "primary", "time": 0.1,
                   "data_keys": {"img": {"dtype": "array", "shape": [2, 2],
                                          "external": "FILESTORE:"}}}),
        );
        store.insert(
            Collection::Resource,
            json!({"uid": "R1", "spec": "npy", "resource_path": "a.npy", "root": "/data",
                   "resource_kwargs": {}}),
        );
        for datum_id in ["R1/D1", "R1/D2"] {
            store.insert(
                Collection::Datum,
                json!({"datum_id": datum_id, "resource": "R1", "datum_kwargs": {}}),
            );
        }
        for (seq, datum_id) in [(1, "R1/D1"), (2, "R1/D2")] {
            store.insert(
                Collection::Event,
                json!({"uid": format!("e-{seq}"), "descriptor": "d-1", "seq_num": seq,
                       "time": seq as f64, "data": {"img": datum_id},
                       "timestamps": {"img": seq as f64},
                       "filled": {"img": false}}),
            );
        }

        let core = core_over(store, "r-1").await;
        let replay = DocReplay::new(StoreCtx::unbounded(), core, false).unwrap();
        let docs = replay.collect().await.unwrap();
        let names: Vec<&str> = docs.iter().map(Document::name).collect();
        // Resource and both datums precede the first referencing event; the
        // second event needs nothing re-emitted.
        assert_eq!(
            names,
            vec!["start", "descriptor", "resource", "datum", "datum", "event", "event"]
        );
    }

    #[tokio::test]
    async fn pages_batch_and_flush_on_size_and_type() {
        let store = Arc::new(MemStore::new());
        seed_two_stream_run(&store);
        let core = core_over(store, "r-1").await;
        let replay = DocReplay::new(StoreCtx::unbounded(), core, false).unwrap();
        let docs = PagedReplay::new(replay, 2).collect().await.unwrap();

        let names: Vec<&str> = docs.iter().map(Document::name).collect();
        // Merge order alternates descriptors (d-a, d-b, d-a, d-b, d-a), so
        // every event lands in its own single-row page.
        assert_eq!(
            names,
            vec![
                "start", "descriptor", "descriptor", "event_page", "event_page",
                "event_page", "event_page", "event_page", "stop"
            ]
        );
        match &docs[3] {
            Document::EventPage(page) => {
                assert_eq!(page.seq_num, vec![1]);
                assert_eq!(page.data["x"], vec![json!(1.0)]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pages_group_same_descriptor_rows() {
        let store = Arc::new(MemStore::new());
        store.insert(
            Collection::RunStart,
            json!({"uid": "r-1", "time": 0.0, "scan_id": 1}),
        );
        store.insert(
            Collection::EventDescriptor,
            json!({"uid": "d-1", "run_start": "r-1", "name": "primary", "time": 0.1,
                   "data_keys": {"x": {"dtype": "integer", "shape": []}}}),
        );
        for seq in 1u64..=5 {
            store.insert(
                Collection::Event,
                json!({"uid": format!("e-{seq}"), "descriptor": "d-1", "seq_num": seq,
                       "time": seq as f64, "data": {"x": seq},
                       "timestamps": {"x": seq as f64}}),
            );
        }
        let core = core_over(store, "r-1").await;
        let replay = DocReplay::new(StoreCtx::unbounded(), core, false).unwrap();
        let docs = PagedReplay::new(replay, 2).collect().await.unwrap();
        let names: Vec<&str> = docs.iter().map(Document::name).collect();
        // Five consecutive rows with page size 2: 2 + 2 + 1.
        assert_eq!(
            names,
            vec!["start", "descriptor", "event_page", "event_page", "event_page"]
        );
        match &docs[2] {
            Document::EventPage(page) => assert_eq!(page.seq_num, vec![1, 2]),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
