//! Typed access to the schemaless document database.
//!
//! The [`DocStore`] trait is the seam between the catalog and whatever holds
//! the documents: point lookup, filtered find with projection, distinct, and
//! count, all driven by a typed [`Filter`] predicate tree (the store-native
//! form the query engine translates into). The bundled [`MemStore`] backend
//! evaluates the full predicate language in process and is the reference
//! deployment; the [`adapter`] module layers keyset pagination and the
//! event-table aggregation on top of the trait.
//!
//! Every store call takes a [`StoreCtx`] carrying the caller's deadline and
//! cancellation token; backends check it between units of work so a cancelled
//! aggregation unwinds instead of completing.

pub mod adapter;
pub mod memory;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

pub use adapter::{ChunkedFind, EventTable, StoreAdapter, SubDict};
pub use memory::MemStore;

/// The six collections the engine reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    RunStart,
    RunStop,
    EventDescriptor,
    Event,
    Resource,
    Datum,
}

impl Collection {
    /// Store-side collection name.
    pub fn name(&self) -> &'static str {
        match self {
            Collection::RunStart => "run_start",
            Collection::RunStop => "run_stop",
            Collection::EventDescriptor => "event_descriptor",
            Collection::Event => "event",
            Collection::Resource => "resource",
            Collection::Datum => "datum",
        }
    }

    /// Primary-key field used for keyset tiebreaks.
    pub fn primary_key(&self) -> &'static str {
        match self {
            Collection::Datum => "datum_id",
            _ => "uid",
        }
    }
}

/// Deadline and cancellation carried by every store call.
///
/// Memoization caches key on query parameters only, never on the context.
#[derive(Debug, Clone, Default)]
pub struct StoreCtx {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl StoreCtx {
    /// Context with no deadline and a never-cancelled token.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    /// Fail fast if the caller has given up on this call.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

/// Comparison operator for [`Filter::Cmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Composite sort specification: field path plus direction, in significance
/// order.
pub type SortSpec = Vec<(String, SortOrder)>;

/// Store-native predicate tree.
///
/// Field names are dotted paths into the document. [`Filter::Raw`] carries a
/// native query document through untranslated (equality per field, with a
/// small `$lt`/`$lte`/`$gt`/`$gte`/`$in`/`$ne` operator subset).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    Eq(String, Value),
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
    In(String, Vec<Value>),
    /// String field starts with the given prefix.
    Prefix(String, String),
    /// Full-text predicate; only meaningful on stores reporting
    /// [`DocStore::supports_text_search`].
    Text(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Raw(Value),
}

impl Filter {
    /// Conjunction that collapses trivial cases instead of nesting.
    pub fn and(filters: Vec<Filter>) -> Filter {
        let mut flat: Vec<Filter> = filters
            .into_iter()
            .filter(|f| !matches!(f, Filter::All))
            .collect();
        match flat.len() {
            0 => Filter::All,
            1 => flat.remove(0),
            _ => Filter::And(flat),
        }
    }
}

/// Async document store: the external database the engine reads.
///
/// Implementations must be safe for concurrent readers. The trait is
/// read-only; document ingest belongs to writers outside the core.
#[async_trait]
pub trait DocStore: Send + Sync + std::fmt::Debug {
    /// First document matching `filter`, in unspecified order.
    async fn find_one(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Value>, StoreError>;

    /// Matching documents under a sort, window, and optional projection.
    ///
    /// `projection` names the dotted field paths to retain; the collection's
    /// primary key is always retained.
    async fn find(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        filter: &Filter,
        sort: &SortSpec,
        skip: usize,
        limit: Option<usize>,
        projection: Option<&[String]>,
    ) -> Result<Vec<Value>, StoreError>;

    /// Distinct values of `field` among matching documents.
    async fn distinct(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError>;

    async fn count(
        &self,
        ctx: &StoreCtx,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, StoreError>;

    /// Whether [`Filter::Text`] runs store-side. Catalogs fall back to a
    /// client-side scan when this is false.
    fn supports_text_search(&self) -> bool {
        false
    }
}

/// Open a store from a uri. `mem://<name>` builds the in-process backend;
/// anything else is rejected so misconfiguration fails at startup.
pub fn open_store(uri: &str) -> Result<Arc<dyn DocStore>, StoreError> {
    if let Some(name) = uri.strip_prefix("mem://") {
        if name.is_empty() {
            return Err(StoreError::UnsupportedUri(
                "mem:// uri must carry a database name".into(),
            ));
        }
        return Ok(Arc::new(MemStore::new()));
    }
    Err(StoreError::UnsupportedUri(uri.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ctx_checks_deadline_and_cancellation() {
        assert!(StoreCtx::unbounded().check().is_ok());

        let expired = StoreCtx::with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(matches!(expired.check(), Err(StoreError::DeadlineExceeded)));

        let token = CancellationToken::new();
        let ctx = StoreCtx::with_cancellation(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        assert!(matches!(ctx.check(), Err(StoreError::Cancelled)));
    }

    #[test]
    fn and_collapses_trivial_cases() {
        assert_eq!(Filter::and(vec![]), Filter::All);
        assert_eq!(Filter::and(vec![Filter::All]), Filter::All);
        let single = Filter::and(vec![Filter::All, Filter::Eq("uid".into(), "a".into())]);
        assert_eq!(single, Filter::Eq("uid".into(), "a".into()));
    }

    #[test]
    fn open_store_rejects_unknown_schemes() {
        assert!(open_store("mem://catalog").is_ok());
        assert!(matches!(
            open_store("mem://"),
            Err(StoreError::UnsupportedUri(_))
        ));
        assert!(matches!(
            open_store("mongodb://localhost/db"),
            Err(StoreError::UnsupportedUri(_))
        ));
    }

    #[test]
    fn collection_names_and_keys() {
        assert_eq!(Collection::Event.name(), "event");
        assert_eq!(Collection::Datum.primary_key(), "datum_id");
        assert_eq!(Collection::RunStart.primary_key(), "uid");
    }
}
