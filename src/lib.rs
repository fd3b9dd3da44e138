//! # DAQ Catalog Core Library
//!
//! This crate is a read-oriented catalog and materialization engine for
//! scientific experiment runs stored in a schemaless document database. Each
//! run is a heterogeneous collection of immutable metadata documents plus an
//! append-only stream of event documents; the catalog presents every run as a
//! sub-catalog of named event streams, each materialized on demand into typed
//! n-dimensional arrays with labeled dimensions, with transparent
//! dereferencing of external binary payloads.
//!
//! ## Crate Structure
//!
//! The library is organized into modules with distinct responsibilities:
//!
//! - **`catalog`**: The top-level searchable [`Catalog`](catalog::Catalog):
//!   query accumulation, sorting, pagination, and run lookup.
//! - **`run`**: [`Run`](run::Run) and [`Stream`](run::Stream) objects
//!   bundling one acquisition's documents and views.
//! - **`materialize`**: The column materializer turning descriptors and
//!   events into typed datasets, whole or block by block.
//! - **`array`**: Typed n-dimensional column data and the JSON-to-array
//!   coercion rules.
//! - **`chunking`**: Chunk partitioning under a byte ceiling.
//! - **`filler`**: External-reference resolution through registered payload
//!   handlers, with per-resource prefetch.
//! - **`handlers`**: Bundled payload handlers (`npy`).
//! - **`replay`**: Time-merged document replay, single documents or
//!   size-bounded pages.
//! - **`store`**: The document-store trait, the in-memory backend, and the
//!   typed adapter with keyset pagination.
//! - **`query`**: Query types and their translation registry.
//! - **`cache`**: The two-tier (live/complete) run cache.
//! - **`access`**: The optional access-policy hook.
//! - **`documents`**: The typed document model and lazy transforms.
//! - **`config`**: Settings loading and validation.
//! - **`error`**: The crate-wide error types.

pub mod access;
pub mod array;
pub mod catalog;
pub mod chunking;
pub mod config;
pub mod documents;
pub mod error;
pub mod filler;
pub mod handlers;
pub mod materialize;
pub mod query;
pub mod replay;
pub mod run;
pub mod store;

mod cache;

pub use access::{AccessPolicy, Identity};
pub use array::{ColumnData, DataArray, Dataset, Dtype};
pub use catalog::{Catalog, CatalogBuilder, RunCursor};
pub use config::CatalogSettings;
pub use documents::{
    Datum, Document, Event, EventDescriptor, Resource, RunStart, RunStop, Transforms,
};
pub use error::{CatalogError, CatalogResult, StoreError};
pub use filler::{Filler, Handler, HandlerFactory, HandlerRegistry};
pub use materialize::{DatasetSchema, Materializer};
pub use query::{Query, QueryRegistry};
pub use run::{Run, Staleness, Stream};
pub use store::{DocStore, Filter, MemStore, SortOrder, StoreCtx, SubDict};
