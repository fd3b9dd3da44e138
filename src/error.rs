//! Custom error types for the catalog engine.
//!
//! This module defines the primary error type, `CatalogError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from document-store I/O to schema problems found during materialization.
//!
//! ## Error Hierarchy
//!
//! `CatalogError` consolidates several error sources:
//!
//! - **Not-found family** (`RunNotFound`, `StreamNotFound`, `ResourceNotFound`,
//!   `DatumNotFound`, `FieldNotFound`): the requested entity does not exist.
//!   These are surfaced to the caller and never logged as errors.
//! - **Schema family** (`BadShapeMetadata`, `UnsupportedDtype`,
//!   `UnsupportedTransformKey`): the declared schema and the stored data
//!   disagree, or the configuration names a document kind that cannot carry a
//!   transform.
//! - **`Store`**: wraps `StoreError`, which distinguishes transient failures
//!   (callers may retry) from permanent ones. The core never retries
//!   internally.
//! - **Filler family** (`UnresolvableExternalReference`, `DuplicateHandler`,
//!   `MissingHandler`, `Handler`): external-reference resolution failures.
//!
//! By using `#[from]`, `CatalogError` can be seamlessly created from
//! underlying error types, simplifying error handling throughout the crate
//! with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Primary error type for the catalog engine.
///
/// Errors carry the run uid and, where applicable, the stream name and column
/// key, so a caller can report failures without re-deriving context.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("stream '{stream}' not found in run '{run_uid}'")]
    StreamNotFound { run_uid: String, stream: String },

    #[error("resource '{0}' not found")]
    ResourceNotFound(String),

    #[error("datum '{0}' not found")]
    DatumNotFound(String),

    #[error("field '{key}' not found in stream '{stream}' of run '{run_uid}'")]
    FieldNotFound {
        run_uid: String,
        stream: String,
        key: String,
    },

    /// Declared and observed shapes disagree beyond the pad/trim tolerance.
    #[error("bad shape metadata for '{key}': declared {declared:?}, actual {actual:?}")]
    BadShapeMetadata {
        key: String,
        declared: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unsupported dtype for '{key}': {reason}")]
    UnsupportedDtype { key: String, reason: String },

    #[error("unsupported transform key '{0}' (expected one of: start, stop, descriptor, resource)")]
    UnsupportedTransformKey(String),

    /// The filler re-entered resolution for the same datum id twice.
    #[error("unresolvable external reference '{datum_id}' in run '{run_uid}'")]
    UnresolvableExternalReference { run_uid: String, datum_id: String },

    #[error("a handler for spec '{0}' is already registered (register with overwrite to replace)")]
    DuplicateHandler(String),

    #[error("no handler registered for spec '{0}'")]
    MissingHandler(String),

    #[error("handler for spec '{spec}' failed: {message}")]
    Handler { spec: String, message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("malformed document in collection '{collection}': {source}")]
    MalformedDocument {
        collection: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Replay with `fill = true` is reserved; the materialization path is the
    /// filled interface.
    #[error("document replay does not support fill=true")]
    ReplayFillUnsupported,

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Failures originating in the document store.
///
/// Transient variants may be retried by the caller; the core itself never
/// retries.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("permanent store failure: {0}")]
    Permanent(String),

    #[error("store call exceeded its deadline")]
    DeadlineExceeded,

    #[error("store call was cancelled")]
    Cancelled,

    #[error("unsupported store uri '{0}'")]
    UnsupportedUri(String),
}

impl StoreError {
    /// Whether a retry of the same call could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::DeadlineExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Transient("socket reset".into()).is_transient());
        assert!(StoreError::DeadlineExceeded.is_transient());
        assert!(!StoreError::Permanent("bad database name".into()).is_transient());
        assert!(!StoreError::Cancelled.is_transient());
    }

    #[test]
    fn errors_carry_context() {
        let err = CatalogError::BadShapeMetadata {
            key: "image".into(),
            declared: vec![10, 10],
            actual: vec![5, 5],
        };
        let text = err.to_string();
        assert!(text.contains("image"));
        assert!(text.contains("[10, 10]"));

        let err = CatalogError::UnresolvableExternalReference {
            run_uid: "r-1".into(),
            datum_id: "R1/D9".into(),
        };
        assert!(err.to_string().contains("R1/D9"));
    }
}
