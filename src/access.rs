//! Access-policy hook.
//!
//! The catalog itself enforces nothing; an optional [`AccessPolicy`] rewrites
//! the accumulated query list for a caller identity, and
//! `Catalog::authenticated_as` rebinds the catalog to the rewritten list. The
//! [`Identity::Admin`] sentinel bypasses rewriting entirely.

use crate::catalog::Catalog;
use crate::error::CatalogResult;
use crate::query::Query;

/// Caller identity presented to the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Sentinel that bypasses query modification.
    Admin,
    Principal(String),
}

impl Identity {
    pub fn principal(name: impl Into<String>) -> Self {
        Identity::Principal(name.into())
    }
}

/// Optional query rewriter keyed on caller identity.
pub trait AccessPolicy: Send + Sync + std::fmt::Debug {
    /// Whether this policy can govern the given catalog at all.
    fn check_compatibility(&self, catalog: &Catalog) -> bool {
        let _ = catalog;
        true
    }

    /// Return the query list to use for `identity`. Raising `AccessDenied`
    /// here is the policy's prerogative, not the core's.
    fn modify_queries(&self, queries: &[Query], identity: &Identity)
        -> CatalogResult<Vec<Query>>;
}
