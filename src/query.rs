//! Query types and their translation into store predicates.
//!
//! Searches are expressed as [`Query`] values and translated into the store's
//! [`Filter`] language by a [`QueryRegistry`]: a table of translator closures
//! keyed by query-kind tag, pre-loaded with the built-in kinds and open to
//! extension. Catalogs accumulate translated conjuncts; composition happens
//! there, not here.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CatalogError, CatalogResult};
use crate::store::{CmpOp, Filter};

/// One search predicate over the run index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    /// Full-text match; store-native where available, client-side scan
    /// otherwise.
    FullText { text: String },
    /// Store-native query document, passed through untranslated.
    Raw {
        #[serde(rename = "body")]
        query: Value,
    },
    /// Run-uid prefix match.
    PartialUid { prefix: String },
    /// Scan-id equality. Indexing by scan id resolves ties newest-first.
    ScanId { scan_id: i64 },
    /// Half-open time range `[since, until)` on the run-start time.
    TimeRange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<f64>,
    },
}

impl Query {
    /// Registry tag of this query kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Query::FullText { .. } => "full_text",
            Query::Raw { .. } => "raw",
            Query::PartialUid { .. } => "partial_uid",
            Query::ScanId { .. } => "scan_id",
            Query::TimeRange { .. } => "time_range",
        }
    }
}

/// Translator from a query to a store predicate.
pub type QueryTranslator = Arc<dyn Fn(&Query) -> CatalogResult<Filter> + Send + Sync>;

/// Registry of query translators, keyed by kind tag.
#[derive(Clone)]
pub struct QueryRegistry {
    translators: HashMap<String, QueryTranslator>,
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.translators.keys().collect();
        kinds.sort();
        f.debug_struct("QueryRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl QueryRegistry {
    /// Registry pre-loaded with the built-in query kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            translators: HashMap::new(),
        };
        registry.register("full_text", Arc::new(translate_builtin));
        registry.register("raw", Arc::new(translate_builtin));
        registry.register("partial_uid", Arc::new(translate_builtin));
        registry.register("scan_id", Arc::new(translate_builtin));
        registry.register("time_range", Arc::new(translate_builtin));
        registry
    }

    /// Add or replace a translator for a query kind.
    pub fn register(&mut self, kind: &str, translator: QueryTranslator) {
        self.translators.insert(kind.to_string(), translator);
    }

    /// Translate one query into a store predicate.
    pub fn translate(&self, query: &Query) -> CatalogResult<Filter> {
        let translator = self.translators.get(query.kind()).ok_or_else(|| {
            CatalogError::Configuration(format!(
                "no translator registered for query kind '{}'",
                query.kind()
            ))
        })?;
        translator(query)
    }
}

fn translate_builtin(query: &Query) -> CatalogResult<Filter> {
    Ok(match query {
        Query::FullText { text } => Filter::Text(text.clone()),
        Query::Raw { query } => Filter::Raw(query.clone()),
        Query::PartialUid { prefix } => Filter::Prefix("uid".into(), prefix.clone()),
        Query::ScanId { scan_id } => Filter::Eq("scan_id".into(), (*scan_id).into()),
        Query::TimeRange { since, until } => {
            let mut bounds = Vec::new();
            if let Some(since) = since {
                bounds.push(Filter::Cmp {
                    field: "time".into(),
                    op: CmpOp::Gte,
                    value: (*since).into(),
                });
            }
            if let Some(until) = until {
                bounds.push(Filter::Cmp {
                    field: "time".into(),
                    op: CmpOp::Lt,
                    value: (*until).into(),
                });
            }
            Filter::and(bounds)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_translations() {
        let registry = QueryRegistry::with_builtins();

        let filter = registry
            .translate(&Query::PartialUid { prefix: "ab".into() })
            .unwrap();
        assert_eq!(filter, Filter::Prefix("uid".into(), "ab".into()));

        let filter = registry.translate(&Query::ScanId { scan_id: 7 }).unwrap();
        assert_eq!(filter, Filter::Eq("scan_id".into(), json!(7)));

        let filter = registry
            .translate(&Query::TimeRange {
                since: Some(10.0),
                until: Some(20.0),
            })
            .unwrap();
        match filter {
            Filter::And(parts) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }

        // An unbounded range matches everything.
        let filter = registry
            .translate(&Query::TimeRange {
                since: None,
                until: None,
            })
            .unwrap();
        assert_eq!(filter, Filter::All);
    }

    #[test]
    fn custom_translators_can_be_registered() {
        let mut registry = QueryRegistry::with_builtins();
        registry.register(
            "scan_id",
            Arc::new(|query| match query {
                Query::ScanId { scan_id } => {
                    Ok(Filter::Eq("scan_id".into(), json!(scan_id + 1000)))
                }
                other => Err(CatalogError::Configuration(format!(
                    "wrong kind {}",
                    other.kind()
                ))),
            }),
        );
        let filter = registry.translate(&Query::ScanId { scan_id: 7 }).unwrap();
        assert_eq!(filter, Filter::Eq("scan_id".into(), json!(1007)));
    }

    #[test]
    fn queries_serialize_with_kind_tag() {
        let query = Query::FullText {
            text: "tomography".into(),
        };
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["query"], json!("full_text"));
        let back: Query = serde_json::from_value(value).unwrap();
        assert_eq!(back, query);
    }
}
