//! Catalog settings.
//!
//! Deserializable knobs loaded from a TOML file and the environment through
//! the `config` crate, then validated semantically before use. Code-level
//! options (handler registry, transforms, query translators, access policy)
//! are wired on the catalog builder, not here.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CatalogError, CatalogResult};

/// Environment prefix: `DAQ_CATALOG_STORE_URI`, `DAQ_CATALOG_CACHE_SIZE`, ...
const ENV_PREFIX: &str = "DAQ_CATALOG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// How to reach the document store; must carry the database name.
    /// `mem://<name>` selects the in-process backend.
    pub store_uri: String,
    /// Optional second store for resources and datums; defaults to
    /// `store_uri`.
    pub asset_store_uri: Option<String>,
    /// `old_root` to `new_root` substitutions applied before handler
    /// construction.
    pub root_map: BTreeMap<String, String>,
    /// TTL for completed runs (e.g. `"60s"`).
    #[serde(with = "humantime_serde")]
    pub cache_ttl_complete: Duration,
    /// TTL for live runs (e.g. `"2s"`).
    #[serde(with = "humantime_serde")]
    pub cache_ttl_partial: Duration,
    /// Max cached runs per tier.
    pub cache_size: u64,
    /// Byte ceiling for one materialized chunk.
    pub chunk_byte_limit: usize,
    /// Frame-group size for rank-4 area-detector chunking.
    pub area_detector_frames_per_chunk: usize,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            store_uri: "mem://catalog".to_string(),
            asset_store_uri: None,
            root_map: BTreeMap::new(),
            cache_ttl_complete: Duration::from_secs(60),
            cache_ttl_partial: Duration::from_secs(2),
            cache_size: 100,
            chunk_byte_limit: 100 * 1024 * 1024,
            area_detector_frames_per_chunk: 10,
        }
    }
}

impl CatalogSettings {
    /// Load settings from an optional TOML file with environment overrides.
    pub fn load(path: Option<&Path>) -> CatalogResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).separator("__"),
        );
        let settings: CatalogSettings = builder
            .build()
            .map_err(|e| CatalogError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CatalogError::Configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> CatalogResult<()> {
        if self.store_uri.is_empty() {
            return Err(CatalogError::Configuration("store_uri must be set".into()));
        }
        if self.cache_size == 0 {
            return Err(CatalogError::Configuration(
                "cache_size must be at least 1".into(),
            ));
        }
        if self.chunk_byte_limit == 0 {
            return Err(CatalogError::Configuration(
                "chunk_byte_limit must be positive".into(),
            ));
        }
        if self.area_detector_frames_per_chunk == 0 {
            return Err(CatalogError::Configuration(
                "area_detector_frames_per_chunk must be positive".into(),
            ));
        }
        if self.cache_ttl_partial > self.cache_ttl_complete {
            return Err(CatalogError::Configuration(
                "cache_ttl_partial must not exceed cache_ttl_complete".into(),
            ));
        }
        Ok(())
    }
}
