use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::types::TimeoutPolicy;

const DEFAULT_VECTOR_MEMORY_LIMIT: usize = 4 * 1024 * 1024 * 1024; // 4 GiB

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingSection,
    pub search: SearchSection,
    pub cursor: CursorSection,
    pub gc: GcSection,
    pub workers: WorkersSection,
    pub vector: VectorSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("HYBRIDEX_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from an explicit file path (missing files are skipped), then
    /// apply `HYBRIDEX__SECTION__KEY` environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();

        if path.exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("HYBRIDEX")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory settings.
    pub fn validate(&self) -> Result<()> {
        TimeoutPolicy::parse(&self.search.on_timeout)?;
        crate::pipeline::scorer::ScorerKind::parse(&self.search.default_scorer)?;
        if !(1..=4).contains(&self.search.default_dialect) {
            bail!("search.default_dialect must be between 1 and 4");
        }
        if self.search.yield_every == 0 {
            bail!("search.yield_every must be positive");
        }
        if self.gc.enabled && self.gc.run_interval_ms == 0 {
            bail!("gc.run_interval_ms must be positive when gc is enabled");
        }
        if self.cursor.reaper_interval_ms == 0 {
            bail!("cursor.reaper_interval_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.vector.block_memory_fraction)
            || self.vector.block_memory_fraction == 0.0
        {
            bail!("vector.block_memory_fraction must be in (0, 1]");
        }
        if self.server.protocol != 2 && self.server.protocol != 3 {
            bail!("server.protocol must be 2 or 3");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// HTTP surface; 0 disables it
    pub http_port: u16,
    /// Default reply protocol for new connections
    pub protocol: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6380,
            http_port: 3000,
            protocol: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub timeout_ms: u64,
    pub on_timeout: String,
    /// Results produced between deadline checks
    pub yield_every: usize,
    pub union_heap_threshold: usize,
    pub max_prefix_expansions: usize,
    pub min_prefix: usize,
    pub default_dialect: u32,
    pub default_scorer: String,
    pub max_search_results: u64,
    pub max_aggregate_results: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            on_timeout: "return".to_string(),
            yield_every: 1000,
            union_heap_threshold: 20,
            max_prefix_expansions: 200,
            min_prefix: 2,
            default_dialect: 1,
            default_scorer: "TFIDF".to_string(),
            max_search_results: 1_000_000,
            max_aggregate_results: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CursorSection {
    pub max_idle_ms: u64,
    pub read_size: usize,
    pub reaper_interval_ms: u64,
    pub max_per_index: usize,
}

impl Default for CursorSection {
    fn default() -> Self {
        Self {
            max_idle_ms: 300_000,
            read_size: 1000,
            reaper_interval_ms: 1000,
            max_per_index: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcSection {
    pub enabled: bool,
    pub run_interval_ms: u64,
    /// Tombstones below which a cycle does no work
    pub clean_threshold: usize,
}

impl Default for GcSection {
    fn default() -> Self {
        Self {
            enabled: true,
            run_interval_ms: 30_000,
            clean_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WorkersSection {
    /// Worker threads; 0 runs everything in place
    pub threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VectorSection {
    pub memory_limit_bytes: usize,
    /// Fraction of the memory limit one vector block may occupy
    pub block_memory_fraction: f64,
    /// Pending tiered deletes before repair runs inline
    pub swap_job_threshold: usize,
    /// Frontend buffer size that triggers migration when no workers run
    pub tiered_buffer_limit: usize,
    /// Hybrid batch size; 0 derives it from the filter selectivity
    pub hybrid_batch_size: usize,
}

impl Default for VectorSection {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_VECTOR_MEMORY_LIMIT,
            block_memory_fraction: 0.1,
            swap_job_threshold: 1024,
            tiered_buffer_limit: 1024,
            hybrid_batch_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let mut config = AppConfig::default();
        config.search.on_timeout = "explode".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gc_interval_must_be_positive() {
        let mut config = AppConfig::default();
        config.gc.run_interval_ms = 0;
        assert!(config.validate().is_err());
        config.gc.enabled = false;
        assert!(config.validate().is_ok());
    }
}
