//! Configuration types

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheResult, ConfigError};
use crate::identity::ByteSize;

const DEFAULT_GLOBAL_CAP_BYTES: ByteSize = 2 * 1024 * 1024 * 1024;
const DEFAULT_SOURCE_CAP_BYTES: ByteSize = 512 * 1024 * 1024;
const DEFAULT_LOW_WATER_RATIO: f64 = 0.9;
const DEFAULT_EVICTION_BATCH: usize = 64;
const DEFAULT_INDEX_MAP_SIZE_BYTES: usize = 256 * 1024 * 1024;

/// Cache configuration.
///
/// `data_dir` must be application-private: the index lives in
/// `data_dir/index` and blobs in `data_dir/content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_global_cap")]
    pub global_cap_bytes: ByteSize,
    #[serde(default = "default_source_cap")]
    pub default_source_cap_bytes: ByteSize,
    /// Per-source overrides of `default_source_cap_bytes`.
    #[serde(default)]
    pub source_caps: HashMap<String, ByteSize>,
    /// Eviction runs down to `cap * low_water_ratio`.
    #[serde(default = "default_low_water_ratio")]
    pub low_water_ratio: f64,
    /// Number of candidates fetched from the index per eviction round.
    #[serde(default = "default_eviction_batch")]
    pub eviction_batch: usize,
    /// LMDB map size for the metadata index.
    #[serde(default = "default_index_map_size")]
    pub index_map_size_bytes: usize,
}

fn default_global_cap() -> ByteSize {
    DEFAULT_GLOBAL_CAP_BYTES
}

fn default_source_cap() -> ByteSize {
    DEFAULT_SOURCE_CAP_BYTES
}

fn default_low_water_ratio() -> f64 {
    DEFAULT_LOW_WATER_RATIO
}

fn default_eviction_batch() -> usize {
    DEFAULT_EVICTION_BATCH
}

fn default_index_map_size() -> usize {
    DEFAULT_INDEX_MAP_SIZE_BYTES
}

impl CacheConfig {
    /// Create a config rooted at `data_dir` with default caps.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            global_cap_bytes: DEFAULT_GLOBAL_CAP_BYTES,
            default_source_cap_bytes: DEFAULT_SOURCE_CAP_BYTES,
            source_caps: HashMap::new(),
            low_water_ratio: DEFAULT_LOW_WATER_RATIO,
            eviction_batch: DEFAULT_EVICTION_BATCH,
            index_map_size_bytes: DEFAULT_INDEX_MAP_SIZE_BYTES,
        }
    }

    /// Set the global cap.
    pub fn with_global_cap(mut self, bytes: ByteSize) -> Self {
        self.global_cap_bytes = bytes;
        self
    }

    /// Set the cap applied to sources without an override.
    pub fn with_default_source_cap(mut self, bytes: ByteSize) -> Self {
        self.default_source_cap_bytes = bytes;
        self
    }

    /// Override the cap of a single source.
    pub fn with_source_cap(mut self, source_id: impl Into<String>, bytes: ByteSize) -> Self {
        self.source_caps.insert(source_id.into(), bytes);
        self
    }

    /// Set the hysteresis ratio.
    pub fn with_low_water_ratio(mut self, ratio: f64) -> Self {
        self.low_water_ratio = ratio;
        self
    }

    /// Set the eviction batch size.
    pub fn with_eviction_batch(mut self, batch: usize) -> Self {
        self.eviction_batch = batch;
        self
    }

    /// Set the LMDB map size.
    pub fn with_index_map_size(mut self, bytes: usize) -> Self {
        self.index_map_size_bytes = bytes;
        self
    }

    /// Load a config from a TOML file.
    pub fn from_path(path: &Path) -> CacheResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a config from TOML.
    pub fn from_toml_str(contents: &str) -> CacheResult<Self> {
        let config: CacheConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn content_dir(&self) -> PathBuf {
        self.data_dir.join("content")
    }

    /// Cap for one source.
    pub fn source_cap(&self, source_id: &str) -> ByteSize {
        self.source_caps
            .get(source_id)
            .copied()
            .unwrap_or(self.default_source_cap_bytes)
    }

    /// Hysteresis target for a cap.
    pub fn low_water(&self, cap: ByteSize) -> ByteSize {
        (cap as f64 * self.low_water_ratio).floor() as ByteSize
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(invalid("data_dir", "", "data_dir must not be empty"));
        }

        if self.global_cap_bytes == 0 {
            return Err(invalid(
                "global_cap_bytes",
                "0",
                "global_cap_bytes must be greater than 0",
            ));
        }

        if self.default_source_cap_bytes == 0 {
            return Err(invalid(
                "default_source_cap_bytes",
                "0",
                "default_source_cap_bytes must be greater than 0",
            ));
        }

        for (source_id, cap) in &self.source_caps {
            let field = format!("source_caps.{source_id}");
            if source_id.is_empty() || source_id.contains('\0') {
                return Err(invalid(&field, source_id, "source id must be a valid key component"));
            }
            if *cap == 0 {
                return Err(invalid(&field, "0", "source cap must be greater than 0"));
            }
            if *cap > self.global_cap_bytes {
                return Err(invalid(
                    &field,
                    &cap.to_string(),
                    "source cap must not exceed global_cap_bytes",
                ));
            }
        }

        if !(self.low_water_ratio > 0.0 && self.low_water_ratio <= 1.0) {
            return Err(invalid(
                "low_water_ratio",
                &self.low_water_ratio.to_string(),
                "low_water_ratio must be in (0.0, 1.0]",
            ));
        }

        if self.eviction_batch == 0 {
            return Err(invalid("eviction_batch", "0", "eviction_batch must be greater than 0"));
        }

        if self.index_map_size_bytes == 0 {
            return Err(invalid(
                "index_map_size_bytes",
                "0",
                "index_map_size_bytes must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::new("/tmp/folio");
        assert!(config.validate().is_ok());
        assert_eq!(config.index_dir(), PathBuf::from("/tmp/folio/index"));
        assert_eq!(config.content_dir(), PathBuf::from("/tmp/folio/content"));
    }

    #[test]
    fn test_source_cap_override() {
        let config = CacheConfig::new("/tmp/folio")
            .with_default_source_cap(100)
            .with_source_cap("wiki", 50);
        assert_eq!(config.source_cap("wiki"), 50);
        assert_eq!(config.source_cap("docs"), 100);
    }

    #[test]
    fn test_low_water() {
        let config = CacheConfig::new("/tmp/folio");
        assert_eq!(config.low_water(100), 90);
        let exact = config.with_low_water_ratio(1.0);
        assert_eq!(exact.low_water(100), 100);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = CacheConfig::new("/tmp/folio").with_global_cap(1000);

        assert!(base.clone().with_global_cap(0).validate().is_err());
        assert!(base.clone().with_default_source_cap(0).validate().is_err());
        assert!(base.clone().with_source_cap("wiki", 2000).validate().is_err());
        assert!(base.clone().with_low_water_ratio(0.0).validate().is_err());
        assert!(base.clone().with_low_water_ratio(1.5).validate().is_err());
        assert!(base.clone().with_eviction_batch(0).validate().is_err());
        assert!(CacheConfig::new("").validate().is_err());
    }

    #[test]
    fn test_from_toml_str_applies_defaults() {
        let config = CacheConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/folio"
            global_cap_bytes = 1000
            default_source_cap_bytes = 400

            [source_caps]
            wiki = 100
            "#,
        )
        .expect("config should parse");
        assert_eq!(config.global_cap_bytes, 1000);
        assert_eq!(config.source_cap("wiki"), 100);
        assert_eq!(config.source_cap("other"), 400);
        assert!((config.low_water_ratio - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.eviction_batch, 64);
    }

    #[test]
    fn test_from_toml_str_rejects_unknown_fields() {
        let result = CacheConfig::from_toml_str(
            r#"
            data_dir = "/var/lib/folio"
            ttl_secs = 60
            "#,
        );
        assert!(matches!(result, Err(CacheError::Config(ConfigError::Parse { .. }))));
    }

    #[test]
    fn test_from_path_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.toml");
        std::fs::write(&path, "data_dir = \"/srv/folio\"\n").expect("write config");
        let config = CacheConfig::from_path(&path).expect("config should load");
        assert_eq!(config.data_dir, PathBuf::from("/srv/folio"));

        let missing = CacheConfig::from_path(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(CacheError::Config(ConfigError::Io { .. }))));
    }
}
