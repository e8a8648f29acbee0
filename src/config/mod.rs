//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast on malformed values. Every tuning knob
//! has a default, so an empty environment yields a runnable config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::Kind;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub otel_endpoint: Option<String>,
    pub log_level: LogLevel,
    pub queues: QueueConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub media: MediaConfig,
    pub reclaimer: ReclaimerConfig,
    pub stats: StatsConfig,
}

/// Default log filter directive, used when `RUST_LOG` is unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

/// Per-kind queue capacities.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub message: usize,
    pub callback: usize,
    pub file: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            message: 1000,
            callback: 500,
            file: 100,
        }
    }
}

impl QueueConfig {
    pub fn capacity(&self, kind: Kind) -> usize {
        match kind {
            Kind::Message => self.message,
            Kind::Callback => self.callback,
            Kind::File => self.file,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one `<name>.json` per document.
    pub root: PathBuf,
    /// Archive subdirectory, relative to `root`.
    pub archive_dir: String,
    /// Serialized size above which a save is refused and the previous
    /// document archived.
    pub max_document_bytes: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            archive_dir: "archives".to_string(),
            max_document_bytes: 50 * 1024 * 1024,
            cache_ttl_secs: 60,
            cache_capacity: 500,
        }
    }
}

impl StoreConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join(&self.archive_dir)
    }

    /// The archive directory must stay inside `root`.
    pub fn validate(&self) -> Result<()> {
        let dir = Path::new(&self.archive_dir);
        let inside = !self.archive_dir.is_empty()
            && dir
                .components()
                .all(|c| matches!(c, std::path::Component::Normal(_)));
        if !inside {
            return Err(Error::Config(format!(
                "store.archive_dir {:?} must be a relative path below the store root",
                self.archive_dir
            )));
        }
        if self.max_document_bytes == 0 {
            return Err(Error::Config("store.max_document_bytes must be positive".to_string()));
        }
        Ok(())
    }
}

/// Memoization cache shared by handlers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: u64,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Upper bound on pool size; the pool never exceeds available parallelism.
    pub max_workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_workers: 8 }
    }
}

/// Image optimization on the batch pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Images are shrunk to fit inside `max_width` x `max_height`.
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality, 1 to 100.
    pub quality: u8,
    /// Source files above this size are refused.
    pub max_file_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            quality: 85,
            max_file_bytes: 50 * 1024 * 1024,
        }
    }
}

impl MediaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_width == 0 || self.max_height == 0 {
            return Err(Error::Config("media.max_width and media.max_height must be positive".to_string()));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(Error::Config(format!("media.quality {} is outside 1..=100", self.quality)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReclaimerConfig {
    pub threshold_percent: f64,
    pub min_interval_secs: u64,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 80.0,
            min_interval_secs: 30,
        }
    }
}

impl ReclaimerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
    /// Store name the snapshot is written to.
    pub document: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            document: "performance_stats".to_string(),
        }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `SURGE_CONFIG` names an optional TOML file with the tuning sections;
    /// `SURGE_DATA_DIR`, `OTEL_ENDPOINT` and `LOG_LEVEL` override it.
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SURGE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(dir) = std::env::var("SURGE_DATA_DIR") {
            config.store.root = PathBuf::from(dir);
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            config.otel_endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = LogLevel(level);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read config {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        for kind in Kind::ALL {
            if self.queues.capacity(kind) == 0 {
                return Err(Error::Config(format!("queue capacity for {kind} must be positive")));
            }
        }
        self.store.validate()?;
        self.media.validate()?;
        if self.batch.max_workers == 0 {
            return Err(Error::Config("batch.max_workers must be positive".to_string()));
        }
        if !(0.0..=100.0).contains(&self.reclaimer.threshold_percent) {
            return Err(Error::Config(format!(
                "reclaimer.threshold_percent {} is outside 0..=100",
                self.reclaimer.threshold_percent
            )));
        }
        if self.stats.interval_secs == 0 {
            return Err(Error::Config("stats.interval_secs must be positive".to_string()));
        }
        Ok(())
    }
}
