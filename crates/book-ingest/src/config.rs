//! Configuration for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable naming a TOML config file
pub const CONFIG_ENV_VAR: &str = "BOOK_INGEST_CONFIG";

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Parsing engine configuration
    #[serde(default)]
    pub engine: EngineConfig,
    /// Page renderer configuration
    #[serde(default)]
    pub renderer: RendererConfig,
    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Indexing configuration
    #[serde(default)]
    pub indexing: IndexingConfig,
}

impl IngestConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `BOOK_INGEST_CONFIG`, or fall back to defaults
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.processing.batch_size == 0 {
            return Err(Error::Config("processing.batch_size must be at least 1".into()));
        }
        if self.processing.max_concurrent_jobs == Some(0) {
            return Err(Error::Config("processing.max_concurrent_jobs must be at least 1".into()));
        }
        if self.processing.lease_ttl_secs == 0 {
            return Err(Error::Config("processing.lease_ttl_secs must be at least 1".into()));
        }
        if !(self.renderer.thumbnail_scale > 0.0 && self.renderer.thumbnail_scale <= 1.0) {
            return Err(Error::Config("renderer.thumbnail_scale must be in (0, 1]".into()));
        }
        if self.renderer.dpi == 0 {
            return Err(Error::Config("renderer.dpi must be positive".into()));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Enable permissive CORS
    pub enable_cors: bool,
    /// Maximum upload size in bytes
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            enable_cors: true,
            max_upload_size: 500 * 1024 * 1024, // 500MB
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; each book lives under `<root>/books/<book_id>/`
    pub root: PathBuf,
    /// SQLite database path
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("book-ingest");
        Self {
            database_path: base.join("catalog.db"),
            root: base,
        }
    }
}

/// Which parsing engine adapter to use
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// External process emitting the exchange schema as JSON
    #[default]
    Subprocess,
    /// Built-in plain text engine for development
    Text,
}

/// Parsing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine adapter
    #[serde(default)]
    pub kind: EngineKind,
    /// Executable for the subprocess engine
    #[serde(default = "default_engine_command")]
    pub command: String,
    /// Extra arguments passed before the input options
    #[serde(default)]
    pub args: Vec<String>,
    /// Upper bound on a single structural parse (default: 1800s)
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
    /// Version string recorded on each book
    #[serde(default = "default_engine_version")]
    pub version: String,
}

fn default_engine_command() -> String { "book-parse".to_string() }
fn default_engine_timeout() -> u64 { 1800 }
fn default_engine_version() -> String { "1".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            command: default_engine_command(),
            args: Vec::new(),
            timeout_secs: default_engine_timeout(),
            version: default_engine_version(),
        }
    }
}

/// Which page renderer to use
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    /// poppler's `pdftoppm`
    #[default]
    Pdftoppm,
    /// No rendering; pages needing crops fail the job
    Disabled,
}

/// Page renderer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Renderer backend
    #[serde(default)]
    pub kind: RendererKind,
    /// Render resolution (default: 150)
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    /// Thumbnail size relative to the full render (default: 0.3)
    #[serde(default = "default_thumbnail_scale")]
    pub thumbnail_scale: f32,
    /// Per-page render timeout in seconds
    #[serde(default = "default_render_timeout")]
    pub timeout_secs: u64,
}

fn default_dpi() -> u32 { 150 }
fn default_thumbnail_scale() -> f32 { 0.3 }
fn default_render_timeout() -> u64 { 60 }

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            kind: RendererKind::default(),
            dpi: default_dpi(),
            thumbnail_scale: default_thumbnail_scale(),
            timeout_secs: default_render_timeout(),
        }
    }
}

/// Processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Pages committed per ingestion batch (default: 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Concurrent jobs (default: CPU count, max 4)
    pub max_concurrent_jobs: Option<usize>,
    /// Book lease lifetime; renewed at every checkpoint
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    /// Render every page, not only those with assets to crop
    #[serde(default = "default_render_all_pages")]
    pub render_all_pages: bool,
    /// Write the engine output next to the book
    #[serde(default)]
    pub persist_engine_output: bool,
    /// Dispatch channel capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_batch_size() -> u32 { 50 }
fn default_lease_ttl() -> u64 { 300 }
fn default_render_all_pages() -> bool { true }
fn default_queue_capacity() -> usize { 256 }

impl ProcessingConfig {
    /// Worker pool size
    pub fn worker_count(&self) -> usize {
        self.max_concurrent_jobs
            .unwrap_or_else(|| num_cpus::get().min(4))
            .max(1)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_jobs: None, // Auto-detect from CPU count
            lease_ttl_secs: default_lease_ttl(),
            render_all_pages: default_render_all_pages(),
            persist_engine_output: false,
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Run the indexing phase at all
    #[serde(default = "default_indexing_enabled")]
    pub enabled: bool,
    /// Version tag stored with the full-text status
    #[serde(default = "default_fulltext_version")]
    pub fulltext_version: String,
}

fn default_indexing_enabled() -> bool { true }
fn default_fulltext_version() -> String { "fts5-v1".to_string() }

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            enabled: default_indexing_enabled(),
            fulltext_version: default_fulltext_version(),
        }
    }
}
