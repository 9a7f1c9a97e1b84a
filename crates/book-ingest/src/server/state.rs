//! Application state for the ingestion server

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::IngestConfig;
use crate::error::Result;
use crate::processing::{JobManager, PipelineContext, RunningJobs, WorkerPool};
use crate::storage::ContentReader;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: IngestConfig,
    /// Job creation and control
    manager: JobManager,
    /// Catalog reads
    reader: ContentReader,
    /// Pipeline context shared with the workers
    ctx: PipelineContext,
    /// Ready state
    ready: RwLock<bool>,
}

impl AppState {
    /// Create the pipeline, start the worker pool and recover interrupted jobs
    pub async fn new(config: IngestConfig) -> Result<Self> {
        tracing::info!(
            "Initializing ingestion state (storage: {})...",
            config.storage.root.display()
        );

        let ctx = PipelineContext::from_config(&config)?;
        tracing::info!(
            "Catalog opened at {}, engine {} {}, renderer {}",
            config.storage.database_path.display(),
            ctx.engine.name(),
            ctx.engine.version(),
            ctx.renderer.name()
        );

        match ctx.engine.health_check().await {
            Ok(true) => tracing::info!("Parsing engine {} is available", ctx.engine.name()),
            Ok(false) => tracing::warn!("Parsing engine {} reports unhealthy", ctx.engine.name()),
            Err(e) => tracing::warn!("Parsing engine {} not available: {}", ctx.engine.name(), e),
        }

        let running = RunningJobs::new();
        let (manager, receiver) =
            JobManager::new(ctx.clone(), running.clone(), config.processing.queue_capacity);

        let worker_count = config.processing.worker_count();
        let pool = WorkerPool::new(ctx.clone(), running, worker_count);
        tokio::spawn(async move {
            pool.run(receiver).await;
        });

        let recovered = manager.recover().await?;
        if recovered > 0 {
            tracing::info!("Re-dispatched {} queued jobs", recovered);
        }

        let reader = ContentReader::new(ctx.db.clone(), ctx.layout.clone());

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                manager,
                reader,
                ctx,
                ready: RwLock::new(true),
            }),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &JobManager {
        &self.inner.manager
    }

    pub fn reader(&self) -> &ContentReader {
        &self.inner.reader
    }

    pub fn context(&self) -> &PipelineContext {
        &self.inner.ctx
    }

    /// Check if the server is ready
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    /// Set ready state
    pub fn set_ready(&self, ready: bool) {
        *self.inner.ready.write() = ready;
    }
}
