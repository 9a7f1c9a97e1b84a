//! Background parsing pipeline: job manager, phase state machine, ingestion
//! batcher and progress reporting

mod batcher;
mod control;
mod job_manager;
mod progress;
mod runner;
mod sections;
mod worker;

pub use batcher::{IngestOutcome, IngestionBatcher};
pub use control::{Checkpoint, Directive, RunningGuard, RunningJobs};
pub use job_manager::{JobManager, QueueStats, SubmitOutcome, SubmitRequest};
pub use progress::{JobStatusView, ProgressEvent, ProgressReporter};
pub use runner::{PhaseRunner, RunOutcome};
pub use sections::SectionIndex;
pub use worker::WorkerPool;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::engine::{self, ParsingEngine};
use crate::error::Result;
use crate::indexing::{FtsIndexer, Indexer};
use crate::render::{self, AssetCropper, PageRenderer};
use crate::storage::{BookLayout, CatalogDb};

/// Pipeline knobs taken from the configuration at startup
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Pages per ingestion batch for newly created jobs
    pub batch_size: u32,
    /// Lifetime of a book lease between renewals
    pub lease_ttl: Duration,
    /// Render every page, not only pages with crops
    pub render_all_pages: bool,
    /// Keep the raw engine output next to the original
    pub persist_engine_output: bool,
    /// Run the indexing phase
    pub indexing_enabled: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.processing.batch_size,
            lease_ttl: Duration::from_secs(config.processing.lease_ttl_secs),
            render_all_pages: config.processing.render_all_pages,
            persist_engine_output: config.processing.persist_engine_output,
            indexing_enabled: config.indexing.enabled,
        }
    }
}

/// Everything a pipeline stage needs, cheap to clone
#[derive(Clone)]
pub struct PipelineContext {
    pub db: Arc<CatalogDb>,
    pub layout: BookLayout,
    pub engine: Arc<dyn ParsingEngine>,
    pub renderer: Arc<dyn PageRenderer>,
    pub indexer: Arc<dyn Indexer>,
    pub cropper: AssetCropper,
    pub progress: ProgressReporter,
    pub settings: PipelineSettings,
}

impl PipelineContext {
    /// Open the catalog and build engine, renderer and indexer from configuration
    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let db = Arc::new(CatalogDb::new(&config.storage.database_path)?);
        let layout = BookLayout::new(config.storage.root.clone());
        let indexer: Arc<dyn Indexer> =
            Arc::new(FtsIndexer::new(db.clone(), config.indexing.fulltext_version.clone()));

        Ok(Self {
            progress: ProgressReporter::new(db.clone(), config.processing.queue_capacity),
            cropper: AssetCropper::new(layout.clone(), config.renderer.thumbnail_scale),
            engine: engine::from_config(&config.engine),
            renderer: render::from_config(&config.renderer),
            settings: PipelineSettings::from_config(config),
            db,
            layout,
            indexer,
        })
    }

    /// Remove every row, file and index entry derived from a book's parse.
    ///
    /// The book row and the original upload are kept so the job can be retried.
    pub async fn discard_book_content(&self, book_id: Uuid) -> Result<()> {
        let rows = self.db.delete_book_content(book_id)?;
        self.layout.remove_derived(book_id)?;
        self.indexer.delete_book(book_id).await?;
        tracing::info!("Discarded content of book {} ({} rows)", book_id, rows);
        Ok(())
    }
}
