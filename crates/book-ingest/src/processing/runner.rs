//! Phase state machine
//!
//! Drives one attempt of a job through precheck, structural parse, ingestion
//! and indexing, starting at whichever phase the catalog last recorded. Pause
//! and cancel are checked at every phase boundary and after every ingestion
//! batch. A resumed job always redoes the structural parse, since engine
//! output is not guaranteed to be retained between attempts.

use std::path::Path;
use std::time::Instant;
use uuid::Uuid;

use super::batcher::{IngestOutcome, IngestionBatcher};
use super::control::{Checkpoint, Directive, RunningGuard, RunningJobs};
use super::PipelineContext;
use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::types::{Book, JobPhase, JobState, ParseJob, ParsedDocument};

/// How one attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused,
    Failed,
    Cancelled,
    /// Another worker owns the book; this attempt stopped without writing
    LeaseLost,
    /// The job was no longer queued when the worker picked it up
    NotRunnable,
}

/// Executes job attempts
pub struct PhaseRunner {
    ctx: PipelineContext,
    running: RunningJobs,
}

impl PhaseRunner {
    pub fn new(ctx: PipelineContext, running: RunningJobs) -> Self {
        Self { ctx, running }
    }

    /// Run one attempt of a queued job to its next stop
    pub async fn run(&self, job_id: Uuid) -> Result<RunOutcome> {
        let owner = format!("worker-{}", Uuid::new_v4());
        let lease_ttl = self.ctx.settings.lease_ttl;

        let Some(job) = self.ctx.db.begin_attempt(job_id, &owner, lease_ttl)? else {
            tracing::debug!("Job {} is no longer queued, skipping", job_id);
            return Ok(RunOutcome::NotRunnable);
        };

        let guard = self.running.register(job.id);
        let checkpoint = Checkpoint::new(
            self.ctx.db.clone(),
            job.id,
            job.book_id,
            owner.clone(),
            lease_ttl,
            guard.token(),
        );
        self.ctx.progress.state_changed(&job, JobState::Running, None);
        tracing::info!(
            "Job {} attempt {} started in {:?} after page {}",
            job.id,
            job.attempts,
            job.phase,
            job.current_page
        );

        let start = Instant::now();
        let result = self.drive(&job, &checkpoint).await;
        let outcome = self.settle(&job, &owner, result, guard).await;

        // Final transitions release the lease themselves; this covers early exits
        if let Err(e) = self.ctx.db.release_lease(job.book_id, &owner) {
            tracing::warn!("Failed to release lease on book {}: {}", job.book_id, e);
        }

        tracing::info!(
            "Job {} attempt finished as {:?} in {:.1}s",
            job.id,
            outcome,
            start.elapsed().as_secs_f64()
        );
        Ok(outcome)
    }

    /// Map the attempt's result to its outcome, discarding content of a
    /// cancelled job.
    ///
    /// The guard is dropped before the catalog is consulted: a cancel landing
    /// earlier is seen in the job row, a later one finds no running worker and
    /// is cleaned up by the manager.
    async fn settle(
        &self,
        job: &ParseJob,
        owner: &str,
        result: Result<RunOutcome>,
        guard: RunningGuard,
    ) -> RunOutcome {
        drop(guard);

        match result {
            Ok(RunOutcome::Paused) if self.was_cancelled(job.id) => {
                tracing::info!("Job {} cancelled while pausing", job.id);
                self.discard(job.book_id).await;
                RunOutcome::Cancelled
            }
            Ok(outcome) => outcome,
            Err(Error::UserCancelled) => {
                tracing::info!("Job {} stopped by cancel request", job.id);
                self.discard(job.book_id).await;
                RunOutcome::Cancelled
            }
            Err(Error::LeaseLost(reason)) => {
                tracing::warn!("Job {} lost its lease: {}", job.id, reason);
                RunOutcome::LeaseLost
            }
            Err(e) => {
                if let Err(report) = self.ctx.progress.failed(job, owner, &e) {
                    tracing::error!("Failed to record failure of job {}: {}", job.id, report);
                }
                // A cancel may have landed while the attempt was failing
                if self.was_cancelled(job.id) {
                    self.discard(job.book_id).await;
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Failed
                }
            }
        }
    }

    fn was_cancelled(&self, job_id: Uuid) -> bool {
        match self.ctx.db.get_job(job_id) {
            Ok(Some(job)) => job.was_cancelled(),
            Ok(None) => false,
            Err(e) => {
                tracing::error!("Failed to re-read job {}: {}", job_id, e);
                false
            }
        }
    }

    async fn drive(&self, job: &ParseJob, checkpoint: &Checkpoint) -> Result<RunOutcome> {
        let owner = checkpoint.owner();
        let book = self
            .ctx
            .db
            .get_book(job.book_id)?
            .ok_or_else(|| Error::not_found(format!("book {}", job.book_id)))?;
        let pdf_path = self.ctx.layout.resolve(&book.storage_path);

        let mut phase = job.phase;
        let mut total_pages = job.total_pages;
        let mut parsed: Option<ParsedDocument> = None;

        loop {
            if checkpoint.check()? == Directive::Pause {
                self.ctx.progress.paused(job, owner)?;
                return Ok(RunOutcome::Paused);
            }

            match phase {
                JobPhase::Precheck => {
                    let total = self.ctx.engine.count_pages(&pdf_path).await?;
                    if total == 0 {
                        return Err(Error::corrupt("document has no pages"));
                    }
                    total_pages = Some(total);
                    phase = JobPhase::StructuralParse;
                    self.ctx.progress.phase_changed(job, phase, total_pages)?;
                }
                JobPhase::StructuralParse => {
                    let total = known_total(total_pages)?;
                    parsed = Some(self.structural_parse(job, &book, &pdf_path, total, checkpoint).await?);
                    phase = JobPhase::Ingestion;
                    self.ctx.progress.phase_changed(job, phase, None)?;
                }
                JobPhase::Ingestion => {
                    let total = known_total(total_pages)?;
                    let doc = match parsed.take() {
                        Some(doc) => doc,
                        None => {
                            self.ctx.progress.phase_changed(job, JobPhase::StructuralParse, None)?;
                            let doc = self.structural_parse(job, &book, &pdf_path, total, checkpoint).await?;
                            self.ctx.progress.phase_changed(job, JobPhase::Ingestion, None)?;
                            doc
                        }
                    };

                    let resume_after = job.current_page;
                    self.discard_after(&book, resume_after)?;

                    let batcher = IngestionBatcher::new(&self.ctx, job, &book, checkpoint);
                    match batcher.ingest(&doc, resume_after, total).await? {
                        IngestOutcome::Paused { last_page } => {
                            tracing::info!("Job {} pausing after page {}", job.id, last_page);
                            self.ctx.progress.paused(job, owner)?;
                            return Ok(RunOutcome::Paused);
                        }
                        IngestOutcome::Completed => {
                            phase = JobPhase::Indexing;
                            self.ctx.progress.phase_changed(job, phase, None)?;
                        }
                    }
                }
                JobPhase::Indexing => {
                    if self.ctx.settings.indexing_enabled {
                        let blocks = self.ctx.db.blocks_for_book(book.id)?;
                        self.ctx
                            .indexer
                            .index_book(book.id, &blocks)
                            .await
                            .map_err(Error::into_storage)?;
                    }
                    self.ctx.progress.completed(job, owner)?;
                    return Ok(RunOutcome::Completed);
                }
            }
        }
    }

    /// Run the engine, racing it against cancellation, and validate its output
    async fn structural_parse(
        &self,
        job: &ParseJob,
        book: &Book,
        pdf_path: &Path,
        total_pages: u32,
        checkpoint: &Checkpoint,
    ) -> Result<ParsedDocument> {
        let options = EngineOptions::from(&job.config);
        let start = Instant::now();

        // Dropping the parse future stops the engine
        let doc = tokio::select! {
            biased;
            _ = checkpoint.token().cancelled() => return Err(Error::UserCancelled),
            result = self.ctx.engine.parse(pdf_path, &options) => result?,
        };
        doc.validate(total_pages)?;

        if self.ctx.settings.persist_engine_output {
            let path = self.ctx.layout.prepare(&self.ctx.layout.engine_output_rel(book.id))?;
            tokio::fs::write(&path, serde_json::to_vec(&doc)?).await?;
        }

        let version = doc
            .engine_version
            .clone()
            .unwrap_or_else(|| self.ctx.engine.version().to_string());
        self.ctx.db.set_book_parse_info(book.id, &version, doc.source_kind)?;

        tracing::info!(
            "Structural parse of book {} by {} {} took {:.1}s: {} pages, {} sections, {} blocks, {} assets",
            book.id,
            self.ctx.engine.name(),
            version,
            start.elapsed().as_secs_f64(),
            doc.pages.len(),
            doc.sections.len(),
            doc.blocks.len(),
            doc.assets.len()
        );
        Ok(doc)
    }

    /// Drop rows and files past the last committed page, left by a crash
    fn discard_after(&self, book: &Book, page: u32) -> Result<()> {
        let rows = self.ctx.db.delete_content_after(book.id, page)?;
        let files = self.ctx.layout.remove_pages_after(book.id, page)?;
        if rows > 0 || files > 0 {
            tracing::info!(
                "Removed {} rows and {} files after page {} of book {}",
                rows,
                files,
                page,
                book.id
            );
        }
        Ok(())
    }

    async fn discard(&self, book_id: Uuid) {
        if let Err(e) = self.ctx.discard_book_content(book_id).await {
            tracing::error!("Cleanup of book {} failed: {}", book_id, e);
        }
    }
}

fn known_total(total_pages: Option<u32>) -> Result<u32> {
    total_pages.ok_or_else(|| Error::internal("page count missing after precheck"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CatalogDb;
    use crate::testing::{book_document, FakeEngine, Harness, SolidRenderer};
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Armed = Arc<Mutex<Option<(Arc<CatalogDb>, RunningJobs, Uuid)>>>;

    /// Renderer that runs `action` against the armed job while `page` renders
    fn renderer_acting_on(
        page: u32,
        action: fn(&CatalogDb, &RunningJobs, Uuid),
    ) -> (SolidRenderer, Armed) {
        let slot: Armed = Arc::default();
        let armed = slot.clone();
        let renderer = SolidRenderer::new().with_hook(move |rendered| {
            if rendered == page {
                if let Some((db, running, job_id)) = armed.lock().take() {
                    action(&db, &running, job_id);
                }
            }
        });
        (renderer, slot)
    }

    #[tokio::test]
    async fn test_cancel_between_pause_and_deregistration_discards_content() {
        let (renderer, slot) = renderer_acting_on(1, |db, _, job_id| {
            db.request_pause(job_id).unwrap();
        });
        let mut h = Harness::new(FakeEngine::new(book_document(4), 4), renderer, 2);
        let submitted = h.submit("late-cancel").await;
        *slot.lock() = Some((h.ctx.db.clone(), h.running.clone(), submitted.job_id));

        assert_eq!(h.run_next().await, RunOutcome::Paused);
        assert_eq!(h.db().list_pages(submitted.book_id).unwrap().len(), 2);

        // The attempt has paused but its worker is still registered
        let job = h.db().get_job(submitted.job_id).unwrap().unwrap();
        let guard = h.running.register(submitted.job_id);
        let status = h.manager.cancel(submitted.job_id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(h.db().list_pages(submitted.book_id).unwrap().len(), 2);

        let outcome = h
            .runner
            .settle(&job, "worker-test", Ok(RunOutcome::Paused), guard)
            .await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(h.db().list_pages(submitted.book_id).unwrap().is_empty());
        assert!(h.db().list_sections(submitted.book_id).unwrap().is_empty());
        assert!(h.running.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_on_last_page_with_pause_pending() {
        let (renderer, slot) = renderer_acting_on(4, |db, running, job_id| {
            db.request_pause(job_id).unwrap();
            db.cancel_job(job_id, &Error::UserCancelled.summary()).unwrap();
            running.cancel(job_id);
        });
        let mut h = Harness::new(FakeEngine::new(book_document(4), 4), renderer, 2);
        let submitted = h.submit("last-page").await;
        *slot.lock() = Some((h.ctx.db.clone(), h.running.clone(), submitted.job_id));

        assert_eq!(h.run_next().await, RunOutcome::Cancelled);
        let status = h.manager.job_status(submitted.job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error_kind.as_deref(), Some("UserCancelled"));
        assert!(h.db().list_pages(submitted.book_id).unwrap().is_empty());
        assert!(h.running.is_empty());
    }
}
