//! Job manager: the public face of the pipeline
//!
//! Accepts uploads, deduplicates them per owner by checksum, creates jobs and
//! dispatches them to the worker pool. Pause, resume, cancel, retry and
//! reparse all act on the catalog first; workers pick the change up at their
//! next checkpoint.

use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::control::RunningJobs;
use super::progress::JobStatusView;
use super::PipelineContext;
use crate::error::{Error, Result};
use crate::storage::CancelOutcome;
use crate::types::{Book, BookStatus, JobConfig, JobState, ParseJob};

/// The PDF signature must start within this many bytes
const SIGNATURE_WINDOW: usize = 1024;
const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// Upload accepted by [`JobManager::submit`]
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub owner_id: String,
    pub file_name: String,
    pub data: Bytes,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub ocr_enabled: bool,
}

/// Result of a submission
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub book_id: Uuid,
    pub job_id: Uuid,
    /// The owner had already uploaded identical bytes; nothing new was created
    pub deduplicated: bool,
}

/// Job counts by state
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    /// Attempts currently held by a worker in this process
    pub active_workers: usize,
}

/// Creates, controls and dispatches parse jobs
pub struct JobManager {
    ctx: PipelineContext,
    running: RunningJobs,
    sender: mpsc::Sender<Uuid>,
}

impl JobManager {
    /// Create a manager and the dispatch channel the worker pool consumes
    pub fn new(ctx: PipelineContext, running: RunningJobs, capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { ctx, running, sender }, receiver)
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Store an upload and queue its first parse job
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        if request.data.is_empty() {
            return Err(Error::validation("uploaded file is empty"));
        }
        if !looks_like_pdf(&request.data) {
            return Err(Error::validation(format!(
                "{} is not a PDF (missing %PDF- signature)",
                request.file_name
            )));
        }

        let checksum = hex::encode(Sha256::digest(&request.data));
        if let Some(existing) = self.find_existing(&request.owner_id, &checksum)? {
            return Ok(existing);
        }

        let book_id = Uuid::new_v4();
        let mut book = Book::new(
            book_id,
            request.owner_id.clone(),
            checksum.clone(),
            request.file_name.clone(),
            self.ctx.layout.original_rel(book_id),
        );
        if let Some(title) = request.title.filter(|t| !t.trim().is_empty()) {
            book.title = title;
        }
        book.author = request.author;
        if let Some(language) = request.language.filter(|l| !l.trim().is_empty()) {
            book.language = language;
        }

        let job = ParseJob::new(
            book_id,
            JobConfig {
                language: book.language.clone(),
                ocr_enabled: request.ocr_enabled,
                batch_size: self.ctx.settings.batch_size,
                engine: self.ctx.engine.name().to_string(),
            },
        );

        self.ctx
            .layout
            .write_original(book_id, &request.data)
            .await
            .map_err(Error::into_storage)?;

        if let Err(e) = self.ctx.db.create_book_with_job(&book, &job) {
            // Drop our copy of the file; a concurrent identical upload may have won
            if let Err(cleanup) = tokio::fs::remove_dir_all(self.ctx.layout.book_dir(book_id)).await {
                tracing::warn!("Failed to remove upload of book {}: {}", book_id, cleanup);
            }
            if matches!(e, Error::Conflict(_)) {
                if let Some(existing) = self.find_existing(&request.owner_id, &checksum)? {
                    return Ok(existing);
                }
            }
            return Err(e);
        }

        tracing::info!(
            "Accepted '{}' ({} bytes) as book {}, job {}",
            book.file_name,
            request.data.len(),
            book_id,
            job.id
        );
        self.ctx.progress.state_changed(&job, JobState::Queued, None);
        self.dispatch(job.id).await;

        Ok(SubmitOutcome {
            book_id,
            job_id: job.id,
            deduplicated: false,
        })
    }

    fn find_existing(&self, owner_id: &str, checksum: &str) -> Result<Option<SubmitOutcome>> {
        let Some(book) = self.ctx.db.find_book_by_checksum(owner_id, checksum)? else {
            return Ok(None);
        };
        let job = self
            .ctx
            .db
            .latest_job_for_book(book.id)?
            .ok_or_else(|| Error::internal(format!("book {} has no job", book.id)))?;
        tracing::info!("Upload matches existing book {} of owner {}", book.id, owner_id);
        Ok(Some(SubmitOutcome {
            book_id: book.id,
            job_id: job.id,
            deduplicated: true,
        }))
    }

    /// Current status of a job
    pub fn job_status(&self, job_id: Uuid) -> Result<JobStatusView> {
        self.ctx.progress.status(job_id)
    }

    /// Request a pause; running jobs stop at their next checkpoint
    pub fn request_pause(&self, job_id: Uuid) -> Result<JobStatusView> {
        let state = self.ctx.db.request_pause(job_id)?;
        let status = self.job_status(job_id)?;
        if state == JobState::Paused {
            tracing::info!("Job {} paused before it ran", job_id);
        } else {
            tracing::info!("Pause requested for job {}", job_id);
        }
        Ok(status)
    }

    /// Queue a paused job again; it continues after its last committed page
    pub async fn resume(&self, job_id: Uuid) -> Result<JobStatusView> {
        let job = self.ctx.db.requeue_job(job_id, &[JobState::Paused], false)?;
        tracing::info!("Resuming job {} after page {}", job_id, job.current_page);
        self.ctx.progress.state_changed(&job, JobState::Queued, None);
        self.dispatch(job_id).await;
        self.job_status(job_id)
    }

    /// Cancel a job. Completed and failed jobs are left as they are.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobStatusView> {
        let message = Error::UserCancelled.summary();
        match self.ctx.db.cancel_job(job_id, &message)? {
            CancelOutcome::AlreadyTerminal(state) => {
                tracing::debug!("Cancel of job {} ignored, already {:?}", job_id, state);
            }
            CancelOutcome::Cancelled { previous } => {
                let status = self.job_status(job_id)?;
                tracing::info!("Cancelled job {} ({:?})", job_id, previous);
                // A live worker discards the content itself once it stops
                if !self.running.cancel(job_id) {
                    self.ctx.discard_book_content(status.book_id).await?;
                }
                if let Some(job) = self.ctx.db.get_job(job_id)? {
                    self.ctx.progress.state_changed(&job, JobState::Failed, Some(message));
                }
            }
        }
        self.job_status(job_id)
    }

    /// Queue a failed job again.
    ///
    /// Cancelled jobs restart from scratch since their content was discarded;
    /// other failures continue after the last committed page.
    pub async fn retry(&self, job_id: Uuid) -> Result<JobStatusView> {
        let job = self
            .ctx
            .db
            .get_job(job_id)?
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        if let Some(latest) = self.ctx.db.latest_job_for_book(job.book_id)? {
            if latest.id != job.id {
                return Err(Error::conflict(format!(
                    "job {} was superseded by job {}",
                    job_id, latest.id
                )));
            }
        }

        let reset = job.was_cancelled();
        let job = self.ctx.db.requeue_job(job_id, &[JobState::Failed], reset)?;
        tracing::info!(
            "Retrying job {} from {:?} after page {}",
            job_id,
            job.phase,
            job.current_page
        );
        self.ctx.progress.state_changed(&job, JobState::Queued, None);
        self.dispatch(job_id).await;
        self.job_status(job_id)
    }

    /// Discard a book's content and parse it again with a new job
    pub async fn reparse(&self, book_id: Uuid) -> Result<JobStatusView> {
        let book = self
            .ctx
            .db
            .get_book(book_id)?
            .ok_or_else(|| Error::not_found(format!("book {}", book_id)))?;
        if let Some(active) = self.ctx.db.active_job_for_book(book_id)? {
            return Err(Error::conflict(format!(
                "book {} has an active job {} ({:?})",
                book_id, active.id, active.state
            )));
        }

        let ocr_enabled = self
            .ctx
            .db
            .latest_job_for_book(book_id)?
            .map(|j| j.config.ocr_enabled)
            .unwrap_or(false);

        self.ctx.discard_book_content(book_id).await?;
        self.ctx.db.set_book_status(book_id, BookStatus::NeedsReparse)?;

        let job = ParseJob::new(
            book_id,
            JobConfig {
                language: book.language.clone(),
                ocr_enabled,
                batch_size: self.ctx.settings.batch_size,
                engine: self.ctx.engine.name().to_string(),
            },
        );
        self.ctx.db.insert_job(&job)?;
        tracing::info!("Reparsing book {} with job {}", book_id, job.id);
        self.ctx.progress.state_changed(&job, JobState::Queued, None);
        self.dispatch(job.id).await;
        self.job_status(job.id)
    }

    /// Requeue jobs whose worker died and dispatch everything queued.
    ///
    /// Called once at startup, before accepting requests. Leases left by a
    /// previous process are reclaimed even if they have not expired yet;
    /// attempts running in this process keep theirs.
    pub async fn recover(&self) -> Result<usize> {
        let reclaim_live_leases = self.running.is_empty();
        let stale = self.ctx.db.requeue_stale_jobs(reclaim_live_leases)?;
        if !stale.is_empty() {
            tracing::warn!("Requeued {} jobs left running by a previous process", stale.len());
        }

        let queued = self.ctx.db.list_jobs(Some(JobState::Queued))?;
        for job in &queued {
            self.dispatch(job.id).await;
        }
        if !queued.is_empty() {
            tracing::info!("Dispatched {} queued jobs", queued.len());
        }
        Ok(queued.len())
    }

    /// Job counts by state
    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats {
            active_workers: self.running.len(),
            ..Default::default()
        };
        for job in self.ctx.db.list_jobs(None)? {
            match job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Paused => stats.paused += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Hand a queued job to the worker pool.
    ///
    /// A closed channel is only logged: the job stays queued in the catalog
    /// and is dispatched again by [`JobManager::recover`].
    async fn dispatch(&self, job_id: Uuid) {
        if let Err(e) = self.sender.send(job_id).await {
            let queued = self
                .stats()
                .map(|stats| stats.queued.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            tracing::warn!(
                "Failed to dispatch job {}: {}; it stays queued until recovery ({} queued jobs)",
                job_id,
                e,
                queued
            );
        }
    }
}

/// Whether the bytes carry a PDF signature near the start
fn looks_like_pdf(data: &[u8]) -> bool {
    let window = &data[..data.len().min(SIGNATURE_WINDOW)];
    window
        .windows(PDF_SIGNATURE.len())
        .any(|w| w == PDF_SIGNATURE)
}
