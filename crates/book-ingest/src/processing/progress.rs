//! Progress reporting
//!
//! Every externally visible transition of a job goes through the reporter:
//! the catalog row is updated first, then an event is broadcast to whoever
//! subscribed (server-sent streams, tests). Pollers read the catalog, so a
//! dropped event never loses progress.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{BatchRows, CatalogDb};
use crate::types::{JobPhase, JobState, ParseJob};

/// Progress notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseChanged {
        job_id: Uuid,
        book_id: Uuid,
        phase: JobPhase,
        total_pages: Option<u32>,
    },
    BatchCommitted {
        job_id: Uuid,
        book_id: Uuid,
        first_page: u32,
        last_page: u32,
        total_pages: u32,
        blocks: usize,
        assets: usize,
    },
    StateChanged {
        job_id: Uuid,
        book_id: Uuid,
        state: JobState,
        error_message: Option<String>,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            ProgressEvent::PhaseChanged { job_id, .. }
            | ProgressEvent::BatchCommitted { job_id, .. }
            | ProgressEvent::StateChanged { job_id, .. } => *job_id,
        }
    }
}

/// Job status as reported to clients
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub book_id: Uuid,
    pub state: JobState,
    pub phase: JobPhase,
    pub current_page: u32,
    pub total_pages: Option<u32>,
    /// Absent while the structural parse runs
    pub percent_complete: Option<f32>,
    pub pause_requested: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&ParseJob> for JobStatusView {
    fn from(job: &ParseJob) -> Self {
        Self {
            job_id: job.id,
            book_id: job.book_id,
            state: job.state,
            phase: job.phase,
            current_page: job.current_page,
            total_pages: job.total_pages,
            percent_complete: job.percent_complete(),
            pause_requested: job.pause_requested,
            error_kind: job.error_kind.clone(),
            error_message: job.error_message.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

/// Writes job progress to the catalog and fans out events
#[derive(Clone)]
pub struct ProgressReporter {
    db: Arc<CatalogDb>,
    events: broadcast::Sender<ProgressEvent>,
}

impl ProgressReporter {
    pub fn new(db: Arc<CatalogDb>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { db, events }
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Current status of a job
    pub fn status(&self, job_id: Uuid) -> Result<JobStatusView> {
        let job = self
            .db
            .get_job(job_id)?
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        Ok(JobStatusView::from(&job))
    }

    /// Record entry into `phase`
    pub fn phase_changed(&self, job: &ParseJob, phase: JobPhase, total_pages: Option<u32>) -> Result<()> {
        self.db.advance_phase(job.id, phase, total_pages)?;
        tracing::info!(
            "Job {} entered {:?}{}",
            job.id,
            phase,
            total_pages.map(|t| format!(" ({} pages)", t)).unwrap_or_default()
        );
        self.emit(ProgressEvent::PhaseChanged {
            job_id: job.id,
            book_id: job.book_id,
            phase,
            total_pages,
        });
        Ok(())
    }

    /// Commit an ingestion batch; `current_page` moves to `last_page` with the rows
    pub fn batch_committed(
        &self,
        job: &ParseJob,
        owner: &str,
        rows: &BatchRows,
        first_page: u32,
        last_page: u32,
        total_pages: u32,
    ) -> Result<()> {
        self.db.commit_batch(job.id, job.book_id, owner, rows, last_page)?;
        tracing::info!(
            "Job {} committed pages {}-{} of {} ({} blocks, {} assets)",
            job.id,
            first_page,
            last_page,
            total_pages,
            rows.blocks.len(),
            rows.assets.len()
        );
        self.emit(ProgressEvent::BatchCommitted {
            job_id: job.id,
            book_id: job.book_id,
            first_page,
            last_page,
            total_pages,
            blocks: rows.blocks.len(),
            assets: rows.assets.len(),
        });
        Ok(())
    }

    pub fn paused(&self, job: &ParseJob, owner: &str) -> Result<()> {
        self.db.pause_job(job.id, job.book_id, owner)?;
        tracing::info!("Job {} paused", job.id);
        self.state_changed(job, JobState::Paused, None);
        Ok(())
    }

    pub fn completed(&self, job: &ParseJob, owner: &str) -> Result<()> {
        self.db.complete_job(job.id, job.book_id, owner)?;
        tracing::info!("Job {} completed", job.id);
        self.state_changed(job, JobState::Completed, None);
        Ok(())
    }

    /// Record a failure with its kind and summary; the full error goes to the log
    pub fn failed(&self, job: &ParseJob, owner: &str, error: &Error) -> Result<()> {
        let summary = error.summary();
        self.db.fail_job(job.id, job.book_id, owner, error.kind(), &summary)?;
        tracing::error!("Job {} failed: {}", job.id, error);
        self.state_changed(job, JobState::Failed, Some(summary));
        Ok(())
    }

    /// Announce a state change made elsewhere (queue, resume, cancel)
    pub fn state_changed(&self, job: &ParseJob, state: JobState, error_message: Option<String>) {
        self.emit(ProgressEvent::StateChanged {
            job_id: job.id,
            book_id: job.book_id,
            state,
            error_message,
        });
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is the normal case
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Book, JobConfig};
    use std::time::Duration;

    fn setup() -> (Arc<CatalogDb>, ParseJob) {
        let db = Arc::new(CatalogDb::in_memory().unwrap());
        let book = Book::new(Uuid::new_v4(), "owner", "abc", "book.pdf", "books/x/original.pdf");
        let job = ParseJob::new(book.id, JobConfig::default());
        db.create_book_with_job(&book, &job).unwrap();
        (db, job)
    }

    #[tokio::test]
    async fn test_phase_change_persists_and_broadcasts() {
        let (db, job) = setup();
        let reporter = ProgressReporter::new(db.clone(), 16);
        let mut events = reporter.subscribe();

        let job = db.begin_attempt(job.id, "w1", Duration::from_secs(60)).unwrap().unwrap();
        reporter.phase_changed(&job, JobPhase::StructuralParse, Some(12)).unwrap();

        let status = reporter.status(job.id).unwrap();
        assert_eq!(status.phase, JobPhase::StructuralParse);
        assert_eq!(status.total_pages, Some(12));
        assert_eq!(status.percent_complete, None);

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            ProgressEvent::PhaseChanged {
                job_id: job.id,
                book_id: job.book_id,
                phase: JobPhase::StructuralParse,
                total_pages: Some(12),
            }
        );
    }

    #[tokio::test]
    async fn test_failed_records_summary() {
        let (db, job) = setup();
        let reporter = ProgressReporter::new(db.clone(), 16);
        let job = db.begin_attempt(job.id, "w1", Duration::from_secs(60)).unwrap().unwrap();

        let error = Error::engine("exit status 3\nstack trace line");
        reporter.failed(&job, "w1", &error).unwrap();

        let status = reporter.status(job.id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error_kind.as_deref(), Some("EngineError"));
        assert_eq!(status.error_message.as_deref(), Some("EngineError: exit status 3"));
        assert!(db.lease_holder(job.book_id).unwrap().is_none());
    }

    #[test]
    fn test_status_of_unknown_job() {
        let (db, _) = setup();
        let reporter = ProgressReporter::new(db, 4);
        assert_eq!(reporter.status(Uuid::new_v4()).unwrap_err().kind(), "NotFound");
    }
}
