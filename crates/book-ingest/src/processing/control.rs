//! Cooperative pause/cancel control for running jobs

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::CatalogDb;
use crate::types::JobState;

/// What a worker should do after a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Pause,
}

/// Checkpoint of one running attempt.
///
/// Re-reads the authoritative job row and renews the book lease, so a worker
/// only ever acts on the catalog's current state, never on a cached copy.
pub struct Checkpoint {
    db: Arc<CatalogDb>,
    job_id: Uuid,
    book_id: Uuid,
    owner: String,
    lease_ttl: Duration,
    token: CancellationToken,
}

impl Checkpoint {
    pub fn new(
        db: Arc<CatalogDb>,
        job_id: Uuid,
        book_id: Uuid,
        owner: impl Into<String>,
        lease_ttl: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            db,
            job_id,
            book_id,
            owner: owner.into(),
            lease_ttl,
            token,
        }
    }

    /// Signalled when the job is cancelled while running
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Decide whether to continue, pause or stop.
    ///
    /// Errors with `UserCancelled` once the job was cancelled and with
    /// `LeaseLost` when another worker owns the book.
    pub fn check(&self) -> Result<Directive> {
        if self.token.is_cancelled() {
            return Err(Error::UserCancelled);
        }

        let job = self
            .db
            .get_job(self.job_id)?
            .ok_or_else(|| Error::not_found(format!("job {}", self.job_id)))?;

        match job.state {
            JobState::Running => {}
            JobState::Failed => return Err(Error::UserCancelled),
            other => {
                return Err(Error::LeaseLost(format!(
                    "job {} is {:?}, not running",
                    self.job_id, other
                )))
            }
        }

        self.db.renew_lease(self.book_id, &self.owner, self.lease_ttl)?;

        if job.pause_requested {
            Ok(Directive::Pause)
        } else {
            Ok(Directive::Continue)
        }
    }
}

/// Cancellation tokens of jobs currently held by a worker
#[derive(Clone, Default)]
pub struct RunningJobs {
    tokens: Arc<DashMap<Uuid, (u64, CancellationToken)>>,
    generation: Arc<AtomicU64>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attempt; the entry is removed when the guard drops
    pub fn register(&self, job_id: Uuid) -> RunningGuard {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        self.tokens.insert(job_id, (generation, token.clone()));
        RunningGuard {
            jobs: self.clone(),
            job_id,
            generation,
            token,
        }
    }

    /// Signal the worker running `job_id`. Returns false when no worker holds it.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.tokens.get(&job_id) {
            Some(entry) => {
                entry.1.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.tokens.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Registration of one attempt in [`RunningJobs`]
pub struct RunningGuard {
    jobs: RunningJobs,
    job_id: Uuid,
    generation: u64,
    token: CancellationToken,
}

impl RunningGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        // A later attempt of the same job may have replaced this entry
        let generation = self.generation;
        self.jobs
            .tokens
            .remove_if(&self.job_id, |_, (g, _)| *g == generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Book, JobConfig, ParseJob};

    fn running_job(db: &CatalogDb) -> ParseJob {
        let book = Book::new(Uuid::new_v4(), "u", "sum", "a.pdf", "books/a/original.pdf");
        let job = ParseJob::new(book.id, JobConfig::default());
        db.create_book_with_job(&book, &job).unwrap();
        db.begin_attempt(job.id, "w1", Duration::from_secs(60)).unwrap().unwrap()
    }

    fn checkpoint(db: &Arc<CatalogDb>, job: &ParseJob, owner: &str) -> Checkpoint {
        Checkpoint::new(
            db.clone(),
            job.id,
            job.book_id,
            owner,
            Duration::from_secs(60),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_continue_then_pause() {
        let db = Arc::new(CatalogDb::in_memory().unwrap());
        let job = running_job(&db);
        let cp = checkpoint(&db, &job, "w1");

        assert_eq!(cp.check().unwrap(), Directive::Continue);
        db.request_pause(job.id).unwrap();
        assert_eq!(cp.check().unwrap(), Directive::Pause);
    }

    #[test]
    fn test_cancelled_job_stops() {
        let db = Arc::new(CatalogDb::in_memory().unwrap());
        let job = running_job(&db);
        let cp = checkpoint(&db, &job, "w1");

        db.cancel_job(job.id, "UserCancelled: cancelled by user").unwrap();
        assert!(matches!(cp.check(), Err(Error::UserCancelled)));
    }

    #[test]
    fn test_token_cancel_stops_without_db() {
        let db = Arc::new(CatalogDb::in_memory().unwrap());
        let job = running_job(&db);
        let cp = checkpoint(&db, &job, "w1");

        cp.token().cancel();
        assert!(matches!(cp.check(), Err(Error::UserCancelled)));
    }

    #[test]
    fn test_foreign_owner_loses_lease() {
        let db = Arc::new(CatalogDb::in_memory().unwrap());
        let job = running_job(&db);
        let cp = checkpoint(&db, &job, "someone-else");

        assert!(matches!(cp.check(), Err(Error::LeaseLost(_))));
    }

    #[test]
    fn test_registry_guard_generations() {
        let jobs = RunningJobs::new();
        let job_id = Uuid::new_v4();

        let first = jobs.register(job_id);
        let second = jobs.register(job_id);
        drop(first);
        assert!(jobs.is_running(job_id), "stale guard must not remove newer entry");

        assert!(jobs.cancel(job_id));
        assert!(second.token().is_cancelled());
        drop(second);
        assert!(jobs.is_empty());
        assert!(!jobs.cancel(job_id));
    }
}
