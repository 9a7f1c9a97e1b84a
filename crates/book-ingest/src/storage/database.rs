//! SQLite catalog for books, parse jobs and ingested content
//!
//! The catalog is the single source of truth for job state: pause, resume and
//! cancel act through it, and workers re-read job rows at every checkpoint.
//! Writes go through one connection; reads use a second connection so status
//! polling never waits on a batch commit (WAL mode).

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{
    Asset, AssetType, BBox, Block, BlockType, Book, BookStatus, IndexStatus, JobPhase,
    JobState, Page, PageStatus, ParseJob, SearchHit, Section, SourceKind, VectorStatus,
};

/// Rows written by one ingestion batch, committed as a unit
#[derive(Debug, Default, Clone)]
pub struct BatchRows {
    pub pages: Vec<Page>,
    pub sections: Vec<Section>,
    pub blocks: Vec<Block>,
    pub assets: Vec<Asset>,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was already completed or failed
    AlreadyTerminal(JobState),
    /// The job was moved to failed from the given state
    Cancelled { previous: JobState },
}

/// SQLite-based catalog
#[derive(Clone)]
pub struct CatalogDb {
    writer: Arc<Mutex<Connection>>,
    reader: Option<Arc<Mutex<Connection>>>,
}

const BOOK_COLUMNS: &str = "id, owner_id, checksum, title, author, source_kind, file_name, \
     storage_path, page_count, language, engine_version, status, created_at, updated_at";

const JOB_COLUMNS: &str = "id, book_id, state, phase, current_page, total_pages, pause_requested, \
     error_message, error_kind, config_json, attempts, created_at, updated_at, finished_at";

const PAGE_COLUMNS: &str =
    "id, book_id, page_number, width, height, image_path, thumbnail_path, status";

const SECTION_COLUMNS: &str =
    "id, book_id, parent_id, level, title, start_page, end_page, order_index";

const BLOCK_COLUMNS: &str = "id, book_id, page_id, page_number, section_id, block_type, text, \
     markup, x, y, w, h, reading_order, asset_id, source_id, confidence";

const ASSET_COLUMNS: &str =
    "id, book_id, page_id, page_number, block_id, asset_type, file_path, x, y, w, h";

impl CatalogDb {
    /// Create or open the catalog at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)
            .map_err(|e| Error::Internal(format!("Failed to open database: {}", e)))?;
        writer.busy_timeout(Duration::from_secs(10))?;

        let mut db = Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: None,
        };
        db.migrate()?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::Internal(format!("Failed to open read connection: {}", e)))?;
        reader.busy_timeout(Duration::from_secs(10))?;
        db.reader = Some(Arc::new(Mutex::new(reader)));

        Ok(db)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            writer: Arc::new(Mutex::new(conn)),
            reader: None,
        };

        db.migrate()?;
        Ok(db)
    }

    fn read(&self) -> MutexGuard<'_, Connection> {
        self.reader.as_ref().unwrap_or(&self.writer).lock()
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.writer.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#,
        )
        .map_err(|e| Error::Internal(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                checksum TEXT NOT NULL,
                title TEXT NOT NULL,
                author TEXT,
                source_kind TEXT NOT NULL,
                file_name TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                page_count INTEGER,
                language TEXT NOT NULL,
                engine_version TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner_id, checksum)
            );

            CREATE INDEX IF NOT EXISTS idx_books_status ON books(status);

            CREATE TABLE IF NOT EXISTS parse_jobs (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                state TEXT NOT NULL,
                phase TEXT NOT NULL,
                current_page INTEGER NOT NULL DEFAULT 0,
                total_pages INTEGER,
                pause_requested INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                error_kind TEXT,
                config_json TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_parse_jobs_book ON parse_jobs(book_id);
            CREATE INDEX IF NOT EXISTS idx_parse_jobs_state ON parse_jobs(state);

            -- At most one non-terminal job per book
            CREATE UNIQUE INDEX IF NOT EXISTS idx_parse_jobs_active
                ON parse_jobs(book_id) WHERE state IN ('queued', 'running', 'paused');

            CREATE TABLE IF NOT EXISTS book_leases (
                book_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pages (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                width REAL NOT NULL,
                height REAL NOT NULL,
                image_path TEXT,
                thumbnail_path TEXT,
                status TEXT NOT NULL,
                UNIQUE(book_id, page_number)
            );

            CREATE TABLE IF NOT EXISTS sections (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                parent_id TEXT,
                level INTEGER NOT NULL,
                title TEXT NOT NULL,
                start_page INTEGER NOT NULL,
                end_page INTEGER NOT NULL,
                order_index INTEGER NOT NULL,
                CHECK (start_page <= end_page)
            );

            CREATE INDEX IF NOT EXISTS idx_sections_book ON sections(book_id, start_page);

            CREATE TABLE IF NOT EXISTS blocks (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                page_id TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                section_id TEXT,
                block_type TEXT NOT NULL,
                text TEXT NOT NULL,
                markup TEXT,
                x REAL NOT NULL,
                y REAL NOT NULL,
                w REAL NOT NULL,
                h REAL NOT NULL,
                reading_order INTEGER NOT NULL,
                asset_id TEXT,
                source_id TEXT,
                confidence REAL,
                UNIQUE(page_id, reading_order)
            );

            CREATE INDEX IF NOT EXISTS idx_blocks_book_page ON blocks(book_id, page_number);

            CREATE TABLE IF NOT EXISTS assets (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                page_id TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                block_id TEXT NOT NULL,
                asset_type TEXT NOT NULL,
                file_path TEXT NOT NULL,
                x REAL NOT NULL,
                y REAL NOT NULL,
                w REAL NOT NULL,
                h REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_assets_book_page ON assets(book_id, page_number);

            CREATE TABLE IF NOT EXISTS index_status (
                book_id TEXT PRIMARY KEY,
                fulltext_indexed INTEGER NOT NULL DEFAULT 0,
                fulltext_version TEXT,
                vector_status TEXT NOT NULL,
                vector_version TEXT,
                blocks_indexed INTEGER NOT NULL DEFAULT 0,
                indexed_at TEXT
            );

            -- Full-text index over block text, maintained by the indexing phase
            CREATE VIRTUAL TABLE IF NOT EXISTS blocks_fts USING fts5(
                text,
                block_id UNINDEXED,
                book_id UNINDEXED,
                page_number UNINDEXED,
                reading_order UNINDEXED
            );
        "#,
        )
        .map_err(|e| Error::Internal(format!("Failed to create tables: {}", e)))?;

        Ok(())
    }

    // ==================== Books ====================

    /// Insert a new book together with its first job
    pub fn create_book_with_job(&self, book: &Book, job: &ParseJob) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        insert_book(&tx, book).map_err(|e| conflict_or(e, "book with this checksum already exists"))?;
        insert_job(&tx, job).map_err(|e| conflict_or(e, "book already has an active job"))?;
        tx.commit()?;
        Ok(())
    }

    /// Find a book by owner and content checksum
    pub fn find_book_by_checksum(&self, owner_id: &str, checksum: &str) -> Result<Option<Book>> {
        let conn = self.read();
        let book = conn
            .query_row(
                &format!("SELECT {} FROM books WHERE owner_id = ?1 AND checksum = ?2", BOOK_COLUMNS),
                params![owner_id, checksum],
                row_to_book,
            )
            .optional()
            .map_err(|e| Error::Internal(format!("Failed to query book: {}", e)))?;
        Ok(book)
    }

    pub fn get_book(&self, book_id: Uuid) -> Result<Option<Book>> {
        let conn = self.read();
        let book = conn
            .query_row(
                &format!("SELECT {} FROM books WHERE id = ?1", BOOK_COLUMNS),
                params![book_id.to_string()],
                row_to_book,
            )
            .optional()?;
        Ok(book)
    }

    /// List books, newest first
    pub fn list_books(&self, owner_id: Option<&str>) -> Result<Vec<Book>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM books WHERE (?1 IS NULL OR owner_id = ?1) ORDER BY created_at DESC",
            BOOK_COLUMNS
        ))?;
        let books = stmt
            .query_map(params![owner_id], row_to_book)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(books)
    }

    pub fn set_book_status(&self, book_id: Uuid, status: BookStatus) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "UPDATE books SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![book_id.to_string(), book_status_to_string(status), now_str()],
        )?;
        Ok(())
    }

    /// Record which engine produced the content and what kind of PDF it saw
    pub fn set_book_parse_info(
        &self,
        book_id: Uuid,
        engine_version: &str,
        source_kind: SourceKind,
    ) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "UPDATE books SET engine_version = ?2, source_kind = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                book_id.to_string(),
                engine_version,
                source_kind_to_string(source_kind),
                now_str()
            ],
        )?;
        Ok(())
    }

    // ==================== Jobs ====================

    /// Insert a job for an existing book
    pub fn insert_job(&self, job: &ParseJob) -> Result<()> {
        let conn = self.writer.lock();
        insert_job(&conn, job).map_err(|e| conflict_or(e, "book already has an active job"))?;
        Ok(())
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Option<ParseJob>> {
        let conn = self.read();
        let job = conn
            .query_row(
                &format!("SELECT {} FROM parse_jobs WHERE id = ?1", JOB_COLUMNS),
                params![job_id.to_string()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// The queued, running or paused job of a book, if any
    pub fn active_job_for_book(&self, book_id: Uuid) -> Result<Option<ParseJob>> {
        let conn = self.read();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM parse_jobs WHERE book_id = ?1 \
                     AND state IN ('queued', 'running', 'paused')",
                    JOB_COLUMNS
                ),
                params![book_id.to_string()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Most recently created job of a book
    pub fn latest_job_for_book(&self, book_id: Uuid) -> Result<Option<ParseJob>> {
        let conn = self.read();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM parse_jobs WHERE book_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    JOB_COLUMNS
                ),
                params![book_id.to_string()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// List jobs, optionally filtered by state, oldest first
    pub fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<ParseJob>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM parse_jobs WHERE (?1 IS NULL OR state = ?1) ORDER BY created_at, rowid",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![state.map(job_state_to_string)], row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Move a queued job to running under a fresh lease.
    ///
    /// Returns `None` when the job is no longer queued (paused or cancelled
    /// after dispatch), in which case nothing changes.
    pub fn begin_attempt(&self, job_id: Uuid, owner: &str, ttl: Duration) -> Result<Option<ParseJob>> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let Some(mut job) = load_job(&tx, job_id)? else {
            return Err(Error::not_found(format!("job {}", job_id)));
        };
        if job.state != JobState::Queued {
            return Ok(None);
        }

        acquire_lease(&tx, job.book_id, owner, ttl)?;

        let now = now_str();
        tx.execute(
            "UPDATE parse_jobs SET state = 'running', pause_requested = 0, \
             attempts = attempts + 1, updated_at = ?2 WHERE id = ?1",
            params![job_id.to_string(), now],
        )?;
        tx.execute(
            "UPDATE books SET status = 'parsing', updated_at = ?2 WHERE id = ?1",
            params![job.book_id.to_string(), now],
        )?;
        tx.commit()?;

        job.state = JobState::Running;
        job.pause_requested = false;
        job.attempts += 1;
        Ok(Some(job))
    }

    /// Persist a phase transition of a running job
    pub fn advance_phase(&self, job_id: Uuid, phase: JobPhase, total_pages: Option<u32>) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE parse_jobs SET phase = ?2, total_pages = COALESCE(?3, total_pages), \
             updated_at = ?4 WHERE id = ?1 AND state = 'running'",
            params![job_id.to_string(), job_phase_to_string(phase), total_pages, now_str()],
        )?;
        if changed == 0 {
            return Err(stop_reason(&tx, job_id)?);
        }
        if let Some(total) = total_pages {
            tx.execute(
                "UPDATE books SET page_count = ?2 WHERE id = (SELECT book_id FROM parse_jobs WHERE id = ?1)",
                params![job_id.to_string(), total],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Commit one ingestion batch and advance `current_page` in the same transaction.
    ///
    /// The update is guarded on the job still running, still holding the lease and
    /// `current_page` strictly increasing; otherwise nothing is written.
    pub fn commit_batch(
        &self,
        job_id: Uuid,
        book_id: Uuid,
        owner: &str,
        rows: &BatchRows,
        last_page: u32,
    ) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE parse_jobs SET current_page = ?2, updated_at = ?3 \
             WHERE id = ?1 AND state = 'running' AND current_page < ?2 \
             AND EXISTS (SELECT 1 FROM book_leases WHERE book_id = ?4 AND owner_id = ?5)",
            params![job_id.to_string(), last_page, now_str(), book_id.to_string(), owner],
        )?;
        if changed == 0 {
            return Err(stop_reason(&tx, job_id)?);
        }

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO sections ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                SECTION_COLUMNS
            ))?;
            for s in &rows.sections {
                stmt.execute(params![
                    s.id.to_string(),
                    s.book_id.to_string(),
                    s.parent_id.map(|p| p.to_string()),
                    s.level,
                    s.title,
                    s.start_page,
                    s.end_page,
                    s.order_index,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO pages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                PAGE_COLUMNS
            ))?;
            for p in &rows.pages {
                stmt.execute(params![
                    p.id.to_string(),
                    p.book_id.to_string(),
                    p.page_number,
                    p.width,
                    p.height,
                    p.image_path,
                    p.thumbnail_path,
                    page_status_to_string(p.status),
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO blocks ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                BLOCK_COLUMNS
            ))?;
            for b in &rows.blocks {
                stmt.execute(params![
                    b.id.to_string(),
                    b.book_id.to_string(),
                    b.page_id.to_string(),
                    b.page_number,
                    b.section_id.map(|s| s.to_string()),
                    b.block_type.as_str(),
                    b.text,
                    b.markup,
                    b.bbox.x,
                    b.bbox.y,
                    b.bbox.w,
                    b.bbox.h,
                    b.reading_order,
                    b.asset_id.map(|a| a.to_string()),
                    b.source_id,
                    b.confidence,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO assets ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                ASSET_COLUMNS
            ))?;
            for a in &rows.assets {
                stmt.execute(params![
                    a.id.to_string(),
                    a.book_id.to_string(),
                    a.page_id.to_string(),
                    a.page_number,
                    a.block_id.to_string(),
                    asset_type_to_string(a.asset_type),
                    a.file_path,
                    a.bbox.x,
                    a.bbox.y,
                    a.bbox.w,
                    a.bbox.h,
                ])?;
            }
        }

        tx.commit()
            .map_err(|e| Error::Storage(format!("Failed to commit batch: {}", e)))?;
        Ok(())
    }

    /// Suspend a running job and release its lease
    pub fn pause_job(&self, job_id: Uuid, book_id: Uuid, owner: &str) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let now = now_str();
        let changed = tx.execute(
            "UPDATE parse_jobs SET state = 'paused', pause_requested = 0, updated_at = ?2 \
             WHERE id = ?1 AND state = 'running'",
            params![job_id.to_string(), now],
        )?;
        if changed == 0 {
            return Err(stop_reason(&tx, job_id)?);
        }
        tx.execute(
            "UPDATE books SET status = 'paused', updated_at = ?2 WHERE id = ?1",
            params![book_id.to_string(), now],
        )?;
        release_lease_tx(&tx, book_id, owner)?;
        tx.commit()?;
        Ok(())
    }

    /// Mark a running job completed, its book parsed, and release the lease
    pub fn complete_job(&self, job_id: Uuid, book_id: Uuid, owner: &str) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let now = now_str();
        let changed = tx.execute(
            "UPDATE parse_jobs SET state = 'completed', pause_requested = 0, updated_at = ?2, \
             finished_at = ?2 WHERE id = ?1 AND state = 'running'",
            params![job_id.to_string(), now],
        )?;
        if changed == 0 {
            return Err(stop_reason(&tx, job_id)?);
        }
        tx.execute(
            "UPDATE books SET status = 'parsed', updated_at = ?2 WHERE id = ?1",
            params![book_id.to_string(), now],
        )?;
        release_lease_tx(&tx, book_id, owner)?;
        tx.commit()?;
        Ok(())
    }

    /// Record a failure and release the lease.
    ///
    /// A job already failed (by a cancel request) keeps its recorded reason.
    pub fn fail_job(
        &self,
        job_id: Uuid,
        book_id: Uuid,
        owner: &str,
        error_kind: &str,
        error_message: &str,
    ) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let now = now_str();
        tx.execute(
            "UPDATE parse_jobs SET state = 'failed', pause_requested = 0, error_kind = ?2, \
             error_message = ?3, updated_at = ?4, finished_at = ?4 \
             WHERE id = ?1 AND state IN ('queued', 'running')",
            params![job_id.to_string(), error_kind, error_message, now],
        )?;
        tx.execute(
            "UPDATE books SET status = 'failed', updated_at = ?2 WHERE id = ?1",
            params![book_id.to_string(), now],
        )?;
        release_lease_tx(&tx, book_id, owner)?;
        tx.commit()?;
        Ok(())
    }

    /// Cancel a non-terminal job. Idempotent for completed and failed jobs.
    pub fn cancel_job(&self, job_id: Uuid, message: &str) -> Result<CancelOutcome> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let Some(job) = load_job(&tx, job_id)? else {
            return Err(Error::not_found(format!("job {}", job_id)));
        };
        if job.state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job.state));
        }

        let now = now_str();
        tx.execute(
            "UPDATE parse_jobs SET state = 'failed', pause_requested = 0, error_kind = 'UserCancelled', \
             error_message = ?2, updated_at = ?3, finished_at = ?3 WHERE id = ?1",
            params![job_id.to_string(), message, now],
        )?;
        tx.execute(
            "UPDATE books SET status = 'failed', updated_at = ?2 WHERE id = ?1",
            params![job.book_id.to_string(), now],
        )?;
        tx.commit()?;
        Ok(CancelOutcome::Cancelled { previous: job.state })
    }

    /// Request a cooperative pause. Returns the job state afterwards.
    ///
    /// Queued jobs pause immediately; running jobs get the flag and pause at
    /// their next checkpoint.
    pub fn request_pause(&self, job_id: Uuid) -> Result<JobState> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let Some(job) = load_job(&tx, job_id)? else {
            return Err(Error::not_found(format!("job {}", job_id)));
        };
        let now = now_str();
        let state = match job.state {
            JobState::Queued => {
                tx.execute(
                    "UPDATE parse_jobs SET state = 'paused', updated_at = ?2 WHERE id = ?1",
                    params![job_id.to_string(), now],
                )?;
                tx.execute(
                    "UPDATE books SET status = 'paused', updated_at = ?2 WHERE id = ?1",
                    params![job.book_id.to_string(), now],
                )?;
                JobState::Paused
            }
            JobState::Running => {
                tx.execute(
                    "UPDATE parse_jobs SET pause_requested = 1, updated_at = ?2 WHERE id = ?1",
                    params![job_id.to_string(), now],
                )?;
                JobState::Running
            }
            JobState::Paused => JobState::Paused,
            terminal => {
                return Err(Error::conflict(format!(
                    "job {} is {}",
                    job_id,
                    job_state_to_string(terminal)
                )))
            }
        };
        tx.commit()?;
        Ok(state)
    }

    /// Put a job back in the queue.
    ///
    /// `reset` restarts it from precheck with no committed pages.
    pub fn requeue_job(&self, job_id: Uuid, allowed: &[JobState], reset: bool) -> Result<ParseJob> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let Some(job) = load_job(&tx, job_id)? else {
            return Err(Error::not_found(format!("job {}", job_id)));
        };
        if !allowed.contains(&job.state) {
            return Err(Error::conflict(format!(
                "job {} is {}",
                job_id,
                job_state_to_string(job.state)
            )));
        }

        let now = now_str();
        tx.execute(
            "UPDATE parse_jobs SET state = 'queued', pause_requested = 0, error_kind = NULL, \
             error_message = NULL, finished_at = NULL, updated_at = ?2 WHERE id = ?1",
            params![job_id.to_string(), now],
        )
        .map_err(|e| conflict_or(e.into(), "book already has an active job"))?;
        if reset {
            tx.execute(
                "UPDATE parse_jobs SET phase = 'precheck', current_page = 0 WHERE id = ?1",
                params![job_id.to_string()],
            )?;
            tx.execute(
                "UPDATE books SET status = 'uploaded', updated_at = ?2 WHERE id = ?1",
                params![job.book_id.to_string(), now],
            )?;
        }

        let job = load_job(&tx, job_id)?
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        tx.commit()?;
        Ok(job)
    }

    /// Return running jobs of crashed workers to the queue.
    ///
    /// Jobs whose lease expired are always reclaimed. With `reclaim_live_leases`
    /// every running job is, which is only correct when no worker of this
    /// catalog can be alive, i.e. at process startup.
    pub fn requeue_stale_jobs(&self, reclaim_live_leases: bool) -> Result<Vec<Uuid>> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp_millis();

        let stale: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT j.id, j.book_id FROM parse_jobs j WHERE j.state = 'running' \
                 AND (?2 OR NOT EXISTS (SELECT 1 FROM book_leases l \
                                        WHERE l.book_id = j.book_id AND l.expires_at > ?1))",
            )?;
            let rows = stmt
                .query_map(params![now, reclaim_live_leases], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut ids = Vec::with_capacity(stale.len());
        for (job_id, book_id) in stale {
            tx.execute(
                "UPDATE parse_jobs SET state = 'queued', pause_requested = 0, updated_at = ?2 WHERE id = ?1",
                params![job_id, now_str()],
            )?;
            tx.execute("DELETE FROM book_leases WHERE book_id = ?1", params![book_id])?;
            if let Ok(id) = Uuid::parse_str(&job_id) {
                ids.push(id);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    // ==================== Leases ====================

    /// Extend a held lease; fails with `LeaseLost` if another owner took it
    pub fn renew_lease(&self, book_id: Uuid, owner: &str, ttl: Duration) -> Result<()> {
        let conn = self.writer.lock();
        let changed = conn.execute(
            "UPDATE book_leases SET expires_at = ?3 WHERE book_id = ?1 AND owner_id = ?2",
            params![book_id.to_string(), owner, expiry_millis(ttl)],
        )?;
        if changed == 0 {
            return Err(Error::LeaseLost(format!("book {} is no longer leased by {}", book_id, owner)));
        }
        Ok(())
    }

    /// Drop a lease held by `owner`; no-op otherwise
    pub fn release_lease(&self, book_id: Uuid, owner: &str) -> Result<()> {
        let conn = self.writer.lock();
        release_lease_tx(&conn, book_id, owner)?;
        Ok(())
    }

    /// Current lease holder, ignoring expired leases
    pub fn lease_holder(&self, book_id: Uuid) -> Result<Option<String>> {
        let conn = self.read();
        let owner = conn
            .query_row(
                "SELECT owner_id FROM book_leases WHERE book_id = ?1 AND expires_at > ?2",
                params![book_id.to_string(), Utc::now().timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    // ==================== Content ====================

    /// Delete pages, blocks, assets and sections that lie after `page`.
    ///
    /// Sections are created when their first page is ingested, so any section
    /// starting after `page` cannot have been referenced by a committed batch.
    pub fn delete_content_after(&self, book_id: Uuid, page: u32) -> Result<usize> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let id = book_id.to_string();
        let mut removed = 0;
        removed += tx.execute("DELETE FROM assets WHERE book_id = ?1 AND page_number > ?2", params![id, page])?;
        removed += tx.execute("DELETE FROM blocks WHERE book_id = ?1 AND page_number > ?2", params![id, page])?;
        removed += tx.execute("DELETE FROM pages WHERE book_id = ?1 AND page_number > ?2", params![id, page])?;
        removed += tx.execute("DELETE FROM sections WHERE book_id = ?1 AND start_page > ?2", params![id, page])?;
        tx.execute("DELETE FROM blocks_fts WHERE book_id = ?1 AND page_number > ?2", params![id, page])?;
        tx.commit()?;
        Ok(removed)
    }

    /// Delete all ingested content and index data of a book
    pub fn delete_book_content(&self, book_id: Uuid) -> Result<usize> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let id = book_id.to_string();
        let mut removed = 0;
        for table in ["assets", "blocks", "pages", "sections"] {
            removed += tx.execute(&format!("DELETE FROM {} WHERE book_id = ?1", table), params![id])?;
        }
        tx.execute("DELETE FROM blocks_fts WHERE book_id = ?1", params![id])?;
        tx.execute("DELETE FROM index_status WHERE book_id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn list_pages(&self, book_id: Uuid) -> Result<Vec<Page>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pages WHERE book_id = ?1 ORDER BY page_number",
            PAGE_COLUMNS
        ))?;
        let pages = stmt
            .query_map(params![book_id.to_string()], row_to_page)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    pub fn get_page(&self, book_id: Uuid, page_number: u32) -> Result<Option<Page>> {
        let conn = self.read();
        let page = conn
            .query_row(
                &format!("SELECT {} FROM pages WHERE book_id = ?1 AND page_number = ?2", PAGE_COLUMNS),
                params![book_id.to_string(), page_number],
                row_to_page,
            )
            .optional()?;
        Ok(page)
    }

    pub fn list_sections(&self, book_id: Uuid) -> Result<Vec<Section>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sections WHERE book_id = ?1 ORDER BY order_index, start_page",
            SECTION_COLUMNS
        ))?;
        let sections = stmt
            .query_map(params![book_id.to_string()], row_to_section)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sections)
    }

    /// Blocks of one page in reading order
    pub fn blocks_for_page(&self, book_id: Uuid, page_number: u32) -> Result<Vec<Block>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM blocks WHERE book_id = ?1 AND page_number = ?2 ORDER BY reading_order",
            BLOCK_COLUMNS
        ))?;
        let blocks = stmt
            .query_map(params![book_id.to_string(), page_number], row_to_block)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    /// All blocks of a book in page and reading order
    pub fn blocks_for_book(&self, book_id: Uuid) -> Result<Vec<Block>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM blocks WHERE book_id = ?1 ORDER BY page_number, reading_order",
            BLOCK_COLUMNS
        ))?;
        let blocks = stmt
            .query_map(params![book_id.to_string()], row_to_block)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    pub fn assets_for_book(&self, book_id: Uuid) -> Result<Vec<Asset>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM assets WHERE book_id = ?1 ORDER BY page_number",
            ASSET_COLUMNS
        ))?;
        let assets = stmt
            .query_map(params![book_id.to_string()], row_to_asset)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(assets)
    }

    // ==================== Full-text index ====================

    /// Replace a book's full-text entries with `blocks` and record the status
    pub fn replace_fulltext(&self, book_id: Uuid, blocks: &[Block], version: &str) -> Result<IndexStatus> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let id = book_id.to_string();

        tx.execute("DELETE FROM blocks_fts WHERE book_id = ?1", params![id])
            .map_err(|e| Error::Internal(format!("Failed to clear full-text index: {}", e)))?;

        let mut indexed = 0u64;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO blocks_fts (text, block_id, book_id, page_number, reading_order) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for block in blocks {
                if block.text.trim().is_empty() || block.block_type == BlockType::Furniture {
                    continue;
                }
                stmt.execute(params![
                    block.text,
                    block.id.to_string(),
                    id,
                    block.page_number,
                    block.reading_order
                ])?;
                indexed += 1;
            }
        }

        let status = IndexStatus {
            book_id,
            fulltext_indexed: true,
            fulltext_version: Some(version.to_string()),
            vector_status: VectorStatus::NotIndexed,
            vector_version: None,
            blocks_indexed: indexed,
            indexed_at: Some(Utc::now()),
        };
        upsert_index_status(&tx, &status)?;
        tx.commit()?;
        Ok(status)
    }

    /// Remove a book's full-text entries and status
    pub fn clear_fulltext(&self, book_id: Uuid) -> Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM blocks_fts WHERE book_id = ?1", params![book_id.to_string()])?;
        tx.execute("DELETE FROM index_status WHERE book_id = ?1", params![book_id.to_string()])?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_index_status(&self, book_id: Uuid) -> Result<Option<IndexStatus>> {
        let conn = self.read();
        let status = conn
            .query_row(
                "SELECT book_id, fulltext_indexed, fulltext_version, vector_status, vector_version, \
                 blocks_indexed, indexed_at FROM index_status WHERE book_id = ?1",
                params![book_id.to_string()],
                row_to_index_status,
            )
            .optional()?;
        Ok(status)
    }

    /// Ranked block search, optionally restricted to one book
    pub fn search_blocks(&self, query: &str, book_id: Option<Uuid>, limit: usize) -> Result<Vec<SearchHit>> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT block_id, book_id, page_number, reading_order, text, bm25(blocks_fts) AS score \
             FROM blocks_fts WHERE blocks_fts MATCH ?1 AND (?2 IS NULL OR book_id = ?2) \
             ORDER BY score LIMIT ?3",
        )?;
        let hits = stmt
            .query_map(
                params![fts_query, book_id.map(|b| b.to_string()), limit as i64],
                |row| {
                    Ok(SearchHit {
                        block_id: uuid_col(row, 0)?,
                        book_id: uuid_col(row, 1)?,
                        page_number: row.get(2)?,
                        reading_order: row.get(3)?,
                        text: row.get(4)?,
                        score: row.get(5)?,
                    })
                },
            )
            .map_err(|e| Error::Internal(format!("Failed to search blocks: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hits)
    }
}

// ==================== Transaction helpers ====================

fn insert_book(conn: &Connection, book: &Book) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO books ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            BOOK_COLUMNS
        ),
        params![
            book.id.to_string(),
            book.owner_id,
            book.checksum,
            book.title,
            book.author,
            source_kind_to_string(book.source_kind),
            book.file_name,
            book.storage_path,
            book.page_count,
            book.language,
            book.engine_version,
            book_status_to_string(book.status),
            book.created_at.to_rfc3339(),
            book.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_job(conn: &Connection, job: &ParseJob) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO parse_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            JOB_COLUMNS
        ),
        params![
            job.id.to_string(),
            job.book_id.to_string(),
            job_state_to_string(job.state),
            job_phase_to_string(job.phase),
            job.current_page,
            job.total_pages,
            job.pause_requested,
            job.error_message,
            job.error_kind,
            serde_json::to_string(&job.config)?,
            job.attempts,
            job.created_at.to_rfc3339(),
            job.updated_at.to_rfc3339(),
            job.finished_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn load_job(conn: &Connection, job_id: Uuid) -> Result<Option<ParseJob>> {
    let job = conn
        .query_row(
            &format!("SELECT {} FROM parse_jobs WHERE id = ?1", JOB_COLUMNS),
            params![job_id.to_string()],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

/// Why a guarded update on a running job matched nothing
fn stop_reason(tx: &Transaction<'_>, job_id: Uuid) -> Result<Error> {
    Ok(match load_job(tx, job_id)? {
        None => Error::not_found(format!("job {}", job_id)),
        Some(job) if job.state == JobState::Failed => Error::UserCancelled,
        Some(job) => Error::LeaseLost(format!(
            "job {} is {} and no longer owned by this worker",
            job_id,
            job_state_to_string(job.state)
        )),
    })
}

fn acquire_lease(tx: &Transaction<'_>, book_id: Uuid, owner: &str, ttl: Duration) -> Result<()> {
    let now = Utc::now().timestamp_millis();
    let existing: Option<(String, i64)> = tx
        .query_row(
            "SELECT owner_id, expires_at FROM book_leases WHERE book_id = ?1",
            params![book_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((holder, expires_at)) = existing {
        if holder != owner && expires_at > now {
            return Err(Error::conflict(format!("book {} is leased by {}", book_id, holder)));
        }
    }

    tx.execute(
        "INSERT OR REPLACE INTO book_leases (book_id, owner_id, expires_at) VALUES (?1, ?2, ?3)",
        params![book_id.to_string(), owner, expiry_millis(ttl)],
    )?;
    Ok(())
}

fn release_lease_tx(conn: &Connection, book_id: Uuid, owner: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM book_leases WHERE book_id = ?1 AND owner_id = ?2",
        params![book_id.to_string(), owner],
    )?;
    Ok(())
}

fn upsert_index_status(conn: &Connection, status: &IndexStatus) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO index_status (book_id, fulltext_indexed, fulltext_version, \
         vector_status, vector_version, blocks_indexed, indexed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            status.book_id.to_string(),
            status.fulltext_indexed,
            status.fulltext_version,
            vector_status_to_string(status.vector_status),
            status.vector_version,
            status.blocks_indexed as i64,
            status.indexed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Map unique-constraint failures to `Conflict`, pass anything else through
fn conflict_or(err: Error, message: &str) -> Error {
    match err {
        Error::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::conflict(message)
        }
        other => other,
    }
}

/// Quote each term so user input cannot inject FTS5 syntax
fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn expiry_millis(ttl: Duration) -> i64 {
    Utc::now().timestamp_millis() + ttl.as_millis() as i64
}

// ==================== Row mapping ====================

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Uuid::parse_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_book(row: &Row<'_>) -> rusqlite::Result<Book> {
    let source_kind: String = row.get(5)?;
    let status: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    Ok(Book {
        id: uuid_col(row, 0)?,
        owner_id: row.get(1)?,
        checksum: row.get(2)?,
        title: row.get(3)?,
        author: row.get(4)?,
        source_kind: string_to_source_kind(&source_kind),
        file_name: row.get(6)?,
        storage_path: row.get(7)?,
        page_count: row.get(8)?,
        language: row.get(9)?,
        engine_version: row.get(10)?,
        status: string_to_book_status(&status),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ParseJob> {
    let state: String = row.get(2)?;
    let phase: String = row.get(3)?;
    let config_json: String = row.get(9)?;
    let config = serde_json::from_str(&config_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    let finished_at: Option<String> = row.get(13)?;
    Ok(ParseJob {
        id: uuid_col(row, 0)?,
        book_id: uuid_col(row, 1)?,
        state: string_to_job_state(&state),
        phase: string_to_job_phase(&phase),
        current_page: row.get(4)?,
        total_pages: row.get(5)?,
        pause_requested: row.get(6)?,
        error_message: row.get(7)?,
        error_kind: row.get(8)?,
        config,
        attempts: row.get(10)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        finished_at: finished_at.as_deref().map(parse_ts),
    })
}

fn row_to_page(row: &Row<'_>) -> rusqlite::Result<Page> {
    let status: String = row.get(7)?;
    Ok(Page {
        id: uuid_col(row, 0)?,
        book_id: uuid_col(row, 1)?,
        page_number: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        image_path: row.get(5)?,
        thumbnail_path: row.get(6)?,
        status: string_to_page_status(&status),
    })
}

fn row_to_section(row: &Row<'_>) -> rusqlite::Result<Section> {
    Ok(Section {
        id: uuid_col(row, 0)?,
        book_id: uuid_col(row, 1)?,
        parent_id: opt_uuid_col(row, 2)?,
        level: row.get(3)?,
        title: row.get(4)?,
        start_page: row.get(5)?,
        end_page: row.get(6)?,
        order_index: row.get(7)?,
    })
}

fn row_to_block(row: &Row<'_>) -> rusqlite::Result<Block> {
    let block_type: String = row.get(5)?;
    Ok(Block {
        id: uuid_col(row, 0)?,
        book_id: uuid_col(row, 1)?,
        page_id: uuid_col(row, 2)?,
        page_number: row.get(3)?,
        section_id: opt_uuid_col(row, 4)?,
        block_type: BlockType::parse(&block_type).unwrap_or(BlockType::Paragraph),
        text: row.get(6)?,
        markup: row.get(7)?,
        bbox: BBox::new(row.get(8)?, row.get(9)?, row.get(10)?, row.get(11)?),
        reading_order: row.get(12)?,
        asset_id: opt_uuid_col(row, 13)?,
        source_id: row.get(14)?,
        confidence: row.get(15)?,
    })
}

fn row_to_asset(row: &Row<'_>) -> rusqlite::Result<Asset> {
    let asset_type: String = row.get(5)?;
    Ok(Asset {
        id: uuid_col(row, 0)?,
        book_id: uuid_col(row, 1)?,
        page_id: uuid_col(row, 2)?,
        page_number: row.get(3)?,
        block_id: uuid_col(row, 4)?,
        asset_type: string_to_asset_type(&asset_type),
        file_path: row.get(6)?,
        bbox: BBox::new(row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?),
    })
}

fn row_to_index_status(row: &Row<'_>) -> rusqlite::Result<IndexStatus> {
    let vector_status: String = row.get(3)?;
    let blocks_indexed: i64 = row.get(5)?;
    let indexed_at: Option<String> = row.get(6)?;
    Ok(IndexStatus {
        book_id: uuid_col(row, 0)?,
        fulltext_indexed: row.get(1)?,
        fulltext_version: row.get(2)?,
        vector_status: string_to_vector_status(&vector_status),
        vector_version: row.get(4)?,
        blocks_indexed: blocks_indexed.max(0) as u64,
        indexed_at: indexed_at.as_deref().map(parse_ts),
    })
}

// ==================== Enum conversions ====================

fn book_status_to_string(status: BookStatus) -> &'static str {
    match status {
        BookStatus::Uploaded => "uploaded",
        BookStatus::Parsing => "parsing",
        BookStatus::Paused => "paused",
        BookStatus::Parsed => "parsed",
        BookStatus::Failed => "failed",
        BookStatus::NeedsReparse => "needs_reparse",
    }
}

fn string_to_book_status(s: &str) -> BookStatus {
    match s {
        "uploaded" => BookStatus::Uploaded,
        "parsing" => BookStatus::Parsing,
        "paused" => BookStatus::Paused,
        "parsed" => BookStatus::Parsed,
        "needs_reparse" => BookStatus::NeedsReparse,
        _ => BookStatus::Failed,
    }
}

fn source_kind_to_string(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Digital => "digital",
        SourceKind::Scanned => "scanned",
        SourceKind::Mixed => "mixed",
        SourceKind::Unknown => "unknown",
    }
}

fn string_to_source_kind(s: &str) -> SourceKind {
    match s {
        "digital" => SourceKind::Digital,
        "scanned" => SourceKind::Scanned,
        "mixed" => SourceKind::Mixed,
        _ => SourceKind::Unknown,
    }
}

fn job_state_to_string(state: JobState) -> &'static str {
    match state {
        JobState::Queued => "queued",
        JobState::Running => "running",
        JobState::Paused => "paused",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
    }
}

fn string_to_job_state(s: &str) -> JobState {
    match s {
        "queued" => JobState::Queued,
        "running" => JobState::Running,
        "paused" => JobState::Paused,
        "completed" => JobState::Completed,
        _ => JobState::Failed,
    }
}

fn job_phase_to_string(phase: JobPhase) -> &'static str {
    match phase {
        JobPhase::Precheck => "precheck",
        JobPhase::StructuralParse => "structural_parse",
        JobPhase::Ingestion => "ingestion",
        JobPhase::Indexing => "indexing",
    }
}

fn string_to_job_phase(s: &str) -> JobPhase {
    match s {
        "structural_parse" => JobPhase::StructuralParse,
        "ingestion" => JobPhase::Ingestion,
        "indexing" => JobPhase::Indexing,
        _ => JobPhase::Precheck,
    }
}

fn page_status_to_string(status: PageStatus) -> &'static str {
    match status {
        PageStatus::Parsed => "parsed",
        PageStatus::Failed => "failed",
        PageStatus::Skipped => "skipped",
    }
}

fn string_to_page_status(s: &str) -> PageStatus {
    match s {
        "parsed" => PageStatus::Parsed,
        "skipped" => PageStatus::Skipped,
        _ => PageStatus::Failed,
    }
}

fn asset_type_to_string(asset_type: AssetType) -> &'static str {
    match asset_type {
        AssetType::Figure => "figure",
        AssetType::Table => "table",
        AssetType::Equation => "equation",
    }
}

fn string_to_asset_type(s: &str) -> AssetType {
    match s {
        "table" => AssetType::Table,
        "equation" => AssetType::Equation,
        _ => AssetType::Figure,
    }
}

fn vector_status_to_string(status: VectorStatus) -> &'static str {
    match status {
        VectorStatus::NotIndexed => "not_indexed",
        VectorStatus::Indexed => "indexed",
    }
}

fn string_to_vector_status(s: &str) -> VectorStatus {
    match s {
        "indexed" => VectorStatus::Indexed,
        _ => VectorStatus::NotIndexed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobConfig;

    const TTL: Duration = Duration::from_secs(60);

    fn new_book(owner: &str, checksum: &str) -> Book {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Book {
            id,
            owner_id: owner.to_string(),
            checksum: checksum.to_string(),
            title: "Test Book".to_string(),
            author: None,
            source_kind: SourceKind::Unknown,
            file_name: "test.pdf".to_string(),
            storage_path: format!("books/{}/original.pdf", id),
            page_count: None,
            language: "en".to_string(),
            engine_version: None,
            status: BookStatus::Uploaded,
            created_at: now,
            updated_at: now,
        }
    }

    fn new_job(book_id: Uuid) -> ParseJob {
        let now = Utc::now();
        ParseJob {
            id: Uuid::new_v4(),
            book_id,
            state: JobState::Queued,
            phase: JobPhase::Precheck,
            current_page: 0,
            total_pages: None,
            pause_requested: false,
            error_message: None,
            error_kind: None,
            config: JobConfig {
                language: "en".to_string(),
                ocr_enabled: false,
                batch_size: 50,
                engine: "test".to_string(),
            },
            attempts: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn page_rows(book_id: Uuid, pages: std::ops::RangeInclusive<u32>) -> BatchRows {
        let mut rows = BatchRows::default();
        for n in pages {
            let page_id = Uuid::new_v4();
            rows.pages.push(Page {
                id: page_id,
                book_id,
                page_number: n,
                width: 612.0,
                height: 792.0,
                image_path: None,
                thumbnail_path: None,
                status: PageStatus::Parsed,
            });
            rows.blocks.push(Block {
                id: Uuid::new_v4(),
                book_id,
                page_id,
                page_number: n,
                section_id: None,
                block_type: BlockType::Paragraph,
                text: format!("the quick brown fox on page {}", n),
                markup: None,
                bbox: BBox::new(10.0, 10.0, 100.0, 20.0),
                reading_order: 0,
                asset_id: None,
                source_id: None,
                confidence: None,
            });
        }
        rows
    }

    fn running_job(db: &CatalogDb) -> (Book, ParseJob) {
        let book = new_book("alice", &Uuid::new_v4().to_string());
        let job = new_job(book.id);
        db.create_book_with_job(&book, &job).unwrap();
        let job = db.begin_attempt(job.id, "w1", TTL).unwrap().unwrap();
        (book, job)
    }

    #[test]
    fn test_create_and_dedup_lookup() {
        let db = CatalogDb::in_memory().unwrap();
        let book = new_book("alice", "abc");
        db.create_book_with_job(&book, &new_job(book.id)).unwrap();

        let found = db.find_book_by_checksum("alice", "abc").unwrap().unwrap();
        assert_eq!(found.id, book.id);
        assert!(db.find_book_by_checksum("bob", "abc").unwrap().is_none());

        // Same owner and checksum is rejected by the unique constraint
        let dup = new_book("alice", "abc");
        let err = db.create_book_with_job(&dup, &new_job(dup.id)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_one_active_job_per_book() {
        let db = CatalogDb::in_memory().unwrap();
        let book = new_book("alice", "abc");
        db.create_book_with_job(&book, &new_job(book.id)).unwrap();

        let err = db.insert_job(&new_job(book.id)).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_begin_attempt_takes_lease() {
        let db = CatalogDb::in_memory().unwrap();
        let (book, job) = running_job(&db);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(db.lease_holder(book.id).unwrap().as_deref(), Some("w1"));
        assert_eq!(db.get_book(book.id).unwrap().unwrap().status, BookStatus::Parsing);

        // Not queued any more: a second dispatch is a no-op
        assert!(db.begin_attempt(job.id, "w2", TTL).unwrap().is_none());
    }

    #[test]
    fn test_commit_batch_advances_page() {
        let db = CatalogDb::in_memory().unwrap();
        let (book, job) = running_job(&db);

        db.commit_batch(job.id, book.id, "w1", &page_rows(book.id, 1..=3), 3).unwrap();
        let job = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.current_page, 3);
        assert_eq!(db.list_pages(book.id).unwrap().len(), 3);
        assert_eq!(db.blocks_for_page(book.id, 2).unwrap().len(), 1);

        // current_page never goes backwards
        let err = db.commit_batch(job.id, book.id, "w1", &page_rows(book.id, 2..=2), 2).unwrap_err();
        assert!(matches!(err, Error::LeaseLost(_)));
        assert_eq!(db.list_pages(book.id).unwrap().len(), 3);
    }

    #[test]
    fn test_commit_batch_after_cancel_writes_nothing() {
        let db = CatalogDb::in_memory().unwrap();
        let (book, job) = running_job(&db);

        let outcome = db.cancel_job(job.id, "UserCancelled: cancelled by user").unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled { previous: JobState::Running });

        let err = db.commit_batch(job.id, book.id, "w1", &page_rows(book.id, 1..=2), 2).unwrap_err();
        assert!(matches!(err, Error::UserCancelled));
        assert!(db.list_pages(book.id).unwrap().is_empty());

        // Second cancel is a no-op
        assert_eq!(
            db.cancel_job(job.id, "again").unwrap(),
            CancelOutcome::AlreadyTerminal(JobState::Failed)
        );
    }

    #[test]
    fn test_duplicate_page_rolls_back_whole_batch() {
        let db = CatalogDb::in_memory().unwrap();
        let (book, job) = running_job(&db);
        db.commit_batch(job.id, book.id, "w1", &page_rows(book.id, 1..=1), 1).unwrap();

        // Page 1 again alongside page 2 violates UNIQUE(book_id, page_number)
        let mut rows = page_rows(book.id, 2..=2);
        rows.pages.extend(page_rows(book.id, 1..=1).pages);
        assert!(db.commit_batch(job.id, book.id, "w1", &rows, 2).is_err());

        assert_eq!(db.get_job(job.id).unwrap().unwrap().current_page, 1);
        assert_eq!(db.list_pages(book.id).unwrap().len(), 1);
    }

    #[test]
    fn test_pause_request_and_requeue() {
        let db = CatalogDb::in_memory().unwrap();
        let (book, job) = running_job(&db);

        assert_eq!(db.request_pause(job.id).unwrap(), JobState::Running);
        assert!(db.get_job(job.id).unwrap().unwrap().pause_requested);

        db.pause_job(job.id, book.id, "w1").unwrap();
        let paused = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(paused.state, JobState::Paused);
        assert!(!paused.pause_requested);
        assert!(db.lease_holder(book.id).unwrap().is_none());
        assert_eq!(db.get_book(book.id).unwrap().unwrap().status, BookStatus::Paused);

        let requeued = db.requeue_job(job.id, &[JobState::Paused], false).unwrap();
        assert_eq!(requeued.state, JobState::Queued);

        let err = db.requeue_job(job.id, &[JobState::Paused], false).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_pause_queued_job_is_immediate() {
        let db = CatalogDb::in_memory().unwrap();
        let book = new_book("alice", "abc");
        let job = new_job(book.id);
        db.create_book_with_job(&book, &job).unwrap();

        assert_eq!(db.request_pause(job.id).unwrap(), JobState::Paused);
        assert!(db.begin_attempt(job.id, "w1", TTL).unwrap().is_none());
    }

    #[test]
    fn test_lease_conflict_and_expiry() {
        let db = CatalogDb::in_memory().unwrap();
        let book = new_book("alice", "abc");
        let job = new_job(book.id);
        db.create_book_with_job(&book, &job).unwrap();

        {
            let mut conn = db.writer.lock();
            let tx = conn.transaction().unwrap();
            acquire_lease(&tx, book.id, "other", TTL).unwrap();
            tx.commit().unwrap();
        }
        assert!(matches!(db.begin_attempt(job.id, "w1", TTL), Err(Error::Conflict(_))));

        // An expired lease can be taken over
        {
            let mut conn = db.writer.lock();
            let tx = conn.transaction().unwrap();
            acquire_lease(&tx, book.id, "other", Duration::ZERO).unwrap();
            tx.commit().unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(db.begin_attempt(job.id, "w1", TTL).unwrap().is_some());
        assert!(matches!(db.renew_lease(book.id, "other", TTL), Err(Error::LeaseLost(_))));
    }

    #[test]
    fn test_requeue_stale_running_jobs() {
        let db = CatalogDb::in_memory().unwrap();
        let book = new_book("alice", "abc");
        let job = new_job(book.id);
        db.create_book_with_job(&book, &job).unwrap();
        db.begin_attempt(job.id, "crashed", Duration::ZERO).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let (_, live) = running_job(&db);

        let ids = db.requeue_stale_jobs(false).unwrap();
        assert_eq!(ids, vec![job.id]);
        assert_eq!(db.get_job(job.id).unwrap().unwrap().state, JobState::Queued);
        assert_eq!(db.get_job(live.id).unwrap().unwrap().state, JobState::Running);

        // At startup a live lease still belongs to a dead process
        let ids = db.requeue_stale_jobs(true).unwrap();
        assert_eq!(ids, vec![live.id]);
        assert_eq!(db.get_job(live.id).unwrap().unwrap().state, JobState::Queued);
        assert_eq!(db.lease_holder(live.book_id).unwrap(), None);
    }

    #[test]
    fn test_delete_content_after() {
        let db = CatalogDb::in_memory().unwrap();
        let (book, job) = running_job(&db);
        let mut rows = page_rows(book.id, 1..=4);
        for (i, start) in [1u32, 3].iter().enumerate() {
            rows.sections.push(Section {
                id: Uuid::new_v4(),
                book_id: book.id,
                parent_id: None,
                level: 1,
                title: format!("Chapter {}", i + 1),
                start_page: *start,
                end_page: start + 1,
                order_index: i as u32,
            });
        }
        db.commit_batch(job.id, book.id, "w1", &rows, 4).unwrap();

        db.delete_content_after(book.id, 2).unwrap();
        assert_eq!(db.list_pages(book.id).unwrap().len(), 2);
        assert_eq!(db.blocks_for_book(book.id).unwrap().len(), 2);
        let sections = db.list_sections(book.id).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Chapter 1");
    }

    #[test]
    fn test_fulltext_replace_and_search() {
        let db = CatalogDb::in_memory().unwrap();
        let (book, job) = running_job(&db);
        db.commit_batch(job.id, book.id, "w1", &page_rows(book.id, 1..=3), 3).unwrap();
        let blocks = db.blocks_for_book(book.id).unwrap();

        let status = db.replace_fulltext(book.id, &blocks, "v1").unwrap();
        assert!(status.fulltext_indexed);
        assert_eq!(status.blocks_indexed, 3);

        // Re-running replaces rather than duplicates
        db.replace_fulltext(book.id, &blocks, "v1").unwrap();
        let hits = db.search_blocks("brown fox", Some(book.id), 10).unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.book_id == book.id));

        let hits = db.search_blocks("page 2", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_number, 2);

        assert!(db.search_blocks("   ", None, 10).unwrap().is_empty());
        assert!(db.search_blocks("\"unbalanced", None, 10).unwrap().is_empty());

        let stored = db.get_index_status(book.id).unwrap().unwrap();
        assert_eq!(stored.vector_status, VectorStatus::NotIndexed);
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("hello world").as_deref(), Some("\"hello\" \"world\""));
        assert_eq!(fts_query("say \"hi\"").as_deref(), Some("\"say\" \"\"\"hi\"\"\""));
        assert_eq!(fts_query("  "), None);
    }
}
