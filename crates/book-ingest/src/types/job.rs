//! Parse job records and the phase/state enums

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution state of a job, orthogonal to its phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    /// Completed and failed jobs never run again without an explicit retry
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Ordered pipeline stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Precheck,
    StructuralParse,
    Ingestion,
    Indexing,
}

impl JobPhase {
    /// The phase that follows, or `None` after indexing
    pub fn next(self) -> Option<JobPhase> {
        match self {
            JobPhase::Precheck => Some(JobPhase::StructuralParse),
            JobPhase::StructuralParse => Some(JobPhase::Ingestion),
            JobPhase::Ingestion => Some(JobPhase::Indexing),
            JobPhase::Indexing => None,
        }
    }
}

/// Configuration snapshot taken when the job is created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    /// Language hint for the engine
    pub language: String,
    /// Run OCR on scanned pages
    pub ocr_enabled: bool,
    /// Pages per ingestion batch
    pub batch_size: u32,
    /// Engine name at submission time
    pub engine: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            ocr_enabled: false,
            batch_size: 50,
            engine: "subprocess".to_string(),
        }
    }
}

/// Stateful execution of parsing, ingestion and indexing for one book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseJob {
    pub id: Uuid,
    pub book_id: Uuid,
    pub state: JobState,
    pub phase: JobPhase,
    /// Last page fully committed (0 before the first batch)
    pub current_page: u32,
    /// Physical page count once precheck has run
    pub total_pages: Option<u32>,
    /// Cooperative pause flag, observed at checkpoints
    pub pause_requested: bool,
    /// Concise diagnostic for failed jobs
    pub error_message: Option<String>,
    /// Error taxonomy name for failed jobs
    pub error_kind: Option<String>,
    pub config: JobConfig,
    /// Number of times a worker picked this job up
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ParseJob {
    /// Fresh queued job starting at precheck
    pub fn new(book_id: Uuid, config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            book_id,
            state: JobState::Queued,
            phase: JobPhase::Precheck,
            current_page: 0,
            total_pages: None,
            pause_requested: false,
            error_message: None,
            error_kind: None,
            config,
            attempts: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Whether this job was stopped by a cancel request
    pub fn was_cancelled(&self) -> bool {
        self.error_kind.as_deref() == Some("UserCancelled")
    }

    /// Percentage complete for polling clients.
    ///
    /// `None` while the structural parse runs, since engines give no sub-progress.
    pub fn percent_complete(&self) -> Option<f32> {
        if self.state == JobState::Completed {
            return Some(100.0);
        }
        match self.phase {
            JobPhase::Precheck => Some(0.0),
            JobPhase::StructuralParse => None,
            JobPhase::Ingestion | JobPhase::Indexing => match self.total_pages {
                Some(total) if total > 0 => {
                    Some((self.current_page.min(total) as f32 / total as f32) * 100.0)
                }
                _ => Some(0.0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(phase: JobPhase, current: u32, total: Option<u32>) -> ParseJob {
        let now = Utc::now();
        ParseJob {
            id: Uuid::new_v4(),
            book_id: Uuid::new_v4(),
            state: JobState::Running,
            phase,
            current_page: current,
            total_pages: total,
            pause_requested: false,
            error_message: None,
            error_kind: None,
            config: JobConfig {
                language: "en".into(),
                ocr_enabled: false,
                batch_size: 50,
                engine: "test".into(),
            },
            attempts: 1,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[test]
    fn test_phase_order() {
        assert_eq!(JobPhase::Precheck.next(), Some(JobPhase::StructuralParse));
        assert_eq!(JobPhase::Ingestion.next(), Some(JobPhase::Indexing));
        assert_eq!(JobPhase::Indexing.next(), None);
        assert!(JobPhase::StructuralParse < JobPhase::Ingestion);
    }

    #[test]
    fn test_percent_complete() {
        assert_eq!(job(JobPhase::StructuralParse, 0, Some(10)).percent_complete(), None);
        assert_eq!(job(JobPhase::Ingestion, 5, Some(10)).percent_complete(), Some(50.0));
        assert_eq!(job(JobPhase::Ingestion, 0, None).percent_complete(), Some(0.0));

        let mut done = job(JobPhase::Indexing, 10, Some(10));
        done.state = JobState::Completed;
        assert_eq!(done.percent_complete(), Some(100.0));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(!JobState::Queued.is_terminal());
    }
}
