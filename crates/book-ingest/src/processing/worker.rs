//! Background worker pool for parse jobs

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use super::control::RunningJobs;
use super::runner::{PhaseRunner, RunOutcome};
use super::PipelineContext;

/// Runs dispatched jobs with bounded concurrency
pub struct WorkerPool {
    runner: Arc<PhaseRunner>,
    concurrency: usize,
}

impl WorkerPool {
    /// Create a pool sharing the job manager's registry of running jobs
    pub fn new(ctx: PipelineContext, running: RunningJobs, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        tracing::info!("Worker pool configured: {} concurrent jobs", concurrency);
        Self {
            runner: Arc::new(PhaseRunner::new(ctx, running)),
            concurrency,
        }
    }

    /// Start processing job ids from the dispatch channel
    pub async fn run(self, mut receiver: mpsc::Receiver<Uuid>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        tracing::info!("Worker pool started");

        while let Some(job_id) = receiver.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let runner = self.runner.clone();

            tokio::spawn(async move {
                let _permit = permit;
                match runner.run(job_id).await {
                    Ok(RunOutcome::NotRunnable) => {}
                    Ok(outcome) => tracing::debug!("Job {} ended as {:?}", job_id, outcome),
                    Err(e) => tracing::error!("Job {} could not be started: {}", job_id, e),
                }
            });
        }

        tracing::info!("Dispatch channel closed, worker pool stopping");
    }
}
