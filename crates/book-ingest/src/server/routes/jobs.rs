//! Job status and control endpoints

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::error::Result;
use crate::processing::{JobStatusView, ProgressEvent, QueueStats};
use crate::server::state::AppState;
use crate::types::JobState;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<JobState>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobStatusView>,
    pub stats: QueueStats,
}

/// GET /api/jobs - List jobs with queue statistics
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>> {
    let jobs = state
        .context()
        .db
        .list_jobs(query.state)?
        .iter()
        .map(JobStatusView::from)
        .collect();
    let stats = state.manager().stats()?;
    Ok(Json(JobListResponse { jobs, stats }))
}

/// GET /api/jobs/:id - Job status and progress
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>> {
    Ok(Json(state.manager().job_status(job_id)?))
}

/// POST /api/jobs/:id/pause
pub async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>> {
    Ok(Json(state.manager().request_pause(job_id)?))
}

/// POST /api/jobs/:id/resume
pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>> {
    Ok(Json(state.manager().resume(job_id).await?))
}

/// POST /api/jobs/:id/retry
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>> {
    Ok(Json(state.manager().retry(job_id).await?))
}

/// POST /api/jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>> {
    Ok(Json(state.manager().cancel(job_id).await?))
}

/// GET /api/jobs/:id/events - Progress events of one job as server-sent events.
///
/// The stream ends once the job completes or fails. Events missed by a slow
/// client are dropped; the job status endpoint stays authoritative.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    // Subscribe before reading the status so no transition falls in between
    let receiver = state.context().progress.subscribe();
    let status = state.manager().job_status(job_id)?;
    let finished = status.state.is_terminal();

    let events = stream::unfold((receiver, finished), move |(mut receiver, finished)| async move {
        if finished {
            return None;
        }
        loop {
            match receiver.recv().await {
                Ok(event) if event.job_id() == job_id => {
                    let done = matches!(&event, ProgressEvent::StateChanged { state: s, .. } if s.is_terminal());
                    match Event::default().json_data(&event) {
                        Ok(sse) => return Some((Ok::<_, Infallible>(sse), (receiver, done))),
                        Err(e) => tracing::warn!("Failed to encode event for job {}: {}", job_id, e),
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event stream for job {} skipped {} events", job_id, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let initial = Event::default()
        .event("status")
        .json_data(&status)
        .unwrap_or_default();
    let stream = futures::StreamExt::chain(stream::once(async move { Ok::<_, Infallible>(initial) }), events);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/stats - Job counts by state
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>> {
    Ok(Json(state.manager().stats()?))
}
