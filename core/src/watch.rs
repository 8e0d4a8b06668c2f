//! Job reconciliation loop
//!
//! Polls a [`StatusSource`] until a job reaches a terminal state. Transport
//! failures are tolerated up to [`WatchOptions::max_failures`] consecutive
//! attempts; any successful poll resets the count.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::executor::Executor;
use crate::{JobResult, JobState, JobStatus, Result};

/// Consecutive transport failures tolerated before giving up
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Anything that can report a job's current status
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// `Err` means the query itself failed, not that the job is gone
    async fn poll_status(&self, job_id: &str) -> Result<JobStatus>;
}

#[async_trait]
impl<E: Executor + ?Sized> StatusSource for E {
    async fn poll_status(&self, job_id: &str) -> Result<JobStatus> {
        self.get_status(job_id).await
    }
}

/// Polling configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    pub max_failures: u32,
}

impl WatchOptions {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

enum Poll {
    Done(JobResult),
    Waiting,
}

async fn poll_once<S>(source: &S, job_id: &str, failures: &mut u32, opts: &WatchOptions) -> Poll
where
    S: StatusSource + ?Sized,
{
    match source.poll_status(job_id).await {
        Ok(status) => {
            *failures = 0;
            if status.state.is_terminal() {
                info!(job_id, state = %status.state, "Job finished");
                Poll::Done(JobResult::from_state(job_id, status.state))
            } else {
                Poll::Waiting
            }
        }
        Err(e) if e.is_transport() => {
            *failures += 1;
            if *failures >= opts.max_failures {
                warn!(job_id, "Lost connection after {} attempts", opts.max_failures);
                return Poll::Done(JobResult::from_state(job_id, JobState::Unknown));
            }
            warn!(
                job_id,
                error = %e,
                "Connection failed (attempt {}/{}), retrying",
                failures,
                opts.max_failures
            );
            Poll::Waiting
        }
        Err(e) => {
            // Retrying cannot fix a rejected query
            warn!(job_id, error = %e, "Status query rejected");
            Poll::Done(JobResult::from_state(job_id, JobState::Unknown))
        }
    }
}

/// Block until `job_id` is terminal
pub async fn watch_job<S>(source: &S, job_id: &str, opts: &WatchOptions) -> JobResult
where
    S: StatusSource + ?Sized,
{
    let mut failures = 0;
    loop {
        match poll_once(source, job_id, &mut failures, opts).await {
            Poll::Done(result) => return result,
            Poll::Waiting => tokio::time::sleep(opts.poll_interval).await,
        }
    }
}

/// Block until every job is terminal
///
/// Each round polls every unfinished job once before sleeping. A job is
/// reported through `on_complete` in the round it finishes, and results are
/// returned in completion order.
pub async fn watch_jobs<S, F>(
    source: &S,
    job_ids: &[String],
    opts: &WatchOptions,
    mut on_complete: F,
) -> Vec<JobResult>
where
    S: StatusSource + ?Sized,
    F: FnMut(&JobResult) + Send,
{
    let mut pending: Vec<(String, u32)> = job_ids.iter().map(|id| (id.clone(), 0)).collect();
    let mut results = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let mut waiting = Vec::with_capacity(pending.len());
        for (job_id, mut failures) in pending {
            match poll_once(source, &job_id, &mut failures, opts).await {
                Poll::Done(result) => {
                    on_complete(&result);
                    results.push(result);
                }
                Poll::Waiting => waiting.push((job_id, failures)),
            }
        }

        pending = waiting;
        if !pending.is_empty() {
            tokio::time::sleep(opts.poll_interval).await;
        }
    }

    results
}
