//! Text parsers for remote introspection output
//!
//! Every backend decision that depends on remote text (process lists,
//! scheduler queue and accounting rows, submission replies, log footers)
//! goes through a pure function here so it can be tested without a host.

use crate::naming::JOB_PREFIX;
use crate::script::LOG_MARKER;
use crate::{Error, JobState, JobStatus, KillOutcome, Result};
use tracing::debug;

/// Scheduler states that mean "not started yet"
const QUEUED_STATES: &[&str] = &[
    "PENDING",
    "CONFIGURING",
    "REQUEUED",
    "REQUEUE_HOLD",
    "REQUEUE_FED",
    "RESV_DEL_HOLD",
];

/// Process ids, one per line; anything else is ignored
pub fn parse_pid_list(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Reply of the direct kill script (`killed`, `not_running`, `failed`)
pub fn parse_kill_reply(output: &str) -> KillOutcome {
    match output.lines().map(str::trim).rfind(|l| !l.is_empty()) {
        Some("killed") => KillOutcome::Killed,
        Some("not_running") => KillOutcome::NotRunning,
        _ => KillOutcome::Failed,
    }
}

/// Rows of the direct listing script
///
/// Format: `<job>\t<running|completed>\t<pid>\t<hostname>\t<description>`,
/// where pid, hostname and description may be empty.
pub fn parse_direct_listing(output: &str) -> Vec<JobStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(5, '\t');
            let job_id = fields.next()?.trim();
            if job_id.is_empty() {
                return None;
            }
            let state = match fields.next()?.trim() {
                "running" => JobState::Running,
                "completed" => JobState::Completed,
                _ => JobState::Unknown,
            };

            let mut status = JobStatus::new(job_id, state);
            status.pid = fields.next().and_then(|p| p.trim().parse().ok());
            status.hostname = fields.next().and_then(non_empty);
            status.description = fields.next().and_then(non_empty);
            Some(status)
        })
        .collect()
}

fn non_empty(field: &str) -> Option<String> {
    let field = field.trim();
    (!field.is_empty()).then(|| field.to_string())
}

/// Classify a live-queue state (`squeue -o %T`)
///
/// `None` means the job has left the queue. States without a dedicated
/// variant count as running and keep their lower-cased name as description.
pub fn parse_queue_state(output: &str) -> Option<(JobState, Option<String>)> {
    let raw = output.split_whitespace().next()?.to_uppercase();

    if QUEUED_STATES.contains(&raw.as_str()) {
        return Some((JobState::Pending, None));
    }
    if raw == "RUNNING" {
        return Some((JobState::Running, None));
    }
    // Recently finished jobs can still show up in the live queue
    if let Some(terminal) = terminal_state(&raw) {
        return Some(terminal);
    }
    Some((JobState::Running, Some(raw.to_lowercase())))
}

/// Rows of `squeue -h -o '%i|%j|%T|%N'`, keeping only this tool's jobs
///
/// Live rows are always pending or running.
pub fn parse_queue_rows(output: &str) -> Vec<JobStatus> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split('|').collect();
            if fields.len() < 3 {
                return None;
            }
            let job_id = fields[1].trim().strip_prefix(JOB_PREFIX)?;
            if job_id.is_empty() {
                return None;
            }

            let raw = fields[2].trim().to_uppercase();
            let state = if QUEUED_STATES.contains(&raw.as_str()) {
                JobState::Pending
            } else {
                JobState::Running
            };

            let mut status = JobStatus::new(job_id, state);
            status.scheduler_id = fields[0].trim().parse().ok();
            status.hostname = fields
                .get(3)
                .and_then(|n| non_empty(n))
                .filter(|n| n != "(null)");
            if !matches!(raw.as_str(), "PENDING" | "RUNNING") && !raw.is_empty() {
                status.description = Some(raw.to_lowercase());
            }
            Some(status)
        })
        .collect()
}

/// Final state from the most recent accounting row (`sacct --format=State`)
///
/// Only the first token counts, so `CANCELLED by 1234` is a cancellation.
/// An empty or unrecognised state is reported as completed with no detail.
pub fn parse_accounting_state(output: &str) -> (JobState, Option<String>) {
    let row = output.lines().map(str::trim).rfind(|l| !l.is_empty());
    let raw = row
        .and_then(|r| r.split_whitespace().next())
        .unwrap_or("")
        .trim_end_matches('+')
        .to_uppercase();

    match terminal_state(&raw) {
        Some(found) => found,
        None => {
            debug!(state = %raw, "Inconclusive accounting state, assuming completed");
            (JobState::Completed, None)
        }
    }
}

fn terminal_state(raw: &str) -> Option<(JobState, Option<String>)> {
    let mapped = match raw {
        "COMPLETED" => (JobState::Completed, None),
        "FAILED" => (JobState::Failed, None),
        "CANCELLED" => (JobState::Cancelled, None),
        "TIMEOUT" | "DEADLINE" => (JobState::TimedOut, None),
        "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" => {
            (JobState::Failed, Some(raw.to_lowercase()))
        }
        "PREEMPTED" => (JobState::Cancelled, Some("preempted".to_string())),
        _ => return None,
    };
    Some(mapped)
}

/// Scheduler id from `sbatch --parsable` (`<id>` or `<id>;<cluster>`)
pub fn parse_submission_id(output: &str) -> Result<u64> {
    let line = output.lines().map(str::trim).rfind(|l| !l.is_empty()).unwrap_or("");
    let id = line.split(';').next().unwrap_or("").trim();

    id.parse().map_err(|_| {
        Error::SchedulerError(format!(
            "Could not parse job ID from sbatch output: '{}'",
            output.trim()
        ))
    })
}

/// Exit code from the wrapper footer (`[rex] Exit code: N`)
///
/// Only the last non-empty line is considered; a log whose job is still
/// running or was killed before the footer yields `None`.
pub fn parse_footer_exit_code(output: &str) -> Option<i32> {
    let last = output.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    let prefix = format!("{LOG_MARKER} Exit code:");
    last.strip_prefix(&prefix)?.trim().parse().ok()
}

/// Job identifier from a log path (`.../rex-<job>.log`)
pub fn parse_log_job_id(path: &str) -> Option<String> {
    let name = path.trim().rsplit('/').next()?;
    let job = name.strip_prefix(JOB_PREFIX)?.strip_suffix(".log")?;
    (!job.is_empty()).then(|| job.to_string())
}
