//! Text and JSON rendering of job records
//!
//! Everything here returns a string; `main` decides where it goes. JSON
//! output is one document per command so it can be piped into `jq`.

use rex_core::{JobInfo, JobResult, JobState, JobStatus};
use serde::Serialize;

fn to_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> anyhow::Result<String> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(text)
}

/// One line per job, or a JSON array
pub fn render_jobs(jobs: &[JobStatus], json: bool) -> anyhow::Result<String> {
    if json {
        return to_json(jobs, true);
    }

    let lines: Vec<String> = jobs.iter().map(job_line).collect();
    Ok(lines.join("\n"))
}

fn job_line(job: &JobStatus) -> String {
    let host = job.hostname.as_deref().unwrap_or("");
    let desc = job.description.as_deref().unwrap_or("");

    let line = if let Some(pid) = job.pid {
        format!("{:<20} {} (PID {})  {}  {}", job.job_id, job.state, pid, host, desc)
    } else if let Some(id) = job.scheduler_id {
        format!("{:<20} {} (SLURM {})  {}  {}", job.job_id, job.state, id, host, desc)
    } else {
        format!("{:<20} {:<10} {}  {}", job.job_id, job.state.as_str(), host, desc)
    };
    line.trim_end().to_string()
}

#[derive(Serialize)]
struct StatusReport<'a> {
    #[serde(flatten)]
    status: &'a JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

/// Current state of one job, with the logged exit code when known
pub fn render_status(
    status: &JobStatus,
    exit_code: Option<i32>,
    json: bool,
) -> anyhow::Result<String> {
    if json {
        return to_json(&StatusReport { status, exit_code }, false);
    }

    let detail = match (&status.description, exit_code) {
        (Some(desc), _) => format!(" ({})", desc),
        (None, Some(code)) => format!(" (exit {})", code),
        (None, None) => String::new(),
    };
    Ok(format!("{}{}", status.state, detail))
}

/// Confirmation for a detached launch
pub fn render_started(info: &JobInfo, json: bool) -> anyhow::Result<String> {
    if json {
        return to_json(info, false);
    }

    let handle = match (info.pid, info.scheduler_id) {
        (Some(pid), _) => format!(" (PID {})", pid),
        (None, Some(id)) => format!(" (SLURM {})", id),
        (None, None) => " (not confirmed)".to_string(),
    };
    Ok(format!(
        "Detached: {}{}\nLog: {}",
        info.job_id, handle, info.log_path
    ))
}

/// One finished job from a watch
pub fn render_result(result: &JobResult, json: bool) -> anyhow::Result<String> {
    if json {
        return to_json(result, false);
    }

    Ok(match result.state {
        JobState::Completed => format!("Job {} completed", result.job_id),
        JobState::Unknown => format!("Job {}: status unknown (lost connection?)", result.job_id),
        state => format!("Job {} {}", result.job_id, state),
    })
}

/// Process exit code for a set of watched jobs
///
/// Zero only when every job completed.
pub fn aggregate_exit_code(results: &[JobResult]) -> i32 {
    results
        .iter()
        .map(|r| r.exit_code)
        .find(|code| *code != 0)
        .unwrap_or(0)
}
