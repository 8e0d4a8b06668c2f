//! Shared types

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::{Error, Result};

/// Default interpreter used to run scripts remotely
pub const DEFAULT_PYTHON: &str = "python3";

/// How a unit of work runs on the remote host
///
/// Absent fields inherit the remote defaults; they never unset anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Interpreter path for scripts
    pub python: String,
    /// Environment modules, loaded in order
    pub modules: Vec<String>,
    /// Code directory holding `.venv`
    pub code_dir: Option<String>,
    /// Working directory for execution
    pub run_dir: Option<String>,
    /// Extra environment variables; values may reference remote variables
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            python: DEFAULT_PYTHON.to_string(),
            modules: Vec::new(),
            code_dir: None,
            run_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl ExecutionContext {
    /// Same context, but running inside `dir`
    pub fn with_run_dir(&self, dir: Option<String>) -> Self {
        Self {
            run_dir: dir,
            ..self.clone()
        }
    }
}

/// Batch scheduler resource request
///
/// Every field is optional; omission lets the scheduler decide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    pub partition: Option<String>,
    /// Generic resources (e.g. `gpu:a100:2`)
    pub gres: Option<String>,
    /// Wall-clock limit
    pub time: Option<String>,
    pub cpus: Option<u32>,
    pub mem: Option<String>,
    pub constraint: Option<String>,
    /// Soft node constraint
    pub prefer: Option<String>,
}

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+|\d+:\d{1,2}|\d+:\d{1,2}:\d{1,2}|\d+-\d{1,2}(:\d{1,2}){0,2})$")
        .expect("time pattern is valid")
});

static MEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+[KMGTkmgt]?$").expect("mem pattern is valid")
});

static GRES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*(:[A-Za-z0-9_.-]+){0,2}$")
        .expect("gres pattern is valid")
});

impl SchedulerOptions {
    /// Scheduler flag name and value for every set option, in directive order
    pub fn directives(&self) -> Vec<(&'static str, String)> {
        let mut opts = Vec::new();
        let mut push = |key: &'static str, value: Option<String>| {
            if let Some(v) = value {
                opts.push((key, v));
            }
        };

        push("partition", self.partition.clone());
        push("gres", self.gres.clone());
        push("time", self.time.clone());
        push("cpus-per-task", self.cpus.map(|c| c.to_string()));
        push("mem", self.mem.clone());
        push("constraint", self.constraint.clone());
        push("prefer", self.prefer.clone());

        opts
    }

    /// Whether every field is unset
    pub fn is_empty(&self) -> bool {
        self.directives().is_empty()
    }

    /// Reject values the scheduler would not accept
    ///
    /// Directive values are written verbatim after `#SBATCH`, so whitespace
    /// and line breaks are rejected for every field.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in self.directives() {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(Error::ValidationError(format!(
                    "Invalid --{}: '{}' (must be non-empty without whitespace)",
                    key, value
                )));
            }
        }

        if let Some(time) = &self.time {
            if !TIME_RE.is_match(time) {
                return Err(Error::ValidationError(format!(
                    "Invalid time limit: '{}' (use MM, HH:MM:SS or D-HH:MM:SS)",
                    time
                )));
            }
        }

        if let Some(mem) = &self.mem {
            if !MEM_RE.is_match(mem) {
                return Err(Error::ValidationError(format!(
                    "Invalid memory: '{}' (use e.g. 4G, 16000M)",
                    mem
                )));
            }
        }

        if let Some(gres) = &self.gres {
            if !GRES_RE.is_match(gres) {
                return Err(Error::ValidationError(format!(
                    "Invalid gres: '{}' (use e.g. gpu:1 or gpu:a100:2)",
                    gres
                )));
            }
        }

        if self.cpus == Some(0) {
            return Err(Error::ValidationError(
                "Invalid cpus: must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Which execution backend owns a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Background process on the login node
    Direct,
    /// Submitted to the batch scheduler
    Batch,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Returned after launching a detached job
///
/// A `None` handle means submission was degraded by a transport failure;
/// the identifier can still be queried later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(rename = "job")]
    pub job_id: String,
    pub log_path: String,
    pub backend: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_id: Option<u64>,
}

impl JobInfo {
    /// Whether the backend-native handle was captured
    pub fn is_tracked(&self) -> bool {
        match self.backend {
            Backend::Direct => self.pid.is_some(),
            Backend::Batch => self.scheduler_id.is_some(),
        }
    }
}

/// Job status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    Unknown,
}

impl JobState {
    /// Convert status to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed-out",
            Self::Unknown => "unknown",
        }
    }

    /// Check if no further transition can occur
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Check if status indicates success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Process exit code for a terminal state
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time status of a job, recomputed on every query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(rename = "job")]
    pub job_id: String,
    #[serde(rename = "status")]
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl JobStatus {
    /// Status with only the identifier and state set
    pub fn new(job_id: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            pid: None,
            scheduler_id: None,
            description: None,
            hostname: None,
        }
    }
}

/// Terminal snapshot produced by the watch loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(rename = "job")]
    pub job_id: String,
    #[serde(rename = "status")]
    pub state: JobState,
    pub exit_code: i32,
}

impl JobResult {
    /// Result whose exit code is derived from the state
    pub fn from_state(job_id: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            exit_code: state.exit_code(),
        }
    }
}

/// Outcome of a kill request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillOutcome {
    /// Signal delivered (or cancellation accepted)
    Killed,
    NotRunning,
    Failed,
}
