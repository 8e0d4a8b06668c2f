//! Remote naming conventions
//!
//! Every remote artifact of a job (script, wrapper, log, scheduler job name,
//! process command line) embeds the job identifier. Distinct identifiers
//! never collide, which is the only concurrency control the backends need.

use chrono::{Local, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::{Error, Result};

/// Prefix shared by every remote artifact
pub const JOB_PREFIX: &str = "rex-";

/// Directory for direct-backend scripts and logs
pub const DIRECT_DIR: &str = "/tmp";

/// Batch-backend directory, relative to the remote home
pub const BATCH_SUBDIR: &str = ".rex";

static JOB_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("job name pattern is valid"));

/// Scheduler job name (`rex-<job>`), used for submission and every lookup
pub fn job_name(job_id: &str) -> String {
    format!("{JOB_PREFIX}{job_id}")
}

/// Process-match pattern for a job's script
///
/// The dot is a one-character class so the search command's own command
/// line, which contains this pattern verbatim, never matches it.
pub fn job_pattern(job_id: &str) -> String {
    format!("{JOB_PREFIX}{job_id}[.]py")
}

/// Process-match pattern for a job's direct wrapper script
pub fn wrapper_pattern(job_id: &str) -> String {
    format!("{JOB_PREFIX}{job_id}[.]sh")
}

/// Remote files belonging to one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    /// Directory holding every file below
    pub dir: String,
    /// Copied payload script
    pub script: String,
    /// Generated wrapper (`.sh` for direct, `.sbatch` for batch)
    pub wrapper: String,
    pub log: String,
}

impl JobPaths {
    /// Paths under `/tmp` for the direct backend
    pub fn direct(job_id: &str) -> Self {
        Self::under(DIRECT_DIR, job_id, "sh")
    }

    /// Paths under `<home>/.rex` for the batch backend
    pub fn batch(remote_home: &str, job_id: &str) -> Self {
        let dir = format!("{}/{}", remote_home.trim_end_matches('/'), BATCH_SUBDIR);
        Self::under(&dir, job_id, "sbatch")
    }

    fn under(dir: &str, job_id: &str, wrapper_ext: &str) -> Self {
        let stem = format!("{dir}/{}", job_name(job_id));
        Self {
            dir: dir.to_string(),
            script: format!("{stem}.py"),
            wrapper: format!("{stem}.{wrapper_ext}"),
            log: format!("{stem}.log"),
        }
    }
}

/// Validate job name (alphanumeric, dash, underscore only)
pub fn validate_job_name(name: &str) -> Result<()> {
    if JOB_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::ValidationError(format!(
            "Invalid job name: '{}' (use only alphanumeric, dash, underscore)",
            name
        )))
    }
}

/// Generate timestamp-based job name
pub fn generate_job_name() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Generate unique id for ephemeral foreground files
pub fn generate_script_id() -> String {
    format!("{}-{}", std::process::id(), Utc::now().timestamp())
}

/// Use the caller's identifier after validating it, or generate one
pub fn resolve_job_id(requested: Option<&str>) -> Result<String> {
    match requested {
        Some(name) => {
            validate_job_name(name)?;
            Ok(name.to_string())
        }
        None => Ok(generate_job_name()),
    }
}
