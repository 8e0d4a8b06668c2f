//! Core library for rex
//!
//! This crate defines the execution backends, the remote-session seam,
//! the shell script builder and the job reconciliation loop used by the
//! `rex` command-line tool.

pub mod batch;
pub mod direct;
pub mod error;
pub mod executor;
pub mod naming;
pub mod parse;
pub mod remote;
pub mod script;
pub mod types;
pub mod watch;

// Re-exports
pub use batch::BatchExecutor;
pub use direct::DirectExecutor;
pub use error::{Error, Result};
pub use executor::{
    create_executor, find_log_path, most_recent_job, read_exit_code, show_log, Executor,
};
pub use naming::{generate_job_name, validate_job_name};
pub use remote::{CommandOutput, RemoteSession, SshSession, SshSettings, Tty};
pub use types::{
    Backend, ExecutionContext, JobInfo, JobResult, JobState, JobStatus, KillOutcome,
    SchedulerOptions, DEFAULT_PYTHON,
};
pub use watch::{watch_job, watch_jobs, StatusSource, WatchOptions};
