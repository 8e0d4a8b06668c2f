//! Execution backend abstraction
//!
//! [`Executor`] is the one contract both backends present to callers:
//! - run a script or a shell command, attached to the terminal or detached
//! - list, query, kill and watch detached jobs by identifier
//!
//! The log helpers at the bottom work for either backend, since both write
//! the same footer and place logs under one of two known directories.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::naming::{job_name, validate_job_name, BATCH_SUBDIR, DIRECT_DIR};
use crate::parse::{parse_footer_exit_code, parse_log_job_id};
use crate::remote::{RemoteSession, Tty};
use crate::script::quote_path;
use crate::watch::{self, WatchOptions};
use crate::{
    Backend, BatchExecutor, DirectExecutor, ExecutionContext, JobInfo, JobResult, JobStatus,
    KillOutcome, Result, SchedulerOptions,
};

/// Uniform job lifecycle over one backend
///
/// Detached entry points return `Err` only for configuration problems found
/// before any remote call; transport failures during submission yield a
/// [`JobInfo`] without a backend handle instead.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Which backend this is
    fn backend(&self) -> Backend;

    /// Poll interval used when a watch call does not give one
    fn default_poll_interval(&self) -> Duration;

    /// Session every remote call goes through
    fn session(&self) -> &dyn RemoteSession;

    /// Run a local script remotely, streaming output; returns its exit code
    async fn run_foreground(
        &self,
        ctx: &ExecutionContext,
        script: &Path,
        args: &[String],
    ) -> Result<i32>;

    /// Start a local script remotely in the background
    async fn run_detached(
        &self,
        ctx: &ExecutionContext,
        script: &Path,
        args: &[String],
        job_id: Option<&str>,
    ) -> Result<JobInfo>;

    /// Run a shell command remotely, streaming output; returns its exit code
    async fn exec_foreground(&self, ctx: &ExecutionContext, cmd: &str) -> Result<i32>;

    /// Start a shell command remotely in the background
    async fn exec_detached(
        &self,
        ctx: &ExecutionContext,
        cmd: &str,
        job_id: Option<&str>,
    ) -> Result<JobInfo>;

    /// Jobs this backend knows about
    async fn list_jobs(&self) -> Result<Vec<JobStatus>>;

    /// Current status; `Err` means the query failed, not the job
    async fn get_status(&self, job_id: &str) -> Result<JobStatus>;

    /// Remote log path, if the log exists
    async fn get_log_path(&self, job_id: &str) -> Result<Option<String>> {
        find_log_path(self.session(), job_id).await
    }

    /// Terminate a job
    async fn kill_job(&self, job_id: &str) -> Result<KillOutcome>;

    /// Block until the job is terminal
    async fn watch_job(&self, job_id: &str, poll_interval: Option<Duration>) -> JobResult {
        let opts = WatchOptions::new(poll_interval.unwrap_or_else(|| self.default_poll_interval()));
        watch::watch_job(self, job_id, &opts).await
    }

    /// Block until every job is terminal, reporting each as it finishes
    async fn watch_jobs(
        &self,
        job_ids: &[String],
        poll_interval: Option<Duration>,
        on_complete: &mut (dyn for<'r> FnMut(&'r JobResult) + Send),
    ) -> Vec<JobResult> {
        let opts = WatchOptions::new(poll_interval.unwrap_or_else(|| self.default_poll_interval()));
        watch::watch_jobs(self, job_ids, &opts, on_complete).await
    }
}

/// Construct the executor for a backend
///
/// Scheduler options only apply to the batch backend.
pub fn create_executor(
    backend: Backend,
    session: Arc<dyn RemoteSession>,
    options: SchedulerOptions,
) -> Box<dyn Executor> {
    match backend {
        Backend::Direct => Box::new(DirectExecutor::new(session)),
        Backend::Batch => Box::new(BatchExecutor::new(session, options)),
    }
}

/// Locate a job's log, checking the batch directory before the direct one
#[instrument(skip(session))]
pub async fn find_log_path(session: &dyn RemoteSession, job_id: &str) -> Result<Option<String>> {
    validate_job_name(job_id)?;

    let name = job_name(job_id);
    let cmd = format!(
        "for f in \"$HOME/{BATCH_SUBDIR}/{name}.log\" {DIRECT_DIR}/{name}.log; do \
         if [ -f \"$f\" ]; then echo \"$f\"; break; fi; done"
    );
    let output = session.exec(&cmd).await?;

    let path = output.text();
    debug!(path, "Log lookup finished");
    Ok((!path.is_empty()).then(|| path.to_string()))
}

/// Identifier of the job whose log was modified last
pub async fn most_recent_job(session: &dyn RemoteSession) -> Result<Option<String>> {
    let cmd = format!(
        "ls -t $HOME/{BATCH_SUBDIR}/rex-*.log {DIRECT_DIR}/rex-*.log 2>/dev/null | head -1"
    );
    let output = session.exec(&cmd).await?;
    Ok(parse_log_job_id(output.text()))
}

/// Stream a log to the local terminal; `follow` keeps reading new lines
pub async fn show_log(session: &dyn RemoteSession, path: &str, follow: bool) -> Result<i32> {
    let cmd = if follow {
        format!("tail -f {}", quote_path(path))
    } else {
        format!("cat {}", quote_path(path))
    };
    let tty = if follow { Tty::Auto } else { Tty::Never };
    session.exec_streaming(&cmd, tty).await
}

/// Exit code recorded by the wrapper footer, if the job got that far
pub async fn read_exit_code(session: &dyn RemoteSession, path: &str) -> Result<Option<i32>> {
    let output = session
        .exec(&format!("tail -n 1 {} 2>/dev/null", quote_path(path)))
        .await?;
    Ok(parse_footer_exit_code(&output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{MockReply, MockSession};
    use crate::Error;

    #[tokio::test]
    async fn test_find_log_path_prefers_existing_file() {
        let session = MockSession::new().on_stdout("for f in", "/home/a/.rex/rex-exp1.log\n");

        let path = find_log_path(&session, "exp1").await.expect("lookup");
        assert_eq!(path.as_deref(), Some("/home/a/.rex/rex-exp1.log"));

        let cmd = &session.commands()[0];
        let batch = cmd.find("$HOME/.rex/rex-exp1.log").expect("batch path");
        let direct = cmd.find("/tmp/rex-exp1.log").expect("direct path");
        assert!(batch < direct);
    }

    #[tokio::test]
    async fn test_find_log_path_missing() {
        let session = MockSession::new();
        assert_eq!(find_log_path(&session, "exp1").await.ok(), Some(None));
    }

    #[tokio::test]
    async fn test_find_log_path_rejects_bad_name_before_remote_call() {
        let session = MockSession::new();
        let result = find_log_path(&session, "x; rm -rf ~").await;

        assert!(matches!(result, Err(Error::ValidationError(_))));
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_most_recent_job() {
        let session = MockSession::new().on_stdout("ls -t", "/tmp/rex-20240101-120000.log\n");
        let job = most_recent_job(&session).await.expect("lookup");
        assert_eq!(job.as_deref(), Some("20240101-120000"));

        let empty = MockSession::new();
        assert_eq!(most_recent_job(&empty).await.ok(), Some(None));
    }

    #[tokio::test]
    async fn test_read_exit_code() {
        let session = MockSession::new().on_stdout("tail -n 1", "[rex] Exit code: 2\n");
        let code = read_exit_code(&session, "/tmp/rex-a.log").await.expect("read");
        assert_eq!(code, Some(2));
    }

    #[tokio::test]
    async fn test_show_log_follow_uses_tail() {
        let session = MockSession::new().stream_exit(130);
        let code = show_log(&session, "$HOME/.rex/rex-a.log", true).await.expect("stream");

        assert_eq!(code, 130);
        assert_eq!(session.streamed(), vec!["[Auto] tail -f \"$HOME/.rex/rex-a.log\""]);
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let session = MockSession::new().on("ls -t", vec![MockReply::TransportFailure]);
        assert!(matches!(most_recent_job(&session).await, Err(Error::SshError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_watch_jobs_reports_in_completion_order() {
        let session = MockSession::new()
            .on(
                "rex-slow[.]py",
                vec![
                    MockReply::stdout("11\n"),
                    MockReply::stdout("11\n"),
                    MockReply::stdout(""),
                ],
            )
            .on("rex-fast[.]py", vec![MockReply::stdout("")]);
        let session: Arc<dyn RemoteSession> = Arc::new(session);
        let executor = create_executor(Backend::Direct, session, SchedulerOptions::default());

        let start = tokio::time::Instant::now();
        let mut reported = Vec::new();
        let mut on_complete = |r: &JobResult| reported.push((r.job_id.clone(), start.elapsed()));
        let ids = vec!["slow".to_string(), "fast".to_string()];
        let results = executor.watch_jobs(&ids, None, &mut on_complete).await;

        assert_eq!(
            reported,
            vec![
                ("fast".to_string(), Duration::ZERO),
                ("slow".to_string(), Duration::from_secs(10)),
            ]
        );
        assert!(results.iter().all(|r| r.exit_code == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_job_honours_interval_override() {
        let session = MockSession::new().on(
            "rex-exp[.]py",
            vec![MockReply::stdout("3\n"), MockReply::stdout("")],
        );
        let executor = DirectExecutor::new(Arc::new(session));

        let start = tokio::time::Instant::now();
        let result = executor
            .watch_job("exp", Some(Duration::from_secs(2)))
            .await;

        assert_eq!(result, JobResult::from_state("exp", crate::JobState::Completed));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_create_executor_selects_backend() {
        let session: Arc<dyn RemoteSession> = Arc::new(MockSession::new());

        let direct = create_executor(Backend::Direct, session.clone(), SchedulerOptions::default());
        assert_eq!(direct.backend(), Backend::Direct);
        assert_eq!(direct.default_poll_interval(), Duration::from_secs(5));

        let batch = create_executor(Backend::Batch, session, SchedulerOptions::default());
        assert_eq!(batch.backend(), Backend::Batch);
        assert_eq!(batch.default_poll_interval(), Duration::from_secs(10));
    }
}
