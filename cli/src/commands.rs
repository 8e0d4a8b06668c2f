//! Command handlers built directly on the core seams
//!
//! Each handler takes an [`Executor`] or a [`RemoteSession`] so it runs the
//! same against a real host or a scripted session.

use anyhow::{anyhow, bail};
use rex_core::script::quote_path;
use rex_core::{
    generate_job_name, read_exit_code, Backend, ExecutionContext, Executor, JobInfo, JobResult,
    JobState, JobStatus, RemoteSession, Tty,
};
use tracing::{debug, info, warn};

use crate::output;

/// Status of one job plus the exit code from its log footer, when known
///
/// The footer is only consulted for finished direct jobs; the scheduler
/// reports batch outcomes itself.
pub async fn job_status(
    executor: &dyn Executor,
    job_id: &str,
) -> anyhow::Result<(JobStatus, Option<i32>)> {
    let status = executor.get_status(job_id).await?;
    if executor.backend() != Backend::Direct || status.state != JobState::Completed {
        return Ok((status, None));
    }

    let exit_code = match executor.get_log_path(job_id).await? {
        Some(path) => read_exit_code(executor.session(), &path).await?,
        None => None,
    };
    debug!(job_id = %job_id, ?exit_code, "Footer exit code");
    Ok((status, exit_code))
}

/// Watch jobs to completion, emitting one rendered line per finished job
///
/// Returns the aggregated exit code.
pub async fn watch<F>(
    executor: &dyn Executor,
    job_ids: &[String],
    json: bool,
    mut emit: F,
) -> i32
where
    F: FnMut(String) + Send,
{
    info!(jobs = job_ids.len(), "Watching jobs");

    let mut report = |result: &JobResult| match output::render_result(result, json) {
        Ok(line) => emit(line),
        Err(e) => warn!(job_id = %result.job_id, error = %e, "Failed to render result"),
    };
    let results = executor.watch_jobs(job_ids, None, &mut report).await;

    output::aggregate_exit_code(&results)
}

/// Shell text that creates or refreshes `.venv` in the current directory
///
/// The steps run in a `set -e` subshell so a failing step still reaches
/// the wrapper footer.
pub fn build_script(python: &str, clean: bool) -> String {
    let mut lines = vec![
        "echo \"=== Rex Build ===\"".to_string(),
        "(".to_string(),
        "set -e".to_string(),
    ];
    if clean {
        lines.push("rm -rf .venv".to_string());
    }
    lines.extend([
        "if [ ! -d .venv ]; then".to_string(),
        "    echo \"=== Creating venv ===\"".to_string(),
        format!("    {} -m venv .venv", quote_path(python)),
        "fi".to_string(),
        "echo \"=== Installing package ===\"".to_string(),
        ".venv/bin/pip install --upgrade pip".to_string(),
        ".venv/bin/pip install --only-binary :all: -e .".to_string(),
        "echo \"=== Build complete ===\"".to_string(),
        ")".to_string(),
    ]);
    lines.join("\n")
}

/// Build the code directory's virtualenv as a detached `build-<ts>` job
pub async fn build(
    executor: &dyn Executor,
    ctx: &ExecutionContext,
    clean: bool,
) -> anyhow::Result<JobInfo> {
    let Some(code_dir) = ctx.code_dir.clone() else {
        bail!("code_dir not configured for this host");
    };
    info!(code_dir = %code_dir, clean, "Building virtualenv");

    // Run inside the code directory without activating the venv being built
    let mut build_ctx = ctx.with_run_dir(Some(code_dir));
    build_ctx.code_dir = None;

    let job_id = format!("build-{}", generate_job_name());
    let script = build_script(&ctx.python, clean);
    Ok(executor
        .exec_detached(&build_ctx, &script, Some(&job_id))
        .await?)
}

/// Print a remote file, or list a remote directory
pub async fn read_remote(session: &dyn RemoteSession, path: &str) -> anyhow::Result<i32> {
    let target = quote_path(path);
    let kind = session
        .exec(&format!(
            "if [ -d {target} ]; then echo dir; elif [ -e {target} ]; then echo file; fi"
        ))
        .await?;

    let cmd = match kind.text() {
        "dir" => format!("ls -la {target}"),
        "file" => format!("cat {target}"),
        _ => return Err(anyhow!("Path not found: {}", path)),
    };
    Ok(session.exec_streaming(&cmd, Tty::Never).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rex_core::remote::mock::{MockReply, MockSession};
    use rex_core::{create_executor, DirectExecutor, SchedulerOptions};
    use std::sync::Arc;
    use std::time::Duration;

    fn direct(session: MockSession) -> (DirectExecutor, Arc<MockSession>) {
        let session = Arc::new(session);
        (DirectExecutor::new(session.clone()), session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_emits_each_result_and_aggregates() {
        let session = MockSession::new()
            .on("rex-ok[.]py", vec![MockReply::stdout("")])
            .on(
                "rex-slow[.]py",
                vec![MockReply::stdout("8\n"), MockReply::stdout("")],
            );
        let executor = create_executor(
            Backend::Direct,
            Arc::new(session),
            SchedulerOptions::default(),
        );

        let start = tokio::time::Instant::now();
        let mut lines = Vec::new();
        let ids = vec!["slow".to_string(), "ok".to_string()];
        let code = watch(executor.as_ref(), &ids, false, |line| lines.push(line)).await;

        assert_eq!(code, 0);
        assert_eq!(lines, vec!["Job ok completed", "Job slow completed"]);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_lost_connection_fails() {
        let session = MockSession::new().on("rex-gone[.]py", vec![MockReply::TransportFailure]);
        let (executor, _) = direct(session);

        let mut lines = Vec::new();
        let code = watch(&executor, &["gone".to_string()], true, |line| lines.push(line)).await;

        assert_eq!(code, 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).expect("json");
        assert_eq!(value["status"], "unknown");
    }

    #[tokio::test]
    async fn test_status_reads_footer_for_finished_direct_job() {
        let (executor, _) = direct(
            MockSession::new()
                .on_stdout("pgrep", "")
                .on_stdout("for f in", "/tmp/rex-exp.log\n")
                .on_stdout("tail -n 1", "[rex] Exit code: 3\n"),
        );

        let (status, exit_code) = job_status(&executor, "exp").await.expect("status");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_status_of_running_job_skips_footer() {
        let (executor, session) = direct(MockSession::new().on_stdout("pgrep", "12\n"));

        let (status, exit_code) = job_status(&executor, "exp").await.expect("status");
        assert_eq!(status.state, JobState::Running);
        assert_eq!(exit_code, None);
        assert_eq!(session.count("tail"), 0);
    }

    #[test]
    fn test_build_script_steps() {
        let script = build_script("python3.11", true);
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "echo \"=== Rex Build ===\"");
        assert_eq!(lines[1], "(");
        assert_eq!(lines[2], "set -e");
        assert!(lines.contains(&"rm -rf .venv"));
        assert!(lines.contains(&"    python3.11 -m venv .venv"));
        assert_eq!(lines.last(), Some(&")"));

        assert!(!build_script("python3", false).contains("rm -rf"));
    }

    #[tokio::test]
    async fn test_build_runs_detached_in_code_dir() {
        let (executor, session) = direct(MockSession::new().on_stdout("nohup", "31\n"));
        let ctx = ExecutionContext {
            code_dir: Some("~/src/proj".to_string()),
            modules: vec!["python/3.11".to_string()],
            ..Default::default()
        };

        let info = build(&executor, &ctx, false).await.expect("build");
        assert!(info.job_id.starts_with("build-"));
        assert_eq!(info.pid, Some(31));

        let wrapper = &session.commands()[0];
        assert!(wrapper.contains("module load python/3.11\n"));
        assert!(wrapper.contains("echo '[rex] Command: echo \"=== Rex Build ===\"'"));
        assert!(wrapper.contains("cd \"$HOME/src/proj\"\n"));
        assert!(!wrapper.contains(".venv/bin/activate"));
        assert!(wrapper.contains(".venv/bin/pip install --only-binary :all: -e .\n"));
    }

    #[tokio::test]
    async fn test_build_requires_code_dir() {
        let (executor, session) = direct(MockSession::new());
        let result = build(&executor, &ExecutionContext::default(), true).await;

        assert!(result.is_err());
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_read_lists_directory() {
        let session = MockSession::new().on_stdout("if [ -d", "dir\n");
        let code = read_remote(&session, "~/data").await.expect("read");

        assert_eq!(code, 0);
        assert_eq!(session.streamed(), vec!["[Never] ls -la \"$HOME/data\""]);
    }

    #[tokio::test]
    async fn test_read_prints_file() {
        let session = MockSession::new().on_stdout("if [ -d", "file\n");
        read_remote(&session, "/etc/hosts").await.expect("read");
        assert_eq!(session.streamed(), vec!["[Never] cat /etc/hosts"]);
    }

    #[tokio::test]
    async fn test_read_missing_path() {
        let session = MockSession::new();
        assert!(read_remote(&session, "/nope").await.is_err());
        assert!(session.streamed().is_empty());
    }
}
