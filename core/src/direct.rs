//! Direct backend: background processes on the login node
//!
//! Detached jobs run under `nohup` with their output redirected to
//! `/tmp/rex-<job>.log`. They are found again through `pgrep` with the
//! character-class patterns from [`crate::naming`], so the search never
//! matches its own command line.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::executor::Executor;
use crate::naming::{
    generate_script_id, job_pattern, resolve_job_id, validate_job_name, wrapper_pattern, JobPaths,
    DIRECT_DIR,
};
use crate::parse::{parse_direct_listing, parse_kill_reply, parse_pid_list};
use crate::remote::{RemoteSession, Tty};
use crate::script::{
    heredoc_write, python_command, quote, quote_path, summarize, validate_context, ScriptBuilder,
};
use crate::{
    Backend, Error, ExecutionContext, JobInfo, JobState, JobStatus, KillOutcome, Result,
};

/// Default poll interval when watching direct jobs
pub const DIRECT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const LIST_SCRIPT: &str = r#"host=$(hostname)
for log in /tmp/rex-*.log; do
    [ -f "$log" ] || continue
    job=$(basename "$log" .log)
    job=${job#rex-}
    pid=$({ pgrep -f "rex-${job}[.]py"; pgrep -f "rex-${job}[.]sh"; } 2>/dev/null | head -1)
    if [ -n "$pid" ]; then status=running; else status=completed; fi
    desc=""
    if [ -f "/tmp/rex-${job}.py" ]; then
        desc=$(grep -m1 '^#[^!]' "/tmp/rex-${job}.py" 2>/dev/null | sed 's/^#[[:space:]]*//' | cut -c1-40)
    fi
    if [ -z "$desc" ] && [ -f "/tmp/rex-${job}.sh" ]; then
        desc=$(sed -n '2s/^# //p' "/tmp/rex-${job}.sh" | cut -c1-40)
    fi
    printf '%s\t%s\t%s\t%s\t%s\n' "$job" "$status" "$pid" "$host" "$desc"
done"#;

/// Runs jobs as plain processes over a [`RemoteSession`]
pub struct DirectExecutor {
    session: Arc<dyn RemoteSession>,
}

impl DirectExecutor {
    pub fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self { session }
    }

    /// Wrapper that runs `payload` between the log header and footer
    fn detached_wrapper(ctx: &ExecutionContext, description: &str, payload: &str) -> String {
        ScriptBuilder::new()
            .shebang(true)
            .comment(&summarize(description, 60))
            .header(description)
            .apply_context(ctx, false)
            .run_command(payload)
            .footer()
            .build()
    }

    /// Launch a written wrapper under nohup and capture its pid
    async fn launch(&self, job_id: &str, paths: &JobPaths) -> JobInfo {
        let cmd = format!(
            "nohup bash -l {} > {} 2>&1 < /dev/null & pid=$!; disown $pid 2>/dev/null; sleep 0.5; echo $pid",
            quote_path(&paths.wrapper),
            quote_path(&paths.log)
        );

        let pid = match self.session.exec(&cmd).await {
            Ok(output) => {
                let pid = parse_pid_list(&output.stdout).first().copied();
                if pid.is_none() {
                    warn!(job_id, stdout = %output.text(), "Launch did not report a pid");
                }
                pid
            }
            Err(e) => {
                warn!(job_id, error = %e, "Failed to launch detached job");
                None
            }
        };

        if let Some(pid) = pid {
            info!(job_id, pid, log = %paths.log, "Detached job started");
        }
        JobInfo {
            job_id: job_id.to_string(),
            log_path: paths.log.clone(),
            backend: Backend::Direct,
            pid,
            scheduler_id: None,
        }
    }

    fn untracked(job_id: &str, paths: &JobPaths) -> JobInfo {
        JobInfo {
            job_id: job_id.to_string(),
            log_path: paths.log.clone(),
            backend: Backend::Direct,
            pid: None,
            scheduler_id: None,
        }
    }
}

#[async_trait]
impl Executor for DirectExecutor {
    fn backend(&self) -> Backend {
        Backend::Direct
    }

    fn default_poll_interval(&self) -> Duration {
        DIRECT_POLL_INTERVAL
    }

    fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }

    #[instrument(skip(self, ctx, args))]
    async fn run_foreground(
        &self,
        ctx: &ExecutionContext,
        script: &Path,
        args: &[String],
    ) -> Result<i32> {
        validate_context(ctx)?;
        let content = tokio::fs::read(script).await?;

        let remote_py = format!("{DIRECT_DIR}/rex-run-{}.py", generate_script_id());
        self.session.write_file(&remote_py, &content, false).await?;

        let wrapper = ScriptBuilder::new()
            .shebang(true)
            .apply_context(ctx, false)
            .run_python(&ctx.python, &remote_py, args)
            .run_command("_e=$?")
            .run_command(&format!("rm -f {}", quote_path(&remote_py)))
            .run_command("exit $_e")
            .build();

        let code = self
            .session
            .exec_script_streaming(&wrapper, true, Tty::Auto)
            .await?;
        debug!(exit_code = code, "Foreground script finished");
        Ok(code)
    }

    #[instrument(skip(self, ctx, args))]
    async fn run_detached(
        &self,
        ctx: &ExecutionContext,
        script: &Path,
        args: &[String],
        job_id: Option<&str>,
    ) -> Result<JobInfo> {
        let job_id = resolve_job_id(job_id)?;
        validate_context(ctx)?;
        let content = tokio::fs::read(script).await?;
        let paths = JobPaths::direct(&job_id);

        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| script.display().to_string());
        let wrapper = Self::detached_wrapper(
            ctx,
            &format!("Script: {name}"),
            &python_command(&ctx.python, &paths.script, args),
        );

        for (path, bytes) in [(&paths.script, content), (&paths.wrapper, wrapper.into_bytes())] {
            if let Err(e) = self.session.write_file(path, &bytes, false).await {
                warn!(job_id = %job_id, error = %e, "Failed to upload job files");
                return Ok(Self::untracked(&job_id, &paths));
            }
        }

        Ok(self.launch(&job_id, &paths).await)
    }

    #[instrument(skip(self, ctx, cmd))]
    async fn exec_foreground(&self, ctx: &ExecutionContext, cmd: &str) -> Result<i32> {
        validate_context(ctx)?;
        let remote_sh = format!("{DIRECT_DIR}/rex-exec-{}.sh", generate_script_id());

        let script = ScriptBuilder::new()
            .shebang(true)
            .apply_context(ctx, false)
            .run_command(cmd)
            .build();
        let write = heredoc_write(&remote_sh, &script, true)?;

        let output = self.session.exec(&write).await?;
        if !output.success() {
            return Err(Error::RemoteExecutionError(format!(
                "Failed to write command script: {}",
                output.stderr.trim()
            )));
        }

        let target = quote_path(&remote_sh);
        let code = self
            .session
            .exec_streaming(
                &format!("{target}; _e=$?; rm -f {target}; exit $_e"),
                Tty::Auto,
            )
            .await?;
        debug!(exit_code = code, "Foreground command finished");
        Ok(code)
    }

    #[instrument(skip(self, ctx, cmd))]
    async fn exec_detached(
        &self,
        ctx: &ExecutionContext,
        cmd: &str,
        job_id: Option<&str>,
    ) -> Result<JobInfo> {
        let job_id = resolve_job_id(job_id)?;
        validate_context(ctx)?;
        let paths = JobPaths::direct(&job_id);

        let wrapper = Self::detached_wrapper(ctx, &format!("Command: {cmd}"), cmd);
        let write = heredoc_write(&paths.wrapper, &wrapper, false)?;

        match self.session.exec(&write).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                warn!(job_id = %job_id, stderr = %output.stderr.trim(), "Failed to write command script");
                return Ok(Self::untracked(&job_id, &paths));
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to write command script");
                return Ok(Self::untracked(&job_id, &paths));
            }
        }

        Ok(self.launch(&job_id, &paths).await)
    }

    #[instrument(skip(self))]
    async fn list_jobs(&self) -> Result<Vec<JobStatus>> {
        let output = self
            .session
            .exec(&format!("bash -c {}", quote(LIST_SCRIPT)))
            .await?;
        if !output.success() {
            return Err(Error::RemoteExecutionError(format!(
                "Job listing failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(parse_direct_listing(&output.stdout))
    }

    async fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        validate_job_name(job_id)?;

        let cmd = format!(
            "{{ pgrep -f '{}'; pgrep -f '{}'; }} 2>/dev/null | head -1",
            job_pattern(job_id),
            wrapper_pattern(job_id)
        );
        let output = self.session.exec(&cmd).await?;
        if !output.success() {
            return Err(Error::RemoteExecutionError(format!(
                "Process lookup for {} exited with {}",
                job_id, output.exit_code
            )));
        }

        let pid = parse_pid_list(&output.stdout).first().copied();
        let state = if pid.is_some() {
            JobState::Running
        } else {
            JobState::Completed
        };
        let mut status = JobStatus::new(job_id, state);
        status.pid = pid;
        debug!(job_id, state = %status.state, ?pid, "Direct status");
        Ok(status)
    }

    #[instrument(skip(self))]
    async fn kill_job(&self, job_id: &str) -> Result<KillOutcome> {
        validate_job_name(job_id)?;

        // Signal the script itself so the wrapper still writes its footer;
        // command jobs only have the wrapper, so take its children with it.
        let cmd = format!(
            "pids=$(pgrep -f '{py}' 2>/dev/null); \
             if [ -z \"$pids\" ]; then pids=$(pgrep -f '{sh}' 2>/dev/null); \
             for p in $pids; do pkill -TERM -P \"$p\" 2>/dev/null; done; fi; \
             if [ -z \"$pids\" ]; then echo not_running; \
             elif kill $pids 2>/dev/null; then echo killed; else echo failed; fi",
            py = job_pattern(job_id),
            sh = wrapper_pattern(job_id)
        );
        let output = self.session.exec(&cmd).await?;
        let outcome = parse_kill_reply(&output.stdout);

        match outcome {
            KillOutcome::Killed => info!(job_id, "Killed job"),
            KillOutcome::NotRunning => warn!(job_id, "Job is not running"),
            KillOutcome::Failed => warn!(job_id, "Failed to kill job"),
        }
        Ok(outcome)
    }
}
