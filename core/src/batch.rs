//! Batch backend: jobs submitted to a SLURM scheduler
//!
//! Job state lives entirely in the scheduler. Live jobs are read from
//! `squeue`; jobs that have left the queue are classified from the most
//! recent `sacct` row. Every lookup goes by job name (`rex-<job>`), never by
//! numeric id.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::executor::Executor;
use crate::naming::{
    generate_script_id, job_name, resolve_job_id, validate_job_name, JobPaths, BATCH_SUBDIR,
};
use crate::parse::{
    parse_accounting_state, parse_kill_reply, parse_queue_rows, parse_queue_state,
    parse_submission_id,
};
use crate::remote::{RemoteSession, Tty};
use crate::script::{
    check_heredoc_payload, heredoc_write, python_command, quote, quote_path, validate_context,
    ScriptBuilder, LOG_MARKER,
};
use crate::{
    Backend, Error, ExecutionContext, JobInfo, JobStatus, KillOutcome, Result, SchedulerOptions,
};

/// Default poll interval when watching batch jobs
pub const BATCH_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Submits jobs with `sbatch`, runs foreground work with `srun`
pub struct BatchExecutor {
    session: Arc<dyn RemoteSession>,
    options: SchedulerOptions,
}

impl BatchExecutor {
    pub fn new(session: Arc<dyn RemoteSession>, options: SchedulerOptions) -> Self {
        Self { session, options }
    }

    /// `srun` flags for the configured options, with a leading space
    fn srun_flags(&self) -> String {
        let flags: String = self
            .options
            .directives()
            .into_iter()
            .map(|(key, value)| format!(" --{key}={}", quote(&value)))
            .collect();
        if !flags.is_empty() {
            debug!(flags = %flags.trim(), "srun options");
        }
        flags
    }

    /// Directory for ephemeral foreground files
    fn scratch_dir(ctx: &ExecutionContext) -> String {
        ctx.run_dir
            .clone()
            .unwrap_or_else(|| format!("$HOME/{BATCH_SUBDIR}"))
    }

    async fn remote_home(&self) -> Result<String> {
        let output = self.session.exec("echo $HOME").await?;
        let home = output.text();
        if home.is_empty() {
            return Err(Error::RemoteExecutionError(
                "Failed to get remote home directory".to_string(),
            ));
        }
        Ok(home.to_string())
    }

    /// Batch script: directives, header, context, payload, footer
    fn sbatch_script(
        &self,
        ctx: &ExecutionContext,
        job_id: &str,
        paths: &JobPaths,
        description: &str,
        payload: &str,
    ) -> String {
        ScriptBuilder::new()
            .shebang(true)
            .job_name(&job_name(job_id))
            .output(&paths.log)
            .open_mode("append")
            .scheduler_options(&self.options)
            .header(description)
            .apply_context(ctx, true)
            .blank_line()
            .run_command(payload)
            .footer()
            .build()
    }

    /// Submit a written batch script and seed its log
    async fn submit(&self, job_id: &str, paths: &JobPaths) -> JobInfo {
        let mut info = JobInfo {
            job_id: job_id.to_string(),
            log_path: paths.log.clone(),
            backend: Backend::Batch,
            pid: None,
            scheduler_id: None,
        };

        let output = match self
            .session
            .exec(&format!("sbatch --parsable {}", quote_path(&paths.wrapper)))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(job_id, error = %e, "sbatch failed");
                return info;
            }
        };
        if !output.success() {
            let reason = [output.stderr.trim(), output.text()]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or("unknown error")
                .to_string();
            warn!(job_id, "sbatch failed: {}", reason);
            return info;
        }

        let scheduler_id = match parse_submission_id(&output.stdout) {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id, error = %e, "sbatch returned unexpected output");
                return info;
            }
        };
        info.scheduler_id = Some(scheduler_id);

        // The job appends to this once it starts
        let log = quote_path(&paths.log);
        let seed = format!(
            "echo \"{LOG_MARKER} Submitted: $(date)\" > {log} && \
             echo \"{LOG_MARKER} SLURM ID: {scheduler_id}\" >> {log} && \
             echo \"{LOG_MARKER} Status: pending\" >> {log} && \
             echo \"---\" >> {log}"
        );
        if let Err(e) = self.session.exec(&seed).await {
            warn!(job_id, error = %e, "Failed to write submission header");
        }

        info!(job_id, scheduler_id, log = %paths.log, "Submitted batch job");
        info
    }

    /// Resolve paths and create the job directory
    async fn prepare(&self, job_id: &str) -> std::result::Result<JobPaths, JobInfo> {
        let degraded = |log_path: String| JobInfo {
            job_id: job_id.to_string(),
            log_path,
            backend: Backend::Batch,
            pid: None,
            scheduler_id: None,
        };

        let home = match self.remote_home().await {
            Ok(home) => home,
            Err(e) => {
                warn!(job_id, error = %e, "Failed to get remote home directory");
                return Err(degraded(String::new()));
            }
        };
        let paths = JobPaths::batch(&home, job_id);

        match self
            .session
            .exec(&format!("mkdir -p {}", quote_path(&paths.dir)))
            .await
        {
            Ok(output) if output.success() => Ok(paths),
            Ok(output) => {
                warn!(job_id, stderr = %output.stderr.trim(), "Failed to create job directory");
                Err(degraded(paths.log))
            }
            Err(e) => {
                warn!(job_id, error = %e, "Failed to create job directory");
                Err(degraded(paths.log))
            }
        }
    }

    async fn stream_srun(&self, wrapper: &str, cleanup: &[&str]) -> Result<i32> {
        let files: Vec<String> = cleanup.iter().map(|f| quote_path(f)).collect();
        let cmd = format!(
            "srun{} {}; _e=$?; rm -f {}; exit $_e",
            self.srun_flags(),
            quote_path(wrapper),
            files.join(" ")
        );
        // A terminal is required for Ctrl-C to reach the remote job
        self.session.exec_streaming(&cmd, Tty::Force).await
    }
}

#[async_trait]
impl Executor for BatchExecutor {
    fn backend(&self) -> Backend {
        Backend::Batch
    }

    fn default_poll_interval(&self) -> Duration {
        BATCH_POLL_INTERVAL
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
        self.options.validate()?;
        let content = tokio::fs::read(script).await?;

        let dir = Self::scratch_dir(ctx);
        let id = generate_script_id();
        let remote_py = format!("{dir}/rex-run-{id}.py");
        let remote_sh = format!("{dir}/rex-run-{id}.sh");

        self.session
            .exec(&format!("mkdir -p {}", quote_path(&dir)))
            .await?;
        self.session.write_file(&remote_py, &content, false).await?;

        let wrapper = ScriptBuilder::new()
            .shebang(true)
            .apply_context(ctx, false)
            .run_python(&ctx.python, &remote_py, args)
            .build();
        self.session
            .write_file(&remote_sh, wrapper.as_bytes(), true)
            .await?;

        self.stream_srun(&remote_sh, &[remote_py.as_str(), remote_sh.as_str()])
            .await
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
        self.options.validate()?;
        let content = tokio::fs::read(script).await?;

        let paths = match self.prepare(&job_id).await {
            Ok(paths) => paths,
            Err(degraded) => return Ok(degraded),
        };

        let sbatch = self.sbatch_script(
            ctx,
            &job_id,
            &paths,
            &format!("Script: {}", paths.script),
            &python_command(&ctx.python, &paths.script, args),
        );

        for (path, bytes) in [(&paths.script, content), (&paths.wrapper, sbatch.into_bytes())] {
            if let Err(e) = self.session.write_file(path, &bytes, false).await {
                warn!(job_id = %job_id, error = %e, "Failed to upload job files");
                return Ok(JobInfo {
                    job_id: job_id.clone(),
                    log_path: paths.log.clone(),
                    backend: Backend::Batch,
                    pid: None,
                    scheduler_id: None,
                });
            }
        }

        Ok(self.submit(&job_id, &paths).await)
    }

    #[instrument(skip(self, ctx, cmd))]
    async fn exec_foreground(&self, ctx: &ExecutionContext, cmd: &str) -> Result<i32> {
        check_heredoc_payload(cmd)?;
        validate_context(ctx)?;
        self.options.validate()?;

        let dir = Self::scratch_dir(ctx);
        let id = generate_script_id();
        let remote_sh = format!("{dir}/rex-exec-{id}.sh");
        let remote_cmd = format!("{dir}/rex-exec-{id}.cmd");

        self.session
            .exec(&format!("mkdir -p {}", quote_path(&dir)))
            .await?;

        let output = self
            .session
            .exec(&heredoc_write(&remote_cmd, cmd, false)?)
            .await?;
        if !output.success() {
            return Err(Error::RemoteExecutionError(format!(
                "Failed to write command: {}",
                output.stderr.trim()
            )));
        }

        let wrapper = ScriptBuilder::new()
            .shebang(true)
            .apply_context(ctx, false)
            .run_command(&format!("source {}", quote_path(&remote_cmd)))
            .build();
        self.session
            .write_file(&remote_sh, wrapper.as_bytes(), true)
            .await?;

        self.stream_srun(&remote_sh, &[remote_sh.as_str(), remote_cmd.as_str()])
            .await
    }

    #[instrument(skip(self, ctx, cmd))]
    async fn exec_detached(
        &self,
        ctx: &ExecutionContext,
        cmd: &str,
        job_id: Option<&str>,
    ) -> Result<JobInfo> {
        let job_id = resolve_job_id(job_id)?;
        check_heredoc_payload(cmd)?;
        validate_context(ctx)?;
        self.options.validate()?;

        let paths = match self.prepare(&job_id).await {
            Ok(paths) => paths,
            Err(degraded) => return Ok(degraded),
        };

        let sbatch = self.sbatch_script(ctx, &job_id, &paths, &format!("Command: {cmd}"), cmd);
        let written = self
            .session
            .exec(&heredoc_write(&paths.wrapper, &sbatch, false)?)
            .await;
        match written {
            Ok(output) if output.success() => Ok(self.submit(&job_id, &paths).await),
            Ok(output) => {
                warn!(job_id = %job_id, stderr = %output.stderr.trim(), "Failed to write batch script");
                Ok(JobInfo {
                    job_id,
                    log_path: paths.log,
                    backend: Backend::Batch,
                    pid: None,
                    scheduler_id: None,
                })
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to write batch script");
                Ok(JobInfo {
                    job_id,
                    log_path: paths.log,
                    backend: Backend::Batch,
                    pid: None,
                    scheduler_id: None,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_jobs(&self) -> Result<Vec<JobStatus>> {
        let output = self
            .session
            .exec("squeue -u $USER -h -o '%i|%j|%T|%N' 2>/dev/null")
            .await?;
        if !output.success() {
            return Err(Error::RemoteExecutionError(format!(
                "squeue exited with {}",
                output.exit_code
            )));
        }
        Ok(parse_queue_rows(&output.stdout))
    }

    async fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        validate_job_name(job_id)?;
        let name = job_name(job_id);

        let queue = self
            .session
            .exec(&format!("squeue -u $USER -n {name} -h -o %T 2>/dev/null"))
            .await?;
        if !queue.success() {
            return Err(Error::RemoteExecutionError(format!(
                "squeue exited with {}",
                queue.exit_code
            )));
        }

        let (state, description) = match parse_queue_state(&queue.stdout) {
            Some(live) => live,
            None => {
                // Left the queue; the latest accounting row has the outcome
                let history = self
                    .session
                    .exec(&format!(
                        "sacct -n -X --name={name} --format=State 2>/dev/null | tail -n 1"
                    ))
                    .await?;
                parse_accounting_state(&history.stdout)
            }
        };

        debug!(job_id, state = %state, "Batch status");
        let mut status = JobStatus::new(job_id, state);
        status.description = description;
        Ok(status)
    }

    #[instrument(skip(self))]
    async fn kill_job(&self, job_id: &str) -> Result<KillOutcome> {
        validate_job_name(job_id)?;
        let name = job_name(job_id);

        let cmd = format!(
            "if [ -z \"$(squeue -u $USER -n {name} -h -o %i 2>/dev/null)\" ]; then echo not_running; \
             elif scancel -n {name}; then echo killed; else echo failed; fi"
        );
        let output = self.session.exec(&cmd).await?;
        let outcome = parse_kill_reply(&output.stdout);

        match outcome {
            KillOutcome::Killed => info!(job_id, "Cancelled job"),
            KillOutcome::NotRunning => warn!(job_id, "Job is not in the queue"),
            KillOutcome::Failed => warn!(job_id, "Failed to cancel job"),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{MockReply, MockSession};
    use crate::JobState;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn gpu_options() -> SchedulerOptions {
        SchedulerOptions {
            partition: Some("gpu".into()),
            gres: Some("gpu:1".into()),
            ..Default::default()
        }
    }

    fn executor(session: MockSession, options: SchedulerOptions) -> (BatchExecutor, Arc<MockSession>) {
        let session = Arc::new(session);
        (BatchExecutor::new(session.clone(), options), session)
    }

    fn cluster() -> MockSession {
        MockSession::new()
            .on_stdout("echo $HOME", "/home/alice\n")
            .on_stdout("sbatch --parsable", "5551\n")
    }

    fn local_script(body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix("train")
            .suffix(".py")
            .tempfile()
            .expect("create temp script");
        file.write_all(body.as_bytes()).expect("write temp script");
        file
    }

    #[tokio::test]
    async fn test_run_detached_writes_sbatch_with_directives() {
        let script = local_script("print('hi')\n");
        let ctx = ExecutionContext {
            modules: vec!["cuda/12.1".into()],
            run_dir: Some("$HOME/runs".into()),
            ..Default::default()
        };
        let (exec, session) = executor(cluster(), gpu_options());

        let info = exec
            .run_detached(&ctx, script.path(), &[], Some("exp"))
            .await
            .expect("submit");
        assert_eq!(info.scheduler_id, Some(5551));
        assert_eq!(info.log_path, "/home/alice/.rex/rex-exp.log");
        assert!(info.is_tracked());

        let py = session.written("/home/alice/.rex/rex-exp.py").expect("script");
        assert_eq!(py.content, "print('hi')\n");

        let sbatch = session
            .written("/home/alice/.rex/rex-exp.sbatch")
            .expect("batch script");
        let lines: Vec<&str> = sbatch.content.lines().collect();
        assert_eq!(
            &lines[..6],
            &[
                "#!/bin/bash -l",
                "#SBATCH --job-name=rex-exp",
                "#SBATCH --output=/home/alice/.rex/rex-exp.log",
                "#SBATCH --open-mode=append",
                "#SBATCH --partition=gpu",
                "#SBATCH --gres=gpu:1",
            ]
        );
        let module_line = lines
            .iter()
            .position(|l| *l == "module load cuda/12.1")
            .expect("module line");
        let last_directive = lines
            .iter()
            .rposition(|l| l.starts_with("#SBATCH"))
            .expect("directives");
        assert!(last_directive < module_line);
        assert!(sbatch.content.contains("mkdir -p \"$HOME/runs\"\n"));
        assert!(sbatch
            .content
            .contains("python3 -u /home/alice/.rex/rex-exp.py\n"));
        assert_eq!(lines.last(), Some(&"exit $_rex_code"));
    }

    #[tokio::test]
    async fn test_submission_seeds_log_header() {
        let (exec, session) = executor(cluster(), SchedulerOptions::default());
        exec.exec_detached(&ExecutionContext::default(), "hostname", Some("h1"))
            .await
            .expect("submit");

        let seed = session
            .commands()
            .into_iter()
            .find(|c| c.contains("Submitted:"))
            .expect("log header");
        assert!(seed.contains("> /home/alice/.rex/rex-h1.log"));
        assert!(seed.contains("[rex] SLURM ID: 5551"));
        assert!(seed.contains("[rex] Status: pending"));
    }

    #[tokio::test]
    async fn test_exec_detached_sends_script_through_heredoc() {
        let (exec, session) = executor(cluster(), SchedulerOptions::default());
        exec.exec_detached(
            &ExecutionContext::default(),
            "echo \"$SLURM_JOB_ID\" 'done'",
            Some("q1"),
        )
        .await
        .expect("submit");

        let write = session
            .commands()
            .into_iter()
            .find(|c| c.starts_with("cat > /home/alice/.rex/rex-q1.sbatch << 'REXCMD'"))
            .expect("heredoc write");
        assert!(write.contains("\necho \"$SLURM_JOB_ID\" 'done'\n"));
        assert!(write.ends_with("\nREXCMD"));
        assert_eq!(session.count("sbatch --parsable /home/alice/.rex/rex-q1.sbatch"), 1);
    }

    #[tokio::test]
    async fn test_unparseable_submission_degrades() {
        let session = MockSession::new()
            .on_stdout("echo $HOME", "/home/alice\n")
            .on_stdout("sbatch", "Submitted batch job 12\n");
        let (exec, session) = executor(session, SchedulerOptions::default());

        let info = exec
            .exec_detached(&ExecutionContext::default(), "true", Some("bad"))
            .await
            .expect("degraded info, not an error");
        assert_eq!(info.scheduler_id, None);
        assert_eq!(info.log_path, "/home/alice/.rex/rex-bad.log");
        assert_eq!(session.count("Submitted:"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_home_degrades() {
        let (exec, session) = executor(
            MockSession::new().on("echo $HOME", vec![MockReply::TransportFailure]),
            SchedulerOptions::default(),
        );

        let info = exec
            .exec_detached(&ExecutionContext::default(), "true", Some("nohome"))
            .await
            .expect("degraded info");
        assert_eq!(info.job_id, "nohome");
        assert_eq!(info.log_path, "");
        assert!(!info.is_tracked());
        assert_eq!(session.count("sbatch"), 0);
    }

    #[tokio::test]
    async fn test_invalid_options_rejected_before_remote_call() {
        let options = SchedulerOptions {
            time: Some("forever".into()),
            ..Default::default()
        };
        let (exec, session) = executor(cluster(), options);

        let result = exec
            .exec_detached(&ExecutionContext::default(), "true", Some("t"))
            .await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_delimiter_collision_rejected_before_remote_call() {
        let (exec, session) = executor(cluster(), SchedulerOptions::default());
        let result = exec
            .exec_foreground(&ExecutionContext::default(), "echo a\nREXCMD")
            .await;

        assert!(matches!(result, Err(Error::ConfigError(_))));
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn test_exec_foreground_uses_srun_with_tty() {
        let (exec, session) = executor(MockSession::new().stream_exit(0), gpu_options());
        let code = exec
            .exec_foreground(&ExecutionContext::default(), "nvidia-smi")
            .await
            .expect("exec");
        assert_eq!(code, 0);

        let streamed = &session.streamed()[0];
        assert!(streamed.starts_with("[Force] srun --partition=gpu --gres=gpu:1 \"$HOME/.rex/rex-exec-"));
        assert!(streamed.contains("; _e=$?; rm -f "));
        assert!(streamed.ends_with("; exit $_e"));

        let wrapper = &session.writes()[0];
        assert!(wrapper.executable);
        assert!(wrapper.content.contains("source \"$HOME/.rex/rex-exec-"));
        assert_eq!(session.count("mkdir -p \"$HOME/.rex\""), 1);
    }

    #[tokio::test]
    async fn test_run_foreground_uses_run_dir() {
        let script = local_script("print(1)\n");
        let ctx = ExecutionContext {
            run_dir: Some("/scratch/alice".into()),
            ..Default::default()
        };
        let (exec, session) = executor(MockSession::new().stream_exit(1), SchedulerOptions::default());

        let code = exec
            .run_foreground(&ctx, script.path(), &[])
            .await
            .expect("run");
        assert_eq!(code, 1);

        let writes = session.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[0].path.starts_with("/scratch/alice/rex-run-"));
        assert!(writes[0].path.ends_with(".py"));
        assert!(writes[1].path.ends_with(".sh"));
        assert!(session.streamed()[0].starts_with("[Force] srun /scratch/alice/rex-run-"));
    }

    #[tokio::test]
    async fn test_status_from_live_queue() {
        let (exec, session) = executor(
            MockSession::new().on_stdout("squeue", "PENDING\n"),
            SchedulerOptions::default(),
        );

        let status = exec.get_status("exp").await.expect("status");
        assert_eq!(status.state, JobState::Pending);
        assert_eq!(session.count("sacct"), 0);
        assert!(session.commands()[0].contains("-n rex-exp "));
    }

    #[tokio::test]
    async fn test_status_falls_back_to_accounting() {
        let (exec, session) = executor(
            MockSession::new()
                .on_stdout("squeue", "")
                .on_stdout("sacct", "TIMEOUT\n"),
            SchedulerOptions::default(),
        );

        let status = exec.get_status("exp").await.expect("status");
        assert_eq!(status.state, JobState::TimedOut);
        assert!(session.commands()[1].contains("--name=rex-exp"));
        assert!(session.commands()[1].contains("tail -n 1"));
    }

    #[tokio::test]
    async fn test_status_inconclusive_accounting_is_completed() {
        let (exec, _) = executor(
            MockSession::new().on_stdout("squeue", "").on_stdout("sacct", ""),
            SchedulerOptions::default(),
        );

        let status = exec.get_status("exp").await.expect("status");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.description, None);
    }

    #[tokio::test]
    async fn test_status_transport_failure_is_error() {
        let (exec, _) = executor(
            MockSession::new().on("squeue", vec![MockReply::TransportFailure]),
            SchedulerOptions::default(),
        );
        assert!(matches!(exec.get_status("exp").await, Err(ref e) if e.is_transport()));
    }

    #[tokio::test]
    async fn test_list_jobs_only_reports_live_states() {
        let (exec, _) = executor(
            MockSession::new().on_stdout("squeue", "1|rex-a|RUNNING|n1\n2|other|RUNNING|n2\n3|rex-b|PENDING|\n"),
            SchedulerOptions::default(),
        );

        let jobs = exec.list_jobs().await.expect("list");
        let ids: Vec<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(jobs[1].state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_kill_cancels_by_name() {
        let (exec, session) = executor(
            MockSession::new().on_stdout("scancel", "killed\n"),
            SchedulerOptions::default(),
        );

        assert_eq!(exec.kill_job("exp").await.ok(), Some(KillOutcome::Killed));
        assert!(session.commands()[0].contains("scancel -n rex-exp"));
    }
}
