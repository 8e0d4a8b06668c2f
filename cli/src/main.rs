//! rex - run Python scripts and shell commands on remote hosts
//!
//! Work runs either as a background process on the login node or through
//! the SLURM scheduler. Detached jobs can be listed, inspected, followed,
//! killed and watched until they finish.

mod commands;
mod config;
mod gpus;
mod output;

use anyhow::{anyhow, bail, Context};
use clap::{ArgGroup, Parser};
use rex_core::{
    create_executor, most_recent_job, show_log, validate_job_name, Backend, DirectExecutor,
    ExecutionContext, Executor, JobInfo, JobState, KillOutcome, RemoteSession, SshSession,
    SshSettings,
};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use config::{GlobalConfig, HostConfig, Overrides};

/// Exit code reported when interrupted with Ctrl-C
const INTERRUPTED: i32 = 130;

/// Run Python scripts and shell commands on remote hosts
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("action")
        .args([
            "exec", "exec_login", "jobs", "status", "log", "kill", "watch", "build", "gpus", "read"
        ])
        .multiple(false)
))]
#[command(group(
    ArgGroup::new("job_action")
        .args(["status", "log", "kill", "watch"])
        .multiple(false)
))]
struct Cli {
    /// Host (`user@host`) or alias from the config file
    target: Option<String>,

    /// Python script to run; read from stdin when omitted
    script: Option<PathBuf>,

    /// Arguments passed to the script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Run in the background and return immediately
    #[arg(short, long)]
    detach: bool,

    /// Submit through SLURM
    #[arg(short, long)]
    slurm: bool,

    /// Job name for detached runs
    #[arg(short, long)]
    name: Option<String>,

    /// Remote Python interpreter
    #[arg(short, long)]
    python: Option<String>,

    /// Environment module to load (repeatable)
    #[arg(short = 'm', long = "module", value_name = "MODULE")]
    modules: Vec<String>,

    /// SLURM partition
    #[arg(long)]
    partition: Option<String>,

    /// SLURM generic resources (e.g. gpu:1)
    #[arg(long)]
    gres: Option<String>,

    /// SLURM time limit (e.g. 04:00:00)
    #[arg(long)]
    time: Option<String>,

    /// SLURM CPUs per task
    #[arg(long)]
    cpus: Option<u32>,

    /// SLURM memory (e.g. 16G)
    #[arg(long)]
    mem: Option<String>,

    /// SLURM node constraint
    #[arg(long)]
    constraint: Option<String>,

    /// SLURM soft node constraint
    #[arg(long)]
    prefer: Option<String>,

    /// Use the host's GPU partition
    #[arg(long, conflicts_with = "cpu")]
    gpu: bool,

    /// Use the host's CPU partition
    #[arg(long)]
    cpu: bool,

    /// Run a shell command instead of a script
    #[arg(long, value_name = "CMD")]
    exec: Option<String>,

    /// Run a shell command on the login node, even with --slurm
    #[arg(long, value_name = "CMD")]
    exec_login: Option<String>,

    /// List jobs (every configured alias when no target is given)
    #[arg(long)]
    jobs: bool,

    /// Show a job's status; exits 0 only while it is running
    #[arg(long, value_name = "JOB", num_args = 0..=1)]
    status: Option<Option<String>>,

    /// Print a job's log
    #[arg(long, value_name = "JOB", num_args = 0..=1)]
    log: Option<Option<String>>,

    /// Keep following the log
    #[arg(short, long, requires = "log")]
    follow: bool,

    /// Kill a job
    #[arg(long, value_name = "JOB", num_args = 0..=1)]
    kill: Option<Option<String>>,

    /// Wait for jobs to finish
    #[arg(long, value_name = "JOB", num_args = 0..)]
    watch: Option<Vec<String>>,

    /// Create or refresh the code directory's virtualenv (detached)
    #[arg(long)]
    build: bool,

    /// Delete the virtualenv before building
    #[arg(long, requires = "build")]
    clean: bool,

    /// Show GPU usage on the login node, or GPU nodes with --slurm
    #[arg(long)]
    gpus: bool,

    /// Print a remote file or list a directory (default: code_dir)
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    read: Option<Option<String>>,

    /// Use the most recently started job
    #[arg(long, requires = "job_action")]
    last: bool,

    /// Machine-readable output
    #[arg(long)]
    json: bool,

    /// Verbose logging to stderr
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            slurm: self.slurm,
            python: self.python.clone(),
            modules: self.modules.clone(),
            partition: self.partition.clone(),
            gres: self.gres.clone(),
            time: self.time.clone(),
            cpus: self.cpus,
            mem: self.mem.clone(),
            constraint: self.constraint.clone(),
            prefer: self.prefer.clone(),
            gpu: self.gpu,
            cpu: self.cpu,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let code = tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(e) => {
                error!("{:#}", e);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => INTERRUPTED,
    };

    process::exit(code);
}

/// Logs go to stderr so stdout carries only job output and JSON
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = GlobalConfig::load()?;

    let Some(name) = cli.target.as_deref() else {
        if cli.jobs {
            return list_all_hosts(&config, cli.json, cli.debug).await;
        }
        bail!("No target given (see --help)");
    };

    let (target, host) = config.resolve_target(name);
    let resolved = config::resolve(&cli.overrides(), host)?;
    if let Some(job) = &cli.name {
        validate_job_name(job)?;
    }
    debug!(host = %target, backend = %resolved.backend, "Resolved configuration");

    let ssh = SshSession::with_settings(&target, ssh_settings(host, cli.debug));
    ssh.check_connection().await?;
    let session: Arc<dyn RemoteSession> = Arc::new(ssh);

    let executor = create_executor(resolved.backend, session.clone(), resolved.options.clone());
    let ctx = &resolved.context;

    if cli.jobs {
        let jobs = executor.list_jobs().await?;
        println!("{}", output::render_jobs(&jobs, cli.json)?);
        return Ok(0);
    }

    if let Some(job) = &cli.status {
        let job_id = pick_job(session.as_ref(), job.as_deref(), cli.last).await?;
        let (status, exit_code) = commands::job_status(executor.as_ref(), &job_id).await?;
        if status.state == JobState::Unknown {
            warn!(job_id = %job_id, "Could not determine job status");
        }
        println!("{}", output::render_status(&status, exit_code, cli.json)?);
        return Ok(if status.state == JobState::Running { 0 } else { 1 });
    }

    if let Some(job) = &cli.log {
        let job_id = pick_job(session.as_ref(), job.as_deref(), cli.last).await?;
        let path = executor
            .get_log_path(&job_id)
            .await?
            .ok_or_else(|| anyhow!("Log not found for job {}", job_id))?;
        return Ok(show_log(session.as_ref(), &path, cli.follow).await?);
    }

    if let Some(job) = &cli.kill {
        let job_id = pick_job(session.as_ref(), job.as_deref(), cli.last).await?;
        return Ok(match executor.kill_job(&job_id).await? {
            KillOutcome::Killed => {
                println!("Killed job {}", job_id);
                0
            }
            KillOutcome::NotRunning => {
                println!("Job {} is not running", job_id);
                1
            }
            KillOutcome::Failed => bail!("Failed to kill job {}", job_id),
        });
    }

    if let Some(jobs) = &cli.watch {
        let job_ids = if jobs.is_empty() || cli.last {
            vec![pick_job(session.as_ref(), None, true).await?]
        } else {
            jobs.clone()
        };
        let code = commands::watch(executor.as_ref(), &job_ids, cli.json, |line| {
            println!("{}", line)
        })
        .await;
        return Ok(code);
    }

    if cli.build {
        let info = commands::build(executor.as_ref(), ctx, cli.clean).await?;
        return report_started(&info, cli.json);
    }

    if cli.gpus {
        let partition = resolved.options.partition.as_deref();
        return show_gpus(session.as_ref(), resolved.backend, partition, cli.json).await;
    }

    if let Some(path) = &cli.read {
        let path = path
            .clone()
            .or_else(|| ctx.code_dir.clone())
            .ok_or_else(|| anyhow!("No path given and code_dir not configured"))?;
        return commands::read_remote(session.as_ref(), &path).await;
    }

    if let Some(cmd) = &cli.exec {
        return exec(executor.as_ref(), ctx, cmd, &cli).await;
    }

    if let Some(cmd) = &cli.exec_login {
        let direct = DirectExecutor::new(session.clone());
        return exec(&direct, ctx, cmd, &cli).await;
    }

    run_script(executor.as_ref(), ctx, &cli).await
}

/// Explicit job identifier, or the newest one on the host
async fn pick_job(
    session: &dyn RemoteSession,
    job: Option<&str>,
    last: bool,
) -> anyhow::Result<String> {
    match job {
        Some(id) if !last => Ok(id.to_string()),
        _ => most_recent_job(session)
            .await?
            .ok_or_else(|| anyhow!("No jobs found")),
    }
}

fn ssh_settings(host: Option<&HostConfig>, verbose: bool) -> SshSettings {
    SshSettings {
        identity_file: host.and_then(|h| h.identity_file.clone()),
        verbose,
        ..Default::default()
    }
}

/// Login-node GPUs for direct hosts; GPU nodes of the partition for SLURM
async fn show_gpus(
    session: &dyn RemoteSession,
    backend: Backend,
    partition: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    if backend == Backend::Batch {
        let nodes = gpus::partition_nodes(session, partition).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&nodes)?);
        } else if nodes.is_empty() {
            warn!(partition = partition.unwrap_or("default"), "No GPU nodes in partition");
        } else {
            println!("{}", nodes.join("\n"));
        }
        return Ok(0);
    }

    let found = gpus::query(session).await?;
    if found.is_empty() && !json {
        warn!("No GPU information available (nvidia-smi not found?)");
        return Ok(0);
    }
    println!("{}", gpus::render(&found, json)?);
    Ok(0)
}

async fn exec(
    executor: &dyn Executor,
    ctx: &ExecutionContext,
    cmd: &str,
    cli: &Cli,
) -> anyhow::Result<i32> {
    if cli.detach {
        let info = executor.exec_detached(ctx, cmd, cli.name.as_deref()).await?;
        report_started(&info, cli.json)
    } else {
        Ok(executor.exec_foreground(ctx, cmd).await?)
    }
}

async fn run_script(
    executor: &dyn Executor,
    ctx: &ExecutionContext,
    cli: &Cli,
) -> anyhow::Result<i32> {
    // Keeps a piped script on disk until the run is over
    let mut staged = None;

    let script = match &cli.script {
        Some(path) => {
            if !path.is_file() {
                bail!("Script not found: {}", path.display());
            }
            path.clone()
        }
        None => {
            if std::io::stdin().is_terminal() {
                bail!("No input file and stdin is a terminal. Provide a file or pipe input.");
            }
            if cli.detach {
                bail!("-d requires a file (cannot detach piped input)");
            }

            let mut content = String::new();
            tokio::io::stdin()
                .read_to_string(&mut content)
                .await
                .context("Failed to read stdin")?;
            if content.trim().is_empty() {
                bail!("No input file and stdin is empty. Provide a file or pipe input.");
            }

            let file = tempfile::Builder::new()
                .prefix("rex-stdin-")
                .suffix(".py")
                .tempfile()
                .context("Failed to stage piped script")?;
            std::fs::write(file.path(), content).context("Failed to stage piped script")?;
            let path = file.path().to_path_buf();
            staged = Some(file);
            path
        }
    };

    let code = if cli.detach {
        let info = executor
            .run_detached(ctx, &script, &cli.args, cli.name.as_deref())
            .await?;
        report_started(&info, cli.json)?
    } else {
        executor.run_foreground(ctx, &script, &cli.args).await?
    };

    drop(staged);
    Ok(code)
}

fn report_started(info: &JobInfo, json: bool) -> anyhow::Result<i32> {
    if !info.is_tracked() {
        warn!(job_id = %info.job_id, "Launch not confirmed; check --status later");
    }
    println!("{}", output::render_started(info, json)?);
    Ok(0)
}

/// `--jobs` without a target: every configured alias in turn
async fn list_all_hosts(config: &GlobalConfig, json: bool, verbose: bool) -> anyhow::Result<i32> {
    if config.aliases.is_empty() {
        bail!("No aliases configured; give a target");
    }

    let mut by_host = BTreeMap::new();
    let mut code = 0;

    for alias in config.aliases.keys() {
        let (target, host) = config.resolve_target(alias);
        let resolved = config::resolve(&Overrides::default(), host)?;

        let session: Arc<dyn RemoteSession> =
            Arc::new(SshSession::with_settings(&target, ssh_settings(host, verbose)));
        let executor = create_executor(resolved.backend, session, resolved.options);

        match executor.list_jobs().await {
            Ok(jobs) => {
                if !json {
                    println!("== {} ({}) ==", alias, target);
                    if !jobs.is_empty() {
                        println!("{}", output::render_jobs(&jobs, false)?);
                    }
                }
                by_host.insert(alias.clone(), jobs);
            }
            Err(e) => {
                warn!(alias = %alias, error = %e, "Failed to list jobs");
                code = 1;
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&by_host)?);
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("rex").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_script_with_arguments() {
        let cli = parse(&["gpu", "-d", "-s", "--gpu", "train.py", "--lr", "0.1"]).expect("parse");

        assert_eq!(cli.target.as_deref(), Some("gpu"));
        assert_eq!(cli.script, Some(PathBuf::from("train.py")));
        assert_eq!(cli.args, vec!["--lr", "0.1"]);
        assert!(cli.detach && cli.slurm && cli.gpu);
    }

    #[test]
    fn test_optional_job_values() {
        let cli = parse(&["host", "--status"]).expect("parse");
        assert_eq!(cli.status, Some(None));

        let cli = parse(&["host", "--kill", "exp1"]).expect("parse");
        assert_eq!(cli.kill, Some(Some("exp1".to_string())));

        let cli = parse(&["host", "--watch", "a", "b"]).expect("parse");
        assert_eq!(cli.watch, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_conflicting_actions_rejected() {
        assert!(parse(&["host", "--jobs", "--status", "a"]).is_err());
        assert!(parse(&["host", "--exec", "ls", "--exec-login", "ls"]).is_err());
        assert!(parse(&["host", "--gpu", "--cpu"]).is_err());
    }

    #[test]
    fn test_dependent_flags_require_their_action() {
        assert!(parse(&["host", "-f"]).is_err());
        assert!(parse(&["host", "--last"]).is_err());
        assert!(parse(&["host", "--log", "-f", "--last"]).is_ok());
    }

    #[test]
    fn test_maintenance_actions() {
        let cli = parse(&["host", "--build", "--clean"]).expect("parse");
        assert!(cli.build && cli.clean);

        let cli = parse(&["host", "--read"]).expect("parse");
        assert_eq!(cli.read, Some(None));
        let cli = parse(&["host", "--read", "~/data"]).expect("parse");
        assert_eq!(cli.read, Some(Some("~/data".to_string())));

        assert!(parse(&["host", "--gpus", "--json"]).is_ok());
        assert!(parse(&["host", "--clean"]).is_err());
        assert!(parse(&["host", "--build", "--gpus"]).is_err());
        assert!(parse(&["host", "--read", "--jobs"]).is_err());
    }

    #[test]
    fn test_identity_file_reaches_ssh_settings() {
        let host = HostConfig {
            identity_file: Some("~/.ssh/cluster".to_string()),
            ..Default::default()
        };

        let settings = ssh_settings(Some(&host), true);
        assert_eq!(settings.identity_file.as_deref(), Some("~/.ssh/cluster"));
        assert!(settings.verbose);
        assert_eq!(ssh_settings(None, false).identity_file, None);
    }

    #[test]
    fn test_repeatable_modules_flow_into_overrides() {
        let cli = parse(&["host", "-m", "cuda/12.1", "-m", "gcc/12", "--cpus", "4", "x.py"])
            .expect("parse");
        let overrides = cli.overrides();

        assert_eq!(overrides.modules, vec!["cuda/12.1", "gcc/12"]);
        assert_eq!(overrides.cpus, Some(4));
    }
}
