//! Shell script builders for remote execution
//!
//! Two quoting modes are kept strictly apart:
//! - [`quote`] makes a value completely literal (paths, module names).
//! - [`quote_with_expansion`] double-quotes a value that references remote
//!   variables (`$VAR`, `${VAR}`) so the reference still expands remotely,
//!   escaping only `"`, `` ` ``, `\` and `$(`.

use regex::Regex;
use std::sync::LazyLock;

use crate::{Error, ExecutionContext, Result, SchedulerOptions};

/// Sentinel closing the quoted heredoc that carries caller-supplied commands
pub const HEREDOC_DELIMITER: &str = "REXCMD";

/// Prefix of every line the wrappers echo into the job log
pub const LOG_MARKER: &str = "[rex]";

static VAR_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\{[A-Za-z_][A-Za-z0-9_]*\}|[A-Za-z_][A-Za-z0-9_]*)")
        .expect("variable reference pattern is valid")
});

static ENV_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key pattern is valid")
});

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c)
}

/// Quote a value so the shell interprets none of its characters
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(is_safe_char) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Quote a value while letting `$VAR` / `${VAR}` expand on the remote host
///
/// Values without a variable reference fall back to [`quote`].
pub fn quote_with_expansion(s: &str) -> String {
    if !VAR_REF_RE.is_match(s) {
        return quote(s);
    }

    let escaped = s
        .replace('\\', r"\\")
        .replace('"', r#"\""#)
        .replace('`', r"\`")
        .replace("$(", r"\$(");
    format!("\"{escaped}\"")
}

/// Rewrite a leading `~` to `$HOME` so it survives quoting
pub fn expand_tilde(path: &str) -> String {
    if path == "~" {
        "$HOME".to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("$HOME/{rest}")
    } else {
        path.to_string()
    }
}

/// Quote a remote path, keeping `~` and `$HOME` expandable
pub fn quote_path(path: &str) -> String {
    quote_with_expansion(&expand_tilde(path))
}

/// Reject contexts that cannot be rendered safely
pub fn validate_context(ctx: &ExecutionContext) -> Result<()> {
    if ctx.python.trim().is_empty() {
        return Err(Error::ConfigError("Python interpreter is empty".to_string()));
    }
    if ctx.run_dir.as_deref().is_some_and(|d| d.trim().is_empty()) {
        return Err(Error::ConfigError("Working directory is empty".to_string()));
    }
    if ctx.code_dir.as_deref().is_some_and(|d| d.trim().is_empty()) {
        return Err(Error::ConfigError("Code directory is empty".to_string()));
    }
    if ctx.modules.iter().any(|m| m.trim().is_empty()) {
        return Err(Error::ConfigError("Empty module name".to_string()));
    }
    if let Some(key) = ctx.env.keys().find(|k| !ENV_KEY_RE.is_match(k)) {
        return Err(Error::ConfigError(format!(
            "Invalid environment variable name: '{}'",
            key
        )));
    }
    Ok(())
}

/// Setup commands for a context, in application order
///
/// Absent fields emit nothing.
pub fn build_context_commands(ctx: &ExecutionContext, mkdir_run_dir: bool) -> Vec<String> {
    let mut cmds = Vec::new();

    if !ctx.modules.is_empty() {
        let modules: Vec<String> = ctx.modules.iter().map(|m| quote(m)).collect();
        cmds.push(format!("module load {}", modules.join(" ")));
    }

    for (key, value) in &ctx.env {
        cmds.push(format!("export {}={}", key, quote_with_expansion(value)));
    }

    if let Some(code_dir) = &ctx.code_dir {
        let activate = format!("{}/.venv/bin/activate", code_dir.trim_end_matches('/'));
        cmds.push(format!("source {}", quote_path(&activate)));
    }

    if let Some(run_dir) = &ctx.run_dir {
        if mkdir_run_dir {
            cmds.push(format!("mkdir -p {}", quote_path(run_dir)));
        }
        cmds.push(format!("cd {}", quote_path(run_dir)));
    }

    cmds
}

/// Interpreter invocation for a copied script
pub fn python_command(python: &str, script: &str, args: &[String]) -> String {
    let mut cmd = format!("{} -u {}", quote_path(python), quote_path(script));
    for arg in args {
        cmd.push(' ');
        cmd.push_str(&quote(arg));
    }
    cmd
}

/// Reject a payload containing the heredoc delimiter as a whole line
///
/// Lines are split on `\n` only; bash does not end a heredoc on a line
/// that still carries a trailing `\r`.
pub fn check_heredoc_payload(content: &str) -> Result<()> {
    if content.split('\n').any(|line| line == HEREDOC_DELIMITER) {
        return Err(Error::ConfigError(format!(
            "Command contains '{}' as a line, which conflicts with internal delimiter",
            HEREDOC_DELIMITER
        )));
    }
    Ok(())
}

/// Shell text that writes `content` to `path` through a quoted heredoc
///
/// The quoted delimiter disables every expansion inside the payload. A
/// payload line equal to the delimiter would end the heredoc early, so it
/// is rejected.
pub fn heredoc_write(path: &str, content: &str, executable: bool) -> Result<String> {
    check_heredoc_payload(content)?;

    let target = quote_path(path);
    let mut script = format!("cat > {target} << '{HEREDOC_DELIMITER}'\n{content}");
    if !content.ends_with('\n') {
        script.push('\n');
    }
    script.push_str(HEREDOC_DELIMITER);
    if executable {
        script.push_str(&format!("\nchmod +x {target}"));
    }
    Ok(script)
}

/// First line of a command, shortened for logs and listings
pub fn summarize(cmd: &str, max_chars: usize) -> String {
    let first = cmd.lines().next().unwrap_or("").trim();
    if first.chars().count() > max_chars {
        let short: String = first.chars().take(max_chars).collect();
        format!("{short}...")
    } else {
        first.to_string()
    }
}

/// Line-oriented bash script builder
///
/// Scheduler directives always land directly after the shebang, whatever
/// order the builder methods are called in.
#[derive(Debug, Clone, Default)]
pub struct ScriptBuilder {
    shebang: Option<String>,
    directives: Vec<String>,
    lines: Vec<String>,
}

impl ScriptBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shebang line
    pub fn shebang(mut self, login: bool) -> Self {
        self.shebang = Some(if login { "#!/bin/bash -l" } else { "#!/bin/bash" }.to_string());
        self
    }

    /// Add `#SBATCH --<key>=<value>`
    pub fn directive(mut self, key: &str, value: &str) -> Self {
        self.directives.push(format!("#SBATCH --{key}={value}"));
        self
    }

    /// One directive per set scheduler option
    pub fn scheduler_options(self, opts: &SchedulerOptions) -> Self {
        opts.directives()
            .into_iter()
            .fold(self, |builder, (key, value)| builder.directive(key, &value))
    }

    pub fn job_name(self, name: &str) -> Self {
        self.directive("job-name", name)
    }

    pub fn output(self, path: &str) -> Self {
        self.directive("output", path)
    }

    pub fn open_mode(self, mode: &str) -> Self {
        self.directive("open-mode", mode)
    }

    /// Emit context setup commands
    pub fn apply_context(mut self, ctx: &ExecutionContext, mkdir_run_dir: bool) -> Self {
        self.lines.extend(build_context_commands(ctx, mkdir_run_dir));
        self
    }

    /// Run a copied script with unbuffered output
    pub fn run_python(self, python: &str, script: &str, args: &[String]) -> Self {
        let cmd = python_command(python, script, args);
        self.run_command(&cmd)
    }

    /// Add arbitrary command text verbatim
    pub fn run_command(mut self, cmd: &str) -> Self {
        self.lines.push(cmd.to_string());
        self
    }

    pub fn comment(mut self, text: &str) -> Self {
        self.lines.push(format!("# {text}"));
        self
    }

    pub fn blank_line(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    /// Echo start time, host and a description into the log
    pub fn header(mut self, description: &str) -> Self {
        self.lines.push(format!("echo \"{LOG_MARKER} Started: $(date)\""));
        self.lines.push(format!("echo \"{LOG_MARKER} Host: $(hostname)\""));
        self.lines.push(format!(
            "echo {}",
            quote(&format!("{LOG_MARKER} {}", summarize(description, 200)))
        ));
        self.lines.push("echo \"---\"".to_string());
        self
    }

    /// Capture the last exit code, echo it as the final log line, re-exit
    pub fn footer(mut self) -> Self {
        self.lines.push("_rex_code=$?".to_string());
        self.lines.push(format!(
            "if [ $_rex_code -gt 128 ]; then echo \"{LOG_MARKER} Killed by signal $((_rex_code - 128))\"; fi"
        ));
        self.lines.push("echo \"---\"".to_string());
        self.lines.push(format!("echo \"{LOG_MARKER} Finished: $(date)\""));
        self.lines.push(format!("echo \"{LOG_MARKER} Exit code: $_rex_code\""));
        self.lines.push("exit $_rex_code".to_string());
        self
    }

    /// Return complete script
    pub fn build(self) -> String {
        let mut out: Vec<String> = Vec::new();
        out.extend(self.shebang);
        out.extend(self.directives);
        out.extend(self.lines);
        out.join("\n") + "\n"
    }
}
