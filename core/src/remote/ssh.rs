//! Remote execution via the system `ssh` client

use async_trait::async_trait;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{preview, CommandOutput, RemoteSession, Tty};
use crate::script::{quote, quote_path};
use crate::{Error, Result};

/// Exit status `ssh` reserves for its own failures
const SSH_FAILURE_STATUS: i32 = 255;

/// Options passed to every `ssh` invocation
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub connect_timeout_secs: u64,
    pub server_alive_interval_secs: u64,
    pub server_alive_count_max: u32,
    /// Directory for ControlMaster sockets; `None` disables multiplexing
    pub socket_dir: Option<PathBuf>,
    pub identity_file: Option<String>,
    pub verbose: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        let socket_dir = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".ssh").join("controlmasters"));

        Self {
            connect_timeout_secs: 10,
            server_alive_interval_secs: 60,
            server_alive_count_max: 3,
            socket_dir,
            identity_file: None,
            verbose: false,
        }
    }
}

/// [`RemoteSession`] that spawns one `ssh` process per call
///
/// Calls share a persistent connection when OpenSSH multiplexing is
/// available (`ControlMaster=auto`); establishing and tearing down the
/// master connection is left to the operator.
#[derive(Debug, Clone)]
pub struct SshSession {
    target: String,
    opts: Vec<String>,
}

impl SshSession {
    /// Create a session with default settings
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_settings(target, SshSettings::default())
    }

    /// Create a session with explicit settings
    pub fn with_settings(target: impl Into<String>, settings: SshSettings) -> Self {
        let target = target.into();
        let mut opts = Vec::new();

        if settings.verbose {
            opts.push("-v".to_string());
        }

        for opt in [
            format!("ConnectTimeout={}", settings.connect_timeout_secs),
            format!("ServerAliveInterval={}", settings.server_alive_interval_secs),
            format!("ServerAliveCountMax={}", settings.server_alive_count_max),
        ] {
            opts.push("-o".to_string());
            opts.push(opt);
        }

        if let Some(dir) = &settings.socket_dir {
            // `@` confuses the option parser inside ControlPath
            let socket = dir.join(target.replace('@', "--"));
            opts.push("-o".to_string());
            opts.push(format!("ControlPath={}", socket.display()));
            opts.push("-o".to_string());
            opts.push("ControlMaster=auto".to_string());
        }

        if let Some(key) = &settings.identity_file {
            opts.push("-i".to_string());
            opts.push(key.clone());
        }

        Self { target, opts }
    }

    fn command(&self, tty: bool, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(&self.opts);
        if tty {
            cmd.arg("-t");
        }
        cmd.arg(&self.target).arg(remote);
        cmd.kill_on_drop(true);
        cmd
    }

    fn wrap(command: &str) -> String {
        // Skip slow remote startup files
        format!("bash --norc --noprofile -c {}", quote(command))
    }

    /// Verify the host is reachable, with a readable error if not
    #[instrument(skip(self), fields(target = %self.target))]
    pub async fn check_connection(&self) -> Result<()> {
        let output = Command::new("ssh")
            .args(&self.opts)
            .args(["-o", "BatchMode=yes"])
            .arg(&self.target)
            .arg("exit 0")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::SshError(format!("Failed to run ssh: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.contains("Permission denied") {
            format!("SSH connection to {} failed: Permission denied", self.target)
        } else if stderr.contains("Could not resolve hostname") {
            format!("Could not resolve hostname '{}'", self.target)
        } else if stderr.contains("Connection refused") {
            format!("SSH connection to {} failed: Connection refused", self.target)
        } else if stderr.to_lowercase().contains("timed out") {
            format!("SSH connection to {} timed out", self.target)
        } else if stderr.is_empty() {
            format!("SSH connection to {} failed: Unknown error", self.target)
        } else {
            format!("SSH connection to {} failed: {}", self.target, stderr)
        };
        Err(Error::SshError(message))
    }

    fn resolve_tty(tty: Tty) -> bool {
        match tty {
            Tty::Auto => std::io::stdin().is_terminal(),
            Tty::Force => true,
            Tty::Never => false,
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn target(&self) -> &str {
        &self.target
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        debug!(target = %self.target, command = %preview(command), "ssh exec");

        let output = self
            .command(false, &Self::wrap(command))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::SshError(format!("Failed to run ssh: {}", e)))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        debug!(exit_code, "ssh exec finished");

        if exit_code == SSH_FAILURE_STATUS {
            let reason = stderr.trim();
            return Err(Error::SshError(if reason.is_empty() {
                format!("ssh to {} failed", self.target)
            } else {
                reason.to_string()
            }));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    async fn exec_streaming(&self, command: &str, tty: Tty) -> Result<i32> {
        debug!(target = %self.target, command = %preview(command), "ssh exec_streaming");

        let status = self
            .command(Self::resolve_tty(tty), &Self::wrap(command))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| Error::SshError(format!("Failed to run ssh: {}", e)))?;

        let code = status.code().unwrap_or(-1);
        debug!(exit_code = code, "ssh exec_streaming finished");
        Ok(code)
    }

    async fn exec_script_streaming(
        &self,
        script: &str,
        login_shell: bool,
        tty: Tty,
    ) -> Result<i32> {
        debug!(
            target = %self.target,
            bytes = script.len(),
            login_shell,
            "ssh exec_script_streaming"
        );

        let shell = if login_shell { "bash -l" } else { "bash" };
        let runner = r#"script=$(mktemp) && cat > "$script" && chmod +x "$script" && "$script"; e=$?; rm -f "$script"; exit $e"#;
        let remote = format!("{} -c {}", shell, quote(runner));

        let mut child = self
            .command(Self::resolve_tty(tty), &remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::SshError(format!("Failed to run ssh: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| Error::SshError(format!("Failed to send script: {}", e)))?;
            // Closing stdin ends the remote `cat`
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::SshError(format!("ssh did not finish: {}", e)))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn write_file(&self, path: &str, content: &[u8], executable: bool) -> Result<()> {
        debug!(target = %self.target, path, bytes = content.len(), "ssh write_file");

        let dest = quote_path(path);
        let mut remote = format!("cat > {dest}");
        if executable {
            remote.push_str(&format!(" && chmod +x {dest}"));
        }

        let mut child = self
            .command(false, &Self::wrap(&remote))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SshError(format!("SSH connection failed while writing to {}: {}", path, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content).await.map_err(|e| {
                Error::SshError(format!("Failed to write to {}: {}", path, e))
            })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::SshError(format!("Failed to write to {}: {}", path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::SshError(format!(
                "Failed to write to {}: {}",
                path,
                if stderr.is_empty() { "SSH error" } else { stderr.as_str() }
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_include_multiplexing_socket() {
        let settings = SshSettings {
            socket_dir: Some(PathBuf::from("/home/me/.ssh/controlmasters")),
            ..Default::default()
        };
        let session = SshSession::with_settings("alice@cluster", settings);

        assert!(session
            .opts
            .contains(&"ControlPath=/home/me/.ssh/controlmasters/alice--cluster".to_string()));
        assert!(session.opts.contains(&"ControlMaster=auto".to_string()));
        assert!(session.opts.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(session.target(), "alice@cluster");
    }

    #[test]
    fn test_options_without_socket_dir() {
        let settings = SshSettings {
            socket_dir: None,
            identity_file: Some("/keys/id".into()),
            verbose: true,
            ..Default::default()
        };
        let session = SshSession::with_settings("host", settings);

        assert_eq!(session.opts[0], "-v");
        assert!(!session.opts.iter().any(|o| o.starts_with("ControlPath")));
        assert!(session.opts.ends_with(&["-i".to_string(), "/keys/id".to_string()]));
    }

    #[test]
    fn test_wrap_quotes_command() {
        assert_eq!(
            SshSession::wrap("echo 'hi'"),
            r#"bash --norc --noprofile -c 'echo '"'"'hi'"'"''"#
        );
    }
}
