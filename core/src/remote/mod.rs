//! Remote execution seam
//!
//! Backends never open sockets; everything they do on the remote host goes
//! through a [`RemoteSession`]. [`SshSession`] is the production
//! implementation backed by the system `ssh` client.

use async_trait::async_trait;

use crate::Result;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod ssh;

pub use ssh::{SshSession, SshSettings};

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Pseudo-terminal allocation for streaming commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tty {
    /// Allocate one when local stdin is a terminal
    #[default]
    Auto,
    /// Always allocate (needed for interrupt propagation to `srun`)
    Force,
    Never,
}

/// Remote command transport
///
/// `exec` returns `Err` only when the transport itself fails; a remote
/// command exiting non-zero is reported through [`CommandOutput`].
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Connection target (`user@host`)
    fn target(&self) -> &str;

    /// Run a command and capture its output
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Run a command with inherited stdio, returning its exit code
    async fn exec_streaming(&self, command: &str, tty: Tty) -> Result<i32>;

    /// Write `script` to a remote temp file, execute it, delete it
    async fn exec_script_streaming(&self, script: &str, login_shell: bool, tty: Tty)
        -> Result<i32>;

    /// Write `content` to `path`, optionally marking it executable
    ///
    /// Fails with a transport error instead of leaving a truncated file.
    async fn write_file(&self, path: &str, content: &[u8], executable: bool) -> Result<()>;
}

/// Shorten a command for debug logs
pub(crate) fn preview(command: &str) -> String {
    const MAX: usize = 100;
    if command.chars().count() > MAX {
        let head: String = command.chars().take(MAX).collect();
        format!("{head}...")
    } else {
        command.to_string()
    }
}
