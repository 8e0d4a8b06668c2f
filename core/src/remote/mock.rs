//! Scripted [`RemoteSession`] for tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{CommandOutput, RemoteSession, Tty};
use crate::{Error, Result};

/// One scripted reply
#[derive(Debug, Clone)]
pub enum MockReply {
    Output(CommandOutput),
    /// Fail the call as if `ssh` could not reach the host
    TransportFailure,
}

impl MockReply {
    pub fn stdout(text: &str) -> Self {
        Self::Output(CommandOutput::ok(text))
    }

    pub fn exit(code: i32, stdout: &str) -> Self {
        Self::Output(CommandOutput {
            exit_code: code,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn into_result(self) -> Result<CommandOutput> {
        match self {
            Self::Output(out) => Ok(out),
            Self::TransportFailure => Err(Error::SshError("connection reset".to_string())),
        }
    }
}

struct Rule {
    pattern: String,
    replies: VecDeque<MockReply>,
}

/// A file written through [`RemoteSession::write_file`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub path: String,
    pub content: String,
    pub executable: bool,
}

/// Session that answers commands from substring rules
///
/// The first rule whose pattern occurs in a command answers it. Queued
/// replies are consumed in order; the last one repeats. Commands without a
/// matching rule succeed with empty output.
#[derive(Default)]
pub struct MockSession {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    writes: Mutex<Vec<Write>>,
    streamed: Mutex<Vec<String>>,
    stream_exit: Mutex<i32>,
    fail_writes: Mutex<bool>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `replies`
    pub fn on(self, pattern: &str, replies: Vec<MockReply>) -> Self {
        self.rules.lock().expect("mock lock").push(Rule {
            pattern: pattern.to_string(),
            replies: replies.into(),
        });
        self
    }

    pub fn on_stdout(self, pattern: &str, stdout: &str) -> Self {
        self.on(pattern, vec![MockReply::stdout(stdout)])
    }

    /// Exit code returned by streaming calls
    pub fn stream_exit(self, code: i32) -> Self {
        *self.stream_exit.lock().expect("mock lock") = code;
        self
    }

    /// Make every file write fail at the transport level
    pub fn failing_writes(self) -> Self {
        *self.fail_writes.lock().expect("mock lock") = true;
        self
    }

    /// Captured commands, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("mock lock").clone()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().expect("mock lock").clone()
    }

    /// Streamed commands and scripts, in order
    pub fn streamed(&self) -> Vec<String> {
        self.streamed.lock().expect("mock lock").clone()
    }

    /// Number of captured commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn written(&self, path: &str) -> Option<Write> {
        self.writes().into_iter().find(|w| w.path == path)
    }

    fn reply(&self, command: &str) -> Result<CommandOutput> {
        self.commands
            .lock()
            .expect("mock lock")
            .push(command.to_string());

        let mut rules = self.rules.lock().expect("mock lock");
        let Some(rule) = rules.iter_mut().find(|r| command.contains(&r.pattern)) else {
            return Ok(CommandOutput::default());
        };

        let reply = if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        };
        reply.map_or_else(|| Ok(CommandOutput::default()), MockReply::into_result)
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn target(&self) -> &str {
        "mock@host"
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.reply(command)
    }

    async fn exec_streaming(&self, command: &str, tty: Tty) -> Result<i32> {
        self.streamed
            .lock()
            .expect("mock lock")
            .push(format!("[{tty:?}] {command}"));
        Ok(*self.stream_exit.lock().expect("mock lock"))
    }

    async fn exec_script_streaming(
        &self,
        script: &str,
        login_shell: bool,
        tty: Tty,
    ) -> Result<i32> {
        self.streamed
            .lock()
            .expect("mock lock")
            .push(format!("[{tty:?} login={login_shell}] {script}"));
        Ok(*self.stream_exit.lock().expect("mock lock"))
    }

    async fn write_file(&self, path: &str, content: &[u8], executable: bool) -> Result<()> {
        if *self.fail_writes.lock().expect("mock lock") {
            return Err(Error::SshError(format!("Failed to write to {}", path)));
        }
        self.writes.lock().expect("mock lock").push(Write {
            path: path.to_string(),
            content: String::from_utf8_lossy(content).to_string(),
            executable,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_are_consumed_then_sticky() {
        let session = MockSession::new().on(
            "pgrep",
            vec![MockReply::TransportFailure, MockReply::stdout("42\n")],
        );

        assert!(session.exec("pgrep -f x").await.is_err());
        assert_eq!(session.exec("pgrep -f x").await.ok().map(|o| o.stdout), Some("42\n".into()));
        assert_eq!(session.exec("pgrep -f x").await.ok().map(|o| o.stdout), Some("42\n".into()));
        assert_eq!(session.count("pgrep"), 3);
    }

    #[tokio::test]
    async fn test_unmatched_command_succeeds_empty() {
        let session = MockSession::new();
        let out = session.exec("true").await.expect("mock exec");
        assert!(out.success());
        assert!(out.stdout.is_empty());
    }
}
