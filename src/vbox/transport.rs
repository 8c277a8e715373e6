use std::process::Stdio;

use crate::error::VbError;

/// What one tool invocation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs the tool with a list of arguments and captures its output.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Transport {
    async fn exec(&self, args: &[String]) -> Result<ExecOutput, VbError>;

    /// Human readable command line, for logs and errors.
    fn describe(&self, args: &[String]) -> String;
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

fn shell_join<'a>(words: impl IntoIterator<Item = &'a str>) -> Result<String, VbError> {
    let mut quoted = Vec::new();
    for word in words {
        let q = shlex::try_quote(word).map_err(|e| VbError::Validation {
            message: format!("cannot quote argument '{word}': {e}"),
        })?;
        quoted.push(q.into_owned());
    }
    Ok(quoted.join(" "))
}

async fn capture(mut cmd: tokio::process::Command, what: &str) -> Result<ExecOutput, VbError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| VbError::Io {
            context: format!("running {what}"),
            source: e,
        })?;
    Ok(ExecOutput {
        code: output.status.code(),
        stdout: split_lines(&output.stdout),
        stderr: split_lines(&output.stderr),
    })
}

// ── local ────────────────────────────────────────────────

/// Runs the tool as a child process on this host.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    executable: String,
}

impl LocalTransport {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl Transport for LocalTransport {
    async fn exec(&self, args: &[String]) -> Result<ExecOutput, VbError> {
        tracing::trace!(cmd = %self.describe(args), "exec");
        let mut cmd = tokio::process::Command::new(&self.executable);
        cmd.args(args);
        capture(cmd, &self.executable).await
    }

    fn describe(&self, args: &[String]) -> String {
        std::iter::once(self.executable.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── ssh ──────────────────────────────────────────────────

/// Runs the tool on a remote host through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    executable: String,
}

impl SshTransport {
    pub fn new(host: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            executable: executable.into(),
        }
    }

    /// The single command string handed to the remote shell.
    pub fn remote_command(&self, args: &[String]) -> Result<String, VbError> {
        shell_join(std::iter::once(self.executable.as_str()).chain(args.iter().map(String::as_str)))
    }
}

impl Transport for SshTransport {
    async fn exec(&self, args: &[String]) -> Result<ExecOutput, VbError> {
        let remote = self.remote_command(args)?;
        tracing::trace!(host = %self.host, cmd = %remote, "exec over ssh");
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes", &self.host, "--", &remote]);
        capture(cmd, "ssh").await
    }

    fn describe(&self, args: &[String]) -> String {
        let remote = self
            .remote_command(args)
            .unwrap_or_else(|_| args.join(" "));
        format!("ssh {} -- {remote}", self.host)
    }
}

// ── selection ────────────────────────────────────────────

/// The transport a master is configured for.
#[derive(Debug, Clone)]
pub enum Executor {
    Local(LocalTransport),
    Ssh(SshTransport),
}

impl Executor {
    pub fn new(executable: &str, host: Option<&str>) -> Self {
        match host {
            Some(host) => Executor::Ssh(SshTransport::new(host, executable)),
            None => Executor::Local(LocalTransport::new(executable)),
        }
    }
}

impl Transport for Executor {
    async fn exec(&self, args: &[String]) -> Result<ExecOutput, VbError> {
        match self {
            Executor::Local(t) => t.exec(args).await,
            Executor::Ssh(t) => t.exec(args).await,
        }
    }

    fn describe(&self, args: &[String]) -> String {
        match self {
            Executor::Local(t) => t.describe(args),
            Executor::Ssh(t) => t.describe(args),
        }
    }
}
