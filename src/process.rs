// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded child-process execution
//!
//! Every external tool (ssh, rsync, dig, systemctl, git, ...) goes through
//! [`run`]. Children are spawned with `kill_on_drop`, so an expired timeout or
//! an interrupted run terminates them instead of leaving them behind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// A command line to execute
#[derive(Clone, Default)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `None` when killed by a signal
    pub status: Option<i32>,
    /// Captured stdout (lossy UTF-8)
    pub stdout: String,
    /// Captured stderr (lossy UTF-8)
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Environment variable for the child only. Values are never logged.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .finish()
    }
}

/// Run a command to completion, killing it if `limit` expires.
///
/// A non-zero exit is not an error here; callers inspect
/// [`CommandOutput::status`]. Errors are reserved for spawn failures and
/// timeouts.
pub async fn run(spec: &CommandSpec, limit: Duration) -> Result<CommandOutput> {
    debug!(command = %spec, timeout_secs = limit.as_secs(), "Running command");

    let mut command = Command::new(&spec.program);
    command.args(&spec.args);

    for (key, value) in &spec.env {
        command.env(key, value);
    }

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProvisionError::CommandNotFound {
                command: spec.program.clone(),
            }
        } else {
            ProvisionError::Io(e)
        }
    })?;

    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            };
            debug!(command = %spec.program, status = ?result.status, "Command finished");
            Ok(result)
        }
        Ok(Err(e)) => Err(ProvisionError::Io(e)),
        Err(_) => Err(ProvisionError::Timeout {
            operation: spec.program.clone(),
            secs: limit.as_secs(),
        }),
    }
}

/// Run a command and turn a non-zero exit into [`ProvisionError::CommandFailed`]
pub async fn run_checked(spec: &CommandSpec, limit: Duration) -> Result<CommandOutput> {
    let output = run(spec, limit).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ProvisionError::CommandFailed {
            command: spec.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Locate an executable on `PATH`
pub fn which(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
