// SPDX-License-Identifier: AGPL-3.0-or-later
//! [`HostConnector`] backed by the system OpenSSH client, sshpass and rsync

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    parse_rsync_stats, validate_sync, AuthMethod, ConnectivityResult, FailureKind, HostConnector,
    HostProfile, RemoteOutput, SyncDirection, SyncOptions, SyncResult,
};
use crate::error::{AuthSide, ProvisionError, Result};
use crate::process::{self, shell_quote, CommandSpec};

/// sshpass exit status for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// sshpass exit status for an unknown or changed host key
const SSHPASS_HOST_KEY: i32 = 6;
/// ssh exit status for its own (connection/auth) errors
const SSH_ERROR: i32 = 255;

/// Connector that shells out to `ssh`, `sshpass` and `rsync`
pub struct SshConnector {
    key_path: PathBuf,
    password: Option<String>,
    connect_timeout: Duration,
}

impl fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnector")
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl SshConnector {
    /// Create a connector using the private key at `key_path`
    pub fn new(key_path: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            key_path: key_path.into(),
            password: None,
            connect_timeout,
        }
    }

    /// Password for bootstrap sessions, supplied for this run only
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    fn ssh_options(&self, host: &HostProfile, method: AuthMethod) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            host.ssh_port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        match method {
            AuthMethod::Key => args.extend([
                "-i".to_string(),
                self.key_path.display().to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
            ]),
            AuthMethod::Password => args.extend([
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
                "-o".to_string(),
                "NumberOfPasswordPrompts=1".to_string(),
            ]),
        }
        args
    }

    fn ssh_command(&self, host: &HostProfile, method: AuthMethod, remote: &str) -> Result<CommandSpec> {
        let base = match method {
            AuthMethod::Key => CommandSpec::new("ssh"),
            AuthMethod::Password => {
                let password = self.password.as_ref().ok_or_else(|| {
                    ProvisionError::validation("password authentication requested but no password was supplied")
                })?;
                CommandSpec::new("sshpass")
                    .arg("-e")
                    .arg("ssh")
                    .env("SSHPASS", password.as_str())
            }
        };
        Ok(base
            .args(self.ssh_options(host, method))
            .arg(host.destination())
            .arg(remote))
    }

    /// `-e` argument for rsync
    fn rsync_shell(&self, host: &HostProfile) -> String {
        self.ssh_options(host, AuthMethod::Key)
            .iter()
            .map(|a| shell_quote(a))
            .fold("ssh".to_string(), |acc, a| format!("{} {}", acc, a))
    }
}

/// Classify a failed ssh/sshpass invocation from its exit status and stderr
pub fn classify_ssh_failure(status: Option<i32>, stderr: &str) -> FailureKind {
    let text = stderr.to_ascii_lowercase();

    if status == Some(SSHPASS_BAD_PASSWORD) || text.contains("permission denied") {
        FailureKind::AuthRejected
    } else if status == Some(SSHPASS_HOST_KEY)
        || text.contains("host key verification failed")
        || text.contains("remote host identification has changed")
    {
        FailureKind::HostKeyMismatch
    } else if text.contains("connection refused") {
        FailureKind::Refused
    } else if text.contains("timed out") {
        FailureKind::Timeout
    } else if text.contains("no route to host")
        || text.contains("could not resolve hostname")
        || text.contains("network is unreachable")
        || text.contains("name or service not known")
    {
        FailureKind::Unreachable
    } else {
        FailureKind::Other
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Typed error for an ssh-level (not remote command) failure
fn session_error(host: &HostProfile, method: AuthMethod, status: Option<i32>, stderr: &str) -> ProvisionError {
    match classify_ssh_failure(status, stderr) {
        FailureKind::AuthRejected => ProvisionError::Authentication {
            side: match method {
                AuthMethod::Key => AuthSide::Key,
                AuthMethod::Password => AuthSide::Password,
            },
            host: host.address.clone(),
            message: last_line(stderr),
        },
        _ => ProvisionError::Connectivity {
            host: host.address.clone(),
            message: last_line(stderr),
        },
    }
}

#[async_trait]
impl HostConnector for SshConnector {
    async fn test_connectivity(
        &self,
        host: &HostProfile,
        method: AuthMethod,
        timeout: Duration,
    ) -> Result<ConnectivityResult> {
        host.validate()?;
        let spec = self.ssh_command(host, method, "true")?;

        let started = Instant::now();
        let outcome = process::run(&spec, timeout).await;
        let latency = started.elapsed();

        let result = match outcome {
            Ok(output) if output.success() => ConnectivityResult::success(method, latency),
            Ok(output) => ConnectivityResult::failure(
                method,
                latency,
                classify_ssh_failure(output.status, &output.stderr),
                last_line(&output.stderr),
            ),
            Err(ProvisionError::Timeout { secs, .. }) => ConnectivityResult::failure(
                method,
                latency,
                FailureKind::Timeout,
                format!("no answer within {} seconds", secs),
            ),
            Err(ProvisionError::CommandNotFound { command }) => ConnectivityResult::failure(
                method,
                latency,
                FailureKind::ToolMissing,
                format!("{} is not installed", command),
            ),
            Err(e) => return Err(e),
        };

        debug!(
            host = %host.address,
            method = %method,
            succeeded = result.succeeded,
            failure = ?result.failure_kind,
            latency_ms = latency.as_millis() as u64,
            "Connectivity probe"
        );
        Ok(result)
    }

    async fn run_remote(
        &self,
        host: &HostProfile,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput> {
        host.validate()?;
        let spec = self.ssh_command(host, AuthMethod::Key, command)?;
        let output = process::run(&spec, timeout).await?;

        if output.status == Some(SSH_ERROR) {
            return Err(session_error(host, AuthMethod::Key, output.status, &output.stderr));
        }

        Ok(RemoteOutput {
            exit_code: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn sync_path(
        &self,
        host: &HostProfile,
        local: &Path,
        remote: &str,
        direction: SyncDirection,
        options: &SyncOptions,
    ) -> Result<SyncResult> {
        host.validate()?;
        validate_sync(remote, options)?;

        let mut spec = CommandSpec::new("rsync")
            .arg("-az")
            .arg("--stats")
            .args(options.extra_args.iter().cloned());
        if options.mirror_delete && direction == SyncDirection::Push {
            spec = spec.arg("--delete");
        }
        spec = spec.arg("-e").arg(self.rsync_shell(host));

        let mut local_arg = local.display().to_string();
        if direction == SyncDirection::Push && local.is_dir() && !local_arg.ends_with('/') {
            local_arg.push('/');
        }
        let remote_arg = format!("{}:{}", host.destination(), remote);

        spec = match direction {
            SyncDirection::Push => spec.arg(local_arg).arg(remote_arg),
            SyncDirection::Pull => spec.arg(remote_arg).arg(local_arg),
        };

        let output = process::run(&spec, options.timeout).await?;
        if !output.success() {
            let kind = classify_ssh_failure(output.status, &output.stderr);
            return Err(match kind {
                FailureKind::Other => ProvisionError::CommandFailed {
                    command: "rsync".to_string(),
                    status: output.status,
                    stderr: last_line(&output.stderr),
                },
                _ => session_error(host, AuthMethod::Key, output.status, &output.stderr),
            });
        }

        let result = parse_rsync_stats(&output.stdout);
        info!(
            host = %host.address,
            direction = ?direction,
            remote = %remote,
            files = result.files_transferred,
            bytes = result.bytes_transferred,
            "Sync finished"
        );
        Ok(result)
    }

    async fn deploy_public_key(
        &self,
        host: &HostProfile,
        public_key: &str,
        timeout: Duration,
    ) -> Result<()> {
        host.validate()?;
        let key = public_key.trim();
        if !key.starts_with("ssh-") || key.contains('\n') {
            return Err(ProvisionError::validation("refusing to deploy a malformed public key"));
        }

        let quoted = shell_quote(key);
        let script = format!(
            "umask 077; mkdir -p ~/.ssh && touch ~/.ssh/authorized_keys && \
             (grep -qxF {key} ~/.ssh/authorized_keys || printf '%s\\n' {key} >> ~/.ssh/authorized_keys) && \
             chmod 700 ~/.ssh && chmod 600 ~/.ssh/authorized_keys",
            key = quoted
        );

        let spec = self.ssh_command(host, AuthMethod::Password, &script)?;
        let output = process::run(&spec, timeout).await?;

        if output.success() {
            info!(host = %host.address, user = %host.ssh_user, "Public key installed on edge host");
            return Ok(());
        }

        warn!(host = %host.address, status = ?output.status, "Public key deployment failed");
        if output.status == Some(SSH_ERROR) || output.status == Some(SSHPASS_BAD_PASSWORD) || output.status == Some(SSHPASS_HOST_KEY) {
            Err(session_error(host, AuthMethod::Password, output.status, &output.stderr))
        } else {
            Err(ProvisionError::CommandFailed {
                command: "authorized_keys update".to_string(),
                status: output.status,
                stderr: last_line(&output.stderr),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostProfile {
        HostProfile::edge("203.0.113.9", "root", 2222, "/var/www/html")
    }

    #[test]
    fn test_classify_failures() {
        assert_eq!(
            classify_ssh_failure(Some(255), "root@203.0.113.9: Permission denied (publickey)."),
            FailureKind::AuthRejected
        );
        assert_eq!(classify_ssh_failure(Some(5), ""), FailureKind::AuthRejected);
        assert_eq!(
            classify_ssh_failure(Some(255), "ssh: connect to host 203.0.113.9 port 22: Connection refused"),
            FailureKind::Refused
        );
        assert_eq!(
            classify_ssh_failure(Some(255), "ssh: connect to host 203.0.113.9 port 22: Connection timed out"),
            FailureKind::Timeout
        );
        assert_eq!(
            classify_ssh_failure(Some(255), "ssh: Could not resolve hostname edge: Name or service not known"),
            FailureKind::Unreachable
        );
        assert_eq!(
            classify_ssh_failure(Some(255), "Host key verification failed."),
            FailureKind::HostKeyMismatch
        );
        assert_eq!(classify_ssh_failure(Some(1), "weird"), FailureKind::Other);
    }

    #[test]
    fn test_key_command_line() {
        let connector = SshConnector::new("/root/.ssh/edge", Duration::from_secs(10));
        let spec = connector.ssh_command(&host(), AuthMethod::Key, "true").unwrap();
        assert_eq!(spec.program(), "ssh");
        let args = spec.arguments();
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/root/.ssh/edge".to_string()));
        assert_eq!(args[args.len() - 2], "root@203.0.113.9");
        assert_eq!(args[args.len() - 1], "true");
    }

    #[test]
    fn test_password_command_keeps_secret_out_of_argv() {
        let connector = SshConnector::new("/root/.ssh/edge", Duration::from_secs(10))
            .with_password(Some("s3cret".to_string()));
        let spec = connector.ssh_command(&host(), AuthMethod::Password, "true").unwrap();
        assert_eq!(spec.program(), "sshpass");
        assert!(!spec.arguments().iter().any(|a| a.contains("s3cret")));
        assert!(!format!("{:?}", connector).contains("s3cret"));
    }

    #[test]
    fn test_password_command_requires_password() {
        let connector = SshConnector::new("/root/.ssh/edge", Duration::from_secs(10)).with_password(Some(String::new()));
        assert!(connector.ssh_command(&host(), AuthMethod::Password, "true").is_err());
    }

    #[tokio::test]
    async fn test_malformed_host_is_an_error() {
        let connector = SshConnector::new("/root/.ssh/edge", Duration::from_secs(1));
        let mut bad = host();
        bad.ssh_port = 0;
        assert!(connector
            .test_connectivity(&bad, AuthMethod::Key, Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_verification_sync_refuses_production_path() {
        let connector = SshConnector::new("/root/.ssh/edge", Duration::from_secs(1));
        let err = connector
            .sync_path(
                &host(),
                Path::new("/tmp"),
                "/var/www/html",
                SyncDirection::Push,
                &SyncOptions::verification(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation { .. }));
    }

    #[test]
    fn test_rsync_shell_uses_key() {
        let connector = SshConnector::new("/root/.ssh/edge", Duration::from_secs(10));
        let shell = connector.rsync_shell(&host());
        assert!(shell.starts_with("ssh -p 2222"));
        assert!(shell.contains("-i /root/.ssh/edge"));
    }
}
