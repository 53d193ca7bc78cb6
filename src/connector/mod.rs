// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote execution and file synchronization
//!
//! [`HostConnector`] is the seam between the orchestrator and the network.
//! [`SshConnector`] drives the system `ssh`, `sshpass` and `rsync` binaries;
//! tests substitute their own implementation.

mod rsync;
mod ssh;

pub use rsync::parse_rsync_stats;
pub use ssh::{classify_ssh_failure, SshConnector};

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::process::shell_quote;

/// Directory-name prefix for disposable verification paths
pub const VERIFY_PREFIX: &str = ".provision-verify-";

/// How to authenticate an SSH session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    Key,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password => write!(f, "password"),
            AuthMethod::Key => write!(f, "key"),
        }
    }
}

/// Connection details for one host; fixed for the duration of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostProfile {
    /// IP literal or hostname
    pub address: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Preferred authentication for routine operations
    pub auth_method: AuthMethod,
    /// Directory the edge host serves synchronized content from
    pub remote_sync_path: String,
}

impl HostProfile {
    /// Edge host profile using key authentication
    pub fn edge(
        address: impl Into<String>,
        ssh_user: impl Into<String>,
        ssh_port: u16,
        remote_sync_path: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            ssh_user: ssh_user.into(),
            ssh_port,
            auth_method: AuthMethod::Key,
            remote_sync_path: remote_sync_path.into(),
        }
    }

    /// `user@address` destination for ssh/rsync
    pub fn destination(&self) -> String {
        format!("{}@{}", self.ssh_user, self.address)
    }

    /// Reject arguments no probe could succeed with
    pub fn validate(&self) -> Result<()> {
        if !crate::store::is_valid_address(self.address.trim()) {
            return Err(ProvisionError::validation(format!(
                "'{}' is not a valid host address",
                self.address
            )));
        }
        if self.ssh_user.trim().is_empty() || self.ssh_user.contains(char::is_whitespace) {
            return Err(ProvisionError::validation(format!(
                "'{}' is not a valid SSH user",
                self.ssh_user
            )));
        }
        if self.ssh_port == 0 {
            return Err(ProvisionError::validation("SSH port cannot be 0"));
        }
        if !self.remote_sync_path.starts_with('/') {
            return Err(ProvisionError::validation(format!(
                "remote sync path '{}' must be absolute",
                self.remote_sync_path
            )));
        }
        Ok(())
    }
}

/// Why a connectivity probe failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Timeout,
    AuthRejected,
    Refused,
    Unreachable,
    HostKeyMismatch,
    /// ssh/sshpass is not installed locally
    ToolMissing,
    Other,
}

impl FailureKind {
    /// The host could not be reached at all; the credential was never tried
    pub fn is_network(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::Refused | FailureKind::Unreachable
        )
    }
}

/// Result of one connectivity probe
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityResult {
    pub method: AuthMethod,
    pub latency: Duration,
    pub succeeded: bool,
    pub failure_kind: Option<FailureKind>,
    /// Last stderr line or error text, for logs
    pub detail: String,
}

impl ConnectivityResult {
    pub fn success(method: AuthMethod, latency: Duration) -> Self {
        Self {
            method,
            latency,
            succeeded: true,
            failure_kind: None,
            detail: String::new(),
        }
    }

    /// Failed because the host was not reachable, not because of the credential
    pub fn is_network_failure(&self) -> bool {
        !self.succeeded && self.failure_kind.map_or(false, FailureKind::is_network)
    }

    pub fn failure(
        method: AuthMethod,
        latency: Duration,
        kind: FailureKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            method,
            latency,
            succeeded: false,
            failure_kind: Some(kind),
            detail: detail.into(),
        }
    }
}

/// Output of a one-shot remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Direction of an rsync transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Local to remote
    Push,
    /// Remote to local
    Pull,
}

/// Options for [`HostConnector::sync_path`]
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Delete remote files that do not exist locally (push only)
    pub mirror_delete: bool,
    /// This transfer is a round-trip check; the remote path must be a
    /// disposable `.provision-verify-*` subpath
    pub verification: bool,
    /// Extra rsync flags, e.g. from `VPS_RSYNC_OPTIONS`
    pub extra_args: Vec<String>,
    pub timeout: Duration,
}

impl SyncOptions {
    /// Mirror a directory onto the real sync target
    pub fn mirror(timeout: Duration) -> Self {
        Self {
            mirror_delete: true,
            verification: false,
            extra_args: Vec::new(),
            timeout,
        }
    }

    /// Plain copy into a disposable verification path
    pub fn verification(timeout: Duration) -> Self {
        Self {
            mirror_delete: false,
            verification: true,
            extra_args: Vec::new(),
            timeout,
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

/// Transfer counters reported by rsync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

/// Remote command execution and file transfer against one host
#[async_trait]
pub trait HostConnector: Send + Sync {
    /// Probe whether `host` accepts a session using `method`.
    ///
    /// Expected failures (timeout, rejected credentials, refused connection)
    /// come back as an unsuccessful [`ConnectivityResult`]; only malformed
    /// arguments are errors.
    async fn test_connectivity(
        &self,
        host: &HostProfile,
        method: AuthMethod,
        timeout: Duration,
    ) -> Result<ConnectivityResult>;

    /// Run `command` through the remote shell with key authentication. The
    /// session is killed when `timeout` expires.
    async fn run_remote(
        &self,
        host: &HostProfile,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput>;

    /// rsync between `local` and `remote` on `host`
    async fn sync_path(
        &self,
        host: &HostProfile,
        local: &Path,
        remote: &str,
        direction: SyncDirection,
        options: &SyncOptions,
    ) -> Result<SyncResult>;

    /// Install `public_key` in the remote `authorized_keys` over a password
    /// session. Idempotent.
    async fn deploy_public_key(
        &self,
        host: &HostProfile,
        public_key: &str,
        timeout: Duration,
    ) -> Result<()>;
}

/// Whether `remote` points inside a disposable verification directory
pub fn is_verification_path(remote: &str) -> bool {
    remote
        .split('/')
        .any(|segment| segment.starts_with(VERIFY_PREFIX) && segment.len() > VERIFY_PREFIX.len())
}

/// Fresh disposable verification directory under `base`
pub fn verification_path(base: &str) -> String {
    format!(
        "{}/{}{}",
        base.trim_end_matches('/'),
        VERIFY_PREFIX,
        uuid::Uuid::new_v4().simple()
    )
}

/// Check sync arguments before anything touches the network
pub fn validate_sync(remote: &str, options: &SyncOptions) -> Result<()> {
    if !remote.starts_with('/') {
        return Err(ProvisionError::validation(format!(
            "remote path '{}' must be absolute",
            remote
        )));
    }
    if options.verification && !is_verification_path(remote) {
        return Err(ProvisionError::validation(format!(
            "verification sync must target a {}* path, got '{}'",
            VERIFY_PREFIX, remote
        )));
    }
    Ok(())
}

const WEB_USERS: [&str; 4] = ["www-data", "nginx", "apache", "httpd"];

/// Create the remote sync directory and hand it to the web server user.
///
/// Returns the web user that now owns the directory, or `None` when no known
/// web user exists and only the generic `chmod` was applied.
pub async fn prepare_sync_target(
    connector: &dyn HostConnector,
    host: &HostProfile,
    timeout: Duration,
) -> Result<Option<String>> {
    let path = shell_quote(&host.remote_sync_path);
    let mkdir = connector
        .run_remote(host, &format!("mkdir -p {}", path), timeout)
        .await?;
    if !mkdir.success() {
        return Err(ProvisionError::CommandFailed {
            command: format!("mkdir -p {}", path),
            status: mkdir.exit_code,
            stderr: mkdir.stderr.trim().to_string(),
        });
    }

    for user in WEB_USERS {
        let command = format!(
            "id {user} >/dev/null 2>&1 && chown -R {user}:{user} {path} && chmod -R 755 {path} && echo SUCCESS:{user} || echo FAILED:{user}"
        );
        let output = connector.run_remote(host, &command, timeout).await?;
        if output.success() && output.stdout.contains(&format!("SUCCESS:{}", user)) {
            info!(host = %host.address, web_user = user, "Sync target ownership fixed");
            return Ok(Some(user.to_string()));
        }
    }

    warn!(host = %host.address, "No known web server user on edge host, applying generic permissions");
    let output = connector
        .run_remote(host, &format!("chmod -R 755 {}", path), timeout)
        .await?;
    if !output.success() {
        return Err(ProvisionError::CommandFailed {
            command: format!("chmod -R 755 {}", path),
            status: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(None)
}
