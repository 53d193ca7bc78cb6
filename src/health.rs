// SPDX-License-Identifier: AGPL-3.0-or-later
//! Post-deployment smoke tests

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connector::{
    is_verification_path, verification_path, HostConnector, HostProfile, SyncDirection,
    SyncOptions, SyncResult,
};
use crate::error::{ProvisionError, Result};
use crate::process::shell_quote;

const MARKER_NAME: &str = "provision-marker.txt";

/// One HTTP health request
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` when `url` answers with a 2xx status within `timeout`
    async fn check(&self, url: &str, timeout: Duration) -> bool;
}

/// [`HealthProbe`] backed by reqwest
#[derive(Debug, Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                debug!(url = %url, status = %response.status(), "Health check");
                ok
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }
}

/// Outcome of a synchronization round trip
#[derive(Debug, Clone, Serialize)]
pub struct SyncCheck {
    pub remote_path: String,
    pub pushed: SyncResult,
    pub pulled: SyncResult,
    /// Pulled bytes equal the pushed marker
    pub matched: bool,
    /// The disposable remote directory was removed
    pub cleaned_up: bool,
}

pub struct HealthVerifier {
    probe: Arc<dyn HealthProbe>,
    connector: Arc<dyn HostConnector>,
    timeout: Duration,
}

impl HealthVerifier {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        connector: Arc<dyn HostConnector>,
        timeout: Duration,
    ) -> Self {
        Self {
            probe,
            connector,
            timeout,
        }
    }

    /// Single bounded check of a primary-host endpoint
    pub async fn check_local(&self, url: &str) -> bool {
        self.probe.check(url, self.timeout).await
    }

    /// Single bounded check of a public edge endpoint
    pub async fn check_remote(&self, url: &str) -> bool {
        self.probe.check(url, self.timeout).await
    }

    /// Push a unique marker to a disposable remote directory, pull it back into
    /// a different local directory and compare bytes. The remote directory is
    /// removed on every exit path; the local ones go with their `TempDir`.
    pub async fn verify_sync_round_trip(
        &self,
        host: &HostProfile,
        sync_timeout: Duration,
    ) -> Result<SyncCheck> {
        let remote_path = verification_path(&host.remote_sync_path);
        let result = self.round_trip(host, &remote_path, sync_timeout).await;
        let cleaned_up = self.remove_remote(host, &remote_path).await;

        let (pushed, pulled, matched) = result?;
        if matched {
            info!(host = %host.address, files = pulled.files_transferred, "Sync round trip verified");
        } else {
            warn!(host = %host.address, remote = %remote_path, "Sync round trip returned different bytes");
        }
        Ok(SyncCheck {
            remote_path,
            pushed,
            pulled,
            matched,
            cleaned_up,
        })
    }

    async fn round_trip(
        &self,
        host: &HostProfile,
        remote_path: &str,
        sync_timeout: Duration,
    ) -> Result<(SyncResult, SyncResult, bool)> {
        let outbound = tempfile::Builder::new().prefix("provision-push-").tempdir()?;
        let inbound = tempfile::Builder::new().prefix("provision-pull-").tempdir()?;

        let marker = format!(
            "imgserv provisioning check {} {}\n",
            uuid::Uuid::new_v4(),
            chrono::Utc::now().to_rfc3339()
        );
        tokio::fs::write(outbound.path().join(MARKER_NAME), marker.as_bytes()).await?;

        let options = SyncOptions::verification(sync_timeout);
        let pushed = self
            .connector
            .sync_path(host, outbound.path(), remote_path, SyncDirection::Push, &options)
            .await?;
        let pulled = self
            .connector
            .sync_path(
                host,
                inbound.path(),
                &format!("{}/", remote_path),
                SyncDirection::Pull,
                &options,
            )
            .await?;

        let returned = read_marker(&inbound.path().join(MARKER_NAME)).await?;
        Ok((pushed, pulled, returned.as_deref() == Some(marker.as_bytes())))
    }

    async fn remove_remote(&self, host: &HostProfile, remote_path: &str) -> bool {
        if !is_verification_path(remote_path) {
            return false;
        }
        let command = format!("rm -rf {}", shell_quote(remote_path));
        match self.connector.run_remote(host, &command, self.timeout).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(remote = %remote_path, stderr = %output.stderr.trim(), "Could not remove verification directory");
                false
            }
            Err(e) => {
                warn!(remote = %remote_path, error = %e, "Could not remove verification directory");
                false
            }
        }
    }
}

async fn read_marker(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProvisionError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{AuthMethod, ConnectivityResult, RemoteOutput};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Edge host simulated by a local directory
    struct DirectoryEdge {
        root: TempDir,
        fail_pull: bool,
        corrupt: bool,
        commands: Mutex<Vec<String>>,
    }

    impl DirectoryEdge {
        fn new(fail_pull: bool, corrupt: bool) -> Arc<Self> {
            Arc::new(Self {
                root: TempDir::new().unwrap(),
                fail_pull,
                corrupt,
                commands: Mutex::new(Vec::new()),
            })
        }

        fn local(&self, remote: &str) -> PathBuf {
            self.root.path().join(remote.trim_start_matches('/').trim_end_matches('/'))
        }

        fn copy_dir(from: &Path, to: &Path) -> u64 {
            std::fs::create_dir_all(to).unwrap();
            let mut files = 0;
            for entry in std::fs::read_dir(from).unwrap() {
                let entry = entry.unwrap();
                std::fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
                files += 1;
            }
            files
        }
    }

    #[async_trait]
    impl HostConnector for DirectoryEdge {
        async fn test_connectivity(
            &self,
            _host: &HostProfile,
            method: AuthMethod,
            _timeout: Duration,
        ) -> Result<ConnectivityResult> {
            Ok(ConnectivityResult::success(method, Duration::from_millis(1)))
        }

        async fn run_remote(
            &self,
            _host: &HostProfile,
            command: &str,
            _timeout: Duration,
        ) -> Result<RemoteOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            if let Some(path) = command.strip_prefix("rm -rf ") {
                let _ = std::fs::remove_dir_all(self.local(path.trim_matches('\'')));
            }
            Ok(RemoteOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn sync_path(
            &self,
            _host: &HostProfile,
            local: &Path,
            remote: &str,
            direction: SyncDirection,
            options: &SyncOptions,
        ) -> Result<SyncResult> {
            crate::connector::validate_sync(remote, options)?;
            let files = match direction {
                SyncDirection::Push => Self::copy_dir(local, &self.local(remote)),
                SyncDirection::Pull => {
                    if self.fail_pull {
                        return Err(ProvisionError::Timeout {
                            operation: "rsync".to_string(),
                            secs: 1,
                        });
                    }
                    let files = Self::copy_dir(&self.local(remote), local);
                    if self.corrupt {
                        std::fs::write(local.join(MARKER_NAME), b"garbage").unwrap();
                    }
                    files
                }
            };
            Ok(SyncResult {
                files_transferred: files,
                bytes_transferred: 0,
            })
        }

        async fn deploy_public_key(
            &self,
            _host: &HostProfile,
            _public_key: &str,
            _timeout: Duration,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct FixedProbe(bool);

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn check(&self, _url: &str, _timeout: Duration) -> bool {
            self.0
        }
    }

    fn verifier(edge: Arc<DirectoryEdge>) -> HealthVerifier {
        HealthVerifier::new(Arc::new(FixedProbe(true)), edge, Duration::from_secs(5))
    }

    fn host() -> HostProfile {
        HostProfile::edge("203.0.113.9", "root", 22, "/var/www/html")
    }

    fn remote_leftovers(edge: &DirectoryEdge) -> usize {
        match std::fs::read_dir(edge.local("/var/www/html")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn test_round_trip_matches_and_cleans_up() {
        let edge = DirectoryEdge::new(false, false);
        let check = verifier(edge.clone())
            .verify_sync_round_trip(&host(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(check.matched);
        assert!(check.cleaned_up);
        assert_eq!(check.pushed.files_transferred, 1);
        assert!(is_verification_path(&check.remote_path));
        assert_eq!(remote_leftovers(&edge), 0);
    }

    #[tokio::test]
    async fn test_corrupted_pull_is_reported() {
        let edge = DirectoryEdge::new(false, true);
        let check = verifier(edge.clone())
            .verify_sync_round_trip(&host(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!check.matched);
        assert_eq!(remote_leftovers(&edge), 0);
    }

    #[tokio::test]
    async fn test_failed_pull_still_removes_remote_directory() {
        let edge = DirectoryEdge::new(true, false);
        let result = verifier(edge.clone())
            .verify_sync_round_trip(&host(), Duration::from_secs(5))
            .await;

        assert!(result.is_err());
        let commands = edge.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("rm -rf /var/www/html/.provision-verify-"));
        assert_eq!(remote_leftovers(&edge), 0);
    }

    #[tokio::test]
    async fn test_probe_results_pass_through() {
        let down = HealthVerifier::new(
            Arc::new(FixedProbe(false)),
            DirectoryEdge::new(false, false),
            Duration::from_secs(1),
        );
        assert!(!down.check_local("http://127.0.0.1:8080/health").await);
        assert!(!down.check_remote("https://cam.example.org/").await);
    }
}
