// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end orchestrator runs against stub collaborators

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use imgserv_provision::certs::CertificateBackend;
use imgserv_provision::connector::{
    validate_sync, AuthMethod, ConnectivityResult, FailureKind, HostConnector, HostProfile,
    RemoteOutput, SyncDirection, SyncOptions, SyncResult,
};
use imgserv_provision::dns::Resolver;
use imgserv_provision::error::{exit, ErrorKind, ProvisionError, Result};
use imgserv_provision::health::HealthProbe;
use imgserv_provision::input::ProvisionInputs;
use imgserv_provision::orchestrator::{
    EdgeAction, PrimaryHost, ProvisioningState, Stage,
};
use imgserv_provision::{Collaborators, Orchestrator, Settings};

/// Edge host simulated by a local directory
struct StubEdge {
    root: TempDir,
    key_auth: AtomicBool,
    password_ok: bool,
    /// Key probes that time out before the host starts answering
    key_timeouts: AtomicU32,
    key_probes: AtomicU32,
    deployed_keys: Mutex<Vec<String>>,
}

impl StubEdge {
    fn new(key_auth: bool, password_ok: bool) -> Arc<Self> {
        Self::slow_to_answer(key_auth, password_ok, 0)
    }

    fn slow_to_answer(key_auth: bool, password_ok: bool, key_timeouts: u32) -> Arc<Self> {
        Arc::new(Self {
            root: TempDir::new().unwrap(),
            key_auth: AtomicBool::new(key_auth),
            password_ok,
            key_timeouts: AtomicU32::new(key_timeouts),
            key_probes: AtomicU32::new(0),
            deployed_keys: Mutex::new(Vec::new()),
        })
    }

    fn local(&self, remote: &str) -> PathBuf {
        self.root
            .path()
            .join(remote.trim_start_matches('/').trim_end_matches('/'))
    }

    fn copy_files(from: &Path, to: &Path) -> u64 {
        std::fs::create_dir_all(to).unwrap();
        let mut files = 0;
        for entry in std::fs::read_dir(from).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_file() {
                std::fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
                files += 1;
            }
        }
        files
    }
}

#[async_trait]
impl HostConnector for StubEdge {
    async fn test_connectivity(
        &self,
        _host: &HostProfile,
        method: AuthMethod,
        _timeout: Duration,
    ) -> Result<ConnectivityResult> {
        if method == AuthMethod::Key {
            self.key_probes.fetch_add(1, Ordering::SeqCst);
            let pending = self.key_timeouts.load(Ordering::SeqCst);
            if pending > 0 {
                self.key_timeouts.store(pending - 1, Ordering::SeqCst);
                return Ok(ConnectivityResult::failure(
                    method,
                    Duration::from_secs(10),
                    FailureKind::Timeout,
                    "Connection timed out during banner exchange",
                ));
            }
        }
        let ok = match method {
            AuthMethod::Key => self.key_auth.load(Ordering::SeqCst),
            AuthMethod::Password => self.password_ok,
        };
        if ok {
            Ok(ConnectivityResult::success(method, Duration::from_millis(3)))
        } else {
            Ok(ConnectivityResult::failure(
                method,
                Duration::from_millis(3),
                FailureKind::AuthRejected,
                "Permission denied",
            ))
        }
    }

    async fn run_remote(
        &self,
        _host: &HostProfile,
        command: &str,
        _timeout: Duration,
    ) -> Result<RemoteOutput> {
        let mut stdout = String::new();
        if let Some(path) = command.strip_prefix("rm -rf ") {
            let _ = std::fs::remove_dir_all(self.local(path.trim_matches('\'')));
        } else if command.contains("SUCCESS:www-data") {
            stdout.push_str("SUCCESS:www-data\n");
        }
        Ok(RemoteOutput {
            exit_code: Some(0),
            stdout,
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
        validate_sync(remote, options)?;
        let files = match direction {
            SyncDirection::Push => Self::copy_files(local, &self.local(remote)),
            SyncDirection::Pull => Self::copy_files(&self.local(remote), local),
        };
        Ok(SyncResult {
            files_transferred: files,
            bytes_transferred: 0,
        })
    }

    async fn deploy_public_key(
        &self,
        _host: &HostProfile,
        public_key: &str,
        _timeout: Duration,
    ) -> Result<()> {
        if !self.password_ok {
            return Err(ProvisionError::Authentication {
                side: imgserv_provision::error::AuthSide::Password,
                host: "203.0.113.9".to_string(),
                message: "Permission denied".to_string(),
            });
        }
        self.deployed_keys.lock().unwrap().push(public_key.to_string());
        self.key_auth.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct StubResolver {
    answer: String,
    queries: AtomicU32,
}

#[async_trait]
impl Resolver for StubResolver {
    async fn resolve(&self, _domain: &str) -> Result<Vec<String>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(vec![format!("{}.", self.answer)])
    }

    fn server(&self) -> &str {
        "1.1.1.1"
    }
}

#[derive(Clone, Copy)]
enum IssuanceFailure {
    Certbot,
    RateLimited,
}

#[derive(Default)]
struct StubCertificates {
    installed: AtomicBool,
    requests: AtomicU32,
    failure: Option<IssuanceFailure>,
}

impl StubCertificates {
    fn failing(failure: IssuanceFailure) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(failure),
            ..Self::default()
        })
    }
}

#[async_trait]
impl CertificateBackend for StubCertificates {
    async fn existing_valid(&self, _host: &HostProfile, _domain: &str, _days: u32) -> Result<bool> {
        Ok(self.installed.load(Ordering::SeqCst))
    }

    async fn request(&self, _host: &HostProfile, _domain: &str, _email: &str) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match self.failure {
            Some(IssuanceFailure::Certbot) => Err(ProvisionError::CommandFailed {
                command: "certbot --nginx".to_string(),
                status: Some(1),
                stderr: "Challenge failed for domain cam.example.org".to_string(),
            }),
            Some(IssuanceFailure::RateLimited) => Err(ProvisionError::RateLimited {
                message: "too many certificates already issued".to_string(),
            }),
            None => {
                self.installed.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

struct Healthy;

#[async_trait]
impl HealthProbe for Healthy {
    async fn check(&self, _url: &str, _timeout: Duration) -> bool {
        true
    }
}

#[derive(Default)]
struct StubPrimary {
    restarts: AtomicU32,
}

#[async_trait]
impl PrimaryHost for StubPrimary {
    async fn missing_dependencies(&self, _required: &[&str]) -> Vec<String> {
        Vec::new()
    }

    async fn install_packages(&self, _packages: &[String]) -> Result<()> {
        Ok(())
    }

    async fn repository_present(&self) -> bool {
        true
    }

    async fn acquire_repository(&self) -> Result<()> {
        Ok(())
    }

    async fn restart_service(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    edge: Arc<StubEdge>,
    resolver: Arc<StubResolver>,
    certificates: Arc<StubCertificates>,
    primary: Arc<StubPrimary>,
}

impl Harness {
    fn new(edge: Arc<StubEdge>, dns_answer: &str) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            edge,
            resolver: Arc::new(StubResolver {
                answer: dns_answer.to_string(),
                queries: AtomicU32::new(0),
            }),
            certificates: Arc::new(StubCertificates::default()),
            primary: Arc::new(StubPrimary::default()),
        }
    }

    fn with_certificates(mut self, certificates: Arc<StubCertificates>) -> Self {
        self.certificates = certificates;
        self
    }

    fn env_file(&self) -> PathBuf {
        self.dir.path().join("imgserv.env")
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.paths.env_file = self.env_file();
        settings.paths.key_path = self.dir.path().join("keys/edge_ed25519");
        settings.paths.install_dir = self.dir.path().join("imgserv");
        settings.paths.lock_file = self.dir.path().join("provision.lock");
        settings.dns.max_attempts = 3;
        settings.dns.interval_secs = 0;
        settings.tls.backoff_secs = 0;
        settings.service.health_interval_secs = 0;
        settings.ssh.connect_retry_secs = 0;
        settings
    }

    fn orchestrator(&self) -> Orchestrator {
        let collaborators = Collaborators {
            connector: self.edge.clone(),
            resolver: self.resolver.clone(),
            certificates: self.certificates.clone(),
            probe: Arc::new(Healthy),
            primary: self.primary.clone(),
        };
        Orchestrator::new(self.settings(), collaborators)
    }

    fn write_env(&self, contents: &str) {
        std::fs::write(self.env_file(), contents).unwrap();
    }

    fn read_env(&self) -> String {
        std::fs::read_to_string(self.env_file()).unwrap()
    }
}

fn full_inputs() -> ProvisionInputs {
    ProvisionInputs {
        domain: Some("cam.example.org".to_string()),
        email: Some("ops@example.org".to_string()),
        vps_ip: Some("203.0.113.9".to_string()),
        ..ProvisionInputs::default()
    }
}

#[tokio::test]
async fn test_password_only_edge_is_bootstrapped() {
    let harness = Harness::new(StubEdge::new(false, true), "203.0.113.9");
    harness.write_env("VPS_HOST=203.0.113.9\nVPS_USER=root\n");

    let inputs = ProvisionInputs {
        vps_password: Some("first-boot".to_string()),
        ..ProvisionInputs::default()
    };
    let report = harness.orchestrator().run(&inputs).await;

    assert_eq!(
        report.bootstrap_actions,
        vec![EdgeAction::DeployKey, EdgeAction::ReprobeKeyAuth]
    );
    assert_eq!(report.final_state, ProvisioningState::Reached(Stage::EdgeVerified));
    assert_eq!(report.exit_code, exit::SUCCESS);

    let deployed = harness.edge.deployed_keys.lock().unwrap().clone();
    assert_eq!(deployed.len(), 1);
    assert!(deployed[0].starts_with("ssh-ed25519 "));

    let env = harness.read_env();
    assert!(env.contains("VPS_HOST=203.0.113.9"));
    assert!(env.contains("VPS_ENABLED=true"));
    assert!(env.contains("VPS_RSYNC_OPTIONS=\"-avz --delete\""));
}

#[tokio::test]
async fn test_repeated_runs_are_idempotent() {
    let harness = Harness::new(StubEdge::new(true, false), "203.0.113.9");
    harness.write_env("# operator notes\nCUSTOM_X=1\n");
    let inputs = full_inputs();

    let first = harness.orchestrator().run(&inputs).await;
    assert_eq!(first.final_state, ProvisioningState::Reached(Stage::Complete));
    assert_eq!(first.exit_code, exit::SUCCESS);
    let after_first = harness.read_env();

    let second = harness.orchestrator().run(&inputs).await;
    assert_eq!(second.final_state, ProvisioningState::Reached(Stage::Complete));
    assert_eq!(harness.read_env(), after_first);

    assert!(after_first.starts_with("# operator notes\nCUSTOM_X=1\n"));
    assert_eq!(harness.certificates.requests.load(Ordering::SeqCst), 1);
    assert!(second.bootstrap_actions.is_empty());

    let observed = |stage: Stage| {
        second
            .transitions
            .iter()
            .find(|t| t.to == ProvisioningState::Reached(stage))
            .map(|t| t.observed)
    };
    assert_eq!(observed(Stage::LocallyBootstrapped), Some(true));
    assert_eq!(observed(Stage::EdgeKeyDeployed), Some(true));
    assert_eq!(observed(Stage::TlsIssued), Some(true));
}

#[tokio::test]
async fn test_single_host_run_ends_locally_bootstrapped() {
    let harness = Harness::new(StubEdge::new(false, false), "203.0.113.9");

    let report = harness.orchestrator().run(&ProvisionInputs::default()).await;

    assert_eq!(
        report.final_state,
        ProvisioningState::Reached(Stage::LocallyBootstrapped)
    );
    assert_eq!(report.exit_code, exit::SUCCESS);
    let env = harness.read_env();
    assert!(env.contains("HOST=0.0.0.0"));
    assert!(env.contains("ENVIRONMENT=development"));
    assert!(harness.dir.path().join("keys/edge_ed25519").exists());
    assert!(harness.dir.path().join("keys/edge_ed25519.pub").exists());
    assert!(!harness.dir.path().join("provision.lock").exists());
}

#[tokio::test]
async fn test_unreachable_edge_without_password_is_degraded() {
    let harness = Harness::new(StubEdge::new(false, false), "203.0.113.9");
    harness.write_env("VPS_HOST=203.0.113.9\n");

    let report = harness.orchestrator().run(&ProvisionInputs::default()).await;

    assert_eq!(report.exit_code, exit::DEGRADED);
    assert_eq!(report.reached, Stage::LocallyBootstrapped);
    let failure = report.failure().unwrap();
    assert_eq!(failure.target, Stage::EdgeKeyDeployed);
    assert!(failure
        .remediation
        .as_deref()
        .unwrap()
        .contains("ssh-copy-id"));
    assert!(report.bootstrap_actions.is_empty());
}

#[tokio::test]
async fn test_dns_timeout_blocks_tls() {
    let harness = Harness::new(StubEdge::new(true, false), "198.51.100.1");

    let report = harness.orchestrator().run(&full_inputs()).await;

    assert_eq!(report.exit_code, exit::TLS);
    assert_eq!(report.reached, Stage::EdgeVerified);
    let failure = report.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Precondition);
    assert_eq!(
        failure.remediation.as_deref(),
        Some("dig +short @1.1.1.1 cam.example.org A")
    );
    assert_eq!(harness.resolver.queries.load(Ordering::SeqCst), 3);
    assert_eq!(harness.certificates.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_input_changes_nothing() {
    let harness = Harness::new(StubEdge::new(true, false), "203.0.113.9");
    let inputs = ProvisionInputs {
        vps_ip: Some("not an address".to_string()),
        ..ProvisionInputs::default()
    };

    let report = harness.orchestrator().run(&inputs).await;

    assert_eq!(report.exit_code, exit::VALIDATION);
    assert!(report.transitions.is_empty());
    assert!(!harness.env_file().exists());
    assert!(!harness.dir.path().join("keys").exists());
}

#[tokio::test]
async fn test_live_lock_refuses_second_run() {
    let harness = Harness::new(StubEdge::new(true, false), "203.0.113.9");
    let lock = serde_json::json!({
        "pid": std::process::id(),
        "acquired_at": chrono::Utc::now(),
        "step": "edge-verified",
    });
    std::fs::write(harness.dir.path().join("provision.lock"), lock.to_string()).unwrap();

    let report = harness.orchestrator().run(&ProvisionInputs::default()).await;

    assert_eq!(report.exit_code, exit::VALIDATION);
    assert!(!harness.env_file().exists());
}

#[tokio::test]
async fn test_production_restarts_service() {
    let harness = Harness::new(StubEdge::new(false, false), "203.0.113.9");
    let inputs = ProvisionInputs {
        camera_pass: Some("a-real-password".to_string()),
        production: true,
        ..ProvisionInputs::default()
    };

    let report = harness.orchestrator().run(&inputs).await;

    assert_eq!(report.exit_code, exit::SUCCESS);
    assert_eq!(harness.primary.restarts.load(Ordering::SeqCst), 1);
    let env = harness.read_env();
    assert!(env.contains("ENVIRONMENT=production"));
    assert!(env.contains("CAMERA_PASSWORD=a-real-password"));
}

#[tokio::test]
async fn test_edge_answering_after_timeout_is_verified() {
    let harness = Harness::new(StubEdge::slow_to_answer(true, false, 1), "203.0.113.9");
    harness.write_env("VPS_ENABLED=true\nVPS_HOST=203.0.113.9\n");

    let report = harness.orchestrator().run(&ProvisionInputs::default()).await;

    assert_eq!(report.final_state, ProvisioningState::Reached(Stage::EdgeVerified));
    assert_eq!(report.exit_code, exit::SUCCESS);
    assert_eq!(harness.edge.key_probes.load(Ordering::SeqCst), 2);
    assert!(report.bootstrap_actions.is_empty());
}

#[tokio::test]
async fn test_silent_edge_is_degraded_as_connectivity() {
    let harness = Harness::new(StubEdge::slow_to_answer(true, true, 100), "203.0.113.9");
    harness.write_env("VPS_ENABLED=true\nVPS_HOST=203.0.113.9\n");
    let inputs = ProvisionInputs {
        vps_password: Some("first-boot".to_string()),
        ..ProvisionInputs::default()
    };

    let report = harness.orchestrator().run(&inputs).await;

    assert_eq!(report.exit_code, exit::DEGRADED);
    assert_eq!(report.reached, Stage::LocallyBootstrapped);
    let failure = report.failure().unwrap();
    assert_eq!(failure.target, Stage::EdgeKeyDeployed);
    assert_eq!(failure.kind, ErrorKind::Connectivity);
    let remediation = failure.remediation.as_deref().unwrap();
    assert!(remediation.contains("did not answer"));
    assert!(!remediation.contains("ssh-copy-id"));
    assert_eq!(
        harness.edge.key_probes.load(Ordering::SeqCst),
        Settings::default().ssh.connect_attempts
    );
    assert!(report.bootstrap_actions.is_empty());
    assert!(harness.edge.deployed_keys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_certbot_failure_ends_at_tls() {
    let harness = Harness::new(StubEdge::new(true, false), "203.0.113.9")
        .with_certificates(StubCertificates::failing(IssuanceFailure::Certbot));

    let report = harness.orchestrator().run(&full_inputs()).await;

    assert_eq!(report.exit_code, exit::TLS);
    assert_eq!(report.reached, Stage::DnsConfirmed);
    let failure = report.failure().unwrap();
    assert_eq!(failure.target, Stage::TlsIssued);
    assert_eq!(failure.kind, ErrorKind::Internal);
    assert!(failure.message.contains("after 3 attempts"));
    assert_eq!(
        harness.certificates.requests.load(Ordering::SeqCst),
        Settings::default().tls.max_attempts
    );
}

#[tokio::test]
async fn test_rate_limit_stops_issuance_immediately() {
    let harness = Harness::new(StubEdge::new(true, false), "203.0.113.9")
        .with_certificates(StubCertificates::failing(IssuanceFailure::RateLimited));

    let report = harness.orchestrator().run(&full_inputs()).await;

    assert_eq!(report.exit_code, exit::TLS);
    let failure = report.failure().unwrap();
    assert_eq!(failure.target, Stage::TlsIssued);
    assert_eq!(failure.kind, ErrorKind::ExternalRateLimit);
    assert!(failure
        .remediation
        .as_deref()
        .unwrap()
        .contains("wait before re-running"));
    assert_eq!(harness.certificates.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ambiguous_edge_config_keeps_primary_running() {
    let harness = Harness::new(StubEdge::new(true, false), "203.0.113.9");
    harness.write_env("VPS_ENABLED=true\nVPS_HOST=your-vps-ip\n");

    let report = harness.orchestrator().run(&ProvisionInputs::default()).await;

    assert_eq!(report.exit_code, exit::DEGRADED);
    assert_eq!(report.reached, Stage::LocallyBootstrapped);
    let failure = report.failure().unwrap();
    assert_eq!(failure.target, Stage::EdgeKeyDeployed);
    assert!(failure.remediation.as_deref().unwrap().contains("VPS_HOST"));
    assert_eq!(harness.edge.key_probes.load(Ordering::SeqCst), 0);
    assert!(harness.dir.path().join("keys/edge_ed25519").exists());
}

#[tokio::test]
async fn test_rejected_password_gets_one_bootstrap_attempt() {
    let harness = Harness::new(StubEdge::new(false, false), "203.0.113.9");
    harness.write_env("VPS_HOST=203.0.113.9\n");
    let inputs = ProvisionInputs {
        vps_password: Some("wrong".to_string()),
        ..ProvisionInputs::default()
    };

    let report = harness.orchestrator().run(&inputs).await;

    assert_eq!(report.bootstrap_actions, vec![EdgeAction::DeployKey]);
    assert_eq!(report.exit_code, exit::DEGRADED);
    assert_eq!(report.reached, Stage::LocallyBootstrapped);
    let failure = report.failure().unwrap();
    assert_eq!(failure.target, Stage::EdgeKeyDeployed);
    assert!(failure
        .remediation
        .as_deref()
        .unwrap()
        .contains("ssh-copy-id"));
    assert!(harness.edge.deployed_keys.lock().unwrap().is_empty());
}
