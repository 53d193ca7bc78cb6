// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning state machine
//!
//! Sequences the primary-host steps, the edge bootstrap, DNS and TLS. Each
//! step observes its facts first and only mutates when they do not hold.
//! Leaf components return typed errors; this module alone decides whether a
//! failure ends the run and which exit code it maps to.

mod primary;
mod report;
mod state;

pub use primary::{package_for, PrimaryHost, SystemPrimary};
pub use report::{render_summary, remediation_for, EdgeAction, RunReport};
pub use state::{FailureReason, ObservedFacts, ProvisioningState, Stage, Transition};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{
    decide, manual_key_instructions, probe_reachability, BootstrapAction, Reachability,
};
use crate::certs::{CertbotBackend, CertificateBackend, CertificateIssuer, IssueOutcome};
use crate::connector::{
    prepare_sync_target, AuthMethod, HostConnector, HostProfile, SshConnector, SyncDirection,
    SyncOptions,
};
use crate::dns::{DigResolver, DnsOutcome, DnsWaiter, Resolver};
use crate::error::{AuthSide, ErrorKind, ProvisionError, Result};
use crate::health::{HealthProbe, HealthVerifier, HttpProbe};
use crate::input::ProvisionInputs;
use crate::keys::{self, Credential, KeyOrigin};
use crate::lock::RunLock;
use crate::retry::{retry, Attempt};
use crate::settings::Settings;
use crate::store::schema::{
    self, service_defaults, CAMERA_GROUP, DEFAULT_CAMERA_PASSWORD, DEFAULT_REMOTE_PATH,
    DEFAULT_RSYNC_OPTIONS, TLS_GROUP, VPS_GROUP,
};
use crate::store::{
    self as config_store, apply_group, classify_edge_config, is_placeholder, merge_defaults,
    ConfigDocument, EdgeConfig, MANAGED_GROUPS,
};

/// External systems the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn HostConnector>,
    pub resolver: Arc<dyn Resolver>,
    pub certificates: Arc<dyn CertificateBackend>,
    pub probe: Arc<dyn HealthProbe>,
    pub primary: Arc<dyn PrimaryHost>,
}

impl Collaborators {
    /// Real implementations: ssh/rsync, dig, certbot, reqwest, systemd
    pub fn system(settings: &Settings, edge_password: Option<String>) -> Self {
        let connector: Arc<dyn HostConnector> = Arc::new(
            SshConnector::new(settings.paths.key_path.clone(), settings.connect_timeout())
                .with_password(edge_password),
        );
        Self {
            certificates: Arc::new(CertbotBackend::new(
                connector.clone(),
                // certbot talks to the CA; give it the sync budget
                settings.sync_timeout(),
            )),
            connector,
            resolver: Arc::new(DigResolver::new(
                settings.dns.resolver.clone(),
                Duration::from_secs(10),
            )),
            probe: Arc::new(HttpProbe::new()),
            primary: Arc::new(SystemPrimary::from_settings(settings)),
        }
    }
}

/// Certificate request settings for this run
#[derive(Debug, Clone)]
struct TlsTarget {
    domain: String,
    email: String,
}

/// Everything one run threads through its steps
pub struct ProvisioningContext<'a> {
    pub inputs: &'a ProvisionInputs,
    pub document: ConfigDocument,
    original_text: String,
    pub edge: EdgeConfig,
    pub edge_host: Option<HostProfile>,
    tls: Option<TlsTarget>,
    pub credential: Option<Credential>,
    pub stage: Stage,
    transitions: Vec<Transition>,
    actions: Vec<EdgeAction>,
    warnings: Vec<String>,
    lock: Option<RunLock>,
}

impl<'a> ProvisioningContext<'a> {
    /// Move to `to`; `observed` means nothing had to change
    fn advance(&mut self, to: Stage, observed: bool) {
        info!(
            from = %self.stage,
            to = %to,
            observed = observed,
            "State transition"
        );
        self.transitions.push(Transition {
            from: self.stage,
            to: ProvisioningState::Reached(to),
            observed,
            at: Utc::now(),
        });
        self.stage = to;
        if let Some(lock) = &self.lock {
            if let Err(e) = lock.update_step(&to.to_string()) {
                debug!(error = %e, "Could not record step in lock file");
            }
        }
    }

    fn warn(&mut self, message: String) {
        warn!(stage = %self.stage, "{}", message);
        self.warnings.push(message);
    }

    fn finish(mut self, failure: Option<FailureReason>) -> RunReport {
        let final_state = match failure {
            Some(reason) => {
                error!(
                    from = %self.stage,
                    target = %reason.target,
                    kind = %reason.kind,
                    error = %reason.message,
                    "Provisioning step failed"
                );
                let state = ProvisioningState::Failed(reason);
                self.transitions.push(Transition {
                    from: self.stage,
                    to: state.clone(),
                    observed: false,
                    at: Utc::now(),
                });
                state
            }
            None => ProvisioningState::Reached(self.stage),
        };
        RunReport::new(
            final_state,
            self.stage,
            self.transitions,
            self.actions,
            self.warnings,
        )
    }
}

fn fail_at(target: Stage) -> impl Fn(ProvisionError) -> FailureReason {
    move |e| FailureReason::new(target, &e)
}

pub struct Orchestrator {
    settings: Settings,
    collaborators: Collaborators,
}

impl Orchestrator {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            collaborators,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Provision both hosts as far as the inputs and configuration allow
    pub async fn run(&self, inputs: &ProvisionInputs) -> RunReport {
        info!(production = inputs.production, "Provisioning run started");
        let mut ctx = match self.prepare(inputs) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(error = %e, "Provisioning rejected before any change");
                return RunReport::rejected(FailureReason::new(Stage::DependenciesInstalled, &e));
            }
        };

        let outcome = self.drive(&mut ctx).await;
        let report = ctx.finish(outcome.err());
        info!(
            final_state = %report.final_state,
            exit_code = report.exit_code,
            "Provisioning run finished"
        );
        report
    }

    /// Validate inputs and build the merged configuration in memory.
    /// Nothing on disk changes here except the run lock.
    fn prepare<'a>(&self, inputs: &'a ProvisionInputs) -> Result<ProvisioningContext<'a>> {
        inputs.validate()?;
        let lock = RunLock::acquire(&self.settings.paths.lock_file, "prepare")?;

        let existing = config_store::load(&self.settings.paths.env_file)?;
        let original_text = existing.to_string();
        let mut document = self.compose_document(&existing, inputs);

        if inputs.production
            && document.get(schema::CAMERA_PASSWORD) == Some(DEFAULT_CAMERA_PASSWORD)
        {
            return Err(ProvisionError::validation(
                "the factory camera password cannot be used in production; pass --camera-pass",
            ));
        }

        let edge = classify_edge_config(&document);
        let edge_host = match &edge {
            EdgeConfig::Configured { address } => {
                if document.get(schema::VPS_ENABLED).is_none()
                    && document.get(schema::VPS_HOST) == Some(address.as_str())
                {
                    // Make the detected edge host explicit for future runs
                    document.set(schema::VPS_ENABLED, "true");
                }
                Some(edge_profile(&document, address)?)
            }
            _ => None,
        };

        let tls = tls_target(&document)?;
        if tls.is_some() && edge_host.is_none() {
            warn!("DOMAIN_NAME is set but no edge host is configured; TLS steps will be skipped");
        }

        debug!(edge = ?edge, tls = ?tls, "Configuration prepared");
        Ok(ProvisioningContext {
            inputs,
            document,
            original_text,
            edge,
            edge_host,
            tls,
            credential: None,
            stage: Stage::NotStarted,
            transitions: Vec::new(),
            actions: Vec::new(),
            warnings: Vec::new(),
            lock: Some(lock),
        })
    }

    /// Defaults merged with the existing file, then operator overrides
    fn compose_document(
        &self,
        existing: &ConfigDocument,
        inputs: &ProvisionInputs,
    ) -> ConfigDocument {
        let key_path = &self.settings.paths.key_path;
        let defaults = service_defaults(inputs.production, key_path);
        let mut document = merge_defaults(existing, &defaults, &MANAGED_GROUPS);

        if let Some(address) = &inputs.vps_ip {
            let values = edge_group_values(&document, inputs, address, key_path);
            document = apply_group(&document, &VPS_GROUP, &values);
        }

        if let Some(domain) = &inputs.domain {
            let email = inputs.email.clone().unwrap_or_default();
            let values = vec![
                (schema::DOMAIN_NAME.to_string(), domain.clone()),
                (schema::SSL_EMAIL.to_string(), email),
            ];
            document = apply_group(&document, &TLS_GROUP, &values);
        }

        if inputs.camera_ip.is_some() || inputs.camera_user.is_some() || inputs.camera_pass.is_some()
        {
            let current = |key: &str| document.get(key).unwrap_or_default().to_string();
            let values = vec![
                (
                    schema::CAMERA_IP.to_string(),
                    inputs.camera_ip.clone().unwrap_or_else(|| current(schema::CAMERA_IP)),
                ),
                (
                    schema::CAMERA_USERNAME.to_string(),
                    inputs
                        .camera_user
                        .clone()
                        .unwrap_or_else(|| current(schema::CAMERA_USERNAME)),
                ),
                (
                    schema::CAMERA_PASSWORD.to_string(),
                    inputs
                        .camera_pass
                        .clone()
                        .unwrap_or_else(|| current(schema::CAMERA_PASSWORD)),
                ),
            ];
            document = apply_group(&document, &CAMERA_GROUP, &values);
        }

        document
    }

    async fn drive(&self, ctx: &mut ProvisioningContext<'_>) -> std::result::Result<(), FailureReason> {
        self.step_dependencies(ctx)
            .await
            .map_err(fail_at(Stage::DependenciesInstalled))?;
        self.step_repository(ctx)
            .await
            .map_err(fail_at(Stage::RepositoryAcquired))?;
        self.step_local_bootstrap(ctx)
            .await
            .map_err(fail_at(Stage::LocallyBootstrapped))?;

        let Some(host) = ctx.edge_host.clone() else {
            if let EdgeConfig::Ambiguous { reason } = &ctx.edge {
                let action = decide(&ctx.edge, None);
                let remediation = match action {
                    BootstrapAction::ManualRemediation { instructions } => instructions,
                    _ => reason.clone(),
                };
                return Err(FailureReason::new(
                    Stage::EdgeKeyDeployed,
                    &ProvisionError::validation(format!("edge host configuration is ambiguous: {}", reason)),
                )
                .with_remediation(remediation));
            }
            info!("No edge host configured, running single-host");
            return Ok(());
        };

        self.step_edge_key(ctx, &host).await?;
        self.step_edge_verify(ctx, &host)
            .await
            .map_err(fail_at(Stage::EdgeVerified))?;
        self.initial_sync(ctx, &host).await;

        let Some(tls) = ctx.tls.clone() else {
            info!("No domain configured, skipping DNS and TLS");
            return Ok(());
        };

        let dns = self.step_dns(ctx, &host, &tls).await?;
        self.step_tls(ctx, &host, &tls, &dns).await?;
        self.step_complete(ctx, &tls).await;
        Ok(())
    }

    fn required_tools(&self, ctx: &ProvisioningContext<'_>) -> Vec<&'static str> {
        let mut tools = vec!["git"];
        if ctx.edge_host.is_some() {
            tools.extend(["ssh", "rsync"]);
            if ctx.inputs.password_supplied() {
                tools.push("sshpass");
            }
            if ctx.tls.is_some() {
                tools.push("dig");
            }
        }
        tools
    }

    async fn step_dependencies(&self, ctx: &mut ProvisioningContext<'_>) -> Result<()> {
        let required = self.required_tools(ctx);
        let primary = &self.collaborators.primary;
        let missing = primary.missing_dependencies(&required).await;
        if missing.is_empty() {
            ctx.advance(Stage::DependenciesInstalled, true);
            return Ok(());
        }

        if !ctx.inputs.production {
            return Err(ProvisionError::validation(format!(
                "missing tools: {}. Install them or re-run with --production",
                missing.join(", ")
            )));
        }

        let packages: Vec<String> = missing.iter().map(|t| package_for(t).to_string()).collect();
        primary.install_packages(&packages).await?;
        let still_missing = primary.missing_dependencies(&required).await;
        if let Some(tool) = still_missing.into_iter().next() {
            return Err(ProvisionError::CommandNotFound { command: tool });
        }
        ctx.advance(Stage::DependenciesInstalled, false);
        Ok(())
    }

    async fn step_repository(&self, ctx: &mut ProvisioningContext<'_>) -> Result<()> {
        let primary = &self.collaborators.primary;
        if primary.repository_present().await {
            ctx.advance(Stage::RepositoryAcquired, true);
            return Ok(());
        }
        primary.acquire_repository().await?;
        ctx.advance(Stage::RepositoryAcquired, false);
        Ok(())
    }

    async fn step_local_bootstrap(&self, ctx: &mut ProvisioningContext<'_>) -> Result<()> {
        let credential = keys::ensure_keypair(&self.settings.paths.key_path)?;
        info!(
            fingerprint = %credential.public_key_fingerprint,
            origin = ?credential.origin,
            "Provisioning key ready"
        );
        let key_changed = credential.origin != KeyOrigin::Existing;
        ctx.credential = Some(credential);

        let config_changed = ctx.document.to_string() != ctx.original_text;
        if config_changed {
            config_store::save(&ctx.document, &self.settings.paths.env_file)?;
            ctx.original_text = ctx.document.to_string();
        }

        if ctx.inputs.production {
            self.collaborators.primary.restart_service().await?;
            self.wait_local_health(ctx).await?;
        }

        ctx.advance(
            Stage::LocallyBootstrapped,
            !key_changed && !config_changed && !ctx.inputs.production,
        );
        Ok(())
    }

    async fn wait_local_health(&self, ctx: &ProvisioningContext<'_>) -> Result<()> {
        let port = ctx.document.get(schema::PORT).unwrap_or("8080");
        let url = format!("http://127.0.0.1:{}/health", port);
        let probe = &self.collaborators.probe;
        let timeout = Duration::from_secs(self.settings.service.health_timeout_secs);
        let url_ref = url.as_str();

        let result = retry(
            self.settings.service.health_attempts,
            Duration::from_secs(self.settings.service.health_interval_secs),
            |attempt| async move {
                if probe.check(url_ref, timeout).await {
                    Ok(())
                } else {
                    debug!(attempt = attempt, url = %url_ref, "Service not healthy yet");
                    Err(Attempt::Retry(()))
                }
            },
        )
        .await;

        match result {
            Ok(((), attempts)) => {
                info!(url = %url, attempts = attempts, "Service healthy");
                Ok(())
            }
            Err(failure) => Err(ProvisionError::Connectivity {
                host: "localhost".to_string(),
                message: format!(
                    "{} did not report healthy after {} attempts",
                    url, failure.attempts
                ),
            }),
        }
    }

    async fn step_edge_key(
        &self,
        ctx: &mut ProvisioningContext<'_>,
        host: &HostProfile,
    ) -> std::result::Result<(), FailureReason> {
        let connector = self.collaborators.connector.as_ref();
        let timeout = self.settings.connect_timeout();
        let fail = fail_at(Stage::EdgeKeyDeployed);

        let (reachability, probes) = probe_reachability(
            connector,
            host,
            ctx.inputs.password_supplied(),
            timeout,
            self.settings.ssh.connect_attempts,
            self.settings.connect_retry_interval(),
        )
        .await
        .map_err(&fail)?;
        for probe in &probes {
            debug!(
                method = %probe.method,
                succeeded = probe.succeeded,
                latency_ms = probe.latency.as_millis() as u64,
                failure = ?probe.failure_kind,
                "Connectivity probe"
            );
        }

        let action = decide(&ctx.edge, Some(reachability));
        info!(host = %host.address, action = ?action, "Edge bootstrap decision");

        match action {
            BootstrapAction::ReportHealthy => {
                ctx.advance(Stage::EdgeKeyDeployed, true);
                Ok(())
            }
            BootstrapAction::DeployKey | BootstrapAction::AttemptBootstrap => {
                let public_key = ctx
                    .credential
                    .as_ref()
                    .map(|c| c.public_key.clone())
                    .unwrap_or_default();
                ctx.actions.push(EdgeAction::DeployKey);
                connector
                    .deploy_public_key(host, &public_key, self.settings.command_timeout())
                    .await
                    .map_err(|e| fail(e).with_remediation(manual_key_instructions(&host.address)))?;

                ctx.actions.push(EdgeAction::ReprobeKeyAuth);
                let reprobe = connector
                    .test_connectivity(host, AuthMethod::Key, timeout)
                    .await
                    .map_err(&fail)?;
                if !reprobe.succeeded {
                    let err = ProvisionError::Authentication {
                        side: AuthSide::Key,
                        host: host.address.clone(),
                        message: format!("key still rejected after deployment: {}", reprobe.detail),
                    };
                    return Err(fail(err).with_remediation(manual_key_instructions(&host.address)));
                }
                ctx.advance(Stage::EdgeKeyDeployed, false);
                Ok(())
            }
            BootstrapAction::ManualRemediation { instructions } => {
                let detail = probes.last().map(|p| p.detail.as_str()).unwrap_or_default();
                let err = if reachability == Reachability::Offline {
                    ProvisionError::Connectivity {
                        host: host.address.clone(),
                        message: format!(
                            "no answer after {} attempts: {}",
                            self.settings.ssh.connect_attempts, detail
                        ),
                    }
                } else {
                    ProvisionError::Authentication {
                        side: AuthSide::Key,
                        host: host.address.clone(),
                        message: format!(
                            "edge host does not accept the provisioning key: {}",
                            detail
                        ),
                    }
                };
                Err(fail(err).with_remediation(instructions))
            }
            BootstrapAction::SkipEdge => Ok(()),
        }
    }

    async fn step_edge_verify(
        &self,
        ctx: &mut ProvisioningContext<'_>,
        host: &HostProfile,
    ) -> Result<()> {
        let connector = self.collaborators.connector.as_ref();
        let web_user =
            prepare_sync_target(connector, host, self.settings.command_timeout()).await?;
        debug!(web_user = ?web_user, "Sync target prepared");

        let verifier = self.health_verifier();
        let check = verifier
            .verify_sync_round_trip(host, self.settings.sync_timeout())
            .await?;
        if !check.cleaned_up {
            ctx.warn(format!(
                "verification directory {} was left on the edge host",
                check.remote_path
            ));
        }
        if !check.matched {
            return Err(ProvisionError::CommandFailed {
                command: "rsync round trip".to_string(),
                status: None,
                stderr: "pulled content differs from pushed marker".to_string(),
            });
        }
        ctx.advance(Stage::EdgeVerified, false);
        Ok(())
    }

    /// Mirror the local sequences once so the edge has content right away
    async fn initial_sync(&self, ctx: &mut ProvisioningContext<'_>, host: &HostProfile) {
        let sequences = ctx
            .document
            .get(schema::SEQUENCES_DIR)
            .unwrap_or(schema::DEFAULT_SEQUENCES_DIR)
            .to_string();
        if !Path::new(&sequences).is_dir() {
            debug!(path = %sequences, "No local sequences to mirror yet");
            return;
        }

        let extra: Vec<String> = ctx
            .document
            .get(schema::VPS_RSYNC_OPTIONS)
            .unwrap_or(DEFAULT_RSYNC_OPTIONS)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let options = SyncOptions::mirror(self.settings.sync_timeout()).with_extra_args(extra);
        let result = self
            .collaborators
            .connector
            .sync_path(
                host,
                Path::new(&sequences),
                &host.remote_sync_path,
                SyncDirection::Push,
                &options,
            )
            .await;
        match result {
            Ok(stats) => info!(
                files = stats.files_transferred,
                bytes = stats.bytes_transferred,
                "Initial sequence mirror pushed"
            ),
            Err(e) => ctx.warn(format!("initial sequence mirror failed: {}", e)),
        }
    }

    async fn step_dns(
        &self,
        ctx: &mut ProvisioningContext<'_>,
        host: &HostProfile,
        tls: &TlsTarget,
    ) -> std::result::Result<DnsOutcome, FailureReason> {
        let waiter = DnsWaiter::new(self.collaborators.resolver.clone());
        let dns = waiter
            .await_propagation(
                &tls.domain,
                &host.address,
                self.settings.dns.max_attempts,
                Duration::from_secs(self.settings.dns.interval_secs),
            )
            .await
            .map_err(fail_at(Stage::DnsConfirmed))?;

        match &dns {
            DnsOutcome::Converged { attempts } => {
                ctx.advance(Stage::DnsConfirmed, attempts.len() == 1);
                Ok(dns)
            }
            DnsOutcome::TimedOut { attempts, remediation } => {
                let err = ProvisionError::Precondition {
                    message: format!(
                        "{} did not resolve to {} after {} attempts",
                        tls.domain,
                        host.address,
                        attempts.len()
                    ),
                    remediation: remediation.clone(),
                };
                Err(FailureReason::new(Stage::DnsConfirmed, &err))
            }
        }
    }

    async fn step_tls(
        &self,
        ctx: &mut ProvisioningContext<'_>,
        host: &HostProfile,
        tls: &TlsTarget,
        dns: &DnsOutcome,
    ) -> std::result::Result<(), FailureReason> {
        let issuer = CertificateIssuer::new(
            self.collaborators.certificates.clone(),
            self.settings.tls.renew_before_days,
        );
        let outcome = issuer
            .issue(
                host,
                &tls.domain,
                &tls.email,
                dns,
                self.settings.tls.max_attempts,
                Duration::from_secs(self.settings.tls.backoff_secs),
            )
            .await
            .map_err(fail_at(Stage::TlsIssued))?;

        match outcome {
            IssueOutcome::Issued { reused, .. } => {
                ctx.advance(Stage::TlsIssued, reused);
                Ok(())
            }
            IssueOutcome::Failed { last_error, attempts } => {
                let mut reason = FailureReason::new(Stage::TlsIssued, &last_error);
                reason.message = format!("{} (after {} attempts)", reason.message, attempts);
                if reason.kind == ErrorKind::ExternalRateLimit {
                    reason = reason.with_remediation(
                        "The certificate authority rate limit is exhausted; wait before re-running",
                    );
                }
                Err(reason)
            }
        }
    }

    async fn step_complete(&self, ctx: &mut ProvisioningContext<'_>, tls: &TlsTarget) {
        let url = format!("https://{}/", tls.domain);
        if !self.health_verifier().check_remote(&url).await {
            ctx.warn(format!("{} did not answer after certificate installation", url));
        }
        ctx.advance(Stage::Complete, false);
    }

    fn health_verifier(&self) -> HealthVerifier {
        HealthVerifier::new(
            self.collaborators.probe.clone(),
            self.collaborators.connector.clone(),
            self.settings.command_timeout(),
        )
    }

    /// Gather facts without changing anything, for `status`
    pub async fn observe(&self) -> Result<ObservedFacts> {
        let document = config_store::load(&self.settings.paths.env_file)?;
        let env_file_present = self.settings.paths.env_file.exists();
        let key_path = &self.settings.paths.key_path;
        let keypair_valid = keys::is_valid(key_path);
        let key_fingerprint = if keypair_valid {
            keys::fingerprint(key_path).ok()
        } else {
            None
        };

        let edge = classify_edge_config(&document);
        let tls = tls_target(&document).ok().flatten();
        let mut required = vec!["git"];
        if edge.address().is_some() {
            required.extend(["ssh", "rsync"]);
        }
        let primary = &self.collaborators.primary;
        let missing_dependencies = primary.missing_dependencies(&required).await;
        let repository_present = primary.repository_present().await;

        let mut facts = ObservedFacts {
            missing_dependencies,
            repository_present,
            env_file_present,
            keypair_valid,
            key_fingerprint,
            edge_address: edge.address().map(str::to_string),
            edge: edge.clone(),
            edge_key_auth: None,
            domain: tls.as_ref().map(|t| t.domain.clone()),
            dns_converged: None,
            certificate_valid: None,
        };

        let host = match &edge {
            EdgeConfig::Configured { address } => edge_profile(&document, address).ok(),
            _ => None,
        };
        let Some(host) = host else {
            return Ok(facts);
        };

        let probe = self
            .collaborators
            .connector
            .test_connectivity(&host, AuthMethod::Key, self.settings.connect_timeout())
            .await?;
        facts.edge_key_auth = Some(probe.succeeded);

        if let Some(tls) = tls {
            let answers = self
                .collaborators
                .resolver
                .resolve(&tls.domain)
                .await
                .unwrap_or_default();
            facts.dns_converged = Some(crate::dns::answers_match(&answers, &host.address));
            if probe.succeeded {
                facts.certificate_valid = self
                    .collaborators
                    .certificates
                    .existing_valid(&host, &tls.domain, self.settings.tls.renew_before_days)
                    .await
                    .ok();
            }
        }
        Ok(facts)
    }
}

/// Replacement values for the whole `VPS_*` group when the operator names an
/// edge host. Unknown `VPS_*` keys already in the file are carried over.
fn edge_group_values(
    document: &ConfigDocument,
    inputs: &ProvisionInputs,
    address: &str,
    key_path: &Path,
) -> Vec<(String, String)> {
    let existing = |key: &str, fallback: &str| -> String {
        document
            .get(key)
            .filter(|v| !is_placeholder(v))
            .unwrap_or(fallback)
            .to_string()
    };

    let mut values = vec![
        (schema::VPS_ENABLED.to_string(), "true".to_string()),
        (schema::VPS_HOST.to_string(), address.to_string()),
        (
            schema::VPS_USER.to_string(),
            inputs
                .vps_user
                .clone()
                .unwrap_or_else(|| existing(schema::VPS_USER, "root")),
        ),
        (schema::VPS_PORT.to_string(), existing(schema::VPS_PORT, "22")),
        (
            schema::VPS_REMOTE_PATH.to_string(),
            existing(schema::VPS_REMOTE_PATH, DEFAULT_REMOTE_PATH),
        ),
        (
            schema::VPS_SSH_KEY_PATH.to_string(),
            key_path.display().to_string(),
        ),
        (
            schema::VPS_RSYNC_OPTIONS.to_string(),
            existing(schema::VPS_RSYNC_OPTIONS, DEFAULT_RSYNC_OPTIONS),
        ),
    ];

    let known: Vec<String> = values.iter().map(|(k, _)| k.clone()).collect();
    for (key, value) in document.entries() {
        if VPS_GROUP.contains(key) && !known.iter().any(|k| k == key) {
            values.push((key.to_string(), value.to_string()));
        }
    }
    values
}

/// Edge host profile from the `VPS_*` keys
fn edge_profile(document: &ConfigDocument, address: &str) -> Result<HostProfile> {
    let get = |key: &str| document.get(key).filter(|v| !is_placeholder(v));
    let user = get(schema::VPS_USER).unwrap_or("root");
    let port = match get(schema::VPS_PORT) {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            ProvisionError::validation(format!("VPS_PORT '{}' is not a port number", raw))
        })?,
        None => 22,
    };
    let remote = get(schema::VPS_REMOTE_PATH).unwrap_or(DEFAULT_REMOTE_PATH);

    let profile = HostProfile::edge(address, user, port, remote);
    profile.validate()?;
    Ok(profile)
}

/// Domain and contact email, when a domain is configured
fn tls_target(document: &ConfigDocument) -> Result<Option<TlsTarget>> {
    let get = |key: &str| {
        document
            .get(key)
            .filter(|v| !is_placeholder(v))
            .map(str::to_string)
    };
    let Some(domain) = get(schema::DOMAIN_NAME) else {
        return Ok(None);
    };
    let Some(email) = get(schema::SSL_EMAIL) else {
        return Err(ProvisionError::validation(format!(
            "DOMAIN_NAME is {} but SSL_EMAIL is not set",
            domain
        )));
    };
    Ok(Some(TlsTarget { domain, email }))
}
