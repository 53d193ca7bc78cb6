// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run report and the operator-facing summary

use std::fmt::Write as _;

use serde::Serialize;

use super::state::{FailureReason, ProvisioningState, Stage, Transition};
use crate::error::exit;

/// Mutating actions taken against the edge host during bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeAction {
    /// Public key installed over a password session
    DeployKey,
    /// Key authentication probed again after deployment
    ReprobeKeyAuth,
}

/// Everything a run did and how it ended
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub final_state: ProvisioningState,
    /// Last stage actually reached
    pub reached: Stage,
    pub transitions: Vec<Transition>,
    pub bootstrap_actions: Vec<EdgeAction>,
    /// Non-fatal problems noticed along the way
    pub warnings: Vec<String>,
    pub exit_code: i32,
}

impl RunReport {
    pub(super) fn new(
        final_state: ProvisioningState,
        reached: Stage,
        transitions: Vec<Transition>,
        bootstrap_actions: Vec<EdgeAction>,
        warnings: Vec<String>,
    ) -> Self {
        let exit_code = match &final_state {
            ProvisioningState::Failed(reason) => reason.exit_code(),
            ProvisioningState::Reached(_) => exit::SUCCESS,
        };
        Self {
            final_state,
            reached,
            transitions,
            bootstrap_actions,
            warnings,
            exit_code,
        }
    }

    /// Run refused before any step began
    pub(super) fn rejected(reason: FailureReason) -> Self {
        Self {
            exit_code: exit::VALIDATION,
            final_state: ProvisioningState::Failed(reason),
            reached: Stage::NotStarted,
            transitions: Vec::new(),
            bootstrap_actions: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.final_state {
            ProvisioningState::Failed(reason) => Some(reason),
            ProvisioningState::Reached(_) => None,
        }
    }
}

/// What the operator can do to get past `stage`
pub fn remediation_for(stage: Stage) -> &'static str {
    match stage {
        Stage::NotStarted => "Re-run the provisioner",
        Stage::DependenciesInstalled => {
            "Install git, ssh, rsync, sshpass and dnsutils, or re-run with --production"
        }
        Stage::RepositoryAcquired => "Set repository.url in provision.toml or clone the service checkout by hand",
        Stage::LocallyBootstrapped => "Check the environment file and key paths in provision.toml",
        Stage::EdgeKeyDeployed => {
            "Set VPS_IP (and VPS_PASSWORD for first-time key setup) to add an edge host"
        }
        Stage::EdgeVerified => "Check that the edge sync directory is writable by the SSH user",
        Stage::DnsConfirmed => {
            "Set DOMAIN_NAME and SSL_EMAIL, and point the domain's A record at the edge host"
        }
        Stage::TlsIssued => "Check certbot and nginx on the edge host, then re-run",
        Stage::Complete => "Re-run once the steps above succeed",
    }
}

/// Human-readable summary: the outcome, then every stage short of
/// `Complete` with its remediation
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Provisioning finished: {}", report.final_state);

    if !report.bootstrap_actions.is_empty() {
        let actions: Vec<String> = report
            .bootstrap_actions
            .iter()
            .map(|a| format!("{:?}", a))
            .collect();
        let _ = writeln!(out, "Edge bootstrap actions: {}", actions.join(", "));
    }

    if let Some(reason) = report.failure() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Failed to reach {}: {}", reason.target, reason.message);
        if let Some(remediation) = &reason.remediation {
            let _ = writeln!(out, "  Fix: {}", remediation);
        }
    }

    for warning in &report.warnings {
        let _ = writeln!(out, "Warning: {}", warning);
    }

    let failed_target = report.failure().map(|r| r.target);
    let pending: Vec<Stage> = Stage::ALL
        .iter()
        .copied()
        .filter(|s| *s > report.reached && Some(*s) != failed_target)
        .collect();
    if !pending.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Not reached:");
        for stage in pending {
            let _ = writeln!(out, "  {:<24} {}", stage.to_string(), remediation_for(stage));
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Exit code: {}", report.exit_code);
    out
}
