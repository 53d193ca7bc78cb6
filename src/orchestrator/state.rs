// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning states and how they are derived from observed facts

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{exit, ErrorKind, ProvisionError};
use crate::store::EdgeConfig;

/// Milestones, in the only order they can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Stage {
    NotStarted,
    DependenciesInstalled,
    RepositoryAcquired,
    LocallyBootstrapped,
    EdgeKeyDeployed,
    EdgeVerified,
    DnsConfirmed,
    TlsIssued,
    Complete,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::NotStarted,
        Stage::DependenciesInstalled,
        Stage::RepositoryAcquired,
        Stage::LocallyBootstrapped,
        Stage::EdgeKeyDeployed,
        Stage::EdgeVerified,
        Stage::DnsConfirmed,
        Stage::TlsIssued,
        Stage::Complete,
    ];

    /// Stage reached after this one
    pub fn next(self) -> Option<Stage> {
        let index = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(index + 1).copied()
    }

    /// Stages that touch the edge host
    pub fn is_edge(self) -> bool {
        matches!(self, Stage::EdgeKeyDeployed | Stage::EdgeVerified)
    }

    /// Stages that belong to DNS and certificate issuance
    pub fn is_tls(self) -> bool {
        matches!(self, Stage::DnsConfirmed | Stage::TlsIssued | Stage::Complete)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::NotStarted => "not-started",
            Stage::DependenciesInstalled => "dependencies-installed",
            Stage::RepositoryAcquired => "repository-acquired",
            Stage::LocallyBootstrapped => "locally-bootstrapped",
            Stage::EdgeKeyDeployed => "edge-key-deployed",
            Stage::EdgeVerified => "edge-verified",
            Stage::DnsConfirmed => "dns-confirmed",
            Stage::TlsIssued => "tls-issued",
            Stage::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Why a run stopped short
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReason {
    /// Stage the run failed to reach
    pub target: Stage,
    pub kind: ErrorKind,
    pub message: String,
    pub remediation: Option<String>,
}

impl FailureReason {
    pub fn new(target: Stage, error: &ProvisionError) -> Self {
        let remediation = match error {
            ProvisionError::Precondition { remediation, .. } => Some(remediation.clone()),
            _ => None,
        };
        Self {
            target,
            kind: error.kind(),
            message: error.to_string(),
            remediation,
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    /// Exit code for a run that ended with this failure
    pub fn exit_code(&self) -> i32 {
        if self.target.is_tls() {
            exit::TLS
        } else if self.target.is_edge() {
            exit::DEGRADED
        } else {
            exit::VALIDATION
        }
    }
}

/// Where a run stands
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "kebab-case")]
pub enum ProvisioningState {
    Reached(Stage),
    Failed(FailureReason),
}

impl ProvisioningState {
    pub fn is_failed(&self) -> bool {
        matches!(self, ProvisioningState::Failed(_))
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningState::Reached(stage) => write!(f, "{}", stage),
            ProvisioningState::Failed(reason) => {
                write!(f, "failed before {} ({})", reason.target, reason.kind)
            }
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: Stage,
    pub to: ProvisioningState,
    /// The facts already held, so nothing was changed
    pub observed: bool,
    pub at: DateTime<Utc>,
}

/// Read-only facts about both hosts
#[derive(Debug, Clone, Serialize)]
pub struct ObservedFacts {
    pub missing_dependencies: Vec<String>,
    pub repository_present: bool,
    pub env_file_present: bool,
    pub keypair_valid: bool,
    pub key_fingerprint: Option<String>,
    pub edge: EdgeConfig,
    pub edge_address: Option<String>,
    /// `None` when no edge host is configured
    pub edge_key_auth: Option<bool>,
    pub domain: Option<String>,
    /// `None` when there is no domain to check
    pub dns_converged: Option<bool>,
    pub certificate_valid: Option<bool>,
}

impl ObservedFacts {
    /// Stage a run would resume from.
    ///
    /// Key authentication is taken as the edge verification here, since the
    /// sync round trip writes to the edge host.
    pub fn derive(&self) -> Stage {
        if !self.missing_dependencies.is_empty() {
            return Stage::NotStarted;
        }
        if !self.repository_present {
            return Stage::DependenciesInstalled;
        }
        if !(self.env_file_present && self.keypair_valid) {
            return Stage::RepositoryAcquired;
        }
        if self.edge_key_auth != Some(true) {
            return Stage::LocallyBootstrapped;
        }
        if self.domain.is_none() || self.dns_converged != Some(true) {
            return Stage::EdgeVerified;
        }
        if self.certificate_valid != Some(true) {
            return Stage::DnsConfirmed;
        }
        Stage::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> ObservedFacts {
        ObservedFacts {
            missing_dependencies: vec![],
            repository_present: true,
            env_file_present: true,
            keypair_valid: true,
            key_fingerprint: None,
            edge: EdgeConfig::Configured {
                address: "203.0.113.9".to_string(),
            },
            edge_address: Some("203.0.113.9".to_string()),
            edge_key_auth: Some(true),
            domain: Some("cam.example.org".to_string()),
            dns_converged: Some(true),
            certificate_valid: Some(true),
        }
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::LocallyBootstrapped < Stage::EdgeKeyDeployed);
        assert_eq!(Stage::TlsIssued.next(), Some(Stage::Complete));
        assert_eq!(Stage::Complete.next(), None);
    }

    #[test]
    fn test_derive_from_facts() {
        assert_eq!(facts().derive(), Stage::Complete);

        let mut f = facts();
        f.certificate_valid = Some(false);
        assert_eq!(f.derive(), Stage::DnsConfirmed);

        let mut f = facts();
        f.domain = None;
        f.dns_converged = None;
        assert_eq!(f.derive(), Stage::EdgeVerified);

        let mut f = facts();
        f.edge = EdgeConfig::Unconfigured;
        f.edge_key_auth = None;
        assert_eq!(f.derive(), Stage::LocallyBootstrapped);

        let mut f = facts();
        f.missing_dependencies = vec!["rsync".to_string()];
        assert_eq!(f.derive(), Stage::NotStarted);
    }

    #[test]
    fn test_exit_codes_follow_failed_stage() {
        let err = ProvisionError::Connectivity {
            host: "203.0.113.9".to_string(),
            message: "timed out".to_string(),
        };
        assert_eq!(FailureReason::new(Stage::EdgeVerified, &err).exit_code(), exit::DEGRADED);
        assert_eq!(FailureReason::new(Stage::TlsIssued, &err).exit_code(), exit::TLS);
        assert_eq!(
            FailureReason::new(Stage::DependenciesInstalled, &ProvisionError::validation("x"))
                .exit_code(),
            exit::VALIDATION
        );
    }
}
