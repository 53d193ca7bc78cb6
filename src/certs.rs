// SPDX-License-Identifier: AGPL-3.0-or-later
//! TLS certificate acquisition on the edge host
//!
//! Issuance is gated on DNS convergence and skipped when a certificate that
//! outlives the renewal window is already installed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::connector::{HostConnector, HostProfile};
use crate::dns::DnsOutcome;
use crate::error::{ProvisionError, Result};
use crate::process::shell_quote;
use crate::retry::{retry, Attempt};

/// Where certificates live and how new ones are requested
#[async_trait]
pub trait CertificateBackend: Send + Sync {
    /// A certificate for `domain` exists and is valid for at least
    /// `renew_before_days` more days
    async fn existing_valid(
        &self,
        host: &HostProfile,
        domain: &str,
        renew_before_days: u32,
    ) -> Result<bool>;

    /// Ask the certificate authority for a new certificate
    async fn request(&self, host: &HostProfile, domain: &str, email: &str) -> Result<()>;
}

/// certbot with the nginx plugin, run on the edge host
pub struct CertbotBackend {
    connector: Arc<dyn HostConnector>,
    timeout: Duration,
}

impl CertbotBackend {
    pub fn new(connector: Arc<dyn HostConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }
}

/// Live certificate path used by certbot
pub fn live_certificate_path(domain: &str) -> String {
    format!("/etc/letsencrypt/live/{}/fullchain.pem", domain)
}

const RATE_LIMIT_MARKERS: [&str; 3] = [
    "too many certificates",
    "ratelimited",
    "too many failed authorizations",
];

/// Whether certbot output reports a CA rate limit
pub fn is_rate_limited(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

#[async_trait]
impl CertificateBackend for CertbotBackend {
    async fn existing_valid(
        &self,
        host: &HostProfile,
        domain: &str,
        renew_before_days: u32,
    ) -> Result<bool> {
        let path = shell_quote(&live_certificate_path(domain));
        let seconds = u64::from(renew_before_days) * 86_400;
        let command = format!(
            "test -f {path} || exit 2; openssl x509 -checkend {seconds} -noout -in {path}"
        );
        let output = self
            .connector
            .run_remote(host, &command, self.timeout)
            .await?;
        match output.exit_code {
            Some(0) => Ok(true),
            // 1: expires inside the window, 2: no certificate
            Some(1) | Some(2) => Ok(false),
            status => Err(ProvisionError::CommandFailed {
                command,
                status,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    async fn request(&self, host: &HostProfile, domain: &str, email: &str) -> Result<()> {
        let command = format!(
            "certbot --nginx -d {} -m {} --agree-tos --non-interactive --redirect",
            shell_quote(domain),
            shell_quote(email)
        );
        let output = self
            .connector
            .run_remote(host, &command, self.timeout)
            .await?;
        if output.success() {
            return Ok(());
        }
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        if is_rate_limited(&combined) {
            return Err(ProvisionError::RateLimited {
                message: last_line(&combined),
            });
        }
        Err(ProvisionError::CommandFailed {
            command: format!("certbot --nginx -d {}", domain),
            status: output.exit_code,
            stderr: last_line(&combined),
        })
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Result of [`CertificateIssuer::issue`]
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum IssueOutcome {
    Issued {
        /// An existing certificate was kept; the CA was not contacted
        reused: bool,
        attempts: u32,
    },
    Failed {
        #[serde(serialize_with = "serialize_error")]
        last_error: ProvisionError,
        attempts: u32,
    },
}

fn serialize_error<S: serde::Serializer>(
    error: &ProvisionError,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&error.to_string())
}

pub struct CertificateIssuer {
    backend: Arc<dyn CertificateBackend>,
    renew_before_days: u32,
}

impl CertificateIssuer {
    pub fn new(backend: Arc<dyn CertificateBackend>, renew_before_days: u32) -> Self {
        Self {
            backend,
            renew_before_days,
        }
    }

    /// Obtain a certificate for `domain`.
    ///
    /// Returns `Err(Precondition)` when DNS has not converged. Rate limits end
    /// the loop at once and come back as `Failed`.
    pub async fn issue(
        &self,
        host: &HostProfile,
        domain: &str,
        email: &str,
        dns: &DnsOutcome,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<IssueOutcome> {
        if let DnsOutcome::TimedOut { remediation, .. } = dns {
            return Err(ProvisionError::Precondition {
                message: format!("DNS for {} has not converged to the edge host", domain),
                remediation: remediation.clone(),
            });
        }

        if self
            .backend
            .existing_valid(host, domain, self.renew_before_days)
            .await?
        {
            info!(domain = %domain, "Valid certificate already installed, skipping request");
            return Ok(IssueOutcome::Issued {
                reused: true,
                attempts: 0,
            });
        }

        let backend = &self.backend;
        let result = retry(max_attempts, backoff, |attempt| async move {
            info!(domain = %domain, attempt = attempt, "Requesting certificate");
            match backend.request(host, domain, email).await {
                Ok(()) => Ok(()),
                Err(e @ ProvisionError::RateLimited { .. }) => Err(Attempt::Abort(e)),
                Err(e) => {
                    warn!(domain = %domain, attempt = attempt, error = %e, "Certificate request failed");
                    Err(Attempt::Retry(e))
                }
            }
        })
        .await;

        match result {
            Ok(((), attempts)) => {
                info!(domain = %domain, attempts = attempts, "Certificate issued");
                Ok(IssueOutcome::Issued {
                    reused: false,
                    attempts,
                })
            }
            Err(failure) => Ok(IssueOutcome::Failed {
                last_error: failure.last,
                attempts: failure.attempts,
            }),
        }
    }
}
