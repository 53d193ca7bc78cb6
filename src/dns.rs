// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS convergence polling
//!
//! Queries go to a fixed external resolver, never the local one, so a stale
//! local cache cannot report convergence early.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::process::{self, CommandSpec};
use crate::retry::{retry, Attempt};

/// Looks up the A records of a domain
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Raw answer lines (addresses, possibly CNAME targets)
    async fn resolve(&self, domain: &str) -> Result<Vec<String>>;

    /// Resolver identity for logs and remediation text
    fn server(&self) -> &str;
}

/// Resolver that runs `dig +short @server`
#[derive(Debug, Clone)]
pub struct DigResolver {
    server: String,
    timeout: Duration,
}

impl DigResolver {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Resolver for DigResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<String>> {
        let spec = CommandSpec::new("dig")
            .arg("+short")
            .arg("+time=3")
            .arg("+tries=1")
            .arg(format!("@{}", self.server))
            .arg(domain)
            .arg("A");
        let output = process::run_checked(&spec, self.timeout).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::to_string)
            .filter(|l| !l.trim().is_empty() && !l.starts_with(';'))
            .collect())
    }

    fn server(&self) -> &str {
        &self.server
    }
}

/// One poll, kept for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct DnsCheckAttempt {
    pub attempt_number: u32,
    /// Normalized answer, `None` when the query failed or was empty
    pub resolved_address: Option<String>,
    pub expected_address: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of waiting for propagation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum DnsOutcome {
    Converged {
        attempts: Vec<DnsCheckAttempt>,
    },
    TimedOut {
        attempts: Vec<DnsCheckAttempt>,
        /// Command the operator can run to check by hand
        remediation: String,
    },
}

impl DnsOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, DnsOutcome::Converged { .. })
    }

    pub fn attempts(&self) -> &[DnsCheckAttempt] {
        match self {
            DnsOutcome::Converged { attempts } | DnsOutcome::TimedOut { attempts, .. } => attempts,
        }
    }
}

/// Trim, drop the trailing root dot, lowercase
pub fn normalize(answer: &str) -> String {
    answer.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether an answer set means the domain points at `expected`.
///
/// For an IP target every address record must match (a leftover old record
/// would still split traffic). For a hostname target the CNAME chain must
/// contain it.
pub fn answers_match(answers: &[String], expected: &str) -> bool {
    let expected = normalize(expected);
    let normalized: Vec<String> = answers.iter().map(|a| normalize(a)).collect();

    if expected.parse::<std::net::IpAddr>().is_ok() {
        let addresses: Vec<&String> = normalized
            .iter()
            .filter(|a| a.parse::<std::net::IpAddr>().is_ok())
            .collect();
        !addresses.is_empty() && addresses.iter().all(|a| **a == expected)
    } else {
        normalized.iter().any(|a| *a == expected)
    }
}

/// Polls a resolver until a domain converges
pub struct DnsWaiter {
    resolver: Arc<dyn Resolver>,
}

impl DnsWaiter {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    /// Command line an operator can use to reproduce the check
    pub fn remediation(&self, domain: &str) -> String {
        format!("dig +short @{} {} A", self.resolver.server(), domain)
    }

    /// Query up to `max_attempts` times, `interval` apart
    pub async fn await_propagation(
        &self,
        domain: &str,
        expected_address: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<DnsOutcome> {
        if domain.trim().is_empty() || !crate::store::is_valid_address(domain.trim()) {
            return Err(ProvisionError::validation(format!(
                "'{}' is not a valid domain name",
                domain
            )));
        }

        let log: Mutex<Vec<DnsCheckAttempt>> = Mutex::new(Vec::new());
        let resolver = &self.resolver;
        let log_ref = &log;

        info!(
            domain = %domain,
            expected = %expected_address,
            resolver = %resolver.server(),
            max_attempts = max_attempts,
            "Waiting for DNS convergence"
        );

        let result = retry(max_attempts, interval, |attempt_number| async move {
            let answers = match resolver.resolve(domain).await {
                Ok(answers) => answers,
                Err(e) => {
                    debug!(attempt = attempt_number, error = %e, "DNS query failed");
                    Vec::new()
                }
            };
            let converged = answers_match(&answers, expected_address);
            let record = DnsCheckAttempt {
                attempt_number,
                resolved_address: answers.last().map(|a| normalize(a)),
                expected_address: expected_address.to_string(),
                timestamp: Utc::now(),
            };
            debug!(
                attempt = attempt_number,
                resolved = ?record.resolved_address,
                converged = converged,
                "DNS check"
            );
            if let Ok(mut log) = log_ref.lock() {
                log.push(record);
            }
            if converged {
                Ok(())
            } else {
                Err(Attempt::Retry(()))
            }
        })
        .await;

        let attempts = log.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());

        match result {
            Ok((_, count)) => {
                info!(domain = %domain, attempts = count, "DNS converged");
                Ok(DnsOutcome::Converged { attempts })
            }
            Err(failure) => {
                warn!(domain = %domain, attempts = failure.attempts, "DNS did not converge");
                Ok(DnsOutcome::TimedOut {
                    attempts,
                    remediation: self.remediation(domain),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Returns a wrong address until `match_from`, then the right one
    struct ScriptedResolver {
        calls: AtomicU32,
        match_from: u32,
    }

    #[async_trait]
    impl Resolver for ScriptedResolver {
        async fn resolve(&self, _domain: &str) -> Result<Vec<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.match_from {
                Ok(vec!["203.0.113.9\n".to_string()])
            } else {
                Ok(vec!["198.51.100.1".to_string()])
            }
        }

        fn server(&self) -> &str {
            "1.1.1.1"
        }
    }

    fn waiter(match_from: u32) -> (DnsWaiter, Arc<ScriptedResolver>) {
        let resolver = Arc::new(ScriptedResolver {
            calls: AtomicU32::new(0),
            match_from,
        });
        (DnsWaiter::new(resolver.clone()), resolver)
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_third_attempt() {
        let (waiter, resolver) = waiter(3);
        let interval = Duration::from_secs(15);
        let start = Instant::now();

        let outcome = waiter
            .await_propagation("cam.example.org", "203.0.113.9", 10, interval)
            .await
            .unwrap();

        assert!(outcome.is_converged());
        assert_eq!(outcome.attempts().len(), 3);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), interval * 2);
        assert_eq!(outcome.attempts()[2].resolved_address.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_remediation() {
        let (waiter, _) = waiter(u32::MAX);
        let outcome = waiter
            .await_propagation("cam.example.org", "203.0.113.9", 4, Duration::from_secs(1))
            .await
            .unwrap();

        match outcome {
            DnsOutcome::TimedOut { attempts, remediation } => {
                assert_eq!(attempts.len(), 4);
                assert_eq!(remediation, "dig +short @1.1.1.1 cam.example.org A");
            }
            other => panic!("Expected TimedOut, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_domain() {
        let (waiter, _) = waiter(1);
        assert!(waiter
            .await_propagation("not a domain", "203.0.113.9", 1, Duration::from_secs(1))
            .await
            .is_err());
    }

    #[test]
    fn test_answers_match() {
        let a = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(answers_match(&a(&[" 203.0.113.9 "]), "203.0.113.9"));
        assert!(answers_match(&a(&["edge.example.org.", "203.0.113.9"]), "203.0.113.9"));
        assert!(!answers_match(&a(&["203.0.113.9", "198.51.100.1"]), "203.0.113.9"));
        assert!(!answers_match(&a(&[]), "203.0.113.9"));
        assert!(answers_match(&a(&["Edge.Example.ORG.", "203.0.113.9"]), "edge.example.org"));
    }
}
