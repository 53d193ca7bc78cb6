// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edge bootstrap decision
//!
//! [`decide`] maps the configuration classification and a reachability probe
//! to the one action this run should take. It is a pure function; the probe
//! itself lives in [`probe_reachability`] so tests can stub it.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::connector::{AuthMethod, ConnectivityResult, HostConnector, HostProfile};
use crate::error::Result;
use crate::retry::{retry, Attempt};
use crate::store::EdgeConfig;

/// What a live probe of the edge host found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reachability {
    /// Key authentication works
    KeyAuth,
    /// Key authentication fails but the supplied password is accepted
    PasswordOnly,
    /// The host never answered within the connect budget
    Offline,
    /// Neither credential is accepted
    Unreachable {
        /// A password was supplied for this run (and was also rejected)
        password_supplied: bool,
    },
}

/// Action selected for the edge host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum BootstrapAction {
    /// No edge host configured; run single-host
    SkipEdge,
    /// Key auth already works; nothing to change
    ReportHealthy,
    /// Install the public key over the password session, then re-probe
    DeployKey,
    /// Both probes failed but a password was supplied: try one bootstrap
    AttemptBootstrap,
    /// Operator must intervene; continue degraded
    ManualRemediation { instructions: String },
}

/// Pure decision table
pub fn decide(config: &EdgeConfig, reachability: Option<Reachability>) -> BootstrapAction {
    match config {
        EdgeConfig::Unconfigured => BootstrapAction::SkipEdge,
        EdgeConfig::Ambiguous { reason } => BootstrapAction::ManualRemediation {
            instructions: format!(
                "{}. Set VPS_ENABLED=true and VPS_HOST=<edge address> (or VPS_ENABLED=false) in the environment file, or export VPS_IP for the next run.",
                reason
            ),
        },
        EdgeConfig::Configured { address } => match reachability {
            Some(Reachability::KeyAuth) => BootstrapAction::ReportHealthy,
            Some(Reachability::PasswordOnly) => BootstrapAction::DeployKey,
            Some(Reachability::Offline) => BootstrapAction::ManualRemediation {
                instructions: offline_instructions(address),
            },
            Some(Reachability::Unreachable {
                password_supplied: true,
            }) => BootstrapAction::AttemptBootstrap,
            Some(Reachability::Unreachable {
                password_supplied: false,
            })
            | None => BootstrapAction::ManualRemediation {
                instructions: manual_key_instructions(address),
            },
        },
    }
}

/// Remediation text for an edge host we cannot log into
pub fn manual_key_instructions(address: &str) -> String {
    format!(
        "Edge host {address} does not accept the provisioning key. Install it with \
         `ssh-copy-id -i <key>.pub <user>@{address}`, or re-run with VPS_PASSWORD set."
    )
}

/// Remediation text for an edge host that does not answer at all
pub fn offline_instructions(address: &str) -> String {
    format!(
        "Edge host {address} did not answer on SSH. Check that it is running, that the \
         SSH port is open in its firewall, and that VPS_HOST is correct, then re-run."
    )
}

/// Probe key auth, then password auth when a password is available
///
/// Key probes that fail before authentication (timeout, refused, unreachable)
/// are retried up to `attempts` times, `interval` apart. The returned probes
/// end with the last one made.
pub async fn probe_reachability(
    connector: &dyn HostConnector,
    host: &HostProfile,
    password_supplied: bool,
    timeout: Duration,
    attempts: u32,
    interval: Duration,
) -> Result<(Reachability, Vec<ConnectivityResult>)> {
    let mut probes = Vec::new();

    let key = probe_key(connector, host, timeout, attempts, interval).await?;
    let key_ok = key.succeeded;
    let offline = key.is_network_failure();
    probes.push(key);
    if key_ok {
        return Ok((Reachability::KeyAuth, probes));
    }
    if offline {
        info!(host = %host.address, "Edge host did not answer");
        return Ok((Reachability::Offline, probes));
    }

    if !password_supplied {
        return Ok((
            Reachability::Unreachable {
                password_supplied: false,
            },
            probes,
        ));
    }

    let password = connector
        .test_connectivity(host, AuthMethod::Password, timeout)
        .await?;
    let password_ok = password.succeeded;
    probes.push(password);

    let reachability = if password_ok {
        Reachability::PasswordOnly
    } else {
        Reachability::Unreachable {
            password_supplied: true,
        }
    };
    info!(host = %host.address, reachability = ?reachability, "Edge host probed");
    Ok((reachability, probes))
}

async fn probe_key(
    connector: &dyn HostConnector,
    host: &HostProfile,
    timeout: Duration,
    attempts: u32,
    interval: Duration,
) -> Result<ConnectivityResult> {
    let outcome = retry(attempts, interval, |attempt| async move {
        let probe = match connector.test_connectivity(host, AuthMethod::Key, timeout).await {
            Ok(probe) => probe,
            Err(e) => return Err(Attempt::Abort(Err(e))),
        };
        if probe.succeeded {
            Ok(probe)
        } else if probe.is_network_failure() {
            debug!(
                attempt = attempt,
                host = %host.address,
                failure = ?probe.failure_kind,
                "Edge host not reachable yet"
            );
            Err(Attempt::Retry(Ok(probe)))
        } else {
            Err(Attempt::Abort(Ok(probe)))
        }
    })
    .await;

    match outcome {
        Ok((probe, _)) => Ok(probe),
        Err(failure) => failure.last,
    }
}
