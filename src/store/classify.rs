// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edge-host configuration detection
//!
//! The explicit `VPS_ENABLED` flag is authoritative. Only when it is absent do
//! we fall back to looking for a routable IPv4 literal among the values.

use std::net::Ipv4Addr;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::schema::{is_placeholder, parse_flag, HOST, PRIMARY_IP, VPS_ENABLED, VPS_HOST};
use super::ConfigDocument;

/// What the configuration document says about the edge host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum EdgeConfig {
    /// No edge host; single-host mode
    Unconfigured,
    /// Edge host at this address (IP literal or hostname)
    Configured { address: String },
    /// Flag and address disagree or cannot be read
    Ambiguous { reason: String },
}

impl EdgeConfig {
    pub fn address(&self) -> Option<&str> {
        match self {
            EdgeConfig::Configured { address } => Some(address),
            _ => None,
        }
    }
}

fn ipv4_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("static IPv4 pattern is valid")
    })
}

/// Classify the edge configuration. Pure: looks only at `doc`.
pub fn classify_edge_config(doc: &ConfigDocument) -> EdgeConfig {
    if let Some(flag) = doc.get(VPS_ENABLED) {
        return match parse_flag(flag) {
            Some(true) => match doc.get(VPS_HOST).map(str::trim) {
                Some(host) if !is_placeholder(host) && is_valid_address(host) => {
                    EdgeConfig::Configured {
                        address: host.to_string(),
                    }
                }
                Some(host) if !is_placeholder(host) => EdgeConfig::Ambiguous {
                    reason: format!("{} is enabled but {}='{}' is not an address", VPS_ENABLED, VPS_HOST, host),
                },
                _ => EdgeConfig::Ambiguous {
                    reason: format!("{} is enabled but {} is not set", VPS_ENABLED, VPS_HOST),
                },
            },
            Some(false) => EdgeConfig::Unconfigured,
            None => EdgeConfig::Ambiguous {
                reason: format!("{}='{}' is not a boolean", VPS_ENABLED, flag),
            },
        };
    }

    let own: Vec<Ipv4Addr> = [HOST, PRIMARY_IP]
        .iter()
        .filter_map(|key| doc.get(key))
        .filter_map(|value| value.trim().parse().ok())
        .collect();

    doc.entries()
        .flat_map(|(_, value)| ipv4_pattern().find_iter(value))
        .filter_map(|m| m.as_str().parse::<Ipv4Addr>().ok())
        .find(|ip| is_edge_candidate(ip) && !own.contains(ip))
        .map(|ip| EdgeConfig::Configured {
            address: ip.to_string(),
        })
        .unwrap_or(EdgeConfig::Unconfigured)
}

/// Whether an IPv4 literal could be a public edge host
pub fn is_edge_candidate(ip: &Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast())
}

/// IP literal or a plausible DNS hostname
pub fn is_valid_address(value: &str) -> bool {
    if value.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    // Dotted quads that failed to parse are typos, not hostnames
    if value.split('.').all(|part| part.chars().all(|c| c.is_ascii_digit())) {
        return false;
    }
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
