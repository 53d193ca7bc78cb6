// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator settings (`provision.toml`)
//!
//! These are the tool's own knobs: where files live, how long to wait and how
//! often to retry. The service's `KEY=VALUE` environment file is handled by
//! [`crate::store`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProvisionError, Result};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// File locations
    #[serde(default)]
    pub paths: PathSettings,

    /// Application repository
    #[serde(default)]
    pub repository: RepositorySettings,

    /// Primary-host service management
    #[serde(default)]
    pub service: ServiceSettings,

    /// SSH and rsync timeouts
    #[serde(default)]
    pub ssh: SshSettings,

    /// DNS convergence polling
    #[serde(default)]
    pub dns: DnsSettings,

    /// Certificate issuance
    #[serde(default)]
    pub tls: TlsSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// The service's KEY=VALUE environment file
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,

    /// Private key used for the edge host; the public key sits next to it
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Where the application checkout lives
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Run lock file
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
}

/// Application repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySettings {
    /// Clone URL; when empty the install dir must already hold a checkout
    #[serde(default)]
    pub url: String,

    /// Branch to check out
    #[serde(default = "default_branch")]
    pub branch: String,
}

/// Primary-host service management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// systemd unit name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Local health probes after a restart
    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,

    /// Seconds between local health probes
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Per-request health timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
}

/// SSH and rsync timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Connection probe timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key probes made while the edge host is unreachable
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Seconds between unreachable key probes
    #[serde(default = "default_connect_retry")]
    pub connect_retry_secs: u64,

    /// One-shot remote command timeout in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// rsync timeout in seconds
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
}

/// DNS convergence polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    /// External resolver queried directly, bypassing the OS resolver
    #[serde(default = "default_resolver")]
    pub resolver: String,

    /// Maximum number of queries
    #[serde(default = "default_dns_attempts")]
    pub max_attempts: u32,

    /// Seconds between queries
    #[serde(default = "default_dns_interval")]
    pub interval_secs: u64,
}

/// Certificate issuance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Maximum issuance attempts per run
    #[serde(default = "default_tls_attempts")]
    pub max_attempts: u32,

    /// Seconds between issuance attempts
    #[serde(default = "default_tls_backoff")]
    pub backoff_secs: u64,

    /// A certificate expiring within this many days is reissued
    #[serde(default = "default_renew_days")]
    pub renew_before_days: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            env_file: default_env_file(),
            key_path: default_key_path(),
            install_dir: default_install_dir(),
            lock_file: default_lock_file(),
        }
    }
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            branch: default_branch(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            health_attempts: default_health_attempts(),
            health_interval_secs: default_health_interval(),
            health_timeout_secs: default_health_timeout(),
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            connect_retry_secs: default_connect_retry(),
            command_timeout_secs: default_command_timeout(),
            sync_timeout_secs: default_sync_timeout(),
        }
    }
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            resolver: default_resolver(),
            max_attempts: default_dns_attempts(),
            interval_secs: default_dns_interval(),
        }
    }
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_tls_attempts(),
            backoff_secs: default_tls_backoff(),
            renew_before_days: default_renew_days(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults when the file
    /// does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&contents)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(ProvisionError::InvalidSettings {
                message: "service.name cannot be empty".to_string(),
            });
        }

        if self.dns.resolver.parse::<std::net::IpAddr>().is_err() {
            return Err(ProvisionError::InvalidSettings {
                message: format!(
                    "dns.resolver must be an IP address, got '{}'",
                    self.dns.resolver
                ),
            });
        }

        if self.dns.max_attempts == 0 || self.tls.max_attempts == 0 || self.ssh.connect_attempts == 0 {
            return Err(ProvisionError::InvalidSettings {
                message: "retry budgets must allow at least one attempt".to_string(),
            });
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ProvisionError::InvalidSettings {
                message: format!("logging.format must be text or json, got '{}'", self.logging.format),
            });
        }

        Ok(())
    }

    /// Public key path derived from the private key path
    pub fn public_key_path(&self) -> PathBuf {
        crate::keys::public_key_path(&self.paths.key_path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.connect_timeout_secs)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_secs(self.ssh.connect_retry_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.command_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.sync_timeout_secs)
    }
}

/// Commented default written by `init`
pub const DEFAULT_SETTINGS_TOML: &str = r#"# SPDX-License-Identifier: AGPL-3.0-or-later
# imgserv-provision settings

[paths]
env_file = "/etc/imgserv/.env"
key_path = "/root/.ssh/imgserv_edge_ed25519"
install_dir = "/opt/imgserv"
lock_file = "/run/imgserv-provision.lock"

[repository]
# url = "https://example.org/imgserv.git"
branch = "main"

[service]
name = "imgserv"
health_attempts = 10
health_interval_secs = 3
health_timeout_secs = 5

[ssh]
connect_timeout_secs = 10
connect_attempts = 3
connect_retry_secs = 5
command_timeout_secs = 60
sync_timeout_secs = 300

[dns]
resolver = "1.1.1.1"
max_attempts = 30
interval_secs = 20

[tls]
max_attempts = 3
backoff_secs = 60
renew_before_days = 30

[logging]
level = "info"
format = "text"
"#;

// Default value functions

fn default_env_file() -> PathBuf {
    PathBuf::from("/etc/imgserv/.env")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/root/.ssh/imgserv_edge_ed25519")
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("/opt/imgserv")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/run/imgserv-provision.lock")
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_service_name() -> String {
    "imgserv".to_string()
}

fn default_health_attempts() -> u32 {
    10
}

fn default_health_interval() -> u64 {
    3
}

fn default_health_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_retry() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    60
}

fn default_sync_timeout() -> u64 {
    300
}

fn default_resolver() -> String {
    "1.1.1.1".to_string()
}

fn default_dns_attempts() -> u32 {
    30
}

fn default_dns_interval() -> u64 {
    20
}

fn default_tls_attempts() -> u32 {
    3
}

fn default_tls_backoff() -> u64 {
    60
}

fn default_renew_days() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
